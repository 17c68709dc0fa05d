//! Impls - ports の具体実装とイベントバス

pub mod event_bus;
pub mod json_store;
pub mod memory_store;

pub use self::event_bus::{EventBus, SubscriptionId};
pub use self::json_store::JsonFileStore;
pub use self::memory_store::InMemoryStore;
