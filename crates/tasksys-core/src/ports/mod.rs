//! Ports - 外部コラボレーターへのインターフェース
//!
//! タスクシステムは永続化ストアと時刻を trait 越しに扱います。
//! 実装は [`crate::impls`] にあります。

pub mod clock;
pub mod store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::store::{KvStore, StoreError};
