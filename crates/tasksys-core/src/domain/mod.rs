//! Domain model (IDs, status machine, policies, records, events, errors).

pub mod errors;
pub mod events;
pub mod ids;
pub mod policy;
pub mod record;
pub mod status;

pub use errors::{FailureDetail, TaskFailure, TaskSystemError};
pub use events::{ErrorInfo, EventKind, TaskEvent};
pub use ids::{JobId, TaskId};
pub use policy::{ChainRetryBehavior, UniqueType};
pub use record::SerializedTask;
pub use status::TaskStatus;
