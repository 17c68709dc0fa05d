//! Chain - 線形チェーンと共有コンテキスト

pub mod context;
pub mod task_chain;

pub use self::context::{ChainContext, ChainContextSnapshot};
pub(crate) use self::task_chain::restore_chain;
pub use self::task_chain::{ChainPolicy, TaskChain};
