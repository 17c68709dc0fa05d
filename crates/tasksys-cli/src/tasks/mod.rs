//! Demo task types.

mod adb;
mod chain_demo;
mod simple;

pub use self::adb::AdbCommandTask;
pub use self::chain_demo::{
    ConsistentlyFailingTask, DataGeneratorTask, DataProcessorTask, FlakyTask, demo_chain, retry_demo_chain,
};
pub use self::simple::SimpleDemoTask;

use tasksys_core::Task;
use tasksys_core::TaskSystemBuilder;
use tasksys_core::typed::RegistryError;

pub const TASK_TYPES: &[&str] = &[
    SimpleDemoTask::TYPE,
    DataGeneratorTask::TYPE,
    DataProcessorTask::TYPE,
    FlakyTask::TYPE,
    ConsistentlyFailingTask::TYPE,
    AdbCommandTask::TYPE,
];

pub fn register_all(builder: TaskSystemBuilder) -> Result<TaskSystemBuilder, RegistryError> {
    builder
        .register::<SimpleDemoTask>()?
        .register::<DataGeneratorTask>()?
        .register::<DataProcessorTask>()?
        .register::<FlakyTask>()?
        .register::<ConsistentlyFailingTask>()?
        .register::<AdbCommandTask>()
}
