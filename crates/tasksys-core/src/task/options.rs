use std::time::Duration;

use crate::domain::UniqueType;
use crate::domain::record::{DEFAULT_RETRY_DELAY_MS, MIN_RETRY_DELAY_MS};

/// Construction-time settings of a task.
///
/// # 使用例
/// ```ignore
/// let task = TaskHandle::with_options(
///     FetchTask { url },
///     TaskOptions::named("fetch")
///         .max_retries(3)
///         .retry_delay(Duration::from_secs(2))
///         .tag("NetworkTask")
///         .persistent(true),
/// );
/// ```
#[derive(Debug, Clone)]
pub struct TaskOptions {
    pub(crate) name: Option<String>,
    pub(crate) description: String,
    pub(crate) is_persistent: bool,
    pub(crate) max_retries: u32,
    pub(crate) retry_delay: Duration,
    pub(crate) fail_silently: bool,
    pub(crate) tags: Vec<String>,
    pub(crate) unique_type: UniqueType,
    pub(crate) unique_via: Option<String>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            name: None,
            description: String::new(),
            is_persistent: false,
            max_retries: 0,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            fail_silently: true,
            tags: Vec::new(),
            unique_type: UniqueType::None,
            unique_via: None,
        }
    }
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::default().name(name)
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn persistent(mut self, is_persistent: bool) -> Self {
        self.is_persistent = is_persistent;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Clamped to at least 10ms.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay.max(Duration::from_millis(MIN_RETRY_DELAY_MS));
        self
    }

    pub fn fail_silently(mut self, fail_silently: bool) -> Self {
        self.fail_silently = fail_silently;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn unique(mut self, unique_type: UniqueType) -> Self {
        self.unique_type = unique_type;
        self
    }

    /// Override the uniqueness key (defaults to the task type name).
    pub fn unique_via(mut self, key: impl Into<String>) -> Self {
        self.unique_via = Some(key.into());
        self
    }
}
