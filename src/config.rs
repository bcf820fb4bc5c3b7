use serde::Deserialize;

/// Settings shared by every schedule on the same store.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Namespace for every key this crate writes.
    pub key_prefix: String,
    /// Cap on optimistic transaction attempts for enqueue and targeted removal.
    /// `None` retries until the commit goes through.
    pub max_attempts: Option<u32>,
    /// Run a compaction pass after a dequeue that leaves jobs behind.
    pub compact_on_dequeue: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            key_prefix: "adc".to_string(),
            max_attempts: None,
            compact_on_dequeue: true,
        }
    }
}

impl ScheduleConfig {
    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = key_prefix.into();
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_compact_on_dequeue(mut self, compact_on_dequeue: bool) -> Self {
        self.compact_on_dequeue = compact_on_dequeue;
        self
    }

    pub(crate) fn attempts_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(false, |max| attempts >= max)
    }
}
