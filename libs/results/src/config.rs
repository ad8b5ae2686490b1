use std::time::Duration;

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Storage settings handed to every invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// SQLite database path, or `:memory:`.
    pub connection_string: String,
    /// Create `outbound_send_queue` when it does not exist. Meant for dev databases.
    pub ensure_schema: bool,
    pub busy_timeout: Duration,
}

impl StorageConfig {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            ensure_schema: false,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    pub fn with_ensure_schema(mut self, ensure_schema: bool) -> Self {
        self.ensure_schema = ensure_schema;
        self
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }
}
