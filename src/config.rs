use std::time::Duration;

/// Socket and default operation settings for a [`Connection`](crate::client::Connection).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub connect_timeout: Duration,
    pub nodelay: bool,
    /// Capacity of the dispatcher's read buffer.
    pub read_buffer_size: usize,
    /// Timeout used by callers that don't pick their own.
    pub operation_timeout: Duration,
    /// Default search batch size; 0 waits for the whole result.
    pub batch_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            nodelay: true,
            read_buffer_size: 64 * 1024,
            operation_timeout: Duration::from_secs(30),
            batch_size: 100,
        }
    }
}

impl ConnectionConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}
