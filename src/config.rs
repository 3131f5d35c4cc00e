/// Engine construction settings. There is no config file; the binary fills
/// this in from command line arguments.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Name of the worker thread that owns the socket.
    pub thread_name: String,
    /// Size of the buffer each inbound datagram is read into.
    pub recv_buffer_size: usize,
    /// IPv4 TTL for outgoing requests; the OS default when `None`.
    pub ttl: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            thread_name: "echo-engine".to_string(),
            recv_buffer_size: 2048,
            ttl: None,
        }
    }
}

impl EngineConfig {
    pub fn with_ttl(mut self, ttl: Option<u32>) -> Self {
        self.ttl = ttl;
        self
    }
}
