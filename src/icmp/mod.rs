pub mod packet;
pub mod socket;

pub use packet::*;
pub use socket::*;

/// Terminal result of a single `ping` call.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Pong { sequence: u16, elapsed_ms: f64 },
    Timeout { sequence: u16 },
    Error(String),
}

impl Outcome {
    pub fn is_pong(&self) -> bool {
        matches!(self, Outcome::Pong { .. })
    }
}

impl From<EngineError> for Outcome {
    fn from(err: EngineError) -> Self {
        Outcome::Error(err.to_string())
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Pong { sequence, elapsed_ms } => {
                write!(f, "Pong seq={} time={:.3}ms", sequence, elapsed_ms)
            }
            Outcome::Timeout { sequence } => write!(f, "Timeout seq={}", sequence),
            Outcome::Error(message) => write!(f, "Error: {}", message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    ResolutionFailure(String),
    SocketUnavailable,
    SendFailure,
    InvalidTimeout,
    IdentifiersExhausted,
    EngineStopped,
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::ResolutionFailure(host) => write!(f, "Invalid hostname: {}", host),
            EngineError::SocketUnavailable => write!(f, "Socket not available"),
            EngineError::SendFailure => write!(f, "Failed to send ping"),
            EngineError::InvalidTimeout => write!(f, "Timeout must be positive"),
            EngineError::IdentifiersExhausted => write!(f, "No identifier available"),
            EngineError::EngineStopped => write!(f, "Engine stopped"),
        }
    }
}

impl std::error::Error for EngineError {}
