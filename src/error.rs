use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    ServerClosed,
    ReadError(String),
    ConnectFailed(String),
    UserRequested,
}

#[derive(Debug)]
pub enum TetherError {
    Connection(String),
    Tls(String),
    Io(std::io::Error),
    Auth(String),
    Configuration(String),
    InvalidMessage(String),
    QueueFull,
    QueueClosed,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ServerClosed => write!(f, "Connection closed by server"),
            DisconnectReason::ReadError(msg) => write!(f, "Read error: {}", msg),
            DisconnectReason::ConnectFailed(msg) => write!(f, "Connect failed: {}", msg),
            DisconnectReason::UserRequested => write!(f, "User requested"),
        }
    }
}

impl fmt::Display for TetherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TetherError::Connection(msg) => write!(f, "Connection error: {}", msg),
            TetherError::Tls(msg) => write!(f, "TLS error: {}", msg),
            TetherError::Io(err) => write!(f, "IO error: {}", err),
            TetherError::Auth(msg) => write!(f, "Authentication error: {}", msg),
            TetherError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            TetherError::InvalidMessage(msg) => write!(f, "Invalid message: {}", msg),
            TetherError::QueueFull => write!(f, "Outbound queue is full"),
            TetherError::QueueClosed => write!(f, "Outbound queue is closed"),
        }
    }
}

impl std::error::Error for TetherError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TetherError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TetherError {
    fn from(err: std::io::Error) -> Self {
        TetherError::Io(err)
    }
}

pub type Result<T> = std::result::Result<T, TetherError>;
