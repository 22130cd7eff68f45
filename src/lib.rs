pub mod auth;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logger;
pub mod membership;
pub mod message;
pub mod nick;
pub mod queue;
pub mod reader;
pub mod subscriber;
pub mod supervisor;
pub mod transport;

pub use auth::{AuthMethod, AuthState};
pub use client::{Client, ClientBuilder};
pub use config::Config;
pub use error::{DisconnectReason, Result, TetherError};
pub use message::{Command, InboundMessage};
pub use subscriber::EventSubscriber;
pub use supervisor::SupervisorState;
pub use transport::{Connector, TcpConnector, Transport};
