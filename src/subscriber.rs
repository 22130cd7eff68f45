use crate::auth::AuthMethod;
use crate::client::Client;
use crate::message::InboundMessage;
use async_trait::async_trait;

/// Inbound event surface. Every method has a no-op default so a subscriber
/// only implements what it cares about.
///
/// Callbacks run on the connection's reader task, in line order. A slow
/// callback delays processing of the next line.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// A transport was opened and registration has been sent.
    async fn on_connected(&self, _client: &Client) {}

    async fn on_message(&self, _client: &Client, _message: &InboundMessage) {}

    /// Fires at most once per connection.
    async fn on_authenticated(&self, _client: &Client, _method: AuthMethod) {}

    async fn on_auth_failed(&self, _client: &Client, _reason: &str) {}

    async fn on_pong(&self, _client: &Client, _id: &str) {}
}
