use crate::auth::{AuthAction, AuthEvent, AuthMachine, AuthPlan, AuthState};
use crate::config::Config;
use crate::dispatcher::{Dispatcher, Inbound};
use crate::error::{DisconnectReason, Result, TetherError};
use crate::membership::MembershipSet;
use crate::message::Command;
use crate::nick;
use crate::queue::{OutboundQueue, WriterSlot};
use crate::reader::LineReader;
use crate::subscriber::EventSubscriber;
use crate::supervisor::{DisconnectSignal, Reconnect, Supervisor, SupervisorState};
use crate::transport::{BoxedStream, Connector, TcpConnector};

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::io::ReadHalf;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// State owned by one connection. Replaced, never reset, on reconnect.
#[derive(Debug)]
struct Session {
    connected: bool,
    nick: String,
    membership: MembershipSet,
    auth: AuthMachine,
    collisions: u32,
    nick_failure_reported: bool,
}

#[derive(Debug)]
struct Connection {
    generation: u64,
    tls: bool,
    session: RwLock<Session>,
}

impl Connection {
    /// Feeds one event to the auth machine under the session lock.
    async fn auth_event(&self, event: AuthEvent) -> Vec<AuthAction> {
        let mut session = self.session.write().await;
        let nick = session.nick.clone();
        session.auth.handle(event, &nick)
    }
}

struct ClientInner {
    me: Weak<ClientInner>,
    config: Arc<Config>,
    connector: Arc<dyn Connector>,
    subscribers: Vec<Arc<dyn EventSubscriber>>,
    dispatcher: Dispatcher,
    queue: OutboundQueue,
    writer: WriterSlot,
    current: RwLock<Option<Arc<Connection>>>,
    generation: AtomicU64,
    shutting_down: AtomicBool,
    disconnect_tx: mpsc::UnboundedSender<DisconnectSignal>,
    supervisor_state: Option<Arc<RwLock<SupervisorState>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a running client. Cheap to clone; all clones share one
/// connection, one outbound queue and one supervisor.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

pub struct ClientBuilder {
    config: Config,
    connector: Option<Arc<dyn Connector>>,
    subscribers: Vec<Arc<dyn EventSubscriber>>,
}

impl ClientBuilder {
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Subscribers are notified in registration order.
    pub fn subscriber(mut self, subscriber: impl EventSubscriber + 'static) -> Self {
        self.subscribers.push(Arc::new(subscriber));
        self
    }

    pub fn shared_subscriber(mut self, subscriber: Arc<dyn EventSubscriber>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    /// Validates the configuration, starts the background tasks and makes
    /// the first connection attempt. With reconnection enabled a failed
    /// first attempt is handed to the supervisor instead of returned.
    pub async fn start(self) -> Result<Client> {
        self.config.validate()?;

        let config = Arc::new(self.config);
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(TcpConnector::from_config(&config.server)));

        let writer = WriterSlot::default();
        let (queue, consumer) = OutboundQueue::spawn(
            config.behavior.queue_capacity,
            config.behavior.send_interval(),
            writer.clone(),
        );
        let (disconnect_tx, disconnect_rx) = mpsc::unbounded_channel();

        let supervisor = config.behavior.reconnect_interval().map(Supervisor::new);
        let supervisor_state = supervisor.as_ref().map(Supervisor::state_handle);

        let inner = Arc::new_cyclic(|me| ClientInner {
            me: me.clone(),
            dispatcher: Dispatcher::new(config.service_auth.service.clone()),
            config: config.clone(),
            connector,
            subscribers: self.subscribers,
            queue,
            writer,
            current: RwLock::new(None),
            generation: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            disconnect_tx,
            supervisor_state,
            tasks: Mutex::new(Vec::new()),
        });
        let client = Client { inner };
        client.retain(consumer);

        if let Some(supervisor) = supervisor {
            let target: Weak<dyn Reconnect> = Arc::downgrade(&client.inner) as Weak<ClientInner>;
            client.retain(supervisor.spawn(target, disconnect_rx));
        }

        match client.establish().await {
            Ok(()) => Ok(client),
            Err(e) if client.inner.supervisor_state.is_some() => {
                warn!("Initial connection failed: {}", e);
                let _ = client.inner.disconnect_tx.send(DisconnectSignal {
                    generation: client.inner.generation.load(Ordering::SeqCst),
                    reason: DisconnectReason::ConnectFailed(e.to_string()),
                });
                Ok(client)
            }
            Err(e) => {
                client.shutdown(None).await;
                Err(e)
            }
        }
    }
}

impl Client {
    pub fn builder(config: Config) -> ClientBuilder {
        ClientBuilder {
            config,
            connector: None,
            subscribers: Vec::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    // ---- outbound command surface ----

    pub fn send_message(&self, target: &str, text: &str) -> Result<()> {
        self.inner.queue.submit(Command::privmsg(target, text))
    }

    pub fn join(&self, channel: &str) -> Result<()> {
        self.inner.queue.submit(Command::Join(channel.to_string()))
    }

    pub fn send_raw(&self, line: &str) -> Result<()> {
        self.inner.queue.submit(Command::Raw(line.to_string()))
    }

    /// Client-initiated keepalive; the echo arrives through `on_pong`.
    pub fn ping(&self, id: &str) -> Result<()> {
        self.inner.queue.submit(Command::Ping(id.to_string()))
    }

    /// Schedules `IDENTIFY` with the configured service after the settle
    /// delay. Missing credentials are reported here rather than at startup.
    pub async fn identify_with_service(&self) -> Result<()> {
        let service = &self.inner.config.service_auth;
        if !service.enabled {
            return Err(TetherError::Configuration(
                "service authentication is not enabled".to_string(),
            ));
        }
        service.credentials()?;
        let connection = self.live_connection().await?;

        let client = self.clone();
        let delay = self.inner.config.behavior.identify_delay();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = client.send_identify(&connection).await {
                warn!("Service identification skipped: {}", e);
            }
        });
        self.retain(handle);
        Ok(())
    }

    /// Manual trigger after an authentication failure: join the configured
    /// channels without an account.
    pub async fn fallback_join(&self) -> Result<()> {
        let connection = self.live_connection().await?;
        let state = connection.session.read().await.auth.state();
        if state != AuthState::AwaitingFallbackJoin {
            return Err(TetherError::Auth(format!(
                "fallback join is not available while {}",
                state
            )));
        }
        let actions = connection.auth_event(AuthEvent::FallbackRequested).await;
        self.perform(&connection, actions).await;
        Ok(())
    }

    /// Sends a best-effort `QUIT`, closes the queue and the transport, and
    /// stops every background task.
    pub async fn shutdown(&self, reason: Option<String>) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down ({})", DisconnectReason::UserRequested);

        let quit = Command::Quit(reason);
        if let Err(e) = self.inner.writer.write_line(None, &quit.to_string()).await {
            debug!("QUIT not sent: {}", e);
        }
        self.inner.queue.close();
        self.inner.writer.clear_any().await;

        if let Some(connection) = self.inner.current.read().await.clone() {
            connection.session.write().await.connected = false;
        }

        // Not awaited: shutdown may run inside one of these tasks via a callback.
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for handle in handles {
            handle.abort();
        }
    }

    // ---- status queries ----

    pub async fn is_connected(&self) -> bool {
        match self.current_connection().await {
            Some(connection) => connection.session.read().await.connected,
            None => false,
        }
    }

    pub async fn is_authenticated(&self) -> bool {
        match self.current_connection().await {
            Some(connection) => connection.session.read().await.auth.is_authenticated(),
            None => false,
        }
    }

    pub async fn auth_state(&self) -> AuthState {
        match self.current_connection().await {
            Some(connection) => connection.session.read().await.auth.state(),
            None => AuthState::Disconnected,
        }
    }

    pub async fn current_nick(&self) -> String {
        match self.current_connection().await {
            Some(connection) => connection.session.read().await.nick.clone(),
            None => self.inner.config.identity.nickname.clone(),
        }
    }

    pub async fn joined_channels(&self) -> Vec<String> {
        match self.current_connection().await {
            Some(connection) => connection.session.read().await.membership.joined(),
            None => Vec::new(),
        }
    }

    pub async fn known_peers(&self) -> Vec<String> {
        match self.current_connection().await {
            Some(connection) => connection.session.read().await.membership.peers(),
            None => Vec::new(),
        }
    }

    pub async fn is_tls(&self) -> bool {
        self.current_connection()
            .await
            .is_some_and(|connection| connection.tls)
    }

    /// `None` when reconnection is disabled.
    pub async fn supervisor_state(&self) -> Option<SupervisorState> {
        match &self.inner.supervisor_state {
            Some(state) => Some(*state.read().await),
            None => None,
        }
    }

    // ---- connection lifecycle ----

    async fn establish(&self) -> Result<()> {
        let transport = self.inner.connector.connect().await?;
        if self.is_shutting_down() {
            return Err(TetherError::Connection("client is shutting down".to_string()));
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let tls = transport.is_tls();
        info!("Connected to {} (connection {})", transport.peer(), generation);

        let (read_half, write_half) = transport.into_split();
        let connection = Arc::new(Connection {
            generation,
            tls,
            session: RwLock::new(Session {
                connected: true,
                nick: self.inner.config.identity.nickname.clone(),
                membership: MembershipSet::new(),
                auth: AuthMachine::new(AuthPlan::from_config(&self.inner.config)),
                collisions: 0,
                nick_failure_reported: false,
            }),
        });

        self.inner.writer.install(generation, write_half).await;
        *self.inner.current.write().await = Some(connection.clone());

        let actions = connection.auth_event(AuthEvent::TransportOpened).await;
        self.perform(&connection, actions).await;

        let client = self.clone();
        let reader_connection = connection.clone();
        let handle = tokio::spawn(async move {
            client
                .read_loop(reader_connection, LineReader::new(read_half))
                .await
        });
        self.retain(handle);

        for subscriber in &self.inner.subscribers {
            subscriber.on_connected(self).await;
        }
        Ok(())
    }

    async fn read_loop(
        self,
        connection: Arc<Connection>,
        mut reader: LineReader<ReadHalf<BoxedStream>>,
    ) {
        while let Some(line) = reader.next_line().await {
            debug!("<< {}", line);
            self.handle_line(&connection, &line).await;
        }

        let reason = reader
            .finish_reason()
            .cloned()
            .unwrap_or(DisconnectReason::ServerClosed);
        self.on_disconnect(&connection, reason).await;
    }

    async fn on_disconnect(&self, connection: &Arc<Connection>, reason: DisconnectReason) {
        connection.session.write().await.connected = false;
        self.inner.writer.clear(connection.generation).await;

        if self.is_shutting_down() {
            return;
        }
        warn!("Connection {} lost: {}", connection.generation, reason);

        if self.inner.supervisor_state.is_none() {
            info!("Reconnection disabled, staying disconnected");
            return;
        }
        if self
            .inner
            .disconnect_tx
            .send(DisconnectSignal {
                generation: connection.generation,
                reason,
            })
            .is_err()
        {
            error!("Reconnect supervisor is gone");
        }
    }

    async fn handle_line(&self, connection: &Arc<Connection>, line: &str) {
        match self.inner.dispatcher.classify(line) {
            Inbound::Ping { reply } => {
                self.submit(connection, Command::Raw(reply));
            }
            Inbound::NickCollision { rejected } => {
                self.on_nick_collision(connection, rejected).await;
            }
            Inbound::Joined { actor, channel } => {
                let mut session = connection.session.write().await;
                let own = session.nick.clone();
                session.membership.record_join(&actor, &channel, &own);
            }
            Inbound::Names { names, .. } => {
                let mut session = connection.session.write().await;
                session.membership.record_names(names.iter().map(String::as_str));
            }
            Inbound::NickChanged { old, new } => {
                let mut session = connection.session.write().await;
                if old.eq_ignore_ascii_case(&session.nick) {
                    info!("Nickname is now {}", new);
                    session.nick = new;
                }
            }
            Inbound::Parted { nick, channel } => {
                let mut session = connection.session.write().await;
                if nick.eq_ignore_ascii_case(&session.nick) {
                    session.membership.remove_destination(&channel);
                }
            }
            Inbound::CapAck(caps) => self.auth(connection, AuthEvent::CapAck(caps)).await,
            Inbound::CapNak(caps) => self.auth(connection, AuthEvent::CapNak(caps)).await,
            Inbound::Challenge(challenge) => {
                self.auth(connection, AuthEvent::Challenge(challenge)).await
            }
            Inbound::SaslSucceeded(_) => self.auth(connection, AuthEvent::SaslSucceeded).await,
            Inbound::SaslFailed { code, reason } => {
                let reason = format!("{} ({})", reason, code);
                self.auth(connection, AuthEvent::SaslFailed(reason)).await
            }
            Inbound::ServiceConfirmed => self.auth(connection, AuthEvent::ServiceConfirmed).await,
            Inbound::ServiceRejected(reason) => {
                self.auth(connection, AuthEvent::ServiceRejected(reason)).await
            }
            Inbound::Welcome { nick } => {
                connection.session.write().await.nick = nick;
                self.auth(connection, AuthEvent::Welcome).await
            }
            Inbound::Pong { id } => {
                for subscriber in &self.inner.subscribers {
                    subscriber.on_pong(self, &id).await;
                }
            }
            Inbound::Chat(message) => {
                for subscriber in &self.inner.subscribers {
                    subscriber.on_message(self, &message).await;
                }
            }
            Inbound::Ignored => {}
        }
    }

    async fn on_nick_collision(&self, connection: &Arc<Connection>, rejected: Option<String>) {
        let limit = self.inner.config.behavior.nick_retry_limit;
        let outcome = {
            let mut session = connection.session.write().await;
            session.collisions += 1;
            if limit.is_some_and(|limit| session.collisions > limit) {
                if session.nick_failure_reported {
                    None
                } else {
                    session.nick_failure_reported = true;
                    Some(Err(session.collisions - 1))
                }
            } else {
                let previous = rejected.unwrap_or_else(|| session.nick.clone());
                let candidate = nick::next_candidate(
                    &self.inner.config.identity.nickname,
                    &previous,
                    Utc::now(),
                );
                session.nick = candidate.clone();
                Some(Ok(candidate))
            }
        };

        match outcome {
            Some(Ok(candidate)) => {
                info!("Nickname in use, trying {}", candidate);
                self.submit(connection, Command::Nick(candidate));
            }
            Some(Err(attempts)) => {
                let reason = format!("Nickname still in use after {} retries", attempts);
                error!("{}", reason);
                for subscriber in &self.inner.subscribers {
                    subscriber.on_auth_failed(self, &reason).await;
                }
            }
            None => {}
        }
    }

    async fn auth(&self, connection: &Arc<Connection>, event: AuthEvent) {
        let actions = connection.auth_event(event).await;
        self.perform(connection, actions).await;
    }

    async fn perform(&self, connection: &Arc<Connection>, actions: Vec<AuthAction>) {
        for action in actions {
            match action {
                AuthAction::Send(command) => self.submit(connection, command),
                AuthAction::Succeeded(method) => {
                    for subscriber in &self.inner.subscribers {
                        subscriber.on_authenticated(self, method).await;
                    }
                }
                AuthAction::Failed(reason) => {
                    for subscriber in &self.inner.subscribers {
                        subscriber.on_auth_failed(self, &reason).await;
                    }
                }
                AuthAction::JoinChannels => self.spawn_joins(connection),
                AuthAction::JoinControl => {
                    if let Some(control) = &self.inner.config.behavior.control_channel {
                        self.submit(connection, Command::Join(control.clone()));
                    }
                }
                AuthAction::Notice(text) => self.post_control(connection, text),
                AuthAction::Warn(text) => {
                    warn!("{}", text);
                    self.post_control(connection, text);
                }
            }
        }
    }

    /// Joins every configured channel except the control channel, one per
    /// join delay. Stops if the connection is replaced meanwhile.
    fn spawn_joins(&self, connection: &Arc<Connection>) {
        let channels = self.inner.config.behavior.auto_join_channels();
        if channels.is_empty() {
            return;
        }

        let client = self.clone();
        let generation = connection.generation;
        let delay = self.inner.config.behavior.join_delay();
        let handle = tokio::spawn(async move {
            for channel in channels {
                tokio::time::sleep(delay).await;
                if !client.is_current(generation) {
                    debug!("Connection {} replaced, abandoning joins", generation);
                    return;
                }
                if let Err(e) = client
                    .inner
                    .queue
                    .submit_for(Some(generation), Command::Join(channel.clone()))
                {
                    warn!("Could not queue JOIN {}: {}", channel, e);
                }
            }
        });
        self.retain(handle);
    }

    async fn send_identify(&self, connection: &Arc<Connection>) -> Result<()> {
        if !self.is_current(connection.generation) {
            return Err(TetherError::Connection("connection was replaced".to_string()));
        }
        let (state, nick) = {
            let session = connection.session.read().await;
            (session.auth.state(), session.nick.clone())
        };
        if !matches!(state, AuthState::Negotiating | AuthState::AwaitingServiceAuth) {
            return Err(TetherError::Auth(format!("not awaiting identification ({})", state)));
        }

        let service = &self.inner.config.service_auth;
        let (account, password) = service.credentials()?;
        if service.rename_before_identify && !nick.eq_ignore_ascii_case(account) {
            self.submit_checked(connection, Command::Nick(account.to_string()))?;
        }
        info!("Identifying with {} as {}", service.service, account);
        self.submit_checked(
            connection,
            Command::privmsg(
                service.service.clone(),
                format!("IDENTIFY {} {}", account, password),
            ),
        )
    }

    // ---- helpers ----

    fn submit(&self, connection: &Connection, command: Command) {
        if let Err(e) = self.submit_checked(connection, command) {
            warn!("Could not queue outbound line: {}", e);
        }
    }

    fn post_control(&self, connection: &Connection, text: String) {
        if let Some(control) = &self.inner.config.behavior.control_channel {
            self.submit(connection, Command::privmsg(control.clone(), text));
        }
    }

    fn submit_checked(&self, connection: &Connection, command: Command) -> Result<()> {
        self.inner
            .queue
            .submit_for(Some(connection.generation), command)
    }

    fn is_current(&self, generation: u64) -> bool {
        !self.is_shutting_down() && self.inner.generation.load(Ordering::SeqCst) == generation
    }

    fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    async fn current_connection(&self) -> Option<Arc<Connection>> {
        self.inner.current.read().await.clone()
    }

    async fn live_connection(&self) -> Result<Arc<Connection>> {
        let connection = self
            .current_connection()
            .await
            .ok_or_else(|| TetherError::Connection("Not connected".to_string()))?;
        if !connection.session.read().await.connected {
            return Err(TetherError::Connection("Not connected".to_string()));
        }
        Ok(connection)
    }

    fn retain(&self, handle: JoinHandle<()>) {
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }
}

#[async_trait]
impl Reconnect for ClientInner {
    async fn reconnect(&self) -> Result<()> {
        let inner = self
            .me
            .upgrade()
            .ok_or_else(|| TetherError::Connection("client dropped".to_string()))?;
        Client { inner }.establish().await
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("server", &self.inner.config.server.address)
            .field("generation", &self.inner.generation.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
