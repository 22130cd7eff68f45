use crate::config::Config;
use crate::message::Command;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use tracing::{debug, info, warn};

const SASL_CHUNK_SIZE: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Disconnected,
    Negotiating,
    AwaitingServiceAuth,
    AwaitingFallbackJoin,
    Authenticated,
    Failed,
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthState::Disconnected => "disconnected",
            AuthState::Negotiating => "negotiating",
            AuthState::AwaitingServiceAuth => "awaiting service auth",
            AuthState::AwaitingFallbackJoin => "awaiting fallback join",
            AuthState::Authenticated => "authenticated",
            AuthState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// How the connection ended up authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Sasl,
    Service,
    /// Fallback join: registered with the server but not with any account.
    Unauthenticated,
}

/// Protocol facts the state machine reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    TransportOpened,
    CapAck(String),
    CapNak(String),
    Challenge(String),
    SaslSucceeded,
    SaslFailed(String),
    Welcome,
    ServiceConfirmed,
    ServiceRejected(String),
    FallbackRequested,
}

/// What the client must do in response to an event, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthAction {
    Send(Command),
    Succeeded(AuthMethod),
    Failed(String),
    JoinChannels,
    JoinControl,
    /// Status line for the control channel.
    Notice(String),
    Warn(String),
}

pub struct SaslCredentials {
    pub authzid: String,
    pub authcid: String,
    pub password: SecretString,
}

impl fmt::Debug for SaslCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaslCredentials")
            .field("authzid", &self.authzid)
            .field("authcid", &self.authcid)
            .finish_non_exhaustive()
    }
}

/// Which authentication paths are configured.
#[derive(Debug)]
pub struct AuthPlan {
    pub sasl: Option<SaslCredentials>,
    pub service: bool,
    pub fallback_join: bool,
    pub username: String,
    pub realname: String,
}

impl AuthPlan {
    pub fn from_config(config: &Config) -> Self {
        let sasl = config.sasl.enabled.then(|| SaslCredentials {
            authzid: config.sasl.authzid.clone(),
            authcid: config.sasl.username.clone(),
            password: SecretString::new(config.sasl.password.expose_secret().clone()),
        });
        Self {
            sasl,
            service: config.service_auth.enabled,
            fallback_join: config.behavior.fallback_join,
            username: config.identity.username().to_string(),
            realname: config.identity.realname().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaslStep {
    Idle,
    CapRequested,
    MechanismSent,
    PayloadSent,
    Done,
}

/// Authentication progress for one connection. Pure: the caller performs the
/// returned actions. A new machine is built for every connection, which is
/// what resets the one-shot latches.
#[derive(Debug)]
pub struct AuthMachine {
    plan: AuthPlan,
    state: AuthState,
    sasl_step: SaslStep,
    success_fired: bool,
    failure_fired: bool,
    joins_scheduled: bool,
    control_joined: bool,
    /// Notices raised before the control channel was joined.
    held_notices: Vec<String>,
    method: Option<AuthMethod>,
}

impl AuthMachine {
    pub fn new(plan: AuthPlan) -> Self {
        Self {
            plan,
            state: AuthState::Disconnected,
            sasl_step: SaslStep::Idle,
            success_fired: false,
            failure_fired: false,
            joins_scheduled: false,
            control_joined: false,
            held_notices: Vec::new(),
            method: None,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn method(&self) -> Option<AuthMethod> {
        self.method
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == AuthState::Authenticated
    }

    /// Advance on `event`. `nick` is the connection's current nickname.
    pub fn handle(&mut self, event: AuthEvent, nick: &str) -> Vec<AuthAction> {
        let mut actions = Vec::new();
        let before = self.state;

        match event {
            AuthEvent::TransportOpened => self.on_transport_opened(nick, &mut actions),
            AuthEvent::CapAck(caps) => {
                if self.sasl_step == SaslStep::CapRequested && has_sasl(&caps) {
                    self.sasl_step = SaslStep::MechanismSent;
                    actions.push(AuthAction::Send(Command::Authenticate("PLAIN".to_string())));
                }
            }
            AuthEvent::CapNak(caps) => {
                if self.sasl_step == SaslStep::CapRequested && has_sasl(&caps) {
                    self.fail_sasl("Server refused the sasl capability".to_string(), &mut actions);
                }
            }
            AuthEvent::Challenge(challenge) => self.on_challenge(&challenge, &mut actions),
            AuthEvent::SaslSucceeded => {
                if self.sasl_pending() {
                    self.sasl_step = SaslStep::Done;
                    actions.push(AuthAction::Send(Command::CapEnd));
                    self.push_registration(nick, &mut actions);
                    self.authenticate(AuthMethod::Sasl, &mut actions);
                }
            }
            AuthEvent::SaslFailed(reason) => {
                if self.sasl_pending() {
                    self.fail_sasl(reason, &mut actions);
                }
            }
            AuthEvent::Welcome => self.on_welcome(&mut actions),
            AuthEvent::ServiceConfirmed => {
                if matches!(
                    self.state,
                    AuthState::Negotiating
                        | AuthState::AwaitingServiceAuth
                        | AuthState::Authenticated
                ) {
                    self.authenticate(AuthMethod::Service, &mut actions);
                }
            }
            AuthEvent::ServiceRejected(reason) => {
                if matches!(
                    self.state,
                    AuthState::Negotiating | AuthState::AwaitingServiceAuth
                ) && self.plan.service
                {
                    self.fail(reason, &mut actions);
                }
            }
            AuthEvent::FallbackRequested => {
                if self.state == AuthState::AwaitingFallbackJoin {
                    self.state = AuthState::Authenticated;
                    self.method = Some(AuthMethod::Unauthenticated);
                    actions.push(AuthAction::Warn(
                        "Joining channels without authentication".to_string(),
                    ));
                    self.schedule_joins(&mut actions);
                }
            }
        }

        if self.state != before {
            debug!("Auth state {} -> {}", before, self.state);
        }
        actions
    }

    fn on_transport_opened(&mut self, nick: &str, actions: &mut Vec<AuthAction>) {
        self.state = AuthState::Negotiating;
        if self.plan.sasl.is_some() {
            self.sasl_step = SaslStep::CapRequested;
            actions.push(AuthAction::Send(Command::CapReq("sasl".to_string())));
        }
        self.push_registration(nick, actions);
    }

    fn on_challenge(&mut self, challenge: &str, actions: &mut Vec<AuthAction>) {
        if self.sasl_step != SaslStep::MechanismSent || challenge != "+" {
            return;
        }
        let Some(creds) = &self.plan.sasl else {
            return;
        };
        let chunks = sasl_plain_chunks(
            &creds.authzid,
            &creds.authcid,
            creds.password.expose_secret(),
        );
        actions.extend(
            chunks
                .into_iter()
                .map(|chunk| AuthAction::Send(Command::Authenticate(chunk))),
        );
        self.sasl_step = SaslStep::PayloadSent;
    }

    fn on_welcome(&mut self, actions: &mut Vec<AuthAction>) {
        if !self.control_joined {
            self.control_joined = true;
            actions.push(AuthAction::JoinControl);
            actions.extend(self.held_notices.drain(..).map(AuthAction::Notice));
        }

        if self.state != AuthState::Negotiating {
            return;
        }
        if self.sasl_pending() {
            self.fail_sasl("server registered without SASL".to_string(), actions);
            return;
        }

        if self.plan.service {
            self.state = AuthState::AwaitingServiceAuth;
        } else if self.plan.sasl.is_none() && self.plan.fallback_join {
            actions.push(AuthAction::Warn(
                "No authentication configured, functionality may be degraded".to_string(),
            ));
            self.authenticate(AuthMethod::Unauthenticated, actions);
        } else {
            info!("No authentication configured, staying idle");
            self.state = AuthState::Authenticated;
        }
    }

    fn sasl_pending(&self) -> bool {
        self.plan.sasl.is_some()
            && matches!(
                self.sasl_step,
                SaslStep::CapRequested | SaslStep::MechanismSent | SaslStep::PayloadSent
            )
    }

    fn push_registration(&self, nick: &str, actions: &mut Vec<AuthAction>) {
        actions.push(AuthAction::Send(Command::Nick(nick.to_string())));
        actions.push(AuthAction::Send(Command::User {
            username: self.plan.username.clone(),
            realname: self.plan.realname.clone(),
        }));
    }

    fn authenticate(&mut self, method: AuthMethod, actions: &mut Vec<AuthAction>) {
        self.state = AuthState::Authenticated;
        if self.success_fired {
            debug!("Ignoring repeated authentication success ({:?})", method);
            return;
        }
        self.success_fired = true;
        self.method = Some(method);
        info!("Authenticated ({:?})", method);
        match method {
            AuthMethod::Sasl => self.notice("Authenticated via SASL".to_string(), actions),
            AuthMethod::Service => self.notice("Authenticated via services".to_string(), actions),
            AuthMethod::Unauthenticated => {}
        }
        actions.push(AuthAction::Succeeded(method));
        self.schedule_joins(actions);
    }

    fn schedule_joins(&mut self, actions: &mut Vec<AuthAction>) {
        if !self.joins_scheduled {
            self.joins_scheduled = true;
            actions.push(AuthAction::JoinChannels);
        }
    }

    fn notice(&mut self, text: String, actions: &mut Vec<AuthAction>) {
        if self.control_joined {
            actions.push(AuthAction::Notice(text));
        } else {
            self.held_notices.push(text);
        }
    }

    fn fail_sasl(&mut self, reason: String, actions: &mut Vec<AuthAction>) {
        self.sasl_step = SaslStep::Done;
        actions.push(AuthAction::Send(Command::CapEnd));
        self.fail(format!("SASL authentication failed: {}", reason), actions);
    }

    fn fail(&mut self, reason: String, actions: &mut Vec<AuthAction>) {
        warn!("{}", reason);
        self.state = AuthState::Failed;
        if !self.failure_fired {
            self.failure_fired = true;
            self.notice(format!("Authentication failed: {}", reason), actions);
            actions.push(AuthAction::Failed(reason));
        }
        if self.plan.fallback_join {
            self.state = AuthState::AwaitingFallbackJoin;
        }
    }
}

fn has_sasl(caps: &str) -> bool {
    caps.split_whitespace()
        .any(|cap| cap.trim_start_matches('-').eq_ignore_ascii_case("sasl"))
}

/// `AUTHENTICATE` payloads for SASL PLAIN: base64 of `authzid\0authcid\0password`
/// in chunks of at most 400 characters.
pub fn sasl_plain_chunks(authzid: &str, authcid: &str, password: &str) -> Vec<String> {
    let payload = format!("{}\0{}\0{}", authzid, authcid, password);
    chunk_payload(&BASE64.encode(payload.as_bytes()))
}

fn chunk_payload(encoded: &str) -> Vec<String> {
    if encoded.is_empty() {
        return vec!["+".to_string()];
    }

    let mut chunks: Vec<String> = encoded
        .as_bytes()
        .chunks(SASL_CHUNK_SIZE)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect();

    if encoded.len() % SASL_CHUNK_SIZE == 0 {
        chunks.push("+".to_string());
    }

    chunks
}
