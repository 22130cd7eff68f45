use crate::message::{InboundMessage, IrcLine};

const SERVICE_SUCCESS_PHRASES: &[&str] = &[
    "You are now identified",
    "You're now logged in",
    "You are now logged in",
];

const SERVICE_FAILURE_PHRASES: &[&str] = &["Authentication failed", "Invalid password"];

/// What one inbound line means to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Server keepalive; `reply` is the line to send back verbatim.
    Ping { reply: String },
    NickCollision { rejected: Option<String> },
    Joined { actor: String, channel: String },
    Names { channel: String, names: Vec<String> },
    NickChanged { old: String, new: String },
    Parted { nick: String, channel: String },
    CapAck(String),
    CapNak(String),
    Challenge(String),
    SaslSucceeded(u16),
    SaslFailed { code: u16, reason: String },
    ServiceConfirmed,
    ServiceRejected(String),
    Welcome { nick: String },
    Pong { id: String },
    Chat(InboundMessage),
    Ignored,
}

/// Stateless line classifier. Categories are checked in priority order and
/// the first match wins.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    service_nick: String,
}

impl Dispatcher {
    pub fn new(service_nick: impl Into<String>) -> Self {
        Self {
            service_nick: service_nick.into(),
        }
    }

    pub fn classify(&self, line: &str) -> Inbound {
        if line.starts_with("PING ") {
            return Inbound::Ping {
                reply: line.replacen("PING", "PONG", 1),
            };
        }

        let Ok(parsed) = line.parse::<IrcLine>() else {
            return Inbound::Ignored;
        };

        match parsed.command.as_str() {
            "433" | "437" => Inbound::NickCollision {
                rejected: parsed.param(1).map(str::to_string),
            },
            "JOIN" => match (parsed.source_nick(), parsed.param(0)) {
                (Some(actor), Some(channel)) => Inbound::Joined {
                    actor: actor.to_string(),
                    channel: channel.to_string(),
                },
                _ => Inbound::Ignored,
            },
            "353" => match (parsed.param(2), parsed.param(3)) {
                (Some(channel), Some(names)) => Inbound::Names {
                    channel: channel.to_string(),
                    names: names.split_whitespace().map(str::to_string).collect(),
                },
                _ => Inbound::Ignored,
            },
            "NICK" => match (parsed.source_nick(), parsed.param(0)) {
                (Some(old), Some(new)) => Inbound::NickChanged {
                    old: old.to_string(),
                    new: new.to_string(),
                },
                _ => Inbound::Ignored,
            },
            "PART" => match (parsed.source_nick(), parsed.param(0)) {
                (Some(nick), Some(channel)) => Inbound::Parted {
                    nick: nick.to_string(),
                    channel: channel.to_string(),
                },
                _ => Inbound::Ignored,
            },
            "KICK" => match (parsed.param(0), parsed.param(1)) {
                (Some(channel), Some(nick)) => Inbound::Parted {
                    nick: nick.to_string(),
                    channel: channel.to_string(),
                },
                _ => Inbound::Ignored,
            },
            "CAP" => self.classify_cap(&parsed),
            "AUTHENTICATE" => Inbound::Challenge(parsed.param(0).unwrap_or("+").to_string()),
            "903" => Inbound::SaslSucceeded(903),
            "907" => Inbound::SaslSucceeded(907),
            "902" | "904" | "905" | "906" => {
                let code = parsed.command.parse().unwrap_or(904);
                Inbound::SaslFailed {
                    code,
                    reason: parsed
                        .last_param()
                        .unwrap_or("SASL authentication failed")
                        .to_string(),
                }
            }
            "NOTICE" | "PRIVMSG" if self.is_from_service(&parsed) => {
                self.classify_service_notice(&parsed)
            }
            "001" => match parsed.param(0) {
                Some(nick) => Inbound::Welcome {
                    nick: nick.to_string(),
                },
                None => Inbound::Ignored,
            },
            "PONG" => match parsed.last_param() {
                Some(id) if parsed.params.len() >= 2 => Inbound::Pong { id: id.to_string() },
                _ => Inbound::Ignored,
            },
            "PRIVMSG" => InboundMessage::from_line(&parsed)
                .map(Inbound::Chat)
                .unwrap_or(Inbound::Ignored),
            _ => Inbound::Ignored,
        }
    }

    fn classify_cap(&self, parsed: &IrcLine) -> Inbound {
        let caps = parsed.last_param().unwrap_or_default().trim().to_string();
        match parsed.param(1).map(str::to_ascii_uppercase).as_deref() {
            Some("ACK") => Inbound::CapAck(caps),
            Some("NAK") => Inbound::CapNak(caps),
            _ => Inbound::Ignored,
        }
    }

    fn is_from_service(&self, parsed: &IrcLine) -> bool {
        !self.service_nick.is_empty()
            && parsed
                .source_nick()
                .is_some_and(|nick| nick.eq_ignore_ascii_case(&self.service_nick))
    }

    fn classify_service_notice(&self, parsed: &IrcLine) -> Inbound {
        let text = parsed.last_param().unwrap_or_default();
        if SERVICE_SUCCESS_PHRASES.iter().any(|p| text.contains(p)) {
            return Inbound::ServiceConfirmed;
        }
        if SERVICE_FAILURE_PHRASES.iter().any(|p| text.contains(p)) {
            return Inbound::ServiceRejected(format!("{}: {}", self.service_nick, text));
        }
        match parsed.command.as_str() {
            "PRIVMSG" => InboundMessage::from_line(parsed)
                .map(Inbound::Chat)
                .unwrap_or(Inbound::Ignored),
            _ => Inbound::Ignored,
        }
    }
}
