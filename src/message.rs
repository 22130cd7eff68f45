use crate::error::{Result, TetherError};
use std::fmt;
use std::str::FromStr;

/// One inbound protocol line split into prefix, command and parameters.
/// Message tags are skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcLine {
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

impl IrcLine {
    /// Nickname part of the prefix (`nick` in `nick!user@host`).
    pub fn source_nick(&self) -> Option<&str> {
        self.prefix
            .as_deref()
            .map(|prefix| prefix.split(['!', '@']).next().unwrap_or(prefix))
    }

    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }

    pub fn last_param(&self) -> Option<&str> {
        self.params.last().map(String::as_str)
    }
}

impl FromStr for IrcLine {
    type Err = TetherError;

    fn from_str(line: &str) -> Result<Self> {
        let mut remaining = line.trim_end_matches(['\r', '\n']);

        if remaining.starts_with('@') {
            let space_pos = remaining
                .find(' ')
                .ok_or_else(|| TetherError::InvalidMessage("No space after tags".to_string()))?;
            remaining = remaining[space_pos + 1..].trim_start();
        }

        let mut prefix = None;
        if let Some(rest) = remaining.strip_prefix(':') {
            let space_pos = rest
                .find(' ')
                .ok_or_else(|| TetherError::InvalidMessage("No space after prefix".to_string()))?;
            prefix = Some(rest[..space_pos].to_string());
            remaining = rest[space_pos + 1..].trim_start();
        }

        let (command, mut rest) = match remaining.split_once(' ') {
            Some((command, rest)) => (command, rest),
            None => (remaining, ""),
        };
        if command.is_empty() || !command.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(TetherError::InvalidMessage(format!("Invalid command: {:?}", command)));
        }

        let mut params = Vec::new();
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            match rest.split_once(' ') {
                Some((param, tail)) => {
                    params.push(param.to_string());
                    rest = tail;
                }
                None => {
                    params.push(rest.to_string());
                    break;
                }
            }
        }

        Ok(IrcLine {
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }
}

/// A chat line delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Full sender identity, e.g. `nick!user@host`.
    pub sender: String,
    pub destination: String,
    pub text: String,
}

impl InboundMessage {
    /// Parses `:<sender> PRIVMSG <destination> :<text>`, tags allowed.
    pub fn parse(line: &str) -> Option<Self> {
        line.parse::<IrcLine>()
            .ok()
            .and_then(|parsed| Self::from_line(&parsed))
    }

    pub fn from_line(line: &IrcLine) -> Option<Self> {
        if line.command != "PRIVMSG" {
            return None;
        }
        let sender = line.prefix.as_deref().filter(|prefix| !prefix.is_empty())?;
        let (destination, text) = line.params.split_first()?;
        if destination.is_empty() || text.is_empty() {
            return None;
        }

        Some(InboundMessage {
            sender: sender.to_string(),
            destination: destination.clone(),
            text: text.join(" "),
        })
    }

    pub fn sender_nick(&self) -> &str {
        self.sender.split(['!', '@']).next().unwrap_or(&self.sender)
    }

    /// True when the message was sent directly to us rather than to a channel.
    pub fn is_private(&self) -> bool {
        !self.destination.starts_with(['#', '&', '+', '!'])
    }
}

/// Outbound protocol commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Nick(String),
    User { username: String, realname: String },
    Join(String),
    Privmsg { target: String, text: String },
    Ping(String),
    CapReq(String),
    CapEnd,
    Authenticate(String),
    Quit(Option<String>),
    Raw(String),
}

impl Command {
    pub fn privmsg(target: impl Into<String>, text: impl Into<String>) -> Self {
        Command::Privmsg {
            target: target.into(),
            text: text.into(),
        }
    }

    /// Whether the rendered line carries credentials and must not be logged verbatim.
    pub fn is_sensitive(&self) -> bool {
        match self {
            Command::Authenticate(payload) => payload != "PLAIN" && payload != "+",
            Command::Privmsg { text, .. } => is_identify(text),
            Command::Raw(line) => raw_is_sensitive(line),
            _ => false,
        }
    }

    /// Rejects anything that would smuggle a second line onto the wire.
    pub fn validate(&self) -> Result<()> {
        let line = self.to_string();
        if line.is_empty() {
            return Err(TetherError::InvalidMessage("Empty line".to_string()));
        }
        if line.contains(['\r', '\n', '\0']) {
            return Err(TetherError::InvalidMessage(
                "Line contains CR, LF or NUL".to_string(),
            ));
        }
        Ok(())
    }
}

fn is_identify(text: &str) -> bool {
    text.trim_start()
        .get(..9)
        .is_some_and(|head| head.eq_ignore_ascii_case("IDENTIFY "))
}

/// Hand-written lines: `AUTHENTICATE` payloads and `IDENTIFY` sent by
/// `PRIVMSG`, `NOTICE` or a `NICKSERV`/`NS` alias.
fn raw_is_sensitive(line: &str) -> bool {
    let Ok(parsed) = line.parse::<IrcLine>() else {
        return false;
    };
    match parsed.command.as_str() {
        "AUTHENTICATE" => parsed
            .param(0)
            .is_some_and(|payload| payload != "PLAIN" && payload != "+"),
        "PRIVMSG" | "NOTICE" => parsed.param(1).is_some_and(is_identify),
        "NICKSERV" | "NS" => parsed
            .params
            .first()
            .is_some_and(|first| first.eq_ignore_ascii_case("IDENTIFY")),
        _ => false,
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Nick(nick) => write!(f, "NICK {}", nick),
            Command::User { username, realname } => write!(f, "USER {} 0 * :{}", username, realname),
            Command::Join(channel) => write!(f, "JOIN {}", channel),
            Command::Privmsg { target, text } => write!(f, "PRIVMSG {} :{}", target, text),
            Command::Ping(token) => write!(f, "PING {}", token),
            Command::CapReq(caps) => write!(f, "CAP REQ :{}", caps),
            Command::CapEnd => write!(f, "CAP END"),
            Command::Authenticate(payload) => write!(f, "AUTHENTICATE {}", payload),
            Command::Quit(Some(reason)) => write!(f, "QUIT :{}", reason),
            Command::Quit(None) => write!(f, "QUIT"),
            Command::Raw(line) => write!(f, "{}", line),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_basic_line_parsing() {
        let line: IrcLine = ":alice!a@host PRIVMSG #channel :Hello world".parse().unwrap();
        assert_eq!(line.prefix.as_deref(), Some("alice!a@host"));
        assert_eq!(line.source_nick(), Some("alice"));
        assert_eq!(line.command, "PRIVMSG");
        assert_eq!(line.params, vec!["#channel", "Hello world"]);
    }

    #[test]
    fn test_line_with_tags_and_numeric() {
        let line: IrcLine = "@time=2024-01-01T00:00:00.000Z :srv 353 me = #chat :@alice +bob carol"
            .parse()
            .unwrap();
        assert_eq!(line.command, "353");
        assert_eq!(line.params, vec!["me", "=", "#chat", "@alice +bob carol"]);
    }

    #[test]
    fn test_line_without_params() {
        let line: IrcLine = "CAP".parse().unwrap();
        assert!(line.params.is_empty());
        assert_eq!(line.source_nick(), None);
    }

    #[test]
    fn test_malformed_lines_rejected() {
        assert!(":prefixonly".parse::<IrcLine>().is_err());
        assert!("@tagsonly".parse::<IrcLine>().is_err());
        assert!(":srv ???".parse::<IrcLine>().is_err());
    }

    #[test]
    fn test_inbound_message_keeps_full_sender() {
        let msg = InboundMessage::parse(":alice!al@example.org PRIVMSG #chat :hi there: all").unwrap();
        assert_eq!(msg.sender, "alice!al@example.org");
        assert_eq!(msg.sender_nick(), "alice");
        assert_eq!(msg.destination, "#chat");
        assert_eq!(msg.text, "hi there: all");
        assert!(!msg.is_private());
    }

    #[test]
    fn test_inbound_message_rejects_short_lines() {
        assert_eq!(InboundMessage::parse(":alice PRIVMSG #chat"), None);
        assert_eq!(InboundMessage::parse("PRIVMSG #chat :hi"), None);
    }

    #[test]
    fn test_command_rendering() {
        assert_eq!(Command::Nick("bot".into()).to_string(), "NICK bot");
        assert_eq!(
            Command::User { username: "bot".into(), realname: "A Bot".into() }.to_string(),
            "USER bot 0 * :A Bot"
        );
        assert_eq!(Command::CapReq("sasl".into()).to_string(), "CAP REQ :sasl");
        assert_eq!(Command::privmsg("#c", "x").to_string(), "PRIVMSG #c :x");
        assert_eq!(Command::Quit(None).to_string(), "QUIT");
    }

    #[test]
    fn test_sensitive_commands() {
        assert!(Command::Authenticate("AGFsaWNl".into()).is_sensitive());
        assert!(!Command::Authenticate("PLAIN".into()).is_sensitive());
        assert!(Command::privmsg("NickServ", "IDENTIFY bot pw").is_sensitive());
        assert!(!Command::privmsg("#chat", "identify yourself").is_sensitive());
    }

    #[test]
    fn test_raw_identify_is_sensitive() {
        assert!(Command::Raw("PRIVMSG NickServ :IDENTIFY bot pw".into()).is_sensitive());
        assert!(Command::Raw("privmsg NickServ :identify pw".into()).is_sensitive());
        assert!(Command::Raw("NS IDENTIFY bot pw".into()).is_sensitive());
        assert!(Command::Raw("AUTHENTICATE AGFsaWNl".into()).is_sensitive());
        assert!(!Command::Raw("PRIVMSG #chat :hello".into()).is_sensitive());
        assert!(!Command::Raw("JOIN #chat".into()).is_sensitive());
    }

    #[test]
    fn test_inbound_message_with_tags() {
        let line = "@time=2024-01-01T00:00:00.000Z;msgid=abc :alice!a@h PRIVMSG #chat :tagged";
        let msg = InboundMessage::parse(line).unwrap();
        assert_eq!(msg.sender, "alice!a@h");
        assert_eq!(msg.destination, "#chat");
        assert_eq!(msg.text, "tagged");
    }

    #[test]
    fn test_validate_rejects_line_breaks() {
        assert!(Command::Raw("PRIVMSG #a :x\r\nQUIT".into()).validate().is_err());
        assert!(Command::privmsg("#a", "nul\0").validate().is_err());
        assert!(Command::Raw(String::new()).validate().is_err());
        assert!(Command::Join("#ok".into()).validate().is_ok());
    }

    proptest! {
        #[test]
        fn prop_chat_line_round_trips(
            nick in "[a-zA-Z][a-zA-Z0-9_]{0,15}",
            user in "[a-z]{1,10}",
            host in "[a-z]{1,10}\\.[a-z]{2,3}",
            destination in "#[a-z0-9]{1,20}",
            text in "[^\r\n\x00]{0,200}",
        ) {
            let line = format!(":{}!{}@{} PRIVMSG {} :{}", nick, user, host, destination, text);
            let msg = InboundMessage::parse(&line).unwrap();
            prop_assert_eq!(msg.sender, format!("{}!{}@{}", nick, user, host));
            prop_assert_eq!(msg.destination, destination);
            prop_assert_eq!(msg.text, text);
        }
    }
}
