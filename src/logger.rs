use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `default_level`. Safe to call more than
/// once; later calls are ignored.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("tether={},warn", default_level)))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Outbound lines carrying credentials are logged with the payload hidden.
pub fn redact(line: &str, sensitive: bool) -> std::borrow::Cow<'_, str> {
    if !sensitive {
        return std::borrow::Cow::Borrowed(line);
    }
    let mut words = line.split(' ');
    let command = words.next().unwrap_or_default();
    let visible = match (command, words.next()) {
        ("PRIVMSG" | "NOTICE", Some(target)) => format!("{} {}", command, target),
        _ => command.to_string(),
    };
    std::borrow::Cow::Owned(format!("{} <redacted>", visible))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init("debug");
        init("info");
    }

    #[test]
    fn test_redact_hides_payload() {
        assert_eq!(redact("AUTHENTICATE AGFsaWNl", true), "AUTHENTICATE <redacted>");
        assert_eq!(
            redact("PRIVMSG NickServ :IDENTIFY warden hunter2", true),
            "PRIVMSG NickServ <redacted>"
        );
        assert_eq!(redact("JOIN #chat", false), "JOIN #chat");
    }
}
