use crate::error::{Result, TetherError};
use directories::ProjectDirs;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub identity: IdentityConfig,

    #[serde(default)]
    pub sasl: SaslConfig,

    #[serde(default)]
    pub service_auth: ServiceAuthConfig,

    #[serde(default)]
    pub behavior: BehaviorConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// `host:port`
    pub address: String,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub client_cert: Option<PathBuf>,
    #[serde(default)]
    pub client_key: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct IdentityConfig {
    pub nickname: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub realname: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SaslConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub authzid: String,
    #[serde(default)]
    pub username: String,
    #[serde(default = "empty_secret")]
    pub password: SecretString,
}

#[derive(Debug, Deserialize)]
pub struct ServiceAuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_service_nick")]
    pub service: String,
    /// Registered account nickname used in `IDENTIFY`.
    #[serde(default)]
    pub account: String,
    #[serde(default = "empty_secret")]
    pub password: SecretString,
    /// Switch to the registered nickname before identifying.
    #[serde(default = "default_true")]
    pub rename_before_identify: bool,
}

#[derive(Debug, Deserialize)]
pub struct BehaviorConfig {
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub control_channel: Option<String>,
    #[serde(default)]
    pub fallback_join: bool,
    /// 0 disables reconnection.
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,
    #[serde(default = "default_send_interval")]
    pub send_interval_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_identify_delay")]
    pub identify_delay_secs: u64,
    #[serde(default = "default_join_delay")]
    pub join_delay_ms: u64,
    #[serde(default)]
    pub nick_retry_limit: Option<u32>,
}

fn empty_secret() -> SecretString {
    SecretString::new(String::new())
}

fn default_service_nick() -> String {
    "NickServ".to_string()
}

fn default_true() -> bool {
    true
}

fn default_reconnect_interval() -> u64 {
    30
}

fn default_send_interval() -> u64 {
    100
}

fn default_queue_capacity() -> usize {
    256
}

fn default_identify_delay() -> u64 {
    5
}

fn default_join_delay() -> u64 {
    500
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "irc.libera.chat:6697".to_string(),
            tls: true,
            client_cert: None,
            client_key: None,
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            nickname: "tether".to_string(),
            username: None,
            realname: None,
        }
    }
}

impl Default for SaslConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            authzid: String::new(),
            username: String::new(),
            password: empty_secret(),
        }
    }
}

impl Default for ServiceAuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            service: default_service_nick(),
            account: String::new(),
            password: empty_secret(),
            rename_before_identify: true,
        }
    }
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            control_channel: None,
            fallback_join: false,
            reconnect_interval_secs: default_reconnect_interval(),
            send_interval_ms: default_send_interval(),
            queue_capacity: default_queue_capacity(),
            identify_delay_secs: default_identify_delay(),
            join_delay_ms: default_join_delay(),
            nick_retry_limit: None,
        }
    }
}

impl IdentityConfig {
    pub fn username(&self) -> &str {
        self.username.as_deref().unwrap_or(&self.nickname)
    }

    pub fn realname(&self) -> &str {
        self.realname.as_deref().unwrap_or(&self.nickname)
    }
}

impl ServiceAuthConfig {
    /// Credentials are checked here rather than at load time so a missing
    /// password only fails the identify attempt.
    pub fn credentials(&self) -> Result<(&str, &str)> {
        if self.service.is_empty() || self.account.is_empty() {
            return Err(TetherError::Configuration(
                "service authentication requires a service nick and an account".to_string(),
            ));
        }
        let password = self.password.expose_secret();
        if password.is_empty() {
            return Err(TetherError::Configuration(
                "service authentication requires a password".to_string(),
            ));
        }
        Ok((self.account.as_str(), password.as_str()))
    }
}

impl BehaviorConfig {
    pub fn reconnect_interval(&self) -> Option<Duration> {
        match self.reconnect_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    pub fn identify_delay(&self) -> Duration {
        Duration::from_secs(self.identify_delay_secs)
    }

    pub fn join_delay(&self) -> Duration {
        Duration::from_millis(self.join_delay_ms)
    }

    /// Configured channels minus the control channel, which is joined separately.
    pub fn auto_join_channels(&self) -> Vec<String> {
        self.channels
            .iter()
            .filter(|ch| Some(ch.as_str()) != self.control_channel.as_deref())
            .cloned()
            .collect()
    }
}

impl Config {
    pub fn default_path() -> Result<PathBuf> {
        ProjectDirs::from("", "", "tether")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .ok_or_else(|| {
                TetherError::Configuration("Could not determine config directory".to_string())
            })
    }

    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading configuration from {}", path.display());
        let contents = fs::read_to_string(path)
            .map_err(|e| TetherError::Configuration(format!("Failed to read config: {}", e)))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| TetherError::Configuration(format!("Failed to parse config: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.address.trim().is_empty() {
            return Err(TetherError::Configuration("server address is empty".to_string()));
        }
        if !self.server.address.contains(':') {
            return Err(TetherError::Configuration(format!(
                "server address '{}' must be host:port",
                self.server.address
            )));
        }
        if self.identity.nickname.trim().is_empty() {
            return Err(TetherError::Configuration("nickname is empty".to_string()));
        }
        if self.sasl.enabled
            && (self.sasl.username.is_empty() || self.sasl.password.expose_secret().is_empty())
        {
            return Err(TetherError::Configuration(
                "SASL is enabled but username or password is missing".to_string(),
            ));
        }
        if let Some(control) = &self.behavior.control_channel {
            if control.trim().is_empty() {
                return Err(TetherError::Configuration("control channel is empty".to_string()));
            }
        }
        if self.behavior.queue_capacity == 0 {
            return Err(TetherError::Configuration("queue capacity must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r##"
[server]
address = "irc.example.net:6697"
tls = true

[identity]
nickname = "warden"
realname = "Warden Bot"

[sasl]
enabled = true
username = "warden"
password = "hunter2"

[behavior]
channels = ["#console", "#chat", "#games"]
control_channel = "#console"
fallback_join = true
reconnect_interval_secs = 10
"##;

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.address, "irc.example.net:6697");
        assert!(config.server.tls);
        assert_eq!(config.identity.nickname, "warden");
        assert_eq!(config.identity.username(), "warden");
        assert_eq!(config.identity.realname(), "Warden Bot");
        assert!(config.sasl.enabled);
        assert_eq!(config.sasl.password.expose_secret(), "hunter2");
        assert_eq!(config.behavior.reconnect_interval(), Some(Duration::from_secs(10)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = Config::from_toml("[identity]\nnickname = \"solo\"\n").unwrap();
        assert_eq!(config.behavior.send_interval(), Duration::from_millis(100));
        assert_eq!(config.behavior.queue_capacity, 256);
        assert_eq!(config.service_auth.service, "NickServ");
        assert!(config.service_auth.rename_before_identify);
        assert!(!config.sasl.enabled);
    }

    #[test]
    fn test_auto_join_excludes_control_channel() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(config.behavior.auto_join_channels(), vec!["#chat", "#games"]);
    }

    #[test]
    fn test_zero_interval_disables_reconnect() {
        let mut config = Config::default();
        config.behavior.reconnect_interval_secs = 0;
        assert_eq!(config.behavior.reconnect_interval(), None);
    }

    #[test]
    fn test_validate_rejects_sasl_without_password() {
        let mut config = Config::default();
        config.sasl.enabled = true;
        config.sasl.username = "warden".to_string();
        assert!(matches!(config.validate(), Err(TetherError::Configuration(_))));
    }

    #[test]
    fn test_validate_rejects_address_without_port() {
        let mut config = Config::default();
        config.server.address = "irc.example.net".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_service_credentials_required() {
        let mut service = ServiceAuthConfig::default();
        service.enabled = true;
        assert!(matches!(service.credentials(), Err(TetherError::Configuration(_))));

        service.account = "warden".to_string();
        service.password = SecretString::new("pw".to_string());
        assert_eq!(service.credentials().unwrap(), ("warden", "pw"));
    }

    #[test]
    fn test_parse_error_is_configuration_error() {
        let result = Config::from_toml("[server\naddress = ");
        assert!(matches!(result, Err(TetherError::Configuration(_))));
    }
}
