use crate::core::types::{BackoffPolicy, RequestPolicy};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Method names the venue uses for session-level calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolMethods {
    pub login: String,
    pub subscribe: String,
    pub unsubscribe: String,
    pub cancel_on_disconnect: String,
    pub cancel_on_disconnect_params: Value,
    pub logout: String,
}

impl Default for ProtocolMethods {
    fn default() -> Self {
        Self {
            login: "public/auth".to_string(),
            subscribe: "public/subscribe".to_string(),
            unsubscribe: "public/unsubscribe".to_string(),
            cancel_on_disconnect: "private/enable_cancel_on_disconnect".to_string(),
            cancel_on_disconnect_params: json!({ "scope": "connection" }),
            logout: "private/logout".to_string(),
        }
    }
}

impl ProtocolMethods {
    /// Parameters for a (un)subscribe call covering one channel.
    pub fn channel_params(&self, channel: &str) -> Value {
        json!({ "channels": [channel] })
    }
}

/// Session configuration, consumed read-only by the session core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Venue WebSocket endpoint
    pub url: String,
    /// Connection handshake timeout in milliseconds
    pub dial_timeout_ms: u64,
    /// Idle time before a protocol ping is sent; 0 disables the heartbeat
    pub ping_interval_ms: u64,
    /// How long after a ping some inbound traffic must arrive
    pub pong_grace_ms: u64,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_wait_ms: u64,
    /// Ceiling for the backoff wait
    pub reconnect_max_wait_ms: u64,
    pub backoff: BackoffPolicy,
    /// Default per-call deadline in milliseconds
    pub call_timeout_ms: u64,
    /// Maximum concurrent in-flight calls; `None` means unbounded
    pub max_in_flight: Option<usize>,
    pub request_policy: RequestPolicy,
    /// Extra login attempts after an auth rejection; `None` makes AuthError terminal
    pub auth_retry_limit: Option<u32>,
    /// Re-arm the venue's cancel-on-disconnect after every login
    pub cancel_on_disconnect: bool,
    /// Outbound messages per second; `None` disables rate limiting
    pub outbound_rate_limit: Option<u32>,
    pub methods: ProtocolMethods,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            dial_timeout_ms: 10_000,
            ping_interval_ms: 15_000,
            pong_grace_ms: 10_000,
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            reconnect_base_wait_ms: 1_000,
            reconnect_max_wait_ms: 60_000,
            backoff: BackoffPolicy::Linear,
            call_timeout_ms: 10_000,
            max_in_flight: None,
            request_policy: RequestPolicy::FailFast,
            auth_retry_limit: None,
            cancel_on_disconnect: false,
            outbound_rate_limit: None,
            methods: ProtocolMethods::default(),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Read configuration from environment variables
    ///
    /// Expected environment variables:
    /// - `{PREFIX}_WS_URL` (required)
    /// - `{PREFIX}_CALL_TIMEOUT_MS`, `{PREFIX}_DIAL_TIMEOUT_MS`,
    ///   `{PREFIX}_PING_INTERVAL_MS`, `{PREFIX}_MAX_RECONNECT_ATTEMPTS`,
    ///   `{PREFIX}_AUTO_RECONNECT`, `{PREFIX}_CANCEL_ON_DISCONNECT` (optional)
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        let prefix = prefix.to_uppercase();
        let url_var = format!("{}_WS_URL", prefix);
        let url = env::var(&url_var).map_err(|_| ConfigError::MissingEnvironmentVariable(url_var))?;

        let mut config = Self::new(url);
        if let Some(ms) = env_parse(&format!("{}_CALL_TIMEOUT_MS", prefix))? {
            config.call_timeout_ms = ms;
        }
        if let Some(ms) = env_parse(&format!("{}_DIAL_TIMEOUT_MS", prefix))? {
            config.dial_timeout_ms = ms;
        }
        if let Some(ms) = env_parse(&format!("{}_PING_INTERVAL_MS", prefix))? {
            config.ping_interval_ms = ms;
        }
        if let Some(attempts) = env_parse(&format!("{}_MAX_RECONNECT_ATTEMPTS", prefix))? {
            config.max_reconnect_attempts = attempts;
        }
        if let Some(enabled) = env_parse(&format!("{}_AUTO_RECONNECT", prefix))? {
            config.auto_reconnect = enabled;
        }
        if let Some(enabled) = env_parse(&format!("{}_CANCEL_ON_DISCONNECT", prefix))? {
            config.cancel_on_disconnect = enabled;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load a `.env` file (if present) and then read [`SessionConfig::from_env`].
    #[cfg(feature = "env-file")]
    pub fn from_env_file(prefix: &str, env_file_path: &str) -> Result<Self, ConfigError> {
        load_env_file(env_file_path)?;
        Self::from_env(prefix)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(ConfigError::InvalidConfiguration(format!(
                "url must be a ws:// or wss:// endpoint, got '{}'",
                self.url
            )));
        }
        if self.dial_timeout_ms == 0 || self.call_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfiguration(
                "dial and call timeouts must be non-zero".to_string(),
            ));
        }
        if self.reconnect_max_wait_ms < self.reconnect_base_wait_ms {
            return Err(ConfigError::InvalidConfiguration(
                "reconnect_max_wait_ms is below reconnect_base_wait_ms".to_string(),
            ));
        }
        if self.ping_interval_ms > 0 && self.pong_grace_ms == 0 {
            return Err(ConfigError::InvalidConfiguration(
                "pong_grace_ms must be non-zero when heartbeats are enabled".to_string(),
            ));
        }
        if self.max_in_flight == Some(0) || self.outbound_rate_limit == Some(0) {
            return Err(ConfigError::InvalidConfiguration(
                "max_in_flight and outbound_rate_limit must be positive when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    /// `None` when heartbeats are disabled.
    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_ms > 0).then(|| Duration::from_millis(self.ping_interval_ms))
    }

    pub fn pong_grace(&self) -> Duration {
        Duration::from_millis(self.pong_grace_ms)
    }

    pub fn reconnect_base_wait(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_wait_ms)
    }

    pub fn reconnect_max_wait(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_wait_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    #[must_use]
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout_ms = timeout.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn with_ping_interval(mut self, interval: Duration, grace: Duration) -> Self {
        self.ping_interval_ms = interval.as_millis() as u64;
        self.pong_grace_ms = grace.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn without_heartbeat(mut self) -> Self {
        self.ping_interval_ms = 0;
        self
    }

    #[must_use]
    pub const fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    #[must_use]
    pub fn with_reconnect(mut self, max_attempts: u32, base_wait: Duration, max_wait: Duration) -> Self {
        self.max_reconnect_attempts = max_attempts;
        self.reconnect_base_wait_ms = base_wait.as_millis() as u64;
        self.reconnect_max_wait_ms = max_wait.as_millis() as u64;
        self
    }

    #[must_use]
    pub const fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = timeout.as_millis() as u64;
        self
    }

    #[must_use]
    pub const fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = Some(max);
        self
    }

    #[must_use]
    pub const fn with_request_policy(mut self, policy: RequestPolicy) -> Self {
        self.request_policy = policy;
        self
    }

    #[must_use]
    pub const fn with_auth_retry_limit(mut self, limit: u32) -> Self {
        self.auth_retry_limit = Some(limit);
        self
    }

    #[must_use]
    pub const fn with_cancel_on_disconnect(mut self, enabled: bool) -> Self {
        self.cancel_on_disconnect = enabled;
        self
    }

    #[must_use]
    pub const fn with_outbound_rate_limit(mut self, per_second: u32) -> Self {
        self.outbound_rate_limit = Some(per_second);
        self
    }

    #[must_use]
    pub fn with_methods(mut self, methods: ProtocolMethods) -> Self {
        self.methods = methods;
        self
    }
}

/// API credentials used by the signers; never serialized in clear.
#[derive(Debug, Clone)]
pub struct CredentialConfig {
    pub client_id: Secret<String>,
    pub client_secret: Secret<String>,
}

impl Serialize for CredentialConfig {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("CredentialConfig", 2)?;
        state.serialize_field("client_id", "[REDACTED]")?;
        state.serialize_field("client_secret", "[REDACTED]")?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for CredentialConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct CredentialConfigHelper {
            client_id: String,
            client_secret: String,
        }

        let helper = CredentialConfigHelper::deserialize(deserializer)?;
        Ok(Self::new(helper.client_id, helper.client_secret))
    }
}

impl CredentialConfig {
    #[must_use]
    pub fn new(client_id: String, client_secret: String) -> Self {
        Self {
            client_id: Secret::new(client_id),
            client_secret: Secret::new(client_secret),
        }
    }

    /// Expects `{PREFIX}_CLIENT_ID` and `{PREFIX}_CLIENT_SECRET`.
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        let id_var = format!("{}_CLIENT_ID", prefix.to_uppercase());
        let secret_var = format!("{}_CLIENT_SECRET", prefix.to_uppercase());

        let client_id =
            env::var(&id_var).map_err(|_| ConfigError::MissingEnvironmentVariable(id_var))?;
        let client_secret = env::var(&secret_var)
            .map_err(|_| ConfigError::MissingEnvironmentVariable(secret_var))?;

        Ok(Self::new(client_id, client_secret))
    }

    /// **Security Warning**: never commit .env files to version control.
    #[cfg(feature = "env-file")]
    pub fn from_env_file(prefix: &str, env_file_path: &str) -> Result<Self, ConfigError> {
        load_env_file(env_file_path)?;
        Self::from_env(prefix)
    }

    pub fn has_credentials(&self) -> bool {
        !self.client_id.expose_secret().is_empty() && !self.client_secret.expose_secret().is_empty()
    }

    /// Get client id (use carefully - exposes secret)
    pub fn client_id(&self) -> &str {
        self.client_id.expose_secret()
    }

    /// Get client secret (use carefully - exposes secret)
    pub fn client_secret(&self) -> &str {
        self.client_secret.expose_secret()
    }
}

#[cfg(feature = "env-file")]
fn load_env_file(env_file_path: &str) -> Result<(), ConfigError> {
    match dotenv::from_path(env_file_path) {
        Ok(()) => Ok(()),
        // A missing file is fine, system environment variables still apply
        Err(dotenv::Error::Io(io_err)) if io_err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ConfigError::InvalidConfiguration(format!(
            "Failed to load .env file '{}': {}",
            env_file_path, e
        ))),
    }
}

fn env_parse<T: FromStr>(var: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            ConfigError::InvalidConfiguration(format!("{} has invalid value '{}': {}", var, raw, e))
        }),
        Err(_) => Ok(None),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvironmentVariable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}
