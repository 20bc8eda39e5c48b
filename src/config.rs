//! Bridge settings.
//!
//! Settings come either from the host's instance settings (a plain JSON
//! object plus a map of decrypted secure values) or from environment
//! variables when the bridge runs standalone.

use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::nats::credentials::CredentialStorage;

/// Port every broker endpoint listens on.
pub const BROKER_PORT: u16 = 4222;

/// Default cadence of the poll-forward loop.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default upper bound for a single pull request.
pub const DEFAULT_PULL_EXPIRY: Duration = Duration::from_secs(1);

/// Error type for settings decoding
#[derive(Debug)]
pub enum ConfigError {
    Json(serde_json::Error),
    MissingField(&'static str),
    InvalidValue { field: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Json(e) => write!(f, "Invalid settings JSON: {}", e),
            ConfigError::MissingField(field) => write!(f, "Missing required setting '{}'", field),
            ConfigError::InvalidValue { field, value } => {
                write!(f, "Invalid value '{}' for setting '{}'", value, field)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Json(err)
    }
}

/// How the connection authenticates to the broker.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMode {
    /// Signed user token plus its nkey seed.
    TokenSeed { token: String, seed: String },
    /// Plain username/password.
    UserPassword { username: String, password: String },
}

impl fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMode::TokenSeed { .. } => f.write_str("TokenSeed { .. }"),
            AuthMode::UserPassword { username, .. } => f
                .debug_struct("UserPassword")
                .field("username", username)
                .finish_non_exhaustive(),
        }
    }
}

/// Caller identity: the API key sent to the namespace RPC plus the
/// authentication material for the connection itself.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub api_key: String,
    pub auth: AuthMode,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("api_key", &"<redacted>")
            .field("auth", &self.auth)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Broker host, without scheme or port.
    pub host: String,
    pub identity: Identity,
    pub credential_storage: CredentialStorage,
    pub poll_interval: Duration,
    pub pull_expiry: Duration,
    pub connect_timeout: Duration,
}

/// Non-secret instance settings as stored by the host.
#[derive(Debug, Default, Deserialize)]
struct InstanceOptions {
    path: Option<String>,
    username: Option<String>,
    password: Option<String>,
    poll_interval_ms: Option<u64>,
}

/// Decrypted secure settings.
#[derive(Debug, Default, Deserialize)]
struct SecureOptions {
    #[serde(rename = "apiKey")]
    api_key: Option<String>,
    #[serde(rename = "secretKey")]
    secret_key: Option<String>,
}

impl BridgeSettings {
    pub fn new(host: impl Into<String>, identity: Identity) -> Self {
        Self {
            host: host.into(),
            identity,
            credential_storage: CredentialStorage::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            pull_expiry: DEFAULT_PULL_EXPIRY,
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// `nats://<host>:4222`
    pub fn broker_address(&self) -> String {
        format!("nats://{}:{}", self.host.trim(), BROKER_PORT)
    }

    /// Pull expiry actually used by the loop: never more than ten ticks.
    pub fn effective_pull_expiry(&self) -> Duration {
        self.pull_expiry.min(self.poll_interval * 10)
    }

    /// Build settings from the host's instance JSON and decrypted secure map.
    pub fn from_instance_settings(
        json_data: &[u8],
        secure: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let options: InstanceOptions = if json_data.iter().all(|b| b.is_ascii_whitespace()) {
            InstanceOptions::default()
        } else {
            serde_json::from_slice(json_data)?
        };

        // Round-trip through JSON so unknown secure keys are ignored the same way.
        let secure: SecureOptions = serde_json::from_value(serde_json::to_value(secure)?)?;

        let mut settings = Self::from_parts(
            options.path,
            secure.api_key,
            secure.secret_key,
            options.username,
            options.password,
        )?;

        if let Some(ms) = options.poll_interval_ms {
            settings.poll_interval = poll_interval_from_ms(ms)?;
        }

        Ok(settings)
    }

    /// Build settings from `RELAY_*` environment variables (after loading `.env`).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

        let mut settings = Self::from_parts(
            var("RELAY_HOST"),
            var("RELAY_API_KEY"),
            var("RELAY_SECRET_KEY"),
            var("RELAY_USERNAME"),
            var("RELAY_PASSWORD"),
        )?;

        if let Some(raw) = var("RELAY_POLL_INTERVAL_MS") {
            let ms = raw.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                field: "RELAY_POLL_INTERVAL_MS",
                value: raw.clone(),
            })?;
            settings.poll_interval = poll_interval_from_ms(ms)?;
        }

        if let Some(mode) = var("RELAY_CREDENTIALS_MODE") {
            settings.credential_storage = match mode.as_str() {
                "memory" => CredentialStorage::InMemory,
                "file" => CredentialStorage::TempFile {
                    dir: var("RELAY_CREDENTIALS_DIR").map(PathBuf::from),
                },
                _ => {
                    return Err(ConfigError::InvalidValue {
                        field: "RELAY_CREDENTIALS_MODE",
                        value: mode,
                    })
                }
            };
        }

        Ok(settings)
    }

    fn from_parts(
        host: Option<String>,
        api_key: Option<String>,
        secret_key: Option<String>,
        username: Option<String>,
        password: Option<String>,
    ) -> Result<Self, ConfigError> {
        let host = non_empty(host).ok_or(ConfigError::MissingField("path"))?;
        let api_key = non_empty(api_key).ok_or(ConfigError::MissingField("apiKey"))?;

        let auth = match (non_empty(username), non_empty(password)) {
            (Some(username), Some(password)) => AuthMode::UserPassword { username, password },
            _ => AuthMode::TokenSeed {
                token: api_key.clone(),
                seed: non_empty(secret_key).ok_or(ConfigError::MissingField("secretKey"))?,
            },
        };

        Ok(Self::new(host, Identity { api_key, auth }))
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn poll_interval_from_ms(ms: u64) -> Result<Duration, ConfigError> {
    if ms == 0 {
        return Err(ConfigError::InvalidValue {
            field: "poll_interval_ms",
            value: ms.to_string(),
        });
    }
    Ok(Duration::from_millis(ms))
}
