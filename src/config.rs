//! Configuration: named connections loaded from TOML, plus the runtime-only
//! override points passed when opening an instance.

use std::fmt;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::Codec;
use crate::db::Driver;
use crate::error::{DalError, Result};
use crate::uri::ConnectionUri;
use crate::value::Value;

/// Pool parameters. Part of the registry signature: the same URI opened with
/// different pool parameters yields a separate instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    pub max_size: usize,
    pub checkout_timeout_ms: u64,
    /// Connection attempts made at open time before giving up.
    pub connect_attempts: u32,
    /// Initial delay between connection attempts; doubles after each failure.
    pub backoff_ms: u64,
    /// How long `close` waits for in-flight checkouts before forcing.
    pub drain_grace_ms: u64,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_size: 10,
            checkout_timeout_ms: 2000,
            connect_attempts: 3,
            backoff_ms: 100,
            drain_grace_ms: 5000,
        }
    }
}

impl PoolOptions {
    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_millis(self.checkout_timeout_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationSettings {
    /// Folder for the persisted migration ledger. In-memory only when unset.
    pub folder: Option<PathBuf>,
}

/// One named connection as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub name: String,
    pub uri: String,
    /// Environment variable holding the password. Takes precedence over a
    /// password embedded in `uri`.
    #[serde(default)]
    pub password_env: Option<String>,
    #[serde(default)]
    pub pool: PoolOptions,
    /// Zone naive timestamps are stored in, as `+HH:MM`. UTC when unset.
    #[serde(default)]
    pub assumed_zone: Option<String>,
}

impl ConnectionConfig {
    pub fn resolve_uri(&self) -> Result<ConnectionUri> {
        let uri = ConnectionUri::parse(&self.uri)?;
        match &self.password_env {
            Some(var) => {
                let password = std::env::var(var).map_err(|_| {
                    DalError::Config(format!(
                        "connection {}: environment variable {var} is not set",
                        self.name
                    ))
                })?;
                Ok(uri.with_password(password))
            }
            None => Ok(uri),
        }
    }

    pub fn zone(&self) -> Result<FixedOffset> {
        match &self.assumed_zone {
            Some(z) => parse_zone(z).ok_or_else(|| {
                DalError::Config(format!("connection {}: bad assumed_zone {z:?}", self.name))
            }),
            None => Ok(utc()),
        }
    }

    pub fn open_options(&self, migrations: &MigrationSettings) -> Result<OpenOptions> {
        Ok(OpenOptions {
            pool: self.pool.clone(),
            assumed_zone: self.zone()?,
            migration_folder: migrations.folder.clone(),
            ..OpenOptions::default()
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DalConfig {
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
    #[serde(default)]
    pub migrations: MigrationSettings,
}

impl DalConfig {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("polydal")
            .join("polydal.toml")
    }

    /// Load from the default location. A missing file is an empty config.
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: DalConfig =
            toml::from_str(content).map_err(|e| DalError::Config(e.to_string()))?;
        for (i, c) in config.connections.iter().enumerate() {
            if config.connections[..i].iter().any(|o| o.name == c.name) {
                return Err(DalError::Config(format!("duplicate connection {}", c.name)));
            }
        }
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| DalError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn connection(&self, name: &str) -> Result<&ConnectionConfig> {
        self.connections
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| DalError::Config(format!("no connection named {name}")))
    }
}

pub(crate) fn utc() -> FixedOffset {
    Utc.fix()
}

/// `Z`, `UTC`, `+HH:MM`, `-HH:MM` or `+HHMM`.
pub fn parse_zone(input: &str) -> Option<FixedOffset> {
    let input = input.trim();
    if input.eq_ignore_ascii_case("z") || input.eq_ignore_ascii_case("utc") {
        return Some(utc());
    }
    let (sign, rest) = match input.as_bytes().first()? {
        b'+' => (1, &input[1..]),
        b'-' => (-1, &input[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

pub type UuidGenerator = Arc<dyn Fn() -> String + Send + Sync>;
pub type FieldCheck = Arc<dyn Fn(&Value) -> Option<String> + Send + Sync>;

/// A caller-supplied validation rule for one field.
#[derive(Clone)]
pub struct CustomValidator {
    pub table: String,
    pub field: String,
    pub check: FieldCheck,
}

/// Override points supplied at open time.
#[derive(Clone, Default)]
pub struct Hooks {
    pub uuid: Option<UuidGenerator>,
    pub validators: Vec<CustomValidator>,
    /// Replaces the backend's Parser/Representer pair.
    pub codec: Option<Arc<dyn Codec>>,
}

impl Hooks {
    pub fn with_uuid_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.uuid = Some(Arc::new(generator));
        self
    }

    pub fn with_validator<F>(mut self, table: &str, field: &str, check: F) -> Self
    where
        F: Fn(&Value) -> Option<String> + Send + Sync + 'static,
    {
        self.validators.push(CustomValidator {
            table: table.to_string(),
            field: field.to_string(),
            check: Arc::new(check),
        });
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub(crate) fn new_uuid(&self) -> String {
        match &self.uuid {
            Some(generate) => generate(),
            None => uuid::Uuid::new_v4().to_string(),
        }
    }

    pub(crate) fn validators_for<'a>(
        &'a self,
        table: &'a str,
        field: &'a str,
    ) -> impl Iterator<Item = &'a FieldCheck> + 'a {
        self.validators
            .iter()
            .filter(move |v| v.table == table && v.field == field)
            .map(|v| &v.check)
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("uuid", &self.uuid.as_ref().map(|_| "custom"))
            .field("validators", &self.validators.len())
            .field("codec", &self.codec)
            .finish()
    }
}

/// Everything `open` accepts besides the URI.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub pool: PoolOptions,
    pub assumed_zone: FixedOffset,
    pub migration_folder: Option<PathBuf>,
    /// Number of statements kept in the timings ring.
    pub timings_capacity: usize,
    /// Driver to use instead of the one registered for the URI's backend.
    pub driver: Option<Arc<dyn Driver>>,
    pub hooks: Hooks,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            pool: PoolOptions::default(),
            assumed_zone: utc(),
            migration_folder: None,
            timings_capacity: 100,
            driver: None,
            hooks: Hooks::default(),
        }
    }
}

impl OpenOptions {
    pub fn pool(mut self, pool: PoolOptions) -> Self {
        self.pool = pool;
        self
    }

    pub fn max_size(mut self, max_size: usize) -> Self {
        self.pool.max_size = max_size;
        self
    }

    pub fn checkout_timeout(mut self, timeout: Duration) -> Self {
        self.pool.checkout_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn assumed_zone(mut self, zone: FixedOffset) -> Self {
        self.assumed_zone = zone;
        self
    }

    pub fn migration_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.migration_folder = Some(folder.into());
        self
    }

    pub fn driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Parameters that distinguish registry entries for the same URI.
    pub(crate) fn signature_params(&self) -> impl Hash + '_ {
        (&self.pool, self.assumed_zone.local_minus_utc())
    }
}
