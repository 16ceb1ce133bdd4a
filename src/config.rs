use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::error::SqlConduitError;

const DEFAULT_PORT: u16 = 1433;

/// Options for a client and the pool behind it.
///
/// Durations are given in seconds when loaded from JSON:
/// ```rust
/// use sql_conduit::config::ClientOptions;
///
/// let opts = ClientOptions::from_json(
///     r#"{ "server": "db1", "database": "sales", "user": "app", "password": "pw",
///          "max_pool_size": 8, "command_timeout_secs": 5 }"#,
/// )
/// .unwrap();
/// assert_eq!(opts.max_pool_size, 8);
/// assert!(opts.pooling);
/// ```
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    pub server: String,
    pub port: Option<u16>,
    pub instance_name: Option<String>,
    pub database: String,
    pub user: String,
    pub password: String,
    pub pooling: bool,
    pub min_pool_size: u32,
    pub max_pool_size: u32,
    #[serde(rename = "connect_timeout_secs", with = "secs")]
    pub connect_timeout: Duration,
    #[serde(rename = "command_timeout_secs", with = "opt_secs")]
    pub command_timeout: Option<Duration>,
    /// Reported to the server for diagnostics only.
    pub application_name: Option<String>,
    /// Reported to the server for diagnostics only.
    pub workstation_id: Option<String>,
    pub translate_placeholders: bool,
    /// Bound of each per-result record channel.
    pub stream_capacity: usize,
    /// Bound of the channel carrying result handles.
    pub result_capacity: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            server: "localhost".into(),
            port: None,
            instance_name: None,
            database: String::new(),
            user: String::new(),
            password: String::new(),
            pooling: true,
            min_pool_size: 0,
            max_pool_size: 100,
            connect_timeout: Duration::from_secs(15),
            command_timeout: Some(Duration::from_secs(30)),
            application_name: None,
            workstation_id: None,
            translate_placeholders: false,
            stream_capacity: 32,
            result_capacity: 4,
        }
    }
}

// Never print the password.
impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("instance_name", &self.instance_name)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("pooling", &self.pooling)
            .field("min_pool_size", &self.min_pool_size)
            .field("max_pool_size", &self.max_pool_size)
            .field("connect_timeout", &self.connect_timeout)
            .field("command_timeout", &self.command_timeout)
            .field("application_name", &self.application_name)
            .field("workstation_id", &self.workstation_id)
            .finish_non_exhaustive()
    }
}

impl ClientOptions {
    #[must_use]
    pub fn new(server: String, database: String, user: String, password: String) -> Self {
        Self {
            server,
            database,
            user,
            password,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn builder(
        server: String,
        database: String,
        user: String,
        password: String,
    ) -> ClientOptionsBuilder {
        ClientOptionsBuilder::new(server, database, user, password)
    }

    /// Load options from a JSON document; missing keys keep their defaults.
    ///
    /// # Errors
    /// Returns `SqlConduitError::ConfigError` on malformed JSON or inconsistent pool sizes.
    pub fn from_json(json: &str) -> Result<Self, SqlConduitError> {
        let opts: ClientOptions = serde_json::from_str(json)?;
        opts.validate()?;
        Ok(opts)
    }

    /// # Errors
    /// Returns `SqlConduitError::ConfigError` when the pool bounds or channel sizes are unusable.
    pub fn validate(&self) -> Result<(), SqlConduitError> {
        if self.max_pool_size == 0 {
            return Err(SqlConduitError::ConfigError(
                "max_pool_size must be at least 1".into(),
            ));
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(SqlConduitError::ConfigError(format!(
                "min_pool_size ({}) exceeds max_pool_size ({})",
                self.min_pool_size, self.max_pool_size
            )));
        }
        if self.stream_capacity == 0 || self.result_capacity == 0 {
            return Err(SqlConduitError::ConfigError(
                "stream and result capacities must be non-zero".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    /// Pool key for these options.
    #[must_use]
    pub fn identity(&self) -> ConnectionIdentity {
        ConnectionIdentity::new(
            &self.server,
            self.port_or_default(),
            self.instance_name.as_deref(),
            &self.database,
            &self.user,
            &self.password,
        )
    }
}

/// Fluent builder for client options.
#[derive(Debug, Clone)]
pub struct ClientOptionsBuilder {
    opts: ClientOptions,
}

impl ClientOptionsBuilder {
    #[must_use]
    pub fn new(server: String, database: String, user: String, password: String) -> Self {
        Self {
            opts: ClientOptions::new(server, database, user, password),
        }
    }

    #[must_use]
    pub fn port(mut self, port: Option<u16>) -> Self {
        self.opts.port = port;
        self
    }

    #[must_use]
    pub fn instance_name(mut self, instance_name: Option<String>) -> Self {
        self.opts.instance_name = instance_name;
        self
    }

    #[must_use]
    pub fn pooling(mut self, pooling: bool) -> Self {
        self.opts.pooling = pooling;
        self
    }

    #[must_use]
    pub fn pool_size(mut self, min: u32, max: u32) -> Self {
        self.opts.min_pool_size = min;
        self.opts.max_pool_size = max;
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.opts.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.opts.command_timeout = timeout;
        self
    }

    #[must_use]
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.opts.application_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn workstation_id(mut self, id: impl Into<String>) -> Self {
        self.opts.workstation_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn translation(mut self, translate_placeholders: bool) -> Self {
        self.opts.translate_placeholders = translate_placeholders;
        self
    }

    #[must_use]
    pub fn stream_capacity(mut self, records: usize, results: usize) -> Self {
        self.opts.stream_capacity = records;
        self.opts.result_capacity = results;
        self
    }

    /// # Errors
    /// Returns `SqlConduitError::ConfigError` if the options are inconsistent.
    pub fn finish(self) -> Result<ClientOptions, SqlConduitError> {
        self.opts.validate()?;
        Ok(self.opts)
    }
}

/// Identity a pooled connection is keyed by: server, database and credentials.
///
/// The password is part of the key so different credentials never share sessions; it is never
/// printed.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConnectionIdentity {
    pub server: String,
    pub port: u16,
    pub instance_name: Option<String>,
    pub database: String,
    pub user: String,
    password: String,
}

impl ConnectionIdentity {
    #[must_use]
    pub fn new(
        server: &str,
        port: u16,
        instance_name: Option<&str>,
        database: &str,
        user: &str,
        password: &str,
    ) -> Self {
        Self {
            server: server.to_lowercase(),
            port,
            instance_name: instance_name.map(str::to_lowercase),
            database: database.to_string(),
            user: user.to_string(),
            password: password.to_string(),
        }
    }
}

impl fmt::Debug for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionIdentity")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("instance_name", &self.instance_name)
            .field("database", &self.database)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}/{}", self.user, self.server, self.port, self.database)
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Duration>, D::Error> {
        match Option::<f64>::deserialize(d)? {
            Some(secs) if secs > 0.0 => Duration::try_from_secs_f64(secs)
                .map(Some)
                .map_err(serde::de::Error::custom),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_defaults_and_overrides() {
        let opts = ClientOptions::from_json(
            r#"{"server":"DB1","database":"sales","user":"app","password":"secret",
                "pooling":false,"connect_timeout_secs":2.5,"command_timeout_secs":null}"#,
        )
        .expect("valid json");
        assert!(!opts.pooling);
        assert_eq!(opts.connect_timeout, Duration::from_millis(2500));
        assert_eq!(opts.command_timeout, None);
        assert_eq!(opts.max_pool_size, 100);
        assert!(!format!("{opts:?}").contains("secret"));
    }

    #[test]
    fn rejects_inverted_pool_bounds() {
        let err = ClientOptions::builder("s".into(), "d".into(), "u".into(), "p".into())
            .pool_size(5, 2)
            .finish()
            .unwrap_err();
        assert!(matches!(err, SqlConduitError::ConfigError(_)));
    }

    #[test]
    fn identity_distinguishes_credentials_not_server_case() {
        let a = ConnectionIdentity::new("DB1", 1433, None, "sales", "app", "pw1");
        let b = ConnectionIdentity::new("db1", 1433, None, "sales", "app", "pw1");
        let c = ConnectionIdentity::new("db1", 1433, None, "sales", "app", "pw2");
        assert_eq!(a, b);
        assert_ne!(b, c);
        assert_eq!(a.to_string(), "app@db1:1433/sales");
        assert!(!format!("{c:?}").contains("pw2"));
    }

    #[test]
    fn identity_keys_on_the_whole_password() {
        let long = "x".repeat(64);
        let a = ConnectionIdentity::new("db1", 1433, None, "sales", "app", &long);
        let b = ConnectionIdentity::new("db1", 1433, None, "sales", "app", &format!("{long}y"));
        assert_ne!(a, b);

        let mut pools = std::collections::HashMap::new();
        pools.insert(a.clone(), 1);
        pools.insert(b, 2);
        assert_eq!(pools.len(), 2);
        assert_eq!(pools.get(&a), Some(&1));
        assert!(!format!("{a:?}").contains(&long));
        assert!(!a.to_string().contains(&long));
    }
}
