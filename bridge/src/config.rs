use crate::errors::{Error, Result};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Everything the bridge needs to run, passed explicitly to `Bridge::start`.
#[derive(Debug, Clone)]
pub struct Settings {
    pub broker_host: String,
    pub broker_port: u16,
    /// MQTT client id; also the instance identity suffixed onto request/response topics.
    pub client_id: String,
    pub credentials: Option<Credentials>,
    pub keepalive: Duration,
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub database_path: PathBuf,
    pub http_addr: String,
    pub channel_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: "mqtt_client_1".to_string(),
            credentials: None,
            keepalive: Duration::from_secs(60),
            reconnect_base_delay: Duration::from_secs(5),
            max_reconnect_attempts: 10,
            database_path: PathBuf::from("mqtt_data.db"),
            http_addr: "0.0.0.0:8080".to_string(),
            channel_capacity: 1024,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds settings from any key/value source, falling back to defaults for
    /// unset keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Settings::default();

        let credentials = match (lookup("MQTT_USERNAME"), lookup("MQTT_PASSWORD")) {
            (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
                Some(Credentials { username, password })
            }
            _ => None,
        };

        let settings = Settings {
            broker_host: lookup("MQTT_BROKER_HOST").unwrap_or(defaults.broker_host),
            broker_port: parse_var(&lookup, "MQTT_BROKER_PORT", defaults.broker_port)?,
            client_id: lookup("MQTT_CLIENT_ID").unwrap_or(defaults.client_id),
            credentials,
            keepalive: Duration::from_secs(parse_var(
                &lookup,
                "MQTT_KEEPALIVE_SECS",
                defaults.keepalive.as_secs(),
            )?),
            reconnect_base_delay: Duration::from_secs(parse_var(
                &lookup,
                "RECONNECT_DELAY_SECS",
                defaults.reconnect_base_delay.as_secs(),
            )?),
            max_reconnect_attempts: parse_var(
                &lookup,
                "MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            )?,
            database_path: lookup("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            http_addr: lookup("HTTP_ADDR").unwrap_or(defaults.http_addr),
            channel_capacity: parse_var(&lookup, "CHANNEL_CAPACITY", defaults.channel_capacity)?,
        };

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.broker_host.trim().is_empty() {
            return Err(Error::Config("MQTT_BROKER_HOST must not be empty".to_string()));
        }
        if self.client_id.is_empty() {
            return Err(Error::Config("MQTT_CLIENT_ID must not be empty".to_string()));
        }
        if self.client_id.contains(['/', '+', '#']) {
            return Err(Error::Config(format!(
                "MQTT_CLIENT_ID {:?} cannot be used as a topic segment",
                self.client_id
            )));
        }
        if self.keepalive.is_zero() {
            return Err(Error::Config("MQTT_KEEPALIVE_SECS must be positive".to_string()));
        }
        if self.max_reconnect_attempts == 0 {
            return Err(Error::Config("MAX_RECONNECT_ATTEMPTS must be positive".to_string()));
        }
        if self.channel_capacity == 0 {
            return Err(Error::Config("CHANNEL_CAPACITY must be positive".to_string()));
        }
        Ok(())
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{}={:?}: {}", key, raw, e))),
    }
}
