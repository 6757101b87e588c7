use std::{fs, io, path::Path, time::Duration};
use serde_json::{Map, Value};
use thiserror::Error;

/// option keys are looked up as `name`, then `long-polling.name`,
/// then `long-polling.json.name`; the most specific key wins
pub const TRANSPORT_PREFIX: &str = "long-polling.json";

pub const DEFAULT_INTERVAL: i64 = 0;
pub const DEFAULT_MAX_INTERVAL: i64 = 10_000;
pub const DEFAULT_TIMEOUT: i64 = 30_000;
pub const DEFAULT_COOKIE_NAME: &str = "BAYEUX_BROWSER";
pub const DEFAULT_MAX_SESSIONS_PER_BROWSER: i64 = 1;
pub const DEFAULT_MULTI_SESSION_INTERVAL: i64 = 2000;
pub const DEFAULT_DUPLICATE_STATUS: u16 = 500;
pub const DEFAULT_SWEEP_PERIOD: u64 = 997;
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read options: {0}")]
    Io(#[from] io::Error),

    #[error("cannot parse options: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("options must be a json object")]
    NotAnObject,

    #[error("option {name} must be {expected}")]
    InvalidType { name: String, expected: &'static str },
}

/// raw, flat option map as supplied by the embedder
#[derive(Debug, Clone, Default)]
pub struct Options {
    raw: Map<String, Value>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        match value {
            Value::Object(raw) => Ok(Self { raw }),
            _ => Err(ConfigError::NotAnObject)
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read(path)?;
        Self::from_value(serde_json::from_slice(&content)?)
    }

    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.raw.insert(name.to_string(), value.into());
        self
    }

    /// layered lookup: every dotted segment of `prefix` is applied
    /// cumulatively on top of the global key
    pub fn option(&self, prefix: &str, name: &str) -> Option<&Value> {
        let mut result = self.raw.get(name);
        if prefix.is_empty() {
            return result;
        }

        let mut pfx = String::new();
        for segment in prefix.split('.') {
            if !pfx.is_empty() {
                pfx.push('.');
            }
            pfx.push_str(segment);
            if let Some(value) = self.raw.get(&format!("{}.{}", pfx, name)) {
                result = Some(value);
            }
        }
        result
    }

    fn int(&self, prefix: &str, name: &str, default: i64) -> Result<i64, ConfigError> {
        match self.option(prefix, name) {
            None => Ok(default),
            Some(v) => v.as_i64().ok_or_else(|| invalid(name, "an integer"))
        }
    }

    fn boolean(&self, prefix: &str, name: &str, default: bool) -> Result<bool, ConfigError> {
        match self.option(prefix, name) {
            None => Ok(default),
            Some(v) => v.as_bool().ok_or_else(|| invalid(name, "a boolean"))
        }
    }

    fn string(&self, prefix: &str, name: &str) -> Result<Option<String>, ConfigError> {
        match self.option(prefix, name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(invalid(name, "a string"))
        }
    }
}

fn invalid(name: &str, expected: &'static str) -> ConfigError {
    ConfigError::InvalidType { name: name.to_string(), expected }
}

/// broker-wide settings
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub log_level: String,
    pub sweep_period: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            sweep_period: Duration::from_millis(DEFAULT_SWEEP_PERIOD),
        }
    }
}

impl ServerOptions {
    pub fn resolve(options: &Options) -> Result<Self, ConfigError> {
        let log_level = options.string("", "logLevel")?
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());
        let sweep_period = options.int("", "sweepPeriod", DEFAULT_SWEEP_PERIOD as i64)?;
        if sweep_period <= 0 {
            return Err(invalid("sweepPeriod", "a positive integer"));
        }
        Ok(Self {
            log_level,
            sweep_period: Duration::from_millis(sweep_period as u64),
        })
    }
}

/// long-polling transport settings, durations in milliseconds
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub interval: i64,
    pub max_interval: i64,
    pub timeout: i64,
    pub browser_cookie_name: String,
    pub browser_cookie_http_only: bool,
    pub browser_cookie_secure: bool,
    pub browser_cookie_same_site: Option<String>,
    /// negative disables the cap, zero disables suspension
    pub max_sessions_per_browser: i64,
    pub multi_session_interval: i64,
    pub duplicate_meta_connect_status: u16,
    pub max_body_size: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            max_interval: DEFAULT_MAX_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            browser_cookie_name: DEFAULT_COOKIE_NAME.to_string(),
            browser_cookie_http_only: true,
            browser_cookie_secure: false,
            browser_cookie_same_site: None,
            max_sessions_per_browser: DEFAULT_MAX_SESSIONS_PER_BROWSER,
            multi_session_interval: DEFAULT_MULTI_SESSION_INTERVAL,
            duplicate_meta_connect_status: DEFAULT_DUPLICATE_STATUS,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

impl TransportOptions {
    pub fn resolve(options: &Options) -> Result<Self, ConfigError> {
        let p = TRANSPORT_PREFIX;
        let status = options.int(p, "duplicateMetaConnectHttpResponseCode", DEFAULT_DUPLICATE_STATUS as i64)?;
        if !(100..=999).contains(&status) {
            return Err(invalid("duplicateMetaConnectHttpResponseCode", "an http status code"));
        }
        let max_body_size = options.int(p, "maxBodySize", DEFAULT_MAX_BODY_SIZE as i64)?;
        if max_body_size <= 0 {
            return Err(invalid("maxBodySize", "a positive integer"));
        }

        Ok(Self {
            interval: options.int(p, "interval", DEFAULT_INTERVAL)?,
            max_interval: options.int(p, "maxInterval", DEFAULT_MAX_INTERVAL)?,
            timeout: options.int(p, "timeout", DEFAULT_TIMEOUT)?,
            browser_cookie_name: options.string(p, "browserCookieName")?
                .unwrap_or_else(|| DEFAULT_COOKIE_NAME.to_string()),
            browser_cookie_http_only: options.boolean(p, "browserCookieHttpOnly", true)?,
            browser_cookie_secure: options.boolean(p, "browserCookieSecure", false)?,
            browser_cookie_same_site: options.string(p, "browserCookieSameSite")?,
            max_sessions_per_browser: options.int(p, "maxSessionsPerBrowser", DEFAULT_MAX_SESSIONS_PER_BROWSER)?,
            multi_session_interval: options.int(p, "multiSessionInterval", DEFAULT_MULTI_SESSION_INTERVAL)?,
            duplicate_meta_connect_status: status as u16,
            max_body_size: max_body_size as usize,
        })
    }
}
