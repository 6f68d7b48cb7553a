use crate::error::{Error, Result};
use std::env;
use std::fmt;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://api.trace.moe";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

pub const ENV_API_URL: &str = "TRACEMOE_API_URL";
pub const ENV_API_KEY: &str = "TRACEMOE_API_KEY";
pub const ENV_TIMEOUT: &str = "TRACEMOE_TIMEOUT";
pub const ENV_PROXY: &str = "TRACEMOE_PROXY";

#[derive(Clone)]
pub struct Config {
    pub api_url: String,
    /// Sent as `x-trace-key`. Anonymous requests are limited by IP.
    pub api_key: Option<String>,
    /// Bounds the whole request, body included.
    pub timeout: Duration,
    pub proxy: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            api_key: None,
            timeout: DEFAULT_TIMEOUT,
            proxy: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("api_url", &self.api_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .field("proxy", &self.proxy)
            .finish()
    }
}

impl Config {
    /// Reads `TRACEMOE_API_URL`, `TRACEMOE_API_KEY`, `TRACEMOE_TIMEOUT`
    /// (seconds) and `TRACEMOE_PROXY`, falling back to the defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let mut config = Config::default();

        if let Some(url) = non_empty(ENV_API_URL) {
            config.api_url = url;
        }
        config.api_key = non_empty(ENV_API_KEY);
        config.proxy = non_empty(ENV_PROXY);

        if let Some(raw) = non_empty(ENV_TIMEOUT) {
            let secs: f64 = raw.trim().parse().map_err(|_| {
                Error::InvalidArgument(format!(
                    "{} must be a number of seconds, got {:?}",
                    ENV_TIMEOUT, raw
                ))
            })?;
            config.timeout = Duration::try_from_secs_f64(secs).map_err(|e| {
                Error::InvalidArgument(format!("{} is out of range: {}", ENV_TIMEOUT, e))
            })?;
        }

        Ok(config)
    }
}
