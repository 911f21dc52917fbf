//! Dispatcher limits.

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

pub const DEFAULT_MAX_REQUESTS: usize = 64;
pub const DEFAULT_MAX_REQUESTS_PER_HOST: usize = 5;

const MAX_REQUESTS_ENV: &str = "CALLGATE_MAX_REQUESTS";
const MAX_REQUESTS_PER_HOST_ENV: &str = "CALLGATE_MAX_REQUESTS_PER_HOST";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Maximum number of calls running at once.
    pub max_requests: usize,
    /// Maximum number of non-duplex calls running at once against one host.
    pub max_requests_per_host: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_MAX_REQUESTS,
            max_requests_per_host: DEFAULT_MAX_REQUESTS_PER_HOST,
        }
    }
}

impl DispatcherConfig {
    /// Defaults overridden by `CALLGATE_MAX_REQUESTS` and
    /// `CALLGATE_MAX_REQUESTS_PER_HOST` when set.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(value) = lookup(MAX_REQUESTS_ENV) {
            config.max_requests = parse_limit(MAX_REQUESTS_ENV, &value)?;
        }
        if let Some(value) = lookup(MAX_REQUESTS_PER_HOST_ENV) {
            config.max_requests_per_host = parse_limit(MAX_REQUESTS_PER_HOST_ENV, &value)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_max_requests(mut self, max: usize) -> Self {
        self.max_requests = max;
        self
    }

    pub fn with_max_requests_per_host(mut self, max: usize) -> Self {
        self.max_requests_per_host = max;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_requests < 1 {
            return Err(DispatchError::InvalidLimit {
                name: "max_requests",
                value: self.max_requests,
            });
        }
        if self.max_requests_per_host < 1 {
            return Err(DispatchError::InvalidLimit {
                name: "max_requests_per_host",
                value: self.max_requests_per_host,
            });
        }
        Ok(())
    }
}

fn parse_limit(key: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|e| DispatchError::Config(format!("{key}={value:?}: {e}")))
}
