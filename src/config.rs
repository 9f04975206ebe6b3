// file: config.rs
// desc: runtime settings for the model download

use std::time::Duration;

/// Where the served `MnistModel` record lives by default.
pub const DEFAULT_MODEL_URL: &str = "http://localhost:8080/mnist.bin";
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

pub const MODEL_URL_VAR: &str = "GUESS_NUMBER_MODEL_URL";
pub const FETCH_TIMEOUT_VAR: &str = "GUESS_NUMBER_FETCH_TIMEOUT_SECS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub model_url: String,
    pub fetch_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model_url: DEFAULT_MODEL_URL.to_string(),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

impl AppConfig {
    pub fn with_model_url(mut self, url: impl Into<String>) -> Self {
        self.model_url = url.into();
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Defaults overridden by `GUESS_NUMBER_MODEL_URL` and
    /// `GUESS_NUMBER_FETCH_TIMEOUT_SECS`. Unparseable values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup(MODEL_URL_VAR).filter(|url| !url.trim().is_empty()) {
            config.model_url = url.trim().to_string();
        }

        if let Some(raw) = lookup(FETCH_TIMEOUT_VAR) {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => config.fetch_timeout = Duration::from_secs(secs),
                _ => log::warn!("Ignoring {}={:?}, expected a positive number of seconds", FETCH_TIMEOUT_VAR, raw),
            }
        }

        config
    }
}
