use std::path::Path;
use std::time::Duration;
use std::{fs, io};

use serde::Deserialize;
use thiserror::Error;

use crate::types::record::DEFAULT_TUBE;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config: {0}")]
    Io(#[from] io::Error),
    #[error("parsing config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Tunables for a [`Queue`](crate::Queue). Every field has a default, so an
/// empty YAML document is a valid config.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Tube used and watched by a new queue.
    pub default_tube: String,
    /// How long `reserve` sleeps between polls, in milliseconds.
    pub poll_interval_ms: u64,
    /// Only allow deleting jobs that are reserved or buried, as beanstalkd
    /// does. Off by default: any job can be deleted.
    pub strict_delete: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_tube: DEFAULT_TUBE.to_owned(),
            poll_interval_ms: 1000,
            strict_delete: false,
        }
    }
}

impl QueueConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_yaml(&fs::read_to_string(path)?)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
