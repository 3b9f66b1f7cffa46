//! Runtime configuration changes.

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

/// A change to the effective value of a single configuration key.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigChange {
    /// The dotted path of the key that changed.
    pub key: String,

    /// The effective value before the change, if the key was present.
    pub old_value: Option<JsonValue>,

    /// The effective value after the change, if the key is still present.
    pub new_value: Option<JsonValue>,
}

/// Watches a single configuration key for changes.
///
/// Created by [`GenericConfiguration::watch_field`][crate::GenericConfiguration::watch_field]. Only changes made after
/// the watcher was created are observed.
pub struct FieldWatcher {
    key: String,
    rx: broadcast::Receiver<ConfigChange>,
}

impl FieldWatcher {
    pub(crate) fn new(key: String, rx: broadcast::Receiver<ConfigChange>) -> Self {
        Self { key, rx }
    }

    /// Returns the key being watched.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Waits for the next change to the watched key, returning the new value.
    ///
    /// Changes whose new value is absent, or cannot be deserialized as `T`, are logged and skipped. Returns `None` once
    /// the originating configuration has been dropped and no further changes can arrive.
    pub async fn changed<T>(&mut self) -> Option<T>
    where
        T: DeserializeOwned,
    {
        loop {
            let change = match self.rx.recv().await {
                Ok(change) => change,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(key = %self.key, skipped, "Configuration watcher lagged behind. Older changes were dropped.");
                    continue;
                }
                Err(RecvError::Closed) => return None,
            };

            if change.key != self.key {
                continue;
            }

            let Some(new_value) = change.new_value else {
                debug!(key = %self.key, "Watched key was removed. Ignoring.");
                continue;
            };

            match serde_json::from_value::<T>(new_value) {
                Ok(value) => return Some(value),
                Err(e) => {
                    warn!(key = %self.key, error = %e, "Ignoring configuration change with an invalid value.");
                }
            }
        }
    }
}
