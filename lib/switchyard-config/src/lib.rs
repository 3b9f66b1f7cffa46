//! Configuration loading and live updates for switchyard clients.
#![deny(missing_docs)]

use std::{
    borrow::Cow,
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use figment::{
    error::Kind,
    providers::{Env, Format as _, Json, Serialized, Yaml},
    Figment, Profile, Provider as _,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as JsonValue;
use snafu::{ResultExt as _, Snafu};
use tokio::sync::broadcast;
use tracing::debug;

pub mod dynamic;
use self::dynamic::{ConfigChange, FieldWatcher};

/// An opaque error type for failures that do not warrant a dedicated variant.
pub type GenericError = anyhow::Error;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// Environment variable prefix was empty.
    #[snafu(display("Environment variable prefix must not be empty."))]
    EmptyPrefix,

    /// A configuration file could not be read.
    #[snafu(display("Failed to read configuration file '{}'.", path.display()))]
    ReadFile {
        /// Path of the file.
        path: PathBuf,

        /// Error source.
        source: std::io::Error,
    },

    /// Requested field was missing from the configuration.
    #[snafu(display("Missing field '{}' in configuration. {}", field, help_text))]
    MissingField {
        /// Help text describing how to set the missing field.
        help_text: String,

        /// Name of the missing field.
        field: Cow<'static, str>,
    },

    /// Requested field had a different data type than expected.
    #[snafu(display(
        "Expected value for field '{}' to be '{}', got '{}' instead.",
        field,
        expected_ty,
        actual_ty
    ))]
    InvalidFieldType {
        /// Period-separated path to the field.
        field: String,

        /// Expected data type.
        expected_ty: String,

        /// Actual data type.
        actual_ty: String,
    },

    /// A field was present and well-typed, but its value is not acceptable.
    #[snafu(display("Invalid value for field '{}': {}", field, reason))]
    InvalidValue {
        /// Name of the invalid field.
        field: Cow<'static, str>,

        /// Why the value was rejected.
        reason: String,
    },

    /// Generic configuration error.
    #[snafu(display("Failed to query configuration."))]
    Generic {
        /// Error source.
        source: GenericError,
    },
}

impl ConfigurationError {
    /// Creates an `InvalidValue` error for the given field.
    pub fn invalid_value<F, R>(field: F, reason: R) -> Self
    where
        F: Into<Cow<'static, str>>,
        R: Into<String>,
    {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<figment::Error> for ConfigurationError {
    fn from(e: figment::Error) -> Self {
        from_figment_error(&BTreeSet::new(), e)
    }
}

/// Loads configuration from layered sources.
///
/// Sources added later take precedence over sources added earlier. Values registered with
/// [`with_default`][Self::with_default] sit underneath every other source regardless of when they were added.
#[derive(Default)]
pub struct ConfigurationLoader {
    defaults: Figment,
    figment: Figment,
    env_prefixes: BTreeSet<String>,
}

impl ConfigurationLoader {
    /// Registers a default value for the given key.
    pub fn with_default<V: Serialize>(mut self, key: &str, value: V) -> Self {
        self.defaults = self.defaults.merge(Serialized::default(key, value));
        self
    }

    /// Loads the given YAML configuration file.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or is not valid YAML, an error will be returned.
    pub fn from_yaml<P: AsRef<Path>>(mut self, path: P) -> Result<Self, ConfigurationError> {
        let contents = read_file(path.as_ref())?;
        let provider = Yaml::string(&contents);
        provider.data()?;

        self.figment = self.figment.merge(provider);
        Ok(self)
    }

    /// Loads the given YAML configuration file if it exists and is valid, otherwise leaves the loader unchanged.
    pub fn try_from_yaml<P: AsRef<Path>>(self, path: P) -> Self {
        let path = path.as_ref();
        let fallback = Self {
            defaults: self.defaults.clone(),
            figment: self.figment.clone(),
            env_prefixes: self.env_prefixes.clone(),
        };

        match self.from_yaml(path) {
            Ok(loader) => loader,
            Err(e) => {
                debug!(error = %e, file_path = %path.display(), "Unable to load YAML configuration file. Ignoring.");
                fallback
            }
        }
    }

    /// Loads the given JSON configuration file.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or is not valid JSON, an error will be returned.
    pub fn from_json<P: AsRef<Path>>(mut self, path: P) -> Result<Self, ConfigurationError> {
        let contents = read_file(path.as_ref())?;
        let provider = Json::string(&contents);
        provider.data()?;

        self.figment = self.figment.merge(provider);
        Ok(self)
    }

    /// Loads configuration from environment variables starting with the given prefix.
    ///
    /// An underscore is appended to the prefix if it does not already end with one, and matching is case-insensitive.
    /// Variables are captured at the time of this call.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, an error will be returned.
    pub fn from_environment(mut self, prefix: &str) -> Result<Self, ConfigurationError> {
        if prefix.is_empty() {
            return Err(ConfigurationError::EmptyPrefix);
        }

        let prefix = if prefix.ends_with('_') {
            prefix.to_uppercase()
        } else {
            format!("{}_", prefix.to_uppercase())
        };

        let values = Env::prefixed(&prefix).data()?;
        if let Some(dict) = values.get(&Profile::Default) {
            self.figment = self.figment.merge(Serialized::defaults(dict.clone()));
        }
        self.env_prefixes.insert(prefix);

        Ok(self)
    }

    /// Consumes the loader, deserializing the merged configuration as `T`.
    ///
    /// # Errors
    ///
    /// If the configuration could not be deserialized into `T`, an error will be returned.
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<T, ConfigurationError> {
        let env_prefixes = self.env_prefixes;
        self.defaults
            .merge(self.figment)
            .extract()
            .map_err(|e| from_figment_error(&env_prefixes, e))
    }

    /// Consumes the loader and wraps the merged configuration in a [`GenericConfiguration`].
    pub fn into_generic(self) -> GenericConfiguration {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        GenericConfiguration {
            inner: Arc::new(Inner {
                figment: RwLock::new(self.defaults.merge(self.figment)),
                env_prefixes: self.env_prefixes,
                changes,
            }),
        }
    }
}

fn read_file(path: &Path) -> Result<String, ConfigurationError> {
    std::fs::read_to_string(path).context(ReadFile { path })
}

#[derive(Debug)]
struct Inner {
    figment: RwLock<Figment>,
    env_prefixes: BTreeSet<String>,
    changes: broadcast::Sender<ConfigChange>,
}

/// A merged configuration, queryable by key and updatable at runtime.
///
/// Keys are dotted paths (`a.b.c`). When a nested key is not found, the lookup is retried with periods replaced by
/// underscores, which is how such keys appear when sourced from environment variables.
///
/// Cloning is cheap, and all clones observe the same updates.
#[derive(Clone, Debug)]
pub struct GenericConfiguration {
    inner: Arc<Inner>,
}

impl Default for GenericConfiguration {
    fn default() -> Self {
        ConfigurationLoader::default().into_generic()
    }
}

impl GenericConfiguration {
    fn read(&self) -> std::sync::RwLockReadGuard<'_, Figment> {
        self.inner.figment.read().unwrap_or_else(|e| e.into_inner())
    }

    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, ConfigurationError> {
        let figment = self.read();
        match figment.extract_inner(key) {
            Ok(value) => Ok(value),
            Err(e) if matches!(e.kind, Kind::MissingField(_)) && key.contains('.') => figment
                .extract_inner(&key.replace('.', "_"))
                .map_err(|e| from_figment_error(&self.inner.env_prefixes, e)),
            Err(e) => Err(from_figment_error(&self.inner.env_prefixes, e)),
        }
    }

    /// Gets a configuration value by key.
    ///
    /// # Errors
    ///
    /// If the key does not exist, or the value could not be deserialized into `T`, an error will be returned.
    pub fn get_typed<T: DeserializeOwned>(&self, key: &str) -> Result<T, ConfigurationError> {
        self.get(key)
    }

    /// Gets a configuration value by key, or `T::default()` if it is missing or invalid.
    pub fn get_typed_or_default<T: Default + DeserializeOwned>(&self, key: &str) -> T {
        self.get(key).unwrap_or_default()
    }

    /// Gets a configuration value by key, if it exists.
    ///
    /// # Errors
    ///
    /// If the key exists but could not be deserialized into `T`, an error will be returned.
    pub fn try_get_typed<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigurationError> {
        match self.get(key) {
            Ok(value) => Ok(Some(value)),
            Err(ConfigurationError::MissingField { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Deserializes the entire configuration as `T`.
    ///
    /// # Errors
    ///
    /// If the configuration could not be deserialized into `T`, an error will be returned.
    pub fn as_typed<T: DeserializeOwned>(&self) -> Result<T, ConfigurationError> {
        self.read()
            .extract()
            .map_err(|e| from_figment_error(&self.inner.env_prefixes, e))
    }

    /// Overrides the value of `key` at runtime.
    ///
    /// The override takes precedence over every loaded source. If the effective value of the key changes, a
    /// [`ConfigChange`] is delivered to every [`FieldWatcher`] created for it.
    ///
    /// # Errors
    ///
    /// If `value` cannot be serialized, an error will be returned and the configuration is left unchanged.
    pub fn update<V: Serialize>(&self, key: &str, value: V) -> Result<(), ConfigurationError> {
        let value = serde_json::to_value(value).map_err(|e| ConfigurationError::Generic { source: e.into() })?;

        let mut figment = self.inner.figment.write().unwrap_or_else(|e| e.into_inner());
        let old_value = find_json(&figment, key);
        let updated = figment.clone().merge(Serialized::default(key, value));
        let new_value = find_json(&updated, key);
        *figment = updated;
        drop(figment);

        if old_value != new_value {
            debug!(key, "Configuration value changed.");

            // No subscribers is not an error.
            let _ = self.inner.changes.send(ConfigChange {
                key: key.to_string(),
                old_value,
                new_value,
            });
        }

        Ok(())
    }

    /// Creates a watcher for changes to the given key.
    pub fn watch_field(&self, key: &str) -> FieldWatcher {
        FieldWatcher::new(key.to_string(), self.inner.changes.subscribe())
    }
}

fn find_json(figment: &Figment, key: &str) -> Option<JsonValue> {
    figment
        .find_value(key)
        .ok()
        .and_then(|value| serde_json::to_value(value).ok())
}

fn from_figment_error(env_prefixes: &BTreeSet<String>, e: figment::Error) -> ConfigurationError {
    match e.kind {
        Kind::MissingField(field) => {
            let mut candidates = vec![field.to_string()];
            candidates.extend(
                env_prefixes
                    .iter()
                    .map(|prefix| format!("{}{}", prefix, field.replace('.', "_").to_uppercase())),
            );

            ConfigurationError::MissingField {
                help_text: format!("Try setting `{}`.", candidates.join("` or `")),
                field,
            }
        }
        Kind::InvalidType(actual_ty, expected_ty) => ConfigurationError::InvalidFieldType {
            field: e.path.join("."),
            expected_ty,
            actual_ty: actual_ty.to_string(),
        },
        _ => ConfigurationError::Generic { source: e.into() },
    }
}
