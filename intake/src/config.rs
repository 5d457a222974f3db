//! The configuration store.
//!
//! Configuration is a single JSON document on disk. The [`Store`] holds the
//! last document that parsed and publishes every reload on a
//! `tokio::sync::watch` channel. A document that fails to parse never
//! replaces a good one.
//!
//! User settings are read-only to the process. The only write the store
//! performs is to the `systemGenerated` section, see
//! [`Store::update_system_generated`].

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::{
    fs,
    sync::watch,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::rotation::Policy;

/// Default location of the configuration document.
pub const DEFAULT_CONFIG_PATH: &str = "analytics-config.json";
/// Default interval between polls of the configuration document.
pub const DEFAULT_WATCH_PERIOD: Duration = Duration::from_secs(1);
/// `systemGenerated` key holding the token status callers must present.
pub const ACCESS_TOKEN_KEY: &str = "webStatusApiAccessToken";

/// Errors produced by [`Store`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error reading the configuration file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// Error writing the configuration file
    #[error("Failed to write config file {path:?}: {source}")]
    WriteFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// The document is not a valid configuration.
    #[error("Failed to deserialize config: {0}")]
    Json(#[from] serde_json::Error),
}

/// The configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Monotonic document version. The watcher reloads only on an increase.
    #[serde(default)]
    pub config_version: u64,
    /// Applications whose events are accepted. `*` accepts any.
    #[serde(default)]
    pub allowed_app_names: Vec<String>,
    /// Whether the status APIs are served.
    #[serde(default)]
    pub web_status_apis_enabled: bool,
    /// Rotation policy. When absent the rotation engine keeps the policy it
    /// already runs.
    #[serde(default)]
    pub rotate_dump_files: Option<Policy>,
    /// Per-account, per-application settings. The `*` application is the
    /// account-wide default.
    #[serde(default)]
    pub account_config: FxHashMap<String, FxHashMap<String, Value>>,
    /// Settings written by the process itself.
    #[serde(default)]
    pub system_generated: Map<String, Value>,
    /// Fields intake does not interpret, preserved on write-back.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Config {
    /// Settings for `app_name` in `account`: the application's own entry,
    /// else the account's `*` entry, else an empty object.
    #[must_use]
    pub fn app_config(&self, account: &str, app_name: &str) -> Value {
        self.account_config
            .get(account)
            .and_then(|apps| apps.get(app_name).or_else(|| apps.get("*")))
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()))
    }

    /// A value from the `systemGenerated` section.
    #[must_use]
    pub fn system_generated(&self, key: &str) -> Option<&Value> {
        self.system_generated.get(key)
    }

    /// Whether events from `app_name` are accepted.
    #[must_use]
    pub fn is_allowed_app(&self, app_name: &str) -> bool {
        if app_name.is_empty() {
            return false;
        }
        self.allowed_app_names
            .iter()
            .any(|allowed| allowed == "*" || allowed == app_name)
    }
}

async fn read(path: &Path) -> Result<Config, Error> {
    let contents = fs::read_to_string(path)
        .await
        .map_err(|source| Error::ReadFile {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
    Ok(serde_json::from_str(&contents)?)
}

/// Holds the current configuration and publishes reloads.
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    sender: watch::Sender<Arc<Config>>,
}

impl Store {
    /// Load the document at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let config = read(&path).await?;
        info!(path = %path.display(), ?config, "configuration loaded");
        let (sender, _) = watch::channel(Arc::new(config));
        Ok(Self { path, sender })
    }

    /// Path of the backing document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The current configuration.
    #[must_use]
    pub fn current(&self) -> Arc<Config> {
        self.sender.borrow().clone()
    }

    /// Receive every configuration published from now on.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<Config>> {
        self.sender.subscribe()
    }

    /// Settings for `app_name` in `account`, see [`Config::app_config`].
    #[must_use]
    pub fn app_config(&self, account: &str, app_name: &str) -> Value {
        self.sender.borrow().app_config(account, app_name)
    }

    fn publish(&self, config: Config) -> Arc<Config> {
        info!(?config, "configuration updated");
        let config = Arc::new(config);
        self.sender.send_replace(Arc::clone(&config));
        config
    }

    /// Re-read the document and publish it unconditionally.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed. The current
    /// configuration is kept.
    pub async fn reload(&self) -> Result<Arc<Config>, Error> {
        let config = read(&self.path).await?;
        Ok(self.publish(config))
    }

    /// Re-read the document and publish it only if its `configVersion` is
    /// greater than the current one. Returns whether it was published.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed. The current
    /// configuration is kept.
    pub async fn reload_if_newer(&self) -> Result<bool, Error> {
        let config = read(&self.path).await?;
        let current = self.sender.borrow().config_version;
        if config.config_version > current {
            debug!(from = current, to = config.config_version, "configuration version bumped");
            self.publish(config);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Set `key` in the `systemGenerated` section of the document on disk,
    /// then reload it.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be read, parsed or written.
    pub async fn update_system_generated(&self, key: &str, value: Value) -> Result<(), Error> {
        let mut config = (*self.reload().await?).clone();
        config.system_generated.insert(key.to_string(), value);
        let contents = serde_json::to_string_pretty(&config)?;
        fs::write(&self.path, contents)
            .await
            .map_err(|source| Error::WriteFile {
                path: self.path.clone(),
                source: Box::new(source),
            })?;
        self.reload().await?;
        Ok(())
    }

    /// Poll the document every `period` until shutdown, publishing it when
    /// its version increases. Unreadable or malformed documents are logged
    /// and skipped.
    pub async fn watch(&self, period: Duration, shutdown: intake_signal::Watcher) {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown_wait = shutdown.recv();
        tokio::pin!(shutdown_wait);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.reload_if_newer().await {
                        warn!(path = %self.path.display(), %err, "configuration rejected, keeping current");
                    }
                }
                () = &mut shutdown_wait => {
                    info!("shutdown signal received");
                    return;
                }
            }
        }
    }
}
