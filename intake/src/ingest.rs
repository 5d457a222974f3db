//! Validation and acceptance of client analytics events.
//!
//! An event is a JSON object carrying at least `schemaVersion`, `appName`,
//! `uuid` and `sessionID`. Accepted events are serialized and appended to
//! their application's dump session; every outcome is counted in the status
//! aggregator.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use crate::{
    config::{ACCESS_TOKEN_KEY, Config},
    rotation,
    status::{self, Tier},
};

/// The only event schema accepted.
pub const SCHEMA_VERSION: u64 = 1;

/// Rolling counters of one tier, keyed by metric name, oldest slot first.
pub type Window = FxHashMap<String, Vec<u64>>;

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Ingest`]
pub enum Error {
    /// The event could not be written to its dump session.
    #[error(transparent)]
    Rotation(#[from] rotation::Error),
    /// The event could not be serialized.
    #[error("Failed to serialize event: {0}")]
    Json(#[from] serde_json::Error),
    /// Status APIs are disabled or the access token does not match.
    #[error("Not Authorised to access server status")]
    NotAuthorised,
    /// The requested timeframe is not a known code.
    #[error(transparent)]
    Timeframe(#[from] status::Error),
}

/// Whether an event was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Accepted {
    /// Accepted
    Ok,
    /// Rejected
    No,
}

/// Answer to a client submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// HTTP status of the answer.
    #[serde(skip)]
    pub status_code: u16,
    /// Whether the event was accepted.
    pub accepted: Accepted,
    /// Whether the client should back off.
    pub server_busy: bool,
    /// Validation failures, empty on success.
    pub errors: Vec<String>,
}

impl Response {
    fn accepted() -> Self {
        Self {
            status_code: 200,
            accepted: Accepted::Ok,
            server_busy: false,
            errors: Vec::new(),
        }
    }

    fn rejected(status_code: u16, errors: Vec<String>) -> Self {
        Self {
            status_code,
            accepted: Accepted::No,
            server_busy: false,
            errors,
        }
    }
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_) | Value::Object(_)) => true,
    }
}

/// Check `event` against the accepted schema. Returns every failure, empty
/// when the event is valid.
#[must_use]
pub fn validate(event: &Value, config: &Config) -> Vec<String> {
    let mut errors = Vec::new();
    if event.get("schemaVersion").and_then(Value::as_u64) != Some(SCHEMA_VERSION) {
        errors.push("Invalid schemaVersion".to_string());
    }
    let app_name = event.get("appName").and_then(Value::as_str).unwrap_or("");
    if !config.is_allowed_app(app_name) {
        errors.push("Invalid appName".to_string());
    }
    if !truthy(event.get("uuid")) {
        errors.push("Invalid uuid".to_string());
    }
    if !truthy(event.get("sessionID")) {
        errors.push("Invalid sessionID".to_string());
    }
    errors
}

/// Accepts events into the dump and status pipelines.
#[derive(Debug, Clone)]
pub struct Ingest {
    rotation: rotation::Handle,
    status: status::Handle,
    config: watch::Receiver<Arc<Config>>,
}

impl Ingest {
    /// Create a new [`Ingest`].
    #[must_use]
    pub fn new(
        rotation: rotation::Handle,
        status: status::Handle,
        config: watch::Receiver<Arc<Config>>,
    ) -> Self {
        Self {
            rotation,
            status,
            config,
        }
    }

    /// Validate `event` and, if valid, append it to its application's dump.
    ///
    /// # Errors
    ///
    /// Returns an error if a valid event cannot be written. Invalid events are
    /// not errors; they produce a rejected [`Response`].
    pub async fn process(&self, event: &Value) -> Result<Response, Error> {
        let errors = {
            let config = self.config.borrow();
            validate(event, &config)
        };
        if !errors.is_empty() {
            debug!(?errors, "event rejected");
            self.status.increment("events.rejected", 1);
            return Ok(Response::rejected(400, errors));
        }

        let app_name = event
            .get("appName")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let payload = serde_json::to_string(event)?;
        let bytes = payload.len() as u64;
        self.rotation.append(app_name, payload).await?;

        self.status.increment("events.accepted", 1);
        self.status.increment("events.bytes", bytes);
        Ok(Response::accepted())
    }

    /// The rolling counters of `timeframe`, one of `ss`, `mm`, `hh` or `dd`.
    ///
    /// # Errors
    ///
    /// Returns an error if `timeframe` is not a known code.
    pub fn server_stats(&self, timeframe: &str) -> Result<Window, status::Error> {
        let tier: Tier = timeframe.parse()?;
        Ok(self.status.window(tier))
    }

    /// [`Ingest::server_stats`] for an outside caller. Served only while
    /// `webStatusApisEnabled` is set and `access_token` matches the
    /// `webStatusApiAccessToken` in `systemGenerated`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotAuthorised` when the caller may not read status, or
    /// `Error::Timeframe` for an unknown `timeframe`.
    pub fn status_report(&self, access_token: &str, timeframe: &str) -> Result<Window, Error> {
        let authorised = {
            let config = self.config.borrow();
            config.web_status_apis_enabled
                && config
                    .system_generated(ACCESS_TOKEN_KEY)
                    .and_then(Value::as_str)
                    == Some(access_token)
        };
        if !authorised {
            debug!("status report refused");
            return Err(Error::NotAuthorised);
        }
        Ok(self.server_stats(timeframe)?)
    }
}
