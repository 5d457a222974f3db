//! Per-application dump sessions.
//!
//! Every application with pending events owns exactly one open dump file, a
//! 'session'. The first append for an application creates the session; a
//! seal closes it and hands back a [`Descriptor`] for rotation. After a seal
//! the application has no session until its next append.
//!
//! ## File format
//!
//! A session file is a single JSON object. Downstream consumers parse it
//! whole, so the framing below must not drift:
//!
//! ```text
//! {
//!    "appName" : "app1",
//!    "schemaVersion" : 1,
//!    "unixTimestampUTCAtServer" : 1643043376,
//!    "clientAnalytics":[
//!         {...event...},
//!         {...event...},
//!         {"endTime": 1643043976}]
//! }
//! ```
//!
//! Each event is written as a tab, the raw payload and a trailing comma. The
//! seal writes the `endTime` marker that closes the array, so a sealed file is
//! always well formed.
//!
//! ## Metrics
//!
//! `dump_bytes_written`: Payload bytes appended, labelled by `app`
//! `dump_sessions_opened`: Sessions created
//! `dump_sessions_sealed`: Sessions sealed
//!
use std::{
    collections::hash_map::Entry,
    io,
    path::{Path, PathBuf},
};

use metrics::counter;
use rustc_hash::FxHashMap;
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, info};

use crate::clock;

/// The `schemaVersion` written into every session header.
pub const SCHEMA_VERSION: u32 = 1;

/// Default directory for session files, relative to the working directory.
pub const DEFAULT_ROOT: &str = "data";

const MAX_NAME_ATTEMPTS: u32 = 1_000;

/// An enum to allow us to determine what operation caused an IO error as the
/// default error message lacks detail.
#[derive(Debug, Clone, Copy)]
pub enum IoOp {
    /// Operation for `fs::create_dir_all`
    CreateDirAll,
    /// Operation for `fs::OpenOptions` etc
    Open,
    /// Operation for `write_all`
    Write,
    /// Operation for `flush`
    Flush,
}

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Manager`].
pub enum Error {
    /// Wrapper around [`std::io::Error`].
    #[error("IO error [{path}] during {operation:?}: {err}")]
    Io {
        /// The path being operated on
        path: PathBuf,
        /// The operation
        operation: IoOp,
        /// The error
        err: std::io::Error,
    },
    /// The application name cannot be used as a file name component.
    #[error("Invalid application name: {0:?}")]
    InvalidAppName(String),
}

/// Emitted on every successful append, carrying the session's state after the
/// append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Updated {
    /// Application owning the session
    pub app_name: String,
    /// Path of the session file
    pub path: PathBuf,
    /// Bytes written to the session so far
    pub bytes_written: u64,
}

/// Final state of a sealed session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Application owning the session
    pub app_name: String,
    /// File name of the session, without directory
    pub file_name: String,
    /// Full path of the session file
    pub path: PathBuf,
    /// Header plus payload bytes written
    pub bytes_written: u64,
    /// Unix seconds at session creation
    pub start_time: i64,
    /// Unix seconds at seal
    pub end_time: i64,
    /// UTC year at creation
    pub year: i32,
    /// UTC month at creation, 1-based
    pub month: u8,
    /// UTC day of month at creation
    pub day: u8,
}

#[derive(Debug)]
struct Session {
    file_name: String,
    path: PathBuf,
    start_time: i64,
    year: i32,
    month: u8,
    day: u8,
    bytes_written: u64,
    named_at: OffsetDateTime,
    fp: fs::File,
}

/// Session file name for `app_name` created at `at`.
///
/// Fields are not zero padded and the month is zero based, matching the
/// names consumers of the archive already parse:
/// `<app>.<year>-<month>-<day>-<hour>-<minute>-<second>-<ms>.v1.json`.
#[must_use]
pub fn file_name(app_name: &str, at: OffsetDateTime) -> String {
    format!(
        "{app_name}.{}-{}-{}-{}-{}-{}-{}.v1.json",
        at.year(),
        u8::from(at.month()) - 1,
        at.day(),
        at.hour(),
        at.minute(),
        at.second(),
        at.millisecond(),
    )
}

fn header(app_name: &str, start_time: i64) -> String {
    // A `&str` always serializes.
    let name = serde_json::to_string(app_name).unwrap_or_else(|_| String::from("\"\""));
    format!(
        "{{\n   \"appName\" : {name},\n   \"schemaVersion\" : {SCHEMA_VERSION},\n   \"unixTimestampUTCAtServer\" : {start_time},\n   \"clientAnalytics\":[\n"
    )
}

fn terminator(end_time: i64) -> String {
    format!("\t{{\"endTime\": {end_time}}}]\n}}")
}

fn valid_app_name(app_name: &str) -> bool {
    !app_name.is_empty()
        && app_name != "."
        && app_name != ".."
        && !app_name.contains(['/', '\\', '\0'])
}

async fn write_flush(fp: &mut fs::File, path: &Path, bytes: &[u8]) -> Result<(), Error> {
    fp.write_all(bytes).await.map_err(|err| Error::Io {
        path: path.to_path_buf(),
        operation: IoOp::Write,
        err,
    })?;
    fp.flush().await.map_err(|err| Error::Io {
        path: path.to_path_buf(),
        operation: IoOp::Flush,
        err,
    })
}

/// Owner of every open session.
///
/// The manager is not internally synchronized: it is owned by a single task,
/// see [`crate::rotation::Server`], which serializes appends and seals.
#[derive(Debug)]
pub struct Manager {
    root: PathBuf,
    sessions: FxHashMap<String, Session>,
    // Time in the name of each app's latest session. A sealed file may be
    // gone from disk while its archive still carries the name.
    last_named: FxHashMap<String, OffsetDateTime>,
    now: fn() -> OffsetDateTime,
}

impl Manager {
    /// Create a manager writing sessions below `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_time_source(root, clock::utc_now)
    }

    /// Create a manager that reads wall-clock time from `now`.
    #[must_use]
    pub fn with_time_source(root: impl Into<PathBuf>, now: fn() -> OffsetDateTime) -> Self {
        Self {
            root: root.into(),
            sessions: FxHashMap::default(),
            last_named: FxHashMap::default(),
            now,
        }
    }

    async fn open(
        root: &Path,
        now: fn() -> OffsetDateTime,
        app_name: &str,
        last_named: Option<OffsetDateTime>,
    ) -> Result<Session, Error> {
        let at = now();
        let start_time = at.unix_timestamp();

        fs::create_dir_all(root)
            .await
            .map_err(|err| Error::Io {
                path: root.to_path_buf(),
                operation: IoOp::CreateDirAll,
                err,
            })?;

        // Names resolve to the millisecond. When the name is taken the session
        // moves to the next free millisecond; an existing file is never reopened.
        let mut named = match last_named {
            Some(last) if last >= at => last + Duration::milliseconds(1),
            _ => at,
        };
        let mut attempts = 0;
        let (file_name, path, mut fp) = loop {
            let name = file_name(app_name, named);
            let path = root.join(&name);
            match fs::OpenOptions::new()
                .append(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(fp) => break (name, path, fp),
                Err(err)
                    if err.kind() == io::ErrorKind::AlreadyExists
                        && attempts < MAX_NAME_ATTEMPTS =>
                {
                    debug!(path = %path.display(), "session name taken");
                    named += Duration::milliseconds(1);
                    attempts += 1;
                }
                Err(err) => {
                    return Err(Error::Io {
                        path,
                        operation: IoOp::Open,
                        err,
                    });
                }
            }
        };

        let header = header(app_name, start_time);
        write_flush(&mut fp, &path, header.as_bytes()).await?;

        counter!("dump_sessions_opened").increment(1);
        info!(app = app_name, path = %path.display(), "opened dump session");
        Ok(Session {
            file_name,
            path,
            start_time,
            year: at.year(),
            month: u8::from(at.month()),
            day: at.day(),
            bytes_written: header.len() as u64,
            named_at: named,
            fp,
        })
    }

    /// Append one event payload to `app_name`'s session, creating the session
    /// if there is none.
    ///
    /// # Errors
    ///
    /// Returns an error if the session file cannot be created or written, or
    /// if `app_name` cannot be used in a file name. A failed append leaves the
    /// byte count unchanged.
    pub async fn append(&mut self, app_name: &str, payload: &str) -> Result<Updated, Error> {
        if !valid_app_name(app_name) {
            return Err(Error::InvalidAppName(app_name.to_string()));
        }
        let session = match self.sessions.entry(app_name.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let last_named = self.last_named.get(app_name).copied();
                let session = Self::open(&self.root, self.now, app_name, last_named).await?;
                self.last_named.insert(app_name.to_string(), session.named_at);
                entry.insert(session)
            }
        };

        let record = format!("\t{payload},\n");
        write_flush(&mut session.fp, &session.path, record.as_bytes()).await?;
        session.bytes_written += payload.len() as u64;

        counter!("dump_bytes_written", "app" => app_name.to_string())
            .increment(payload.len() as u64);
        Ok(Updated {
            app_name: app_name.to_string(),
            path: session.path.clone(),
            bytes_written: session.bytes_written,
        })
    }

    /// Close `app_name`'s session, returning its final descriptor, or `None`
    /// if there is no open session.
    ///
    /// # Errors
    ///
    /// Returns an error if the end marker cannot be written. The session is
    /// closed regardless; the next append opens a fresh one.
    pub async fn seal(&mut self, app_name: &str) -> Result<Option<Descriptor>, Error> {
        let Some(mut session) = self.sessions.remove(app_name) else {
            debug!(app = app_name, "nothing to seal");
            return Ok(None);
        };

        let end_time = (self.now)().unix_timestamp();
        write_flush(
            &mut session.fp,
            &session.path,
            terminator(end_time).as_bytes(),
        )
        .await?;
        drop(session.fp);

        counter!("dump_sessions_sealed").increment(1);
        info!(
            app = app_name,
            path = %session.path.display(),
            bytes_written = session.bytes_written,
            "sealed dump session"
        );
        Ok(Some(Descriptor {
            app_name: app_name.to_string(),
            file_name: session.file_name,
            path: session.path,
            bytes_written: session.bytes_written,
            start_time: session.start_time,
            end_time,
            year: session.year,
            month: session.month,
            day: session.day,
        }))
    }

    /// Applications with an open session, sorted.
    #[must_use]
    pub fn open_app_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Bytes written to `app_name`'s open session, if any.
    #[must_use]
    pub fn bytes_written(&self, app_name: &str) -> Option<u64> {
        self.sessions.get(app_name).map(|s| s.bytes_written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn fixed_time() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp_nanos(1_643_043_376_042_000_000)
            .expect("timestamp in range")
    }

    fn manager(dir: &tempfile::TempDir) -> Manager {
        Manager::with_time_source(dir.path(), fixed_time)
    }

    #[test]
    fn file_name_format() {
        assert_eq!(
            file_name("app1", fixed_time()),
            "app1.2022-0-24-16-56-16-42.v1.json"
        );
    }

    #[tokio::test]
    async fn seal_without_session_is_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut m = manager(&dir);
        assert!(m.seal("app1").await.expect("seal failed").is_none());
    }

    #[tokio::test]
    async fn sealed_file_is_well_formed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut m = manager(&dir);

        m.append("app1", r#"{"n":1}"#).await.expect("append");
        m.append("app1", r#"{"n":2}"#).await.expect("append");
        m.append("app1", r#"{"n":3}"#).await.expect("append");
        let d = m
            .seal("app1")
            .await
            .expect("seal failed")
            .expect("no descriptor");

        let contents = std::fs::read_to_string(&d.path).expect("read sealed file");
        let doc: Value = serde_json::from_str(&contents).expect("sealed file is not JSON");
        assert_eq!(doc["appName"], "app1");
        assert_eq!(doc["schemaVersion"], 1);
        assert_eq!(doc["unixTimestampUTCAtServer"], 1_643_043_376);

        let entries = doc["clientAnalytics"].as_array().expect("no array");
        assert_eq!(entries.len(), 4);
        for (i, entry) in entries[..3].iter().enumerate() {
            assert_eq!(entry["n"], i + 1);
        }
        assert_eq!(entries[3]["endTime"], 1_643_043_376);

        assert_eq!(d.app_name, "app1");
        assert_eq!((d.year, d.month, d.day), (2022, 1, 24));
        assert_eq!(d.file_name, "app1.2022-0-24-16-56-16-42.v1.json");
    }

    #[tokio::test]
    async fn bytes_written_counts_header_and_payloads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut m = manager(&dir);

        let first = m.append("app1", "hello").await.expect("append");
        let header_len = header("app1", 1_643_043_376).len() as u64;
        assert_eq!(first.bytes_written, header_len + 5);

        let second = m.append("app1", "world!").await.expect("append");
        assert_eq!(second.bytes_written, header_len + 11);
        assert_eq!(m.bytes_written("app1"), Some(header_len + 11));
    }

    #[tokio::test]
    async fn reopened_session_never_reuses_a_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut m = manager(&dir);

        m.append("app1", r#"{"n":1}"#).await.expect("append");
        let first = m.seal("app1").await.expect("seal").expect("descriptor");
        m.append("app1", r#"{"n":2}"#).await.expect("append");
        let second = m.seal("app1").await.expect("seal").expect("descriptor");

        assert_eq!(first.file_name, "app1.2022-0-24-16-56-16-42.v1.json");
        assert_eq!(second.file_name, "app1.2022-0-24-16-56-16-43.v1.json");
        assert_eq!(second.start_time, first.start_time);

        for (d, n) in [(&first, 1), (&second, 2)] {
            let contents = std::fs::read_to_string(&d.path).expect("read sealed file");
            let doc: Value = serde_json::from_str(&contents).expect("sealed file is not JSON");
            let entries = doc["clientAnalytics"].as_array().expect("no array");
            assert_eq!(entries.len(), 2);
            assert_eq!(entries[0]["n"], n);
        }
    }

    #[tokio::test]
    async fn removed_session_name_is_not_reused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut m = manager(&dir);

        m.append("app1", "{}").await.expect("append");
        let first = m.seal("app1").await.expect("seal").expect("descriptor");
        std::fs::remove_file(&first.path).expect("remove sealed file");
        m.append("app1", "{}").await.expect("append");
        let second = m.seal("app1").await.expect("seal").expect("descriptor");

        assert_ne!(first.file_name, second.file_name);
        assert_eq!(second.file_name, "app1.2022-0-24-16-56-16-43.v1.json");
    }

    #[tokio::test]
    async fn seal_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut m = manager(&dir);

        m.append("app1", "{}").await.expect("append");
        assert!(m.seal("app1").await.expect("seal").is_some());
        assert!(m.seal("app1").await.expect("seal").is_none());
        assert!(m.open_app_ids().is_empty());
    }

    #[tokio::test]
    async fn sessions_are_per_application() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut m = manager(&dir);

        m.append("b", "{}").await.expect("append");
        m.append("a", "{}").await.expect("append");
        m.append("b", "{}").await.expect("append");
        assert_eq!(m.open_app_ids(), vec!["a".to_string(), "b".to_string()]);

        m.seal("a").await.expect("seal");
        assert_eq!(m.open_app_ids(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn rejects_path_like_app_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut m = manager(&dir);

        for name in ["", "..", "a/b", "a\\b"] {
            assert!(matches!(
                m.append(name, "{}").await,
                Err(Error::InvalidAppName(_))
            ));
        }
        assert!(m.open_app_ids().is_empty());
    }

    #[tokio::test]
    async fn unwritable_root_is_an_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").expect("write blocker");

        let mut m = Manager::with_time_source(&blocker, fixed_time);
        assert!(matches!(
            m.append("app1", "{}").await,
            Err(Error::Io { .. })
        ));
        assert!(m.open_app_ids().is_empty());
    }
}
