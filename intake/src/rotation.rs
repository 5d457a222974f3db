//! Rotation and disposition of dump files.
//!
//! The [`Engine`] decides when an application's dump session is sealed and what
//! happens to the sealed file afterwards: it is compressed, the raw file is
//! removed and the artifact is then deleted, kept or uploaded according to the
//! active [`Policy`]. Failed uploads wait in a [`RetryQueue`] swept on a timer.
//!
//! The engine does not run on its own. [`server::Server`] owns it together with
//! the [`dump::Manager`] and is the only writer of either, so a size-triggered
//! rotation always completes before the next append is taken.

use std::{io, path::Path, time::Duration};

use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::{fs, sync::broadcast};
use tracing::{debug, error, info, warn};

use crate::{
    compression::{self, Compressor},
    dump::{self, Descriptor, Updated},
    storage::{self, Destination, Storage, Uploader},
};

mod retry;
pub mod server;

pub use retry::RetryQueue;
pub use server::{Handle, Server};

/// Default size at which a dump file is rotated.
pub const DEFAULT_MAX_FILE_SIZE_BYTES: u64 = 100_000_000;
/// Default seconds between time-based rotation sweeps.
pub const DEFAULT_ROTATE_SECS: f64 = 600.0;

const EVENT_CAPACITY: usize = 128;

fn default_max_file_size() -> u64 {
    DEFAULT_MAX_FILE_SIZE_BYTES
}

fn default_rotate_secs() -> f64 {
    DEFAULT_ROTATE_SECS
}

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Engine`] and its [`Handle`].
pub enum Error {
    /// Sealing or writing the dump failed.
    #[error(transparent)]
    Dump(#[from] dump::Error),
    /// Compressing a sealed file failed. The raw file is left in place.
    #[error(transparent)]
    Compression(#[from] compression::Error),
    /// The rotation server is no longer running.
    #[error("Rotation server has shut down")]
    Stopped,
}

/// The `rotateDumpFiles` configuration object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    /// Size at which a session is rotated.
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,
    /// Seconds between sweeps that rotate every open session.
    #[serde(default = "default_rotate_secs", rename = "rotateInEveryNSeconds")]
    pub rotate_every_secs: f64,
    /// Disposition of compressed artifacts. Required: a policy that does not
    /// say where data goes is rejected rather than defaulted.
    pub storage: Storage,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_file_size_bytes: DEFAULT_MAX_FILE_SIZE_BYTES,
            rotate_every_secs: DEFAULT_ROTATE_SECS,
            storage: Storage::default(),
        }
    }
}

fn secs(value: f64, fallback: f64, what: &'static str) -> Duration {
    if let Ok(duration) = Duration::try_from_secs_f64(value) {
        duration
    } else {
        warn!(value, fallback, "invalid {what} interval, using fallback");
        Duration::from_secs_f64(fallback)
    }
}

impl Policy {
    /// Interval between time-based rotation sweeps.
    #[must_use]
    pub fn rotate_interval(&self) -> Duration {
        secs(self.rotate_every_secs, DEFAULT_ROTATE_SECS, "rotation")
    }

    /// Interval between upload retry sweeps.
    #[must_use]
    pub fn upload_retry_interval(&self) -> Duration {
        secs(
            self.storage.upload_retry_time_secs,
            storage::DEFAULT_UPLOAD_RETRY_SECS,
            "upload retry",
        )
    }
}

/// Notifications published by the [`Engine`].
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A rotation of `app_name` ran. `descriptor` is `None` when the
    /// application had no open session.
    AppDumpRotated {
        /// The rotated application
        app_name: String,
        /// The sealed session, if there was one
        descriptor: Option<Descriptor>,
    },
    /// A sweep rotated at least one open session.
    AllDumpsRotated,
    /// One queued upload was retried.
    UploadRetried {
        /// The artifact
        path: std::path::PathBuf,
        /// Whether the upload went through
        success: bool,
    },
}

async fn remove(path: &Path) -> bool {
    match fs::remove_file(path).await {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => {
            warn!(path = %path.display(), %err, "unable to remove file");
            false
        }
    }
}

/// Rotation decisions and the disposition pipeline.
#[derive(Debug)]
pub struct Engine<C, U> {
    policy: Policy,
    retry: RetryQueue,
    compressor: C,
    uploader: U,
    events: broadcast::Sender<Event>,
}

impl<C, U> Engine<C, U>
where
    C: Compressor + Send + Sync,
    U: Uploader + Send + Sync,
{
    /// Create a new [`Engine`] running `policy`.
    pub fn new(policy: Policy, compressor: C, uploader: U) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            policy,
            retry: RetryQueue::new(),
            compressor,
            uploader,
            events,
        }
    }

    /// Subscribe to rotation events. Events published before subscription are
    /// not seen.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// The active policy.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Uploads waiting to be retried.
    pub fn retry_queue(&self) -> &RetryQueue {
        &self.retry
    }

    /// Replace the active policy wholesale. `None` keeps the previous one.
    pub fn apply_policy(&mut self, policy: Option<Policy>) {
        match policy {
            Some(policy) if policy != self.policy => {
                info!(?policy, "rotation policy updated");
                self.policy = policy;
            }
            Some(_) => {}
            None => debug!("configuration carries no rotation policy, keeping current"),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_queue_depth(&self) {
        gauge!("upload_retry_queue").set(self.retry.len() as f64);
    }

    fn publish(&self, event: Event) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    /// React to a write on a dump session. Rotates the application when its
    /// file has reached the size limit and returns whether it did.
    ///
    /// # Errors
    ///
    /// Returns an error if the triggered rotation fails.
    pub async fn on_updated(
        &mut self,
        dumps: &mut dump::Manager,
        update: &Updated,
    ) -> Result<bool, Error> {
        if update.bytes_written < self.policy.max_file_size_bytes {
            return Ok(false);
        }
        debug!(
            app = %update.app_name,
            bytes = update.bytes_written,
            limit = self.policy.max_file_size_bytes,
            "size limit reached"
        );
        self.rotate_app(dumps, &update.app_name).await?;
        Ok(true)
    }

    /// Seal the session of `app_name`, if any, and dispose of the sealed file.
    /// An [`Event::AppDumpRotated`] is published whether or not a session was
    /// open.
    ///
    /// # Errors
    ///
    /// Returns an error if sealing or compression fails. Either way the raw
    /// file stays on disk and no event is published.
    pub async fn rotate_app(
        &mut self,
        dumps: &mut dump::Manager,
        app_name: &str,
    ) -> Result<Option<Descriptor>, Error> {
        let descriptor = dumps.seal(app_name).await?;
        if let Some(descriptor) = &descriptor {
            self.dispose(descriptor).await?;
            counter!("rotations", "app" => app_name.to_string()).increment(1);
        }
        self.publish(Event::AppDumpRotated {
            app_name: app_name.to_string(),
            descriptor: descriptor.clone(),
        });
        Ok(descriptor)
    }

    async fn dispose(&mut self, descriptor: &Descriptor) -> Result<(), Error> {
        let archive = self.compressor.compress(&descriptor.path).await?;
        remove(&descriptor.path).await;

        match &self.policy.storage.destination {
            Destination::Remote => match self.upload(&archive).await {
                Ok(()) => {
                    info!(archive = %archive.display(), "artifact uploaded");
                    remove(&archive).await;
                }
                Err(err) => {
                    warn!(archive = %archive.display(), %err, "upload failed, queued for retry");
                    counter!("upload_failures").increment(1);
                    self.retry.push(archive);
                    self.record_queue_depth();
                }
            },
            Destination::None => {
                remove(&archive).await;
            }
            Destination::Local => {
                debug!(archive = %archive.display(), "artifact kept on local disk");
            }
            Destination::Unknown(other) => {
                warn!(destination = %other, archive = %archive.display(), "unknown storage destination, artifact kept");
            }
        }
        Ok(())
    }

    async fn upload(&self, path: &Path) -> Result<(), storage::Error> {
        let remote = self.policy.storage.remote()?;
        self.uploader.upload(&remote, path).await
    }

    /// Rotate every open session. A failure for one application is logged and
    /// does not stop the others. Publishes [`Event::AllDumpsRotated`] if any
    /// session was open and returns how many were.
    pub async fn rotate_all(&mut self, dumps: &mut dump::Manager) -> usize {
        let apps = dumps.open_app_ids();
        for app in &apps {
            if let Err(err) = self.rotate_app(dumps, app).await {
                error!(%app, %err, "rotation failed");
            }
        }
        if !apps.is_empty() {
            info!(count = apps.len(), "rotated all open dumps");
            self.publish(Event::AllDumpsRotated);
        }
        apps.len()
    }

    /// Retry the oldest queued upload. A success deletes the artifact, a
    /// failure puts it back at the head of the queue. Returns `None` when
    /// nothing was queued, otherwise whether the upload succeeded.
    pub async fn retry_upload(&mut self) -> Option<bool> {
        let path = self.retry.pop()?;
        let success = match self.upload(&path).await {
            Ok(()) => {
                info!(archive = %path.display(), "queued artifact uploaded");
                remove(&path).await;
                true
            }
            Err(err) => {
                warn!(archive = %path.display(), %err, "upload retry failed");
                counter!("upload_failures").increment(1);
                self.retry.push(path.clone());
                false
            }
        };
        self.record_queue_depth();
        self.publish(Event::UploadRetried { path, success });
        Some(success)
    }
}


#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use time::OffsetDateTime;
    use tokio::sync::broadcast::error::TryRecvError;

    use super::test::{BrokenCompressor, FakeUploader};
    use super::*;
    use crate::compression::{ARCHIVE_SUFFIX, TarGz};

    fn fixed_now() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp_nanos(1_643_043_376_042_000_000).expect("valid time")
    }

    fn policy(destination: &str) -> Policy {
        serde_json::from_value(serde_json::json!({
            "maxFileSizeBytes": 1000,
            "rotateInEveryNSeconds": 600,
            "storage": {
                "destination": destination,
                "accessKeyId": "id",
                "secretAccessKey": "secret",
                "region": "us-east-1",
                "bucket": "dumps",
                "uploadRetryTimeSecs": 30
            }
        }))
        .expect("policy")
    }

    fn files(root: &std::path::Path) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = std::fs::read_dir(root)
            .expect("read_dir")
            .map(|e| e.expect("entry").path())
            .collect();
        out.sort();
        out
    }

    #[test]
    fn policy_parsing() {
        let policy = policy("remote");
        assert_eq!(policy.max_file_size_bytes, 1000);
        assert_eq!(policy.rotate_interval(), Duration::from_secs(600));
        assert_eq!(policy.upload_retry_interval(), Duration::from_secs(30));
        assert_eq!(policy.storage.destination, Destination::Remote);

        let fractional: Policy = serde_json::from_str(
            r#"{"rotateInEveryNSeconds": 0.2, "storage": {"destination": "none"}}"#,
        )
        .expect("parse");
        assert_eq!(fractional.max_file_size_bytes, DEFAULT_MAX_FILE_SIZE_BYTES);
        assert_eq!(fractional.rotate_interval(), Duration::from_millis(200));
    }

    #[test]
    fn policy_without_storage_is_rejected() {
        let res: Result<Policy, _> = serde_json::from_str(r#"{"maxFileSizeBytes": 10}"#);
        assert!(res.is_err());
    }

    #[test]
    fn negative_interval_falls_back() {
        let policy = Policy {
            rotate_every_secs: -1.0,
            ..Policy::default()
        };
        assert_eq!(
            policy.rotate_interval(),
            Duration::from_secs_f64(DEFAULT_ROTATE_SECS)
        );
    }

    #[test]
    fn absent_policy_keeps_current() {
        let mut engine = Engine::new(policy("local"), TarGz::default(), FakeUploader::new(true));
        engine.apply_policy(None);
        assert_eq!(engine.policy(), &policy("local"));
        engine.apply_policy(Some(policy("none")));
        assert_eq!(engine.policy().storage.destination, Destination::None);
    }

    #[tokio::test]
    async fn size_limit_rotates_only_that_app() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut dumps = dump::Manager::with_time_source(dir.path(), fixed_now);
        let mut engine = Engine::new(policy("local"), TarGz::default(), FakeUploader::new(true));
        let mut events = engine.subscribe();

        let big = format!("{{\"data\": \"{}\"}}", "x".repeat(2_000));
        let update = dumps.append("app1", &big).await.expect("append");
        assert!(engine.on_updated(&mut dumps, &update).await.expect("rotate"));

        let update = dumps.append("app2", "{\"hello\": \"world\"}").await.expect("append");
        assert!(!engine.on_updated(&mut dumps, &update).await.expect("rotate"));

        assert_eq!(dumps.open_app_ids(), vec!["app2".to_string()]);
        match events.try_recv().expect("event") {
            Event::AppDumpRotated {
                app_name,
                descriptor,
            } => {
                assert_eq!(app_name, "app1");
                let descriptor = descriptor.expect("descriptor");
                assert_eq!(descriptor.file_name, "app1.2022-0-24-16-56-16-42.v1.json");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn destination_none_leaves_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut dumps = dump::Manager::with_time_source(dir.path(), fixed_now);
        let mut engine = Engine::new(policy("none"), TarGz::default(), FakeUploader::new(true));
        let mut events = engine.subscribe();

        dumps.append("appx", "{\"a\": 1}").await.expect("append");
        dumps.append("appy", "{\"b\": 2}").await.expect("append");
        assert_eq!(engine.rotate_all(&mut dumps).await, 2);

        assert!(files(dir.path()).is_empty());
        assert!(matches!(events.try_recv(), Ok(Event::AppDumpRotated { .. })));
        assert!(matches!(events.try_recv(), Ok(Event::AppDumpRotated { .. })));
        assert_eq!(events.try_recv(), Ok(Event::AllDumpsRotated));
    }

    #[tokio::test]
    async fn destination_local_keeps_one_archive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut dumps = dump::Manager::with_time_source(dir.path(), fixed_now);
        let mut engine = Engine::new(policy("local"), TarGz::default(), FakeUploader::new(true));

        dumps.append("app1", "{\"a\": 1}").await.expect("append");
        engine.rotate_all(&mut dumps).await;

        let left = files(dir.path());
        assert_eq!(left.len(), 1);
        assert!(left[0].to_string_lossy().ends_with(ARCHIVE_SUFFIX));
    }

    #[tokio::test]
    async fn rapid_rotations_keep_every_archive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut dumps = dump::Manager::new(dir.path());
        let mut local = policy("local");
        local.max_file_size_bytes = 1;
        let mut engine = Engine::new(local, TarGz::default(), FakeUploader::new(true));

        for n in 0..50 {
            let update = dumps
                .append("app1", &format!("{{\"n\": {n}}}"))
                .await
                .expect("append");
            assert!(engine.on_updated(&mut dumps, &update).await.expect("rotate"));
        }

        let left = files(dir.path());
        assert_eq!(left.len(), 50);
        assert!(left.iter().all(|p| p.to_string_lossy().ends_with(ARCHIVE_SUFFIX)));
    }

    #[tokio::test]
    async fn destination_remote_uploads_then_deletes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut dumps = dump::Manager::with_time_source(dir.path(), fixed_now);
        let uploader = FakeUploader::new(true);
        let mut engine = Engine::new(policy("remote"), TarGz::default(), uploader.clone());

        dumps.append("app1", "{\"a\": 1}").await.expect("append");
        engine.rotate_all(&mut dumps).await;

        assert!(files(dir.path()).is_empty());
        assert_eq!(uploader.uploaded().len(), 1);
        assert!(engine.retry_queue().is_empty());
    }

    #[tokio::test]
    async fn failed_upload_is_retried_until_it_succeeds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut dumps = dump::Manager::with_time_source(dir.path(), fixed_now);
        let uploader = FakeUploader::new(false);
        let mut engine = Engine::new(policy("remote"), TarGz::default(), uploader.clone());
        let mut events = engine.subscribe();

        dumps.append("app1", "{\"a\": 1}").await.expect("append");
        engine.rotate_all(&mut dumps).await;
        assert_eq!(engine.retry_queue().len(), 1);
        assert_eq!(files(dir.path()).len(), 1);

        assert_eq!(engine.retry_upload().await, Some(false));
        assert_eq!(engine.retry_queue().len(), 1);

        uploader.set_available(true);
        assert_eq!(engine.retry_upload().await, Some(true));
        assert!(engine.retry_queue().is_empty());
        assert!(files(dir.path()).is_empty());
        assert_eq!(engine.retry_upload().await, None);

        let retried: Vec<bool> = std::iter::from_fn(|| events.try_recv().ok())
            .filter_map(|e| match e {
                Event::UploadRetried { success, .. } => Some(success),
                _ => None,
            })
            .collect();
        assert_eq!(retried, vec![false, true]);
    }

    #[tokio::test]
    async fn unknown_destination_keeps_archive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut dumps = dump::Manager::with_time_source(dir.path(), fixed_now);
        let uploader = FakeUploader::new(true);
        let mut engine = Engine::new(policy("yo"), TarGz::default(), uploader.clone());

        dumps.append("app1", "{\"a\": 1}").await.expect("append");
        engine.rotate_all(&mut dumps).await;

        let left = files(dir.path());
        assert_eq!(left.len(), 1);
        assert!(left[0].to_string_lossy().ends_with(ARCHIVE_SUFFIX));
        assert!(uploader.uploaded().is_empty());
    }

    #[tokio::test]
    async fn compression_failure_keeps_raw_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut dumps = dump::Manager::with_time_source(dir.path(), fixed_now);
        let mut engine = Engine::new(policy("none"), BrokenCompressor, FakeUploader::new(true));
        let mut events = engine.subscribe();

        dumps.append("app1", "{\"a\": 1}").await.expect("append");
        let res = engine.rotate_app(&mut dumps, "app1").await;
        assert!(matches!(res, Err(Error::Compression(_))));

        let left = files(dir.path());
        assert_eq!(left.len(), 1);
        assert!(left[0].to_string_lossy().ends_with(".v1.json"));
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn rotating_a_closed_app_still_notifies() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut dumps = dump::Manager::with_time_source(dir.path(), fixed_now);
        let mut engine = Engine::new(policy("none"), TarGz::default(), FakeUploader::new(true));
        let mut events = engine.subscribe();

        assert!(engine.rotate_app(&mut dumps, "ghost").await.expect("rotate").is_none());
        assert_eq!(
            events.try_recv(),
            Ok(Event::AppDumpRotated {
                app_name: "ghost".to_string(),
                descriptor: None,
            })
        );

        assert_eq!(engine.rotate_all(&mut dumps).await, 0);
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    }
}
