//! The rotation server.
//!
//! [`Server`] is the single owner of the open dump sessions and the rotation
//! engine. Appends arrive as commands through a [`Handle`]; the time-based
//! sweep and the upload retry sweep run as deadlines on the same task, and
//! configuration changes re-arm both and trigger an immediate sweep.

use std::{sync::Arc, time::Duration};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info};

use super::{Engine, Error, Event};
use crate::{
    clock::{Clock, Periodic},
    compression::Compressor,
    config::Config,
    dump,
    storage::Uploader,
};

const COMMAND_CAPACITY: usize = 1_024;

#[derive(Debug)]
enum Command {
    Append {
        app_name: String,
        payload: String,
        reply: oneshot::Sender<Result<(), dump::Error>>,
    },
    OpenAppIds {
        reply: oneshot::Sender<Vec<String>>,
    },
    RotateAll {
        reply: oneshot::Sender<usize>,
    },
}

/// Client side of a running [`Server`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Handle {
    commands: mpsc::Sender<Command>,
}

impl Handle {
    async fn call<T>(&self, command: Command, reply: oneshot::Receiver<T>) -> Result<T, Error> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::Stopped)?;
        reply.await.map_err(|_| Error::Stopped)
    }

    /// Append `payload` to the dump of `app_name`. Any rotation the append
    /// triggers has completed when this returns.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails or the server has stopped.
    pub async fn append(&self, app_name: &str, payload: String) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        let command = Command::Append {
            app_name: app_name.to_string(),
            payload,
            reply,
        };
        self.call(command, rx).await??;
        Ok(())
    }

    /// Applications with an open dump session, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the server has stopped.
    pub async fn open_app_ids(&self) -> Result<Vec<String>, Error> {
        let (reply, rx) = oneshot::channel();
        self.call(Command::OpenAppIds { reply }, rx).await
    }

    /// Rotate every open session now, returning how many there were.
    ///
    /// # Errors
    ///
    /// Returns an error if the server has stopped.
    pub async fn rotate_all(&self) -> Result<usize, Error> {
        let (reply, rx) = oneshot::channel();
        self.call(Command::RotateAll { reply }, rx).await
    }
}

#[derive(Debug, Clone, Copy)]
struct Timers {
    sweep: Periodic,
    retry: Periodic,
}

impl Timers {
    fn arm(rotate: Duration, retry: Duration, now: u64) -> Self {
        Self {
            sweep: Periodic::from_duration(rotate, now),
            retry: Periodic::from_duration(retry, now),
        }
    }

    fn until_next(&self, now: u64) -> u64 {
        self.sweep.until_next(now).min(self.retry.until_next(now))
    }
}

/// Runs the rotation [`Engine`] over a [`dump::Manager`].
#[derive(Debug)]
pub struct Server<C, U, K> {
    engine: Engine<C, U>,
    dumps: dump::Manager,
    commands: mpsc::Receiver<Command>,
    config: watch::Receiver<Arc<Config>>,
    clock: K,
    shutdown: intake_signal::Watcher,
}

impl<C, U, K> Server<C, U, K>
where
    C: Compressor + Send + Sync,
    U: Uploader + Send + Sync,
    K: Clock + Send + Sync,
{
    /// Create a new [`Server`] and the [`Handle`] that feeds it.
    pub fn new(
        engine: Engine<C, U>,
        dumps: dump::Manager,
        config: watch::Receiver<Arc<Config>>,
        clock: K,
        shutdown: intake_signal::Watcher,
    ) -> (Self, Handle) {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let server = Self {
            engine,
            dumps,
            commands: rx,
            config,
            clock,
            shutdown,
        };
        (server, Handle { commands: tx })
    }

    /// Subscribe to the engine's rotation events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.engine.subscribe()
    }

    /// Run until the shutdown signal is received, then rotate every open
    /// session one last time.
    ///
    /// The current configuration's policy is applied on start and followed by
    /// a sweep, exactly as for a configuration change.
    ///
    /// # Errors
    ///
    /// None at present; failures inside a sweep are logged and contained.
    pub async fn spin(self) -> Result<(), Error> {
        let Self {
            mut engine,
            mut dumps,
            mut commands,
            mut config,
            clock,
            shutdown,
        } = self;

        let policy = config.borrow_and_update().rotate_dump_files.clone();
        engine.apply_policy(policy);
        let mut timers = Timers::arm(
            engine.policy().rotate_interval(),
            engine.policy().upload_retry_interval(),
            clock.ticks_elapsed(),
        );
        engine.rotate_all(&mut dumps).await;

        let shutdown_wait = shutdown.recv();
        tokio::pin!(shutdown_wait);
        loop {
            let wait = timers.until_next(clock.ticks_elapsed());
            tokio::select! {
                Some(command) = commands.recv() => {
                    match command {
                        Command::Append { app_name, payload, reply } => {
                            let res = match dumps.append(&app_name, &payload).await {
                                Ok(update) => {
                                    if let Err(err) = engine.on_updated(&mut dumps, &update).await {
                                        error!(app = %app_name, %err, "size-triggered rotation failed");
                                    }
                                    Ok(())
                                }
                                Err(err) => Err(err),
                            };
                            let _ = reply.send(res);
                        }
                        Command::OpenAppIds { reply } => {
                            let _ = reply.send(dumps.open_app_ids());
                        }
                        Command::RotateAll { reply } => {
                            let _ = reply.send(engine.rotate_all(&mut dumps).await);
                        }
                    }
                }
                Ok(()) = config.changed() => {
                    let policy = config.borrow_and_update().rotate_dump_files.clone();
                    engine.apply_policy(policy);
                    timers = Timers::arm(
                        engine.policy().rotate_interval(),
                        engine.policy().upload_retry_interval(),
                        clock.ticks_elapsed(),
                    );
                    debug!(?timers, "rotation timers re-armed");
                    engine.rotate_all(&mut dumps).await;
                }
                () = clock.wait(wait) => {
                    let now = clock.ticks_elapsed();
                    if timers.sweep.poll(now) {
                        engine.rotate_all(&mut dumps).await;
                    }
                    if timers.retry.poll(now) {
                        engine.retry_upload().await;
                    }
                }
                () = &mut shutdown_wait => {
                    info!("shutdown signal received, rotating open dumps");
                    engine.rotate_all(&mut dumps).await;
                    return Ok(());
                }
            }
        }
    }
}
