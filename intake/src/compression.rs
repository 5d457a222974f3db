//! Archive compression of sealed dump files.
//!
//! A sealed session is packed into a gzip-compressed tarball sitting next to
//! it, `<file>.tar.gz`, holding one entry named after the file. The raw file
//! is left in place; removing it is the caller's decision.

use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use flate2::{Compression, write::GzEncoder};
use tokio::task::{self, JoinError};
use tracing::debug;

/// Suffix appended to the path of every compressed artifact.
pub const ARCHIVE_SUFFIX: &str = ".tar.gz";

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Compressor`] implementations.
pub enum Error {
    /// The source file does not exist or cannot be read.
    #[error("Cannot read source [{path}]: {err}")]
    Source {
        /// The file being compressed
        path: PathBuf,
        /// The error
        err: io::Error,
    },
    /// Writing the archive failed.
    #[error("Cannot write archive [{path}]: {err}")]
    Archive {
        /// The archive being written
        path: PathBuf,
        /// The error
        err: io::Error,
    },
    /// The source path has no file name to use as the archive entry.
    #[error("Path has no file name: {0}")]
    NoFileName(PathBuf),
    /// The blocking compression task did not complete.
    #[error("Compression task failed: {0}")]
    Join(#[from] JoinError),
}

#[async_trait]
/// Produces a compressed artifact from a file on disk.
pub trait Compressor {
    /// Compress `path`, returning the artifact's path. Never a no-op: a missing
    /// source is an error, not an empty archive.
    async fn compress(&self, path: &Path) -> Result<PathBuf, Error>;
}

/// Path of the archive `TarGz` produces for `path`.
#[must_use]
pub fn archive_path(path: &Path) -> PathBuf {
    let mut archive = path.as_os_str().to_owned();
    archive.push(ARCHIVE_SUFFIX);
    PathBuf::from(archive)
}

#[derive(Debug, Clone, Copy)]
/// Gzip-compressed tarball compression.
pub struct TarGz {
    level: Compression,
}

impl Default for TarGz {
    fn default() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

fn pack(source: &Path, archive: &Path, level: Compression) -> Result<(), Error> {
    let name = source
        .file_name()
        .ok_or_else(|| Error::NoFileName(source.to_path_buf()))?;
    let mut src = File::open(source).map_err(|err| Error::Source {
        path: source.to_path_buf(),
        err,
    })?;

    let archive_err = |err| Error::Archive {
        path: archive.to_path_buf(),
        err,
    };
    // An archive already on disk belongs to another rotation.
    let fp = File::create_new(archive).map_err(archive_err)?;
    let mut builder = tar::Builder::new(GzEncoder::new(BufWriter::new(fp), level));
    builder.append_file(name, &mut src).map_err(archive_err)?;
    let mut out = builder
        .into_inner()
        .map_err(archive_err)?
        .finish()
        .map_err(archive_err)?;
    out.flush().map_err(archive_err)?;
    Ok(())
}

#[async_trait]
impl Compressor for TarGz {
    async fn compress(&self, path: &Path) -> Result<PathBuf, Error> {
        let source = path.to_path_buf();
        let archive = archive_path(path);
        let level = self.level;

        let out = archive.clone();
        task::spawn_blocking(move || pack(&source, &out, level)).await??;
        debug!(source = %path.display(), archive = %archive.display(), "compressed");
        Ok(archive)
    }
}
