//! Disposition of compressed artifacts.
//!
//! A rotation's compressed artifact goes to one of three destinations:
//! nowhere (`none`, deleted), the local disk (`local`, retained), or a remote
//! object store (`remote`, uploaded then deleted). Any other configured value
//! is kept as [`Destination::Unknown`] so the engine can refuse to delete data
//! it does not know how to handle.
//!
//! Remote uploads are S3 `PUT`s authenticated with AWS Signature Version 4,
//! which S3-compatible stores (Linode Object Storage, `MinIO`, AWS itself)
//! accept.

use std::{fmt, path::Path};

use async_trait::async_trait;
use hmac::digest::InvalidLength;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use crate::clock;

mod sigv4;

/// Default interval between upload retries, in seconds.
pub const DEFAULT_UPLOAD_RETRY_SECS: f64 = 30.0;
/// Signing region used when an explicit endpoint is configured without one.
pub const DEFAULT_SIGNING_REGION: &str = "us-east-1";

fn default_upload_retry() -> f64 {
    DEFAULT_UPLOAD_RETRY_SECS
}

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Uploader`] implementations.
pub enum Error {
    /// The storage configuration lacks a field a remote upload needs.
    #[error("Remote storage is missing `{0}`")]
    MissingField(&'static str),
    /// The endpoint is not an absolute `http` or `https` URL.
    #[error("Invalid remote endpoint: {0}")]
    Endpoint(String),
    /// The artifact could not be read.
    #[error("Cannot read artifact [{path}]: {err}")]
    Read {
        /// The artifact path
        path: String,
        /// The error
        err: std::io::Error,
    },
    /// The artifact path has no file name to use as the object name.
    #[error("Artifact path has no file name: {0}")]
    NoFileName(String),
    /// Transport-level failure.
    #[error("Upload request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The request could not be signed.
    #[error("Cannot sign upload: {0}")]
    Signing(#[from] InvalidLength),
    /// The store answered with a non-success status.
    #[error("Upload rejected with status {0}")]
    Status(u16),
}

/// Where compressed artifacts go after rotation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Destination {
    /// Delete the artifact.
    #[default]
    None,
    /// Keep the artifact on local disk.
    Local,
    /// Upload the artifact, then delete it.
    Remote,
    /// Unrecognized configuration, artifact retained.
    Unknown(String),
}

impl From<String> for Destination {
    fn from(value: String) -> Self {
        match value.as_str() {
            "none" => Destination::None,
            "local" => Destination::Local,
            "remote" => Destination::Remote,
            _ => Destination::Unknown(value),
        }
    }
}

impl From<Destination> for String {
    fn from(value: Destination) -> Self {
        match value {
            Destination::None => "none".to_string(),
            Destination::Local => "local".to_string(),
            Destination::Remote => "remote".to_string(),
            Destination::Unknown(other) => other,
        }
    }
}

/// The `storage` object of a rotation policy.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Storage {
    /// Artifact disposition.
    #[serde(default)]
    pub destination: Destination,
    /// Access key for the remote store.
    #[serde(default)]
    pub access_key_id: Option<String>,
    /// Secret key for the remote store.
    #[serde(default)]
    pub secret_access_key: Option<String>,
    /// Region of the remote store. Derives the default endpoint and scopes the
    /// request signature.
    #[serde(default)]
    pub region: Option<String>,
    /// Bucket receiving artifacts.
    #[serde(default)]
    pub bucket: Option<String>,
    /// Base URL of the remote store, overriding the region-derived default.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Seconds between upload retry attempts.
    #[serde(default = "default_upload_retry")]
    pub upload_retry_time_secs: f64,
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            destination: Destination::None,
            access_key_id: None,
            secret_access_key: None,
            region: None,
            bucket: None,
            endpoint: None,
            upload_retry_time_secs: DEFAULT_UPLOAD_RETRY_SECS,
        }
    }
}

fn redact(secret: Option<&String>) -> Option<&'static str> {
    secret.map(|_| "xxxx")
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("destination", &self.destination)
            .field("access_key_id", &redact(self.access_key_id.as_ref()))
            .field("secret_access_key", &redact(self.secret_access_key.as_ref()))
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .field("endpoint", &self.endpoint)
            .field("upload_retry_time_secs", &self.upload_retry_time_secs)
            .finish()
    }
}

impl Storage {
    /// Resolve the settings a remote upload needs.
    ///
    /// # Errors
    ///
    /// Returns `Error::MissingField` naming the first absent field.
    pub fn remote(&self) -> Result<Remote, Error> {
        let access_key_id = self
            .access_key_id
            .clone()
            .ok_or(Error::MissingField("accessKeyId"))?;
        let secret_access_key = self
            .secret_access_key
            .clone()
            .ok_or(Error::MissingField("secretAccessKey"))?;
        let bucket = self.bucket.clone().ok_or(Error::MissingField("bucket"))?;
        let (endpoint, region) = match (&self.endpoint, &self.region) {
            (Some(endpoint), region) => (
                endpoint.clone(),
                region
                    .clone()
                    .unwrap_or_else(|| DEFAULT_SIGNING_REGION.to_string()),
            ),
            (None, Some(region)) => (
                format!("https://{region}.linodeobjects.com"),
                region.clone(),
            ),
            (None, None) => return Err(Error::MissingField("region")),
        };
        let endpoint =
            Url::parse(&endpoint).map_err(|err| Error::Endpoint(format!("{endpoint}: {err}")))?;
        if !matches!(endpoint.scheme(), "http" | "https") || endpoint.host_str().is_none() {
            return Err(Error::Endpoint(endpoint.to_string()));
        }
        Ok(Remote {
            endpoint,
            region,
            bucket,
            access_key_id,
            secret_access_key,
        })
    }
}

/// Fully resolved remote store settings.
#[derive(Clone, PartialEq, Eq)]
pub struct Remote {
    /// Base URL; a path, if any, prefixes every object
    pub endpoint: Url,
    /// Signing region
    pub region: String,
    /// Bucket receiving artifacts
    pub bucket: String,
    /// Access key
    pub access_key_id: String,
    /// Secret key
    pub secret_access_key: String,
}

impl fmt::Debug for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Remote")
            .field("endpoint", &self.endpoint.as_str())
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .field("access_key_id", &"xxxx")
            .field("secret_access_key", &"xxxx")
            .finish()
    }
}

impl Remote {
    /// URL an artifact named `object` is uploaded to, path-style:
    /// `<endpoint>/<bucket>/<object>`.
    #[must_use]
    pub fn object_url(&self, object: &str) -> Url {
        let path = format!(
            "{}/{}/{}",
            self.endpoint.path().trim_end_matches('/'),
            sigv4::encode_segment(&self.bucket),
            sigv4::encode_segment(object),
        );
        let mut url = self.endpoint.clone();
        url.set_path(&path);
        url.set_query(None);
        url
    }
}

#[async_trait]
/// Uploads an artifact to a remote store. There is no partial success: an
/// `Ok` means the object is stored.
pub trait Uploader {
    /// Upload the file at `path` to `remote`.
    async fn upload(&self, remote: &Remote, path: &Path) -> Result<(), Error>;
}

#[derive(Debug, Clone, Default)]
/// Uploads with an HTTP `PUT` of the whole artifact to
/// `<endpoint>/<bucket>/<file name>`, signed with AWS Signature Version 4.
pub struct HttpUploader {
    client: reqwest::Client,
}

impl HttpUploader {
    /// Create a new [`HttpUploader`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(&self, remote: &Remote, path: &Path) -> Result<(), Error> {
        let object = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::NoFileName(path.display().to_string()))?;
        let body = fs::read(path).await.map_err(|err| Error::Read {
            path: path.display().to_string(),
            err,
        })?;

        let url = remote.object_url(object);
        let signed = sigv4::sign_put(
            &url,
            &remote.region,
            &remote.access_key_id,
            &remote.secret_access_key,
            &body,
            clock::utc_now(),
        )?;
        debug!(%url, bytes = body.len(), "uploading artifact");
        let response = self
            .client
            .put(url)
            .header("x-amz-date", signed.amz_date)
            .header("x-amz-content-sha256", signed.content_sha256)
            .header(reqwest::header::AUTHORIZATION, signed.authorization)
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::Status(status.as_u16()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_parses_known_and_unknown() {
        let parse = |s: &str| -> Destination {
            serde_json::from_value(serde_json::Value::String(s.to_string())).expect("parse")
        };
        assert_eq!(parse("none"), Destination::None);
        assert_eq!(parse("local"), Destination::Local);
        assert_eq!(parse("remote"), Destination::Remote);
        assert_eq!(parse("yo"), Destination::Unknown("yo".to_string()));
    }

    #[test]
    fn storage_defaults() {
        let storage: Storage = serde_json::from_str("{}").expect("parse");
        assert_eq!(storage.destination, Destination::None);
        assert!((storage.upload_retry_time_secs - DEFAULT_UPLOAD_RETRY_SECS).abs() < f64::EPSILON);
    }

    #[test]
    fn remote_resolution() {
        let storage: Storage = serde_json::from_str(
            r#"{
                "destination": "remote",
                "accessKeyId": "id",
                "secretAccessKey": "secret",
                "region": "us-east-1",
                "bucket": "dumps"
            }"#,
        )
        .expect("parse");
        let remote = storage.remote().expect("resolve");
        assert_eq!(
            remote.object_url("a.tar.gz").as_str(),
            "https://us-east-1.linodeobjects.com/dumps/a.tar.gz"
        );
        assert_eq!(remote.region, "us-east-1");

        let endpoint = Storage {
            endpoint: Some("http://127.0.0.1:9000/".to_string()),
            region: None,
            ..storage.clone()
        };
        let remote = endpoint.remote().expect("resolve");
        assert_eq!(
            remote.object_url("a.tar.gz").as_str(),
            "http://127.0.0.1:9000/dumps/a.tar.gz"
        );
        assert_eq!(remote.region, DEFAULT_SIGNING_REGION);

        let prefixed = Storage {
            endpoint: Some("https://proxy.local/s3/".to_string()),
            ..storage.clone()
        };
        assert_eq!(
            prefixed
                .remote()
                .expect("resolve")
                .object_url("my app.tar.gz")
                .as_str(),
            "https://proxy.local/s3/dumps/my%20app.tar.gz"
        );

        let bad = Storage {
            endpoint: Some("not a url".to_string()),
            ..storage.clone()
        };
        assert!(matches!(bad.remote(), Err(Error::Endpoint(_))));

        let missing = Storage {
            bucket: None,
            ..storage
        };
        assert!(matches!(
            missing.remote(),
            Err(Error::MissingField("bucket"))
        ));
    }

    #[test]
    fn debug_redacts_secrets() {
        let storage = Storage {
            access_key_id: Some("AKIA-very-secret".to_string()),
            secret_access_key: Some("hunter2".to_string()),
            ..Storage::default()
        };
        let out = format!("{storage:?}");
        assert!(!out.contains("AKIA-very-secret"));
        assert!(!out.contains("hunter2"));
        assert!(out.contains("xxxx"));
    }
}
