//! AWS Signature Version 4 for single-request `PUT`s to an S3-compatible
//! store.
//!
//! Only what an artifact upload needs is covered: no query string, and three
//! signed headers (`host`, `x-amz-content-sha256` and `x-amz-date`). The
//! payload is hashed in full rather than sent as `UNSIGNED-PAYLOAD`.

use std::fmt::Write as _;

use hmac::{Hmac, Mac, digest::InvalidLength};
use reqwest::Url;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";
const SIGNED_HEADERS: &str = "host;x-amz-content-sha256;x-amz-date";

/// Headers to attach to a signed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Signed {
    pub(crate) authorization: String,
    pub(crate) amz_date: String,
    pub(crate) content_sha256: String,
}

/// Percent-encode one path segment. Everything outside `A-Za-z0-9-._~` is
/// escaped, `/` included.
pub(crate) fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for b in segment.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
            out.push(char::from(b));
        } else {
            let _ = write!(out, "%{b:02X}");
        }
    }
    out
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(key)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn signing_key(
    secret_access_key: &str,
    date: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>, InvalidLength> {
    let k_date = hmac(format!("AWS4{secret_access_key}").as_bytes(), date.as_bytes())?;
    let k_region = hmac(&k_date, region.as_bytes())?;
    let k_service = hmac(&k_region, service.as_bytes())?;
    hmac(&k_service, b"aws4_request")
}

fn host(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn canonical_request(url: &Url, amz_date: &str, content_sha256: &str) -> String {
    format!(
        "PUT\n{path}\n\nhost:{host}\nx-amz-content-sha256:{content_sha256}\nx-amz-date:{amz_date}\n\n{SIGNED_HEADERS}\n{content_sha256}",
        path = url.path(),
        host = host(url),
    )
}

/// Sign a `PUT` of `body` to `url` at time `at`.
///
/// `url` must already carry a path in canonical form, see
/// [`encode_segment`]; it is signed exactly as it will be sent.
pub(crate) fn sign_put(
    url: &Url,
    region: &str,
    access_key_id: &str,
    secret_access_key: &str,
    body: &[u8],
    at: OffsetDateTime,
) -> Result<Signed, InvalidLength> {
    let date = format!(
        "{:04}{:02}{:02}",
        at.year(),
        u8::from(at.month()),
        at.day()
    );
    let amz_date = format!(
        "{date}T{:02}{:02}{:02}Z",
        at.hour(),
        at.minute(),
        at.second()
    );
    let content_sha256 = hex::encode(Sha256::digest(body));

    let scope = format!("{date}/{region}/{SERVICE}/aws4_request");
    let canonical = canonical_request(url, &amz_date, &content_sha256);
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical.as_bytes()))
    );
    let key = signing_key(secret_access_key, &date, region, SERVICE)?;
    let signature = hex::encode(hmac(&key, string_to_sign.as_bytes())?);

    Ok(Signed {
        authorization: format!(
            "{ALGORITHM} Credential={access_key_id}/{scope}, SignedHeaders={SIGNED_HEADERS}, Signature={signature}"
        ),
        amz_date,
        content_sha256,
    })
}
