//! Request signing for the provider's query API.
//!
//! Two schemes are supported. Legacy signing (`SignatureVersion=2`) computes
//! an HMAC-SHA256 over `METHOD\nHOST\n/\nQUERY` and base64-encodes the digest.
//! SigV4 derives a date, region and service scoped key through chained HMACs
//! and presigns the query string, producing a lowercase hex signature.
//!
//! Every call builds a fresh [`SignedRequest`]; nothing here is cached between
//! requests.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use sha2::{Digest, Sha256};
use thiserror::Error;


type HmacSha256 = Hmac<Sha256>;

/// HTTP method used for every query API call.
pub const METHOD: &str = "GET";
/// Value of `SignatureMethod` sent with legacy-signed requests.
pub const LEGACY_SIGNATURE_METHOD: &str = "HmacSHA256";
/// Algorithm identifier for SigV4.
pub const V4_ALGORITHM: &str = "AWS4-HMAC-SHA256";
/// Lifetime, in seconds, of a SigV4 presigned URL.
pub const V4_EXPIRES_SECONDS: u32 = 30;

const V4_SIGNED_HEADERS: &str = "host";
const V4_TERMINATOR: &str = "aws4_request";

/// Everything outside RFC 3986 unreserved characters is percent-encoded,
/// including `/`.
const QUERY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Errors raised while computing a signature.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum SignError {
    /// The HMAC implementation rejected the supplied key.
    #[error("signing key rejected: {0}")]
    InvalidKey(String),
}

/// Credentials used to sign a request.
#[derive(Clone, Copy, Debug)]
pub struct Credentials<'a> {
    /// Access key identifier sent in the clear.
    pub access_key_id: &'a str,
    /// Secret key used for the HMAC. Never logged.
    pub secret_key: &'a str,
}

/// A request ready to be sent: the canonical input, its signature and the
/// final URL with the signature appended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SignedRequest {
    /// HTTP method, always `GET`.
    pub method: &'static str,
    /// Host the request is addressed to.
    pub endpoint_host: String,
    /// Canonical string (legacy) or canonical query string (SigV4) that was
    /// signed.
    pub canonical: String,
    /// The computed signature, base64 for legacy and hex for SigV4.
    pub signature: String,
    /// Full `https://` URL including the signature parameter.
    pub url: String,
}

/// Percent-encodes `input` for use in a canonical query string.
#[must_use]
pub fn uri_encode(input: &str) -> String {
    utf8_percent_encode(input, QUERY_ENCODE_SET).to_string()
}

/// Joins `params` into `key=value` pairs sorted by key, encoding both sides.
#[must_use]
pub fn canonical_query(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(key, value)| format!("{}={}", uri_encode(key), uri_encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Builds the string signed by the legacy scheme.
#[must_use]
pub fn legacy_canonical_string(method: &str, host: &str, query: &str) -> String {
    format!("{method}\n{host}\n/\n{query}")
}

/// Lowercase hex SHA-256 of `data`.
#[must_use]
pub fn sha256_hex(data: &str) -> String {
    hex::encode(Sha256::digest(data.as_bytes()))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, SignError> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|err| SignError::InvalidKey(err.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Signs `canonical` with the legacy scheme and returns the base64 digest.
///
/// # Errors
///
/// Returns [`SignError::InvalidKey`] if the HMAC cannot be keyed.
pub fn sign_legacy(secret_key: &str, canonical: &str) -> Result<String, SignError> {
    let digest = hmac_sha256(secret_key.as_bytes(), canonical.as_bytes())?;
    Ok(BASE64.encode(digest))
}

/// Derives the SigV4 signing key for `date_stamp` (`YYYYMMDD`), `region` and
/// `service`.
///
/// # Errors
///
/// Returns [`SignError::InvalidKey`] if any HMAC stage cannot be keyed.
pub fn derive_signing_key(
    secret_key: &str,
    date_stamp: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>, SignError> {
    let k_secret = format!("AWS4{secret_key}");
    let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, V4_TERMINATOR.as_bytes())
}

/// Signs `string_to_sign` with the derived SigV4 key and returns lowercase
/// hex.
///
/// # Errors
///
/// Returns [`SignError::InvalidKey`] if key derivation fails.
pub fn sign_v4(
    secret_key: &str,
    date_stamp: &str,
    region: &str,
    service: &str,
    string_to_sign: &str,
) -> Result<String, SignError> {
    let key = derive_signing_key(secret_key, date_stamp, region, service)?;
    Ok(hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?))
}

/// Presigns `params` with the legacy scheme.
///
/// Adds `AWSAccessKeyId`, `SignatureMethod`, `SignatureVersion` and
/// `Timestamp` to the parameter set before signing.
///
/// # Errors
///
/// Returns [`SignError`] when signing fails.
pub fn presign_legacy(
    credentials: Credentials<'_>,
    endpoint_host: &str,
    mut params: BTreeMap<String, String>,
    timestamp: DateTime<Utc>,
) -> Result<SignedRequest, SignError> {
    params.insert(
        String::from("AWSAccessKeyId"),
        credentials.access_key_id.to_owned(),
    );
    params.insert(
        String::from("SignatureMethod"),
        String::from(LEGACY_SIGNATURE_METHOD),
    );
    params.insert(String::from("SignatureVersion"), String::from("2"));
    params.insert(
        String::from("Timestamp"),
        timestamp.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
    );

    let query = canonical_query(&params);
    let canonical = legacy_canonical_string(METHOD, endpoint_host, &query);
    let signature = sign_legacy(credentials.secret_key, &canonical)?;
    let url = format!(
        "https://{endpoint_host}/?{query}&Signature={}",
        uri_encode(&signature)
    );

    Ok(SignedRequest {
        method: METHOD,
        endpoint_host: endpoint_host.to_owned(),
        canonical,
        signature,
        url,
    })
}

/// Presigns `params` with SigV4 for `region` and `service`.
///
/// `SignatureVersion=4` stays in the parameter set; the `X-Amz-*` presign
/// parameters are appended after the sorted user parameters.
///
/// # Errors
///
/// Returns [`SignError`] when signing fails.
pub fn presign_v4(
    credentials: Credentials<'_>,
    endpoint_host: &str,
    region: &str,
    service: &str,
    mut params: BTreeMap<String, String>,
    timestamp: DateTime<Utc>,
) -> Result<SignedRequest, SignError> {
    params.insert(String::from("SignatureVersion"), String::from("4"));

    let amz_date = timestamp.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = timestamp.format("%Y%m%d").to_string();
    let scope = format!("{date_stamp}/{region}/{service}/{V4_TERMINATOR}");
    let credential = format!("{}/{scope}", credentials.access_key_id);

    let canonical = format!(
        "{}&X-Amz-Algorithm={V4_ALGORITHM}&X-Amz-Credential={}&X-Amz-Date={amz_date}\
         &X-Amz-Expires={V4_EXPIRES_SECONDS}&X-Amz-SignedHeaders={V4_SIGNED_HEADERS}",
        canonical_query(&params),
        uri_encode(&credential),
    );
    let canonical_request = format!(
        "{METHOD}\n/\n{canonical}\nhost:{endpoint_host}\n\n{V4_SIGNED_HEADERS}\n{}",
        sha256_hex("")
    );
    let string_to_sign = format!(
        "{V4_ALGORITHM}\n{amz_date}\n{scope}\n{}",
        sha256_hex(&canonical_request)
    );
    let signature = sign_v4(
        credentials.secret_key,
        &date_stamp,
        region,
        service,
        &string_to_sign,
    )?;
    let url = format!("https://{endpoint_host}/?{canonical}&X-Amz-Signature={signature}");

    Ok(SignedRequest {
        method: METHOD,
        endpoint_host: endpoint_host.to_owned(),
        canonical,
        signature,
        url,
    })
}
