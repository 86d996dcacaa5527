//! SigV4 query-string signing of object download links.

use crate::error::{SignerError, SignerResult};
use crate::headers::ResponseHeaders;
use crate::key::SigningCredentials;
use depot_core::MAX_LINK_EXPIRY_SECS;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use sha2::{Digest as _, Sha256};
use std::collections::BTreeMap;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Duration, OffsetDateTime, PrimitiveDateTime, UtcOffset};
use tracing::{debug, instrument};
use url::Url;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
const DEFAULT_REGION: &str = "us-east-1";

const PARAM_ALGORITHM: &str = "X-Amz-Algorithm";
const PARAM_CREDENTIAL: &str = "X-Amz-Credential";
const PARAM_DATE: &str = "X-Amz-Date";
const PARAM_EXPIRES: &str = "X-Amz-Expires";
const PARAM_SECURITY_TOKEN: &str = "X-Amz-Security-Token";
const PARAM_SIGNED_HEADERS: &str = "X-Amz-SignedHeaders";
const PARAM_SIGNATURE: &str = "X-Amz-Signature";

/// Unreserved characters per RFC 3986; SigV4 escapes everything else.
const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Unreserved plus `/`, for object key paths.
const UNRESERVED_PATH: &AsciiSet = &UNRESERVED.remove(b'/');

/// Where a bucket is reached: endpoint, region and addressing style.
#[derive(Clone, Debug)]
pub struct BucketLocator {
    bucket: String,
    region: String,
    endpoint: Option<Url>,
    force_path_style: bool,
}

impl BucketLocator {
    /// Locate `bucket`, on AWS when `endpoint` is `None`.
    pub fn new(
        bucket: impl Into<String>,
        region: Option<&str>,
        endpoint: Option<&str>,
        force_path_style: bool,
    ) -> SignerResult<Self> {
        let bucket = bucket.into();
        if bucket.is_empty() || bucket.contains('/') {
            return Err(SignerError::InvalidLocator(format!(
                "invalid bucket name {bucket:?}"
            )));
        }

        let endpoint = endpoint
            .map(|raw| {
                let url = Url::parse(raw)
                    .map_err(|e| SignerError::InvalidEndpoint(format!("{raw}: {e}")))?;
                if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
                    return Err(SignerError::InvalidEndpoint(format!(
                        "{raw}: expected an http(s) URL with a host"
                    )));
                }
                Ok(url)
            })
            .transpose()?;

        Ok(Self {
            bucket,
            region: region
                .filter(|r| !r.is_empty())
                .unwrap_or(DEFAULT_REGION)
                .to_string(),
            endpoint,
            force_path_style,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Scheme and `Host` header value of the origin.
    fn origin(&self) -> (String, String) {
        match &self.endpoint {
            Some(url) => {
                let mut host = url.host_str().unwrap_or_default().to_string();
                if let Some(port) = url.port() {
                    host = format!("{host}:{port}");
                }
                if !self.force_path_style {
                    host = format!("{}.{host}", self.bucket);
                }
                (url.scheme().to_string(), host)
            }
            None => {
                let service = if self.region == DEFAULT_REGION {
                    "s3.amazonaws.com".to_string()
                } else {
                    format!("s3.{}.amazonaws.com", self.region)
                };
                let host = if self.force_path_style {
                    service
                } else {
                    format!("{}.{service}", self.bucket)
                };
                ("https".to_string(), host)
            }
        }
    }

    /// Canonical (already escaped) path of an object key.
    fn object_path(&self, key: &str) -> String {
        let key = utf8_percent_encode(key.trim_start_matches('/'), UNRESERVED_PATH);
        if self.force_path_style {
            format!("/{}/{key}", self.bucket)
        } else {
            format!("/{key}")
        }
    }
}

/// Everything a signature binds for one link.
#[derive(Clone, Debug)]
pub struct LinkParams {
    pub key: String,
    pub issued_at: OffsetDateTime,
    pub expires_in_secs: u64,
    pub response_headers: ResponseHeaders,
}

impl LinkParams {
    pub fn new(key: impl Into<String>, issued_at: OffsetDateTime, expires_in_secs: u64) -> Self {
        Self {
            key: key.into(),
            issued_at,
            expires_in_secs,
            response_headers: ResponseHeaders::default(),
        }
    }

    pub fn with_response_headers(mut self, headers: ResponseHeaders) -> Self {
        self.response_headers = headers;
        self
    }
}

fn check_expiry(secs: u64) -> SignerResult<()> {
    if secs == 0 || secs > MAX_LINK_EXPIRY_SECS {
        return Err(SignerError::InvalidExpiry {
            secs,
            max: MAX_LINK_EXPIRY_SECS,
        });
    }
    Ok(())
}

/// Presign a GET of `params.key`.
///
/// Pure: the same inputs always yield the same URL.
pub fn presign_get(
    locator: &BucketLocator,
    credentials: &SigningCredentials,
    params: &LinkParams,
) -> SignerResult<Url> {
    check_expiry(params.expires_in_secs)?;
    if params.key.is_empty() {
        return Err(SignerError::InvalidLocator("empty object key".to_string()));
    }

    let (scheme, host) = locator.origin();
    let path = locator.object_path(&params.key);
    let amz_date = format_amz_date(params.issued_at)?;
    let date = &amz_date[..8];
    let scope = format!("{date}/{}/s3/aws4_request", locator.region);

    let mut query = BTreeMap::new();
    query.insert(PARAM_ALGORITHM.to_string(), ALGORITHM.to_string());
    query.insert(
        PARAM_CREDENTIAL.to_string(),
        format!("{}/{scope}", credentials.access_key_id()),
    );
    query.insert(PARAM_DATE.to_string(), amz_date.clone());
    query.insert(PARAM_EXPIRES.to_string(), params.expires_in_secs.to_string());
    if let Some(token) = credentials.session_token() {
        query.insert(PARAM_SECURITY_TOKEN.to_string(), token.to_string());
    }
    query.insert(PARAM_SIGNED_HEADERS.to_string(), "host".to_string());
    for (name, value) in params.response_headers.query_params() {
        query.insert(name.to_string(), value.to_string());
    }

    let canonical_query = canonical_query_string(&query);
    let string_to_sign = string_to_sign(&amz_date, &scope, &path, &canonical_query, &host);
    let signature = credentials
        .signing_key(date, &locator.region)?
        .sign(&string_to_sign)?;

    let raw = format!(
        "{scheme}://{host}{path}?{canonical_query}&{PARAM_SIGNATURE}={signature}"
    );
    Url::parse(&raw).map_err(|e| SignerError::InvalidEndpoint(format!("{raw}: {e}")))
}

/// Check that `url` was signed by `credentials` for this bucket and has not
/// expired at `now`.
///
/// The signature is recomputed against the origin host, so links whose
/// authority was rewritten to a CDN still verify.
pub fn verify_presigned(
    locator: &BucketLocator,
    credentials: &SigningCredentials,
    url: &Url,
    now: OffsetDateTime,
) -> SignerResult<()> {
    let mut query = BTreeMap::new();
    let mut signature = None;
    for (name, value) in url.query_pairs() {
        if name == PARAM_SIGNATURE {
            signature = Some(value.into_owned());
        } else if query
            .insert(name.clone().into_owned(), value.into_owned())
            .is_some()
        {
            return Err(SignerError::Malformed(format!("duplicate parameter {name}")));
        }
    }

    let signature =
        signature.ok_or_else(|| SignerError::Malformed(format!("missing {PARAM_SIGNATURE}")))?;
    let param = |name: &str| {
        query
            .get(name)
            .cloned()
            .ok_or_else(|| SignerError::Malformed(format!("missing {name}")))
    };

    if param(PARAM_ALGORITHM)? != ALGORITHM {
        return Err(SignerError::Malformed("unsupported algorithm".to_string()));
    }
    let amz_date = param(PARAM_DATE)?;
    let issued_at = parse_amz_date(&amz_date)?;
    let expires_in_secs: u64 = param(PARAM_EXPIRES)?
        .parse()
        .map_err(|_| SignerError::Malformed(format!("invalid {PARAM_EXPIRES}")))?;

    let scope = format!("{}/{}/s3/aws4_request", &amz_date[..8], locator.region);
    if param(PARAM_CREDENTIAL)? != format!("{}/{scope}", credentials.access_key_id()) {
        return Err(SignerError::VerificationFailed);
    }

    let (_, host) = locator.origin();
    let canonical_query = canonical_query_string(&query);
    let string_to_sign = string_to_sign(&amz_date, &scope, url.path(), &canonical_query, &host);
    credentials
        .signing_key(&amz_date[..8], &locator.region)?
        .verify(&string_to_sign, &signature)?;

    let expires_in = i64::try_from(expires_in_secs).unwrap_or(i64::MAX);
    if now >= issued_at.saturating_add(Duration::seconds(expires_in)) {
        return Err(SignerError::Expired);
    }
    Ok(())
}

fn canonical_query_string(params: &BTreeMap<String, String>) -> String {
    let encoded: BTreeMap<String, String> = params
        .iter()
        .map(|(k, v)| {
            (
                utf8_percent_encode(k, UNRESERVED).to_string(),
                utf8_percent_encode(v, UNRESERVED).to_string(),
            )
        })
        .collect();
    encoded
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn string_to_sign(
    amz_date: &str,
    scope: &str,
    canonical_path: &str,
    canonical_query: &str,
    host: &str,
) -> String {
    let canonical_request = format!(
        "GET\n{canonical_path}\n{canonical_query}\nhost:{host}\n\nhost\n{UNSIGNED_PAYLOAD}"
    );
    let hashed = hex::encode(Sha256::digest(canonical_request.as_bytes()));
    format!("{ALGORITHM}\n{amz_date}\n{scope}\n{hashed}")
}

/// `YYYYMMDD'T'HHMMSS'Z'`, the only date form SigV4 accepts.
const AMZ_DATE: &[BorrowedFormatItem<'static>] =
    format_description!("[year][month][day]T[hour][minute][second]Z");

fn format_amz_date(at: OffsetDateTime) -> SignerResult<String> {
    at.to_offset(UtcOffset::UTC)
        .format(AMZ_DATE)
        .map_err(|e| SignerError::Malformed(format!("cannot format {PARAM_DATE}: {e}")))
}

fn parse_amz_date(raw: &str) -> SignerResult<OffsetDateTime> {
    PrimitiveDateTime::parse(raw, AMZ_DATE)
        .map(PrimitiveDateTime::assume_utc)
        .map_err(|e| SignerError::Malformed(format!("invalid {PARAM_DATE} {raw:?}: {e}")))
}

/// Issues time-limited download links for object keys.
pub trait DirectLinkSigner: Send + Sync {
    /// Signed URL for `key`, valid for `expires_in_secs` seconds.
    fn direct_url(
        &self,
        key: &str,
        headers: &ResponseHeaders,
        expires_in_secs: u64,
    ) -> SignerResult<Url>;
}

/// Signs links straight to the bucket with the current time.
#[derive(Clone, Debug)]
pub struct S3LinkSigner {
    locator: BucketLocator,
    credentials: SigningCredentials,
    clock: fn() -> OffsetDateTime,
}

impl S3LinkSigner {
    pub fn new(locator: BucketLocator, credentials: SigningCredentials) -> Self {
        Self {
            locator,
            credentials,
            clock: OffsetDateTime::now_utc,
        }
    }

    /// Replace the clock used for issue times.
    pub fn with_clock(mut self, clock: fn() -> OffsetDateTime) -> Self {
        self.clock = clock;
        self
    }

    pub fn locator(&self) -> &BucketLocator {
        &self.locator
    }

    /// Verify a link issued by this signer at the current time.
    pub fn verify(&self, url: &Url) -> SignerResult<()> {
        verify_presigned(&self.locator, &self.credentials, url, (self.clock)())
    }
}

impl DirectLinkSigner for S3LinkSigner {
    #[instrument(skip(self, headers), fields(bucket = %self.locator.bucket))]
    fn direct_url(
        &self,
        key: &str,
        headers: &ResponseHeaders,
        expires_in_secs: u64,
    ) -> SignerResult<Url> {
        let params = LinkParams::new(key, (self.clock)(), expires_in_secs)
            .with_response_headers(headers.clone());
        let url = presign_get(&self.locator, &self.credentials, &params)?;
        debug!(expires_in_secs, "issued signed link");
        Ok(url)
    }
}
