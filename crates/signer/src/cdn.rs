//! Serving signed links through a CDN in front of the bucket.

use crate::error::{SignerError, SignerResult};
use crate::headers::ResponseHeaders;
use crate::signer::DirectLinkSigner;
use tracing::debug;
use url::Url;

/// Wraps a signer and points its links at a CDN host.
///
/// Only the host and port change. The path and signed query are passed
/// through untouched, so the CDN forwards a request the origin accepts.
#[derive(Clone, Debug)]
pub struct CdnLinkSigner<S> {
    inner: S,
    host: String,
    port: Option<u16>,
}

impl<S: DirectLinkSigner> CdnLinkSigner<S> {
    /// `cdn_host` is a bare `host` or `host:port`.
    pub fn new(inner: S, cdn_host: &str) -> SignerResult<Self> {
        let invalid = |reason: &str| SignerError::InvalidCdnHost(format!("{cdn_host:?}: {reason}"));
        if cdn_host.is_empty() || cdn_host.contains(['/', '?', '#', '@']) {
            return Err(invalid("expected host[:port]"));
        }

        let parsed = Url::parse(&format!("https://{cdn_host}")).map_err(|e| invalid(&e.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| invalid("missing host"))?
            .to_string();

        Ok(Self {
            inner,
            host,
            port: parsed.port(),
        })
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

impl<S: DirectLinkSigner> DirectLinkSigner for CdnLinkSigner<S> {
    fn direct_url(
        &self,
        key: &str,
        headers: &ResponseHeaders,
        expires_in_secs: u64,
    ) -> SignerResult<Url> {
        let mut url = self.inner.direct_url(key, headers, expires_in_secs)?;
        url.set_host(Some(&self.host))
            .map_err(|e| SignerError::InvalidCdnHost(e.to_string()))?;
        url.set_port(self.port)
            .map_err(|()| SignerError::InvalidCdnHost(format!("cannot set port on {url}")))?;
        debug!(cdn_host = %self.host, "rewrote signed link to CDN");
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::SigningCredentials;
    use crate::signer::{BucketLocator, S3LinkSigner, verify_presigned};
    use time::OffsetDateTime;

    fn fixed_time() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    fn origin() -> S3LinkSigner {
        let locator =
            BucketLocator::new("blobs", Some("eu-west-1"), Some("http://minio:9000"), true)
                .unwrap();
        S3LinkSigner::new(locator, SigningCredentials::new("id", "secret")).with_clock(fixed_time)
    }

    #[test]
    fn test_only_authority_changes() {
        let headers = ResponseHeaders::attachment("file.bin", Some("application/octet-stream"));
        let direct = origin().direct_url("binaries/abc", &headers, 600).unwrap();
        let cdn = CdnLinkSigner::new(origin(), "cdn.example.com")
            .unwrap()
            .direct_url("binaries/abc", &headers, 600)
            .unwrap();

        assert_eq!(cdn.host_str(), Some("cdn.example.com"));
        assert_eq!(cdn.port(), None);
        assert_eq!(cdn.scheme(), direct.scheme());
        assert_eq!(cdn.path(), direct.path());
        assert_eq!(cdn.query(), direct.query());
    }

    #[test]
    fn test_cdn_port_is_applied() {
        let cdn = CdnLinkSigner::new(origin(), "cdn.example.com:8443").unwrap();
        let url = cdn.direct_url("k", &ResponseHeaders::new(), 60).unwrap();
        assert_eq!(url.host_str(), Some("cdn.example.com"));
        assert_eq!(url.port(), Some(8443));
    }

    #[test]
    fn test_rewritten_link_still_verifies_against_origin() {
        let signer = origin();
        let locator = signer.locator().clone();
        let cdn = CdnLinkSigner::new(signer, "cdn.example.com").unwrap();
        let url = cdn.direct_url("k", &ResponseHeaders::new(), 60).unwrap();

        let creds = SigningCredentials::new("id", "secret");
        assert!(verify_presigned(&locator, &creds, &url, fixed_time()).is_ok());
    }

    #[test]
    fn test_rejects_urls_as_host() {
        for bad in ["", "https://cdn.example.com", "cdn.example.com/path", "user@cdn", "cdn:notaport"] {
            assert!(
                CdnLinkSigner::new(origin(), bad).is_err(),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_errors_from_inner_signer_propagate() {
        let cdn = CdnLinkSigner::new(origin(), "cdn.example.com").unwrap();
        assert!(matches!(
            cdn.direct_url("k", &ResponseHeaders::new(), 0),
            Err(SignerError::InvalidExpiry { .. })
        ));
    }
}
