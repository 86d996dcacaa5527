//! Sealed listing cursors.
//!
//! Backends never hand out their raw cursor. [`seal`] wraps it in a small JSON
//! document naming the backend, prefix and clamped page size of the listing
//! that produced it, and [`open`] gives the cursor back only to that same
//! listing.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ContinuationToken, ListingOptions};
use serde::{Deserialize, Serialize};

const FORMAT_VERSION: u8 = 1;

/// Which store a cursor belongs to.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendIdentity {
    S3 {
        endpoint: String,
        region: String,
        bucket: String,
    },
    Filesystem {
        root: String,
    },
    /// Unique per in-process instance.
    Memory {
        instance: String,
    },
}

#[derive(Serialize, Deserialize)]
struct Sealed {
    v: u8,
    backend: BackendIdentity,
    prefix: String,
    page_size: usize,
    cursor: String,
}

fn invalid(reason: String) -> StorageError {
    StorageError::InvalidContinuationToken(reason)
}

/// Bind `cursor` to the listing it was produced by.
///
/// Fails when the result would not fit in a [`ContinuationToken`].
pub fn seal(
    backend: &BackendIdentity,
    prefix: &str,
    options: &ListingOptions,
    cursor: &str,
) -> StorageResult<ContinuationToken> {
    let sealed = Sealed {
        v: FORMAT_VERSION,
        backend: backend.clone(),
        prefix: prefix.to_string(),
        page_size: options.normalized_page_size(),
        cursor: cursor.to_string(),
    };
    let bytes = serde_json::to_vec(&sealed).map_err(|e| invalid(format!("encode: {e}")))?;
    ContinuationToken::new(bytes)
}

/// Recover the cursor sealed into `token`, provided it was issued for this
/// backend, prefix and page size.
pub fn open(
    token: &ContinuationToken,
    backend: &BackendIdentity,
    prefix: &str,
    options: &ListingOptions,
) -> StorageResult<String> {
    let sealed: Sealed = serde_json::from_slice(token.as_bytes())
        .map_err(|e| invalid(format!("malformed token: {e}")))?;

    if sealed.v != FORMAT_VERSION {
        return Err(invalid(format!("unsupported token version {}", sealed.v)));
    }
    if &sealed.backend != backend {
        return Err(invalid(format!(
            "token was issued by {:?}, not {:?}",
            sealed.backend, backend
        )));
    }
    if sealed.prefix != prefix {
        return Err(invalid(format!(
            "token was issued for prefix {:?}, not {prefix:?}",
            sealed.prefix
        )));
    }
    let page_size = options.normalized_page_size();
    if sealed.page_size != page_size {
        return Err(invalid(format!(
            "token was issued for page size {}, not {page_size}",
            sealed.page_size
        )));
    }

    Ok(sealed.cursor)
}
