//! Signed direct download links for depot.
//!
//! This crate provides:
//! - AWS SigV4 query-string presigning of object GETs, with response headers
//!   bound into the signature
//! - Verification of issued links
//! - A decorator serving links through a CDN host

pub mod cdn;
pub mod error;
pub mod headers;
pub mod key;
pub mod signer;

pub use cdn::CdnLinkSigner;
pub use error::{SignerError, SignerResult};
pub use headers::ResponseHeaders;
pub use key::SigningCredentials;
pub use signer::{
    BucketLocator, DirectLinkSigner, LinkParams, S3LinkSigner, presign_get, verify_presigned,
};
