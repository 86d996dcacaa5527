//! Core domain types shared by the depot crates.
//!
//! This crate defines:
//! - Content digests and the algorithms producing them
//! - Configuration for storage backends, the blob store, direct download
//!   links and garbage collection

pub mod config;
pub mod digest;
pub mod error;

pub use digest::{Digest, DigestAlgorithm};
pub use error::{Error, Result};

/// Longest lifetime AWS SigV4 accepts for a presigned URL: 7 days.
pub const MAX_LINK_EXPIRY_SECS: u64 = 7 * 24 * 60 * 60;

/// Largest page S3 returns from a single ListObjectsV2 call.
pub const MAX_LISTING_PAGE_SIZE: usize = 1000;
