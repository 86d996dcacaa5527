pub mod fixtures;
pub mod mocks;

#[allow(unused_imports)]
pub use fixtures::{md5_digest, memory_store, seeded_bytes, test_config};
#[allow(unused_imports)]
pub use mocks::FlakyBackend;
