use bytes::Bytes;
use depot_core::config::AppConfig;
use depot_core::{Digest, DigestAlgorithm};
use depot_storage::MemoryBackend;
use depot_store::BinaryStore;
use std::sync::Arc;

/// MD5 digest of data.
#[allow(dead_code)]
pub fn md5_digest(data: &[u8]) -> Digest {
    DigestAlgorithm::Md5.compute(data)
}

/// In-memory configuration with blobs under `prefix` and no grace period.
#[allow(dead_code)]
pub fn test_config(prefix: &str) -> AppConfig {
    let mut config = AppConfig::for_testing();
    config.store.prefix = prefix.to_string();
    config
}

/// A store over a fresh memory backend, plus direct access to the backend.
#[allow(dead_code)]
pub fn memory_store(prefix: &str) -> (Arc<MemoryBackend>, BinaryStore) {
    let backend = Arc::new(MemoryBackend::new());
    let store = BinaryStore::new(backend.clone(), &test_config(prefix));
    (backend, store)
}

/// Generate deterministic test data using a seeded pseudo-random generator.
#[allow(dead_code)]
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    for chunk in data.chunks_mut(8) {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}
