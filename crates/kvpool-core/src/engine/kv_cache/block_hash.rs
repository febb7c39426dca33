//! Chained content hashes for prefix caching.
//!
//! Each complete block of a request is identified by a hash of the previous
//! block's hash, the block's token ids, and any partition keys (multimodal
//! inputs, LoRA adapter, cache salt). Two requests produce the same hash for
//! block `k` only when blocks `0..=k` hold identical tokens under the same
//! partition keys.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::hash::{DefaultHasher, Hash, Hasher};

use crate::config::HashAlgo;
use crate::engine::request::Request;

/// Parent hash used for the first block of every request.
pub const NONE_HASH: u64 = 0;

/// Keys that separate otherwise identical token content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtraHashKey {
    /// Content hash of a multimodal input overlapping the block
    MultiModal(String),
    /// LoRA adapter name
    LoraName(String),
    /// Per-request cache salt (first block only)
    CacheSalt(String),
}

/// Content identity of one complete block.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockHash {
    pub hash_value: u64,
    pub parent_hash: Option<u64>,
    pub extra_keys: Option<Vec<ExtraHashKey>>,
}

impl HashAlgo {
    /// Hash one block given its parent's hash value.
    pub fn hash_block_tokens(
        &self,
        parent_hash: Option<u64>,
        block_tokens: &[u32],
        extra_keys: Option<Vec<ExtraHashKey>>,
    ) -> BlockHash {
        let seed = parent_hash.unwrap_or(NONE_HASH);
        let hash_value = match self {
            HashAlgo::Builtin => {
                let mut hasher = DefaultHasher::new();
                seed.hash(&mut hasher);
                block_tokens.hash(&mut hasher);
                extra_keys.hash(&mut hasher);
                hasher.finish()
            }
            HashAlgo::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(seed.to_le_bytes());
                for token in block_tokens {
                    hasher.update(token.to_le_bytes());
                }
                for key in extra_keys.iter().flatten() {
                    let (tag, value) = match key {
                        ExtraHashKey::MultiModal(v) => (0u8, v),
                        ExtraHashKey::LoraName(v) => (1u8, v),
                        ExtraHashKey::CacheSalt(v) => (2u8, v),
                    };
                    hasher.update([tag]);
                    hasher.update((value.len() as u64).to_le_bytes());
                    hasher.update(value.as_bytes());
                }
                let digest = hasher.finalize();
                let mut head = [0u8; 8];
                head.copy_from_slice(&digest[..8]);
                u64::from_le_bytes(head)
            }
        };

        BlockHash {
            hash_value,
            parent_hash,
            extra_keys,
        }
    }
}

/// Partition keys for the block spanning tokens `[start, end)`.
pub fn generate_block_hash_extra_keys(
    request: &Request,
    start: usize,
    end: usize,
) -> Option<Vec<ExtraHashKey>> {
    let mut keys: Vec<ExtraHashKey> = request
        .mm_features
        .iter()
        .filter(|f| f.offset < end && f.offset + f.length > start)
        .map(|f| ExtraHashKey::MultiModal(f.identifier.clone()))
        .collect();

    if let Some(lora) = &request.lora_request {
        keys.push(ExtraHashKey::LoraName(lora.name.clone()));
    }

    if start == 0 {
        if let Some(salt) = &request.cache_salt {
            keys.push(ExtraHashKey::CacheSalt(salt.clone()));
        }
    }

    if keys.is_empty() {
        None
    } else {
        Some(keys)
    }
}

/// Hash chain over every complete block of the request's tokens.
///
/// The trailing partial block is not hashed since it may still grow.
pub fn hash_request_tokens(hash_algo: HashAlgo, block_size: usize, request: &Request) -> Vec<BlockHash> {
    let token_ids: Vec<u32> = request.all_token_ids().collect();
    let mut hashes = Vec::with_capacity(token_ids.len() / block_size);
    let mut parent_hash = None;

    for (i, block_tokens) in token_ids.chunks_exact(block_size).enumerate() {
        let start = i * block_size;
        let extra_keys = generate_block_hash_extra_keys(request, start, start + block_size);
        let block_hash = hash_algo.hash_block_tokens(parent_hash, block_tokens, extra_keys);
        parent_hash = Some(block_hash.hash_value);
        hashes.push(block_hash);
    }

    hashes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::request::{LoRARequest, MultiModalFeature};

    #[test]
    fn test_partial_block_not_hashed() {
        let request = Request::new("r", (0..10).collect());
        let hashes = hash_request_tokens(HashAlgo::Builtin, 4, &request);
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[0].parent_hash, None);
        assert_eq!(hashes[1].parent_hash, Some(hashes[0].hash_value));
    }

    #[test]
    fn test_shared_prefix_shares_hashes() {
        let a = Request::new("a", vec![1, 2, 3, 4, 5, 6, 7, 8]);
        let b = Request::new("b", vec![1, 2, 3, 4, 9, 9, 9, 9]);
        for algo in [HashAlgo::Builtin, HashAlgo::Sha256] {
            let ha = hash_request_tokens(algo, 4, &a);
            let hb = hash_request_tokens(algo, 4, &b);
            assert_eq!(ha[0], hb[0]);
            assert_ne!(ha[1], hb[1]);
        }
    }

    #[test]
    fn test_same_tokens_different_parent() {
        let a = Request::new("a", vec![1, 1, 1, 1, 7, 7, 7, 7]);
        let b = Request::new("b", vec![2, 2, 2, 2, 7, 7, 7, 7]);
        let ha = hash_request_tokens(HashAlgo::Sha256, 4, &a);
        let hb = hash_request_tokens(HashAlgo::Sha256, 4, &b);
        assert_ne!(ha[1].hash_value, hb[1].hash_value);
    }

    #[test]
    fn test_lora_partitions_every_block() {
        let plain = Request::new("a", (0..8).collect());
        let mut adapted = Request::new("b", (0..8).collect());
        adapted.lora_request = Some(LoRARequest {
            name: "sql".to_string(),
            id: 1,
        });
        let hp = hash_request_tokens(HashAlgo::Builtin, 4, &plain);
        let ha = hash_request_tokens(HashAlgo::Builtin, 4, &adapted);
        assert_ne!(hp[0], ha[0]);
        assert_eq!(
            ha[1].extra_keys,
            Some(vec![ExtraHashKey::LoraName("sql".to_string())])
        );
    }

    #[test]
    fn test_cache_salt_only_on_first_block() {
        let mut salted = Request::new("a", (0..8).collect());
        salted.cache_salt = Some("tenant-a".to_string());
        let hashes = hash_request_tokens(HashAlgo::Builtin, 4, &salted);
        assert!(hashes[0].extra_keys.is_some());
        assert!(hashes[1].extra_keys.is_none());

        let plain = hash_request_tokens(HashAlgo::Builtin, 4, &Request::new("b", (0..8).collect()));
        // The salt still reaches block 1 through the chain.
        assert_ne!(hashes[1].hash_value, plain[1].hash_value);
    }

    #[test]
    fn test_multimodal_overlap() {
        let mut request = Request::new("a", vec![0; 12]);
        request.mm_features.push(MultiModalFeature {
            identifier: "img".to_string(),
            offset: 2,
            length: 4,
        });
        assert!(generate_block_hash_extra_keys(&request, 0, 4).is_some());
        assert!(generate_block_hash_extra_keys(&request, 4, 8).is_some());
        assert!(generate_block_hash_extra_keys(&request, 8, 12).is_none());
    }
}
