//! End-to-end prefix caching scenarios driven the way a scheduler would.

use kvpool_core::engine::{LoRARequest, MultiModalFeature};
use kvpool_core::{BlockId, CacheConfig, HashAlgo, KVCacheManager, Request, RequestStatus};

fn manager(num_blocks: usize, block_size: usize) -> KVCacheManager {
    KVCacheManager::new(CacheConfig {
        block_size,
        num_gpu_blocks: num_blocks,
        num_preallocate_tokens: 0,
        ..CacheConfig::default()
    })
    .unwrap()
}

/// Schedule the whole prompt: prefix lookup, allocation, forward pass.
fn schedule(manager: &mut KVCacheManager, request: &mut Request) -> Option<Vec<BlockId>> {
    let (computed, num_computed) = manager.get_computed_blocks(request);
    let new_blocks = manager
        .allocate_slots(request, request.num_tokens() - num_computed, &computed)
        .unwrap()?;
    request.num_computed_tokens = request.num_tokens();
    request.status = RequestStatus::Running;
    Some(new_blocks)
}

fn finish(manager: &mut KVCacheManager, request: &mut Request) {
    request.status = RequestStatus::Finished;
    manager.free(request);
    manager.free_block_hashes(request);
}

fn tokens(range: std::ops::Range<u32>) -> Vec<u32> {
    range.collect()
}

#[test]
fn block_count_matches_token_count() {
    let mut manager = manager(64, 16);
    for (i, len) in [1usize, 15, 16, 17, 31, 32, 33, 100].into_iter().enumerate() {
        let base = (i as u32) * 1000;
        let mut request = Request::new(format!("r{i}"), tokens(base..base + len as u32));
        schedule(&mut manager, &mut request).unwrap();
        assert_eq!(manager.req_blocks(&request.request_id).len(), len.div_ceil(16));
    }
}

#[test]
fn capacity_is_never_exceeded() {
    let mut manager = manager(16, 4);
    let mut live = Vec::new();
    for i in 0..20u32 {
        let mut request = Request::new(format!("r{i}"), tokens(i * 100..i * 100 + 10));
        match schedule(&mut manager, &mut request) {
            Some(_) => live.push(request),
            None => {
                finish(&mut manager, &mut request);
                break;
            }
        }
    }
    assert_eq!(live.len(), 5);
    let held: usize = live.iter().map(|r| manager.req_blocks(&r.request_id).len()).sum();
    assert_eq!(held + manager.num_free_blocks(), 16);
    assert!(manager.usage() <= 1.0);

    for request in &mut live {
        finish(&mut manager, request);
    }
    assert_eq!(manager.num_free_blocks(), 16);
    assert_eq!(manager.num_tracked_requests(), 0);
}

#[test]
fn free_is_idempotent() {
    let mut manager = manager(8, 4);
    let mut request = Request::new("a", tokens(0..10));
    schedule(&mut manager, &mut request).unwrap();

    finish(&mut manager, &mut request);
    finish(&mut manager, &mut request);
    assert_eq!(manager.num_free_blocks(), 8);
    assert!(manager.req_blocks("a").is_empty());
}

#[test]
fn identical_prefix_shares_blocks() {
    let mut manager = manager(16, 4);
    let mut a = Request::new("a", tokens(0..10));
    let a_blocks = schedule(&mut manager, &mut a).unwrap();

    let mut b = Request::new("b", tokens(0..10));
    let (computed, num_computed) = manager.get_computed_blocks(&b);
    assert_eq!(computed, a_blocks[..2].to_vec());
    assert_eq!(num_computed, 8);

    let new_blocks = manager.allocate_slots(&b, 2, &computed).unwrap().unwrap();
    b.num_computed_tokens = 10;
    assert_eq!(new_blocks.len(), 1);
    for block_id in &computed {
        assert_eq!(manager.block_ref_count(*block_id), 2);
    }
    assert_eq!(manager.req_blocks("b")[..2], a_blocks[..2]);
}

#[test]
fn exact_multiple_prompt_recomputes_last_block() {
    let mut manager = manager(16, 16);
    let mut a = Request::new("a", tokens(0..32));
    schedule(&mut manager, &mut a).unwrap();
    finish(&mut manager, &mut a);

    let b = Request::new("b", tokens(0..32));
    let (computed, num_computed) = manager.get_computed_blocks(&b);
    assert_eq!(computed.len(), 1);
    assert_eq!(num_computed, 16);

    let stats = manager.make_prefix_cache_stats();
    assert_eq!(stats.requests, 2);
    assert_eq!(stats.queries, 2);
    assert_eq!(stats.hits, 1);
}

#[test]
fn least_recently_released_is_evicted_first() {
    let mut manager = manager(4, 4);
    let mut a = Request::new("a", tokens(0..8));
    schedule(&mut manager, &mut a).unwrap();
    let mut b = Request::new("b", tokens(100..108));
    schedule(&mut manager, &mut b).unwrap();
    finish(&mut manager, &mut a);
    finish(&mut manager, &mut b);

    // Needs two blocks: both come from A.
    let mut c = Request::new("c", tokens(200..208));
    schedule(&mut manager, &mut c).unwrap();

    let mut a_again = tokens(0..8);
    a_again.extend(300..304);
    let (computed, _) = manager.get_computed_blocks(&Request::new("a2", a_again));
    assert!(computed.is_empty());

    let mut b_again = tokens(100..108);
    b_again.extend(300..304);
    let (computed, num_computed) = manager.get_computed_blocks(&Request::new("b2", b_again));
    assert_eq!(computed.len(), 2);
    assert_eq!(num_computed, 8);
}

#[test]
fn reset_refused_while_blocks_are_held() {
    let mut manager = manager(8, 4);
    let mut a = Request::new("a", tokens(0..10));
    schedule(&mut manager, &mut a).unwrap();

    assert!(!manager.reset_prefix_cache());
    finish(&mut manager, &mut a);
    assert!(manager.reset_prefix_cache());
    assert!(manager.make_prefix_cache_stats().reset);

    let b = Request::new("b", tokens(0..10));
    assert_eq!(manager.get_computed_blocks(&b), (Vec::new(), 0));
    assert_eq!(manager.num_free_blocks(), 8);
}

#[test]
fn common_prefix_counts_blocks_shared_by_all_running() {
    let mut manager = manager(32, 4);
    let mut running = Vec::new();
    for (i, tail) in [100u32, 200, 300].into_iter().enumerate() {
        let mut prompt = tokens(0..8);
        prompt.extend(tail..tail + 12);
        let mut request = Request::new(format!("r{i}"), prompt);
        schedule(&mut manager, &mut request).unwrap();
        running.push(request);
    }
    assert_eq!(manager.req_blocks("r0").len(), 5);
    assert_eq!(manager.get_num_common_prefix_blocks(&running[0], 3), 2);

    let mut unique = Request::new("u", tokens(500..520));
    schedule(&mut manager, &mut unique).unwrap();
    assert_eq!(manager.get_num_common_prefix_blocks(&unique, 4), 0);
    assert_eq!(manager.get_num_common_prefix_blocks(&running[1], 4), 0);
}

#[test]
#[should_panic(expected = "running request")]
fn common_prefix_requires_running_request() {
    let manager = manager(8, 4);
    let request = Request::new("a", tokens(0..8));
    manager.get_num_common_prefix_blocks(&request, 1);
}

#[test]
fn partition_keys_isolate_cache_entries() {
    let mut manager = manager(32, 4);
    let mut base = Request::new("base", tokens(0..12));
    schedule(&mut manager, &mut base).unwrap();

    let mut lora = Request::new("lora", tokens(0..12));
    lora.lora_request = Some(LoRARequest {
        name: "adapter".to_string(),
        id: 1,
    });
    assert!(manager.get_computed_blocks(&lora).0.is_empty());

    let mut salted = Request::new("salted", tokens(0..12));
    salted.cache_salt = Some("tenant-a".to_string());
    assert!(manager.get_computed_blocks(&salted).0.is_empty());

    // An image in the second block leaves the first block shareable.
    let mut image = Request::new("image", tokens(0..12));
    image.mm_features.push(MultiModalFeature {
        identifier: "img-0".to_string(),
        offset: 5,
        length: 2,
    });
    let (computed, _) = manager.get_computed_blocks(&image);
    assert_eq!(computed.len(), 1);
}

#[test]
fn sha256_chains_hit_across_requests() {
    let mut manager = KVCacheManager::new(CacheConfig {
        block_size: 4,
        num_gpu_blocks: 8,
        num_preallocate_tokens: 0,
        prefix_caching_hash_algo: HashAlgo::Sha256,
        ..CacheConfig::default()
    })
    .unwrap();
    let mut a = Request::new("a", tokens(0..10));
    schedule(&mut manager, &mut a).unwrap();
    finish(&mut manager, &mut a);

    let b = Request::new("b", tokens(0..10));
    assert_eq!(manager.get_computed_blocks(&b).1, 8);
}

#[test]
fn generated_tokens_become_reusable_prefix() {
    let mut manager = manager(16, 4);
    let mut a = Request::new("a", tokens(0..6));
    schedule(&mut manager, &mut a).unwrap();
    for token in 6..10u32 {
        a.append_output_token_ids(&[token]);
        manager.allocate_slots(&a, 1, &[]).unwrap().unwrap();
        a.num_computed_tokens += 1;
    }
    assert_eq!(manager.num_cached_blocks("a"), Some(2));
    finish(&mut manager, &mut a);

    let b = Request::new("b", tokens(0..12));
    assert_eq!(manager.get_computed_blocks(&b).1, 8);
}
