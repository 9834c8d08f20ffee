//! Integration tests for KvCacheManager.

use std::thread;

use nano_infer::core::kv_cache::{KvCacheManager, KvLayout};
use nano_infer::{CacheConfig, Error, OverflowPolicy};
use proptest::prelude::*;

fn layout() -> KvLayout {
    KvLayout {
        num_layers: 2,
        num_heads: 4,
        num_kv_heads: 2,
        head_dim: 4,
    }
}

fn config(policy: OverflowPolicy) -> CacheConfig {
    CacheConfig {
        block_size: 4,
        overflow_policy: policy,
        ..Default::default()
    }
}

/// A key row whose every element is `pos`.
fn row(pos: usize) -> Vec<f32> {
    vec![pos as f32; layout().kv_width()]
}

#[test]
fn test_layout_sizes() {
    let layout = layout();
    assert_eq!(layout.kv_width(), 8);
    // 2 layers × (K + V) × 8 floats × 4 bytes
    assert_eq!(layout.bytes_per_position(), 128);
    assert_eq!(layout.kv_head_for(0), 0);
    assert_eq!(layout.kv_head_for(1), 0);
    assert_eq!(layout.kv_head_for(3), 1);
}

#[test]
fn test_reject_ninth_append_at_capacity_eight() {
    let mut cache = KvCacheManager::new(layout(), &config(OverflowPolicy::Reject));
    let slot = cache.allocate(1, 8).unwrap();

    for pos in 0..8 {
        cache.append(slot, 0, &row(pos), &row(pos)).unwrap();
    }
    let err = cache.append(slot, 0, &row(8), &row(8)).unwrap_err();
    assert!(matches!(err, Error::CacheOverflow(_)));

    assert_eq!(cache.cursor(slot, 0).unwrap(), 8);
    let view = cache.read(slot, 0).unwrap();
    assert_eq!(view.len(), 8);
    assert_eq!(view.keys(1)[7 * 4], 7.0);
}

#[test]
fn test_sliding_window_drops_oldest() {
    let mut cache = KvCacheManager::new(layout(), &config(OverflowPolicy::SlidingWindow));
    let slot = cache.allocate(1, 3).unwrap();

    for pos in 0..5 {
        for layer in 0..2 {
            cache.append(slot, layer, &row(pos), &row(pos)).unwrap();
        }
    }

    assert_eq!(cache.len(slot).unwrap(), 3);
    assert_eq!(cache.next_position(slot).unwrap(), 5);
    let view = cache.read(slot, 1).unwrap();
    let firsts: Vec<f32> = view.keys(0).chunks(4).map(|k| k[0]).collect();
    assert_eq!(firsts, vec![2.0, 3.0, 4.0]);
}

#[test]
fn test_layers_advance_independently() {
    let mut cache = KvCacheManager::new(layout(), &config(OverflowPolicy::Reject));
    let slot = cache.allocate(1, 8).unwrap();

    cache.append(slot, 0, &row(0), &row(0)).unwrap();
    cache.append(slot, 0, &row(1), &row(1)).unwrap();
    cache.append(slot, 1, &row(0), &row(0)).unwrap();

    assert_eq!(cache.cursor(slot, 0).unwrap(), 2);
    assert_eq!(cache.cursor(slot, 1).unwrap(), 1);
    // The slot length is the shortest layer
    assert_eq!(cache.len(slot).unwrap(), 1);
    assert!(cache.read_prefix(slot, 1, 2).is_err());
    assert!(cache.cursor(slot, 2).is_err());
}

#[test]
fn test_evict_and_reuse() {
    let mut cache = KvCacheManager::new(layout(), &config(OverflowPolicy::Reject));
    let a = cache.allocate(1, 8).unwrap();
    let b = cache.allocate(2, 8).unwrap();
    cache.append(a, 0, &row(0), &row(0)).unwrap();
    assert!(cache.used_bytes() > 0);

    cache.evict(a).unwrap();
    assert_eq!(cache.used_bytes(), 0);
    assert!(matches!(cache.evict(a), Err(Error::SlotNotFound(_))));
    assert!(matches!(cache.read(a, 0), Err(Error::SlotNotFound(_))));

    let c = cache.allocate(3, 8).unwrap();
    assert_eq!(c, a);
    assert_eq!(cache.owner(c).unwrap(), 3);
    assert_eq!(cache.cursor(c, 0).unwrap(), 0);
    assert_eq!(cache.owner(b).unwrap(), 2);
    assert_eq!(cache.num_active_slots(), 2);
}

#[test]
fn test_budget_refuses_growth_without_side_effects() {
    let layout = layout();
    let budget = 4 * layout.bytes_per_position();
    let mut cache = KvCacheManager::new(
        layout,
        &CacheConfig {
            memory_budget_bytes: Some(budget),
            ..config(OverflowPolicy::Reject)
        },
    );
    let a = cache.allocate(1, 16).unwrap();
    let b = cache.allocate(2, 16).unwrap();

    cache.reserve(a, 3).unwrap();
    assert_eq!(cache.used_bytes(), budget);
    assert!(!cache.can_fit(1));

    let err = cache.reserve(b, 1).unwrap_err();
    assert!(matches!(err, Error::CacheOverflow(_)));
    assert_eq!(cache.used_bytes(), budget);

    // Positions already reserved append without touching the budget
    for pos in 0..4 {
        cache.append(a, 0, &row(pos), &row(pos)).unwrap();
    }
    assert!(cache.append(b, 0, &row(0), &row(0)).is_err());

    cache.evict(a).unwrap();
    assert!(cache.can_fit(4));
    cache.append(b, 0, &row(0), &row(0)).unwrap();
}

#[test]
fn test_gauge_reads_from_other_threads() {
    let mut cache = KvCacheManager::new(layout(), &config(OverflowPolicy::Reject));
    let gauge = cache.gauge();
    let slot = cache.allocate(1, 8).unwrap();
    cache.reserve(slot, 4).unwrap();
    let expected = cache.used_bytes();

    let seen = thread::spawn(move || gauge.used_bytes()).join().unwrap();
    assert_eq!(seen, expected);
}

#[test]
fn test_occupancy() {
    let mut cache = KvCacheManager::new(layout(), &config(OverflowPolicy::Reject));
    assert_eq!(cache.occupancy(), 0.0);

    let slot = cache.allocate(1, 4).unwrap();
    for layer in 0..2 {
        cache.append(slot, layer, &row(0), &row(0)).unwrap();
    }
    assert!((cache.occupancy() - 0.25).abs() < 1e-9);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_reject_cursor_never_exceeds_capacity(capacity in 1usize..=20, appends in 0usize..=40) {
        let mut cache = KvCacheManager::new(layout(), &config(OverflowPolicy::Reject));
        let slot = cache.allocate(1, capacity).unwrap();

        let mut refused = 0;
        for pos in 0..appends {
            if cache.append(slot, 0, &row(pos), &row(pos)).is_err() {
                refused += 1;
            }
        }
        prop_assert_eq!(cache.cursor(slot, 0).unwrap(), appends.min(capacity));
        prop_assert_eq!(refused, appends.saturating_sub(capacity));
    }

    #[test]
    fn prop_sliding_window_keeps_latest(capacity in 1usize..=12, appends in 1usize..=30) {
        let mut cache = KvCacheManager::new(layout(), &config(OverflowPolicy::SlidingWindow));
        let slot = cache.allocate(1, capacity).unwrap();
        for pos in 0..appends {
            for layer in 0..2 {
                cache.append(slot, layer, &row(pos), &row(pos)).unwrap();
            }
        }

        let kept = appends.min(capacity);
        prop_assert_eq!(cache.len(slot).unwrap(), kept);
        prop_assert_eq!(cache.next_position(slot).unwrap(), appends);
        let view = cache.read(slot, 0).unwrap();
        prop_assert_eq!(view.values(1)[0], (appends - kept) as f32);
    }
}
