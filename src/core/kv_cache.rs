//! Per-sequence key/value cache.
//!
//! Each admitted request owns one slot. A slot holds, for every layer and
//! every KV head, a contiguous `[len × head_dim]` buffer of keys and one of
//! values, so attention reads a head's history as a single slice.
//!
//! ## Memory Layout
//!
//! ```text
//! slot ─┬─ layer 0 ─┬─ kv head 0: keys [len × d]   values [len × d]
//!       │           └─ kv head 1: keys [len × d]   values [len × d]
//!       └─ layer 1 ─┬─ ...
//! ```
//!
//! Storage grows in chunks of `block_size` positions and every chunk is
//! charged against the aggregate byte budget. A slot never holds more than
//! its capacity; the [`OverflowPolicy`] decides what happens after that.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::debug;

use crate::config::{CacheConfig, ModelConfig, OverflowPolicy};
use crate::core::sequence::RequestId;
use crate::error::{Error, Result};

/// Index of a cache slot.
pub type SlotId = usize;

/// Shape of what a slot stores per position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvLayout {
    /// Number of transformer layers.
    pub num_layers: usize,
    /// Number of query heads.
    pub num_heads: usize,
    /// Number of KV heads (fewer than query heads under GQA).
    pub num_kv_heads: usize,
    /// Dimension per head.
    pub head_dim: usize,
}

impl KvLayout {
    pub fn from_model(config: &ModelConfig) -> Self {
        Self {
            num_layers: config.num_hidden_layers,
            num_heads: config.num_attention_heads,
            num_kv_heads: config.num_key_value_heads,
            head_dim: config.head_dim(),
        }
    }

    /// KV head that query head `q_head` reads under grouped-query attention.
    pub fn kv_head_for(&self, q_head: usize) -> usize {
        q_head / (self.num_heads / self.num_kv_heads).max(1)
    }

    /// Floats in one key (or value) row across all KV heads.
    pub fn kv_width(&self) -> usize {
        self.num_kv_heads * self.head_dim
    }

    /// Bytes one position costs across all layers, keys and values.
    pub fn bytes_per_position(&self) -> usize {
        self.num_layers * 2 * self.kv_width() * std::mem::size_of::<f32>()
    }
}

/// Cache bytes in use, readable from any thread.
#[derive(Debug, Clone, Default)]
pub struct CacheGauge(Arc<AtomicUsize>);

impl CacheGauge {
    pub fn used_bytes(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    fn set(&self, bytes: usize) {
        self.0.store(bytes, Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct LayerStore {
    keys: Vec<Vec<f32>>,
    values: Vec<Vec<f32>>,
    /// Positions currently held.
    len: usize,
    /// Positions ever appended, including those slid out of the window.
    appended: usize,
}

#[derive(Debug)]
struct SlotStorage {
    owner: RequestId,
    capacity: usize,
    /// Positions charged against the budget.
    allocated: usize,
    layers: Vec<LayerStore>,
    last_extended: u64,
}

impl SlotStorage {
    fn len(&self) -> usize {
        self.layers.iter().map(|l| l.len).min().unwrap_or(0)
    }

    fn next_position(&self) -> usize {
        self.layers.iter().map(|l| l.appended).min().unwrap_or(0)
    }
}

/// Read-only view of one layer of one slot.
#[derive(Debug, Clone, Copy)]
pub struct KvView<'a> {
    keys: &'a [Vec<f32>],
    values: &'a [Vec<f32>],
    len: usize,
    head_dim: usize,
}

impl<'a> KvView<'a> {
    /// Number of positions visible.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Keys for `kv_head`, `[len × head_dim]`.
    pub fn keys(&self, kv_head: usize) -> &'a [f32] {
        &self.keys[kv_head][..self.len * self.head_dim]
    }

    /// Values for `kv_head`, `[len × head_dim]`.
    pub fn values(&self, kv_head: usize) -> &'a [f32] {
        &self.values[kv_head][..self.len * self.head_dim]
    }
}

/// Owns every slot and the aggregate byte budget.
///
/// # Example
///
/// ```
/// use nano_infer::core::kv_cache::{KvCacheManager, KvLayout};
/// use nano_infer::CacheConfig;
///
/// let layout = KvLayout { num_layers: 1, num_heads: 2, num_kv_heads: 1, head_dim: 2 };
/// let mut cache = KvCacheManager::new(layout, &CacheConfig::default());
///
/// let slot = cache.allocate(7, 8).unwrap();
/// cache.append(slot, 0, &[1.0, 2.0], &[3.0, 4.0]).unwrap();
/// assert_eq!(cache.cursor(slot, 0).unwrap(), 1);
///
/// cache.evict(slot).unwrap();
/// assert_eq!(cache.num_active_slots(), 0);
/// ```
#[derive(Debug)]
pub struct KvCacheManager {
    layout: KvLayout,
    block_size: usize,
    budget: Option<usize>,
    overflow_policy: OverflowPolicy,
    slots: Vec<Option<SlotStorage>>,
    /// Released slot ids, reused LIFO.
    free_slots: Vec<SlotId>,
    used_bytes: usize,
    gauge: CacheGauge,
    clock: u64,
}

impl KvCacheManager {
    pub fn new(layout: KvLayout, config: &CacheConfig) -> Self {
        Self {
            layout,
            block_size: config.block_size.max(1),
            budget: config.memory_budget_bytes,
            overflow_policy: config.overflow_policy,
            slots: Vec::new(),
            free_slots: Vec::new(),
            used_bytes: 0,
            gauge: CacheGauge::default(),
            clock: 0,
        }
    }

    // ========== Slot lifecycle ==========

    /// Create an empty slot for `owner` holding at most `capacity` positions.
    ///
    /// No memory is charged until positions are reserved or appended.
    pub fn allocate(&mut self, owner: RequestId, capacity: usize) -> Result<SlotId> {
        if capacity == 0 {
            return Err(Error::InvalidRequest("slot capacity must be positive".into()));
        }
        let layers = (0..self.layout.num_layers)
            .map(|_| LayerStore {
                keys: vec![Vec::new(); self.layout.num_kv_heads],
                values: vec![Vec::new(); self.layout.num_kv_heads],
                len: 0,
                appended: 0,
            })
            .collect();
        self.clock += 1;
        let storage = SlotStorage {
            owner,
            capacity,
            allocated: 0,
            layers,
            last_extended: self.clock,
        };

        let slot = match self.free_slots.pop() {
            Some(id) => {
                self.slots[id] = Some(storage);
                id
            }
            None => {
                self.slots.push(Some(storage));
                self.slots.len() - 1
            }
        };
        debug!("allocated kv slot {slot} for request {owner} (capacity {capacity})");
        Ok(slot)
    }

    /// Release a slot's storage and return its id to the free list.
    pub fn evict(&mut self, slot: SlotId) -> Result<()> {
        let storage = self
            .slots
            .get_mut(slot)
            .and_then(Option::take)
            .ok_or(Error::SlotNotFound(slot))?;
        self.used_bytes -= storage.allocated * self.layout.bytes_per_position();
        self.gauge.set(self.used_bytes);
        self.free_slots.push(slot);
        debug!(
            "evicted kv slot {slot} of request {} ({} positions)",
            storage.owner,
            storage.len()
        );
        Ok(())
    }

    /// Pre-claim storage so the slot can hold `positions` without further
    /// budget checks. Claims are capped at the slot's capacity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheOverflow`] if the budget cannot cover the growth;
    /// nothing is claimed in that case.
    pub fn reserve(&mut self, slot: SlotId, positions: usize) -> Result<()> {
        let bpp = self.layout.bytes_per_position();
        let block_size = self.block_size;
        let budget = self.budget;
        let used = self.used_bytes;
        let head_dim = self.layout.head_dim;

        let storage = self.storage_mut(slot)?;
        let wanted = positions.min(storage.capacity);
        if wanted <= storage.allocated {
            return Ok(());
        }
        let target = wanted.next_multiple_of(block_size).min(storage.capacity);
        let delta = (target - storage.allocated) * bpp;
        if let Some(budget) = budget
            && used + delta > budget
        {
            return Err(Error::CacheOverflow(format!(
                "slot {slot} needs {delta} more bytes, {} of {budget} in use",
                used
            )));
        }

        for layer in &mut storage.layers {
            for buf in layer.keys.iter_mut().chain(layer.values.iter_mut()) {
                buf.reserve_exact(target * head_dim - buf.len());
            }
        }
        storage.allocated = target;
        self.used_bytes += delta;
        self.gauge.set(self.used_bytes);
        Ok(())
    }

    // ========== Reads and writes ==========

    /// Append one position to `layer`. `key` and `value` hold every KV head,
    /// `[num_kv_heads × head_dim]`.
    ///
    /// # Errors
    ///
    /// * [`Error::CacheOverflow`] when the slot is full under
    ///   [`OverflowPolicy::Reject`], or when growing would exceed the budget.
    ///   The cursor is unchanged.
    /// * [`Error::ShapeMismatch`] if `key` or `value` has the wrong width.
    pub fn append(&mut self, slot: SlotId, layer: usize, key: &[f32], value: &[f32]) -> Result<()> {
        let width = self.layout.kv_width();
        if key.len() != width || value.len() != width {
            return Err(Error::shape("kv append", &[width, width], &[key.len(), value.len()]));
        }
        let head_dim = self.layout.head_dim;
        let policy = self.overflow_policy;

        let (len, capacity, allocated) = {
            let storage = self.storage(slot)?;
            let store = storage
                .layers
                .get(layer)
                .ok_or_else(|| Error::shape("kv layer", &[storage.layers.len()], &[layer]))?;
            (store.len, storage.capacity, storage.allocated)
        };

        let slide = len >= capacity;
        if slide && policy == OverflowPolicy::Reject {
            return Err(Error::CacheOverflow(format!(
                "slot {slot} is full at {capacity} positions"
            )));
        }
        if !slide && len + 1 > allocated {
            self.reserve(slot, len + 1)?;
        }

        self.clock += 1;
        let clock = self.clock;
        let storage = self.storage_mut(slot)?;
        storage.last_extended = clock;
        let store = &mut storage.layers[layer];
        for (h, (k_buf, v_buf)) in store.keys.iter_mut().zip(store.values.iter_mut()).enumerate() {
            if slide {
                k_buf.drain(..head_dim);
                v_buf.drain(..head_dim);
            }
            k_buf.extend_from_slice(&key[h * head_dim..(h + 1) * head_dim]);
            v_buf.extend_from_slice(&value[h * head_dim..(h + 1) * head_dim]);
        }
        if !slide {
            store.len += 1;
        }
        store.appended += 1;
        Ok(())
    }

    /// Every position currently held in `layer`.
    pub fn read(&self, slot: SlotId, layer: usize) -> Result<KvView<'_>> {
        let len = self.cursor(slot, layer)?;
        self.read_prefix(slot, layer, len)
    }

    /// The first `len` positions of `layer`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if `len` is past the cursor.
    pub fn read_prefix(&self, slot: SlotId, layer: usize, len: usize) -> Result<KvView<'_>> {
        let storage = self.storage(slot)?;
        let store = storage
            .layers
            .get(layer)
            .ok_or_else(|| Error::shape("kv layer", &[storage.layers.len()], &[layer]))?;
        if len > store.len {
            return Err(Error::shape("kv read", &[store.len], &[len]));
        }
        Ok(KvView {
            keys: &store.keys,
            values: &store.values,
            len,
            head_dim: self.layout.head_dim,
        })
    }

    // ========== Queries ==========

    pub fn layout(&self) -> &KvLayout {
        &self.layout
    }

    pub fn overflow_policy(&self) -> OverflowPolicy {
        self.overflow_policy
    }

    /// Write cursor of one layer.
    pub fn cursor(&self, slot: SlotId, layer: usize) -> Result<usize> {
        let storage = self.storage(slot)?;
        storage
            .layers
            .get(layer)
            .map(|l| l.len)
            .ok_or_else(|| Error::shape("kv layer", &[storage.layers.len()], &[layer]))
    }

    /// Positions held in every layer.
    pub fn len(&self, slot: SlotId) -> Result<usize> {
        Ok(self.storage(slot)?.len())
    }

    /// Absolute position the next appended token will occupy. Keeps counting
    /// after a sliding window drops old positions.
    pub fn next_position(&self, slot: SlotId) -> Result<usize> {
        Ok(self.storage(slot)?.next_position())
    }

    pub fn capacity(&self, slot: SlotId) -> Result<usize> {
        Ok(self.storage(slot)?.capacity)
    }

    pub fn owner(&self, slot: SlotId) -> Result<RequestId> {
        Ok(self.storage(slot)?.owner)
    }

    /// Bytes needed to hold `positions` in a fresh slot.
    pub fn bytes_for(&self, positions: usize) -> usize {
        positions.next_multiple_of(self.block_size) * self.layout.bytes_per_position()
    }

    /// Whether a fresh reservation of `positions` fits in the budget.
    pub fn can_fit(&self, positions: usize) -> bool {
        match self.budget {
            Some(budget) => self.used_bytes + self.bytes_for(positions) <= budget,
            None => true,
        }
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    pub fn budget_bytes(&self) -> Option<usize> {
        self.budget
    }

    /// Shared handle to the used-bytes counter.
    pub fn gauge(&self) -> CacheGauge {
        self.gauge.clone()
    }

    pub fn num_active_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Filled positions over total capacity across live slots.
    pub fn occupancy(&self) -> f64 {
        let (filled, capacity) = self
            .slots
            .iter()
            .flatten()
            .fold((0usize, 0usize), |(f, c), s| (f + s.len(), c + s.capacity));
        if capacity == 0 {
            0.0
        } else {
            filled as f64 / capacity as f64
        }
    }

    /// Live slot whose last append is oldest, skipping `exclude`.
    pub fn least_recently_extended(&self, exclude: &[SlotId]) -> Option<SlotId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(id, _)| !exclude.contains(id))
            .filter_map(|(id, s)| s.as_ref().map(|s| (id, s.last_extended)))
            .min_by_key(|&(_, t)| t)
            .map(|(id, _)| id)
    }

    fn storage(&self, slot: SlotId) -> Result<&SlotStorage> {
        self.slots
            .get(slot)
            .and_then(Option::as_ref)
            .ok_or(Error::SlotNotFound(slot))
    }

    fn storage_mut(&mut self, slot: SlotId) -> Result<&mut SlotStorage> {
        self.slots
            .get_mut(slot)
            .and_then(Option::as_mut)
            .ok_or(Error::SlotNotFound(slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> KvLayout {
        KvLayout {
            num_layers: 2,
            num_heads: 4,
            num_kv_heads: 2,
            head_dim: 2,
        }
    }

    fn row(v: f32) -> Vec<f32> {
        vec![v, v + 0.5, -v, -v - 0.5]
    }

    #[test]
    fn test_layout() {
        let l = layout();
        assert_eq!(l.kv_head_for(0), 0);
        assert_eq!(l.kv_head_for(1), 0);
        assert_eq!(l.kv_head_for(2), 1);
        assert_eq!(l.kv_head_for(3), 1);
        assert_eq!(l.kv_width(), 4);
        assert_eq!(l.bytes_per_position(), 2 * 2 * 4 * 4);
    }

    #[test]
    fn test_append_and_read_per_head() {
        let mut cache = KvCacheManager::new(layout(), &CacheConfig::default());
        let slot = cache.allocate(1, 8).unwrap();

        cache.append(slot, 0, &row(1.0), &row(10.0)).unwrap();
        cache.append(slot, 0, &row(2.0), &row(20.0)).unwrap();

        let view = cache.read(slot, 0).unwrap();
        assert_eq!(view.len(), 2);
        assert_eq!(view.keys(0), &[1.0, 1.5, 2.0, 2.5]);
        assert_eq!(view.keys(1), &[-1.0, -1.5, -2.0, -2.5]);
        assert_eq!(view.values(0), &[10.0, 10.5, 20.0, 20.5]);
        assert_eq!(cache.cursor(slot, 1).unwrap(), 0);
        assert_eq!(cache.len(slot).unwrap(), 0);
    }

    #[test]
    fn test_read_prefix_bounds() {
        let mut cache = KvCacheManager::new(layout(), &CacheConfig::default());
        let slot = cache.allocate(1, 8).unwrap();
        cache.append(slot, 0, &row(1.0), &row(1.0)).unwrap();

        assert_eq!(cache.read_prefix(slot, 0, 1).unwrap().len(), 1);
        assert!(cache.read_prefix(slot, 0, 2).is_err());
    }

    #[test]
    fn test_sliding_window_keeps_latest() {
        let config = CacheConfig {
            overflow_policy: OverflowPolicy::SlidingWindow,
            ..CacheConfig::default()
        };
        let mut cache = KvCacheManager::new(layout(), &config);
        let slot = cache.allocate(1, 2).unwrap();
        for v in [1.0, 2.0, 3.0] {
            cache.append(slot, 0, &row(v), &row(v)).unwrap();
        }

        let view = cache.read(slot, 0).unwrap();
        assert_eq!(view.len(), 2);
        assert_eq!(view.keys(0), &[2.0, 2.5, 3.0, 3.5]);
        assert_eq!(cache.cursor(slot, 0).unwrap(), 2);
    }

    #[test]
    fn test_budget_and_reserve() {
        let l = layout();
        let config = CacheConfig {
            block_size: 4,
            memory_budget_bytes: Some(l.bytes_per_position() * 8),
            ..CacheConfig::default()
        };
        let mut cache = KvCacheManager::new(l, &config);
        let a = cache.allocate(1, 16).unwrap();
        let b = cache.allocate(2, 16).unwrap();

        cache.reserve(a, 5).unwrap();
        assert_eq!(cache.used_bytes(), l.bytes_per_position() * 8);
        assert_eq!(cache.gauge().used_bytes(), cache.used_bytes());

        assert!(!cache.can_fit(1));
        assert!(matches!(cache.reserve(b, 1), Err(Error::CacheOverflow(_))));

        cache.evict(a).unwrap();
        assert_eq!(cache.used_bytes(), 0);
        cache.reserve(b, 1).unwrap();
    }

    #[test]
    fn test_slot_ids_are_reused() {
        let mut cache = KvCacheManager::new(layout(), &CacheConfig::default());
        let a = cache.allocate(1, 4).unwrap();
        let _b = cache.allocate(2, 4).unwrap();
        cache.evict(a).unwrap();
        assert!(matches!(cache.evict(a), Err(Error::SlotNotFound(_))));
        assert_eq!(cache.allocate(3, 4).unwrap(), a);
        assert_eq!(cache.owner(a).unwrap(), 3);
    }

    #[test]
    fn test_least_recently_extended() {
        let mut cache = KvCacheManager::new(layout(), &CacheConfig::default());
        let a = cache.allocate(1, 4).unwrap();
        let b = cache.allocate(2, 4).unwrap();
        cache.append(a, 0, &row(1.0), &row(1.0)).unwrap();

        assert_eq!(cache.least_recently_extended(&[]), Some(b));
        assert_eq!(cache.least_recently_extended(&[b]), Some(a));
        assert_eq!(cache.least_recently_extended(&[a, b]), None);
    }

    #[test]
    fn test_wrong_width_is_rejected() {
        let mut cache = KvCacheManager::new(layout(), &CacheConfig::default());
        let slot = cache.allocate(1, 4).unwrap();
        assert!(matches!(
            cache.append(slot, 0, &[1.0], &[1.0]),
            Err(Error::ShapeMismatch { .. })
        ));
    }
}
