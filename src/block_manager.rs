// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Block lifecycle engine.
//!
//! The [`BlockManager`] orchestrates the block arena, the two free lists
//! and the reuse trie. Everything it does is index manipulation over
//! metadata; the only data movement is whole-block copies between the
//! primary and secondary pools during offload and onboarding, enqueued on
//! the configured copy stream with metadata updated eagerly.
//!
//! Free-list discipline: fresh blocks are handed out from the front;
//! completed blocks released with reuse potential are parked at the back so
//! they are evicted last. The eviction victim is the earliest free primary
//! block whose trie subtree holds no other primary block, which keeps
//! deeper (more specific) prefixes alive as long as possible.

pub mod block;
pub mod events;
pub mod free_list;
pub mod metrics;
pub mod pool;
pub mod sequence;
pub mod storage;

use std::sync::Arc;

use derive_builder::Builder;
use thiserror::Error;
use validator::Validate;

use crate::common::dtype::DType;
use crate::request::CacheRequest;
use crate::tokens::{build_block_keys, BlockKey, UniqueToken, DEFAULT_HASH_SEED};

use block::{BlockArena, BlockId, KvCacheIndex};
use events::{EventManager, NullEventManager};
use free_list::FreeBlockQueue;
use metrics::BlockManagerMetrics;
use pool::BlockPools;
use sequence::GenerationSequence;
use storage::{
    CopyStream, MemcpyStream, PinnedAllocator, StorageAllocator, StorageError, SystemAllocator,
};

pub type Result<T> = std::result::Result<T, KvCacheError>;

#[derive(Debug, Error)]
pub enum KvCacheError {
    /// Inputs violate declared bounds. Raised before any state is mutated.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No allocation is possible without evicting a live block. Expected
    /// under load; the scheduler defers the request and retries later.
    #[error("kv cache capacity exhausted: {0}")]
    CapacityExhausted(String),

    /// Internal bug (double free, ref-count underflow, trie key mismatch).
    /// Not recoverable; the manager's state must be considered corrupt.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Propagated from the storage allocator or copy stream.
    #[error(transparent)]
    Device(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheType {
    #[default]
    SelfAttention,
    /// Cross-attention cache: sized by encoder output, so generation-driven
    /// growth operations are no-ops.
    CrossAttention,
}

/// Model-side dimensions of one KV cache block.
#[derive(Debug, Clone, Builder, Validate)]
#[builder(pattern = "owned")]
pub struct ModelConfig {
    #[validate(range(min = 1))]
    pub num_layers: usize,

    #[validate(range(min = 1))]
    pub num_kv_heads: usize,

    #[validate(range(min = 1))]
    pub size_per_head: usize,

    #[validate(range(min = 1))]
    pub tokens_per_block: usize,
}

impl ModelConfig {
    pub fn builder() -> ModelConfigBuilder {
        ModelConfigBuilder::default()
    }

    /// Volume of one block across K and V planes, in elements.
    pub fn page_volume(&self) -> usize {
        2 * self.num_kv_heads * self.tokens_per_block * self.size_per_head
    }
}

/// Parallelism layout, used only by the static sizing utilities.
#[derive(Debug, Clone, Builder, Validate)]
#[builder(pattern = "owned")]
pub struct WorldConfig {
    #[validate(range(min = 1))]
    #[builder(default = "1")]
    pub tensor_parallelism: usize,

    #[validate(range(min = 1))]
    #[builder(default = "1")]
    pub pipeline_parallelism: usize,
}

impl WorldConfig {
    pub fn builder() -> WorldConfigBuilder {
        WorldConfigBuilder::default()
    }
}

/// External collaborators: where pool bytes come from, how they move, and
/// who hears about reuse-trie changes.
#[derive(Clone, Builder)]
#[builder(pattern = "owned")]
pub struct RuntimeConfig {
    #[builder(default = "Arc::new(MemcpyStream)")]
    pub copy_stream: Arc<dyn CopyStream>,

    #[builder(default = "Arc::new(SystemAllocator)")]
    pub primary_allocator: Arc<dyn StorageAllocator>,

    #[builder(default = "Arc::new(PinnedAllocator)")]
    pub secondary_allocator: Arc<dyn StorageAllocator>,

    #[builder(default = "NullEventManager::new()")]
    pub event_manager: Arc<dyn EventManager>,

    #[builder(default, setter(strip_option))]
    pub metrics_registry: Option<prometheus::Registry>,
}

impl RuntimeConfig {
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            copy_stream: Arc::new(MemcpyStream),
            primary_allocator: Arc::new(SystemAllocator),
            secondary_allocator: Arc::new(PinnedAllocator),
            event_manager: NullEventManager::new(),
            metrics_registry: None,
        }
    }
}

#[derive(Clone, Builder)]
#[builder(pattern = "owned")]
pub struct BlockManagerConfig {
    pub model: ModelConfig,

    pub blocks_in_primary_pool: usize,

    #[builder(default)]
    pub blocks_in_secondary_pool: usize,

    /// Copy offloaded blocks back to primary memory before reuse.
    #[builder(default = "true")]
    pub onboard_blocks: bool,

    #[builder(default)]
    pub cache_type: CacheType,

    #[builder(default)]
    pub runtime: RuntimeConfig,
}

impl BlockManagerConfig {
    pub fn builder() -> BlockManagerConfigBuilder {
        BlockManagerConfigBuilder::default()
    }
}

#[derive(Debug)]
pub struct BlockManager {
    model: ModelConfig,
    tokens_per_block: usize,
    num_primary_blocks: usize,
    num_secondary_blocks: usize,
    onboard_blocks: bool,
    cache_type: CacheType,

    arena: BlockArena,
    free_primary: FreeBlockQueue,
    free_secondary: FreeBlockQueue,
    pools: Option<BlockPools>,

    copy_stream: Arc<dyn CopyStream>,
    primary_allocator: Arc<dyn StorageAllocator>,
    secondary_allocator: Arc<dyn StorageAllocator>,
    event_manager: Arc<dyn EventManager>,
    metrics: BlockManagerMetrics,

    /// Shadow of `free_primary.len()` consumed by scheduling what-ifs.
    scheduling_num_free_blocks: usize,

    // Lifetime counters; never reset.
    alloc_total_blocks: u64,
    alloc_new_blocks: u64,
    reused_blocks: u64,
}

impl BlockManager {
    pub fn new(config: BlockManagerConfig) -> Result<Self> {
        config
            .model
            .validate()
            .map_err(|e| KvCacheError::InvalidArgument(format!("model config: {e}")))?;

        let num_primary = config.blocks_in_primary_pool;
        let num_secondary = config.blocks_in_secondary_pool;
        if num_primary == 0 {
            return Err(KvCacheError::InvalidArgument(
                "primary pool must hold at least one block".to_string(),
            ));
        }
        // the pool-index encoding reserves the high bit for the tier
        if num_primary + num_secondary > (1usize << 31) {
            return Err(KvCacheError::InvalidArgument(format!(
                "{} blocks exceed the pool index range",
                num_primary + num_secondary
            )));
        }

        let mut arena = BlockArena::new(num_primary as u32, num_secondary as u32);
        let mut free_primary = FreeBlockQueue::new();
        let mut free_secondary = FreeBlockQueue::new();
        for id in 0..num_primary {
            free_primary.push_back(&mut arena, id)?;
        }
        for id in num_primary..num_primary + num_secondary {
            free_secondary.push_back(&mut arena, id)?;
        }

        let metrics = match &config.runtime.metrics_registry {
            Some(registry) => BlockManagerMetrics::new(registry),
            None => BlockManagerMetrics::unregistered(),
        }
        .map_err(|e| KvCacheError::InvalidArgument(format!("metrics registration: {e}")))?;

        tracing::debug!(
            num_primary,
            num_secondary,
            tokens_per_block = config.model.tokens_per_block,
            "constructed block manager"
        );

        let manager = Self {
            tokens_per_block: config.model.tokens_per_block,
            model: config.model,
            num_primary_blocks: num_primary,
            num_secondary_blocks: num_secondary,
            onboard_blocks: config.onboard_blocks,
            cache_type: config.cache_type,
            arena,
            free_primary,
            free_secondary,
            pools: None,
            copy_stream: config.runtime.copy_stream,
            primary_allocator: config.runtime.primary_allocator,
            secondary_allocator: config.runtime.secondary_allocator,
            event_manager: config.runtime.event_manager,
            metrics,
            scheduling_num_free_blocks: num_primary,
            alloc_total_blocks: 0,
            alloc_new_blocks: 0,
            reused_blocks: 0,
        };
        manager.update_gauges();
        Ok(manager)
    }

    /// Allocate both pools. Deferred from construction so the dtype can be
    /// late-bound.
    pub fn allocate_pools(&mut self, dtype: DType, use_uvm: bool) -> Result<()> {
        if self.pools.is_some() {
            return Err(KvCacheError::InvalidArgument(
                "pools are already allocated".to_string(),
            ));
        }
        let block_bytes =
            self.model.num_layers * self.model.page_volume() * dtype.size_in_bytes();
        let pools = BlockPools::allocate(
            block_bytes,
            self.num_primary_blocks,
            self.num_secondary_blocks,
            self.primary_allocator.as_ref(),
            self.secondary_allocator.as_ref(),
            self.copy_stream.clone(),
            use_uvm,
        )?;
        self.pools = Some(pools);
        Ok(())
    }

    // ---- accessors ------------------------------------------------------

    pub fn tokens_per_block(&self) -> usize {
        self.tokens_per_block
    }

    pub fn num_layers(&self) -> usize {
        self.model.num_layers
    }

    /// Volume of one K or V plane for one layer, in elements.
    pub fn block_size(&self) -> usize {
        self.model.num_kv_heads * self.tokens_per_block * self.model.size_per_head
    }

    pub fn max_num_blocks(&self) -> usize {
        self.arena.num_blocks()
    }

    pub fn num_free_blocks(&self) -> usize {
        self.free_primary.len()
    }

    pub fn num_allocated_blocks(&self) -> usize {
        self.max_num_blocks() - self.num_free_blocks()
    }

    pub fn has_free_blocks(&self, num_required: usize) -> bool {
        self.num_free_blocks() >= num_required
    }

    pub fn scheduling_has_free_blocks(&self, num_required: usize) -> bool {
        self.scheduling_num_free_blocks >= num_required
    }

    pub fn num_alloc_total_blocks(&self) -> u64 {
        self.alloc_total_blocks
    }

    pub fn num_alloc_new_blocks(&self) -> u64 {
        self.alloc_new_blocks
    }

    pub fn num_reused_blocks(&self) -> u64 {
        self.reused_blocks
    }

    pub fn cache_type(&self) -> CacheType {
        self.cache_type
    }

    pub fn arena(&self) -> &BlockArena {
        &self.arena
    }

    /// Base addresses of the allocated pools, if any.
    pub fn pool_base_addrs(&self) -> Option<(u64, Option<u64>)> {
        self.pools.as_ref().map(|p| p.base_addrs())
    }

    /// Pool index of the K (`field = 0`) or V (`field = 1`) plane of a block.
    pub fn kv_block_index(&self, block_id: BlockId, field: u32) -> Result<KvCacheIndex> {
        if block_id >= self.arena.num_blocks() {
            return Err(KvCacheError::InvalidArgument(format!(
                "unknown block id {block_id}"
            )));
        }
        if field >= 2 {
            return Err(KvCacheError::InvalidArgument(format!(
                "field index {field} is neither K nor V"
            )));
        }
        Ok(self.arena.block(block_id).pool_index().plane(field))
    }

    // ---- sequence admission --------------------------------------------

    /// Assign context blocks to a new sequence, serving the longest cached
    /// prefix from the reuse trie. Returns the number of prompt tokens
    /// covered by reused blocks.
    pub fn add_sequence_with_reuse(
        &mut self,
        seq: &mut GenerationSequence,
        input_length: usize,
        num_context_blocks: usize,
        request: &CacheRequest,
    ) -> Result<usize> {
        let tokens = request.unique_tokens();
        if input_length < 1 || tokens.len() < input_length {
            return Err(KvCacheError::InvalidArgument(format!(
                "input length {input_length} outside the request's {} tokens",
                tokens.len()
            )));
        }

        // Never reuse the whole prompt: the final token's KV must be
        // recomputed to have something to generate from, so only the first
        // input_length - 1 tokens are eligible for matching.
        let keys = build_block_keys(
            request.lora_task_id(),
            &tokens[..input_length],
            input_length - 1,
            self.tokens_per_block,
        );
        self.load_or_allocate_blocks(&keys, num_context_blocks, seq)
    }

    /// Assign fresh context blocks without consulting the reuse trie.
    /// Blocks with index below `unshared_block_idx` are shared across beams,
    /// the rest are allocated per beam.
    pub fn add_sequence(
        &mut self,
        seq: &mut GenerationSequence,
        num_blocks: usize,
        unshared_block_idx: usize,
    ) -> Result<()> {
        for idx in 0..num_blocks {
            self.allocate_block(seq, idx < unshared_block_idx)?;
        }
        Ok(())
    }

    fn load_or_allocate_blocks(
        &mut self,
        keys: &[BlockKey],
        num_context_blocks: usize,
        seq: &mut GenerationSequence,
    ) -> Result<usize> {
        let mut search_root = Some(self.arena.root());
        let mut matched_tokens = 0;
        let mut key_idx = 0;

        for _ in 0..num_context_blocks {
            let matched = match search_root {
                Some(parent) if key_idx < keys.len() => self
                    .arena
                    .find_matching(parent, &keys[key_idx])
                    // an offloaded block is only usable if it can be onboarded
                    .filter(|&id| {
                        self.onboard_blocks || self.arena.block(id).pool_index().is_primary()
                    }),
                _ => None,
            };

            match matched {
                Some(id) => {
                    key_idx += 1;
                    matched_tokens += self.tokens_per_block;
                    self.claim_reused_block(id, seq)?;
                    // deeper prefixes hang off the claimed block
                    search_root = Some(id);
                }
                None => {
                    let id = self.get_free_block()?;
                    self.add_block_to_all_beams(id, seq);
                    search_root = None;
                }
            }
        }

        tracing::debug!(
            slot = seq.slot_id(),
            matched_tokens,
            num_context_blocks,
            "assigned context blocks"
        );
        Ok(matched_tokens)
    }

    // ---- growth ---------------------------------------------------------

    /// Grow the sequence by one block: a single shared block, or one fresh
    /// block per beam. The sequence is untouched if capacity is exhausted.
    pub fn allocate_block(
        &mut self,
        seq: &mut GenerationSequence,
        share_among_beams: bool,
    ) -> Result<()> {
        let num_required = if share_among_beams {
            1
        } else {
            seq.beam_width()
        };
        if !self.has_free_blocks(num_required) {
            return Err(KvCacheError::CapacityExhausted(format!(
                "need {num_required} free blocks, have {}",
                self.num_free_blocks()
            )));
        }

        if share_among_beams {
            let id = self.get_free_block()?;
            self.add_block_to_all_beams(id, seq);
        } else {
            for beam in 0..seq.beam_width() {
                let id = self.get_free_block()?;
                self.add_block_to_beam(id, seq, beam);
            }
        }
        Ok(())
    }

    /// Copy-on-write divergence at a previously shared block position: each
    /// beam gets its own replacement block.
    pub fn replace_shared_block(
        &mut self,
        seq: &mut GenerationSequence,
        block_idx: usize,
    ) -> Result<()> {
        if block_idx >= seq.num_blocks() {
            return Err(KvCacheError::InvalidArgument(format!(
                "block index {block_idx} outside sequence of {} blocks",
                seq.num_blocks()
            )));
        }
        let old = seq.block_ids()[0][block_idx];
        if !self.arena.block(old).is_shared() {
            return Ok(());
        }

        let beam_width = seq.beam_width();
        if !self.has_free_blocks(beam_width) {
            return Err(KvCacheError::CapacityExhausted(format!(
                "need {beam_width} free blocks to diverge, have {}",
                self.num_free_blocks()
            )));
        }

        for beam in 0..beam_width {
            let fresh = self.get_free_block()?;
            self.arena.block_mut(fresh).inc_ref();
            let prev = seq.replace_block(beam, block_idx, fresh);
            self.dec_ref_and_maybe_release(prev)?;
        }
        Ok(())
    }

    // ---- release --------------------------------------------------------

    /// Release every block of the sequence. When `request` is supplied,
    /// completed blocks are first filed into the reuse trie; on a key
    /// collision the older resident wins and the newer copy is returned to
    /// the free-list front as a fresh block.
    pub fn release_blocks(
        &mut self,
        seq: &mut GenerationSequence,
        request: Option<&CacheRequest>,
    ) -> Result<()> {
        if let Some(request) = request {
            let tokens = request.unique_tokens();
            // the latest token's KV was never written; it only exists as input
            let keys = build_block_keys(
                request.lora_task_id(),
                tokens,
                tokens.len().saturating_sub(1),
                self.tokens_per_block,
            );
            let beam0 = seq.block_ids()[0].clone();
            let count = keys.len().min(beam0.len());
            self.store_blocks(&keys[..count], &beam0[..count])?;
        }

        let held = seq.block_ids().to_vec();
        for beam in held {
            for id in beam {
                self.dec_ref_and_maybe_release(id)?;
            }
        }
        seq.clear_blocks();
        Ok(())
    }

    /// File a running sequence's full context blocks into the trie so other
    /// requests can reuse the prefix before this one finishes.
    pub fn store_context_blocks(
        &mut self,
        seq: &GenerationSequence,
        request: &CacheRequest,
    ) -> Result<()> {
        let tokens = request.unique_tokens();
        let usable = request.prompt_len().saturating_sub(1);
        let keys = build_block_keys(
            request.lora_task_id(),
            tokens,
            usable,
            self.tokens_per_block,
        );
        let beam0 = seq.block_ids()[0].clone();
        let count = keys.len().min(beam0.len());
        self.store_blocks(&keys[..count], &beam0[..count])
    }

    fn store_blocks(&mut self, keys: &[BlockKey], block_ids: &[BlockId]) -> Result<()> {
        let root = self.arena.root();
        let mut parent = root;
        let mut need_match = true;

        for (key, &id) in keys.iter().zip(block_ids) {
            if need_match {
                if let Some(existing) = self.arena.find_matching(parent, key) {
                    // older resident wins; a held duplicate keeps its fresh state
                    parent = existing;
                    continue;
                }
                need_match = false;
            }

            let parent_hash = (parent != root)
                .then(|| self.arena.block(parent).block_key().content_hash(DEFAULT_HASH_SEED));
            self.arena.link_child(parent, key.clone(), id)?;
            self.event_manager
                .block_stored(key.content_hash(DEFAULT_HASH_SEED), parent_hash);
            parent = id;
        }
        Ok(())
    }

    /// Shrink every beam by its trailing block. The block is never filed
    /// into the trie; only blocks complete at release time are reusable.
    pub fn release_last_block(&mut self, seq: &mut GenerationSequence) -> Result<()> {
        let popped = seq.pop_last_block();
        if popped.is_empty() {
            return Err(KvCacheError::InvariantViolation(
                "released the last block of a sequence holding none".to_string(),
            ));
        }
        for id in popped {
            if self.arena.block_mut(id).dec_ref()? == 0 {
                self.release_block(id, true)?;
            }
        }
        Ok(())
    }

    // ---- scheduling what-ifs -------------------------------------------

    /// Reset the scheduling shadow counters to the real state.
    pub fn start_scheduling(&mut self) {
        self.scheduling_num_free_blocks = self.free_primary.len();
        for block in self.arena.iter_mut() {
            block.start_scheduling();
        }
    }

    /// Simulate releasing the sequence's blocks, mutating only the
    /// scheduling counters. Pools, trie and free lists are untouched.
    pub fn scheduling_release_blocks(&mut self, seq: &GenerationSequence) -> Result<()> {
        for beam in seq.block_ids() {
            for &id in beam {
                if self.arena.block_mut(id).dec_scheduling_ref()? == 0 {
                    self.scheduling_num_free_blocks += 1;
                }
            }
        }
        Ok(())
    }

    // ---- trie probes ----------------------------------------------------

    /// First block key of a hypothetical request that would not be served
    /// from cache. `None` means every full block of the prompt is cached.
    pub fn find_new_context_block(
        &self,
        unique_tokens: &[UniqueToken],
        request: &CacheRequest,
    ) -> Option<BlockKey> {
        let keys = build_block_keys(
            request.lora_task_id(),
            unique_tokens,
            unique_tokens.len().saturating_sub(1),
            self.tokens_per_block,
        );
        let mut parent = self.arena.root();
        for key in keys {
            match self.arena.find_matching(parent, &key) {
                Some(id) => parent = id,
                None => return Some(key),
            }
        }
        None
    }

    // ---- internals ------------------------------------------------------

    fn update_gauges(&self) {
        self.metrics.free_primary.set(self.free_primary.len() as i64);
        self.metrics
            .free_secondary
            .set(self.free_secondary.len() as i64);
        self.metrics.used.set(self.num_allocated_blocks() as i64);
    }

    fn emit_removed(&self, id: BlockId) {
        let block = self.arena.block(id);
        if block.is_full() {
            self.event_manager
                .block_removed(block.block_key().content_hash(DEFAULT_HASH_SEED));
        }
    }

    /// Detach a block (and anything below it) from the trie before its
    /// contents are repurposed.
    fn evict_from_trie(&mut self, id: BlockId) -> Result<()> {
        if !self.arena.is_linked(id) && !self.arena.block(id).has_children() {
            return Ok(());
        }
        for keyed in self.arena.keyed_subtree_ids(id) {
            self.emit_removed(keyed);
        }
        self.arena.sever_subtree(id)
    }

    /// Put an unreferenced block back on the free list of its tier.
    fn release_block(&mut self, id: BlockId, to_front: bool) -> Result<()> {
        // a block returned as fresh must not leave keyed blocks dangling
        // below an unreachable parent
        if to_front && self.arena.block(id).has_children() {
            self.evict_from_trie(id)?;
        }

        let primary = self.arena.block(id).pool_index().is_primary();
        let queue = if primary {
            &mut self.free_primary
        } else {
            &mut self.free_secondary
        };
        if to_front {
            queue.push_front(&mut self.arena, id)?;
        } else {
            queue.push_back(&mut self.arena, id)?;
        }
        self.update_gauges();
        Ok(())
    }

    fn dec_ref_and_maybe_release(&mut self, id: BlockId) -> Result<()> {
        if self.arena.block_mut(id).dec_ref()? == 0 {
            let to_front = !self.arena.block(id).is_full();
            self.release_block(id, to_front)?;
        }
        Ok(())
    }

    fn add_block_to_beam(&mut self, id: BlockId, seq: &mut GenerationSequence, beam: usize) {
        self.arena.block_mut(id).inc_ref();
        seq.add_block_to_beam(beam, id);
    }

    fn add_block_to_all_beams(&mut self, id: BlockId, seq: &mut GenerationSequence) {
        for beam in 0..seq.beam_width() {
            self.add_block_to_beam(id, seq, beam);
        }
    }

    /// Earliest block in the primary free queue whose subtree holds no
    /// other primary block. Evicting it never forces a deeper primary
    /// prefix to be re-materialized through a missing parent.
    fn find_best_primary_block_to_free(&self) -> Option<BlockId> {
        let mut fallback = None;
        for id in self.free_primary.iter(&self.arena) {
            if fallback.is_none() {
                fallback = Some(id);
            }
            if !self.arena.has_primary_descendant(id) {
                return Some(id);
            }
        }
        fallback
    }

    /// Find the least-valuable primary block and hand it out fresh,
    /// offloading its contents to secondary memory first when it still has
    /// reuse value and a slot is available.
    fn get_free_block(&mut self) -> Result<BlockId> {
        let victim = self.find_best_primary_block_to_free().ok_or_else(|| {
            KvCacheError::CapacityExhausted("no free blocks in the primary pool".to_string())
        })?;
        self.free_primary.detach(&mut self.arena, victim)?;

        self.alloc_total_blocks += 1;
        self.alloc_new_blocks += 1;
        self.metrics.alloc_total.inc();
        self.metrics.alloc_new.inc();

        let reusable = self.arena.block(victim).is_full();
        if reusable && self.onboard_blocks && self.pools.is_some() && !self.free_secondary.is_empty()
        {
            match self.offload_block(victim) {
                Ok(freed_primary) => {
                    self.update_gauges();
                    return Ok(freed_primary);
                }
                Err(KvCacheError::Device(err)) => {
                    // residency was reverted; fall back to evicting outright
                    tracing::warn!(%err, block_id = victim, "offload copy failed; evicting block");
                }
                Err(other) => return Err(other),
            }
        }

        self.evict_from_trie(victim)?;
        self.update_gauges();
        Ok(victim)
    }

    /// Copy `victim`'s contents into a free secondary slot and return the
    /// freed primary slot as a fresh block. `victim` keeps its place in the
    /// trie and becomes the coldest secondary eviction candidate.
    fn offload_block(&mut self, victim: BlockId) -> Result<BlockId> {
        let fresh = self
            .free_secondary
            .pop_front(&mut self.arena)
            .ok_or_else(|| {
                KvCacheError::InvariantViolation(
                    "secondary free list unexpectedly empty".to_string(),
                )
            })?;
        // the slot being overwritten loses whatever reuse value it had
        self.evict_from_trie(fresh)?;

        let src = self.arena.block(victim).pool_index();
        let dst = self.arena.block(fresh).pool_index();
        let pools = self.pools.as_mut().ok_or_else(|| {
            KvCacheError::InvariantViolation("offload without allocated pools".to_string())
        })?;
        if let Err(err) = pools.copy_slot(src, dst) {
            // metadata untouched; give the destination slot back
            self.free_secondary.push_front(&mut self.arena, fresh)?;
            return Err(KvCacheError::Device(err));
        }

        self.arena.swap_pool_index(victim, fresh);
        self.free_secondary.push_back(&mut self.arena, victim)?;
        self.metrics.offloaded.inc();
        tracing::debug!(victim, fresh, "offloaded reusable block to secondary memory");
        Ok(fresh)
    }

    /// Bring an offloaded block back to primary memory, evicting or
    /// offloading another victim to make room. No-op for primary residents.
    /// The block must already be detached from the free lists.
    fn onboard_block(&mut self, id: BlockId) -> Result<()> {
        if self.arena.block(id).pool_index().is_primary() {
            return Ok(());
        }

        let fresh = self.get_free_block()?;
        let src = self.arena.block(id).pool_index();
        let dst = self.arena.block(fresh).pool_index();
        let pools = self.pools.as_mut().ok_or_else(|| {
            KvCacheError::InvariantViolation("onboard without allocated pools".to_string())
        })?;
        if let Err(err) = pools.copy_slot(src, dst) {
            // `id` stays in secondary memory; return the unused primary slot
            self.free_primary.push_front(&mut self.arena, fresh)?;
            self.update_gauges();
            return Err(KvCacheError::Device(err));
        }

        self.arena.swap_pool_index(id, fresh);
        // the swapped-out fresh block now names the vacated secondary slot
        self.free_secondary.push_front(&mut self.arena, fresh)?;
        self.metrics.onboarded.inc();
        self.update_gauges();
        tracing::debug!(block_id = id, "onboarded block to primary memory");
        Ok(())
    }

    /// Take a matched block for a sequence. A free resident is claimed
    /// exclusively (it leaves the trie and is re-stored at release); a
    /// block still referenced by another sequence is shared in place.
    fn claim_reused_block(
        &mut self,
        id: BlockId,
        seq: &mut GenerationSequence,
    ) -> Result<()> {
        if self.arena.block(id).in_free_list() {
            let primary = self.arena.block(id).pool_index().is_primary();
            if primary {
                self.free_primary.detach(&mut self.arena, id)?;
            } else {
                self.free_secondary.detach(&mut self.arena, id)?;
            }

            if let Err(err) = self.onboard_block(id) {
                // restore free-list membership before surfacing the failure
                let primary_now = self.arena.block(id).pool_index().is_primary();
                let queue = if primary_now {
                    &mut self.free_primary
                } else {
                    &mut self.free_secondary
                };
                if self.arena.is_linked(id) {
                    queue.push_back(&mut self.arena, id)?;
                } else {
                    queue.push_front(&mut self.arena, id)?;
                }
                return Err(err);
            }

            self.emit_removed(id);
            self.arena.unlink_from_parent(id)?;
        }

        self.add_block_to_all_beams(id, seq);
        self.reused_blocks += 1;
        self.alloc_total_blocks += 1;
        self.metrics.reused.inc();
        self.metrics.alloc_total.inc();
        self.update_gauges();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_model(tokens_per_block: usize) -> ModelConfig {
        ModelConfig::builder()
            .num_layers(2)
            .num_kv_heads(1)
            .size_per_head(8)
            .tokens_per_block(tokens_per_block)
            .build()
            .unwrap()
    }

    fn manager(num_primary: usize, num_secondary: usize) -> BlockManager {
        BlockManager::new(
            BlockManagerConfig::builder()
                .model(test_model(4))
                .blocks_in_primary_pool(num_primary)
                .blocks_in_secondary_pool(num_secondary)
                .build()
                .unwrap(),
        )
        .unwrap()
    }

    fn request(tokens: &[u32]) -> CacheRequest {
        CacheRequest::from_tokens(tokens, 0)
    }

    fn free_queue_ids(manager: &BlockManager) -> Vec<BlockId> {
        manager.free_primary.iter(&manager.arena).collect()
    }

    fn check_invariants(manager: &BlockManager) {
        let mut free_primary = 0;
        let mut free_secondary = 0;
        for block in manager.arena.iter() {
            // ref_count == 0 iff the block sits in a free list
            assert_eq!(
                block.ref_count() == 0,
                block.in_free_list(),
                "block {} violates the free-list/ref-count identity",
                block.block_id()
            );
            if block.in_free_list() {
                if block.pool_index().is_primary() {
                    free_primary += 1;
                } else {
                    free_secondary += 1;
                }
            }
            // keyed blocks always hang off a parent
            if block.is_full() {
                assert!(block.prev().is_some());
            }
        }
        assert_eq!(free_primary, manager.free_primary.len());
        assert_eq!(free_secondary, manager.free_secondary.len());
        assert_eq!(
            manager.num_primary_blocks + manager.num_secondary_blocks,
            manager.arena.num_blocks()
        );
        // cumulative counter identity
        assert_eq!(
            manager.alloc_total_blocks,
            manager.alloc_new_blocks + manager.reused_blocks
        );
    }

    #[test]
    fn test_first_request_allocates_fresh_blocks() {
        let mut manager = manager(8, 0);
        let req = request(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        let mut seq = GenerationSequence::new(0, 10, 1);

        let reused = manager
            .add_sequence_with_reuse(&mut seq, 10, 3, &req)
            .unwrap();

        assert_eq!(reused, 0);
        assert_eq!(seq.num_blocks(), 3);
        assert_eq!(manager.num_allocated_blocks(), 3);
        assert_eq!(manager.num_free_blocks(), 5);
        assert_eq!(manager.num_reused_blocks(), 0);
        assert_eq!(manager.num_alloc_new_blocks(), 3);
        check_invariants(&manager);
    }

    #[test]
    fn test_completion_stores_full_blocks() {
        let mut manager = manager(8, 0);
        let mut req = request(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        let mut seq = GenerationSequence::new(0, 10, 1);
        manager
            .add_sequence_with_reuse(&mut seq, 10, 3, &req)
            .unwrap();
        let held: Vec<_> = seq.block_ids()[0].clone();

        // generate to length 12; still inside the three context blocks
        req.add_token(10);
        req.add_token(11);
        seq.add_new_tokens(2);

        manager.release_blocks(&mut seq, Some(&req)).unwrap();

        // 11 tokens carry KV -> two full blocks filed under their keys
        assert_eq!(manager.num_free_blocks(), 8);
        let root = manager.arena.root();
        let k0 = BlockKey::new(0, crate::tokens::unique_tokens(&[0, 1, 2, 3]));
        let k1 = BlockKey::new(0, crate::tokens::unique_tokens(&[4, 5, 6, 7]));
        let b0 = manager.arena.find_matching(root, &k0).unwrap();
        let b1 = manager.arena.find_matching(b0, &k1).unwrap();
        assert_eq!(b0, held[0]);
        assert_eq!(b1, held[1]);

        // stored blocks are parked at the back, the partial one in front
        let queue = free_queue_ids(&manager);
        assert_eq!(queue[0], held[2]);
        assert_eq!(&queue[6..], &[held[0], held[1]]);
        check_invariants(&manager);
    }

    #[test]
    fn test_prefix_hit_reuses_stored_blocks() {
        let mut manager = manager(8, 0);

        // first request stores two full blocks on release
        let mut req1 = request(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        let mut seq1 = GenerationSequence::new(0, 10, 1);
        manager
            .add_sequence_with_reuse(&mut seq1, 10, 3, &req1)
            .unwrap();
        let held1: Vec<_> = seq1.block_ids()[0].clone();
        req1.add_token(10);
        req1.add_token(11);
        seq1.add_new_tokens(2);
        manager.release_blocks(&mut seq1, Some(&req1)).unwrap();

        let alloc_new_before = manager.num_alloc_new_blocks();

        // same eight-token prefix, different tail
        let req2 = request(&[0, 1, 2, 3, 4, 5, 6, 7, 80, 90]);
        let mut seq2 = GenerationSequence::new(1, 10, 1);
        let reused = manager
            .add_sequence_with_reuse(&mut seq2, 10, 3, &req2)
            .unwrap();

        assert_eq!(reused, 8);
        assert_eq!(manager.num_reused_blocks(), 2);
        assert_eq!(manager.num_alloc_new_blocks(), alloc_new_before + 1);
        // the matched blocks are the stored ones, claimed exclusively
        assert_eq!(seq2.block_ids()[0][0], held1[0]);
        assert_eq!(seq2.block_ids()[0][1], held1[1]);
        assert!(!manager.arena.is_linked(held1[0]));
        check_invariants(&manager);
    }

    #[test]
    fn test_duplicate_fill_discarded_on_collision() {
        let mut manager = manager(8, 0);
        let prompt = [0u32, 1, 2, 3, 4, 5, 6, 7, 8, 9];

        // request A stores K0, K1; request B claims them
        let mut req_a = request(&prompt);
        let mut seq_a = GenerationSequence::new(0, 10, 1);
        manager
            .add_sequence_with_reuse(&mut seq_a, 10, 3, &req_a)
            .unwrap();
        req_a.add_token(10);
        seq_a.add_new_tokens(1);
        manager.release_blocks(&mut seq_a, Some(&req_a)).unwrap();

        let req_b = request(&[0, 1, 2, 3, 4, 5, 6, 7, 80, 90]);
        let mut seq_b = GenerationSequence::new(1, 10, 1);
        manager
            .add_sequence_with_reuse(&mut seq_b, 10, 3, &req_b)
            .unwrap();
        let resident: Vec<_> = seq_b.block_ids()[0].clone();

        // request C re-fills the same prefix from scratch while B holds it
        let mut req_c = request(&prompt);
        let mut seq_c = GenerationSequence::new(2, 10, 1);
        let reused = manager
            .add_sequence_with_reuse(&mut seq_c, 10, 3, &req_c)
            .unwrap();
        assert_eq!(reused, 0, "the stored blocks are claimed, not matchable");
        let held_c: Vec<_> = seq_c.block_ids()[0].clone();

        // B completes first and re-stores K0, K1
        let mut req_b = req_b;
        req_b.add_token(100);
        seq_b.add_new_tokens(1);
        manager.release_blocks(&mut seq_b, Some(&req_b)).unwrap();

        // C completes; its re-filled K0/K1 collide with the older residents
        req_c.add_token(10);
        req_c.add_token(11);
        seq_c.add_new_tokens(2);
        manager.release_blocks(&mut seq_c, Some(&req_c)).unwrap();

        let root = manager.arena.root();
        let k0 = BlockKey::new(0, crate::tokens::unique_tokens(&[0, 1, 2, 3]));
        assert_eq!(
            manager.arena.find_matching(root, &k0),
            Some(resident[0]),
            "the older resident keeps its trie slot"
        );
        assert!(!manager.arena.block(held_c[0]).is_full());

        // the discarded duplicates went to the front as fresh blocks
        let queue = free_queue_ids(&manager);
        assert_eq!(queue[0], held_c[2]);
        assert!(queue[..3].contains(&held_c[0]));
        assert!(queue[..3].contains(&held_c[1]));
        check_invariants(&manager);
    }

    #[test]
    fn test_capacity_exhausted_and_recovery() {
        let mut manager = manager(8, 0);

        // eight sequences, one block each
        let mut seqs = Vec::new();
        for slot in 0..8 {
            let mut seq = GenerationSequence::new(slot, 4, 1);
            manager.add_sequence(&mut seq, 1, 0).unwrap();
            seqs.push(seq);
        }
        assert_eq!(manager.num_free_blocks(), 0);

        // a ninth sequence cannot be served
        let mut seq9 = GenerationSequence::new(8, 4, 1);
        let err = manager.add_sequence(&mut seq9, 1, 0).unwrap_err();
        assert!(matches!(err, KvCacheError::CapacityExhausted(_)));
        assert_eq!(seq9.num_blocks(), 0, "failed admission leaves no residue");

        // once any sequence exits, the retry succeeds as a fresh allocation
        let alloc_new = manager.num_alloc_new_blocks();
        let mut seq0 = seqs.remove(0);
        manager.release_blocks(&mut seq0, None).unwrap();
        manager.add_sequence(&mut seq9, 1, 0).unwrap();
        assert_eq!(manager.num_alloc_new_blocks(), alloc_new + 1);
        check_invariants(&manager);
    }

    #[test]
    fn test_allocate_block_requires_refcount_zero_blocks() {
        let mut manager = manager(2, 0);
        let mut seq = GenerationSequence::new(0, 8, 1);
        manager.add_sequence(&mut seq, 2, 0).unwrap();

        let err = manager.allocate_block(&mut seq, false).unwrap_err();
        assert!(matches!(err, KvCacheError::CapacityExhausted(_)));

        // a reusable (stored) block counts as free capacity
        let mut other = GenerationSequence::new(1, 4, 1);
        manager.release_blocks(&mut seq, None).unwrap();
        manager.add_sequence(&mut other, 1, 0).unwrap();
        manager.allocate_block(&mut other, false).unwrap();
        assert_eq!(other.num_blocks(), 2);
        check_invariants(&manager);
    }

    #[test]
    fn test_single_block_prompt_reuses_nothing() {
        let mut manager = manager(8, 0);
        let prompt = [1u32, 2, 3, 4];

        let mut req1 = request(&prompt);
        let mut seq1 = GenerationSequence::new(0, 4, 1);
        let reused = manager
            .add_sequence_with_reuse(&mut seq1, 4, 1, &req1)
            .unwrap();
        assert_eq!(reused, 0);

        // even after completion, a later identical prompt reuses at most
        // input_length - 1 tokens' worth of blocks: zero full blocks here
        req1.add_token(5);
        seq1.add_new_tokens(1);
        manager.release_blocks(&mut seq1, Some(&req1)).unwrap();

        let req2 = request(&prompt);
        let mut seq2 = GenerationSequence::new(1, 4, 1);
        let reused = manager
            .add_sequence_with_reuse(&mut seq2, 4, 1, &req2)
            .unwrap();
        assert_eq!(reused, 0);
        check_invariants(&manager);
    }

    #[test]
    fn test_release_without_reuse_restores_free_count() {
        let mut manager = manager(8, 0);
        let free_before = manager.num_free_blocks();

        let mut seq = GenerationSequence::new(0, 10, 2);
        manager.add_sequence(&mut seq, 3, 2).unwrap();
        // two shared + one per-beam block
        assert_eq!(manager.num_free_blocks(), free_before - 4);
        check_invariants(&manager);

        manager.release_blocks(&mut seq, None).unwrap();
        assert_eq!(manager.num_free_blocks(), free_before);
        check_invariants(&manager);
    }

    #[test]
    fn test_beam_sharing_and_divergence() {
        let mut manager = manager(8, 0);
        let mut seq = GenerationSequence::new(0, 8, 2);
        manager.add_sequence(&mut seq, 2, 1).unwrap();

        let shared = seq.block_ids()[0][0];
        let unshared0 = seq.block_ids()[0][1];
        let unshared1 = seq.block_ids()[1][1];
        assert_eq!(shared, seq.block_ids()[1][0]);
        assert_ne!(unshared0, unshared1);
        assert_eq!(manager.arena.block(shared).ref_count(), 2);
        assert_eq!(manager.arena.block(unshared0).ref_count(), 1);

        manager.replace_shared_block(&mut seq, 0).unwrap();
        let diverged0 = seq.block_ids()[0][0];
        let diverged1 = seq.block_ids()[1][0];
        assert_ne!(diverged0, diverged1);
        assert_eq!(manager.arena.block(shared).ref_count(), 0);
        assert!(manager.arena.block(shared).in_free_list());
        check_invariants(&manager);

        // replacing an unshared position is a no-op
        manager.replace_shared_block(&mut seq, 1).unwrap();
        assert_eq!(seq.block_ids()[0][1], unshared0);
        check_invariants(&manager);
    }

    #[test]
    fn test_release_last_block() {
        let mut manager = manager(8, 0);
        let mut seq = GenerationSequence::new(0, 12, 1);
        manager.add_sequence(&mut seq, 3, 0).unwrap();
        let last = seq.block_ids()[0][2];

        manager.release_last_block(&mut seq).unwrap();
        assert_eq!(seq.num_blocks(), 2);
        assert!(manager.arena.block(last).in_free_list());
        assert!(!manager.arena.block(last).is_full());
        // returned to the front: next fresh allocation picks it up
        assert_eq!(free_queue_ids(&manager)[0], last);
        check_invariants(&manager);
    }

    #[test]
    fn test_scheduling_counters_do_not_touch_real_state() {
        let mut manager = manager(8, 0);
        let mut seq = GenerationSequence::new(0, 10, 1);
        manager.add_sequence(&mut seq, 3, 0).unwrap();

        manager.start_scheduling();
        assert!(manager.scheduling_has_free_blocks(5));
        assert!(!manager.scheduling_has_free_blocks(6));

        manager.scheduling_release_blocks(&seq).unwrap();
        assert!(manager.scheduling_has_free_blocks(8));
        // real state unchanged
        assert_eq!(manager.num_free_blocks(), 5);
        assert_eq!(manager.arena.block(seq.block_ids()[0][0]).ref_count(), 1);

        // double simulated release is an accounting bug
        assert!(manager.scheduling_release_blocks(&seq).is_err());

        manager.start_scheduling();
        assert!(manager.scheduling_has_free_blocks(5));
        assert!(!manager.scheduling_has_free_blocks(6));
        check_invariants(&manager);
    }

    #[test]
    fn test_store_context_blocks_shares_while_running() {
        let mut manager = manager(8, 0);
        let prompt = [0u32, 1, 2, 3, 4, 5, 6, 7, 8, 9];

        let req1 = request(&prompt);
        let mut seq1 = GenerationSequence::new(0, 10, 1);
        manager
            .add_sequence_with_reuse(&mut seq1, 10, 3, &req1)
            .unwrap();
        manager.store_context_blocks(&seq1, &req1).unwrap();

        // a second request reuses the prefix while seq1 is still running
        let req2 = request(&[0, 1, 2, 3, 4, 5, 6, 7, 80, 90]);
        let mut seq2 = GenerationSequence::new(1, 10, 1);
        let reused = manager
            .add_sequence_with_reuse(&mut seq2, 10, 3, &req2)
            .unwrap();
        assert_eq!(reused, 8);
        assert_eq!(seq2.block_ids()[0][0], seq1.block_ids()[0][0]);
        assert_eq!(
            manager.arena.block(seq1.block_ids()[0][0]).ref_count(),
            2,
            "shared in place, not claimed exclusively"
        );
        // still filed in the trie for further sharers
        assert!(manager.arena.is_linked(seq1.block_ids()[0][0]));

        manager.release_blocks(&mut seq1, Some(&req1)).unwrap();
        manager.release_blocks(&mut seq2, Some(&req2)).unwrap();
        check_invariants(&manager);
    }

    #[test]
    fn test_find_new_context_block() {
        let mut manager = manager(8, 0);
        let prompt = [0u32, 1, 2, 3, 4, 5, 6, 7, 8, 9];

        let mut req = request(&prompt);
        let mut seq = GenerationSequence::new(0, 10, 1);
        manager
            .add_sequence_with_reuse(&mut seq, 10, 3, &req)
            .unwrap();
        req.add_token(10);
        seq.add_new_tokens(1);
        manager.release_blocks(&mut seq, Some(&req)).unwrap();

        // both full blocks cached
        let probe = request(&prompt);
        let tokens = crate::tokens::unique_tokens(&prompt);
        assert!(manager.find_new_context_block(&tokens, &probe).is_none());

        // diverging second block is the first miss
        let tokens = crate::tokens::unique_tokens(&[0, 1, 2, 3, 9, 9, 9, 9, 8]);
        let missing = manager.find_new_context_block(&tokens, &probe).unwrap();
        assert_eq!(
            missing.unique_tokens(),
            &crate::tokens::unique_tokens(&[9, 9, 9, 9])[..]
        );
    }

    #[test]
    fn test_offload_and_onboard_roundtrip() {
        let mut manager = BlockManager::new(
            BlockManagerConfig::builder()
                .model(test_model(4))
                .blocks_in_primary_pool(4)
                .blocks_in_secondary_pool(4)
                .build()
                .unwrap(),
        )
        .unwrap();
        manager.allocate_pools(DType::FP16, false).unwrap();

        // fill the primary pool with reuse-eligible blocks
        let prompt_a = [0u32, 1, 2, 3, 4, 5, 6, 7, 8];
        let mut req_a = request(&prompt_a);
        let mut seq_a = GenerationSequence::new(0, 9, 1);
        manager
            .add_sequence_with_reuse(&mut seq_a, 9, 3, &req_a)
            .unwrap();
        req_a.add_token(9);
        seq_a.add_new_tokens(1);
        manager.release_blocks(&mut seq_a, Some(&req_a)).unwrap();

        let prompt_b = [10u32, 11, 12, 13, 14];
        let mut req_b = request(&prompt_b);
        let mut seq_b = GenerationSequence::new(1, 5, 1);
        manager
            .add_sequence_with_reuse(&mut seq_b, 5, 2, &req_b)
            .unwrap();
        req_b.add_token(15);
        req_b.add_token(16);
        req_b.add_token(17);
        req_b.add_token(18);
        seq_b.add_new_tokens(4);
        manager.release_blocks(&mut seq_b, Some(&req_b)).unwrap();

        // two stored blocks from A, two from B; all four blocks free
        assert_eq!(manager.num_free_blocks(), 4);

        // a new request evicts: the coldest reusable block is offloaded
        // instead of destroyed
        let req_c = request(&[50u32, 51, 52, 53, 54, 55, 56, 57, 58]);
        let mut seq_c = GenerationSequence::new(2, 9, 1);
        manager
            .add_sequence_with_reuse(&mut seq_c, 9, 3, &req_c)
            .unwrap();

        let offloaded: Vec<_> = manager
            .arena
            .iter()
            .filter(|b| !b.pool_index().is_primary() && b.is_full())
            .map(|b| b.block_id())
            .collect();
        assert_eq!(offloaded.len(), 3, "evicted reusable blocks moved tiers");
        assert_eq!(manager.metrics.offloaded.get(), 3);
        check_invariants(&manager);

        manager.release_blocks(&mut seq_c, None).unwrap();

        // a request matching an offloaded prefix onboards it back
        let reused_before = manager.num_reused_blocks();
        let req_d = request(&prompt_a);
        let mut seq_d = GenerationSequence::new(3, 9, 1);
        let reused = manager
            .add_sequence_with_reuse(&mut seq_d, 9, 3, &req_d)
            .unwrap();
        assert_eq!(reused, 8);
        assert_eq!(manager.num_reused_blocks(), reused_before + 2);
        assert!(manager.metrics.onboarded.get() >= 1);
        for &id in &seq_d.block_ids()[0][..2] {
            assert!(manager.arena.block(id).pool_index().is_primary());
        }
        check_invariants(&manager);
    }

    #[test]
    fn test_eviction_prefers_blocks_without_primary_descendants() {
        let mut manager = manager(8, 0);
        let prompt = [0u32, 1, 2, 3, 4, 5, 6, 7, 8, 9];

        let mut req = request(&prompt);
        let mut seq = GenerationSequence::new(0, 10, 1);
        manager
            .add_sequence_with_reuse(&mut seq, 10, 3, &req)
            .unwrap();
        req.add_token(10);
        seq.add_new_tokens(1);
        manager.release_blocks(&mut seq, Some(&req)).unwrap();

        // free queue: [partial, 5 fresh, parent, child]; consume all eight
        // and verify the keyed parent is evicted after its child
        let root = manager.arena.root();
        let k0 = BlockKey::new(0, crate::tokens::unique_tokens(&[0, 1, 2, 3]));
        let parent = manager.arena.find_matching(root, &k0).unwrap();

        let mut eviction_order = Vec::new();
        let mut sink = GenerationSequence::new(1, 32, 1);
        for _ in 0..8 {
            manager.allocate_block(&mut sink, false).unwrap();
            eviction_order.push(*sink.block_ids()[0].last().unwrap());
        }
        let parent_pos = eviction_order.iter().position(|&b| b == parent).unwrap();
        assert_eq!(
            parent_pos, 7,
            "the parent with a live primary descendant goes last"
        );
        check_invariants(&manager);
    }

    #[test]
    fn test_invalid_arguments_rejected() {
        let mut manager = manager(8, 0);
        let req = request(&[1, 2, 3]);
        let mut seq = GenerationSequence::new(0, 3, 1);

        // input length beyond the request's tokens
        assert!(matches!(
            manager.add_sequence_with_reuse(&mut seq, 5, 2, &req),
            Err(KvCacheError::InvalidArgument(_))
        ));
        // zero-length input
        assert!(matches!(
            manager.add_sequence_with_reuse(&mut seq, 0, 0, &req),
            Err(KvCacheError::InvalidArgument(_))
        ));
        assert_eq!(seq.num_blocks(), 0);

        assert!(matches!(
            manager.kv_block_index(999, 0),
            Err(KvCacheError::InvalidArgument(_))
        ));
        assert!(matches!(
            manager.kv_block_index(0, 2),
            Err(KvCacheError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_double_release_detected() {
        let mut manager = manager(8, 0);
        let mut seq = GenerationSequence::new(0, 4, 1);
        manager.add_sequence(&mut seq, 1, 0).unwrap();

        let held = seq.block_ids()[0].clone();
        manager.release_blocks(&mut seq, None).unwrap();

        // releasing again through a stale record underflows the ref count
        let mut stale = GenerationSequence::new(0, 4, 1);
        stale.add_block_to_beam(0, held[0]);
        assert!(matches!(
            manager.release_blocks(&mut stale, None),
            Err(KvCacheError::InvariantViolation(_))
        ));
    }
}
