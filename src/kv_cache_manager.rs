// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Public façade over the block manager.
//!
//! [`KvCacheManager`] owns a [`BlockManager`] plus one sequence record per
//! slot and layers the capacity policies on top:
//!
//! - **Attention window**: once a sequence reaches
//!   `max_blocks_per_seq` blocks, further tokens cyclically overwrite the
//!   oldest non-sink block instead of growing the sequence.
//! - **Sink tokens**: the first `sink_token_len` tokens (padded up to a
//!   whole block) are pinned and never overwritten by the cyclic policy.
//! - **Beam width**: context blocks are shared across beams; generation
//!   blocks are per-beam, with copy-on-write divergence when the cyclic
//!   policy wraps onto a still-shared block.
//!
//! Token counts tracked here include the sink bubble padding, so token
//! index and cache position only differ once a sequence wraps.

use std::collections::HashSet;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::block_manager::block::KvCacheIndex;
use crate::block_manager::sequence::GenerationSequence;
use crate::block_manager::{
    BlockManager, BlockManagerConfig, CacheType, KvCacheError, ModelConfig, Result, RuntimeConfig,
    WorldConfig,
};
use crate::common::dtype::DType;
use crate::request::CacheRequest;
use crate::tokens::{BlockKey, UniqueToken};

/// Sizing and policy knobs consumed by [`KvCacheManager::calculate_max_num_blocks`]
/// and carried through engine configuration.
#[derive(Debug, Clone, Builder, Validate)]
#[builder(pattern = "owned")]
pub struct KvCacheConfig {
    /// Fraction of free primary memory handed to the cache.
    #[validate(range(min = 0.0, max = 1.0))]
    #[builder(default = "0.9")]
    pub free_memory_fraction: f64,

    /// Optional hard cap on cached tokens, applied after the fraction.
    #[builder(default, setter(strip_option))]
    pub max_tokens: Option<usize>,

    /// Byte budget for the secondary (host) pool; zero disables offload.
    #[builder(default)]
    pub host_cache_bytes: u64,

    #[builder(default)]
    pub enable_block_reuse: bool,

    #[builder(default = "true")]
    pub onboard_blocks: bool,

    #[builder(default)]
    pub use_uvm: bool,
}

impl KvCacheConfig {
    pub fn builder() -> KvCacheConfigBuilder {
        KvCacheConfigBuilder::default()
    }
}

#[derive(Clone, Builder)]
#[builder(pattern = "owned")]
pub struct KvCacheManagerConfig {
    pub model: ModelConfig,

    pub blocks_in_primary_pool: usize,

    #[builder(default)]
    pub blocks_in_secondary_pool: usize,

    pub max_num_sequences: usize,

    #[builder(default = "1")]
    pub max_beam_width: usize,

    /// Upper bound on how many recent tokens attention reads.
    pub max_attention_window: usize,

    #[builder(default)]
    pub sink_token_len: usize,

    /// Grow each sequence by one extra block beyond the window.
    #[builder(default)]
    pub use_one_more_block: bool,

    #[builder(default)]
    pub enable_block_reuse: bool,

    #[builder(default = "true")]
    pub onboard_blocks: bool,

    #[builder(default)]
    pub cache_type: CacheType,

    #[builder(default)]
    pub runtime: RuntimeConfig,
}

impl KvCacheManagerConfig {
    pub fn builder() -> KvCacheManagerConfigBuilder {
        KvCacheManagerConfigBuilder::default()
    }
}

/// Aggregate counters exposed to schedulers and telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvCacheStats {
    pub max_num_blocks: usize,
    pub free_num_blocks: usize,
    pub used_num_blocks: usize,
    pub tokens_per_block: usize,
    pub alloc_total_blocks: u64,
    pub alloc_new_blocks: u64,
    pub reused_blocks: u64,
}

#[derive(Debug)]
pub struct KvCacheManager {
    block_manager: BlockManager,
    sequences: Vec<Option<GenerationSequence>>,
    /// Cached `[slot, beam, 2, max_blocks_per_seq]` plane indices for every
    /// managed sequence, refreshed whenever a sequence's blocks change.
    block_offsets: Vec<KvCacheIndex>,

    max_num_sequences: usize,
    max_beam_width: usize,
    max_blocks_per_seq: usize,
    tokens_per_block: usize,
    /// Maximum token count per sequence including the sink bubble; the
    /// cache turns cyclic beyond it.
    max_token_num: usize,
    sink_bubble_length: usize,
    /// Tokens covered by the pinned sink blocks (sink tokens plus bubble).
    sink_block_token_length: usize,
    enable_block_reuse: bool,
    cache_type: CacheType,
}

impl KvCacheManager {
    pub fn new(config: KvCacheManagerConfig) -> Result<Self> {
        if config.max_num_sequences == 0 {
            return Err(KvCacheError::InvalidArgument(
                "need at least one sequence slot".to_string(),
            ));
        }
        if config.max_beam_width == 0 {
            return Err(KvCacheError::InvalidArgument(
                "beam width bound must be positive".to_string(),
            ));
        }
        if config.max_attention_window == 0 {
            return Err(KvCacheError::InvalidArgument(
                "attention window must be positive".to_string(),
            ));
        }
        if config.sink_token_len >= config.max_attention_window {
            return Err(KvCacheError::InvalidArgument(
                "sink tokens must fit inside the attention window".to_string(),
            ));
        }

        let tokens_per_block = config.model.tokens_per_block;
        let sink_bubble_length =
            Self::get_sink_bubble_length(config.sink_token_len, tokens_per_block);
        if config.enable_block_reuse && sink_bubble_length != 0 {
            return Err(KvCacheError::InvalidArgument(
                "block reuse requires sink tokens aligned to the block size".to_string(),
            ));
        }

        let mut max_token_num = config.max_attention_window + sink_bubble_length;
        if config.use_one_more_block {
            max_token_num += tokens_per_block;
        }
        let max_blocks_per_seq = max_token_num.div_ceil(tokens_per_block);
        let sink_block_token_length = config.sink_token_len + sink_bubble_length;

        let block_manager = BlockManager::new(BlockManagerConfig {
            model: config.model,
            blocks_in_primary_pool: config.blocks_in_primary_pool,
            blocks_in_secondary_pool: config.blocks_in_secondary_pool,
            onboard_blocks: config.onboard_blocks,
            cache_type: config.cache_type,
            runtime: config.runtime,
        })?;

        let offsets_len = config.max_num_sequences * config.max_beam_width * 2 * max_blocks_per_seq;

        tracing::debug!(
            max_blocks_per_seq,
            max_token_num,
            sink_block_token_length,
            "constructed kv cache manager"
        );

        Ok(Self {
            block_manager,
            sequences: (0..config.max_num_sequences).map(|_| None).collect(),
            block_offsets: vec![KvCacheIndex::default(); offsets_len],
            max_num_sequences: config.max_num_sequences,
            max_beam_width: config.max_beam_width,
            max_blocks_per_seq,
            tokens_per_block,
            max_token_num,
            sink_bubble_length,
            sink_block_token_length,
            enable_block_reuse: config.enable_block_reuse,
            cache_type: config.cache_type,
        })
    }

    /// Allocate the backing pools; dtype is late-bound here.
    pub fn allocate_pools(&mut self, dtype: DType, use_uvm: bool) -> Result<()> {
        self.block_manager.allocate_pools(dtype, use_uvm)
    }

    // ---- accessors ------------------------------------------------------

    pub fn block_manager(&self) -> &BlockManager {
        &self.block_manager
    }

    pub fn tokens_per_block(&self) -> usize {
        self.tokens_per_block
    }

    pub fn max_num_blocks(&self) -> usize {
        self.block_manager.max_num_blocks()
    }

    pub fn num_free_blocks(&self) -> usize {
        self.block_manager.num_free_blocks()
    }

    pub fn used_num_blocks(&self) -> usize {
        self.block_manager.num_allocated_blocks()
    }

    pub fn max_blocks_per_seq(&self) -> usize {
        self.max_blocks_per_seq
    }

    pub fn is_enable_block_reuse(&self) -> bool {
        self.enable_block_reuse
    }

    pub fn is_cross_kv(&self) -> bool {
        matches!(self.cache_type, CacheType::CrossAttention)
    }

    pub fn get_kv_cache_stats(&self) -> KvCacheStats {
        KvCacheStats {
            max_num_blocks: self.max_num_blocks(),
            free_num_blocks: self.num_free_blocks(),
            used_num_blocks: self.used_num_blocks(),
            tokens_per_block: self.tokens_per_block,
            alloc_total_blocks: self.block_manager.num_alloc_total_blocks(),
            alloc_new_blocks: self.block_manager.num_alloc_new_blocks(),
            reused_blocks: self.block_manager.num_reused_blocks(),
        }
    }

    pub fn get_sequence(&self, slot: usize) -> Result<&GenerationSequence> {
        self.validate_slot(slot)?;
        self.sequences[slot]
            .as_ref()
            .ok_or_else(|| KvCacheError::InvalidArgument(format!("no sequence at slot {slot}")))
    }

    // ---- sequence lifecycle --------------------------------------------

    /// Admit a request to `slot`. With reuse enabled and a request
    /// supplied, the longest cached prefix is served from the trie and
    /// `prepopulated_prompt_len` is written back.
    pub fn add_sequence(
        &mut self,
        slot: usize,
        input_length: usize,
        beam_width: usize,
        request: Option<&mut CacheRequest>,
    ) -> Result<()> {
        self.validate_slot(slot)?;
        if input_length < 1 {
            return Err(KvCacheError::InvalidArgument(
                "input length must be positive".to_string(),
            ));
        }
        if beam_width < 1 || beam_width > self.max_beam_width {
            return Err(KvCacheError::InvalidArgument(format!(
                "beam width {beam_width} outside [1, {}]",
                self.max_beam_width
            )));
        }

        let effective_input_length = input_length + self.sink_bubble_length;
        // a prompt beyond the window starts cyclic and is not reusable
        let is_cyclic = effective_input_length > self.max_token_num;
        let context_token_len = effective_input_length.min(self.max_token_num);
        let num_context_blocks = context_token_len.div_ceil(self.tokens_per_block);

        let mut seq = GenerationSequence::new(slot, effective_input_length, beam_width);

        let result = match request {
            Some(req)
                if self.enable_block_reuse
                    && !is_cyclic
                    && matches!(self.cache_type, CacheType::SelfAttention) =>
            {
                req.set_slot(Some(slot));
                self.block_manager
                    .add_sequence_with_reuse(&mut seq, input_length, num_context_blocks, req)
                    .map(|prepopulated| req.set_prepopulated_prompt_len(prepopulated))
            }
            request => {
                if let Some(req) = request {
                    req.set_slot(Some(slot));
                }
                let unshared_block_idx = if beam_width > 1 || is_cyclic {
                    (effective_input_length - 1) / self.tokens_per_block
                } else {
                    num_context_blocks
                };
                self.block_manager
                    .add_sequence(&mut seq, num_context_blocks, unshared_block_idx)
            }
        };

        if let Err(err) = result {
            // hand back whatever was assigned before the failure; the slot
            // stays untouched
            let _ = self.block_manager.release_blocks(&mut seq, None);
            return Err(err);
        }

        self.sequences[slot] = Some(seq);
        self.cache_block_offsets(slot);
        Ok(())
    }

    /// Release the sequence at `slot`, filing reusable blocks into the trie
    /// when a request is supplied and the sequence never turned cyclic.
    pub fn remove_sequence(&mut self, slot: usize, request: Option<&CacheRequest>) -> Result<()> {
        self.validate_slot(slot)?;
        let Some(mut seq) = self.sequences[slot].take() else {
            return Err(KvCacheError::InvalidArgument(format!(
                "no sequence at slot {slot}"
            )));
        };

        let is_cyclic = seq.num_tokens() > self.max_token_num;
        let store = if self.enable_block_reuse
            && !is_cyclic
            && matches!(self.cache_type, CacheType::SelfAttention)
        {
            request
        } else {
            None
        };

        let result = self.block_manager.release_blocks(&mut seq, store);
        self.reset_block_offsets(slot);
        result
    }

    /// Advance the sequence by `n` already-covered context tokens. Never
    /// allocates; the context blocks were assigned at admission.
    pub fn add_context_tokens(&mut self, slot: usize, num_tokens: usize) -> Result<()> {
        self.validate_slot(slot)?;
        let seq = self.sequences[slot].as_mut().ok_or_else(|| {
            KvCacheError::InvalidArgument(format!("no sequence at slot {slot}"))
        })?;
        seq.add_new_tokens(num_tokens);
        Ok(())
    }

    /// Account one generated token, growing the sequence by a block when the
    /// token starts a new one. Past the attention window the cache is
    /// cyclic: positions wrap and no growth happens, except copy-on-write
    /// divergence when beams wrap onto a still-shared block.
    pub fn add_token(&mut self, slot: usize) -> Result<()> {
        self.update_token(slot, true)
    }

    /// Remove the trailing token, releasing the trailing block when the
    /// token was its first. Refuses to touch sink tokens.
    pub fn remove_token(&mut self, slot: usize) -> Result<()> {
        self.update_token(slot, false)
    }

    /// Roll the sequence back by `rewind_len` tokens. Validated up front:
    /// a rewind crossing the sink-block boundary is refused outright.
    pub fn rewind_kv_cache(&mut self, slot: usize, rewind_len: usize) -> Result<()> {
        self.validate_slot(slot)?;
        let num_tokens = self
            .sequences[slot]
            .as_ref()
            .ok_or_else(|| KvCacheError::InvalidArgument(format!("no sequence at slot {slot}")))?
            .num_tokens();
        if rewind_len > num_tokens || num_tokens - rewind_len < self.sink_block_token_length {
            return Err(KvCacheError::InvalidArgument(format!(
                "rewind of {rewind_len} tokens crosses the sink block boundary"
            )));
        }
        for _ in 0..rewind_len {
            self.remove_token(slot)?;
        }
        Ok(())
    }

    /// File the full context blocks of a running sequence into the trie so
    /// later requests reuse them without waiting for this one to finish.
    pub fn store_context_blocks(&mut self, slot: usize, request: &CacheRequest) -> Result<()> {
        self.validate_slot(slot)?;
        let Some(seq) = self.sequences[slot].as_ref() else {
            return Err(KvCacheError::InvalidArgument(format!(
                "no sequence at slot {slot}"
            )));
        };
        let is_cyclic = seq.num_tokens() > self.max_token_num;
        if self.enable_block_reuse
            && !is_cyclic
            && matches!(self.cache_type, CacheType::SelfAttention)
            && seq.beam_width() == 1
        {
            self.block_manager.store_context_blocks(seq, request)?;
        }
        Ok(())
    }

    /// First block key of `unique_tokens` that would miss the cache.
    pub fn find_new_context_block(
        &self,
        unique_tokens: &[UniqueToken],
        request: &CacheRequest,
    ) -> Option<BlockKey> {
        self.block_manager
            .find_new_context_block(unique_tokens, request)
    }

    // ---- scheduling probes ---------------------------------------------

    pub fn start_scheduling(&mut self) {
        self.block_manager.start_scheduling();
    }

    /// Simulate removing the sequence at `slot` against the scheduling
    /// counters only.
    pub fn scheduling_remove_sequence(&mut self, slot: usize) -> Result<()> {
        self.validate_slot(slot)?;
        let Some(seq) = self.sequences[slot].as_ref() else {
            return Err(KvCacheError::InvalidArgument(format!(
                "no sequence at slot {slot}"
            )));
        };
        self.block_manager.scheduling_release_blocks(seq)
    }

    pub fn scheduling_has_free_blocks(&self, num_required: usize) -> bool {
        self.block_manager.scheduling_has_free_blocks(num_required)
    }

    /// Blocks needed to advance `request` by one (or two) decoder steps.
    pub fn get_needed_blocks_one_step(
        &self,
        request: &CacheRequest,
        two_steps_look_ahead: bool,
    ) -> usize {
        if request.num_tokens() <= request.prompt_len() {
            // context phase: cover the whole (windowed) prompt
            let prompt_cache_len =
                (request.prompt_len() + self.sink_bubble_length).min(self.max_token_num);
            let shared_blocks = prompt_cache_len.div_ceil(self.tokens_per_block);
            if request.beam_width() > 1 {
                // the trailing context block is per-beam
                shared_blocks - 1 + request.beam_width()
            } else {
                shared_blocks
            }
        } else {
            // generation: count the block boundaries the next token(s) cross
            let steps = if two_steps_look_ahead { 2 } else { 1 };
            let start = request.num_tokens() + self.sink_bubble_length;
            let crossed = (start..start + steps)
                .filter(|&idx| {
                    idx < self.max_token_num && self.cache_position(idx) % self.tokens_per_block == 0
                })
                .count();
            crossed * request.beam_width()
        }
    }

    /// Blocks still missing to run `request` to its token budget, excluding
    /// what its sequence already holds.
    pub fn get_remaining_blocks_to_completion(&self, request: &CacheRequest) -> usize {
        let context_len = (request.prompt_len() + self.sink_bubble_length).min(self.max_token_num);
        let total_len = (request.prompt_len() + request.max_new_tokens() + self.sink_bubble_length)
            .min(self.max_token_num);

        let context_blocks = context_len.div_ceil(self.tokens_per_block);
        let total_blocks = total_len.div_ceil(self.tokens_per_block);
        let needed =
            context_blocks + (total_blocks - context_blocks) * request.beam_width();

        let allocated = request
            .slot()
            .and_then(|slot| self.sequences.get(slot))
            .and_then(|seq| seq.as_ref())
            .map(|seq| {
                seq.block_ids()
                    .iter()
                    .flatten()
                    .collect::<HashSet<_>>()
                    .len()
            })
            .unwrap_or(0);

        needed.saturating_sub(allocated)
    }

    // ---- offset export --------------------------------------------------

    /// Base addresses of the primary and secondary pools, if allocated.
    pub fn get_block_pool_pointers(&self) -> Option<(u64, Option<u64>)> {
        self.block_manager.pool_base_addrs()
    }

    /// Write the cached plane indices of `slot` into `output`, laid out as
    /// `[slot_rows, beam_width, 2, max_blocks_per_seq]` starting at row
    /// `output_slot_offset`. Returns the largest per-beam block count.
    pub fn copy_block_offsets(
        &self,
        output: &mut [KvCacheIndex],
        output_slot_offset: usize,
        slot: usize,
        beam_width: usize,
    ) -> Result<usize> {
        self.validate_slot(slot)?;
        let seq = self.sequences[slot].as_ref().ok_or_else(|| {
            KvCacheError::InvalidArgument(format!("no sequence at slot {slot}"))
        })?;
        if beam_width < 1 || beam_width > seq.beam_width() {
            return Err(KvCacheError::InvalidArgument(format!(
                "beam width {beam_width} outside the sequence's {}",
                seq.beam_width()
            )));
        }

        let row = 2 * self.max_blocks_per_seq;
        let base = output_slot_offset * beam_width * row;
        if base + beam_width * row > output.len() {
            return Err(KvCacheError::InvalidArgument(format!(
                "offset output of {} entries too small for slot row {output_slot_offset}",
                output.len()
            )));
        }

        let mut max_block_count = 0;
        for beam in 0..beam_width {
            let num_blocks = seq.block_ids()[beam].len().min(self.max_blocks_per_seq);
            max_block_count = max_block_count.max(num_blocks);
            for field in 0..2 {
                for pos in 0..num_blocks {
                    output[base + (beam * 2 + field) * self.max_blocks_per_seq + pos] =
                        self.block_offsets[self.offset_index(slot, beam, field, pos)];
                }
            }
        }
        Ok(max_block_count)
    }

    /// Batched [`Self::copy_block_offsets`] over consecutive slots.
    /// Returns the largest per-beam block count across the batch.
    pub fn get_block_offsets_of_batch(
        &self,
        output: &mut [KvCacheIndex],
        first_slot: usize,
        batch_size: usize,
        beam_width: usize,
    ) -> Result<usize> {
        let mut max_block_count = 0;
        for idx in 0..batch_size {
            let count = self.copy_block_offsets(output, idx, first_slot + idx, beam_width)?;
            max_block_count = max_block_count.max(count);
        }
        Ok(max_block_count)
    }

    // ---- static utilities ----------------------------------------------

    /// Padding that rounds the sink tokens up to a whole block.
    pub fn get_sink_bubble_length(sink_token_len: usize, tokens_per_block: usize) -> usize {
        let in_last_block = sink_token_len % tokens_per_block;
        if in_last_block == 0 {
            0
        } else {
            tokens_per_block - in_last_block
        }
    }

    /// Largest attention window the primary pool can serve at full beam
    /// width.
    pub fn get_max_attention_window_upper_bound(
        blocks_in_primary_pool: usize,
        tokens_per_block: usize,
        max_beam_width: usize,
        sink_token_len: usize,
        use_one_more_block: bool,
    ) -> usize {
        let max_token_num = blocks_in_primary_pool / max_beam_width * tokens_per_block;
        let bubble = Self::get_sink_bubble_length(sink_token_len, tokens_per_block);
        let one_more = if use_one_more_block {
            tokens_per_block
        } else {
            0
        };
        max_token_num.saturating_sub(bubble + one_more)
    }

    /// Volume of one block across K and V planes, in elements.
    pub fn calculate_page_size(model: &ModelConfig) -> usize {
        model.page_volume()
    }

    /// Per-token cache footprint in elements on one worker.
    pub fn calculate_cache_size_per_token(model: &ModelConfig, world: &WorldConfig) -> usize {
        let layers = model.num_layers.div_ceil(world.pipeline_parallelism);
        let heads = model.num_kv_heads.div_ceil(world.tensor_parallelism);
        layers * 2 * heads * model.size_per_head
    }

    /// Derive `(primary, secondary)` pool block counts from the configured
    /// memory budgets.
    pub fn calculate_max_num_blocks(
        config: &KvCacheConfig,
        dtype: DType,
        model: &ModelConfig,
        world: &WorldConfig,
        free_primary_memory_bytes: u64,
    ) -> (usize, usize) {
        let token_bytes =
            Self::calculate_cache_size_per_token(model, world) * dtype.size_in_bytes();

        let mut cached_tokens =
            (free_primary_memory_bytes as f64 * config.free_memory_fraction / token_bytes as f64)
                as usize;
        if let Some(max_tokens) = config.max_tokens {
            cached_tokens = cached_tokens.min(max_tokens);
        }

        let primary = cached_tokens / model.tokens_per_block;
        let secondary =
            config.host_cache_bytes as usize / (token_bytes * model.tokens_per_block);
        (primary, secondary)
    }

    // ---- internals ------------------------------------------------------

    fn validate_slot(&self, slot: usize) -> Result<()> {
        if slot >= self.max_num_sequences {
            return Err(KvCacheError::InvalidArgument(format!(
                "slot {slot} outside [0, {})",
                self.max_num_sequences
            )));
        }
        Ok(())
    }

    /// Cache position of a token index; wraps over the non-sink region once
    /// the window is exceeded.
    fn cache_position(&self, token_idx: usize) -> usize {
        if token_idx < self.max_token_num {
            token_idx
        } else {
            let cyclic_len = self.max_token_num - self.sink_block_token_length;
            self.sink_block_token_length + (token_idx - self.sink_block_token_length) % cyclic_len
        }
    }

    fn update_token(&mut self, slot: usize, add: bool) -> Result<()> {
        self.validate_slot(slot)?;
        if self.is_cross_kv() {
            // cross caches are sized by the encoder output
            return Ok(());
        }

        let mut seq = self.sequences[slot].take().ok_or_else(|| {
            KvCacheError::InvalidArgument(format!("no sequence at slot {slot}"))
        })?;
        let result = self.update_token_inner(&mut seq, add);
        self.sequences[slot] = Some(seq);

        if result? {
            self.cache_block_offsets(slot);
        }
        Ok(())
    }

    fn update_token_inner(&mut self, seq: &mut GenerationSequence, add: bool) -> Result<bool> {
        let tokens_per_block = self.tokens_per_block;

        if add {
            let token_idx = seq.num_tokens();
            let position = self.cache_position(token_idx);
            let mut blocks_changed = false;
            if position % tokens_per_block == 0 {
                if token_idx < self.max_token_num {
                    // grow before mutating the count, so failure leaves the
                    // sequence untouched
                    self.block_manager.allocate_block(seq, false)?;
                    blocks_changed = true;
                } else if seq.beam_width() > 1 {
                    // cyclic wrap onto a context block still shared by beams
                    self.block_manager
                        .replace_shared_block(seq, position / tokens_per_block)?;
                    blocks_changed = true;
                }
            }
            seq.add_new_tokens(1);
            Ok(blocks_changed)
        } else {
            if seq.num_tokens() == 0 {
                return Err(KvCacheError::InvalidArgument(
                    "no tokens left to remove".to_string(),
                ));
            }
            let token_idx = seq.num_tokens() - 1;
            if token_idx < self.sink_block_token_length {
                return Err(KvCacheError::InvalidArgument(
                    "cannot remove sink tokens".to_string(),
                ));
            }
            let position = self.cache_position(token_idx);
            seq.remove_tokens(1);
            if position % tokens_per_block == 0 && token_idx < self.max_token_num {
                self.block_manager.release_last_block(seq)?;
            }
            Ok(false)
        }
    }

    fn offset_index(&self, slot: usize, beam: usize, field: usize, pos: usize) -> usize {
        ((slot * self.max_beam_width + beam) * 2 + field) * self.max_blocks_per_seq + pos
    }

    fn cache_block_offsets(&mut self, slot: usize) {
        let beam_cap = self.max_beam_width;
        let blocks_cap = self.max_blocks_per_seq;
        let Some(seq) = self.sequences[slot].as_ref() else {
            return;
        };
        for (beam, ids) in seq.block_ids().iter().enumerate() {
            for (pos, &id) in ids.iter().enumerate().take(blocks_cap) {
                let index = self.block_manager.arena().block(id).pool_index();
                for field in 0..2u32 {
                    let out =
                        ((slot * beam_cap + beam) * 2 + field as usize) * blocks_cap + pos;
                    self.block_offsets[out] = index.plane(field);
                }
            }
        }
    }

    fn reset_block_offsets(&mut self, slot: usize) {
        let row = self.max_beam_width * 2 * self.max_blocks_per_seq;
        let start = slot * row;
        self.block_offsets[start..start + row].fill(KvCacheIndex::default());
    }
}
