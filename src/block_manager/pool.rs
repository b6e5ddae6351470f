// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The two storage pools backing the block arena.
//!
//! Each pool is one flat allocation of `num_blocks * block_bytes`, where a
//! block's bytes hold all of its layers contiguously. Pools never resize;
//! every allocation decision in the manager is pure index manipulation, and
//! the only data movement is whole-block copies between tiers during
//! offload and onboarding.
//!
//! The internal layout (`[n_blocks, n_layers, 2, n_kv_heads,
//! tokens_per_block, head_size]` elements) is an interface with the
//! attention kernels; the manager itself only ever addresses whole slots.

use std::sync::Arc;

use super::block::KvCacheIndex;
use super::storage::{CopyStream, Storage, StorageAllocator, StorageError, StorageResult};

#[derive(Debug)]
struct Pool {
    storage: Box<dyn Storage>,
    num_blocks: usize,
}

#[derive(Debug)]
pub struct BlockPools {
    primary: Pool,
    secondary: Option<Pool>,
    stream: Arc<dyn CopyStream>,
    block_bytes: usize,
}

impl BlockPools {
    /// Allocate both tiers. `block_bytes` is the full per-block footprint
    /// (all layers, K and V planes).
    pub fn allocate(
        block_bytes: usize,
        num_primary: usize,
        num_secondary: usize,
        primary_allocator: &dyn StorageAllocator,
        secondary_allocator: &dyn StorageAllocator,
        stream: Arc<dyn CopyStream>,
        use_uvm: bool,
    ) -> StorageResult<Self> {
        if block_bytes == 0 || num_primary == 0 {
            return Err(StorageError::InvalidConfig(
                "pools need a non-zero primary block count and block size".to_string(),
            ));
        }

        tracing::debug!(
            block_bytes,
            num_primary,
            num_secondary,
            "allocating kv cache pools"
        );

        let primary = Pool {
            storage: primary_allocator.allocate(num_primary * block_bytes, use_uvm)?,
            num_blocks: num_primary,
        };
        let secondary = if num_secondary > 0 {
            Some(Pool {
                storage: secondary_allocator.allocate(num_secondary * block_bytes, use_uvm)?,
                num_blocks: num_secondary,
            })
        } else {
            None
        };

        Ok(Self {
            primary,
            secondary,
            stream,
            block_bytes,
        })
    }

    pub fn block_bytes(&self) -> usize {
        self.block_bytes
    }

    pub fn num_primary_blocks(&self) -> usize {
        self.primary.num_blocks
    }

    pub fn num_secondary_blocks(&self) -> usize {
        self.secondary.as_ref().map(|p| p.num_blocks).unwrap_or(0)
    }

    /// Base addresses of the primary and secondary pools, for kernel export.
    pub fn base_addrs(&self) -> (u64, Option<u64>) {
        (
            self.primary.storage.addr(),
            self.secondary.as_ref().map(|p| p.storage.addr()),
        )
    }

    fn byte_offset(&self, index: KvCacheIndex) -> StorageResult<usize> {
        let num_blocks = if index.is_primary() {
            self.primary.num_blocks
        } else {
            self.num_secondary_blocks()
        };
        let slot = index.slot() as usize;
        if slot >= num_blocks {
            return Err(StorageError::CopyFailed(format!(
                "slot {slot} out of bounds for pool of {num_blocks} blocks"
            )));
        }
        Ok(slot * self.block_bytes)
    }

    /// Enqueue a whole-block copy between tiers on the configured stream.
    pub fn copy_slot(&mut self, src: KvCacheIndex, dst: KvCacheIndex) -> StorageResult<()> {
        if src.is_primary() == dst.is_primary() {
            return Err(StorageError::CopyFailed(
                "offload copies move between tiers".to_string(),
            ));
        }

        let len = self.block_bytes;
        let src_off = self.byte_offset(src)?;
        let dst_off = self.byte_offset(dst)?;

        let stream = self.stream.clone();
        let secondary = self
            .secondary
            .as_mut()
            .ok_or_else(|| StorageError::InvalidConfig("no secondary pool".to_string()))?;

        let (dst_storage, src_storage): (&mut dyn Storage, &dyn Storage) = if dst.is_primary() {
            (self.primary.storage.as_mut(), secondary.storage.as_ref())
        } else {
            (secondary.storage.as_mut(), self.primary.storage.as_ref())
        };

        stream.copy(dst_storage, dst_off, src_storage, src_off, len)
    }
}
