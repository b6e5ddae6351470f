// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Block metadata and the block arena.
//!
//! A [`KvCacheBlock`] is pure metadata: identity, pool residency, reference
//! counts, reuse-trie links and free-list threading. The [`BlockArena`] owns
//! every block (indexed by [`BlockId`]); the trie, the free lists and the
//! sequence records all refer to blocks by id, so there is no shared or
//! cyclic ownership anywhere in the manager.
//!
//! The reuse trie is threaded through the blocks themselves: `prev` points
//! at the parent, `next` maps a child's [`BlockKey`] to its id. A sentinel
//! root block (no key, no storage slot) lives at the last arena index.

use std::collections::HashMap;

use crate::tokens::BlockKey;

use super::KvCacheError;

/// Dense block identity, stable across pool moves.
pub type BlockId = usize;

/// Compact pool slot reference: the high bit selects the tier (set =
/// secondary), the low 31 bits are the slot index within that tier.
///
/// Kernels consume these directly, so the encoding is part of the export
/// surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KvCacheIndex(u32);

impl KvCacheIndex {
    const SECONDARY_FLAG: u32 = 1 << 31;

    pub fn primary(slot: u32) -> Self {
        debug_assert_eq!(slot & Self::SECONDARY_FLAG, 0);
        Self(slot)
    }

    pub fn secondary(slot: u32) -> Self {
        debug_assert_eq!(slot & Self::SECONDARY_FLAG, 0);
        Self(slot | Self::SECONDARY_FLAG)
    }

    pub fn is_primary(&self) -> bool {
        self.0 & Self::SECONDARY_FLAG == 0
    }

    /// Slot index within the selected pool.
    pub fn slot(&self) -> u32 {
        self.0 & !Self::SECONDARY_FLAG
    }

    /// Index of the K (`field = 0`) or V (`field = 1`) plane of this slot
    /// inside a pool of shape `[n_blocks, 2, ...]`.
    pub fn plane(&self, field: u32) -> KvCacheIndex {
        debug_assert!(field < 2);
        Self((self.0 & Self::SECONDARY_FLAG) | (self.slot() * 2 + field))
    }

    /// Raw value as exported to kernels.
    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl Default for KvCacheIndex {
    fn default() -> Self {
        Self::primary(0)
    }
}

/// Metadata record for one fixed-size KV slot.
#[derive(Debug)]
pub struct KvCacheBlock {
    block_id: BlockId,
    pool_index: KvCacheIndex,
    ref_count: u32,
    scheduling_ref_count: u32,
    /// Set once the block was filled with a whole block of tokens and filed
    /// under `block_key` in its parent's children map.
    is_full: bool,
    block_key: BlockKey,
    /// Parent in the reuse trie. Never owning; the arena owns all blocks.
    prev: Option<BlockId>,
    /// Children in the reuse trie, keyed by the tokens they were filled with.
    next: HashMap<BlockKey, BlockId>,

    // Free-list threading; maintained by `FreeBlockQueue`.
    pub(super) prev_free: Option<BlockId>,
    pub(super) next_free: Option<BlockId>,
    pub(super) in_free_list: bool,
}

impl KvCacheBlock {
    fn new(block_id: BlockId, pool_index: KvCacheIndex) -> Self {
        Self {
            block_id,
            pool_index,
            ref_count: 0,
            scheduling_ref_count: 0,
            is_full: false,
            block_key: BlockKey::new(0, Vec::new()),
            prev: None,
            next: HashMap::new(),
            prev_free: None,
            next_free: None,
            in_free_list: false,
        }
    }

    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    pub fn pool_index(&self) -> KvCacheIndex {
        self.pool_index
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn scheduling_ref_count(&self) -> u32 {
        self.scheduling_ref_count
    }

    pub fn is_full(&self) -> bool {
        self.is_full
    }

    pub fn block_key(&self) -> &BlockKey {
        &self.block_key
    }

    pub fn prev(&self) -> Option<BlockId> {
        self.prev
    }

    pub fn has_children(&self) -> bool {
        !self.next.is_empty()
    }

    pub fn num_children(&self) -> usize {
        self.next.len()
    }

    pub fn in_free_list(&self) -> bool {
        self.in_free_list
    }

    pub fn has_refs(&self) -> bool {
        self.ref_count > 0
    }

    /// A block referenced from more than one (beam, position) is shared.
    pub fn is_shared(&self) -> bool {
        self.ref_count > 1
    }

    pub(super) fn inc_ref(&mut self) -> u32 {
        self.ref_count += 1;
        self.ref_count
    }

    pub(super) fn dec_ref(&mut self) -> Result<u32, KvCacheError> {
        if self.ref_count == 0 {
            return Err(KvCacheError::InvariantViolation(format!(
                "ref count underflow on block {}",
                self.block_id
            )));
        }
        self.ref_count -= 1;
        Ok(self.ref_count)
    }

    pub(super) fn start_scheduling(&mut self) {
        self.scheduling_ref_count = self.ref_count;
    }

    pub(super) fn dec_scheduling_ref(&mut self) -> Result<u32, KvCacheError> {
        if self.scheduling_ref_count == 0 {
            return Err(KvCacheError::InvariantViolation(format!(
                "scheduling ref count underflow on block {}",
                self.block_id
            )));
        }
        self.scheduling_ref_count -= 1;
        Ok(self.scheduling_ref_count)
    }
}

/// Owner of all block metadata, including the trie's sentinel root.
#[derive(Debug)]
pub struct BlockArena {
    blocks: Vec<KvCacheBlock>,
    root: BlockId,
}

impl BlockArena {
    /// Build an arena of `num_primary + num_secondary` blocks plus the
    /// sentinel root. Primary slots come first so `block_id` doubles as the
    /// primary slot index for fresh pools.
    pub fn new(num_primary: u32, num_secondary: u32) -> Self {
        let total = (num_primary + num_secondary) as usize;
        let mut blocks = Vec::with_capacity(total + 1);
        for slot in 0..num_primary {
            blocks.push(KvCacheBlock::new(slot as BlockId, KvCacheIndex::primary(slot)));
        }
        for slot in 0..num_secondary {
            blocks.push(KvCacheBlock::new(
                (num_primary + slot) as BlockId,
                KvCacheIndex::secondary(slot),
            ));
        }
        // Sentinel root; its pool index is never read.
        blocks.push(KvCacheBlock::new(total, KvCacheIndex::primary(0)));

        Self {
            blocks,
            root: total,
        }
    }

    pub fn root(&self) -> BlockId {
        self.root
    }

    /// Number of real blocks, excluding the sentinel root.
    pub fn num_blocks(&self) -> usize {
        self.root
    }

    pub fn block(&self, id: BlockId) -> &KvCacheBlock {
        &self.blocks[id]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut KvCacheBlock {
        &mut self.blocks[id]
    }

    pub fn iter(&self) -> impl Iterator<Item = &KvCacheBlock> {
        self.blocks[..self.root].iter()
    }

    pub(super) fn iter_mut(&mut self) -> impl Iterator<Item = &mut KvCacheBlock> {
        let root = self.root;
        self.blocks[..root].iter_mut()
    }

    /// Look up the child of `parent` filed under `key`.
    pub fn find_matching(&self, parent: BlockId, key: &BlockKey) -> Option<BlockId> {
        self.blocks[parent].next.get(key).copied()
    }

    /// A block is in the trie iff it hangs off a parent.
    pub fn is_linked(&self, id: BlockId) -> bool {
        self.blocks[id].prev.is_some()
    }

    /// File `child` under `parent` with `key`, marking it full.
    pub fn link_child(
        &mut self,
        parent: BlockId,
        key: BlockKey,
        child: BlockId,
    ) -> Result<(), KvCacheError> {
        if self.blocks[child].prev.is_some() {
            return Err(KvCacheError::InvariantViolation(format!(
                "block {child} is already linked in the reuse trie"
            )));
        }
        if self.blocks[parent].next.contains_key(&key) {
            return Err(KvCacheError::InvariantViolation(format!(
                "parent {parent} already has a child under this key"
            )));
        }

        let block = &mut self.blocks[child];
        block.prev = Some(parent);
        block.block_key = key.clone();
        block.is_full = true;
        self.blocks[parent].next.insert(key, child);
        Ok(())
    }

    /// Detach `id` from its parent, clearing its key. Children are kept:
    /// a block claimed for reuse still spells valid deeper prefixes, and
    /// rejoins the trie with its subtree when it is stored again.
    pub fn unlink_from_parent(&mut self, id: BlockId) -> Result<(), KvCacheError> {
        let Some(parent) = self.blocks[id].prev else {
            return Ok(());
        };

        let key = std::mem::replace(&mut self.blocks[id].block_key, BlockKey::new(0, Vec::new()));
        match self.blocks[parent].next.remove(&key) {
            Some(linked) if linked == id => {}
            _ => {
                return Err(KvCacheError::InvariantViolation(format!(
                    "trie key mismatch unlinking block {id} from parent {parent}"
                )));
            }
        }

        let block = &mut self.blocks[id];
        block.prev = None;
        block.is_full = false;
        Ok(())
    }

    /// Ids of `start` plus all its keyed descendants.
    pub fn keyed_subtree_ids(&self, start: BlockId) -> Vec<BlockId> {
        let mut ids = Vec::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            if self.blocks[id].is_full {
                ids.push(id);
            }
            stack.extend(self.blocks[id].next.values().copied());
        }
        ids
    }

    /// Evict a whole subtree from the trie: detach `start` from its parent
    /// and unkey every block below it. The blocks revert to fresh state but
    /// keep their free-list positions.
    pub fn sever_subtree(&mut self, start: BlockId) -> Result<(), KvCacheError> {
        self.unlink_from_parent(start)?;

        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            let block = &mut self.blocks[id];
            stack.extend(block.next.values().copied());
            block.next.clear();
            block.prev = None;
            block.is_full = false;
            block.block_key = BlockKey::new(0, Vec::new());
        }
        Ok(())
    }

    /// True if any block below `id` (excluding `id` itself) resides in
    /// primary memory.
    pub fn has_primary_descendant(&self, id: BlockId) -> bool {
        let mut stack: Vec<BlockId> = self.blocks[id].next.values().copied().collect();
        while let Some(child) = stack.pop() {
            if self.blocks[child].pool_index.is_primary() {
                return true;
            }
            stack.extend(self.blocks[child].next.values().copied());
        }
        false
    }

    /// Descend from `start` into an arbitrary child until a childless block
    /// is reached. Evicting such a block never orphans other reusable
    /// blocks.
    pub fn find_leaf(&self, start: BlockId) -> BlockId {
        let mut id = start;
        while let Some(&child) = self.blocks[id].next.values().next() {
            id = child;
        }
        id
    }

    /// Swap pool residency of two blocks; identities are untouched.
    pub fn swap_pool_index(&mut self, a: BlockId, b: BlockId) {
        let index_a = self.blocks[a].pool_index;
        self.blocks[a].pool_index = std::mem::replace(&mut self.blocks[b].pool_index, index_a);
    }

    /// Depth of `id` below the root; used by invariant checks.
    pub fn trie_depth(&self, id: BlockId) -> Option<usize> {
        let mut depth = 0;
        let mut cur = id;
        while let Some(parent) = self.blocks[cur].prev {
            depth += 1;
            if depth > self.num_blocks() {
                return None;
            }
            cur = parent;
        }
        (cur == self.root).then_some(depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::unique_tokens;

    fn key(tokens: &[u32]) -> BlockKey {
        BlockKey::new(0, unique_tokens(tokens))
    }

    #[test]
    fn test_kv_cache_index_encoding() {
        let p = KvCacheIndex::primary(5);
        assert!(p.is_primary());
        assert_eq!(p.slot(), 5);
        assert_eq!(p.raw(), 5);

        let s = KvCacheIndex::secondary(5);
        assert!(!s.is_primary());
        assert_eq!(s.slot(), 5);
        assert_ne!(s.raw(), p.raw());

        // K/V planes interleave within the pool
        assert_eq!(p.plane(0).raw(), 10);
        assert_eq!(p.plane(1).raw(), 11);
        assert_eq!(s.plane(1).slot(), 11);
        assert!(!s.plane(1).is_primary());
    }

    #[test]
    fn test_arena_layout() {
        let arena = BlockArena::new(4, 2);
        assert_eq!(arena.num_blocks(), 6);
        assert_eq!(arena.root(), 6);

        for id in 0..4 {
            assert!(arena.block(id).pool_index().is_primary());
            assert_eq!(arena.block(id).pool_index().slot(), id as u32);
        }
        for id in 4..6 {
            assert!(!arena.block(id).pool_index().is_primary());
            assert_eq!(arena.block(id).pool_index().slot(), (id - 4) as u32);
        }
    }

    #[test]
    fn test_link_and_unlink() {
        let mut arena = BlockArena::new(4, 0);
        let root = arena.root();

        arena.link_child(root, key(&[1, 2]), 0).unwrap();
        arena.link_child(0, key(&[3, 4]), 1).unwrap();

        assert!(arena.block(0).is_full());
        assert_eq!(arena.find_matching(root, &key(&[1, 2])), Some(0));
        assert_eq!(arena.find_matching(0, &key(&[3, 4])), Some(1));
        assert_eq!(arena.trie_depth(1), Some(2));

        // double-link and key collision are bugs
        assert!(arena.link_child(root, key(&[9, 9]), 0).is_err());
        assert!(arena.link_child(root, key(&[1, 2]), 2).is_err());

        // detach the parent; the child subtree stays attached to it
        arena.unlink_from_parent(0).unwrap();
        assert!(!arena.block(0).is_full());
        assert!(arena.find_matching(root, &key(&[1, 2])).is_none());
        assert_eq!(arena.find_matching(0, &key(&[3, 4])), Some(1));
        assert_eq!(arena.trie_depth(1), None, "orphaned until re-stored");
    }

    #[test]
    fn test_sever_subtree() {
        let mut arena = BlockArena::new(4, 0);
        let root = arena.root();

        arena.link_child(root, key(&[1]), 0).unwrap();
        arena.link_child(0, key(&[2]), 1).unwrap();
        arena.link_child(1, key(&[3]), 2).unwrap();

        let keyed = arena.keyed_subtree_ids(0);
        assert_eq!(keyed.len(), 3);

        arena.sever_subtree(0).unwrap();
        for id in 0..3 {
            assert!(!arena.block(id).is_full());
            assert!(arena.block(id).prev().is_none());
            assert!(!arena.block(id).has_children());
        }
        assert!(arena.find_matching(root, &key(&[1])).is_none());
    }

    #[test]
    fn test_primary_descendants_and_leaves() {
        let mut arena = BlockArena::new(2, 2);
        let root = arena.root();

        // primary 0 -> secondary 2 -> primary 1
        arena.link_child(root, key(&[1]), 0).unwrap();
        arena.link_child(0, key(&[2]), 2).unwrap();
        arena.link_child(2, key(&[3]), 1).unwrap();

        assert!(arena.has_primary_descendant(0));
        assert!(arena.has_primary_descendant(2));
        assert!(!arena.has_primary_descendant(1));
        assert_eq!(arena.find_leaf(root), 1);

        arena.unlink_from_parent(1).unwrap();
        assert!(!arena.has_primary_descendant(0), "only secondary left below");
    }

    #[test]
    fn test_ref_count_underflow_detected() {
        let mut arena = BlockArena::new(1, 0);
        arena.block_mut(0).inc_ref();
        assert_eq!(arena.block_mut(0).dec_ref().unwrap(), 0);
        assert!(arena.block_mut(0).dec_ref().is_err());
    }
}
