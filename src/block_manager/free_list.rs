// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Free-block queues.
//!
//! One FIFO per pool tier, holding the currently-unreferenced blocks in
//! reuse-priority order. The list is doubly-linked through the per-block
//! `prev_free`/`next_free` fields in the arena, which makes push, pop and
//! mid-queue detach all O(1) without any node allocation.
//!
//! Ordering convention: fresh (unkeyed) blocks are pushed to the front and
//! handed out first; completed blocks released with reuse potential go to
//! the back so they survive the longest before eviction.

use super::block::{BlockArena, BlockId};
use super::KvCacheError;

#[derive(Debug, Default)]
pub struct FreeBlockQueue {
    head: Option<BlockId>,
    tail: Option<BlockId>,
    len: usize,
}

impl FreeBlockQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check_not_listed(&self, arena: &BlockArena, id: BlockId) -> Result<(), KvCacheError> {
        if arena.block(id).in_free_list() {
            return Err(KvCacheError::InvariantViolation(format!(
                "block {id} is already in a free list"
            )));
        }
        Ok(())
    }

    pub fn push_front(&mut self, arena: &mut BlockArena, id: BlockId) -> Result<(), KvCacheError> {
        self.check_not_listed(arena, id)?;

        let old_head = self.head;
        {
            let block = arena.block_mut(id);
            block.prev_free = None;
            block.next_free = old_head;
            block.in_free_list = true;
        }
        match old_head {
            Some(head) => arena.block_mut(head).prev_free = Some(id),
            None => self.tail = Some(id),
        }
        self.head = Some(id);
        self.len += 1;
        Ok(())
    }

    pub fn push_back(&mut self, arena: &mut BlockArena, id: BlockId) -> Result<(), KvCacheError> {
        self.check_not_listed(arena, id)?;

        let old_tail = self.tail;
        {
            let block = arena.block_mut(id);
            block.prev_free = old_tail;
            block.next_free = None;
            block.in_free_list = true;
        }
        match old_tail {
            Some(tail) => arena.block_mut(tail).next_free = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;
        Ok(())
    }

    pub fn pop_front(&mut self, arena: &mut BlockArena) -> Option<BlockId> {
        let id = self.head?;
        self.detach(arena, id)
            .expect("queue head must carry a valid free-list cursor");
        Some(id)
    }

    /// Remove `id` from anywhere in the queue. A stale or missing cursor is
    /// a double-claim bug.
    pub fn detach(&mut self, arena: &mut BlockArena, id: BlockId) -> Result<(), KvCacheError> {
        if !arena.block(id).in_free_list() {
            return Err(KvCacheError::InvariantViolation(format!(
                "block {id} is not in a free list"
            )));
        }

        let (prev, next) = {
            let block = arena.block_mut(id);
            let links = (block.prev_free, block.next_free);
            block.prev_free = None;
            block.next_free = None;
            block.in_free_list = false;
            links
        };

        match prev {
            Some(prev) => arena.block_mut(prev).next_free = next,
            None => self.head = next,
        }
        match next {
            Some(next) => arena.block_mut(next).prev_free = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
        Ok(())
    }

    /// Front-to-back walk, front first (next eviction candidate first).
    pub fn iter<'a>(&'a self, arena: &'a BlockArena) -> FreeListIter<'a> {
        FreeListIter {
            arena,
            cur: self.head,
        }
    }
}

pub struct FreeListIter<'a> {
    arena: &'a BlockArena,
    cur: Option<BlockId>,
}

impl Iterator for FreeListIter<'_> {
    type Item = BlockId;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cur?;
        self.cur = self.arena.block(id).next_free;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_ids(queue: &FreeBlockQueue, arena: &BlockArena) -> Vec<BlockId> {
        queue.iter(arena).collect()
    }

    #[test]
    fn test_fifo_order() {
        let mut arena = BlockArena::new(4, 0);
        let mut queue = FreeBlockQueue::new();

        for id in 0..4 {
            queue.push_back(&mut arena, id).unwrap();
        }
        assert_eq!(queue.len(), 4);
        assert_eq!(queue_ids(&queue, &arena), vec![0, 1, 2, 3]);

        assert_eq!(queue.pop_front(&mut arena), Some(0));
        assert_eq!(queue.pop_front(&mut arena), Some(1));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_front_takes_priority() {
        let mut arena = BlockArena::new(4, 0);
        let mut queue = FreeBlockQueue::new();

        queue.push_back(&mut arena, 0).unwrap();
        queue.push_back(&mut arena, 1).unwrap();
        queue.push_front(&mut arena, 2).unwrap();

        assert_eq!(queue_ids(&queue, &arena), vec![2, 0, 1]);
        assert_eq!(queue.pop_front(&mut arena), Some(2));
    }

    #[test]
    fn test_detach_middle() {
        let mut arena = BlockArena::new(4, 0);
        let mut queue = FreeBlockQueue::new();

        for id in 0..4 {
            queue.push_back(&mut arena, id).unwrap();
        }
        queue.detach(&mut arena, 2).unwrap();
        assert_eq!(queue_ids(&queue, &arena), vec![0, 1, 3]);
        assert!(!arena.block(2).in_free_list());

        queue.detach(&mut arena, 0).unwrap();
        queue.detach(&mut arena, 3).unwrap();
        assert_eq!(queue_ids(&queue, &arena), vec![1]);

        queue.detach(&mut arena, 1).unwrap();
        assert!(queue.is_empty());
        assert_eq!(queue.pop_front(&mut arena), None);
    }

    #[test]
    fn test_double_insert_and_stale_detach_rejected() {
        let mut arena = BlockArena::new(2, 0);
        let mut queue = FreeBlockQueue::new();

        queue.push_back(&mut arena, 0).unwrap();
        assert!(queue.push_back(&mut arena, 0).is_err());
        assert!(queue.push_front(&mut arena, 0).is_err());

        assert!(queue.detach(&mut arena, 1).is_err());
    }
}
