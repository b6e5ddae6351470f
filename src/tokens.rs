// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Tokens and block keys.
//!
//! A completed cache block is content-addressed by a [`BlockKey`]: the LoRA
//! task id the sequence runs under plus the `tokens_per_block` unique tokens
//! the block was filled with. A [`UniqueToken`] pairs the token id with an
//! `extra_id` that disambiguates otherwise-identical ids (prompt-tuning
//! slots and similar); plain text tokens carry `extra_id = 0`.
//!
//! Key equality is structural. The seeded content hash is only used for
//! event payloads and external indexing, never for key identity, so xxh3
//! collision resistance is sufficient.

use bytemuck::cast_slice;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64_with_seed;

/// A token is a 32-bit unsigned integer.
pub type Token = u32;

/// Disambiguates tokens whose ids collide (e.g. prompt-tuning virtual tokens).
pub type TokenExtraId = u64;

/// Identifies the LoRA adapter a sequence runs under; `0` means no adapter.
pub type LoraTaskId = u64;

/// Seeded content hash of a block key.
pub type KeyHash = u64;

/// Default seed for [`BlockKey::content_hash`].
pub const DEFAULT_HASH_SEED: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UniqueToken {
    pub token_id: Token,
    pub extra_id: TokenExtraId,
}

impl UniqueToken {
    pub fn new(token_id: Token, extra_id: TokenExtraId) -> Self {
        Self { token_id, extra_id }
    }
}

impl From<Token> for UniqueToken {
    fn from(token_id: Token) -> Self {
        Self {
            token_id,
            extra_id: 0,
        }
    }
}

/// Convert plain token ids into unique tokens with `extra_id = 0`.
pub fn unique_tokens(tokens: &[Token]) -> Vec<UniqueToken> {
    tokens.iter().copied().map(UniqueToken::from).collect()
}

/// Identity of a completed block for reuse purposes.
///
/// Two blocks with equal keys hold the KV entries of identical token runs
/// under the same LoRA adapter, so either can stand in for the other.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockKey {
    lora_task_id: LoraTaskId,
    unique_tokens: Vec<UniqueToken>,
}

impl BlockKey {
    pub fn new(lora_task_id: LoraTaskId, unique_tokens: Vec<UniqueToken>) -> Self {
        Self {
            lora_task_id,
            unique_tokens,
        }
    }

    pub fn lora_task_id(&self) -> LoraTaskId {
        self.lora_task_id
    }

    pub fn unique_tokens(&self) -> &[UniqueToken] {
        &self.unique_tokens
    }

    pub fn len(&self) -> usize {
        self.unique_tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unique_tokens.is_empty()
    }

    /// Seeded content hash combining the task id and every token pair.
    pub fn content_hash(&self, seed: u64) -> KeyHash {
        let mut words = Vec::with_capacity(1 + 2 * self.unique_tokens.len());
        words.push(self.lora_task_id);
        for token in &self.unique_tokens {
            words.push(token.token_id as u64);
            words.push(token.extra_id);
        }
        xxh3_64_with_seed(cast_slice(&words), seed)
    }
}

/// Chop the leading `usable_len` tokens of a prompt into full-block keys.
///
/// Only whole blocks are keyed; the trailing partial block (if any) is
/// dropped. Long prompts are hashed per-chunk in parallel.
pub fn build_block_keys(
    lora_task_id: LoraTaskId,
    tokens: &[UniqueToken],
    usable_len: usize,
    tokens_per_block: usize,
) -> Vec<BlockKey> {
    let usable = usable_len.min(tokens.len());
    tokens[..usable]
        .par_chunks_exact(tokens_per_block)
        .map(|chunk| BlockKey::new(lora_task_id, chunk.to_vec()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_block_keys_counts() {
        let tokens = unique_tokens(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);

        // all ten tokens usable: two full blocks, partial dropped
        let keys = build_block_keys(0, &tokens, 10, 4);
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].unique_tokens(), &tokens[0..4]);
        assert_eq!(keys[1].unique_tokens(), &tokens[4..8]);

        // usable_len excludes the last token: still two full blocks
        let keys = build_block_keys(0, &tokens, 9, 4);
        assert_eq!(keys.len(), 2);

        // a single block's worth with one token reserved yields no keys
        let keys = build_block_keys(0, &tokens[..4], 3, 4);
        assert!(keys.is_empty());

        // usable_len longer than the prompt is clamped
        let keys = build_block_keys(0, &tokens, 64, 4);
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn test_key_equality_is_structural() {
        let a = BlockKey::new(0, unique_tokens(&[1, 2, 3, 4]));
        let b = BlockKey::new(0, unique_tokens(&[1, 2, 3, 4]));
        let c = BlockKey::new(1, unique_tokens(&[1, 2, 3, 4]));
        let d = BlockKey::new(
            0,
            vec![
                UniqueToken::new(1, 7),
                UniqueToken::from(2),
                UniqueToken::from(3),
                UniqueToken::from(4),
            ],
        );

        assert_eq!(a, b);
        assert_ne!(a, c, "lora task id is part of the key");
        assert_ne!(a, d, "extra ids are part of the key");
    }

    #[test]
    fn test_content_hash_stability() {
        let a = BlockKey::new(0, unique_tokens(&[1, 2, 3, 4]));
        let b = BlockKey::new(0, unique_tokens(&[1, 2, 3, 4]));

        assert_eq!(a.content_hash(0), b.content_hash(0));
        assert_ne!(a.content_hash(0), a.content_hash(1337));

        let c = BlockKey::new(0, unique_tokens(&[1, 2, 3, 5]));
        assert_ne!(a.content_hash(0), c.content_hash(0));

        let d = BlockKey::new(9, unique_tokens(&[1, 2, 3, 4]));
        assert_ne!(a.content_hash(0), d.content_hash(0));
    }
}
