// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The collaborator view of a generation request.
//!
//! The block manager never owns request lifecycle state; it only reads the
//! token material that drives block keying and writes back how much of the
//! prompt was served from cache.

use derive_getters::Getters;

use crate::tokens::{LoraTaskId, Token, UniqueToken};

#[derive(Debug, Clone, Getters)]
pub struct CacheRequest {
    /// LoRA adapter the sequence runs under; part of every block key.
    #[getter(copy)]
    lora_task_id: LoraTaskId,

    /// Prompt plus generated tokens so far. Grows as the caller decodes.
    unique_tokens: Vec<UniqueToken>,

    /// Prompt length at admission; the boundary between context and
    /// generation tokens.
    #[getter(copy)]
    prompt_len: usize,

    #[getter(copy)]
    beam_width: usize,

    #[getter(copy)]
    streaming: bool,

    #[getter(copy)]
    max_new_tokens: usize,

    /// Sequence slot once scheduled, if any.
    #[getter(copy)]
    slot: Option<usize>,

    /// Number of leading prompt tokens covered by reused cache blocks.
    /// Written by the manager during `add_sequence`.
    #[getter(copy)]
    prepopulated_prompt_len: usize,
}

impl CacheRequest {
    pub fn new(unique_tokens: Vec<UniqueToken>, lora_task_id: LoraTaskId) -> Self {
        let prompt_len = unique_tokens.len();
        Self {
            lora_task_id,
            unique_tokens,
            prompt_len,
            beam_width: 1,
            streaming: false,
            max_new_tokens: 0,
            slot: None,
            prepopulated_prompt_len: 0,
        }
    }

    /// Build a request from plain token ids (`extra_id = 0`).
    pub fn from_tokens(tokens: &[Token], lora_task_id: LoraTaskId) -> Self {
        Self::new(crate::tokens::unique_tokens(tokens), lora_task_id)
    }

    pub fn with_beam_width(mut self, beam_width: usize) -> Self {
        self.beam_width = beam_width;
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    /// Append a generated token (plain id, no extra id).
    pub fn add_token(&mut self, token: Token) {
        self.unique_tokens.push(UniqueToken::from(token));
    }

    pub fn num_tokens(&self) -> usize {
        self.unique_tokens.len()
    }

    pub fn set_slot(&mut self, slot: Option<usize>) {
        self.slot = slot;
    }

    pub(crate) fn set_prepopulated_prompt_len(&mut self, len: usize) {
        self.prepopulated_prompt_len = len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_growth() {
        let mut req = CacheRequest::from_tokens(&[1, 2, 3], 0).with_max_new_tokens(8);
        assert_eq!(req.prompt_len(), 3);
        assert_eq!(req.num_tokens(), 3);

        req.add_token(4);
        req.add_token(5);
        assert_eq!(req.num_tokens(), 5);
        assert_eq!(req.prompt_len(), 3, "prompt length is fixed at admission");
        assert_eq!(req.unique_tokens()[3], UniqueToken::new(4, 0));
    }
}
