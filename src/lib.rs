// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Paged KV-cache block manager for LLM inference.
//!
//! The KV cache of a transformer decoder is carved into fixed-size blocks,
//! each holding the key/value entries of `tokens_per_block` consecutive
//! tokens of one sequence. This crate manages the lifecycle of those blocks:
//!
//! - a flat **arena** of block metadata backed by one or two storage pools
//!   (fast *primary* memory, and optionally a slower *secondary* tier used
//!   for offloading),
//! - **free lists** that keep unreferenced blocks in reuse-priority order,
//! - a **reuse trie** that content-addresses completed blocks by their
//!   (LoRA task id, token-prefix) key so sequences sharing a prompt prefix
//!   can skip recomputation,
//! - per-sequence bookkeeping with beam sharing, a cyclic attention-window
//!   policy with pinned sink tokens, and what-if scheduling counters.
//!
//! [`kv_cache_manager::KvCacheManager`] is the public façade; it owns a
//! [`block_manager::BlockManager`] plus the sequence table and exposes the
//! per-sequence operations and block-offset export the attention kernels
//! consume.

pub mod block_manager;
pub mod common;
pub mod kv_cache_manager;
pub mod logging;
pub mod request;
pub mod tokens;

pub use block_manager::{BlockManager, CacheType, KvCacheError, Result};
pub use common::dtype::DType;
pub use kv_cache_manager::{KvCacheManager, KvCacheManagerConfig, KvCacheStats};
pub use request::CacheRequest;
pub use tokens::{BlockKey, LoraTaskId, Token, UniqueToken};

use parking_lot::Mutex;
use std::sync::Arc;

/// The manager is single-threaded over its own state; when several engine
/// threads need access, one outer lock is sufficient (no operation blocks
/// while holding it).
pub type SharedKvCacheManager = Arc<Mutex<KvCacheManager>>;
