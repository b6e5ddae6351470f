// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Reuse-cache event notifications.
//!
//! The manager announces state changes of the reuse trie so external
//! indexers (e.g. a prefix-aware router) can track which prefixes this
//! worker can serve from cache:
//!
//! - `Stored`: a completed block was filed into the trie and is reusable
//!   from now on. Carries the content hash of its key and of its parent's
//!   key so receivers can rebuild the prefix chain.
//! - `Removed`: a keyed block was evicted or claimed exclusively and is no
//!   longer reusable.
//!
//! Emission is best-effort: a full or closed channel never fails a manager
//! operation.

use std::fmt::Debug;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::tokens::KeyHash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheEvent {
    Stored {
        hash: KeyHash,
        parent_hash: Option<KeyHash>,
    },
    Removed {
        hash: KeyHash,
    },
}

pub trait EventManager: Debug + Send + Sync {
    fn block_stored(&self, hash: KeyHash, parent_hash: Option<KeyHash>);
    fn block_removed(&self, hash: KeyHash);
}

/// Swallows all events; the default when no external indexer is attached.
#[derive(Debug, Default)]
pub struct NullEventManager;

impl NullEventManager {
    pub fn new() -> Arc<dyn EventManager> {
        Arc::new(Self)
    }
}

impl EventManager for NullEventManager {
    fn block_stored(&self, _hash: KeyHash, _parent_hash: Option<KeyHash>) {}
    fn block_removed(&self, _hash: KeyHash) {}
}

/// Forwards events over an unbounded channel to a consumer task.
#[derive(Debug)]
pub struct ChannelEventManager {
    tx: mpsc::UnboundedSender<CacheEvent>,
    cancel: CancellationToken,
}

impl ChannelEventManager {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<CacheEvent>) {
        Self::with_cancellation(CancellationToken::new())
    }

    /// Stops emitting once `cancel` is cancelled; the receiver drains
    /// whatever was already queued.
    pub fn with_cancellation(
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<CacheEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx, cancel }), rx)
    }

    fn send(&self, event: CacheEvent) {
        if self.cancel.is_cancelled() {
            return;
        }
        if self.tx.send(event).is_err() {
            tracing::trace!("cache event receiver dropped; event discarded");
        }
    }
}

impl EventManager for ChannelEventManager {
    fn block_stored(&self, hash: KeyHash, parent_hash: Option<KeyHash>) {
        self.send(CacheEvent::Stored { hash, parent_hash });
    }

    fn block_removed(&self, hash: KeyHash) {
        self.send(CacheEvent::Removed { hash });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_event_manager_delivery() {
        let (manager, mut rx) = ChannelEventManager::new();

        manager.block_stored(42, None);
        manager.block_stored(43, Some(42));
        manager.block_removed(42);

        assert_eq!(
            rx.recv().await,
            Some(CacheEvent::Stored {
                hash: 42,
                parent_hash: None
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(CacheEvent::Stored {
                hash: 43,
                parent_hash: Some(42)
            })
        );
        assert_eq!(rx.recv().await, Some(CacheEvent::Removed { hash: 42 }));
    }

    #[tokio::test]
    async fn test_cancelled_manager_drops_events() {
        let cancel = CancellationToken::new();
        let (manager, mut rx) = ChannelEventManager::with_cancellation(cancel.clone());

        manager.block_stored(1, None);
        cancel.cancel();
        manager.block_stored(2, None);
        drop(manager);

        assert_eq!(
            rx.recv().await,
            Some(CacheEvent::Stored {
                hash: 1,
                parent_hash: None
            })
        );
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn test_null_event_manager_is_silent() {
        let manager = NullEventManager::new();
        manager.block_stored(1, None);
        manager.block_removed(1);
    }
}
