// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging initialization.
//!
//! Filters are read from the `PAGED_KV_LOG` environment variable using the
//! usual `tracing` directive syntax (e.g. `paged_kv=debug`); the default
//! level is `info`.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// ENV used to set the log level
const FILTER_ENV: &str = "PAGED_KV_LOG";

/// Default log level
const DEFAULT_FILTER_LEVEL: &str = "info";

/// Once instance to ensure the subscriber is only installed once
static INIT: Once = Once::new();

/// Install the global tracing subscriber. Safe to call repeatedly; only the
/// first call has an effect. Intended for binaries and tests — libraries
/// embedding this crate will usually install their own subscriber.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(FILTER_ENV)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER_LEVEL));

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    });
}
