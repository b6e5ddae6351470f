// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Element types for pool storage.
//!
//! The block manager never touches individual elements; the dtype only
//! determines the byte width of pool slots and is late-bound at
//! `allocate_pools` time.

use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    #[default]
    FP16,
    BF16,
    FP32,
    FP8,
    U8,
    U16,
    U32,
}

impl DType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::FP8 | DType::U8 => 1,
            DType::FP16 | DType::BF16 | DType::U16 => 2,
            DType::FP32 | DType::U32 => 4,
        }
    }
}
