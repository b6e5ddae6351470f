// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Storage backing for block pools.
//!
//! The manager only ever sees pool slots by index; the actual bytes live in
//! a [`Storage`] region allocated through a [`StorageAllocator`] and moved
//! between tiers through a [`CopyStream`]. The host-memory implementations
//! here are complete; a device-memory backend plugs in by implementing the
//! same three traits without touching the manager.

use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    fmt::Debug,
    ptr::NonNull,
};

use thiserror::Error;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage allocation failed: {0}")]
    AllocationFailed(String),

    #[error("storage not accessible: {0}")]
    NotAccessible(String),

    #[error("copy failed: {0}")]
    CopyFailed(String),

    #[error("invalid storage configuration: {0}")]
    InvalidConfig(String),
}

/// Core storage trait that provides access to a flat memory region.
pub trait Storage: Debug + Send + Sync + 'static {
    /// Address of the first byte, for export to kernels.
    fn addr(&self) -> u64;

    /// Total size of the storage in bytes.
    fn size(&self) -> usize;

    /// True if the region can be read/written by the host.
    fn is_host_accessible(&self) -> bool;

    /// Get a raw pointer to the storage.
    ///
    /// # Safety
    /// The caller must ensure:
    /// - The pointer is not used after the storage is dropped
    /// - Access patterns respect the storage's thread safety model
    unsafe fn as_ptr(&self) -> Option<*const u8>;

    /// Get a raw mutable pointer to the storage.
    ///
    /// # Safety
    /// The caller must ensure:
    /// - The pointer is not used after the storage is dropped
    /// - No other references exist while the pointer is in use
    /// - Access patterns respect the storage's thread safety model
    unsafe fn as_mut_ptr(&mut self) -> Option<*mut u8>;
}

/// Plain system memory, zero-initialized.
#[derive(Debug)]
pub struct SystemStorage {
    ptr: NonNull<u8>,
    layout: Layout,
    len: usize,
}

unsafe impl Send for SystemStorage {}
unsafe impl Sync for SystemStorage {}

impl SystemStorage {
    pub fn new(size: usize) -> StorageResult<Self> {
        if size == 0 {
            return Err(StorageError::InvalidConfig(
                "zero-sized storage".to_string(),
            ));
        }

        let layout =
            Layout::array::<u8>(size).map_err(|e| StorageError::AllocationFailed(e.to_string()))?;

        let ptr = unsafe {
            NonNull::new(alloc_zeroed(layout))
                .ok_or_else(|| StorageError::AllocationFailed("memory allocation failed".into()))?
        };

        Ok(Self {
            ptr,
            layout,
            len: size,
        })
    }
}

impl Drop for SystemStorage {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

impl Storage for SystemStorage {
    fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    fn size(&self) -> usize {
        self.len
    }

    fn is_host_accessible(&self) -> bool {
        true
    }

    unsafe fn as_ptr(&self) -> Option<*const u8> {
        Some(self.ptr.as_ptr())
    }

    unsafe fn as_mut_ptr(&mut self) -> Option<*mut u8> {
        Some(self.ptr.as_ptr())
    }
}

/// Host memory earmarked for transfer staging. Backed by the same allocation
/// path as [`SystemStorage`] here; a CUDA backend would pin these pages.
#[derive(Debug)]
pub struct PinnedStorage {
    inner: SystemStorage,
}

impl PinnedStorage {
    pub fn new(size: usize) -> StorageResult<Self> {
        Ok(Self {
            inner: SystemStorage::new(size)?,
        })
    }
}

impl Storage for PinnedStorage {
    fn addr(&self) -> u64 {
        self.inner.addr()
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn is_host_accessible(&self) -> bool {
        true
    }

    unsafe fn as_ptr(&self) -> Option<*const u8> {
        self.inner.as_ptr()
    }

    unsafe fn as_mut_ptr(&mut self) -> Option<*mut u8> {
        self.inner.as_mut_ptr()
    }
}

/// Allocates pool storage of a requested byte size.
///
/// `use_uvm` asks for unified/managed memory where the backend supports it;
/// host allocators ignore it.
pub trait StorageAllocator: Debug + Send + Sync {
    fn allocate(&self, size: usize, use_uvm: bool) -> StorageResult<Box<dyn Storage>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl StorageAllocator for SystemAllocator {
    fn allocate(&self, size: usize, _use_uvm: bool) -> StorageResult<Box<dyn Storage>> {
        Ok(Box::new(SystemStorage::new(size)?))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PinnedAllocator;

impl StorageAllocator for PinnedAllocator {
    fn allocate(&self, size: usize, _use_uvm: bool) -> StorageResult<Box<dyn Storage>> {
        Ok(Box::new(PinnedStorage::new(size)?))
    }
}

/// Copy primitive the manager enqueues offload/onboard transfers on.
///
/// Implementations guarantee stream ordering: a copy enqueued later observes
/// the effects of every copy enqueued earlier on the same stream. The
/// manager treats pool residency as authoritative once `copy` returns.
pub trait CopyStream: Debug + Send + Sync {
    fn copy(
        &self,
        dst: &mut dyn Storage,
        dst_offset: usize,
        src: &dyn Storage,
        src_offset: usize,
        len: usize,
    ) -> StorageResult<()>;
}

/// Synchronous host-to-host copies. Trivially stream-ordered.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemcpyStream;

impl CopyStream for MemcpyStream {
    fn copy(
        &self,
        dst: &mut dyn Storage,
        dst_offset: usize,
        src: &dyn Storage,
        src_offset: usize,
        len: usize,
    ) -> StorageResult<()> {
        if !src.is_host_accessible() || !dst.is_host_accessible() {
            return Err(StorageError::NotAccessible(
                "memcpy stream requires host-accessible storage".to_string(),
            ));
        }
        if src_offset + len > src.size() || dst_offset + len > dst.size() {
            return Err(StorageError::CopyFailed(format!(
                "copy of {} bytes out of bounds (src {}+{}, dst {}+{})",
                len,
                src_offset,
                src.size(),
                dst_offset,
                dst.size()
            )));
        }

        unsafe {
            let src_ptr = src
                .as_ptr()
                .ok_or_else(|| StorageError::NotAccessible("source pointer".to_string()))?;
            let dst_ptr = dst
                .as_mut_ptr()
                .ok_or_else(|| StorageError::NotAccessible("destination pointer".to_string()))?;
            std::ptr::copy_nonoverlapping(src_ptr.add(src_offset), dst_ptr.add(dst_offset), len);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_storage_zeroed() {
        let storage = SystemStorage::new(64).unwrap();
        assert_eq!(storage.size(), 64);
        assert!(storage.is_host_accessible());

        let bytes = unsafe { std::slice::from_raw_parts(storage.as_ptr().unwrap(), 64) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_zero_sized_storage_rejected() {
        assert!(SystemStorage::new(0).is_err());
    }

    #[test]
    fn test_memcpy_stream_roundtrip() {
        let mut src = SystemStorage::new(32).unwrap();
        let mut dst = SystemStorage::new(32).unwrap();

        unsafe {
            let p = src.as_mut_ptr().unwrap();
            for i in 0..32 {
                *p.add(i) = i as u8;
            }
        }

        let stream = MemcpyStream;
        stream.copy(&mut dst, 8, &src, 0, 16).unwrap();

        let bytes = unsafe { std::slice::from_raw_parts(dst.as_ptr().unwrap(), 32) };
        assert_eq!(&bytes[8..24], &(0..16).map(|i| i as u8).collect::<Vec<_>>()[..]);
        assert!(bytes[..8].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_memcpy_stream_bounds_checked() {
        let src = SystemStorage::new(16).unwrap();
        let mut dst = SystemStorage::new(16).unwrap();

        let stream = MemcpyStream;
        assert!(stream.copy(&mut dst, 8, &src, 0, 16).is_err());
    }
}
