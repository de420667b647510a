// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::error::{Error, Result};
use core::fmt;
use dma_buf::DmaBuf;
use dma_heap::{Heap, HeapKind};
use libc::{mmap, munmap, MAP_FAILED, MAP_SHARED, PROT_READ, PROT_WRITE};
use std::{
    ffi::c_void,
    io,
    os::fd::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd},
    ptr::null_mut,
    slice::{from_raw_parts, from_raw_parts_mut},
};
use tracing::{debug, warn};
use videodev2_sys::{
    dma_buf_ioctl_sync, dma_buf_sync, DMA_BUF_SYNC_END, DMA_BUF_SYNC_READ, DMA_BUF_SYNC_START,
    DMA_BUF_SYNC_WRITE,
};

/// Blocks handed out by the contiguous heap are page aligned, so any
/// power-of-two alignment up to this value is satisfied implicitly.
pub const PAGE_SIZE: usize = 4096;

/// Cache maintenance required when CPU and device share a buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CacheOp {
    /// Write back CPU cache lines so the device reads what the CPU wrote.
    Flush,
    /// Discard stale CPU cache lines so the CPU reads what the device wrote.
    Invalidate,
}

impl CacheOp {
    fn sync_flags(self) -> u64 {
        match self {
            CacheOp::Flush => DMA_BUF_SYNC_END | DMA_BUF_SYNC_WRITE,
            CacheOp::Invalidate => DMA_BUF_SYNC_START | DMA_BUF_SYNC_READ,
        }
    }
}

impl fmt::Display for CacheOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CacheOp::Flush => f.write_str("flush"),
            CacheOp::Invalidate => f.write_str("invalidate"),
        }
    }
}

/// A DMA-BUF backed memory block mapped into the process.
///
/// The buffer is owned by exactly one party at a time: the allocator until
/// it is first queued, the kernel while queued to a device, the engine
/// after dequeue. Dropping the buffer unmaps it and closes the descriptor,
/// which is how [`DmaAllocator::free`] releases it.
///
/// `index` is the device buffer slot the block is registered under.
pub struct DmaBuffer {
    mmap: *mut u8,
    len: usize,
    fd: OwnedFd,
    index: u32,
}

// The mapping is owned exclusively by this value and carries no thread
// affinity.
unsafe impl Send for DmaBuffer {}

impl DmaBuffer {
    /// Maps an existing DMA-BUF descriptor of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if `size` is zero or the mapping fails.
    pub fn from_fd(fd: OwnedFd, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::OutOfMemory {
                size,
                reason: "zero sized buffer".to_string(),
            });
        }

        let mmap = unsafe {
            mmap(
                null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if mmap == MAP_FAILED {
            return Err(Error::OutOfMemory {
                size,
                reason: format!("mmap failed: {}", io::Error::last_os_error()),
            });
        }

        Ok(Self {
            mmap: mmap as *mut u8,
            len: size,
            fd,
            index: 0,
        })
    }

    pub fn with_index(mut self, index: u32) -> Self {
        self.index = index;
        self
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn size(&self) -> usize {
        self.len
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Virtual address of the CPU mapping.
    pub fn as_ptr(&self) -> *const u8 {
        self.mmap
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { from_raw_parts(self.mmap, self.len) }
    }

    pub fn as_slice_mut(&mut self) -> &mut [u8] {
        unsafe { from_raw_parts_mut(self.mmap, self.len) }
    }

    /// Duplicates the descriptor into a [`DmaBuf`] handle for sharing with
    /// other consumers.
    pub fn dmabuf(&self) -> io::Result<DmaBuf> {
        Ok(DmaBuf::from(self.fd.try_clone()?))
    }

    /// Issues the DMA-BUF sync matching `kind` on the whole buffer.
    pub fn sync(&self, kind: CacheOp) -> io::Result<()> {
        let sync = dma_buf_sync {
            flags: kind.sync_flags(),
        };
        loop {
            match unsafe { dma_buf_ioctl_sync(self.fd.as_raw_fd(), &sync) } {
                Ok(_) => return Ok(()),
                Err(nix::errno::Errno::EINTR) | Err(nix::errno::Errno::EAGAIN) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        if unsafe { munmap(self.mmap.cast::<c_void>(), self.len) } != 0 {
            warn!("unmap of dma buffer fd:{} failed!", self.fd.as_raw_fd());
        }
    }
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("vaddr", &self.mmap)
            .field("fd", &self.fd.as_raw_fd())
            .field("size", &self.len)
            .field("index", &self.index)
            .finish()
    }
}

impl fmt::Display for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "dmabuf[{}] fd:{} {} bytes",
            self.index,
            self.fd.as_raw_fd(),
            self.len
        )
    }
}

/// Source of DMA-capable memory for the transform engine.
pub trait DmaAllocator {
    /// Allocates a physically contiguous block of at least `size` bytes.
    fn allocate(&self, size: usize, alignment: usize) -> Result<DmaBuffer>;

    /// Releases a block. The buffer must not be queued to a device.
    fn free(&self, buffer: DmaBuffer) {
        debug!("free {}", buffer);
        drop(buffer);
    }

    /// Makes the first `size` bytes of `buffer` coherent between CPU and
    /// device.
    fn cache_op(&self, buffer: &DmaBuffer, size: usize, kind: CacheOp) -> Result<()>;
}

/// Checks an allocation request before it reaches the kernel.
///
/// Zero sized requests and alignments that are not a power of two or exceed
/// the page size cannot be served by the contiguous heap.
pub fn validate_request(size: usize, alignment: usize) -> Result<()> {
    if size == 0 {
        return Err(Error::OutOfMemory {
            size,
            reason: "zero sized allocation".to_string(),
        });
    }
    if !alignment.is_power_of_two() || alignment > PAGE_SIZE {
        return Err(Error::OutOfMemory {
            size,
            reason: format!("unsupported alignment {alignment}"),
        });
    }
    Ok(())
}

/// Validates a descriptor returned by a DMA-BUF export.
///
/// Exporters on this platform signal failure by returning 0, so only strictly
/// positive descriptors are accepted even though 0 is a valid descriptor
/// number elsewhere.
pub fn exported_fd(fd: RawFd) -> Result<RawFd> {
    if fd > 0 {
        Ok(fd)
    } else {
        Err(Error::ExportFailed { fd })
    }
}

/// Takes ownership of a descriptor returned by a DMA-BUF export.
///
/// A rejected descriptor is released without being closed; descriptor 0
/// belongs to the process, not to the failed export.
pub fn take_exported(fd: OwnedFd) -> Result<OwnedFd> {
    match exported_fd(fd.as_raw_fd()) {
        Ok(_) => Ok(fd),
        Err(e) => {
            let _ = fd.into_raw_fd();
            Err(e)
        }
    }
}

/// Checks that a cache operation covers memory inside the buffer.
pub fn check_cache_range(buffer: &DmaBuffer, size: usize, kind: CacheOp) -> Result<()> {
    if size > buffer.size() {
        return Err(Error::CacheOpFailed {
            kind,
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} bytes requested on {}", size, buffer),
            ),
        });
    }
    Ok(())
}

/// Allocator backed by the kernel CMA dma-heap.
///
/// The heap device is opened once when the allocator is created; a single
/// allocator is meant to be shared by everything in the process that needs
/// contiguous memory.
pub struct CmaAllocator {
    heap: Heap,
}

impl CmaAllocator {
    /// Opens the CMA heap.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HeapUnavailable`] if `/dev/dma_heap` has no CMA heap
    /// or it cannot be opened.
    pub fn new() -> Result<Self> {
        let heap = Heap::new(HeapKind::Cma).map_err(|e| Error::HeapUnavailable {
            reason: e.to_string(),
        })?;
        Ok(Self { heap })
    }
}

impl DmaAllocator for CmaAllocator {
    fn allocate(&self, size: usize, alignment: usize) -> Result<DmaBuffer> {
        validate_request(size, alignment)?;

        let fd = self.heap.allocate(size).map_err(|e| Error::OutOfMemory {
            size,
            reason: e.to_string(),
        })?;
        // The heap signals a failed export with descriptor 0 rather than an
        // error, so the returned descriptor is checked before it is mapped.
        let fd = take_exported(fd)?;

        let buffer = DmaBuffer::from_fd(fd, size)?;
        debug!("alloc {}", buffer);
        Ok(buffer)
    }

    fn cache_op(&self, buffer: &DmaBuffer, size: usize, kind: CacheOp) -> Result<()> {
        check_cache_range(buffer, size, kind)?;
        buffer
            .sync(kind)
            .map_err(|source| Error::CacheOpFailed { kind, source })
    }
}
