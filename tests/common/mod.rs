// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

#![allow(dead_code)]

use edgefirst_transform::{
    device::{Device, Direction},
    dma::{check_cache_range, CacheOp, DmaAllocator, DmaBuffer},
    engine::Engine,
    format::FrameFormat,
    Error, Result,
};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    ffi::CString,
    fs::File,
    io,
    os::{
        fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd},
        unix::fs::FileExt,
    },
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

/// Everything the mock device and allocator observed, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Open(PathBuf),
    Close,
    Negotiate(Direction, u32),
    Enqueue(Direction, u32),
    Dequeue(Direction, u32),
    Stream(Direction, bool),
    Release(Direction),
    Alloc(usize),
    Free(usize),
    Cache(CacheOp, usize),
}

struct Queued {
    index: u32,
    file: File,
    size: u32,
}

/// State shared between the mock device, the allocator and the test body.
#[derive(Default)]
pub struct MockState {
    pub ops: Vec<Op>,
    /// Extra bytes reported on top of the frame size by negotiation.
    pub padding: u32,
    pub fail_open: bool,
    pub fail_negotiate: Option<Direction>,
    /// Cache operation kinds that fail.
    pub fail_cache: Vec<CacheOp>,
    /// Direction whose next dequeue fails.
    pub fail_dequeue: Option<Direction>,
    /// Allocations beyond this count fail.
    pub alloc_limit: Option<usize>,
    /// Index reported when the device hands back an input buffer.
    pub misreport_output: Option<u32>,
    allocations: usize,
    streaming: HashSet<Direction>,
    registered: HashMap<Direction, u32>,
    queues: HashMap<Direction, VecDeque<Queued>>,
    consumed: VecDeque<Queued>,
}

#[derive(Clone, Default)]
pub struct Shared(Arc<Mutex<MockState>>);

impl Shared {
    pub fn lock(&self) -> MutexGuard<'_, MockState> {
        self.0.lock().unwrap()
    }

    pub fn ops(&self) -> Vec<Op> {
        self.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.lock().ops.clear();
    }

    pub fn count(&self, op: &Op) -> usize {
        self.lock().ops.iter().filter(|o| *o == op).count()
    }

    /// Position of the first matching op at or after `from`.
    pub fn position(&self, from: usize, f: impl Fn(&Op) -> bool) -> Option<usize> {
        self.lock()
            .ops
            .iter()
            .skip(from)
            .position(f)
            .map(|pos| pos + from)
    }
}

fn os_error(errno: i32) -> io::Error {
    io::Error::from_raw_os_error(errno)
}

/// Memory-to-memory device that copies each input buffer into the next
/// capture buffer.
pub struct MockDevice {
    shared: Shared,
}

impl Device for MockDevice {
    fn negotiate_and_register(
        &mut self,
        direction: Direction,
        format: &FrameFormat,
        buffer_count: u32,
    ) -> Result<u32> {
        let mut state = self.shared.lock();
        state.ops.push(Op::Negotiate(direction, buffer_count));
        if state.fail_negotiate == Some(direction) {
            return Err(Error::FormatRejected {
                direction,
                width: format.width,
                height: format.height,
                fourcc: format.fourcc,
                source: os_error(libc::EINVAL),
            });
        }
        state.registered.insert(direction, buffer_count);
        Ok(format.byte_size as u32 + state.padding)
    }

    fn enqueue(
        &mut self,
        direction: Direction,
        index: u32,
        fd: BorrowedFd<'_>,
        image_size: u32,
    ) -> Result<()> {
        let mut state = self.shared.lock();
        state.ops.push(Op::Enqueue(direction, index));

        let enqueue_failed = |errno| Error::EnqueueFailed {
            direction,
            index,
            source: os_error(errno),
        };
        if index >= state.registered.get(&direction).copied().unwrap_or(0) {
            return Err(enqueue_failed(libc::EINVAL));
        }
        let queue = state.queues.entry(direction).or_default();
        if queue.iter().any(|q| q.index == index) {
            return Err(enqueue_failed(libc::EBUSY));
        }
        let file = File::from(fd.try_clone_to_owned().map_err(|e| Error::EnqueueFailed {
            direction,
            index,
            source: e,
        })?);
        queue.push_back(Queued {
            index,
            file,
            size: image_size,
        });
        Ok(())
    }

    fn dequeue(&mut self, direction: Direction) -> Result<u32> {
        let mut state = self.shared.lock();
        let would_block = Error::DequeueFailed {
            direction,
            source: os_error(libc::EAGAIN),
        };

        if state.fail_dequeue == Some(direction) {
            state.fail_dequeue = None;
            return Err(Error::DequeueFailed {
                direction,
                source: os_error(libc::EIO),
            });
        }

        let index = match direction {
            Direction::Capture => {
                if !state.streaming.contains(&Direction::Output)
                    || !state.streaming.contains(&Direction::Capture)
                {
                    return Err(would_block);
                }
                let Some(input) = state
                    .queues
                    .get_mut(&Direction::Output)
                    .and_then(|q| q.pop_front())
                else {
                    return Err(would_block);
                };
                let Some(output) = state
                    .queues
                    .get_mut(&Direction::Capture)
                    .and_then(|q| q.pop_front())
                else {
                    return Err(would_block);
                };

                let mut pixels = vec![0u8; input.size.min(output.size) as usize];
                input.file.read_exact_at(&mut pixels, 0).unwrap();
                output.file.write_all_at(&pixels, 0).unwrap();

                state.consumed.push_back(input);
                output.index
            }
            Direction::Output => {
                let Some(input) = state.consumed.pop_front() else {
                    return Err(would_block);
                };
                state.misreport_output.unwrap_or(input.index)
            }
        };

        state.ops.push(Op::Dequeue(direction, index));
        Ok(index)
    }

    fn set_streaming(&mut self, direction: Direction, on: bool) -> Result<()> {
        let mut state = self.shared.lock();
        state.ops.push(Op::Stream(direction, on));
        if state.streaming.contains(&direction) == on {
            return Err(Error::StreamingFailed {
                direction,
                on,
                source: os_error(libc::EBUSY),
            });
        }

        if on {
            state.streaming.insert(direction);
        } else {
            state.streaming.remove(&direction);
            state.queues.remove(&direction);
            if direction == Direction::Output {
                state.consumed.clear();
            }
        }
        Ok(())
    }

    fn release_buffers(&mut self, direction: Direction) -> Result<()> {
        let mut state = self.shared.lock();
        state.ops.push(Op::Release(direction));
        state.registered.remove(&direction);
        state.queues.remove(&direction);
        Ok(())
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.ops.push(Op::Close);
        state.streaming.clear();
        state.registered.clear();
        state.queues.clear();
        state.consumed.clear();
    }
}

/// Allocator handing out anonymous shared memory in place of CMA.
pub struct MemfdAllocator {
    shared: Shared,
}

impl MemfdAllocator {
    pub fn new(shared: Shared) -> Self {
        Self { shared }
    }
}

pub fn memfd(size: usize) -> Result<DmaBuffer> {
    let out_of_memory = |reason: String| Error::OutOfMemory { size, reason };

    let name = CString::new("dmabuf").unwrap();
    let raw = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if raw < 0 {
        return Err(out_of_memory(io::Error::last_os_error().to_string()));
    }
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } != 0 {
        return Err(out_of_memory(io::Error::last_os_error().to_string()));
    }
    DmaBuffer::from_fd(fd, size)
}

impl DmaAllocator for MemfdAllocator {
    fn allocate(&self, size: usize, _alignment: usize) -> Result<DmaBuffer> {
        let mut state = self.shared.lock();
        if state.alloc_limit.is_some_and(|limit| state.allocations >= limit) {
            return Err(Error::OutOfMemory {
                size,
                reason: "allocation limit reached".to_string(),
            });
        }
        state.allocations += 1;
        state.ops.push(Op::Alloc(size));
        memfd(size)
    }

    fn free(&self, buffer: DmaBuffer) {
        self.shared.lock().ops.push(Op::Free(buffer.size()));
    }

    fn cache_op(&self, buffer: &DmaBuffer, size: usize, kind: CacheOp) -> Result<()> {
        check_cache_range(buffer, size, kind)?;
        let mut state = self.shared.lock();
        state.ops.push(Op::Cache(kind, size));
        if state.fail_cache.contains(&kind) {
            return Err(Error::CacheOpFailed {
                kind,
                source: os_error(libc::EIO),
            });
        }
        Ok(())
    }
}

pub type MockEngine = Engine<MockDevice, MemfdAllocator>;

/// Engine wired to a mock device and memfd allocator sharing `shared`.
pub fn mock_engine(shared: &Shared) -> MockEngine {
    let opener = shared.clone();
    Engine::with_opener(MemfdAllocator::new(shared.clone()), move |path: &Path| {
        let mut state = opener.lock();
        state.ops.push(Op::Open(path.to_path_buf()));
        if state.fail_open {
            return Err(io::Error::from(io::ErrorKind::NotFound));
        }
        Ok(MockDevice {
            shared: opener.clone(),
        })
    })
}

/// Repeating byte pattern that differs between frames.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
