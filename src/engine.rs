// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Hardware transform engine.
//!
//! The engine owns one open device session, a CPU-writable work buffer and a
//! ring of [`RING_SIZE`] capture buffers. It runs exactly one frame at a time:
//! every [`Engine::transform`] call submits one input buffer, blocks until the
//! device returns one result buffer, copies it out and re-queues it before
//! returning. The ring therefore never provides pipelining, it only keeps the
//! device supplied with the buffers it needs to be resident while streaming.
//!
//! State progression:
//!
//! ```text
//! Unconfigured --configure--> CaptureArmed --first transform--> FullyStreaming
//!       ^                          |                                 |
//!       |                          +------------teardown-------------+--> Stopped
//!       +---- failed configure
//! ```

use crate::{
    device::{Device, Direction, V4l2Device},
    dma::{CacheOp, DmaAllocator, DmaBuffer},
    error::{Error, Result},
    format::{FrameFormat, PixelLayout},
};
use std::{
    io,
    path::{Path, PathBuf},
};
use tracing::{debug, error, info, instrument, warn};

/// Number of capture buffers cycling between engine and device.
pub const RING_SIZE: usize = 2;

/// Upper bound on input buffers registered with the device, matching the
/// largest input pool handed out by [`Engine::input_pool`] plus the work
/// buffer.
pub const INPUT_POOL_MAX: u32 = 8;

/// Device node of the accelerator on the reference platform.
pub const DEFAULT_DEVICE: &str = "/dev/v4l/by-path/platform-489d0000.vpe-video-index0";

/// Input slot used by the work buffer.
const WORK_SLOT: u32 = 0;

/// What to do when a cache flush or invalidate fails.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CachePolicy {
    /// Log a warning and carry on with the frame.
    #[default]
    BestEffort,
    /// Abort the frame.
    Strict,
}

/// Engine configuration supplied by the pipeline.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub device: PathBuf,
    /// Input buffer slots registered with the device, including the work
    /// buffer slot.
    pub input_buffers: u32,
    pub cache_policy: CachePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from(DEFAULT_DEVICE),
            input_buffers: INPUT_POOL_MAX,
            cache_policy: CachePolicy::default(),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EngineState {
    Unconfigured,
    /// Capture buffers are queued and capture streaming is on; the output
    /// side starts with the first frame.
    CaptureArmed,
    FullyStreaming,
    Stopped,
}

/// Source frame handed to [`Engine::transform`].
pub enum Source<'a> {
    /// Frame already resident in a DMA buffer registered under an input slot.
    Dma(&'a DmaBuffer),
    /// Frame in ordinary memory, copied into the work buffer.
    Memory(&'a [u8]),
}

struct RingSlot {
    buffer: DmaBuffer,
    queued: bool,
}

struct Session<D: Device> {
    device: D,
    input: FrameFormat,
    output: FrameFormat,
    input_size: u32,
    output_size: u32,
    input_buffers: u32,
    ring: Vec<RingSlot>,
    input_queued: Option<u32>,
    output_streaming: bool,
    capture_streaming: bool,
}

impl<D: Device> Session<D> {
    fn new(device: D, input: FrameFormat, output: FrameFormat, input_buffers: u32) -> Self {
        Self {
            device,
            input,
            output,
            input_size: 0,
            output_size: 0,
            input_buffers,
            ring: Vec::with_capacity(RING_SIZE),
            input_queued: None,
            output_streaming: false,
            capture_streaming: false,
        }
    }

    /// Turns off whichever directions are streaming. Streaming off hands every
    /// queued buffer of that direction back to the engine.
    fn stop_streaming(&mut self) -> Result<()> {
        let mut result = Ok(());

        if self.output_streaming {
            self.output_streaming = false;
            match self.device.set_streaming(Direction::Output, false) {
                Ok(()) => self.input_queued = None,
                Err(e) => {
                    warn!("{e}");
                    result = result.and(Err(e));
                }
            }
        }

        if self.capture_streaming {
            self.capture_streaming = false;
            match self.device.set_streaming(Direction::Capture, false) {
                Ok(()) => self.ring.iter_mut().for_each(|slot| slot.queued = false),
                Err(e) => {
                    warn!("{e}");
                    result = result.and(Err(e));
                }
            }
        }

        result
    }

    /// Reclaims buffers still queued to a direction that is not streaming.
    fn release_queued(&mut self) -> Result<()> {
        let mut result = Ok(());

        if self.input_queued.is_some() {
            match self.device.release_buffers(Direction::Output) {
                Ok(()) => self.input_queued = None,
                Err(e) => {
                    warn!("{e}");
                    result = result.and(Err(e));
                }
            }
        }

        if self.ring.iter().any(|slot| slot.queued) {
            match self.device.release_buffers(Direction::Capture) {
                Ok(()) => self.ring.iter_mut().for_each(|slot| slot.queued = false),
                Err(e) => {
                    warn!("{e}");
                    result = result.and(Err(e));
                }
            }
        }

        result
    }
}

impl<D: Device> Drop for Session<D> {
    fn drop(&mut self) {
        // Fields drop afterwards in declaration order: the device closes
        // before any ring buffer is unmapped.
        let _ = self.stop_streaming();
        let _ = self.release_queued();
    }
}

type Opener<D> = Box<dyn Fn(&Path) -> io::Result<D> + Send>;

/// Synchronous driver for a memory-to-memory transform accelerator.
///
/// # Thread Safety
///
/// The device protocol is not reentrant. All operations take `&mut self`;
/// share an engine between threads only behind a `Mutex`.
///
/// # Example
///
/// ```no_run
/// use edgefirst_transform::{
///     dma::CmaAllocator,
///     engine::{Engine, EngineConfig, Source},
///     format::{FrameFormat, PixelLayout},
/// };
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut engine = Engine::new(CmaAllocator::new()?);
/// let input = FrameFormat::new(1920, 1080, PixelLayout::Yuy2)?;
/// let output = FrameFormat::new(1920, 1080, PixelLayout::Nv12)?;
/// engine.configure(&EngineConfig::default(), input, output)?;
///
/// let frame = vec![0u8; input.byte_size];
/// let mut result = vec![0u8; output.byte_size];
/// engine.transform(Source::Memory(&frame), &mut result)?;
///
/// engine.teardown()?;
/// # Ok(())
/// # }
/// ```
pub struct Engine<D: Device, A: DmaAllocator> {
    allocator: A,
    opener: Opener<D>,
    session: Option<Session<D>>,
    work: Option<DmaBuffer>,
    state: EngineState,
    cache_policy: CachePolicy,
}

impl<A: DmaAllocator> Engine<V4l2Device, A> {
    /// Creates an engine driving V4L2 device nodes.
    pub fn new(allocator: A) -> Self {
        Self::with_opener(allocator, V4l2Device::open)
    }
}

impl<D: Device, A: DmaAllocator> Engine<D, A> {
    /// Creates an engine that opens devices through `opener`.
    pub fn with_opener<F>(allocator: A, opener: F) -> Self
    where
        F: Fn(&Path) -> io::Result<D> + Send + 'static,
    {
        Self {
            allocator,
            opener: Box::new(opener),
            session: None,
            work: None,
            state: EngineState::Unconfigured,
            cache_policy: CachePolicy::default(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    pub fn input_format(&self) -> Option<&FrameFormat> {
        self.session.as_ref().map(|s| &s.input)
    }

    pub fn output_format(&self) -> Option<&FrameFormat> {
        self.session.as_ref().map(|s| &s.output)
    }

    /// Image size the device negotiated for input buffers.
    pub fn input_size(&self) -> Option<u32> {
        self.session.as_ref().map(|s| s.input_size)
    }

    /// Image size the device negotiated for output buffers.
    pub fn output_size(&self) -> Option<u32> {
        self.session.as_ref().map(|s| s.output_size)
    }

    /// Ring slots currently queued to the device and held by the engine.
    pub fn ring_status(&self) -> Option<(usize, usize)> {
        self.session.as_ref().map(|s| {
            let queued = s.ring.iter().filter(|slot| slot.queued).count();
            (queued, s.ring.len() - queued)
        })
    }

    /// Opens the device, negotiates both directions, allocates the work
    /// buffer and the capture ring, and starts capture streaming.
    ///
    /// Reconfiguring a configured engine tears the previous session down
    /// first. On failure everything acquired so far is released and the
    /// engine is left `Unconfigured`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationFailed`] wrapping the step that failed.
    #[instrument(skip_all, fields(device = %config.device.display()))]
    pub fn configure(
        &mut self,
        config: &EngineConfig,
        input: FrameFormat,
        output: FrameFormat,
    ) -> Result<()> {
        if self.session.is_some() {
            info!("reconfiguring, tearing down previous session");
            if let Err(e) = self.teardown() {
                warn!("teardown before reconfigure: {e}");
            }
        }
        self.state = EngineState::Unconfigured;

        match self.setup(config, input, output) {
            Ok((session, work)) => {
                info!(
                    "configured {} -> {} input buffers: {} ring: {}",
                    session.input,
                    session.output,
                    session.input_buffers,
                    session.ring.len()
                );
                self.session = Some(session);
                self.work = Some(work);
                self.cache_policy = config.cache_policy;
                self.state = EngineState::CaptureArmed;
                Ok(())
            }
            Err(e) => {
                error!("{e}");
                Err(Error::configuration(e))
            }
        }
    }

    fn setup(
        &self,
        config: &EngineConfig,
        input: FrameFormat,
        output: FrameFormat,
    ) -> Result<(Session<D>, DmaBuffer)> {
        if !PixelLayout::INPUTS.contains(&input.layout) {
            return Err(Error::UnsupportedFormat(input.layout));
        }
        if !PixelLayout::OUTPUTS.contains(&output.layout) {
            return Err(Error::UnsupportedFormat(output.layout));
        }
        if config.input_buffers == 0 {
            return Err(Error::BufferSetupFailed {
                direction: Direction::Output,
                reason: "at least one input buffer is required".to_string(),
            });
        }

        let device = (self.opener)(&config.device).map_err(|source| Error::DeviceOpenFailed {
            path: config.device.clone(),
            source,
        })?;
        let mut session = Session::new(device, input, output, config.input_buffers);

        session.input_size =
            session
                .device
                .negotiate_and_register(Direction::Output, &input, config.input_buffers)?;
        session.output_size = session.device.negotiate_and_register(
            Direction::Capture,
            &output,
            RING_SIZE as u32,
        )?;
        if session.input_size as usize != input.byte_size {
            debug!(
                "input sizeimage {} differs from frame size {}",
                session.input_size, input.byte_size
            );
        }

        let work_size = input.byte_size.max(session.input_size as usize);
        let work = self.allocator.allocate(work_size, 1)?.with_index(WORK_SLOT);

        let ring_size = output.byte_size.max(session.output_size as usize);
        for index in 0..RING_SIZE as u32 {
            let buffer = self.allocator.allocate(ring_size, 1)?.with_index(index);
            session.device.enqueue(
                Direction::Capture,
                index,
                buffer.fd(),
                session.output_size,
            )?;
            session.ring.push(RingSlot {
                buffer,
                queued: true,
            });
        }

        session.device.set_streaming(Direction::Capture, true)?;
        session.capture_streaming = true;

        Ok((session, work))
    }

    /// Allocates `count` DMA input buffers of the negotiated input size under
    /// input slots `1..=count`, for producers that want to hand frames over
    /// without the work buffer copy.
    pub fn input_pool(&self, count: u32) -> Result<Vec<DmaBuffer>> {
        let session = self.session.as_ref().ok_or(Error::NotConfigured)?;
        if count >= session.input_buffers {
            return Err(Error::SlotOutOfRange {
                direction: Direction::Output,
                index: count,
                count: session.input_buffers,
            });
        }

        let size = session.input.byte_size.max(session.input_size as usize);
        (1..=count)
            .map(|index| Ok(self.allocator.allocate(size, 1)?.with_index(index)))
            .collect()
    }

    /// Transforms one frame into `destination`.
    ///
    /// Blocks until the device has produced the result. The output streaming
    /// direction is started on the first call. On error the frame is dropped
    /// and nothing is written to `destination` beyond what was already
    /// copied; the engine does not attempt to recover the device.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConfigured`] before a successful `configure`, and
    /// [`Error::TransformFailed`] wrapping the failing step otherwise.
    #[instrument(level = "trace", skip_all)]
    pub fn transform(&mut self, source: Source<'_>, destination: &mut [u8]) -> Result<()> {
        let (Some(session), Some(work)) = (self.session.as_mut(), self.work.as_mut()) else {
            return Err(Error::NotConfigured);
        };

        let res = run_frame(
            &self.allocator,
            self.cache_policy,
            session,
            work,
            source,
            destination,
        );
        let streaming = session.output_streaming;
        if streaming {
            self.state = EngineState::FullyStreaming;
        }

        res.map_err(|e| {
            error!("{e}");
            Error::transform(e)
        })
    }

    /// Stops streaming, frees the ring, closes the device and frees the work
    /// buffer.
    ///
    /// Calling it on an engine that is not configured does nothing. Every
    /// step is attempted; the first failure is reported once cleanup is
    /// complete.
    #[instrument(skip_all)]
    pub fn teardown(&mut self) -> Result<()> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };

        let mut result = session.stop_streaming();
        result = result.and(session.release_queued());

        let ring = std::mem::take(&mut session.ring);
        if ring.iter().any(|slot| slot.queued) {
            warn!("closing device before freeing ring buffers still queued");
            drop(session);
            ring.into_iter()
                .for_each(|slot| self.allocator.free(slot.buffer));
        } else {
            ring.into_iter()
                .for_each(|slot| self.allocator.free(slot.buffer));
            drop(session);
        }

        if let Some(work) = self.work.take() {
            self.allocator.free(work);
        }

        self.state = EngineState::Stopped;
        info!("stopped");
        result
    }
}

impl<D: Device, A: DmaAllocator> Drop for Engine<D, A> {
    fn drop(&mut self) {
        if self.session.is_some() {
            warn!("engine dropped without teardown");
            if let Err(e) = self.teardown() {
                warn!("{e}");
            }
        }
    }
}

fn cache_op<A: DmaAllocator>(
    allocator: &A,
    policy: CachePolicy,
    buffer: &DmaBuffer,
    size: usize,
    kind: CacheOp,
) -> Result<()> {
    match allocator.cache_op(buffer, size, kind) {
        Ok(()) => Ok(()),
        Err(e) if policy == CachePolicy::BestEffort => {
            warn!("{e}, frame data may be stale");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn run_frame<D: Device, A: DmaAllocator>(
    allocator: &A,
    policy: CachePolicy,
    session: &mut Session<D>,
    work: &mut DmaBuffer,
    source: Source<'_>,
    destination: &mut [u8],
) -> Result<()> {
    let in_bytes = session.input.byte_size;
    let out_bytes = session.output.byte_size;

    if destination.len() < out_bytes {
        return Err(Error::InvalidFrame {
            expected: out_bytes,
            actual: destination.len(),
        });
    }

    let input: &DmaBuffer = match source {
        Source::Dma(buffer) => {
            if buffer.index() >= session.input_buffers {
                return Err(Error::SlotOutOfRange {
                    direction: Direction::Output,
                    index: buffer.index(),
                    count: session.input_buffers,
                });
            }
            // Queued with the negotiated image size as its length.
            let required = in_bytes.max(session.input_size as usize);
            if buffer.size() < required {
                return Err(Error::InvalidFrame {
                    expected: required,
                    actual: buffer.size(),
                });
            }
            buffer
        }
        Source::Memory(data) => {
            if data.len() < in_bytes {
                return Err(Error::InvalidFrame {
                    expected: in_bytes,
                    actual: data.len(),
                });
            }
            work.as_slice_mut()[..in_bytes].copy_from_slice(&data[..in_bytes]);
            work
        }
    };
    let submitted = input.index();

    cache_op(allocator, policy, input, in_bytes, CacheOp::Flush)?;
    session
        .device
        .enqueue(Direction::Output, submitted, input.fd(), session.input_size)?;
    session.input_queued = Some(submitted);

    if !session.output_streaming {
        session.device.set_streaming(Direction::Output, true)?;
        session.output_streaming = true;
        debug!("input streaming started");
    }

    let slot = session.device.dequeue(Direction::Capture)?;
    let Some(ring_slot) = session.ring.get_mut(slot as usize) else {
        return Err(Error::SlotOutOfRange {
            direction: Direction::Capture,
            index: slot,
            count: RING_SIZE as u32,
        });
    };
    ring_slot.queued = false;

    cache_op(allocator, policy, &ring_slot.buffer, out_bytes, CacheOp::Invalidate)?;
    destination[..out_bytes].copy_from_slice(&ring_slot.buffer.as_slice()[..out_bytes]);

    let reclaimed = session.device.dequeue(Direction::Output)?;
    session.input_queued = None;

    let ring_slot = &mut session.ring[slot as usize];
    session.device.enqueue(
        Direction::Capture,
        slot,
        ring_slot.buffer.fd(),
        session.output_size,
    )?;
    ring_slot.queued = true;

    if reclaimed != submitted {
        return Err(Error::SlotMismatch {
            direction: Direction::Output,
            expected: submitted,
            actual: reclaimed,
        });
    }

    Ok(())
}
