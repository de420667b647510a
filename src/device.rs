// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{
    error::{Error, Result},
    format::FrameFormat,
};
use core::fmt;
use libc::c_int;
use std::{
    fs::OpenOptions,
    io,
    os::fd::{AsRawFd, BorrowedFd, OwnedFd},
    path::{Path, PathBuf},
};
use tracing::{debug, warn};
use videodev2_sys::{
    v4l2_buffer, v4l2_format, v4l2_plane, v4l2_requestbuffers, vidioc_dqbuf, vidioc_qbuf,
    vidioc_querybuf, vidioc_reqbufs, vidioc_s_fmt, vidioc_streamoff, vidioc_streamon, FourCC,
    Zeroed, V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE, V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE, V4L2_FIELD_ANY,
    V4L2_MEMORY_DMABUF,
};

/// Queue of a memory-to-memory device, named from the device's point of
/// view.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Frames written by the CPU and read by the device.
    Output,
    /// Frames written by the device and read by the CPU.
    Capture,
}

impl Direction {
    pub fn buf_type(self) -> u32 {
        match self {
            Direction::Output => V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE,
            Direction::Capture => V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Direction::Output => f.write_str("output"),
            Direction::Capture => f.write_str("capture"),
        }
    }
}

/// Buffer queue protocol of a memory-to-memory device, one direction at a
/// time.
///
/// Calls for a direction are only valid once its buffer set has been
/// registered by [`Device::negotiate_and_register`]. Callers are responsible
/// for never toggling streaming into the state it is already in.
pub trait Device {
    /// Sets the format for `direction` and registers `buffer_count` DMA-BUF
    /// buffer slots, returning the image size the device expects per buffer.
    fn negotiate_and_register(
        &mut self,
        direction: Direction,
        format: &FrameFormat,
        buffer_count: u32,
    ) -> Result<u32>;

    /// Hands the DMA-BUF `fd` to the device as buffer `index`.
    fn enqueue(
        &mut self,
        direction: Direction,
        index: u32,
        fd: BorrowedFd<'_>,
        image_size: u32,
    ) -> Result<()>;

    /// Blocks until the device completes a buffer and returns its index.
    fn dequeue(&mut self, direction: Direction) -> Result<u32>;

    fn set_streaming(&mut self, direction: Direction, on: bool) -> Result<()>;

    /// Unregisters every buffer of `direction`, returning queued buffers to
    /// their owner.
    fn release_buffers(&mut self, direction: Direction) -> Result<()>;
}

/// V4L2 multi-planar memory-to-memory device using one plane per buffer and
/// the DMA-BUF memory model.
#[derive(Debug)]
pub struct V4l2Device {
    fd: OwnedFd,
    path: PathBuf,
}

impl V4l2Device {
    /// Opens the device node in blocking mode.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        debug!("opened {}", path.display());
        Ok(Self {
            fd: file.into(),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn reqbufs(&self, direction: Direction, count: u32) -> nix::Result<v4l2_requestbuffers> {
        let mut req = v4l2_requestbuffers::zeroed();
        req.count = count;
        req.type_ = direction.buf_type();
        req.memory = V4L2_MEMORY_DMABUF;
        unsafe { vidioc_reqbufs(self.fd.as_raw_fd(), &mut req) }?;
        Ok(req)
    }
}

fn rejected(direction: Direction, format: &FrameFormat, source: io::Error) -> Error {
    Error::FormatRejected {
        direction,
        width: format.width,
        height: format.height,
        fourcc: format.fourcc,
        source,
    }
}

/// DMA-BUF buffer descriptor for `direction` carrying the single `plane`.
/// The plane must outlive every ioctl the descriptor is passed to.
fn single_plane(direction: Direction, plane: &mut v4l2_plane) -> v4l2_buffer {
    let mut buffer = v4l2_buffer::zeroed();
    buffer.type_ = direction.buf_type();
    buffer.memory = V4L2_MEMORY_DMABUF;
    buffer.field = V4L2_FIELD_ANY;
    buffer.m.planes = plane;
    buffer.length = 1;
    buffer
}

impl Device for V4l2Device {
    fn negotiate_and_register(
        &mut self,
        direction: Direction,
        format: &FrameFormat,
        buffer_count: u32,
    ) -> Result<u32> {
        let type_ = direction.buf_type();

        let mut fmt = v4l2_format::zeroed();
        fmt.type_ = type_;
        let mut pix_mp = unsafe { fmt.fmt.pix_mp };
        pix_mp.width = format.width;
        pix_mp.height = format.height;
        pix_mp.pixelformat = format.fourcc.into();
        pix_mp.field = V4L2_FIELD_ANY;
        pix_mp.colorspace = format.colorspace.code();
        pix_mp.num_planes = 1;
        fmt.fmt.pix_mp = pix_mp;

        unsafe { vidioc_s_fmt(self.fd.as_raw_fd(), &mut fmt) }
            .map_err(|e| rejected(direction, format, e.into()))?;

        // Drivers adjust unsupported requests instead of failing them.
        let pix_mp = unsafe { fmt.fmt.pix_mp };
        let (width, height) = (pix_mp.width, pix_mp.height);
        let pixelformat = FourCC::from(pix_mp.pixelformat);
        if width != format.width || height != format.height || pixelformat != format.fourcc {
            return Err(rejected(
                direction,
                format,
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("device proposed {width}x{height} {pixelformat}"),
                ),
            ));
        }
        let plane_fmt = pix_mp.plane_fmt;
        let sizeimage = plane_fmt[0].sizeimage;
        debug!("{direction} format {format} sizeimage {sizeimage}");

        let req = self
            .reqbufs(direction, buffer_count)
            .map_err(|e| Error::BufferSetupFailed {
                direction,
                reason: format!("VIDIOC_REQBUFS failed: {e}"),
            })?;
        if req.count != buffer_count || req.type_ != type_ || req.memory != V4L2_MEMORY_DMABUF {
            if let Err(e) = self.release_buffers(direction) {
                warn!("{e}");
            }
            return Err(Error::BufferSetupFailed {
                direction,
                reason: format!(
                    "requested {} dmabuf buffers, device granted {} (type {} memory {})",
                    buffer_count, req.count, req.type_, req.memory
                ),
            });
        }

        for index in 0..buffer_count {
            let mut plane = v4l2_plane::zeroed();
            plane.length = sizeimage;
            plane.bytesused = match direction {
                Direction::Output => sizeimage,
                Direction::Capture => 0,
            };
            let mut buffer = single_plane(direction, &mut plane);
            buffer.index = index;
            if let Err(e) = unsafe { vidioc_querybuf(self.fd.as_raw_fd(), &mut buffer) } {
                if let Err(e) = self.release_buffers(direction) {
                    warn!("{e}");
                }
                return Err(Error::BufferSetupFailed {
                    direction,
                    reason: format!("VIDIOC_QUERYBUF {index} failed: {e}"),
                });
            }
        }

        Ok(sizeimage)
    }

    fn enqueue(
        &mut self,
        direction: Direction,
        index: u32,
        fd: BorrowedFd<'_>,
        image_size: u32,
    ) -> Result<()> {
        let mut plane = v4l2_plane::zeroed();
        plane.bytesused = match direction {
            Direction::Output => image_size,
            Direction::Capture => 0,
        };
        plane.length = image_size;
        plane.m.fd = fd.as_raw_fd();
        let mut buffer = single_plane(direction, &mut plane);
        buffer.index = index;

        unsafe { vidioc_qbuf(self.fd.as_raw_fd(), &mut buffer) }.map_err(|e| {
            Error::EnqueueFailed {
                direction,
                index,
                source: e.into(),
            }
        })?;
        Ok(())
    }

    fn dequeue(&mut self, direction: Direction) -> Result<u32> {
        let mut plane = v4l2_plane::zeroed();
        let mut buffer = single_plane(direction, &mut plane);

        loop {
            match unsafe { vidioc_dqbuf(self.fd.as_raw_fd(), &mut buffer) } {
                Ok(_) => return Ok(buffer.index),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    return Err(Error::DequeueFailed {
                        direction,
                        source: e.into(),
                    })
                }
            }
        }
    }

    fn set_streaming(&mut self, direction: Direction, on: bool) -> Result<()> {
        let type_ = direction.buf_type() as c_int;
        let res = if on {
            unsafe { vidioc_streamon(self.fd.as_raw_fd(), &type_) }
        } else {
            unsafe { vidioc_streamoff(self.fd.as_raw_fd(), &type_) }
        };
        res.map_err(|e| Error::StreamingFailed {
            direction,
            on,
            source: e.into(),
        })?;
        debug!("{direction} streaming {}", if on { "on" } else { "off" });
        Ok(())
    }

    fn release_buffers(&mut self, direction: Direction) -> Result<()> {
        self.reqbufs(direction, 0)
            .map_err(|e| Error::BufferSetupFailed {
                direction,
                reason: format!("releasing buffers failed: {e}"),
            })?;
        Ok(())
    }
}
