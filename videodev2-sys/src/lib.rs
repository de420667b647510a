// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Low-level bindings for driving V4L2 memory-to-memory devices with
//! multi-planar DMA-BUF buffers.
//!
//! The `videodev2.h` structures come from the bindgen output shipped by
//! `v4l2r`, generated for the target being built, so their layout follows
//! the kernel headers on both 32 and 64-bit platforms. This crate adds the
//! ioctl entry points the engine needs, the `dma-buf.h` sync request and
//! the fourcc codes, which bindgen cannot evaluate.

#![allow(non_camel_case_types)]

use core::fmt;
use libc::c_int;
use std::mem;
use v4l2r::bindings;

pub use v4l2r::bindings::{
    v4l2_buffer, v4l2_format, v4l2_pix_format_mplane, v4l2_plane, v4l2_plane_pix_format,
    v4l2_requestbuffers,
};

pub const VIDEO_MAX_PLANES: usize = bindings::VIDEO_MAX_PLANES as usize;

pub const V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE: u32 =
    bindings::v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE;
pub const V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE: u32 =
    bindings::v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE;

pub const V4L2_MEMORY_DMABUF: u32 = bindings::v4l2_memory_V4L2_MEMORY_DMABUF;

pub const V4L2_FIELD_ANY: u32 = bindings::v4l2_field_V4L2_FIELD_ANY;

pub const V4L2_COLORSPACE_SMPTE170M: u32 = bindings::v4l2_colorspace_V4L2_COLORSPACE_SMPTE170M;
pub const V4L2_COLORSPACE_SRGB: u32 = bindings::v4l2_colorspace_V4L2_COLORSPACE_SRGB;

pub const DMA_BUF_SYNC_READ: u64 = 1 << 0;
pub const DMA_BUF_SYNC_WRITE: u64 = 2 << 0;
pub const DMA_BUF_SYNC_RW: u64 = DMA_BUF_SYNC_READ | DMA_BUF_SYNC_WRITE;
pub const DMA_BUF_SYNC_START: u64 = 0 << 2;
pub const DMA_BUF_SYNC_END: u64 = 1 << 2;

/// Four character code identifying a pixel format, as used by V4L2.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl From<FourCC> for u32 {
    fn from(value: FourCC) -> Self {
        u32::from_le_bytes(value.0)
    }
}

impl From<u32> for FourCC {
    fn from(value: u32) -> Self {
        FourCC(value.to_le_bytes())
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for c in self.0 {
            let c = if c.is_ascii_graphic() || c == b' ' {
                c as char
            } else {
                '.'
            };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

pub const V4L2_PIX_FMT_YUV420: FourCC = FourCC(*b"YU12");
pub const V4L2_PIX_FMT_NV12: FourCC = FourCC(*b"NV12");
pub const V4L2_PIX_FMT_YUYV: FourCC = FourCC(*b"YUYV");
pub const V4L2_PIX_FMT_UYVY: FourCC = FourCC(*b"UYVY");
pub const V4L2_PIX_FMT_RGB24: FourCC = FourCC(*b"RGB3");
pub const V4L2_PIX_FMT_BGR24: FourCC = FourCC(*b"BGR3");
pub const V4L2_PIX_FMT_RGB32: FourCC = FourCC(*b"RGB4");
pub const V4L2_PIX_FMT_BGR32: FourCC = FourCC(*b"BGR4");

/// Plain kernel structures for which all-zero bytes is the valid initial
/// state of an ioctl argument.
pub trait Zeroed: Copy + Sized {
    fn zeroed() -> Self {
        // Only implemented for bindgen POD structs below.
        unsafe { mem::zeroed() }
    }
}

impl Zeroed for v4l2_format {}
impl Zeroed for v4l2_requestbuffers {}
impl Zeroed for v4l2_plane {}
impl Zeroed for v4l2_buffer {}

/// `struct dma_buf_sync` from `linux/dma-buf.h`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct dma_buf_sync {
    pub flags: u64,
}

nix::ioctl_readwrite!(vidioc_s_fmt, b'V', 5, v4l2_format);
nix::ioctl_readwrite!(vidioc_reqbufs, b'V', 8, v4l2_requestbuffers);
nix::ioctl_readwrite!(vidioc_querybuf, b'V', 9, v4l2_buffer);
nix::ioctl_readwrite!(vidioc_qbuf, b'V', 15, v4l2_buffer);
nix::ioctl_readwrite!(vidioc_dqbuf, b'V', 17, v4l2_buffer);
nix::ioctl_write_ptr!(vidioc_streamon, b'V', 18, c_int);
nix::ioctl_write_ptr!(vidioc_streamoff, b'V', 19, c_int);

nix::ioctl_write_ptr!(dma_buf_ioctl_sync, b'b', 0, dma_buf_sync);

// dma_buf_sync is the one structure not generated from kernel headers; its
// layout is identical on every pointer width.
const _: () = assert!(mem::size_of::<dma_buf_sync>() == 8);
