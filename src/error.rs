// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{device::Direction, dma::CacheOp, format::PixelLayout};
use std::{io, path::PathBuf};
use thiserror::Error;
use videodev2_sys::FourCC;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors reported by the allocator, the device binding and the engine.
///
/// `ConfigurationFailed` and `TransformFailed` wrap the lower level error
/// that aborted the operation so callers can match on the outcome while
/// still logging the root cause.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open device {}: {source}", .path.display())]
    DeviceOpenFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("device rejected {direction} format {width}x{height} {fourcc}: {source}")]
    FormatRejected {
        direction: Direction,
        width: u32,
        height: u32,
        fourcc: FourCC,
        #[source]
        source: io::Error,
    },

    #[error("{direction} buffer setup failed: {reason}")]
    BufferSetupFailed { direction: Direction, reason: String },

    #[error("cannot allocate {size} bytes of contiguous memory: {reason}")]
    OutOfMemory { size: usize, reason: String },

    #[error("dma heap unavailable: {reason}")]
    HeapUnavailable { reason: String },

    #[error("dma-buf export returned invalid descriptor {fd}")]
    ExportFailed { fd: i32 },

    #[error("cache {kind} failed: {source}")]
    CacheOpFailed {
        kind: CacheOp,
        #[source]
        source: io::Error,
    },

    #[error("failed to queue {direction} buffer {index}: {source}")]
    EnqueueFailed {
        direction: Direction,
        index: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed to dequeue {direction} buffer: {source}")]
    DequeueFailed {
        direction: Direction,
        #[source]
        source: io::Error,
    },

    #[error("failed to turn {direction} streaming {}: {source}", on_off(.on))]
    StreamingFailed {
        direction: Direction,
        on: bool,
        #[source]
        source: io::Error,
    },

    #[error("unsupported pixel format {0}")]
    UnsupportedFormat(PixelLayout),

    #[error("{width}x{height} {layout} frame exceeds the 32-bit image size limit")]
    FrameTooLarge {
        width: u32,
        height: u32,
        layout: PixelLayout,
    },

    #[error("frame holds {actual} bytes but {expected} are required")]
    InvalidFrame { expected: usize, actual: usize },

    #[error("{direction} buffer index {index} outside of {count} registered buffers")]
    SlotOutOfRange {
        direction: Direction,
        index: u32,
        count: u32,
    },

    #[error("{direction} returned buffer {actual} but buffer {expected} was in flight")]
    SlotMismatch {
        direction: Direction,
        expected: u32,
        actual: u32,
    },

    #[error("transform engine is not configured")]
    NotConfigured,

    #[error("configuration failed: {0}")]
    ConfigurationFailed(#[source] Box<Error>),

    #[error("transform failed: {0}")]
    TransformFailed(#[source] Box<Error>),
}

fn on_off(on: &bool) -> &'static str {
    if *on {
        "on"
    } else {
        "off"
    }
}

impl Error {
    pub(crate) fn configuration(err: Error) -> Self {
        match err {
            Error::ConfigurationFailed(_) => err,
            err => Error::ConfigurationFailed(Box::new(err)),
        }
    }

    pub(crate) fn transform(err: Error) -> Self {
        match err {
            Error::TransformFailed(_) | Error::NotConfigured => err,
            err => Error::TransformFailed(Box::new(err)),
        }
    }
}
