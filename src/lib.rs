// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! # EdgeFirst Transform Library
//!
//! Drives memory-to-memory (M2M) V4L2 video accelerators that convert frames
//! between pixel formats and colorspaces. Frames are exchanged with the
//! device through physically contiguous DMA buffers shared between CPU and
//! hardware.
//!
//! ## Features
//!
//! - **DMA Buffer Management**: Allocate CMA-backed DMA-BUF buffers, map
//!   them for CPU access and keep CPU caches coherent with explicit flush and
//!   invalidate operations.
//! - **Device Protocol**: Multi-planar V4L2 format negotiation, DMA-BUF
//!   buffer registration, queueing and streaming control per direction.
//! - **Transform Engine**: A synchronous, single-frame-in-flight engine that
//!   sequences allocation, cache maintenance and queue bookkeeping into one
//!   `transform` call per frame.
//! - **Format Mapping**: Translation of pipeline pixel layouts into device
//!   fourcc and colorspace codes.
//!
//! ## Example
//!
//! ```no_run
//! use edgefirst_transform::{
//!     dma::CmaAllocator,
//!     engine::{Engine, EngineConfig, Source},
//!     format::{FrameFormat, PixelLayout},
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut engine = Engine::new(CmaAllocator::new()?);
//!
//! let input = FrameFormat::new(1280, 720, PixelLayout::Uyvy)?;
//! let output = FrameFormat::new(1280, 720, PixelLayout::Rgb)?;
//! engine.configure(&EngineConfig::default(), input, output)?;
//!
//! // Producers writing straight into DMA memory skip the work buffer copy.
//! let mut pool = engine.input_pool(2)?;
//! pool[0].as_slice_mut().fill(0x80);
//!
//! let mut rgb = vec![0u8; output.byte_size];
//! engine.transform(Source::Dma(&pool[0]), &mut rgb)?;
//! engine.teardown()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform Requirements
//!
//! - **Linux**: Kernel with V4L2 M2M multi-planar and DMA heap support
//! - **Memory**: A CMA heap exposed under `/dev/dma_heap`
//!
//! ## Safety
//!
//! This library uses `unsafe` code for the V4L2 and DMA-BUF ioctls and for
//! mapping DMA memory. All unsafe operations are isolated in the `dma` and
//! `device` modules and the `videodev2-sys` crate, and wrapped with safe APIs.

pub mod device;
pub mod dma;
pub mod engine;
pub mod error;
pub mod format;

pub use error::{Error, Result};
