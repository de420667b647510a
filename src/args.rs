// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use clap::Parser;
use edgefirst_transform::{
    engine::{CachePolicy, EngineConfig, DEFAULT_DEVICE, INPUT_POOL_MAX},
    format::{FrameFormat, PixelLayout},
    Result,
};
use std::path::PathBuf;

/// Command-line arguments for the EdgeFirst Transform tool.
///
/// Streams raw frames from a file through the memory-to-memory accelerator
/// and writes the converted frames to another file. Arguments can be
/// specified via command line or environment variables.
///
/// # Example
///
/// ```bash
/// # Convert 1080p YUY2 frames to NV12
/// edgefirst-transform --input camera.yuyv --output camera.nv12
///
/// # Convert to RGB on a different device node
/// export DEVICE=/dev/video1
/// edgefirst-transform -i camera.yuyv -o camera.rgb --output-format RGB
/// ```
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Memory-to-memory accelerator device path
    #[arg(short, long, env = "DEVICE", default_value = DEFAULT_DEVICE)]
    pub device: PathBuf,

    /// Raw input frames file
    #[arg(short, long, env = "INPUT")]
    pub input: PathBuf,

    /// Raw output frames file
    #[arg(short, long, env = "OUTPUT")]
    pub output: PathBuf,

    /// Input resolution in pixels (width height)
    #[arg(
        long,
        env = "INPUT_SIZE",
        default_value = "1920 1080",
        value_delimiter = ' ',
        num_args = 2
    )]
    pub input_size: Vec<u32>,

    /// Input pixel format (NV12, UYVY or YUY2)
    #[arg(long, env = "INPUT_FORMAT", default_value = "YUY2")]
    pub input_format: PixelLayout,

    /// Output resolution in pixels (width height)
    #[arg(
        long,
        env = "OUTPUT_SIZE",
        default_value = "1920 1080",
        value_delimiter = ' ',
        num_args = 2
    )]
    pub output_size: Vec<u32>,

    /// Output pixel format (NV12, UYVY, YUY2, RGB, BGR, ARGB, xRGB, ABGR,
    /// xBGR)
    #[arg(long, env = "OUTPUT_FORMAT", default_value = "NV12")]
    pub output_format: PixelLayout,

    /// Stop after this many frames
    #[arg(short, long)]
    pub frames: Option<usize>,

    /// Input buffer slots registered with the device
    #[arg(long, env = "INPUT_BUFFERS", default_value_t = INPUT_POOL_MAX)]
    pub input_buffers: u32,

    /// Read frames straight into a DMA input buffer instead of memory
    #[arg(long, env = "DMA_INPUT")]
    pub dma_input: bool,

    /// Abort frames when a cache flush or invalidate fails
    #[arg(long, env = "STRICT_CACHE")]
    pub strict_cache: bool,

    /// Enable verbose debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Enable Tracy profiler for performance analysis
    #[arg(long, env = "TRACY")]
    pub tracy: bool,
}

impl Args {
    pub fn input_frame(&self) -> Result<FrameFormat> {
        FrameFormat::new(self.input_size[0], self.input_size[1], self.input_format)
    }

    pub fn output_frame(&self) -> Result<FrameFormat> {
        FrameFormat::new(self.output_size[0], self.output_size[1], self.output_format)
    }
}

impl From<&Args> for EngineConfig {
    fn from(args: &Args) -> Self {
        EngineConfig {
            device: args.device.clone(),
            input_buffers: args.input_buffers,
            cache_policy: if args.strict_cache {
                CachePolicy::Strict
            } else {
                CachePolicy::BestEffort
            },
        }
    }
}
