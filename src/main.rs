// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use args::Args;
use clap::Parser;
use edgefirst_transform::{
    device::V4l2Device,
    dma::{CmaAllocator, DmaBuffer},
    engine::{Engine, EngineConfig, Source},
    format::FrameFormat,
};
use std::{
    error::Error,
    fs::File,
    io::{self, BufReader, BufWriter, Read, Write},
    time::Instant,
};
use tracing::{debug, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, Layer};

mod args;

fn init_tracing(args: &Args) -> Result<(), Box<dyn Error>> {
    let level = if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    let stdout = tracing_subscriber::fmt::layer().with_filter(level);
    let journald = match tracing_journald::layer() {
        Ok(layer) => Some(layer.with_filter(level)),
        Err(_) => None,
    };
    let tracy = if args.tracy {
        tracy_client::Client::start();
        Some(tracing_tracy::TracyLayer::default().with_filter(LevelFilter::TRACE))
    } else {
        None
    };

    let subscriber = tracing_subscriber::registry()
        .with(stdout)
        .with(journald)
        .with(tracy);
    tracing::subscriber::set_global_default(subscriber)?;
    tracing_log::LogTracer::init()?;
    Ok(())
}

fn update_fps(prev: &mut Instant, history: &mut [i64], index: &mut usize) -> i64 {
    let now = Instant::now();

    let elapsed = now.duration_since(*prev);
    *prev = now;

    history[*index] = 1e9 as i64 / elapsed.as_nanos().max(1) as i64;
    *index = (*index + 1) % history.len();

    (history.iter().sum::<i64>() as f64 / history.len() as f64).round() as i64
}

/// Fills `frame` from `reader`, returning false at a clean end of stream.
fn read_frame(reader: &mut impl Read, frame: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(frame) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_tracing(&args)?;

    let input = args.input_frame()?;
    let output = args.output_frame()?;

    let mut engine = Engine::new(CmaAllocator::new()?);
    engine.configure(&EngineConfig::from(&args), input, output)?;

    let res = stream(&mut engine, &args, input, output);
    if let Err(e) = engine.teardown() {
        warn!("teardown: {e}");
    }
    res
}

fn stream(
    engine: &mut Engine<V4l2Device, CmaAllocator>,
    args: &Args,
    input: FrameFormat,
    output: FrameFormat,
) -> Result<(), Box<dyn Error>> {
    let mut reader = BufReader::new(File::open(&args.input)?);
    let mut writer = BufWriter::new(File::create(&args.output)?);

    let mut pool: Vec<DmaBuffer> = if args.dma_input {
        engine.input_pool(1)?
    } else {
        Vec::new()
    };
    let mut frame = vec![0u8; input.byte_size];
    let mut result = vec![0u8; output.byte_size];

    let mut prev = Instant::now();
    let mut history = vec![0; 30];
    let mut index = 0;
    let mut frames = 0;

    loop {
        if args.frames.is_some_and(|limit| frames >= limit) {
            break;
        }

        let source = match pool.first_mut() {
            Some(buffer) => {
                if !read_frame(&mut reader, &mut buffer.as_slice_mut()[..input.byte_size])? {
                    break;
                }
                Source::Dma(&*buffer)
            }
            None => {
                if !read_frame(&mut reader, &mut frame)? {
                    break;
                }
                Source::Memory(&frame)
            }
        };

        engine.transform(source, &mut result)?;
        writer.write_all(&result)?;
        frames += 1;

        let fps = update_fps(&mut prev, &mut history, &mut index);
        if frames % 30 == 0 {
            info!("frames: {frames} fps: {fps}");
        } else {
            debug!("frame {frames} fps: {fps}");
        }

        if let Some(client) = tracy_client::Client::running() {
            client.frame_mark();
        }
    }

    writer.flush()?;
    info!(
        "transformed {frames} frames {} -> {}",
        args.input.display(),
        args.output.display()
    );
    Ok(())
}
