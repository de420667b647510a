use criterion::{criterion_group, criterion_main, Criterion};
use edgefirst_transform::{
    dma::CmaAllocator,
    engine::{Engine, EngineConfig, Source},
    format::{FrameFormat, PixelLayout},
};

pub fn benchmark_transform(c: &mut Criterion) {
    let outputs = [
        PixelLayout::Nv12,
        PixelLayout::Uyvy,
        PixelLayout::Rgb,
        PixelLayout::Xrgb,
    ];
    let dims = [(640, 480), (1280, 720), (1920, 1080)];

    for input_layout in PixelLayout::INPUTS.iter() {
        let mut group = c.benchmark_group(format!("transform/{}", input_layout));
        for output_layout in outputs.iter() {
            for dim in dims.iter() {
                let input = FrameFormat::new(dim.0, dim.1, *input_layout).unwrap();
                let output = FrameFormat::new(dim.0, dim.1, *output_layout).unwrap();

                let mut engine = Engine::new(CmaAllocator::new().unwrap());
                engine
                    .configure(&EngineConfig::default(), input, output)
                    .unwrap();

                let mut pool = engine.input_pool(1).unwrap();
                pool[0].as_slice_mut().fill(0x80);
                let frame = vec![0x80u8; input.byte_size];
                let mut result = vec![0u8; output.byte_size];

                group.bench_function(
                    format!("{}x{}-{}-memory", dim.0, dim.1, output_layout),
                    |b| b.iter(|| engine.transform(Source::Memory(&frame), &mut result)),
                );
                group.bench_function(
                    format!("{}x{}-{}-dma", dim.0, dim.1, output_layout),
                    |b| b.iter(|| engine.transform(Source::Dma(&pool[0]), &mut result)),
                );

                drop(pool);
                engine.teardown().unwrap();
            }
        }
        group.finish();
    }
}

criterion_group!(benches, benchmark_transform);
criterion_main!(benches);
