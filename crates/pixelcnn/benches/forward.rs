use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use layers::{activations::ActivationKind, norm::NormKind};
use pixelcnn::{KernelSize, PixelCnn, PixelCnnConfig, SpatialNdims};

fn bench_forward(c: &mut Criterion) {
    let device = Device::Cpu;
    let batch = 2usize;
    let stage_counts = &[1usize, 4];
    let grids: &[(SpatialNdims, Vec<usize>)] = &[
        (SpatialNdims::D1, vec![256]),
        (SpatialNdims::D2, vec![16, 16]),
        (SpatialNdims::D3, vec![4, 8, 8]),
    ];

    for (ndims, spatial) in grids {
        let mut group = c.benchmark_group(format!("pixelcnn/{ndims}"));
        for &num_stages in stage_counts {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
            let config = PixelCnnConfig {
                spatial_ndims: *ndims,
                in_channels: 3,
                hidden_channels: 16,
                kernel_size: KernelSize::Uniform(3),
                num_stages,
                activation: Some(ActivationKind::LeakyRelu { slope: 0.1 }),
                normalizer: Some(NormKind::LayerNorm),
                gated: true,
                ..Default::default()
            };
            let network = PixelCnn::from_config(&config, vb).expect("network");

            let mut shape = vec![batch, 3];
            shape.extend_from_slice(spatial);
            let input = Tensor::randn(0f32, 1.0, shape, &device).expect("input");
            let positions: usize = spatial.iter().product();
            group.throughput(Throughput::Elements((batch * positions) as u64));

            group.bench_with_input(
                BenchmarkId::new("stages", num_stages),
                &(network, input),
                |b, (network, input)| {
                    b.iter(|| {
                        let out = network.forward(black_box(input), &[]).expect("forward");
                        black_box(out);
                    });
                },
            );
        }
        group.finish();
    }
}

criterion_group!(benches, bench_forward);
criterion_main!(benches);
