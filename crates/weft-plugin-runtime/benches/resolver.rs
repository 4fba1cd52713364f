// Dependency resolution benchmarks
//
// Run with: cargo bench -p weft-plugin-runtime --bench resolver

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use weft_plugin_api::{DependencyDescriptor, PluginMetadata, Version};
use weft_plugin_runtime::DependencyResolver;

// Layered graph: every plugin in layer n requires two plugins from layer n - 1
fn layered_graph(plugins: usize, width: usize) -> DependencyResolver {
    let mut resolver = DependencyResolver::new();
    for i in 0..plugins {
        let mut metadata = PluginMetadata::new(format!("plugin-{i}"), Version::new(1, 0, 0))
            .with_priority((i % 7) as i32 * 10);
        if i >= width {
            let layer_start = (i / width - 1) * width;
            metadata = metadata
                .with_dependency(DependencyDescriptor::required(format!(
                    "plugin-{}",
                    layer_start + i % width
                )))
                .with_dependency(
                    DependencyDescriptor::required(format!(
                        "plugin-{}",
                        layer_start + (i + 1) % width
                    ))
                    .at_least(Version::new(1, 0, 0))
                    .below(Version::new(2, 0, 0)),
                );
        }
        resolver.add_plugin(&metadata);
    }
    resolver
}

fn benchmark_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve");

    for size in [10, 100, 1000].iter() {
        let resolver = layered_graph(*size, 10);
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| black_box(resolver.resolve().unwrap()));
        });
    }

    group.finish();
}

fn benchmark_dependents_closure(c: &mut Criterion) {
    let resolver = layered_graph(500, 10);

    c.bench_function("dependents_closure_root", |b| {
        b.iter(|| {
            let closure = resolver.dependents_closure(black_box("plugin-0"));
            black_box(resolver.order_subset(&closure))
        });
    });
}

criterion_group!(benches, benchmark_resolve, benchmark_dependents_closure);
criterion_main!(benches);
