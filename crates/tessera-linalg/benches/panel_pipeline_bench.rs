//! Benchmarks for the lookahead panel pipeline on an in-process fabric

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tessera_comm::{Communicator, LocalFabric};
use tessera_core::{Options, ProcessGrid, TiledMatrix, Uplo};
use tessera_linalg::{cholesky_factor, lu_factor, norm};

/// Deterministic, diagonally dominant matrix entry
fn entry(n: usize, i: usize, j: usize) -> f64 {
    let v = ((i * 31 + j * 17) % 13) as f64 * 0.1 - 0.6;
    if i == j {
        v.abs() + n as f64
    } else {
        v
    }
}

fn hpd_entry(n: usize, i: usize, j: usize) -> f64 {
    let (r, c) = if i >= j { (i, j) } else { (j, i) };
    entry(n, r, c)
}

fn bench_lu_lookahead(c: &mut Criterion) {
    let mut group = c.benchmark_group("lu_lookahead");
    group.sample_size(10);
    let (n, nb) = (384usize, 48usize);
    let grid = ProcessGrid::new(2, 2).unwrap();

    for &depth in &[0i64, 1, 2] {
        let options = Options::builder().lookahead(depth).build().unwrap();
        group.bench_with_input(BenchmarkId::new("2x2", depth), &depth, |bench, _| {
            bench.iter(|| {
                LocalFabric::run(grid.size(), |comm| {
                    let mut a = TiledMatrix::<f64>::new(n, n, nb, nb, grid, comm.context())?;
                    a.fill_with(|i, j| entry(n, i, j))?;
                    lu_factor(&comm, &mut a, &options).map(|p| black_box(p.len()))
                })
                .unwrap()
            });
        });
    }
    group.finish();
}

fn bench_cholesky_offload(c: &mut Criterion) {
    let mut group = c.benchmark_group("cholesky_offload");
    group.sample_size(10);
    let (n, nb) = (384usize, 48usize);
    let grid = ProcessGrid::new(2, 1).unwrap();

    for &devices in &[0i64, 2] {
        let options = Options::builder().devices(devices).build().unwrap();
        group.bench_with_input(BenchmarkId::new("devices", devices), &devices, |bench, _| {
            bench.iter(|| {
                LocalFabric::run(grid.size(), |comm| {
                    let mut a = TiledMatrix::<f64>::builder(n, n)
                        .tile_size(nb, nb)
                        .grid(grid)
                        .storage(Uplo::Lower)
                        .build(comm.context())?;
                    a.fill_with(|i, j| hpd_entry(n, i, j))?;
                    cholesky_factor(&comm, &mut a, &options)
                })
                .unwrap()
            });
        });
    }
    group.finish();
}

fn bench_norms(c: &mut Criterion) {
    let mut group = c.benchmark_group("norm");
    let (n, nb) = (512usize, 64usize);
    let grid = ProcessGrid::new(2, 2).unwrap();

    for kind in [tessera_core::Norm::One, tessera_core::Norm::Fro] {
        group.bench_with_input(BenchmarkId::new("2x2", format!("{kind:?}")), &kind, |bench, &kind| {
            bench.iter(|| {
                LocalFabric::run(grid.size(), |comm| {
                    let mut a = TiledMatrix::<f64>::new(n, n, nb, nb, grid, comm.context())?;
                    a.fill_with(|i, j| entry(n, i, j))?;
                    norm(&comm, kind, &a, &Options::new()).map(black_box)
                })
                .unwrap()
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_lu_lookahead, bench_cholesky_offload, bench_norms);
criterion_main!(benches);
