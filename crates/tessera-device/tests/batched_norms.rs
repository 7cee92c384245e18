use approx::assert_relative_eq;
use num_complex::Complex;
use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tessera_core::{ErrorKind, Norm, Tile, Uplo};
use tessera_device::{reduce_norm, tile_norm, Device, DeviceConfig, DeviceTile, Queue, SumSq};

fn device(memory_bytes: usize) -> (Device, Queue) {
    let device = Device::new(
        0,
        DeviceConfig {
            memory_bytes,
            execution_units: 3,
        },
    )
    .unwrap();
    let queue = Queue::new(&device).unwrap();
    (device, queue)
}

fn random_tiles(count: usize, n: usize, seed: u64) -> Vec<Tile<Complex<f64>>> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let values: Vec<_> = (0..n * n)
                .map(|_| Complex::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)))
                .collect();
            Tile::from_col_major(n, n, values).unwrap()
        })
        .collect()
}

/// Upload tiles into buffers with a padded leading dimension
fn upload_padded(device: &Device, tiles: &[Tile<Complex<f64>>], lda: usize) -> Vec<tessera_device::DeviceBuffer<Complex<f64>>> {
    tiles
        .iter()
        .map(|t| {
            let mut padded = vec![Complex::new(f64::NAN, 0.0); lda * t.cols()];
            for j in 0..t.cols() {
                padded[j * lda..j * lda + t.rows()].copy_from_slice(t.col(j));
            }
            device.upload(&padded).unwrap()
        })
        .collect()
}

#[test]
fn test_device_results_equal_host_for_every_norm() {
    let (dev, queue) = device(1 << 20);
    let n = 7;
    let lda = 9;
    let tiles = random_tiles(5, n, 11);
    let buffers = upload_padded(&dev, &tiles, lda);

    for uplo in [Uplo::General, Uplo::Lower, Uplo::Upper] {
        for norm in [Norm::Max, Norm::One, Norm::Inf, Norm::Fro] {
            let ldv = n + 1;
            let values = dev.alloc::<f64>(tiles.len() * ldv).unwrap();
            reduce_norm(&queue, norm, uplo, n, n, &buffers, lda, &values, ldv, tiles.len()).unwrap();
            queue.sync().unwrap();
            let got = values.to_vec().unwrap();
            for (k, tile) in tiles.iter().enumerate() {
                let host = tile_norm(norm, uplo, tile).unwrap();
                assert_eq!(&got[k * ldv..k * ldv + host.len()], host.as_slice(), "{norm:?} {uplo:?} tile {k}");
            }
        }
    }
}

#[test]
fn test_max_writes_each_tile_slot() {
    let (dev, queue) = device(1 << 16);
    let tiles: Vec<Tile<f64>> = vec![
        Tile::from_fn(3, 3, |i, j| if (i, j) == (2, 0) { -9.0 } else { 1.0 }),
        Tile::from_fn(3, 3, |_, _| 0.5),
        Tile::from_fn(3, 3, |i, j| if i == j { 4.0 } else { 0.0 }),
    ];
    let buffers: Vec<_> = tiles.iter().map(|t| DeviceTile::upload(&dev, t).unwrap().buffer).collect();
    let values = dev.alloc::<f64>(3).unwrap();
    reduce_norm(&queue, Norm::Max, Uplo::Lower, 3, 3, &buffers, 3, &values, 1, 3).unwrap();
    queue.sync().unwrap();
    assert_eq!(values.to_vec().unwrap(), vec![9.0, 0.5, 4.0]);
}

#[test]
fn test_zero_order_and_zero_batch() {
    let (dev, queue) = device(1 << 16);
    let buffers = vec![dev.alloc::<f64>(0).unwrap(); 2];
    let values = dev.upload(&[7.0f64, 7.0, 7.0, 7.0]).unwrap();
    reduce_norm(&queue, Norm::Fro, Uplo::Lower, 0, 0, &buffers, 1, &values, 2, 2).unwrap();
    queue.sync().unwrap();
    assert_eq!(values.to_vec().unwrap(), vec![0.0; 4]);

    let untouched = dev.upload(&[7.0f64]).unwrap();
    reduce_norm::<f64>(&queue, Norm::Max, Uplo::General, 3, 3, &[], 3, &untouched, 1, 0).unwrap();
    queue.sync().unwrap();
    assert_eq!(untouched.to_vec().unwrap(), vec![7.0]);
}

#[test]
fn test_bad_arguments_are_configuration_errors() {
    let (dev, queue) = device(1 << 16);
    let buffers = vec![dev.alloc::<f64>(9).unwrap()];
    let values = dev.alloc::<f64>(4).unwrap();
    let err = reduce_norm(&queue, Norm::One, Uplo::General, 3, 3, &buffers, 2, &values, 3, 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    let err = reduce_norm(&queue, Norm::One, Uplo::General, 3, 3, &buffers, 3, &values, 2, 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    let err = reduce_norm(&queue, Norm::Fro, Uplo::Lower, 3, 2, &buffers, 3, &values, 2, 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn test_fro_of_hermitian_tile() {
    let full = Tile::from_fn(4, 4, |i, j| if i == j { 2.0 } else { 1.0 });
    let pair = tile_norm(Norm::Fro, Uplo::Lower, &full).unwrap();
    // 4 diagonal 2s and 12 off-diagonal 1s
    assert_relative_eq!(SumSq::from_pair([pair[0], pair[1]]).value(), 28f64.sqrt(), max_relative = 1e-14);
}

proptest! {
    #[test]
    fn prop_sumsq_merge_order_does_not_matter(values in prop::collection::vec(1e-150f64..1e150, 1..40), split in 0usize..40) {
        let split = split.min(values.len());
        let mut direct = SumSq::new();
        values.iter().for_each(|&v| direct.add(v));

        let (left, right) = values.split_at(split);
        let mut l = SumSq::new();
        left.iter().for_each(|&v| l.add(v));
        let mut r = SumSq::new();
        right.iter().for_each(|&v| r.add(v));

        let mut lr = l;
        lr.merge(r);
        let mut rl = r;
        rl.merge(l);

        prop_assert!((lr.value() - direct.value()).abs() <= 1e-12 * direct.value());
        prop_assert!((rl.value() - direct.value()).abs() <= 1e-12 * direct.value());
    }

    #[test]
    fn prop_max_is_true_maximum(values in prop::collection::vec(-1e3f64..1e3, 9)) {
        let tile = Tile::from_col_major(3, 3, values.clone()).unwrap();
        let expected = values.iter().fold(0.0f64, |m, v| m.max(v.abs()));
        prop_assert_eq!(tile_norm(Norm::Max, Uplo::General, &tile).unwrap()[0], expected);
    }
}
