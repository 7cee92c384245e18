//! Distributed LU: factorization, solves, inverse and failure reporting

mod common;

use common::*;
use proptest::prelude::*;
use tessera_core::{Error, ErrorKind, FactorKind, MatrixStatus, Options, PanelVariant, Uplo};
use tessera_linalg::{lu_factor, lu_inverse_using_factor, lu_solve, lu_solve_using_factor};

fn diagonally_dominant(n: usize, seed: u64) -> Dense<f64> {
    let r = Dense::<f64>::random(n, n, seed);
    Dense::from_fn(n, n, |i, j| if i == j { r.get(i, j) + n as f64 } else { r.get(i, j) })
}

fn solve_on(p: usize, q: usize, n: usize, nb: usize, nrhs: usize, options: Options) -> f64 {
    let a = Dense::<f64>::random(n, n, 11);
    let b = Dense::<f64>::random(n, nrhs, 12);
    let residuals = on_grid(p, q, |comm, g| {
        let mut ta = distribute(&comm, g, &a, nb, Uplo::General);
        let mut tb = distribute(&comm, g, &b, nb, Uplo::General);
        lu_solve(&comm, &mut ta, &mut tb, &options).unwrap();
        relative_residual(&a, &collect(&comm, &tb), &b)
    });
    residuals.into_iter().fold(0.0, f64::max)
}

#[test]
fn test_solve_on_single_rank() {
    assert!(solve_on(1, 1, 12, 4, 3, Options::new()) < 1e-13);
}

#[test]
fn test_solve_on_square_grid() {
    assert!(solve_on(2, 2, 13, 3, 2, Options::new()) < 1e-13);
}

#[test]
fn test_solve_on_wide_grid_with_ragged_tiles() {
    assert!(solve_on(2, 3, 17, 4, 5, Options::new()) < 1e-13);
}

#[test]
fn test_factors_reconstruct_permuted_matrix() {
    let (n, nb) = (10, 3);
    let a = Dense::<f64>::random(n, n, 21);
    let out = on_grid(2, 2, |comm, g| {
        let mut ta = distribute(&comm, g, &a, nb, Uplo::General);
        let pivots = lu_factor(&comm, &mut ta, &Options::new()).unwrap();
        assert_eq!(ta.status(), MatrixStatus::Factored(FactorKind::Lu));
        (collect(&comm, &ta), pivots.permutation())
    });
    let (lu, perm) = &out[0];
    let l = Dense::from_fn(n, n, |i, j| match i.cmp(&j) {
        std::cmp::Ordering::Greater => lu.get(i, j),
        std::cmp::Ordering::Equal => 1.0,
        std::cmp::Ordering::Less => 0.0,
    });
    let u = Dense::from_fn(n, n, |i, j| if i <= j { lu.get(i, j) } else { 0.0 });
    let pa = Dense::from_fn(n, n, |i, j| a.get(perm[i], j));
    assert_dense_close(&l.mul(&u), &pa, 1e-12, "P A = L U");

    // every rank sees the same interchanges
    assert!(out.iter().all(|(_, p)| p == perm));
}

#[test]
fn test_lookahead_depth_does_not_change_result() {
    let (n, nb) = (12, 2);
    let a = Dense::<f64>::random(n, n, 31);
    let factor = |depth: i64| {
        let options = Options::builder().lookahead(depth).build().unwrap();
        on_grid(2, 2, |comm, g| {
            let mut ta = distribute(&comm, g, &a, nb, Uplo::General);
            lu_factor(&comm, &mut ta, &options).unwrap();
            collect(&comm, &ta)
        })
        .remove(0)
    };
    let reference = factor(0);
    for depth in [1, 3] {
        assert_eq!(factor(depth), reference, "lookahead {depth}");
    }
}

#[test]
fn test_device_offload_matches_host() {
    let (n, nb) = (12, 3);
    let a = Dense::<f64>::random(n, n, 41);
    let run = |(p, q): (usize, usize), options: Options| {
        on_grid(p, q, |comm, g| {
            let mut ta = distribute(&comm, g, &a, nb, Uplo::General);
            lu_factor(&comm, &mut ta, &options).unwrap();
            collect(&comm, &ta)
        })
        .remove(0)
    };
    for grid in [(1, 1), (1, 2)] {
        for depth in [0, 1] {
            let host = run(grid, Options::builder().lookahead(depth).build().unwrap());
            for devices in [1, 2] {
                let options = Options::builder().lookahead(depth).devices(devices).build().unwrap();
                assert_eq!(run(grid, options), host, "grid {grid:?} lookahead {depth} devices {devices}");
            }
        }
    }
}

#[test]
fn test_zero_column_reports_singular_panel() {
    let (n, nb) = (8, 2);
    let mut a = diagonally_dominant(n, 51);
    for i in 0..n {
        a.set(i, 5, 0.0);
    }
    let results = on_grid(2, 2, |comm, g| {
        let mut ta = distribute(&comm, g, &a, nb, Uplo::General);
        let err = lu_factor(&comm, &mut ta, &Options::new()).unwrap_err();
        (err, ta.status())
    });
    for (err, status) in results {
        assert!(matches!(err, Error::Singular { panel: 2, index: 6 }), "{err:?}");
        assert_eq!(err.kind(), ErrorKind::Numerical);
        assert_eq!(status, MatrixStatus::Failed { panel: 2 });
    }
}

#[test]
fn test_no_pivot_variant_keeps_row_order() {
    let (n, nb) = (9, 3);
    let a = diagonally_dominant(n, 61);
    let b = Dense::<f64>::random(n, 1, 62);
    let options = Options::builder().panel_variant(PanelVariant::NoPivot).build().unwrap();
    let out = on_grid(1, 3, |comm, g| {
        let mut ta = distribute(&comm, g, &a, nb, Uplo::General);
        let mut tb = distribute(&comm, g, &b, nb, Uplo::General);
        let pivots = lu_solve(&comm, &mut ta, &mut tb, &options).unwrap();
        (pivots.is_identity(), collect(&comm, &tb))
    });
    for (identity, x) in out {
        assert!(identity);
        assert!(relative_residual(&a, &x, &b) < 1e-13);
    }
}

#[test]
fn test_solve_with_existing_factor_reuses_it() {
    let (n, nb) = (8, 4);
    let a = Dense::<f64>::random(n, n, 71);
    let b1 = Dense::<f64>::random(n, 2, 72);
    let b2 = Dense::<f64>::random(n, 3, 73);
    let out = on_grid(2, 1, |comm, g| {
        let mut ta = distribute(&comm, g, &a, nb, Uplo::General);
        let pivots = lu_factor(&comm, &mut ta, &Options::new()).unwrap();
        let mut x1 = distribute(&comm, g, &b1, nb, Uplo::General);
        let mut x2 = distribute(&comm, g, &b2, nb, Uplo::General);
        lu_solve_using_factor(&comm, &ta, &pivots, &mut x1, &Options::new()).unwrap();
        lu_solve_using_factor(&comm, &ta, &pivots, &mut x2, &Options::new()).unwrap();
        (collect(&comm, &x1), collect(&comm, &x2))
    });
    let (x1, x2) = &out[0];
    assert!(relative_residual(&a, x1, &b1) < 1e-13);
    assert!(relative_residual(&a, x2, &b2) < 1e-13);
}

#[test]
fn test_inverse_times_matrix_is_identity() {
    let (n, nb) = (10, 3);
    let a = Dense::<f64>::random(n, n, 81);
    let inverse = on_grid(2, 2, |comm, g| {
        let mut ta = distribute(&comm, g, &a, nb, Uplo::General);
        let pivots = lu_factor(&comm, &mut ta, &Options::new()).unwrap();
        lu_inverse_using_factor(&comm, &mut ta, &pivots, &Options::new()).unwrap();
        assert_eq!(ta.status(), MatrixStatus::Ready);
        collect(&comm, &ta)
    })
    .remove(0);
    assert_dense_close(&inverse.mul(&a), &Dense::identity(n), 1e-11, "A^-1 A");
}

#[test]
fn test_complex_solve() {
    let (n, nb) = (9, 2);
    let a = Dense::<C64>::random(n, n, 91);
    let b = Dense::<C64>::random(n, 2, 92);
    let x = on_grid(2, 2, |comm, g| {
        let mut ta = distribute(&comm, g, &a, nb, Uplo::General);
        let mut tb = distribute(&comm, g, &b, nb, Uplo::General);
        lu_solve(&comm, &mut ta, &mut tb, &Options::new()).unwrap();
        collect(&comm, &tb)
    })
    .remove(0);
    assert!(relative_residual(&a, &x, &b) < 1e-13);
}

#[test]
fn test_rejects_mismatched_layouts_before_communicating() {
    let a = Dense::<f64>::random(8, 8, 101);
    let b = Dense::<f64>::random(8, 1, 102);
    let errors = on_grid(1, 2, |comm, g| {
        let mut ta = distribute(&comm, g, &a, 4, Uplo::General);
        let mut tb = distribute(&comm, g, &b, 2, Uplo::General);
        lu_solve(&comm, &mut ta, &mut tb, &Options::new()).unwrap_err()
    });
    for err in errors {
        assert_eq!(err.kind(), ErrorKind::Configuration, "{err:?}");
    }
}

#[test]
fn test_solve_before_factor_is_a_usage_error() {
    let a = Dense::<f64>::random(4, 4, 111);
    let b = Dense::<f64>::random(4, 1, 112);
    let err = on_grid(1, 1, |comm, g| {
        let ta = distribute(&comm, g, &a, 2, Uplo::General);
        let mut tb = distribute(&comm, g, &b, 2, Uplo::General);
        let mut other = distribute(&comm, g, &a, 2, Uplo::General);
        let pivots = lu_factor(&comm, &mut other, &Options::new()).unwrap();
        lu_solve_using_factor(&comm, &ta, &pivots, &mut tb, &Options::new()).unwrap_err()
    })
    .remove(0);
    assert_eq!(err.kind(), ErrorKind::Usage);
}

#[test]
fn test_rejects_invalid_options() {
    assert!(Options::builder().lookahead(-1).build().is_err());
    assert!(Options::builder().tolerance(0.0).build().is_err());
    assert!(Options::builder().device_memory(0).build().is_err());
}

#[test]
fn test_tiny_device_memory_reports_out_of_memory() {
    let a = Dense::<f64>::random(8, 8, 121);
    let options = Options::builder().devices(1).device_memory(16).build().unwrap();
    let err = on_grid(1, 1, |comm, g| {
        let mut ta = distribute(&comm, g, &a, 4, Uplo::General);
        lu_factor(&comm, &mut ta, &options).unwrap_err()
    })
    .remove(0);
    assert!(matches!(err, Error::OutOfMemory { .. }), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::Resource);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_solve_any_shape(
        n in 1usize..14,
        nb in 1usize..5,
        p in 1usize..3,
        q in 1usize..3,
        seed in any::<u64>(),
    ) {
        let a = diagonally_dominant(n, seed);
        let b = Dense::<f64>::random(n, 2, seed ^ 1);
        let residuals = on_grid(p, q, |comm, g| {
            let mut ta = distribute(&comm, g, &a, nb, Uplo::General);
            let mut tb = distribute(&comm, g, &b, nb, Uplo::General);
            lu_solve(&comm, &mut ta, &mut tb, &Options::new()).unwrap();
            relative_residual(&a, &collect(&comm, &tb), &b)
        });
        for r in residuals {
            prop_assert!(r < 1e-12, "residual {}", r);
        }
    }
}
