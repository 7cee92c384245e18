//! Ownership and layout properties of block-cyclic tiled matrices

mod common;

use common::edge_case_shapes;
use proptest::prelude::*;
use std::collections::BTreeSet;
use tessera_core::{GridOrder, ProcessGrid, RankContext, TiledMatrix};

#[test]
fn test_every_tile_has_exactly_one_owner() {
    for (p, q) in [(1, 1), (2, 2), (2, 3), (3, 1), (1, 4)] {
        let grid = ProcessGrid::new(p, q).unwrap();
        for (m, n, nb) in edge_case_shapes() {
            let mut seen = BTreeSet::new();
            let mut total = 0;
            for rank in 0..p * q {
                let ctx = RankContext::new(rank, p * q).unwrap();
                let a = TiledMatrix::<f64>::new(m, n, nb, nb, grid, ctx).unwrap();
                for ij in a.local_coords() {
                    assert!(seen.insert(ij), "tile {ij:?} owned twice on {p}x{q}");
                    total += 1;
                }
            }
            assert_eq!(total, m.div_ceil(nb) * n.div_ceil(nb));
        }
    }
}

#[test]
fn test_tile_extents_cover_matrix() {
    for (m, n, nb) in edge_case_shapes() {
        let grid = ProcessGrid::new(1, 1).unwrap();
        let a = TiledMatrix::<f64>::new(m, n, nb, nb, grid, RankContext::single()).unwrap();
        let rows: usize = (0..a.mt()).map(|i| a.tile_mb(i)).sum();
        let cols: usize = (0..a.nt()).map(|j| a.tile_nb(j)).sum();
        assert_eq!((rows, cols), (m, n));
        for (ij, tile) in a.tiles() {
            assert_eq!(tile.rows(), a.tile_mb(ij.0));
            assert_eq!(tile.cols(), a.tile_nb(ij.1));
        }
    }
}

proptest! {
    // Property: the owner map is a pure function of the layout
    #[test]
    fn prop_owner_consistent_across_ranks(
        p in 1usize..4,
        q in 1usize..4,
        mt in 1usize..9,
        nt in 1usize..9,
        row_major in any::<bool>(),
    ) {
        let order = if row_major { GridOrder::RowMajor } else { GridOrder::ColumnMajor };
        let grid = ProcessGrid::new(p, q).unwrap().with_order(order);
        let views: Vec<TiledMatrix<f32>> = (0..p * q)
            .map(|r| {
                TiledMatrix::new(mt * 2, nt * 2, 2, 2, grid, RankContext::new(r, p * q).unwrap())
                    .unwrap()
            })
            .collect();

        for i in 0..mt {
            for j in 0..nt {
                let owner = views[0].owner(i, j);
                prop_assert!(owner < p * q);
                for view in &views {
                    prop_assert_eq!(view.owner(i, j), owner);
                    prop_assert_eq!(view.is_local(i, j), view.rank() == owner);
                }
            }
        }
    }

    // Property: ranks sharing a grid row own the same tile rows
    #[test]
    fn prop_grid_rows_share_tile_rows(p in 1usize..5, q in 1usize..5, i in 0usize..20, j in 0usize..20) {
        let grid = ProcessGrid::new(p, q).unwrap();
        let (prow, pcol) = grid.coords_of(grid.owner(i, j));
        prop_assert_eq!(prow, i % p);
        prop_assert_eq!(pcol, j % q);
    }
}
