//! Householder QR factorization and its uses
//!
//! Each panel is reduced on the owner of its diagonal tile to `V` (unit
//! lower reflectors) and `R`, with the compact-WY factor `T` such that the
//! panel's `Q = I - V T V^H`. Trailing columns are updated as
//! `A -= V (T^H (V^H A))`, the inner product being summed over the owners of
//! the column.

use crate::engine::{check_comm, check_square_tiles, execute_on_host, PanelAlgorithm, PanelEngine};
use crate::lu::row_group;
use crate::transfer::{broadcast_tile, gather_column};
use crate::triangular::{solve_triangular, TriangularView};
use std::collections::BTreeMap;
use std::sync::Arc;
use tessera_comm::{Channel, Collectives, Communicator, RankGroup, Tag};
use tessera_core::{
    Diag, Error, FactorKind, HostEngine, MatrixLayout, MemoryPolicy, Op, Options, PanelSlot, Rank, Result,
    Scalar, ScalarBackend, Tile, TileKernels, TiledMatrix, Uplo,
};
use tessera_device::UpdateTask;
use tracing::{debug, instrument};

/// Block reflector factors `T` of every panel, replicated on all ranks
#[derive(Debug, Clone)]
pub struct QrFactors<T: Scalar> {
    t: Vec<Tile<T>>,
    layout: MatrixLayout,
}

impl<T: Scalar> QrFactors<T> {
    /// Number of panels
    pub fn steps(&self) -> usize {
        self.t.len()
    }

    /// Upper triangular `T` of panel `k`
    pub fn t(&self, k: usize) -> Option<&Tile<T>> {
        self.t.get(k)
    }

    /// Layout of the factored matrix
    pub fn layout(&self) -> &MatrixLayout {
        &self.layout
    }
}

/// Columns of the reflector block of panel tile `i`, given the factored tile
fn reflector_tile<T: Scalar>(tile: &Tile<T>, i: usize, k: usize, width: usize) -> Tile<T> {
    let v = if i == k { tile.unit_lower() } else { tile.clone() };
    v.sub_tile(0, 0, v.rows(), width)
}

fn sum_into<T: Scalar>(acc: &mut [T], part: &[T]) {
    for (x, &y) in acc.iter_mut().zip(part) {
        *x += y;
    }
}

/// `Y = op(T) V^H C(s.., j)`, known afterwards on every owner of column `j`
/// from tile row `s` down; `None` on other ranks.
#[allow(clippy::too_many_arguments)]
fn reflector_product<'v, T, C>(
    comm: &C,
    v: impl Fn(usize) -> Option<&'v Arc<Tile<T>>>,
    t: &Tile<T>,
    op_t: Op,
    c: &TiledMatrix<T>,
    s: usize,
    j: usize,
    lane: usize,
) -> Result<Option<Arc<Tile<T>>>>
where
    T: Scalar,
    C: Communicator,
{
    let me = comm.rank();
    let group = RankGroup::new((s..c.mt()).map(|i| c.owner(i, j)));
    if !group.contains(me) {
        return Ok(None);
    }
    let width = t.rows();
    let cols = c.tile_nb(j);
    let mut w = Tile::try_zeros(width, cols)?;
    for i in s..c.mt() {
        if !c.is_local(i, j) {
            continue;
        }
        let vi = v(i).ok_or_else(|| Error::InvalidState(format!("Reflector tile {i} of panel {s} missing on rank {me}")))?;
        ScalarBackend.gemm(T::one(), Op::ConjTrans, vi, Op::NoTrans, c.tile_at(i, j)?, T::one(), &mut w);
    }

    let root = c.owner(s, j);
    let mut partial = w.to_col_major();
    comm.reduce(&mut partial, sum_into, root, &group, Tag::new(Channel::Reduce, s).with(j, lane))?;
    let y = if me == root {
        let w = Tile::from_col_major(width, cols, partial)?;
        let mut y = Tile::try_zeros(width, cols)?;
        ScalarBackend.gemm(T::one(), op_t, t, Op::NoTrans, &w, T::zero(), &mut y);
        Some(y)
    } else {
        None
    };
    let y = broadcast_tile(comm, y.as_ref(), (width, cols), root, &group, Tag::new(Channel::RowFactor, s).with(j, lane))?;
    Ok(Some(Arc::new(y)))
}

/// `C(i, j) -= V(i) Y` for the local tiles of column `j` from row `s` down
fn reflector_tasks<'v, T: Scalar>(
    v: impl Fn(usize) -> Option<&'v Arc<Tile<T>>>,
    y: &Arc<Tile<T>>,
    c: &TiledMatrix<T>,
    s: usize,
    j: usize,
) -> Result<Vec<UpdateTask<T>>> {
    let mut tasks = Vec::new();
    for i in s..c.mt() {
        if !c.is_local(i, j) {
            continue;
        }
        let vi = v(i).ok_or_else(|| Error::InvalidState(format!("Reflector tile {i} of panel {s} missing")))?;
        tasks.push(UpdateTask {
            target: (i, j),
            alpha: -T::one(),
            a: Arc::clone(vi),
            op_a: Op::NoTrans,
            b: Arc::clone(y),
            op_b: Op::NoTrans,
            beta: T::one(),
        });
    }
    Ok(tasks)
}

pub(crate) struct QrPanels<T: Scalar> {
    factored: Option<Tile<T>>,
    t: Vec<Tile<T>>,
}

impl<T: Scalar> QrPanels<T> {
    /// Reflector count of panel `k`
    fn width(a: &TiledMatrix<T>, k: usize) -> usize {
        let rows = a.m() - k * a.mb();
        rows.min(a.tile_nb(k))
    }
}

impl<T: Scalar> PanelAlgorithm<T> for QrPanels<T> {
    fn kind(&self) -> FactorKind {
        FactorKind::Qr
    }

    fn steps(&self, a: &TiledMatrix<T>) -> usize {
        a.mt().min(a.nt())
    }

    fn status_root(&self, a: &TiledMatrix<T>, k: usize) -> Rank {
        a.owner(k, k)
    }

    fn factor_local<C: Communicator>(
        &mut self,
        comm: &C,
        a: &mut TiledMatrix<T>,
        k: usize,
        _slot: &mut PanelSlot<T>,
    ) -> Result<Option<usize>> {
        let root = a.owner(k, k);
        if let Some(mut panel) = gather_column(comm, a, k, k, root, Tag::new(Channel::Tile, k))? {
            let t = ScalarBackend.geqrf(&mut panel);
            self.factored = Some(panel);
            self.t.push(t);
        }
        Ok(None)
    }

    fn share_pivots<C: Communicator>(
        &mut self,
        _comm: &C,
        _a: &mut TiledMatrix<T>,
        _k: usize,
        _slot: &mut PanelSlot<T>,
    ) -> Result<()> {
        Ok(())
    }

    fn share_panel<C: Communicator>(
        &mut self,
        comm: &C,
        a: &mut TiledMatrix<T>,
        k: usize,
        slot: &mut PanelSlot<T>,
    ) -> Result<()> {
        let me = comm.rank();
        let root = a.owner(k, k);
        let width = Self::width(a, k);

        // every rank keeps T; the root already pushed its own
        let mine = if me == root { self.t.last() } else { None };
        let t = broadcast_tile(
            comm,
            mine,
            (width, width),
            root,
            &RankGroup::all(comm.size()),
            Tag::new(Channel::Broadcast, k),
        )?;
        if me != root {
            self.t.push(t.clone());
        }
        slot.set_aux(t);

        let factored = self.factored.take();
        let mut offset = 0;
        for i in k..a.mt() {
            let shape = (a.tile_mb(i), a.tile_nb(k));
            let group = row_group(a, i, k, root);
            if group.contains(me) {
                let part = factored.as_ref().map(|p| p.sub_tile(offset, 0, shape.0, shape.1));
                let tile = broadcast_tile(comm, part.as_ref(), shape, root, &group, Tag::new(Channel::Panel, k).with(i, 0))?;
                if a.is_local(i, k) {
                    a.store_tile(i, k, &tile)?;
                }
                slot.set_tile(i, reflector_tile(&tile, i, k, width));
            }
            offset += shape.0;
        }
        Ok(())
    }

    fn prepare_column<C: Communicator>(
        &mut self,
        comm: &C,
        a: &mut TiledMatrix<T>,
        slot: &PanelSlot<T>,
        j: usize,
    ) -> Result<Vec<UpdateTask<T>>> {
        let s = slot.step();
        let t = slot
            .aux()
            .ok_or_else(|| Error::InvalidState(format!("T factor of panel {s} missing")))?;
        let Some(y) = reflector_product(comm, |i| slot.tile(i), t, Op::ConjTrans, a, s, j, 0)? else {
            return Ok(Vec::new());
        };
        reflector_tasks(|i| slot.tile(i), &y, a, s, j)
    }

    fn failure(&self, k: usize, index: usize) -> Error {
        Error::Execution(format!("QR panel {k} reported a failure at {index}"))
    }
}

/// Factor `a` in place as `A = Q R`.
///
/// `R` overwrites the upper triangle and the reflectors the strict lower
/// part. The returned factors, together with `a`, represent `Q`.
#[instrument(skip_all, fields(m = a.m(), n = a.n(), nb = a.nb(), rank = comm.rank()))]
pub fn qr_factor<T: Scalar, C: Communicator>(comm: &C, a: &mut TiledMatrix<T>, options: &Options) -> Result<QrFactors<T>> {
    check_comm(comm, a)?;
    check_square_tiles(a, "QR")?;
    if a.storage() != Uplo::General {
        return Err(Error::InvalidConfiguration(format!(
            "QR needs General storage, matrix stores {:?}",
            a.storage()
        )));
    }
    let mut alg = QrPanels { factored: None, t: Vec::new() };
    let mut engine = PanelEngine::new(comm, options)?;
    engine.run(&mut alg, a)?;
    debug!(panels = alg.t.len(), "QR done");
    Ok(QrFactors {
        t: alg.t,
        layout: *a.layout(),
    })
}

/// Overwrite `c` with `op(Q) C`, `Q` being the orthogonal factor held in `a` and `factors`.
///
/// `c` must share `a`'s row distribution. `Op::Trans` is accepted for real
/// scalars only.
#[instrument(skip_all, fields(op = ?op, nrhs = c.n(), rank = comm.rank()))]
pub fn qr_multiply_by_q<T: Scalar, C: Communicator>(
    comm: &C,
    a: &TiledMatrix<T>,
    factors: &QrFactors<T>,
    op: Op,
    c: &mut TiledMatrix<T>,
    options: &Options,
) -> Result<()> {
    check_comm(comm, a)?;
    check_comm(comm, c)?;
    a.expect_factored(FactorKind::Qr)?;
    let (al, cl) = (a.layout(), c.layout());
    if cl.m() != al.m() || cl.mb() != al.mb() || cl.grid() != al.grid() {
        return Err(Error::layout_mismatch(
            (al.m(), al.mb()),
            (cl.m(), cl.mb()),
            "rows of C vs rows of the factored matrix",
        ));
    }
    if factors.layout() != al {
        return Err(Error::layout_mismatch(
            (factors.layout().m(), factors.layout().n()),
            (al.m(), al.n()),
            "QR factors vs factored matrix",
        ));
    }
    let op_t = match op {
        Op::NoTrans => Op::NoTrans,
        Op::ConjTrans => Op::ConjTrans,
        Op::Trans if !T::IS_COMPLEX => Op::ConjTrans,
        Op::Trans => {
            return Err(Error::InvalidParameter(
                "Q^T of a complex factorization is not supported; use ConjTrans".to_string(),
            ))
        }
    };
    options.validate()?;
    let host = HostEngine::from_threads(options.host_threads())?;
    c.allocate()?;

    let me = comm.rank();
    let steps: Vec<usize> = match op_t {
        Op::NoTrans => (0..factors.steps()).rev().collect(),
        _ => (0..factors.steps()).collect(),
    };
    for k in steps {
        let t = factors
            .t(k)
            .ok_or_else(|| Error::InvalidState(format!("T factor of panel {k} missing")))?;
        let width = t.rows();

        let mut v: BTreeMap<usize, Arc<Tile<T>>> = BTreeMap::new();
        for i in k..a.mt() {
            let owner = a.owner(i, k);
            let group = RankGroup::new((0..c.nt()).map(|j| c.owner(i, j)).chain([owner]));
            if !group.contains(me) {
                continue;
            }
            let mine = if owner == me { Some(a.tile_at(i, k)?) } else { None };
            let tile = broadcast_tile(
                comm,
                mine,
                (a.tile_mb(i), a.tile_nb(k)),
                owner,
                &group,
                Tag::new(Channel::Panel, k).with(i, 2),
            )?;
            v.insert(i, Arc::new(reflector_tile(&tile, i, k, width)));
        }

        let mut tasks = Vec::new();
        for j in 0..c.nt() {
            if let Some(y) = reflector_product(comm, |i| v.get(&i), t, op_t, c, k, j, 1)? {
                tasks.extend(reflector_tasks(|i| v.get(&i), &y, c, k, j)?);
            }
        }
        execute_on_host(&host, c, tasks)?;
    }
    Ok(())
}

/// Minimum-norm residual solution of `A X ~ B` for `m >= n`, from a QR factorization.
///
/// `b` is overwritten with `Q^H B`; the returned `n x nrhs` matrix holds `X`.
#[instrument(skip_all, fields(m = a.m(), n = a.n(), nrhs = b.n(), rank = comm.rank()))]
pub fn least_squares_solve<T: Scalar, C: Communicator>(
    comm: &C,
    a: &TiledMatrix<T>,
    factors: &QrFactors<T>,
    b: &mut TiledMatrix<T>,
    options: &Options,
) -> Result<TiledMatrix<T>> {
    if a.m() < a.n() {
        return Err(Error::InvalidConfiguration(format!(
            "Least squares needs m >= n, got {}x{}",
            a.m(),
            a.n()
        )));
    }
    qr_multiply_by_q(comm, a, factors, Op::ConjTrans, b, options)?;

    let layout = MatrixLayout::new(a.n(), b.n(), b.mb(), b.nb(), b.layout().grid())?;
    let mut x = TiledMatrix::with_layout(layout, Uplo::General, b.context(), MemoryPolicy::Eager)?;
    for (i, j) in x.local_coords() {
        let (rows, cols) = (x.tile_mb(i), x.tile_nb(j));
        let head = b.tile_at(i, j)?.sub_tile(0, 0, rows, cols);
        x.store_tile(i, j, &head)?;
    }

    let host = HostEngine::from_threads(options.host_threads())?;
    let view = TriangularView {
        uplo: Uplo::Upper,
        op: Op::NoTrans,
        diag: Diag::NonUnit,
        offset: 0,
    };
    solve_triangular(comm, &host, view, a, &mut x, 0)?;
    Ok(x)
}
