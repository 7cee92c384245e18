//! Communicator trait and tree collectives
//!
//! A [`Communicator`] only knows how to move byte payloads between ranks.
//! Everything typed or collective is layered on top by [`Collectives`],
//! which is implemented for every communicator. Collectives run over a
//! [`RankGroup`]; ranks outside the group simply do not call them.
//!
//! # Trees
//!
//! Broadcast and reduce use a binary tree over the group, rooted at the
//! issuing rank: position `p` in [`RankGroup::tree_order`] has children
//! `2p + 1` and `2p + 2`. Reductions combine children in that fixed order,
//! so a reduction over the same group and root is bitwise reproducible.

use crate::tag::Tag;
use bytemuck::Pod;
use tessera_core::{Error, Rank, RankContext, Result};
use tracing::trace;

/// Point-to-point message passing between ranks
pub trait Communicator: Send {
    fn rank(&self) -> Rank;

    fn size(&self) -> usize;

    /// Buffered send; returns without waiting for the receiver
    fn send(&self, dest: Rank, tag: Tag, payload: Vec<u8>) -> Result<()>;

    /// Blocking receive of the next message from `source` carrying `tag`.
    ///
    /// Messages from one source with the same tag arrive in issue order.
    fn recv(&self, source: Rank, tag: Tag) -> Result<Vec<u8>>;

    fn context(&self) -> RankContext {
        RankContext {
            rank: self.rank(),
            size: self.size(),
        }
    }
}

/// Sorted set of ranks taking part in a collective
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RankGroup {
    ranks: Vec<Rank>,
}

impl RankGroup {
    pub fn new(ranks: impl IntoIterator<Item = Rank>) -> Self {
        let mut ranks: Vec<Rank> = ranks.into_iter().collect();
        ranks.sort_unstable();
        ranks.dedup();
        Self { ranks }
    }

    /// Every rank of a communicator of `size`
    pub fn all(size: usize) -> Self {
        Self {
            ranks: (0..size).collect(),
        }
    }

    pub fn single(rank: Rank) -> Self {
        Self { ranks: vec![rank] }
    }

    #[inline]
    pub fn ranks(&self) -> &[Rank] {
        &self.ranks
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }

    #[inline]
    pub fn contains(&self, rank: Rank) -> bool {
        self.ranks.binary_search(&rank).is_ok()
    }

    /// Lowest rank of the group
    pub fn first(&self) -> Option<Rank> {
        self.ranks.first().copied()
    }

    /// Group with `rank` added
    pub fn with(&self, rank: Rank) -> Self {
        Self::new(self.ranks.iter().copied().chain(std::iter::once(rank)))
    }

    /// Root first, then the other members in ascending order
    pub fn tree_order(&self, root: Rank) -> Result<Vec<Rank>> {
        if !self.contains(root) {
            return Err(Error::InvalidParameter(format!(
                "Root {root} is not a member of group {:?}",
                self.ranks
            )));
        }
        let mut order = Vec::with_capacity(self.len());
        order.push(root);
        order.extend(self.ranks.iter().copied().filter(|&r| r != root));
        Ok(order)
    }
}

/// Position of `rank` in the tree, with its parent and children
struct TreeNode {
    parent: Option<Rank>,
    children: Vec<Rank>,
}

fn tree_node(group: &RankGroup, root: Rank, rank: Rank) -> Result<TreeNode> {
    let order = group.tree_order(root)?;
    let p = order.iter().position(|&r| r == rank).ok_or_else(|| {
        Error::InvalidParameter(format!("Rank {rank} is not a member of group {:?}", group.ranks()))
    })?;
    let parent = if p == 0 { None } else { Some(order[(p - 1) / 2]) };
    let children = [2 * p + 1, 2 * p + 2]
        .into_iter()
        .filter_map(|c| order.get(c).copied())
        .collect();
    Ok(TreeNode { parent, children })
}

/// Typed and collective operations on top of a [`Communicator`]
pub trait Collectives: Communicator {
    /// Send a slice of plain-old-data values
    fn send_slice<T: Pod>(&self, dest: Rank, tag: Tag, data: &[T]) -> Result<()> {
        self.send(dest, tag, bytemuck::cast_slice::<T, u8>(data).to_vec())
    }

    /// Receive a vector of plain-old-data values
    fn recv_vec<T: Pod>(&self, source: Rank, tag: Tag) -> Result<Vec<T>> {
        let bytes = self.recv(source, tag)?;
        let size = std::mem::size_of::<T>();
        if size != 0 && bytes.len() % size != 0 {
            return Err(Error::Communication(format!(
                "Payload of {} bytes from rank {source} ({tag}) is not a whole number of {size}-byte values",
                bytes.len()
            )));
        }
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    /// Receive exactly `len` values
    fn recv_exact<T: Pod>(&self, source: Rank, tag: Tag, len: usize) -> Result<Vec<T>> {
        let values = self.recv_vec::<T>(source, tag)?;
        if values.len() != len {
            return Err(Error::Communication(format!(
                "Expected {len} values from rank {source} ({tag}), received {}",
                values.len()
            )));
        }
        Ok(values)
    }

    /// Replace `data` on every group member with the root's copy
    fn broadcast<T: Pod>(&self, data: &mut Vec<T>, root: Rank, group: &RankGroup, tag: Tag) -> Result<()> {
        let node = tree_node(group, root, self.rank())?;
        if let Some(parent) = node.parent {
            *data = self.recv_vec(parent, tag)?;
        }
        for &child in &node.children {
            self.send_slice(child, tag, data)?;
        }
        trace!(rank = self.rank(), root, %tag, len = data.len(), "broadcast");
        Ok(())
    }

    /// Fold every member's `data` into the root's with `combine(acc, other)`.
    ///
    /// Non-root members are left holding a partial result.
    fn reduce<T, F>(&self, data: &mut [T], combine: F, root: Rank, group: &RankGroup, tag: Tag) -> Result<()>
    where
        T: Pod,
        F: Fn(&mut [T], &[T]),
    {
        let node = tree_node(group, root, self.rank())?;
        for &child in &node.children {
            let part = self.recv_exact::<T>(child, tag, data.len())?;
            combine(data, &part);
        }
        if let Some(parent) = node.parent {
            self.send_slice(parent, tag, data)?;
        }
        trace!(rank = self.rank(), root, %tag, len = data.len(), "reduce");
        Ok(())
    }

    /// Reduce to the lowest member, then broadcast the result to all
    fn all_reduce<T, F>(&self, data: &mut [T], combine: F, group: &RankGroup, tag: Tag) -> Result<()>
    where
        T: Pod,
        F: Fn(&mut [T], &[T]),
    {
        let root = group
            .first()
            .ok_or_else(|| Error::InvalidParameter("all_reduce over an empty group".to_string()))?;
        self.reduce(data, combine, root, group, tag)?;
        let mut result = data.to_vec();
        self.broadcast(&mut result, root, group, tag)?;
        if result.len() != data.len() {
            return Err(Error::size_mismatch(data.len(), result.len(), "all_reduce"));
        }
        data.copy_from_slice(&result);
        Ok(())
    }

    /// Return only once every member has entered the barrier
    fn barrier(&self, group: &RankGroup, tag: Tag) -> Result<()> {
        let mut token = [0u8; 1];
        self.all_reduce(&mut token, |_, _| {}, group, tag)
    }

    /// Collect every member's `data` on `root`, in group order
    fn gather_to<T: Pod>(&self, data: &[T], root: Rank, group: &RankGroup, tag: Tag) -> Result<Option<Vec<Vec<T>>>> {
        let me = self.rank();
        if !group.contains(me) {
            return Err(Error::InvalidParameter(format!(
                "Rank {me} is not a member of group {:?}",
                group.ranks()
            )));
        }
        if me != root {
            self.send_slice(root, tag, data)?;
            return Ok(None);
        }
        group
            .ranks()
            .iter()
            .map(|&r| if r == me { Ok(data.to_vec()) } else { self.recv_vec(r, tag) })
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }
}

impl<C: Communicator + ?Sized> Collectives for C {}
