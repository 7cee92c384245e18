//! Communication layer for distributed tiled linear algebra
//!
//! Ranks exchange byte payloads through a [`Communicator`]; typed messages
//! and tree collectives come from the [`Collectives`] extension trait.
//! [`LocalFabric`] runs a whole process grid inside one process, one thread
//! per rank.
//!
//! # Example
//!
//! ```rust
//! use tessera_comm::{Channel, Collectives, Communicator, LocalFabric, RankGroup, Tag};
//!
//! let sums = LocalFabric::run(3, |comm| {
//!     let mut value = [comm.rank() as f64 + 1.0];
//!     let group = RankGroup::all(comm.size());
//!     comm.all_reduce(&mut value, |acc, x| acc[0] += x[0], &group, Tag::new(Channel::Reduce, 0))
//!         .map(|_| value[0])
//! })
//! .unwrap();
//! assert!(sums.iter().all(|s| *s.as_ref().unwrap() == 6.0));
//! ```

pub mod local;
pub mod tag;
pub mod traits;

pub use local::{CommStats, LocalCommunicator, LocalFabric};
pub use tag::{Channel, Tag};
pub use traits::{Collectives, Communicator, RankGroup};
