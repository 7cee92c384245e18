//! In-process fabric: ranks as threads, links as channels
//!
//! Each endpoint owns one inbox and a sender to every peer. Sends never
//! block. Receives pull from the inbox and park messages that do not match
//! in a stash, so tag matching never reorders messages of one stream.
//!
//! Dropping an endpoint tells every peer it has hung up. A receive from a
//! rank that hung up with nothing left to deliver fails with
//! [`Error::Communication`] instead of waiting forever.

use crate::tag::Tag;
use crate::traits::Communicator;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, VecDeque};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread;
use tessera_core::{Error, Rank, Result};
use tracing::{debug, trace};

enum Envelope {
    Message {
        source: Rank,
        tag: Tag,
        payload: Vec<u8>,
    },
    HangUp {
        source: Rank,
    },
}

/// Traffic counters of one endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommStats {
    pub messages_sent: usize,
    pub bytes_sent: usize,
    pub messages_received: usize,
}

/// One rank's endpoint on a [`LocalFabric`]
pub struct LocalCommunicator {
    rank: Rank,
    peers: Vec<Sender<Envelope>>,
    inbox: Receiver<Envelope>,
    stash: RefCell<VecDeque<(Rank, Tag, Vec<u8>)>>,
    hung_up: RefCell<BTreeSet<Rank>>,
    stats: Cell<CommStats>,
}

impl LocalCommunicator {
    pub fn stats(&self) -> CommStats {
        self.stats.get()
    }

    fn take_stashed(&self, source: Rank, tag: Tag) -> Option<Vec<u8>> {
        let mut stash = self.stash.borrow_mut();
        let pos = stash.iter().position(|(s, t, _)| *s == source && *t == tag)?;
        stash.remove(pos).map(|(_, _, payload)| payload)
    }

    fn hang_up_error(&self, source: Rank, tag: Tag) -> Error {
        Error::Communication(format!(
            "Rank {} waiting on {tag} from rank {source}, which has hung up",
            self.rank
        ))
    }

    fn count_received(&self) {
        let mut stats = self.stats.get();
        stats.messages_received += 1;
        self.stats.set(stats);
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, dest: Rank, tag: Tag, payload: Vec<u8>) -> Result<()> {
        let peer = self.peers.get(dest).ok_or_else(|| {
            Error::Communication(format!("Rank {dest} outside a fabric of {}", self.peers.len()))
        })?;
        let bytes = payload.len();
        peer.send(Envelope::Message {
            source: self.rank,
            tag,
            payload,
        })
        .map_err(|_| Error::Communication(format!("Rank {dest} is no longer receiving ({tag})")))?;

        let mut stats = self.stats.get();
        stats.messages_sent += 1;
        stats.bytes_sent += bytes;
        self.stats.set(stats);
        trace!(from = self.rank, to = dest, %tag, bytes, "send");
        Ok(())
    }

    fn recv(&self, source: Rank, tag: Tag) -> Result<Vec<u8>> {
        if source >= self.peers.len() {
            return Err(Error::Communication(format!(
                "Rank {source} outside a fabric of {}",
                self.peers.len()
            )));
        }
        if let Some(payload) = self.take_stashed(source, tag) {
            self.count_received();
            return Ok(payload);
        }
        if self.hung_up.borrow().contains(&source) {
            return Err(self.hang_up_error(source, tag));
        }
        loop {
            let envelope = self
                .inbox
                .recv()
                .map_err(|_| Error::Communication(format!("Rank {} inbox closed", self.rank)))?;
            match envelope {
                Envelope::Message {
                    source: s,
                    tag: t,
                    payload,
                } => {
                    if s == source && t == tag {
                        self.count_received();
                        return Ok(payload);
                    }
                    self.stash.borrow_mut().push_back((s, t, payload));
                }
                Envelope::HangUp { source: s } => {
                    self.hung_up.borrow_mut().insert(s);
                    if s == source {
                        return Err(self.hang_up_error(source, tag));
                    }
                }
            }
        }
    }
}

impl Drop for LocalCommunicator {
    fn drop(&mut self) {
        for (dest, peer) in self.peers.iter().enumerate() {
            if dest != self.rank {
                // peers that are already gone need no notice
                let _ = peer.send(Envelope::HangUp { source: self.rank });
            }
        }
        let stash = self.stash.get_mut();
        if !stash.is_empty() {
            debug!(rank = self.rank, unread = stash.len(), "endpoint dropped with unread messages");
        }
    }
}

/// Fully connected set of in-process endpoints
pub struct LocalFabric;

impl LocalFabric {
    /// `size` connected endpoints, indexed by rank
    pub fn endpoints(size: usize) -> Vec<LocalCommunicator> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| channel()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalCommunicator {
                rank,
                peers: senders.clone(),
                inbox,
                stash: RefCell::new(VecDeque::new()),
                hung_up: RefCell::new(BTreeSet::new()),
                stats: Cell::new(CommStats::default()),
            })
            .collect()
    }

    /// Run `f` once per rank, each on its own thread, and collect the
    /// results in rank order. A panicking rank panics the caller.
    pub fn run<R, F>(size: usize, f: F) -> Result<Vec<R>>
    where
        R: Send,
        F: Fn(LocalCommunicator) -> R + Sync,
    {
        let f = &f;
        thread::scope(|s| {
            let mut handles = Vec::with_capacity(size);
            for comm in Self::endpoints(size) {
                let name = format!("rank-{}", comm.rank);
                let handle = thread::Builder::new()
                    .name(name)
                    .spawn_scoped(s, move || f(comm))
                    .map_err(|e| Error::Execution(format!("Failed to spawn rank thread: {e}")))?;
                handles.push(handle);
            }
            Ok(handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(result) => result,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect())
        })
    }
}
