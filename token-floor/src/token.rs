//! The circulating floor permit.
//!
//! Exactly one live token exists across the session. It carries the FIFO
//! wait queue and the per-peer granted-sequence vector, and it moves between
//! peers only in its validated wire form.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::TokenError;
use crate::traits::PeerId;

/// The mutual-exclusion permit: whoever holds it may use the floor.
///
/// The queue is bounded by the peer count fixed at creation. Enqueueing does
/// not suppress duplicates; protocol call sites check [`Token::contains`]
/// before inserting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Token<P> {
    peer_count: usize,
    queue: VecDeque<P>,
    granted: BTreeMap<P, u64>,
}

impl<P: PeerId> Token<P> {
    /// Create the session's initial token for the given roster.
    ///
    /// Every peer's granted sequence starts at 0; the queue starts empty with
    /// capacity equal to the roster size.
    #[must_use]
    pub fn new(roster: &[P]) -> Self {
        Self {
            peer_count: roster.len(),
            queue: VecDeque::with_capacity(roster.len()),
            granted: roster.iter().cloned().map(|peer| (peer, 0)).collect(),
        }
    }

    /// Number of peers the token was created for; also the queue capacity.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peer_count
    }

    /// Current wait-queue length.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Whether `peer` is waiting in the queue.
    #[must_use]
    pub fn contains(&self, peer: &P) -> bool {
        self.queue.contains(peer)
    }

    /// Append `peer` to the wait queue.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::QueueFull`] when the queue already holds
    /// `peer_count` entries; the caller logs and drops the request.
    pub fn enqueue(&mut self, peer: P) -> Result<(), TokenError> {
        if self.queue.len() >= self.peer_count {
            return Err(TokenError::QueueFull {
                capacity: self.peer_count,
            });
        }
        self.queue.push_back(peer);
        Ok(())
    }

    /// Remove and return the head of the wait queue.
    pub fn dequeue(&mut self) -> Option<P> {
        self.queue.pop_front()
    }

    /// The highest request sequence number of `peer` already satisfied, or
    /// `None` for a peer outside the token's roster — callers treat `None`
    /// as a protocol error, never as zero.
    #[must_use]
    pub fn granted(&self, peer: &P) -> Option<u64> {
        self.granted.get(peer).copied()
    }

    /// Record that `peer`'s request `seq` has been satisfied.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::UnknownPeer`] for peers outside the token's
    /// roster and [`TokenError::NonMonotonicGrant`] when `seq` would move the
    /// entry backwards.
    pub fn set_granted(&mut self, peer: &P, seq: u64) -> Result<(), TokenError> {
        let entry = self.granted.get_mut(peer).ok_or(TokenError::UnknownPeer)?;
        if seq < *entry {
            return Err(TokenError::NonMonotonicGrant {
                current: *entry,
                proposed: seq,
            });
        }
        *entry = seq;
        Ok(())
    }

    /// Serialize into the wire form for handoff to another peer.
    #[must_use]
    pub fn to_wire(&self) -> TokenWire<P> {
        TokenWire {
            peer_count: self.peer_count,
            queue: self.queue.iter().cloned().collect(),
            granted: self
                .granted
                .iter()
                .map(|(peer, seq)| (peer.clone(), *seq))
                .collect(),
        }
    }

    /// Consume the token into its wire form. Used on the sending side of a
    /// handoff, after which the sender holds nothing.
    #[must_use]
    pub fn into_wire(self) -> TokenWire<P> {
        TokenWire {
            peer_count: self.peer_count,
            queue: self.queue.into(),
            granted: self.granted.into_iter().collect(),
        }
    }

    /// Reconstitute a token from its wire form, validating it against the
    /// local roster.
    ///
    /// # Errors
    ///
    /// Rejects payloads whose queue is longer than the declared peer count,
    /// whose granted vector repeats a peer, or whose granted vector omits a
    /// peer present in `roster`. On error the caller keeps its prior state.
    pub fn from_wire(wire: TokenWire<P>, roster: &[P]) -> Result<Self, TokenError> {
        if wire.queue.len() > wire.peer_count {
            return Err(TokenError::QueueExceedsPeerCount {
                queue_len: wire.queue.len(),
                peer_count: wire.peer_count,
            });
        }

        let mut granted = BTreeMap::new();
        for (peer, seq) in wire.granted {
            if granted.insert(peer, seq).is_some() {
                return Err(TokenError::DuplicateGrantEntry);
            }
        }
        if roster.iter().any(|peer| !granted.contains_key(peer)) {
            return Err(TokenError::MissingGrantEntry);
        }

        Ok(Self {
            peer_count: wire.peer_count,
            queue: wire.queue.into(),
            granted,
        })
    }
}

/// Wire form of a [`Token`], exchanged inside a
/// [`FloorMessage::Response`](crate::FloorMessage::Response).
///
/// Queue order is preserved exactly; the granted vector is an ordered list of
/// `(peer, sequence)` pairs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(bound(serialize = "P: Serialize", deserialize = "P: Deserialize<'de>"))]
pub struct TokenWire<P> {
    /// Number of peers the token was created for.
    pub peer_count: usize,
    /// The wait queue, head first.
    pub queue: Vec<P>,
    /// Granted-sequence entries, one per roster peer.
    pub granted: Vec<(P, u64)>,
}
