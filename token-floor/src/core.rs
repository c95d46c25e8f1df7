//! Pure state machine for the floor mutex — no I/O, no async.
//!
//! All protocol decisions live here: the request-sequence vector, the
//! possession state, the grant check and the release algorithm. The async
//! [`Coordinator`](crate::Coordinator) and the model-checker tests both
//! drive this exact type, so the checked transitions are the shipped ones.

use std::collections::BTreeMap;

use tracing::{trace, warn};

use crate::error::ProtocolError;
use crate::token::{Token, TokenWire};
use crate::traits::PeerId;

/// Per-node protocol state for one session participant.
///
/// One value per peer process. All mutation happens inside a single event
/// handler at a time; concurrency exists only across peers, through the
/// messages this state machine tells its caller to send.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MutexCore<P> {
    node: P,
    roster: Vec<P>,
    /// RN: this node's latest known request sequence number per peer.
    request_seq: BTreeMap<P, u64>,
    token: Option<Token<P>>,
    /// A request has been broadcast and no grant has arrived yet.
    pending_request: bool,
    /// The floor is actively in use by this node.
    busy: bool,
}

/// Result of a local "want the floor" transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FloorRequest {
    /// Not holding: broadcast `Request { seq }` to every other peer.
    Broadcast {
        /// Freshly incremented own request sequence number.
        seq: u64,
    },
    /// Already holding the token; the floor is usable immediately.
    AlreadyHolding,
    /// A request is already outstanding; nothing is rebroadcast.
    Pending,
}

/// Result of the grant check against one inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantResult<P> {
    /// The request is exactly next in sequence: the token has been detached
    /// and must be sent to the requester.
    Granted {
        /// Serialized token for the wire.
        token: TokenWire<P>,
    },
    /// The sequence number is not newer than what is already known.
    Stale,
    /// Valid request, recorded, but not yet next; a later release pass
    /// serves it.
    NotNext,
}

/// Result of handling an inbound request in any possession state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome<P> {
    /// Holding and idle, request was next: send this token to the requester.
    Granted {
        /// Serialized token for the wire.
        token: TokenWire<P>,
    },
    /// Holding and busy: requester appended to the wait queue.
    Queued,
    /// Holding and busy: requester was already waiting; nothing appended.
    AlreadyQueued,
    /// Holding and busy: queue at capacity, request dropped.
    QueueFull,
    /// Not holding: sequence number recorded for a future grant check.
    Recorded,
    /// Holding and idle: recorded but not next in sequence.
    NotNext,
    /// Not newer than what is already known; ignored without state change.
    Stale,
}

/// Result of the release algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseResult<P> {
    /// Send the token to the popped head of the queue.
    Forward {
        /// Next holder.
        to: P,
        /// Serialized token for the wire.
        token: TokenWire<P>,
    },
    /// No one is waiting; the token stays here.
    Kept,
}

impl<P: PeerId> MutexCore<P> {
    /// Build the state machine for a fixed session roster.
    ///
    /// The first peer of the ordered roster starts with the token; everyone
    /// else starts empty-handed. Request sequence numbers start at 0 for all
    /// peers.
    ///
    /// # Errors
    ///
    /// Rejects an empty roster, a roster with duplicate entries, and a
    /// `node` that is not part of the roster.
    pub fn new(roster: Vec<P>, node: P) -> Result<Self, ProtocolError<P>> {
        let Some(first) = roster.first() else {
            return Err(ProtocolError::InvalidRoster("roster is empty"));
        };
        let request_seq: BTreeMap<P, u64> =
            roster.iter().cloned().map(|peer| (peer, 0)).collect();
        if request_seq.len() != roster.len() {
            return Err(ProtocolError::InvalidRoster("roster repeats a peer"));
        }
        if !request_seq.contains_key(&node) {
            return Err(ProtocolError::UnknownPeer(node));
        }

        let token = (node == *first).then(|| Token::new(&roster));
        Ok(Self {
            node,
            roster,
            request_seq,
            token,
            pending_request: false,
            busy: false,
        })
    }

    /// This node's identifier.
    #[must_use]
    pub fn node(&self) -> &P {
        &self.node
    }

    /// The fixed, ordered session roster.
    #[must_use]
    pub fn roster(&self) -> &[P] {
        &self.roster
    }

    /// Whether this node currently holds the token.
    #[must_use]
    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// Read access to the held token, if any.
    #[must_use]
    pub fn token(&self) -> Option<&Token<P>> {
        self.token.as_ref()
    }

    /// Whether the floor is actively in use by this node.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Mark the floor in use / no longer in use.
    pub fn set_busy(&mut self, busy: bool) {
        self.busy = busy;
    }

    /// Whether a broadcast request is still awaiting a grant.
    #[must_use]
    pub fn pending_request(&self) -> bool {
        self.pending_request
    }

    /// This node's latest known request sequence number for `peer`.
    #[must_use]
    pub fn request_seq(&self, peer: &P) -> Option<u64> {
        self.request_seq.get(peer).copied()
    }

    /// Strictly increment this node's own request sequence number and return
    /// the new value — the number broadcast in the request message.
    pub fn access_critical_section(&mut self) -> u64 {
        let seq = self.request_seq.entry(self.node.clone()).or_insert(0);
        *seq += 1;
        *seq
    }

    /// Local "want the floor" transition.
    ///
    /// Holding already makes the floor usable at once; an outstanding request
    /// suppresses rebroadcast storms; otherwise the own sequence number is
    /// incremented and handed back for broadcast.
    pub fn request_floor(&mut self) -> FloorRequest {
        if self.token.is_some() {
            self.busy = true;
            return FloorRequest::AlreadyHolding;
        }
        if self.pending_request {
            return FloorRequest::Pending;
        }
        let seq = self.access_critical_section();
        self.pending_request = true;
        FloorRequest::Broadcast { seq }
    }

    /// Monotonic-only merge of an observed request sequence number.
    ///
    /// Used whenever a request is seen by a node that cannot act on it yet,
    /// so a future grant check still sees the latest numbers. Returns whether
    /// the entry advanced.
    ///
    /// # Errors
    ///
    /// Rejects peers outside the roster without mutating state.
    pub fn update_sequence_number(&mut self, peer: &P, seq: u64) -> Result<bool, ProtocolError<P>> {
        let entry = self
            .request_seq
            .get_mut(peer)
            .ok_or_else(|| ProtocolError::UnknownPeer(peer.clone()))?;
        if seq > *entry {
            *entry = seq;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// The grant check: decide whether one inbound request receives the token.
    ///
    /// Stale numbers (`seq` not newer than the recorded one) are ignored.
    /// Newer numbers are recorded; the token is detached and returned only
    /// when the request is exactly the next unexecuted one
    /// (`seq == granted + 1`).
    ///
    /// # Errors
    ///
    /// Fails without state change when not holding the token or when either
    /// sequence vector has no entry for `requester`.
    pub fn compare_sequence_number(
        &mut self,
        requester: &P,
        seq: u64,
    ) -> Result<GrantResult<P>, ProtocolError<P>> {
        let Some(&rn) = self.request_seq.get(requester) else {
            return Err(ProtocolError::UnknownPeer(requester.clone()));
        };
        let Some(token) = self.token.as_ref() else {
            return Err(ProtocolError::NotHolding);
        };
        let Some(ln) = token.granted(requester) else {
            return Err(ProtocolError::UnknownPeer(requester.clone()));
        };

        if seq <= rn {
            trace!(peer = ?requester, seq, known = rn, "stale request");
            return Ok(GrantResult::Stale);
        }
        self.request_seq.insert(requester.clone(), seq);

        if seq == ln + 1 {
            let Some(token) = self.token.take() else {
                return Err(ProtocolError::NotHolding);
            };
            Ok(GrantResult::Granted {
                token: token.into_wire(),
            })
        } else {
            Ok(GrantResult::NotNext)
        }
    }

    /// Handle an inbound request in whatever possession state this node is in.
    ///
    /// Not holding: record the number for later. Holding and busy: queue the
    /// requester for service at release time. Holding and idle: run the grant
    /// check.
    ///
    /// # Errors
    ///
    /// Rejects peers outside the roster without mutating state.
    pub fn handle_request(
        &mut self,
        peer: &P,
        seq: u64,
    ) -> Result<RequestOutcome<P>, ProtocolError<P>> {
        if self.token.is_none() {
            return Ok(if self.update_sequence_number(peer, seq)? {
                RequestOutcome::Recorded
            } else {
                RequestOutcome::Stale
            });
        }

        if self.busy {
            if !self.update_sequence_number(peer, seq)? {
                return Ok(RequestOutcome::Stale);
            }
            let Some(token) = self.token.as_mut() else {
                return Err(ProtocolError::NotHolding);
            };
            if token.contains(peer) {
                return Ok(RequestOutcome::AlreadyQueued);
            }
            return Ok(match token.enqueue(peer.clone()) {
                Ok(()) => RequestOutcome::Queued,
                Err(e) => {
                    warn!(peer = ?peer, error = %e, "request dropped");
                    RequestOutcome::QueueFull
                }
            });
        }

        Ok(match self.compare_sequence_number(peer, seq)? {
            GrantResult::Granted { token } => RequestOutcome::Granted { token },
            GrantResult::Stale => RequestOutcome::Stale,
            GrantResult::NotNext => RequestOutcome::NotNext,
        })
    }

    /// The release algorithm, run exactly once per floor turn.
    ///
    /// Marks this node's own latest request as executed, appends every peer
    /// whose pending request became next, then either forwards the token to
    /// the popped queue head or keeps it when no one waits.
    ///
    /// # Errors
    ///
    /// Fails without state change when this node does not hold the token.
    pub fn release_critical_section(&mut self) -> Result<ReleaseResult<P>, ProtocolError<P>> {
        let own_seq = self.request_seq.get(&self.node).copied().unwrap_or(0);
        let Some(token) = self.token.as_mut() else {
            return Err(ProtocolError::NotHolding);
        };

        // LN[self] := RN[self]. Own RN never regresses, so this cannot fail
        // monotonicity; an unknown-self entry cannot survive construction.
        token.set_granted(&self.node, own_seq)?;

        for peer in &self.roster {
            if token.contains(peer) {
                continue;
            }
            let Some(&rn) = self.request_seq.get(peer) else {
                continue;
            };
            let Some(ln) = token.granted(peer) else {
                continue;
            };
            if rn == ln + 1 && token.enqueue(peer.clone()).is_err() {
                warn!(peer = ?peer, "queue full during release; request deferred");
            }
        }

        match token.dequeue() {
            Some(next) => {
                let Some(token) = self.token.take() else {
                    return Err(ProtocolError::NotHolding);
                };
                self.busy = false;
                Ok(ReleaseResult::Forward {
                    to: next,
                    token: token.into_wire(),
                })
            }
            None => Ok(ReleaseResult::Kept),
        }
    }

    /// Adopt a token received from the wire, validating it first.
    ///
    /// Clears the pending-request flag on success. On failure the previous
    /// (empty) state is kept untouched.
    ///
    /// # Errors
    ///
    /// Propagates the wire validation failures of [`Token::from_wire`].
    pub fn adopt_token(&mut self, wire: TokenWire<P>) -> Result<(), ProtocolError<P>> {
        let token = Token::from_wire(wire, &self.roster)?;
        if self.token.is_some() {
            warn!("replacing an already-held token");
        }
        self.token = Some(token);
        self.pending_request = false;
        Ok(())
    }
}
