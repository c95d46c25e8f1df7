//! Error types for the floor-control protocol.

use std::fmt;

/// Failure while mutating or validating a [`Token`](crate::Token).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// The wait queue is at capacity; the entry was dropped.
    QueueFull {
        /// The queue capacity, equal to the token's peer count.
        capacity: usize,
    },
    /// A granted-sequence operation referenced a peer the token was not
    /// created with.
    UnknownPeer,
    /// A granted-sequence write would move a peer's entry backwards.
    NonMonotonicGrant {
        /// The entry currently recorded.
        current: u64,
        /// The rejected lower value.
        proposed: u64,
    },
    /// A wire payload declared a queue longer than its own peer count.
    QueueExceedsPeerCount {
        /// Length of the queue in the payload.
        queue_len: usize,
        /// Peer count declared by the payload.
        peer_count: usize,
    },
    /// A wire payload omitted a granted-sequence entry for a roster peer.
    MissingGrantEntry,
    /// A wire payload carried two granted-sequence entries for one peer.
    DuplicateGrantEntry,
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenError::QueueFull { capacity } => {
                write!(f, "token queue is at capacity ({capacity})")
            }
            TokenError::UnknownPeer => f.write_str("peer is not part of this token"),
            TokenError::NonMonotonicGrant { current, proposed } => write!(
                f,
                "granted sequence may not regress ({proposed} < {current})"
            ),
            TokenError::QueueExceedsPeerCount {
                queue_len,
                peer_count,
            } => write!(
                f,
                "queue length {queue_len} exceeds declared peer count {peer_count}"
            ),
            TokenError::MissingGrantEntry => {
                f.write_str("payload is missing a granted entry for a roster peer")
            }
            TokenError::DuplicateGrantEntry => {
                f.write_str("payload repeats a granted entry for one peer")
            }
        }
    }
}

impl std::error::Error for TokenError {}

/// Non-fatal protocol error: the operation aborted without mutating state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError<P> {
    /// A message referenced a peer outside the fixed session roster.
    UnknownPeer(P),
    /// The operation requires holding the token.
    NotHolding,
    /// The session roster handed to the coordinator was unusable.
    InvalidRoster(&'static str),
    /// A token payload or mutation was rejected.
    Token(TokenError),
}

impl<P: fmt::Debug> fmt::Display for ProtocolError<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::UnknownPeer(peer) => {
                write!(f, "peer {peer:?} is not part of this session")
            }
            ProtocolError::NotHolding => f.write_str("this node does not hold the token"),
            ProtocolError::InvalidRoster(reason) => write!(f, "invalid roster: {reason}"),
            ProtocolError::Token(e) => write!(f, "token error: {e}"),
        }
    }
}

impl<P: fmt::Debug> std::error::Error for ProtocolError<P> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProtocolError::Token(e) => Some(e),
            _ => None,
        }
    }
}

impl<P> From<TokenError> for ProtocolError<P> {
    fn from(e: TokenError) -> Self {
        ProtocolError::Token(e)
    }
}

/// Fatal-for-the-session condition: mutual exclusion can no longer be
/// guaranteed and a supervising layer must restart the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    /// The sole token holder disconnected; the token is permanently lost.
    TokenLost,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::TokenLost => {
                f.write_str("token holder disconnected; mutual exclusion may be broken")
            }
        }
    }
}

impl std::error::Error for SessionError {}

/// Error context: the last peer known to hold the token.
#[derive(Debug, Clone)]
pub struct HolderContext<P> {
    /// Last known holder, if any grant was ever observed.
    pub holder: Option<P>,
}

impl<P: fmt::Debug> fmt::Display for HolderContext<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.holder {
            Some(holder) => write!(f, "last known holder: {holder:?}"),
            None => f.write_str("no holder was ever observed"),
        }
    }
}
