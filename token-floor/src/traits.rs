//! Collaborator seams consumed by the coordinator.
//!
//! The coordinator itself owns no sockets and no audio pipeline: message
//! delivery and floor decisions cross these traits, so the surrounding
//! application (or a test harness) supplies both halves.

use std::fmt;
use std::hash::Hash;

use crate::messages::FloorMessage;

/// Bounds for peer identifiers.
///
/// Identifiers are opaque to the protocol: any comparable, hashable, cloneable
/// value works (session-unique strings in production, small integers in
/// tests). Implemented blanket-wise; never implement it by hand.
pub trait PeerId: Clone + Eq + Ord + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T> PeerId for T where T: Clone + Eq + Ord + Hash + fmt::Debug + Send + Sync + 'static {}

/// Point-to-point message delivery between session peers.
///
/// Delivery is assumed reliable and order-preserving between any two live
/// peers for the duration of the session; broadcast is roster iteration on
/// the caller's side. A failed send is logged by the coordinator and not
/// retried here.
#[expect(async_fn_in_trait)]
pub trait Transport<P: PeerId> {
    /// Transport-specific failure type.
    type Error: fmt::Debug + Send;

    /// Deliver one protocol message to `to`.
    async fn send(&mut self, to: &P, message: FloorMessage<P>) -> Result<(), Self::Error>;
}

/// A floor-control decision emitted by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FloorDecision<P> {
    /// This node may transmit live audio.
    Granted,
    /// This node must stop transmitting.
    Revoked,
    /// The token is permanently gone; the session cannot recover on its own.
    TokenLost {
        /// The peer that held the token when it was lost.
        holder: Option<P>,
    },
}

/// Consumer of [`FloorDecision`]s — the mute/unmute side of the application.
#[expect(async_fn_in_trait)]
pub trait FloorListener<P: PeerId> {
    /// Act on one decision. Called from the coordinator's event loop, so
    /// implementations should return promptly.
    async fn apply(&mut self, decision: FloorDecision<P>);
}
