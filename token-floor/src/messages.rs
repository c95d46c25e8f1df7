//! Floor-control protocol messages.

use serde::{Deserialize, Serialize};

use crate::token::TokenWire;

/// Messages exchanged between peer coordinators.
///
/// Payload shapes are transport-agnostic; the framing in
/// [`codec`](crate::codec) is one way to put them on a byte stream.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(bound(serialize = "P: Serialize", deserialize = "P: Deserialize<'de>"))]
pub enum FloorMessage<P> {
    /// "I want the floor; my latest request sequence number is `seq`."
    Request {
        /// The sender's freshly incremented sequence number.
        seq: u64,
    },
    /// "Here is the floor; adopt this token."
    Response {
        /// The serialized token.
        token: TokenWire<P>,
    },
    /// One-time session initialization carrying the fixed, ordered roster.
    ///
    /// Coordinators are constructed from this roster; a live coordinator
    /// that receives another one logs it and carries on.
    StartCall {
        /// Ordered peer roster; the first entry starts with the token.
        roster: Vec<P>,
    },
}
