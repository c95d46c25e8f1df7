//! Token-based floor control for peer-to-peer multi-party calls
//!
//! At most one participant may transmit live audio at a time. This crate
//! implements the Suzuki–Kasami token algorithm that circulates that right
//! fairly over direct peer links, with no central coordinator: a single
//! token object grants the floor, peers request it with sequence-numbered
//! broadcasts, and the holder decides from purely local state whether to
//! forward the token, queue the requester, or keep it.
//!
//! # Architecture
//!
//! - [`Token`]: the circulating permit — wait queue plus granted-sequence
//!   vector, with a validated wire form
//! - [`MutexCore`]: pure request/grant/release state machine, no I/O —
//!   the model-checker tests drive this exact type
//! - [`Coordinator`]: async event loop wiring speech events and inbound
//!   messages to the core, with a cancellable grace window before release
//!
//! Media connections, membership signaling, and speech detection stay
//! outside, behind the [`Transport`] and [`FloorListener`] seams.
//!
//! # Quick Start
//!
//! ```ignore
//! use token_floor::{Coordinator, FloorConfig};
//!
//! let coordinator = Coordinator::start_call(
//!     roster,          // fixed, ordered peer ids; first one starts holding
//!     my_peer_id,
//!     transport,       // impl Transport: point-to-point delivery
//!     listener,        // impl FloorListener: mute/unmute side
//!     FloorConfig::default(),
//! )?;
//! let status = coordinator.status();
//! coordinator.run(inbound_messages, speech_events).await?;
//! ```

#![warn(clippy::pedantic)]

pub mod codec;
mod config;
mod coordinator;
pub mod core;
mod error;
mod messages;
mod token;
mod traits;

pub use config::{FloorConfig, Sleep, TokioSleep};
pub use coordinator::{Coordinator, FloorEvent, FloorStatus};
pub use self::core::{FloorRequest, GrantResult, MutexCore, ReleaseResult, RequestOutcome};
pub use error::{HolderContext, ProtocolError, SessionError, TokenError};
pub use messages::FloorMessage;
pub use token::{Token, TokenWire};
pub use traits::{FloorDecision, FloorListener, PeerId, Transport};
