//! Async floor coordinator: drives the pure mutex core from local speech
//! events and inbound protocol messages.
//!
//! The coordinator is strictly event-driven. Every state transition happens
//! inside the handler for one event at a time, so the core needs no internal
//! locking; peers interact only through the transport.

use std::future::{self, Future};
use std::pin::Pin;

use error_stack::Report;
use futures::{Stream, StreamExt};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};

use crate::config::{FloorConfig, Sleep, TokioSleep};
use crate::core::{FloorRequest, MutexCore, ReleaseResult, RequestOutcome};
use crate::error::{HolderContext, ProtocolError, SessionError};
use crate::messages::FloorMessage;
use crate::traits::{FloorDecision, FloorListener, PeerId, Transport};

/// Local edge events fed by the activity detector and the signaling layer.
///
/// Speech events are edge-triggered: at most one per transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FloorEvent<P> {
    /// The local participant started speaking.
    SpeechStart,
    /// The local participant stopped speaking.
    SpeechStop,
    /// A peer's connection went away for good.
    PeerDisconnected(P),
}

/// Snapshot of floor state for supervising layers.
///
/// Enough for a watchdog to decide that the session is wedged: who was last
/// seen holding the token, and when it last changed hands from this node's
/// point of view.
#[derive(Debug, Clone)]
pub struct FloorStatus<P> {
    /// The peer this node last knew to hold the token.
    pub last_holder: Option<P>,
    /// Whether this node holds the token right now.
    pub holding: bool,
    /// When the token last changed hands, as observed locally.
    pub last_grant: Option<Instant>,
}

/// Pinned, boxed grace-window timer; `None` when disarmed.
type GraceTimer = Option<Pin<Box<dyn Future<Output = ()> + Send>>>;

/// Resolves when the armed grace window elapses; never resolves while
/// disarmed.
async fn grace_elapsed(timer: &mut GraceTimer) {
    match timer.as_mut() {
        Some(sleep) => sleep.as_mut().await,
        None => future::pending().await,
    }
}

/// The event-driven floor coordinator for one session participant.
///
/// Owns the protocol state machine plus the two collaborator seams: a
/// [`Transport`] for outbound messages and a [`FloorListener`] for
/// grant/revoke decisions.
pub struct Coordinator<P: PeerId, T, L, S: Sleep = TokioSleep> {
    core: MutexCore<P>,
    transport: T,
    listener: L,
    config: FloorConfig<S>,
    speaking: bool,
    status: watch::Sender<FloorStatus<P>>,
}

impl<P, T, L, S> Coordinator<P, T, L, S>
where
    P: PeerId,
    T: Transport<P>,
    L: FloorListener<P>,
    S: Sleep,
{
    /// Build a coordinator from a `start-call` roster.
    ///
    /// The first peer of the ordered roster starts with the token.
    ///
    /// # Errors
    ///
    /// Rejects rosters that are empty, repeat a peer, or omit `node`.
    pub fn start_call(
        roster: Vec<P>,
        node: P,
        transport: T,
        listener: L,
        config: FloorConfig<S>,
    ) -> Result<Self, ProtocolError<P>> {
        let core = MutexCore::new(roster, node)?;
        let status = watch::Sender::new(FloorStatus {
            last_holder: core.roster().first().cloned(),
            holding: core.has_token(),
            last_grant: None,
        });
        Ok(Self {
            core,
            transport,
            listener,
            config,
            speaking: false,
            status,
        })
    }

    /// Subscribe to floor status snapshots.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<FloorStatus<P>> {
        self.status.subscribe()
    }

    /// Read access to the protocol state machine.
    #[must_use]
    pub fn core(&self) -> &MutexCore<P> {
        &self.core
    }

    /// Run the coordinator until either input stream ends or the session
    /// becomes unrecoverable.
    ///
    /// `messages` yields inbound protocol messages tagged with their sender;
    /// `events` yields local speech and membership edges. Both are assumed
    /// ordered per peer, per the transport contract.
    ///
    /// # Errors
    ///
    /// Returns a fatal [`SessionError`] when the token holder disconnects
    /// while this node does not hold the token — mutual exclusion cannot be
    /// re-established and a supervising layer must restart the session.
    #[instrument(skip_all, name = "floor", fields(node = ?self.core.node()))]
    pub async fn run<M, E>(mut self, mut messages: M, mut events: E) -> Result<(), Report<SessionError>>
    where
        M: Stream<Item = (P, FloorMessage<P>)> + Unpin,
        E: Stream<Item = FloorEvent<P>> + Unpin,
    {
        let mut grace: GraceTimer = None;
        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(event) => self.on_event(event, &mut grace).await?,
                    None => {
                        debug!("event stream ended; coordinator stopping");
                        return Ok(());
                    }
                },
                message = messages.next() => match message {
                    Some((from, message)) => self.on_message(from, message, &mut grace).await,
                    None => {
                        debug!("message stream ended; coordinator stopping");
                        return Ok(());
                    }
                },
                () = grace_elapsed(&mut grace) => {
                    grace = None;
                    self.release_floor().await;
                }
            }
        }
    }

    async fn on_event(
        &mut self,
        event: FloorEvent<P>,
        grace: &mut GraceTimer,
    ) -> Result<(), Report<SessionError>> {
        match event {
            FloorEvent::SpeechStart => {
                self.speaking = true;
                if grace.take().is_some() {
                    trace!("speech resumed inside the grace window");
                }
                match self.core.request_floor() {
                    FloorRequest::AlreadyHolding => {
                        debug!("floor granted from the held token");
                        self.listener.apply(FloorDecision::Granted).await;
                    }
                    FloorRequest::Pending => trace!("request already outstanding"),
                    FloorRequest::Broadcast { seq } => {
                        debug!(seq, "broadcasting floor request");
                        self.broadcast(FloorMessage::Request { seq }).await;
                    }
                }
            }
            FloorEvent::SpeechStop => {
                self.speaking = false;
                if self.core.has_token() {
                    self.core.set_busy(false);
                    self.listener.apply(FloorDecision::Revoked).await;
                    self.arm_grace(grace);
                }
            }
            FloorEvent::PeerDisconnected(peer) => {
                warn!(peer = ?peer, "peer disconnected");
                let holder_gone = !self.core.has_token()
                    && self.status.borrow().last_holder.as_ref() == Some(&peer);
                if holder_gone {
                    self.listener
                        .apply(FloorDecision::TokenLost {
                            holder: Some(peer.clone()),
                        })
                        .await;
                    return Err(Report::new(SessionError::TokenLost)
                        .attach_printable(HolderContext {
                            holder: Some(peer),
                        }));
                }
            }
        }
        Ok(())
    }

    async fn on_message(&mut self, from: P, message: FloorMessage<P>, grace: &mut GraceTimer) {
        match message {
            FloorMessage::Request { seq } => match self.core.handle_request(&from, seq) {
                Ok(RequestOutcome::Granted { token }) => {
                    debug!(to = ?from, "granting the floor");
                    *grace = None;
                    self.note_handoff(&from);
                    self.send(&from, FloorMessage::Response { token }).await;
                }
                Ok(RequestOutcome::Queued) => debug!(peer = ?from, "requester queued"),
                Ok(RequestOutcome::AlreadyQueued) => {
                    trace!(peer = ?from, "requester already queued");
                }
                Ok(RequestOutcome::QueueFull) => {
                    warn!(peer = ?from, "token queue full; request dropped");
                }
                Ok(RequestOutcome::Recorded) => trace!(peer = ?from, seq, "request recorded"),
                Ok(RequestOutcome::NotNext) => {
                    trace!(peer = ?from, seq, "request recorded; not next in sequence");
                }
                Ok(RequestOutcome::Stale) => trace!(peer = ?from, seq, "stale request ignored"),
                Err(e) => warn!(peer = ?from, error = %e, "request rejected"),
            },
            FloorMessage::Response { token } => match self.core.adopt_token(token) {
                Ok(()) => {
                    debug!("token adopted");
                    self.note_adoption();
                    if self.speaking {
                        self.core.set_busy(true);
                        self.listener.apply(FloorDecision::Granted).await;
                    } else {
                        self.arm_grace(grace);
                    }
                }
                Err(e) => warn!(peer = ?from, error = %e, "rejected malformed token"),
            },
            FloorMessage::StartCall { .. } => {
                warn!(peer = ?from, "start-call received on a live session; ignored");
            }
        }
    }

    /// The release pass, run when the grace window elapses with no speech.
    async fn release_floor(&mut self) {
        match self.core.release_critical_section() {
            Ok(ReleaseResult::Forward { to, token }) => {
                debug!(to = ?to, "forwarding the token");
                self.note_handoff(&to);
                self.send(&to, FloorMessage::Response { token }).await;
            }
            Ok(ReleaseResult::Kept) => trace!("no one waiting; keeping the token"),
            Err(e) => warn!(error = %e, "release skipped"),
        }
    }

    fn arm_grace(&self, grace: &mut GraceTimer) {
        trace!(window = ?self.config.grace, "arming the grace window");
        let sleep = self.config.sleep.clone();
        let window = self.config.grace;
        *grace = Some(Box::pin(async move { sleep.sleep(window).await }));
    }

    async fn broadcast(&mut self, message: FloorMessage<P>) {
        let peers: Vec<P> = self
            .core
            .roster()
            .iter()
            .filter(|peer| *peer != self.core.node())
            .cloned()
            .collect();
        for peer in &peers {
            self.send(peer, message.clone()).await;
        }
    }

    async fn send(&mut self, to: &P, message: FloorMessage<P>) {
        if let Err(e) = self.transport.send(to, message).await {
            warn!(to = ?to, error = ?e, "send failed");
        }
    }

    /// The token left this node toward `to`.
    fn note_handoff(&self, to: &P) {
        self.status.send_modify(|status| {
            status.last_holder = Some(to.clone());
            status.holding = false;
            status.last_grant = Some(Instant::now());
        });
    }

    /// The token arrived at this node.
    fn note_adoption(&self) {
        let node = self.core.node().clone();
        self.status.send_modify(|status| {
            status.last_holder = Some(node);
            status.holding = true;
            status.last_grant = Some(Instant::now());
        });
    }
}
