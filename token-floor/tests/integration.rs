//! End-to-end cluster tests over in-process channels.
//!
//! Every peer runs a real coordinator; the mesh transport is a set of
//! unbounded channels. Tests run on paused tokio time, so grace windows
//! elapse instantly in virtual time.

use std::collections::BTreeMap;
use std::time::Duration;

use error_stack::Report;
use futures::StreamExt;
use futures::channel::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use token_floor::{
    Coordinator, FloorConfig, FloorDecision, FloorEvent, FloorMessage, FloorStatus, SessionError,
    TokenWire, Transport,
};

type Peer = &'static str;
type Inbound = (Peer, FloorMessage<Peer>);
type Decision = (Peer, FloorDecision<Peer>);

/// Initialize tracing for tests. Call at the start of each test.
/// Uses RUST_LOG env var for filtering (defaults to "debug" for this crate).
fn init_tracing() -> impl Sized {
    use tracing::Dispatch;
    use tracing_subscriber::fmt::format::FmtSpan;
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("token_floor=debug")),
        )
        .with_span_events(FmtSpan::CLOSE)
        .with_test_writer()
        .finish();

    let dispatch = Dispatch::new(subscriber);
    tracing::dispatcher::set_default(&dispatch)
}

/// Channel-mesh transport: one unbounded inbox per peer.
#[derive(Clone)]
struct ChannelMesh {
    node: Peer,
    links: BTreeMap<Peer, mpsc::UnboundedSender<Inbound>>,
}

impl Transport<Peer> for ChannelMesh {
    type Error = mpsc::TrySendError<Inbound>;

    async fn send(&mut self, to: &Peer, message: FloorMessage<Peer>) -> Result<(), Self::Error> {
        match self.links.get(to) {
            Some(link) => link.unbounded_send((self.node, message)),
            // Absent link: the peer's coordinator already shut down.
            None => Ok(()),
        }
    }
}

/// Listener that funnels every decision into one global, ordered log.
struct Recorder {
    node: Peer,
    decisions: mpsc::UnboundedSender<Decision>,
}

impl token_floor::FloorListener<Peer> for Recorder {
    async fn apply(&mut self, decision: FloorDecision<Peer>) {
        self.decisions
            .unbounded_send((self.node, decision))
            .expect("decision log closed");
    }
}

struct Cluster {
    events: BTreeMap<Peer, mpsc::UnboundedSender<FloorEvent<Peer>>>,
    decisions: mpsc::UnboundedReceiver<Decision>,
    statuses: BTreeMap<Peer, tokio::sync::watch::Receiver<FloorStatus<Peer>>>,
    handles: BTreeMap<Peer, JoinHandle<Result<(), Report<SessionError>>>>,
}

fn spawn_cluster(roster: &[Peer], grace: Duration) -> Cluster {
    let (decision_tx, decisions) = mpsc::unbounded();

    let mut inboxes = BTreeMap::new();
    let mut links = BTreeMap::new();
    for &peer in roster {
        let (tx, rx) = mpsc::unbounded::<Inbound>();
        links.insert(peer, tx);
        inboxes.insert(peer, rx);
    }

    let mut cluster = Cluster {
        events: BTreeMap::new(),
        decisions,
        statuses: BTreeMap::new(),
        handles: BTreeMap::new(),
    };
    for &peer in roster {
        let (event_tx, event_rx) = mpsc::unbounded::<FloorEvent<Peer>>();
        let coordinator = Coordinator::start_call(
            roster.to_vec(),
            peer,
            ChannelMesh {
                node: peer,
                links: links.clone(),
            },
            Recorder {
                node: peer,
                decisions: decision_tx.clone(),
            },
            FloorConfig::new(grace, token_floor::TokioSleep),
        )
        .expect("valid roster");

        cluster.statuses.insert(peer, coordinator.status());
        cluster.events.insert(peer, event_tx);
        let inbox = inboxes.remove(peer).expect("inbox for every peer");
        cluster
            .handles
            .insert(peer, tokio::spawn(coordinator.run(inbox, event_rx)));
    }
    cluster
}

impl Cluster {
    fn event(&self, peer: Peer, event: FloorEvent<Peer>) {
        self.events[peer].unbounded_send(event).expect("peer alive");
    }

    async fn next_decision(&mut self) -> Decision {
        timeout(Duration::from_secs(60), self.decisions.next())
            .await
            .expect("timed out waiting for a decision")
            .expect("decision log closed")
    }

    fn no_pending_decisions(&mut self) {
        assert!(
            self.decisions.try_next().is_err(),
            "unexpected decision in the log"
        );
    }

    fn status(&self, peer: Peer) -> FloorStatus<Peer> {
        self.statuses[peer].borrow().clone()
    }
}

/// Let already-queued handler work settle before the next scripted step.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

const GRACE: Duration = Duration::from_secs(1);

#[tokio::test(start_paused = true)]
async fn request_is_granted_immediately_by_an_idle_holder() {
    let _guard = init_tracing();
    let mut cluster = spawn_cluster(&["a", "b", "c", "d"], GRACE);

    assert!(cluster.status("a").holding);
    assert!(!cluster.status("b").holding);

    cluster.event("b", FloorEvent::SpeechStart);
    assert_eq!(cluster.next_decision().await, ("b", FloorDecision::Granted));

    let status = cluster.status("b");
    assert!(status.holding);
    assert_eq!(status.last_holder, Some("b"));
    assert!(status.last_grant.is_some());

    // The granting side saw the handoff too.
    let status = cluster.status("a");
    assert!(!status.holding);
    assert_eq!(status.last_holder, Some("b"));

    // Stop speaking: revoked, and with no one waiting the token stays put.
    cluster.event("b", FloorEvent::SpeechStop);
    assert_eq!(cluster.next_decision().await, ("b", FloorDecision::Revoked));
    tokio::time::sleep(GRACE * 3).await;
    assert!(cluster.status("b").holding);
    cluster.no_pending_decisions();
}

#[tokio::test(start_paused = true)]
async fn requests_during_a_busy_floor_are_served_in_fifo_order() {
    let _guard = init_tracing();
    let mut cluster = spawn_cluster(&["a", "b", "c"], GRACE);

    cluster.event("a", FloorEvent::SpeechStart);
    assert_eq!(cluster.next_decision().await, ("a", FloorDecision::Granted));

    // b then c ask for the floor while a is live.
    cluster.event("b", FloorEvent::SpeechStart);
    settle().await;
    cluster.event("c", FloorEvent::SpeechStart);
    settle().await;
    cluster.no_pending_decisions();

    cluster.event("a", FloorEvent::SpeechStop);
    assert_eq!(cluster.next_decision().await, ("a", FloorDecision::Revoked));
    assert_eq!(cluster.next_decision().await, ("b", FloorDecision::Granted));

    cluster.event("b", FloorEvent::SpeechStop);
    assert_eq!(cluster.next_decision().await, ("b", FloorDecision::Revoked));
    assert_eq!(cluster.next_decision().await, ("c", FloorDecision::Granted));

    cluster.event("c", FloorEvent::SpeechStop);
    assert_eq!(cluster.next_decision().await, ("c", FloorDecision::Revoked));
    tokio::time::sleep(GRACE * 3).await;
    assert!(cluster.status("c").holding);
    cluster.no_pending_decisions();
}

#[tokio::test(start_paused = true)]
async fn resumed_speech_cancels_the_grace_window() {
    let _guard = init_tracing();
    let mut cluster = spawn_cluster(&["a", "b"], GRACE);

    cluster.event("a", FloorEvent::SpeechStart);
    assert_eq!(cluster.next_decision().await, ("a", FloorDecision::Granted));

    // b is waiting in the queue, so a release would hand the floor over.
    cluster.event("b", FloorEvent::SpeechStart);
    settle().await;

    cluster.event("a", FloorEvent::SpeechStop);
    assert_eq!(cluster.next_decision().await, ("a", FloorDecision::Revoked));

    // Speech resumes inside the window: no release run, no handoff.
    tokio::time::sleep(GRACE / 4).await;
    cluster.event("a", FloorEvent::SpeechStart);
    assert_eq!(cluster.next_decision().await, ("a", FloorDecision::Granted));
    tokio::time::sleep(GRACE * 3).await;
    assert!(cluster.status("a").holding);
    cluster.no_pending_decisions();

    // A real stop serves b exactly once.
    cluster.event("a", FloorEvent::SpeechStop);
    assert_eq!(cluster.next_decision().await, ("a", FloorDecision::Revoked));
    assert_eq!(cluster.next_decision().await, ("b", FloorDecision::Granted));
    cluster.no_pending_decisions();
}

#[tokio::test(start_paused = true)]
async fn malformed_tokens_are_rejected_without_losing_state() {
    let _guard = init_tracing();

    // Hand-driven peer "a": we play the holder against a real coordinator "b".
    let (a_tx, mut a_rx) = mpsc::unbounded::<Inbound>();
    let (b_tx, b_rx) = mpsc::unbounded::<Inbound>();
    let (event_tx, event_rx) = mpsc::unbounded::<FloorEvent<Peer>>();
    let (decision_tx, mut decisions) = mpsc::unbounded::<Decision>();

    let coordinator = Coordinator::start_call(
        vec!["a", "b"],
        "b",
        ChannelMesh {
            node: "b",
            links: BTreeMap::from([("a", a_tx)]),
        },
        Recorder {
            node: "b",
            decisions: decision_tx,
        },
        FloorConfig::new(GRACE, token_floor::TokioSleep),
    )
    .unwrap();
    let status = coordinator.status();
    let _run = tokio::spawn(coordinator.run(b_rx, event_rx));

    event_tx.unbounded_send(FloorEvent::SpeechStart).unwrap();
    let (_, request) = timeout(Duration::from_secs(60), a_rx.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request, FloorMessage::Request { seq: 1 });

    // A token missing a's granted entry must be refused.
    b_tx.unbounded_send((
        "a",
        FloorMessage::Response {
            token: TokenWire {
                peer_count: 2,
                queue: vec![],
                granted: vec![("b", 0)],
            },
        },
    ))
    .unwrap();
    settle().await;
    assert!(!status.borrow().holding);
    assert!(decisions.try_next().is_err());

    // The well-formed token still goes through afterwards.
    b_tx.unbounded_send((
        "a",
        FloorMessage::Response {
            token: TokenWire {
                peer_count: 2,
                queue: vec![],
                granted: vec![("a", 0), ("b", 0)],
            },
        },
    ))
    .unwrap();
    assert_eq!(
        timeout(Duration::from_secs(60), decisions.next())
            .await
            .unwrap()
            .unwrap(),
        ("b", FloorDecision::Granted)
    );
    assert!(status.borrow().holding);
}

#[tokio::test(start_paused = true)]
async fn holder_disconnect_is_fatal_for_the_session() {
    let _guard = init_tracing();
    let mut cluster = spawn_cluster(&["a", "b"], GRACE);

    // a holds the token and vanishes; b can never acquire the floor again.
    cluster.event("b", FloorEvent::PeerDisconnected("a"));
    assert_eq!(
        cluster.next_decision().await,
        ("b", FloorDecision::TokenLost { holder: Some("a") })
    );

    let handle = cluster.handles.remove("b").unwrap();
    let report = timeout(Duration::from_secs(60), handle)
        .await
        .expect("run loop should stop")
        .expect("task must not panic")
        .expect_err("token loss is fatal");
    assert_eq!(report.current_context(), &SessionError::TokenLost);
}

#[tokio::test(start_paused = true)]
async fn disconnect_of_a_bystander_is_survivable() {
    let _guard = init_tracing();
    let mut cluster = spawn_cluster(&["a", "b", "c"], GRACE);

    cluster.event("a", FloorEvent::PeerDisconnected("c"));
    settle().await;
    cluster.no_pending_decisions();

    // The floor still circulates.
    cluster.event("b", FloorEvent::SpeechStart);
    assert_eq!(cluster.next_decision().await, ("b", FloorDecision::Granted));
}
