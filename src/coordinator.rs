//! Ties location samples, the peer session and the geodesy together.
//!
//! A [`SessionCoordinator`] is the single owner of the session state. It runs
//! as one task that reacts to one input at a time: a location update, a
//! transport event, a command from a [`SessionHandle`], or the end of a
//! severance dwell. Results are published as a [`Snapshot`] (latest state)
//! and as [`Signal`]s (one-off happenings) for whatever presents them.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::geodesy::Tracking;
use crate::identity::PeerId;
use crate::location::{LocationError, LocationSample, LocationUpdate, LocationWatch};
use crate::protocol::ProtocolMessage;
use crate::session::{
    ConnectionState, PeerSession, SessionEvent, SeverReason, Transport, TransportEvent,
};

/// How long a severed link lingers before the session is ready again.
pub const DEFAULT_SEVERANCE_GRACE: Duration = Duration::from_millis(3500);

const COMMAND_CAPACITY: usize = 16;
const SIGNAL_CAPACITY: usize = 64;

/// Tunables for the coordinator.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Dwell time in `Severed` before returning to `Idle`.
    pub severance_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            severance_grace: DEFAULT_SEVERANCE_GRACE,
        }
    }
}

/// Everything a presentation layer needs to draw the current state.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub local_id: PeerId,
    pub state: ConnectionState,
    /// The peer on the current link, while connecting or active.
    pub remote_id: Option<PeerId>,
    pub local: Option<LocationSample>,
    pub remote: Option<LocationSample>,
    /// Present only while both samples are.
    pub tracking: Option<Tracking>,
    /// Set once the location source has failed; stays set.
    pub location_error: Option<SessionError>,
}

/// One-off notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// A peer is dialing in.
    Incoming { remote: PeerId },
    /// The link is open.
    Linked { remote: PeerId },
    /// Bearing and distance were recomputed.
    Tracked(Tracking),
    /// The link burned.
    LinkSevered { remote: PeerId, reason: SeverReason },
    /// Back to idle; a new target can be connected.
    ReadyAgain,
    /// The location source failed for good.
    LocationUnavailable(LocationError),
}

/// Requests sent from a [`SessionHandle`] to the coordinator.
#[derive(Debug)]
pub enum Command {
    Connect {
        target: PeerId,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Disconnect,
    Shutdown,
}

/// Cloneable access to a running coordinator.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<Snapshot>,
    signals: broadcast::Sender<Signal>,
}

impl SessionHandle {
    /// Dial `target`, waiting only for validation, not for the link to open.
    pub async fn connect_to(&self, target: impl Into<PeerId>) -> Result<(), SessionError> {
        let (reply, result) = oneshot::channel();
        self.commands
            .send(Command::Connect {
                target: target.into(),
                reply,
            })
            .await
            .map_err(|_| SessionError::CoordinatorGone)?;
        result.await.map_err(|_| SessionError::CoordinatorGone)?
    }

    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.commands
            .send(Command::Disconnect)
            .await
            .map_err(|_| SessionError::CoordinatorGone)
    }

    /// Stop the coordinator, hanging up any link.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.signals.subscribe()
    }
}

/// Owner of the session, the two samples and the severance timer.
pub struct SessionCoordinator<T> {
    session: PeerSession<T>,
    config: SessionConfig,
    local: Option<LocationSample>,
    remote: Option<LocationSample>,
    tracking: Option<Tracking>,
    location_error: Option<SessionError>,
    /// Last sample sent on the current link.
    last_sent: Option<LocationSample>,
    /// Bumped every time a link is severed.
    episode: u64,
    severance: Option<JoinHandle<()>>,
    elapsed_tx: mpsc::UnboundedSender<u64>,
    elapsed_rx: mpsc::UnboundedReceiver<u64>,
    commands: mpsc::Receiver<Command>,
    snapshot_tx: watch::Sender<Snapshot>,
    signal_tx: broadcast::Sender<Signal>,
}

impl<T: Transport + 'static> SessionCoordinator<T> {
    pub fn new(session: PeerSession<T>, config: SessionConfig) -> (Self, SessionHandle) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (elapsed_tx, elapsed_rx) = mpsc::unbounded_channel();
        let (signal_tx, _) = broadcast::channel(SIGNAL_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot {
            local_id: session.local_id().clone(),
            state: session.state(),
            remote_id: None,
            local: None,
            remote: None,
            tracking: None,
            location_error: None,
        });

        let handle = SessionHandle {
            commands: commands_tx,
            snapshot: snapshot_rx,
            signals: signal_tx.clone(),
        };
        let coordinator = Self {
            session,
            config,
            local: None,
            remote: None,
            tracking: None,
            location_error: None,
            last_sent: None,
            episode: 0,
            severance: None,
            elapsed_tx,
            elapsed_rx,
            commands,
            snapshot_tx,
            signal_tx,
        };
        (coordinator, handle)
    }

    /// Process inputs until shut down or every handle is dropped.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut location: LocationWatch,
    ) {
        info!(local_id = %self.session.local_id(), "Session coordinator running");
        let mut events_open = true;

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Connect { target, reply }) => {
                            let _ = reply.send(self.connect_to(target));
                        }
                        Some(Command::Disconnect) => self.disconnect(),
                        Some(Command::Shutdown) | None => break,
                    }
                }

                event = events.recv(), if events_open => {
                    match event {
                        Some(event) => self.on_transport_event(event),
                        None => {
                            warn!("Transport event channel closed");
                            events_open = false;
                        }
                    }
                }

                update = location.next(), if !location.is_stopped() => {
                    match update {
                        Some(LocationUpdate::Sample(sample)) => self.on_sample(sample),
                        Some(LocationUpdate::Failed(error)) => self.on_location_failed(error),
                        None => debug!("Location watch ended"),
                    }
                }

                Some(episode) = self.elapsed_rx.recv() => {
                    self.on_severance_elapsed(episode);
                }
            }
        }

        self.disconnect();
        location.stop();
        if let Some(timer) = self.severance.take() {
            timer.abort();
        }
        info!("Session coordinator stopped");
    }

    fn connect_to(&mut self, target: PeerId) -> Result<(), SessionError> {
        self.session.validate_target(&target)?;
        if self.session.state() == ConnectionState::Severed {
            debug!("New target during severance, ending it early");
            self.finish_severance();
        }
        let result = self.session.connect_out(&target);
        if let Err(e) = &result {
            warn!(%target, "Connect rejected: {}", e);
        }
        self.publish();
        result
    }

    fn disconnect(&mut self) {
        match self.session.disconnect() {
            Some(SessionEvent::Severed { remote, reason }) => self.begin_severance(remote, reason),
            Some(_) => self.publish(),
            None => debug!(state = %self.session.state(), "Nothing to disconnect"),
        }
    }

    fn on_sample(&mut self, sample: LocationSample) {
        self.local = Some(sample);
        if self.session.state() == ConnectionState::Active && self.last_sent != Some(sample) {
            self.send_location(sample);
        }
        self.recompute();
        self.publish();
    }

    fn on_location_failed(&mut self, error: LocationError) {
        warn!("Location source failed: {}", error);
        self.location_error = Some(SessionError::from(error.clone()));
        self.signal(Signal::LocationUnavailable(error));
        self.publish();
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        if matches!(event, TransportEvent::Inbound { .. })
            && self.session.state() == ConnectionState::Severed
        {
            debug!("Inbound link during severance, ending it early");
            self.finish_severance();
        }

        match self.session.handle(event) {
            Some(SessionEvent::Incoming { remote }) => {
                self.signal(Signal::Incoming { remote });
                self.publish();
            }
            Some(SessionEvent::Opened { remote }) => {
                self.last_sent = None;
                self.signal(Signal::Linked { remote });
                if let Some(sample) = self.local {
                    self.send_location(sample);
                }
                self.publish();
            }
            Some(SessionEvent::Message(ProtocolMessage::Location(sample))) => {
                self.remote = Some(sample);
                self.recompute();
                self.publish();
            }
            Some(SessionEvent::Severed { remote, reason }) => self.begin_severance(remote, reason),
            Some(SessionEvent::Cancelled { .. }) => self.publish(),
            None => {}
        }
    }

    fn send_location(&mut self, sample: LocationSample) {
        if self.session.send(&ProtocolMessage::Location(sample)) {
            self.last_sent = Some(sample);
        }
    }

    fn recompute(&mut self) {
        self.tracking = match (self.local, self.remote) {
            (Some(local), Some(remote)) => {
                let tracking = Tracking::between(local.position(), remote.position());
                self.signal(Signal::Tracked(tracking));
                Some(tracking)
            }
            _ => None,
        };
    }

    fn begin_severance(&mut self, remote: PeerId, reason: SeverReason) {
        self.remote = None;
        self.tracking = None;
        self.last_sent = None;
        if let Some(error) = reason.as_error() {
            warn!(%remote, "{}", error);
        }

        self.episode += 1;
        if let Some(timer) = self.severance.take() {
            timer.abort();
        }
        let episode = self.episode;
        let grace = self.config.severance_grace;
        let elapsed_tx = self.elapsed_tx.clone();
        self.severance = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = elapsed_tx.send(episode);
        }));
        debug!(episode, ?grace, "Severance started");

        self.signal(Signal::LinkSevered { remote, reason });
        self.publish();
    }

    fn on_severance_elapsed(&mut self, episode: u64) {
        if episode != self.episode || self.session.state() != ConnectionState::Severed {
            debug!(episode, current = self.episode, "Ignoring stale severance timer");
            return;
        }
        self.finish_severance();
    }

    fn finish_severance(&mut self) {
        if let Some(timer) = self.severance.take() {
            timer.abort();
        }
        if self.session.reset() {
            self.remote = None;
            self.tracking = None;
            info!("Ready for a new link");
            self.signal(Signal::ReadyAgain);
            self.publish();
        }
    }

    fn signal(&self, signal: Signal) {
        // no subscribers is fine
        let _ = self.signal_tx.send(signal);
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(Snapshot {
            local_id: self.session.local_id().clone(),
            state: self.session.state(),
            remote_id: self.session.remote().cloned(),
            local: self.local,
            remote: self.remote,
            tracking: self.tracking,
            location_error: self.location_error.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InvalidTarget;
    use crate::geodesy::Coordinate;
    use crate::location::{LocationSource, ManualSource};
    use crate::session::mock::MockTransport;
    use crate::session::ConnectionId;

    const GRACE: Duration = Duration::from_millis(3500);

    struct Harness {
        coordinator: SessionCoordinator<MockTransport>,
        handle: SessionHandle,
        transport: MockTransport,
        signals: broadcast::Receiver<Signal>,
    }

    fn harness() -> Harness {
        let transport = MockTransport::default();
        let session = PeerSession::new(PeerId::new("alice"), transport.clone());
        let (coordinator, handle) = SessionCoordinator::new(
            session,
            SessionConfig {
                severance_grace: GRACE,
            },
        );
        let signals = handle.subscribe();
        Harness {
            coordinator,
            handle,
            transport,
            signals,
        }
    }

    fn sample(lat: f64, lng: f64, observed_at: u64) -> LocationSample {
        LocationSample::new(lat, lng, observed_at).unwrap()
    }

    fn location_line(sample: LocationSample) -> String {
        ProtocolMessage::Location(sample).encode().unwrap()
    }

    fn drain(signals: &mut broadcast::Receiver<Signal>) -> Vec<Signal> {
        let mut seen = Vec::new();
        while let Ok(signal) = signals.try_recv() {
            seen.push(signal);
        }
        seen
    }

    /// Dial bob and open the link; returns its connection id.
    fn link_up(h: &mut Harness) -> ConnectionId {
        h.coordinator.connect_to(PeerId::new("bob")).unwrap();
        let conn = ConnectionId(1);
        h.coordinator.on_transport_event(TransportEvent::Open(conn));
        assert_eq!(h.handle.snapshot().state, ConnectionState::Active);
        conn
    }

    #[tokio::test]
    async fn test_rejects_invalid_targets() {
        let mut h = harness();
        assert_eq!(
            h.coordinator.connect_to(PeerId::new("")),
            Err(SessionError::InvalidTarget(InvalidTarget::Empty))
        );
        assert_eq!(
            h.coordinator.connect_to(PeerId::new("alice")),
            Err(SessionError::InvalidTarget(InvalidTarget::SelfTarget))
        );
        assert!(h.transport.calls().is_empty());
        assert_eq!(h.handle.snapshot().state, ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_local_sample_sent_immediately_on_open() {
        let mut h = harness();
        let known = sample(10.0, 20.0, 1);
        h.coordinator.on_sample(known);
        assert!(h.transport.sent().is_empty());

        let conn = link_up(&mut h);
        assert_eq!(h.transport.sent(), vec![(conn, location_line(known))]);
        assert!(drain(&mut h.signals).contains(&Signal::Linked {
            remote: PeerId::new("bob")
        }));
    }

    #[tokio::test]
    async fn test_samples_forwarded_while_active_without_repeats() {
        let mut h = harness();
        let first = sample(1.0, 1.0, 1);
        h.coordinator.on_sample(first);
        let conn = link_up(&mut h);

        // the same fix reported again right after open is not re-sent
        h.coordinator.on_sample(first);
        let second = sample(1.5, 1.0, 2);
        h.coordinator.on_sample(second);

        assert_eq!(
            h.transport.sent(),
            vec![(conn, location_line(first)), (conn, location_line(second))]
        );
    }

    #[tokio::test]
    async fn test_tracking_computed_when_both_samples_present() {
        let mut h = harness();
        let conn = link_up(&mut h);
        h.coordinator.on_sample(sample(0.0, 0.0, 1));
        assert!(h.handle.snapshot().tracking.is_none());

        h.coordinator
            .on_transport_event(TransportEvent::Data(conn, location_line(sample(0.0, 1.0, 5))));

        let snapshot = h.handle.snapshot();
        let tracking = snapshot.tracking.unwrap();
        assert!((tracking.bearing - 90.0).abs() < 1e-6);
        assert!((tracking.distance - 111_195.0).abs() < 1_112.0);
        assert_eq!(snapshot.remote, Some(sample(0.0, 1.0, 5)));
        assert!(drain(&mut h.signals)
            .iter()
            .any(|signal| matches!(signal, Signal::Tracked(_))));
    }

    #[tokio::test]
    async fn test_unknown_message_changes_nothing() {
        let mut h = harness();
        let conn = link_up(&mut h);
        h.coordinator
            .on_transport_event(TransportEvent::Data(conn, location_line(sample(3.0, 4.0, 1))));
        let before = h.handle.snapshot();
        drain(&mut h.signals);

        h.coordinator
            .on_transport_event(TransportEvent::Data(conn, r#"{"type":"ping"}"#.to_string()));

        assert_eq!(h.handle.snapshot(), before);
        assert!(drain(&mut h.signals).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_clears_remote_then_returns_to_idle() {
        let mut h = harness();
        let conn = link_up(&mut h);
        h.coordinator.on_sample(sample(0.0, 0.0, 1));
        h.coordinator
            .on_transport_event(TransportEvent::Data(conn, location_line(sample(1.0, 1.0, 1))));
        assert!(h.handle.snapshot().tracking.is_some());
        drain(&mut h.signals);

        h.coordinator.on_transport_event(TransportEvent::Closed(conn));
        let snapshot = h.handle.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Severed);
        assert_eq!(snapshot.remote, None);
        assert_eq!(snapshot.tracking, None);
        assert_eq!(
            drain(&mut h.signals),
            vec![Signal::LinkSevered {
                remote: PeerId::new("bob"),
                reason: SeverReason::Closed
            }]
        );

        // a new local fix must not be paired with the stale remote
        h.coordinator.on_sample(sample(0.5, 0.5, 2));
        assert_eq!(h.handle.snapshot().tracking, None);
        assert!(drain(&mut h.signals).is_empty());

        let episode = h.coordinator.elapsed_rx.recv().await.unwrap();
        h.coordinator.on_severance_elapsed(episode);
        let snapshot = h.handle.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Idle);
        assert_eq!(snapshot.remote, None);
        assert_eq!(drain(&mut h.signals), vec![Signal::ReadyAgain]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_severance_waits_for_grace() {
        let mut h = harness();
        let conn = link_up(&mut h);
        h.coordinator.on_transport_event(TransportEvent::Closed(conn));

        tokio::time::sleep(GRACE - Duration::from_millis(100)).await;
        assert!(h.coordinator.elapsed_rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.coordinator.elapsed_rx.try_recv().ok(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_cannot_touch_new_link() {
        let mut h = harness();
        let conn = link_up(&mut h);
        h.coordinator.on_transport_event(TransportEvent::Closed(conn));
        let stale_episode = h.coordinator.episode;

        // reconnect inside the grace period
        h.coordinator.connect_to(PeerId::new("bob")).unwrap();
        assert_eq!(h.handle.snapshot().state, ConnectionState::Connecting);
        assert!(drain(&mut h.signals).contains(&Signal::ReadyAgain));

        h.coordinator.on_severance_elapsed(stale_episode);
        assert_eq!(h.handle.snapshot().state, ConnectionState::Connecting);

        // the aborted timer never fires
        tokio::time::sleep(GRACE * 2).await;
        assert!(h.coordinator.elapsed_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_during_severance_is_accepted() {
        let mut h = harness();
        let conn = link_up(&mut h);
        h.coordinator.disconnect();
        assert_eq!(h.handle.snapshot().state, ConnectionState::Severed);

        let caller = h.transport.inbound_id();
        h.coordinator.on_transport_event(TransportEvent::Inbound {
            conn: caller,
            remote: PeerId::new("carol"),
        });
        let snapshot = h.handle.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Connecting);
        assert_eq!(snapshot.remote_id, Some(PeerId::new("carol")));
        assert_ne!(conn, caller);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_twice_same_as_once() {
        let mut h = harness();
        link_up(&mut h);
        drain(&mut h.signals);

        h.coordinator.disconnect();
        let episode = h.coordinator.episode;
        let snapshot = h.handle.snapshot();
        let signals = drain(&mut h.signals);

        h.coordinator.disconnect();
        assert_eq!(h.coordinator.episode, episode);
        assert_eq!(h.handle.snapshot(), snapshot);
        assert!(drain(&mut h.signals).is_empty());
        assert!(matches!(
            signals.as_slice(),
            [Signal::LinkSevered {
                reason: SeverReason::Disconnected,
                ..
            }]
        ));
        assert_eq!(h.transport.closed(), vec![ConnectionId(1)]);
    }

    #[tokio::test]
    async fn test_disconnect_while_connecting_goes_idle() {
        let mut h = harness();
        h.coordinator.connect_to(PeerId::new("bob")).unwrap();
        h.coordinator.disconnect();

        assert_eq!(h.handle.snapshot().state, ConnectionState::Idle);
        assert_eq!(h.coordinator.episode, 0);
        assert!(h.coordinator.severance.is_none());
    }

    #[tokio::test]
    async fn test_location_failure_is_sticky() {
        let mut h = harness();
        h.coordinator.on_location_failed(LocationError::Denied);
        let snapshot = h.handle.snapshot();
        assert_eq!(
            snapshot.location_error,
            Some(SessionError::LocationUnavailable(
                "location permission denied".to_string()
            ))
        );
        assert_eq!(snapshot.local, None);
        assert_eq!(
            drain(&mut h.signals),
            vec![Signal::LocationUnavailable(LocationError::Denied)]
        );

        // the identity can still be linked
        link_up(&mut h);
        assert!(matches!(
            h.handle.snapshot().location_error,
            Some(SessionError::LocationUnavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_end_to_end() {
        let transport = MockTransport::default();
        let session = PeerSession::new(PeerId::new("alice"), transport.clone());
        let (coordinator, handle) = SessionCoordinator::new(session, SessionConfig::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut source = ManualSource::new();
        let feed = source.feed();
        let task = tokio::spawn(coordinator.run(events_rx, source.start()));

        let mut snapshots = handle.watch();
        feed.push(Coordinate::new(10.0, 20.0).unwrap());
        snapshots
            .wait_for(|snapshot| snapshot.local.is_some())
            .await
            .unwrap();

        handle.connect_to("bob").await.unwrap();
        assert_eq!(
            handle.connect_to("carol").await,
            Err(SessionError::NotIdle(ConnectionState::Connecting))
        );

        events_tx.send(TransportEvent::Open(ConnectionId(1))).unwrap();
        snapshots
            .wait_for(|snapshot| snapshot.state == ConnectionState::Active)
            .await
            .unwrap();
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("\"latitude\":10.0"));

        events_tx.send(TransportEvent::Closed(ConnectionId(1))).unwrap();
        snapshots
            .wait_for(|snapshot| snapshot.state == ConnectionState::Idle)
            .await
            .unwrap();

        handle.shutdown().await;
        task.await.unwrap();
        assert_eq!(
            handle.connect_to("bob").await,
            Err(SessionError::CoordinatorGone)
        );
    }
}
