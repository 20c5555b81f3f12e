//! The peer session state machine.
//!
//! [`PeerSession`] owns the local identity and at most one link to a remote
//! peer. It never performs I/O itself: it drives an injected [`Transport`]
//! and reacts to the [`TransportEvent`]s that transport reports, returning
//! [`SessionEvent`]s for the coordinator.
//!
//! ```text
//! Idle --connect_out / inbound--> Connecting --open--> Active
//!   ^                                 |                  |
//!   |                        failed   |   closed/failed/ |
//!   |   disconnect (cancel)           v   disconnect     v
//!   +--------------------------- Severed <---------------+
//!              reset
//! ```
//!
//! Every link gets its own [`ConnectionId`]; events for any other id are
//! stale and dropped, so traffic from an earlier link can never leak into a
//! later one.

use std::fmt;

use tracing::{debug, info, warn};

use crate::error::{InvalidTarget, SessionError};
use crate::identity::PeerId;
use crate::protocol::{Decoded, ProtocolMessage};

/// Lifecycle of the single peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No target and no connection.
    #[default]
    Idle,
    /// Outbound attempt in flight, or inbound accepted but not yet open.
    Connecting,
    /// Channel open both ways; locations are exchanged.
    Active,
    /// Channel gone; waiting to return to `Idle`.
    Severed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Active => write!(f, "active"),
            ConnectionState::Severed => write!(f, "severed"),
        }
    }
}

/// Identifies one connection instance for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Events reported by a transport, always tagged with their connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A remote peer is dialing us.
    Inbound { conn: ConnectionId, remote: PeerId },
    /// The channel is open in both directions.
    Open(ConnectionId),
    /// One line of payload, in order.
    Data(ConnectionId, String),
    /// The channel was closed by either side.
    Closed(ConnectionId),
    /// The attempt or the established channel failed.
    Failed { conn: ConnectionId, reason: String },
}

impl TransportEvent {
    pub fn conn(&self) -> ConnectionId {
        match self {
            TransportEvent::Inbound { conn, .. }
            | TransportEvent::Open(conn)
            | TransportEvent::Data(conn, _)
            | TransportEvent::Closed(conn)
            | TransportEvent::Failed { conn, .. } => *conn,
        }
    }
}

/// The transport capability a [`PeerSession`] drives.
///
/// Implementations report progress asynchronously as [`TransportEvent`]s on
/// a channel of their choosing; these calls must not block.
pub trait Transport: Send {
    /// Start dialing `target`; the outcome arrives later as `Open` or `Failed`.
    fn connect(&mut self, target: &PeerId) -> ConnectionId;

    /// Queue one line for the peer on `conn`.
    fn send(&mut self, conn: ConnectionId, line: String);

    /// Close `conn` and release everything held for it. Idempotent; also
    /// used to refuse inbound attempts and cancel dials.
    fn close(&mut self, conn: ConnectionId);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Why a link ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeverReason {
    /// We hung up.
    Disconnected,
    /// The peer hung up or the link went away.
    Closed,
    /// The transport could not establish or keep the channel.
    Failed(String),
}

impl SeverReason {
    /// The error to surface, if the severance was not a clean hang-up.
    pub fn as_error(&self) -> Option<SessionError> {
        match self {
            SeverReason::Failed(reason) => Some(SessionError::ConnectionFailed(reason.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for SeverReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeverReason::Disconnected => write!(f, "disconnected"),
            SeverReason::Closed => write!(f, "closed by peer"),
            SeverReason::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// What the session tells its owner after handling an input.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// An inbound attempt was accepted; now `Connecting`.
    Incoming { remote: PeerId },
    /// The link is open; now `Active`.
    Opened { remote: PeerId },
    /// A message arrived on the active link.
    Message(ProtocolMessage),
    /// The link ended; now `Severed`.
    Severed { remote: PeerId, reason: SeverReason },
    /// A link still being set up was abandoned; now `Idle`.
    Cancelled { remote: PeerId },
}

#[derive(Debug, Clone)]
struct Link {
    conn: ConnectionId,
    remote: PeerId,
    direction: Direction,
}

/// Identity plus the single link, as a state machine over a [`Transport`].
#[derive(Debug)]
pub struct PeerSession<T> {
    local_id: PeerId,
    transport: T,
    state: ConnectionState,
    link: Option<Link>,
}

impl<T: Transport> PeerSession<T> {
    pub fn new(local_id: PeerId, transport: T) -> Self {
        Self {
            local_id,
            transport,
            state: ConnectionState::Idle,
            link: None,
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The peer on the current link, while `Connecting` or `Active`.
    pub fn remote(&self) -> Option<&PeerId> {
        self.link.as_ref().map(|link| &link.remote)
    }

    fn transition_to(&mut self, new_state: ConnectionState) {
        debug!(from = %self.state, to = %new_state, "Session state transition");
        self.state = new_state;
    }

    /// Check that `target` is something we could dial at all.
    pub fn validate_target(&self, target: &PeerId) -> Result<(), InvalidTarget> {
        if target.is_empty() {
            return Err(InvalidTarget::Empty);
        }
        if *target == self.local_id {
            return Err(InvalidTarget::SelfTarget);
        }
        Ok(())
    }

    /// Dial `target`. Only valid from `Idle`; empty and self targets are
    /// rejected before the transport is touched.
    pub fn connect_out(&mut self, target: &PeerId) -> Result<(), SessionError> {
        self.validate_target(target)?;
        if self.state != ConnectionState::Idle {
            return Err(SessionError::NotIdle(self.state));
        }

        let conn = self.transport.connect(target);
        info!(%conn, remote = %target, "Dialing peer");
        self.link = Some(Link {
            conn,
            remote: target.clone(),
            direction: Direction::Outbound,
        });
        self.transition_to(ConnectionState::Connecting);
        Ok(())
    }

    /// Feed one transport event through the state machine.
    pub fn handle(&mut self, event: TransportEvent) -> Option<SessionEvent> {
        if let TransportEvent::Inbound { conn, remote } = event {
            return self.accept_inbound(conn, remote);
        }

        let conn = event.conn();
        let current = match &self.link {
            Some(link) if link.conn == conn => link.clone(),
            _ => {
                debug!(%conn, "Dropping event for stale connection");
                return None;
            }
        };

        match event {
            TransportEvent::Inbound { .. } => None,
            TransportEvent::Open(_) => {
                if self.state != ConnectionState::Connecting {
                    debug!(%conn, state = %self.state, "Ignoring duplicate open");
                    return None;
                }
                info!(%conn, remote = %current.remote, direction = ?current.direction, "Link open");
                self.transition_to(ConnectionState::Active);
                Some(SessionEvent::Opened {
                    remote: current.remote,
                })
            }
            TransportEvent::Data(_, line) => {
                if self.state != ConnectionState::Active {
                    debug!(%conn, "Dropping data received before open");
                    return None;
                }
                match ProtocolMessage::decode(&line) {
                    Ok(Decoded::Message(message)) => Some(SessionEvent::Message(message)),
                    Ok(Decoded::Unknown { kind }) => {
                        debug!(%conn, %kind, "Ignoring unknown message type");
                        None
                    }
                    Err(e) => {
                        warn!(%conn, "Invalid message: {}", e);
                        None
                    }
                }
            }
            TransportEvent::Closed(_) => self.sever(SeverReason::Closed),
            TransportEvent::Failed { reason, .. } => self.sever(SeverReason::Failed(reason)),
        }
    }

    fn accept_inbound(&mut self, conn: ConnectionId, remote: PeerId) -> Option<SessionEvent> {
        if self.state != ConnectionState::Idle {
            info!(%conn, %remote, state = %self.state, "Refusing inbound link, already busy");
            self.transport.close(conn);
            return None;
        }

        info!(%conn, %remote, "Accepting inbound link");
        self.link = Some(Link {
            conn,
            remote: remote.clone(),
            direction: Direction::Inbound,
        });
        self.transition_to(ConnectionState::Connecting);
        Some(SessionEvent::Incoming { remote })
    }

    /// Close the current link and move to `Severed`.
    fn sever(&mut self, reason: SeverReason) -> Option<SessionEvent> {
        let link = self.link.take()?;
        self.transport.close(link.conn);
        info!(conn = %link.conn, remote = %link.remote, %reason, "Link severed");
        self.transition_to(ConnectionState::Severed);
        Some(SessionEvent::Severed {
            remote: link.remote,
            reason,
        })
    }

    /// Send `message` on the active link. Outside `Active` this is a silent
    /// no-op, since a send can race a link that just closed.
    pub fn send(&mut self, message: &ProtocolMessage) -> bool {
        let conn = match (&self.link, self.state) {
            (Some(link), ConnectionState::Active) => link.conn,
            _ => return false,
        };
        match message.encode() {
            Ok(line) => {
                self.transport.send(conn, line);
                true
            }
            Err(e) => {
                warn!(%conn, "Dropping unencodable message: {}", e);
                false
            }
        }
    }

    /// Hang up. `Active` goes to `Severed`; `Connecting` is cancelled straight
    /// back to `Idle`; anything else is a no-op.
    pub fn disconnect(&mut self) -> Option<SessionEvent> {
        match self.state {
            ConnectionState::Active => self.sever(SeverReason::Disconnected),
            ConnectionState::Connecting => {
                let link = self.link.take()?;
                self.transport.close(link.conn);
                info!(conn = %link.conn, remote = %link.remote, "Link attempt cancelled");
                self.transition_to(ConnectionState::Idle);
                Some(SessionEvent::Cancelled {
                    remote: link.remote,
                })
            }
            ConnectionState::Idle | ConnectionState::Severed => None,
        }
    }

    /// Leave `Severed` for `Idle`. Returns false from any other state.
    pub fn reset(&mut self) -> bool {
        if self.state != ConnectionState::Severed {
            return false;
        }
        self.transition_to(ConnectionState::Idle);
        true
    }
}
