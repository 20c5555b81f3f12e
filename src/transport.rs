//! iroh transport for the location link.
//!
//! [`IrohTransport`] dials peers by node id and [`LinkHandler`] accepts them
//! through the iroh router. Both sides run the same per-connection loop:
//! lines queued by the session are written to the bi-stream, lines read from
//! it are reported as [`TransportEvent::Data`], and the end of the stream is
//! reported as `Closed` or `Failed`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use futures_lite::future::Boxed as BoxFuture;
use iroh::endpoint::{Connection, ConnectionError, RecvStream, SendStream};
use iroh::protocol::ProtocolHandler;
use iroh::{Endpoint, SecretKey};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::identity::PeerId;
use crate::protocol::{ALPN, PREAMBLE};
use crate::session::{ConnectionId, Transport, TransportEvent};

/// How long a dial may take before it counts as failed.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// QUIC close reason sent when we hang up.
const CLOSE_REASON: &[u8] = b"link burned";

/// Bind an endpoint that publishes its address through n0 DNS discovery, so
/// peers can reach it by node id alone.
pub async fn bind_endpoint(secret_key: SecretKey) -> Result<Endpoint> {
    Endpoint::builder()
        .secret_key(secret_key)
        .discovery_n0()
        .bind()
        .await
        .context("binding iroh endpoint")
}

/// Resources held for one live or dialing connection.
#[derive(Debug)]
struct LinkHandle {
    outbound: mpsc::UnboundedSender<String>,
    connection: Option<Connection>,
    dial: Option<AbortHandle>,
}

/// Connection ids and handles shared by the dialer and the acceptor.
#[derive(Debug, Default)]
pub struct Links {
    next_id: AtomicU64,
    active: DashMap<ConnectionId, LinkHandle>,
}

impl Links {
    fn allocate(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn register(&self, conn: ConnectionId) -> mpsc::UnboundedReceiver<String> {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        self.active.insert(
            conn,
            LinkHandle {
                outbound,
                connection: None,
                dial: None,
            },
        );
        outbound_rx
    }

    fn set_dial(&self, conn: ConnectionId, dial: AbortHandle) {
        if let Some(mut handle) = self.active.get_mut(&conn) {
            handle.dial = Some(dial);
        }
    }

    /// Record the established connection. False if the link was already
    /// released while it was being set up.
    fn attach(&self, conn: ConnectionId, connection: Connection) -> bool {
        match self.active.get_mut(&conn) {
            Some(mut handle) => {
                handle.connection = Some(connection);
                true
            }
            None => false,
        }
    }

    fn release(&self, conn: ConnectionId) -> Option<LinkHandle> {
        self.active.remove(&conn).map(|(_, handle)| handle)
    }

    fn outbound(&self, conn: ConnectionId) -> Option<mpsc::UnboundedSender<String>> {
        self.active.get(&conn).map(|handle| handle.outbound.clone())
    }
}

/// The dialing half of the transport; hand it to a `PeerSession`.
#[derive(Debug)]
pub struct IrohTransport {
    endpoint: Endpoint,
    links: Arc<Links>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl IrohTransport {
    /// Create the transport, the inbound handler to register with the router
    /// under [`ALPN`], and the receiver for all transport events.
    pub fn new(endpoint: Endpoint) -> (Self, LinkHandler, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let links = Arc::new(Links::default());
        let handler = LinkHandler {
            links: Arc::clone(&links),
            events: events.clone(),
        };
        let transport = Self {
            endpoint,
            links,
            events,
        };
        (transport, handler, events_rx)
    }

    pub fn local_id(&self) -> PeerId {
        PeerId::from(self.endpoint.node_id())
    }
}

impl Transport for IrohTransport {
    fn connect(&mut self, target: &PeerId) -> ConnectionId {
        let conn = self.links.allocate();
        let outbound_rx = self.links.register(conn);
        let task = tokio::spawn(dial(
            self.endpoint.clone(),
            Arc::clone(&self.links),
            self.events.clone(),
            conn,
            target.clone(),
            outbound_rx,
        ));
        self.links.set_dial(conn, task.abort_handle());
        conn
    }

    fn send(&mut self, conn: ConnectionId, line: String) {
        match self.links.outbound(conn) {
            Some(outbound) => {
                if outbound.send(line).is_err() {
                    debug!(%conn, "Link writer already gone");
                }
            }
            None => debug!(%conn, "Send on released link"),
        }
    }

    fn close(&mut self, conn: ConnectionId) {
        let Some(handle) = self.links.release(conn) else {
            return;
        };
        match handle.connection {
            Some(connection) => connection.close(0u32.into(), CLOSE_REASON),
            None => {
                if let Some(dial) = handle.dial {
                    dial.abort();
                }
            }
        }
        debug!(%conn, "Link released");
    }
}

/// Dial `target`, then run the link until it ends.
async fn dial(
    endpoint: Endpoint,
    links: Arc<Links>,
    events: mpsc::UnboundedSender<TransportEvent>,
    conn: ConnectionId,
    target: PeerId,
    outbound_rx: mpsc::UnboundedReceiver<String>,
) {
    let opened = tokio::time::timeout(DIAL_TIMEOUT, open_link(&endpoint, &target)).await;
    let (connection, send, recv) = match opened {
        Ok(Ok(parts)) => parts,
        Ok(Err(e)) => {
            warn!(%conn, remote = %target, "Dial failed: {:#}", e);
            links.release(conn);
            let _ = events.send(TransportEvent::Failed {
                conn,
                reason: format!("{:#}", e),
            });
            return;
        }
        Err(_) => {
            warn!(%conn, remote = %target, "Dial timed out");
            links.release(conn);
            let _ = events.send(TransportEvent::Failed {
                conn,
                reason: "timed out".to_string(),
            });
            return;
        }
    };

    if !links.attach(conn, connection.clone()) {
        debug!(%conn, "Dial finished after the link was released");
        connection.close(0u32.into(), CLOSE_REASON);
        return;
    }

    let _ = events.send(TransportEvent::Open(conn));
    run_link(conn, connection, send, BufReader::new(recv), outbound_rx, &links, &events).await;
}

async fn open_link(
    endpoint: &Endpoint,
    target: &PeerId,
) -> Result<(Connection, SendStream, RecvStream)> {
    let node_id = target.to_node_id()?;
    debug!(%node_id, "Connecting...");
    let connection = endpoint.connect(node_id, ALPN).await?;
    let (mut send, recv) = connection.open_bi().await?;
    // the acceptor only sees the stream once something is written on it
    write_line(&mut send, PREAMBLE).await?;
    Ok((connection, send, recv))
}

/// Accepts inbound links for [`ALPN`].
#[derive(Debug, Clone)]
pub struct LinkHandler {
    links: Arc<Links>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl LinkHandler {
    /// Handle a single inbound connection for its whole lifetime.
    async fn handle_connection(&self, connection: Connection) -> Result<()> {
        let remote = PeerId::from(connection.remote_node_id()?);
        let conn = self.links.allocate();
        let outbound_rx = self.links.register(conn);
        self.links.attach(conn, connection.clone());
        info!(%conn, %remote, "Inbound connection");
        let _ = self.events.send(TransportEvent::Inbound {
            conn,
            remote: remote.clone(),
        });

        let accepted = accept_link(&connection).await;
        let (send, reader) = match accepted {
            Ok(parts) => parts,
            Err(e) => {
                // also the path taken when the session refused the link
                debug!(%conn, %remote, "Inbound link not opened: {:#}", e);
                if self.links.release(conn).is_some() {
                    let _ = self.events.send(TransportEvent::Failed {
                        conn,
                        reason: format!("{:#}", e),
                    });
                }
                connection.close(0u32.into(), CLOSE_REASON);
                return Ok(());
            }
        };

        let _ = self.events.send(TransportEvent::Open(conn));
        run_link(conn, connection, send, reader, outbound_rx, &self.links, &self.events).await;
        info!(%conn, %remote, "Inbound connection finished");
        Ok(())
    }
}

async fn accept_link(connection: &Connection) -> Result<(SendStream, BufReader<RecvStream>)> {
    let (send, recv) = connection.accept_bi().await?;
    let mut reader = BufReader::new(recv);
    let mut preamble = String::new();
    reader.read_line(&mut preamble).await?;
    if preamble.trim() != PREAMBLE {
        anyhow::bail!("unexpected preamble {:?}", preamble.trim());
    }
    // keep the reader, it may already hold lines sent right after the preamble
    Ok((send, reader))
}

impl ProtocolHandler for LinkHandler {
    fn accept(&self, conn: Connection) -> BoxFuture<Result<()>> {
        let this = self.clone();
        Box::pin(async move { this.handle_connection(conn).await })
    }
}

#[derive(Debug)]
enum LinkEnd {
    /// We released the link; the session already knows.
    Released,
    Closed,
    WriteFailed(String),
    ReadFailed(std::io::Error),
}

/// Pump lines both ways until either side ends the link.
async fn run_link(
    conn: ConnectionId,
    connection: Connection,
    writer: SendStream,
    reader: BufReader<RecvStream>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    links: &Links,
    events: &mpsc::UnboundedSender<TransportEvent>,
) {
    let end = pump_lines(conn, reader, writer, &mut outbound_rx, events).await;

    let failure = match end {
        LinkEnd::Released => {
            debug!(%conn, "Link loop stopped after release");
            None
        }
        LinkEnd::Closed => None,
        LinkEnd::WriteFailed(reason) => Some(reason),
        LinkEnd::ReadFailed(e) => match connection.close_reason() {
            Some(ConnectionError::ApplicationClosed(_)) => None,
            _ => Some(e.to_string()),
        },
    };

    if links.release(conn).is_some() {
        match failure {
            None => {
                debug!(%conn, "Link closed by peer");
                let _ = events.send(TransportEvent::Closed(conn));
            }
            Some(reason) => {
                warn!(%conn, "Link failed: {}", reason);
                let _ = events.send(TransportEvent::Failed { conn, reason });
            }
        }
    }
    connection.close(0u32.into(), CLOSE_REASON);
}

/// Write queued lines and report received ones until the stream ends or the
/// outbound queue is dropped.
async fn pump_lines<R, W>(
    conn: ConnectionId,
    reader: R,
    mut writer: W,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    events: &mpsc::UnboundedSender<TransportEvent>,
) -> LinkEnd
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // next_line keeps a partial line across cancellation, read_line does not
    let mut lines = reader.lines();

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(payload) => {
                        if let Err(e) = write_line(&mut writer, &payload).await {
                            return LinkEnd::WriteFailed(format!("{:#}", e));
                        }
                    }
                    None => {
                        let _ = writer.shutdown().await;
                        return LinkEnd::Released;
                    }
                }
            }

            result = lines.next_line() => {
                match result {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if !trimmed.is_empty() {
                            let _ = events.send(TransportEvent::Data(conn, trimmed.to_string()));
                        }
                    }
                    Ok(None) => return LinkEnd::Closed,
                    Err(e) => return LinkEnd::ReadFailed(e),
                }
            }
        }
    }
}

/// Write one newline-terminated line and flush it.
async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<()> {
    let mut framed = String::with_capacity(line.len() + 1);
    framed.push_str(line);
    framed.push('\n');
    writer.write_all(framed.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_are_unique_and_increasing() {
        let links = Links::default();
        let a = links.allocate();
        let b = links.allocate();
        assert_eq!(a, ConnectionId(1));
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let links = Links::default();
        let conn = links.allocate();
        let mut outbound_rx = links.register(conn);
        assert_eq!(links.active.len(), 1);

        assert!(links.outbound(conn).unwrap().send("hi".to_string()).is_ok());
        assert_eq!(outbound_rx.recv().await.as_deref(), Some("hi"));

        assert!(links.release(conn).is_some());
        assert!(links.release(conn).is_none());
        assert!(links.active.is_empty());
        // dropping the handle ends the writer side of the link loop
        assert_eq!(outbound_rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_split_line_survives_outbound_write() {
        let (local, remote) = tokio::io::duplex(1024);
        let (local_read, local_write) = tokio::io::split(local);
        let (remote_read, mut remote_write) = tokio::io::split(remote);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let conn = ConnectionId(7);
        let pump = tokio::spawn(async move {
            pump_lines(conn, BufReader::new(local_read), local_write, &mut outbound_rx, &events_tx)
                .await
        });

        let location = r#"{"type":"location","data":{"latitude":1.0,"longitude":2.0,"observedAt":3}}"#;
        remote_write.write_all(location.as_bytes()).await.unwrap();
        remote_write.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // our own write lands while the peer's line is still unterminated
        outbound_tx.send("local".to_string()).unwrap();
        let mut remote_lines = BufReader::new(remote_read).lines();
        assert_eq!(remote_lines.next_line().await.unwrap().as_deref(), Some("local"));

        remote_write.write_all(b"\n").await.unwrap();
        assert_eq!(
            next(&mut events_rx).await,
            TransportEvent::Data(conn, location.to_string())
        );

        remote_write.shutdown().await.unwrap();
        assert!(matches!(pump.await.unwrap(), LinkEnd::Closed));
        assert!(events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_queue_releases_link() {
        let (local, _remote) = tokio::io::duplex(64);
        let (local_read, local_write) = tokio::io::split(local);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        drop(outbound_tx);

        let end = pump_lines(
            ConnectionId(1),
            BufReader::new(local_read),
            local_write,
            &mut outbound_rx,
            &events_tx,
        )
        .await;
        assert!(matches!(end, LinkEnd::Released));
    }

    #[tokio::test]
    async fn test_two_endpoints_exchange_lines() {
        let (endpoint_a, endpoint_b) = match (local_endpoint().await, local_endpoint().await) {
            (Ok(a), Ok(b)) => (a, b),
            _ => return, // no usable network in this environment
        };
        let addr_b = match tokio::time::timeout(STEP, endpoint_b.node_addr()).await {
            Ok(Ok(addr)) if !addr.direct_addresses.is_empty() => addr,
            _ => return,
        };

        let (mut dialer, _handler_a, mut events_a) = IrohTransport::new(endpoint_a.clone());
        let (_acceptor, handler_b, mut events_b) = IrohTransport::new(endpoint_b.clone());
        let router_b = iroh::protocol::Router::builder(endpoint_b.clone())
            .accept(ALPN, handler_b)
            .spawn()
            .await
            .unwrap();
        endpoint_a.add_node_addr(addr_b.clone()).unwrap();

        let conn = dialer.connect(&PeerId::from(addr_b.node_id));
        assert_eq!(next(&mut events_a).await, TransportEvent::Open(conn));

        assert!(matches!(
            next(&mut events_b).await,
            TransportEvent::Inbound { .. }
        ));
        let inbound = match next(&mut events_b).await {
            TransportEvent::Open(inbound) => inbound,
            other => panic!("unexpected event: {:?}", other),
        };

        dialer.send(conn, r#"{"type":"ping"}"#.to_string());
        assert_eq!(
            next(&mut events_b).await,
            TransportEvent::Data(inbound, r#"{"type":"ping"}"#.to_string())
        );

        dialer.close(conn);
        dialer.close(conn);
        assert!(dialer.links.active.is_empty());
        assert!(matches!(
            next(&mut events_b).await,
            TransportEvent::Closed(c) | TransportEvent::Failed { conn: c, .. } if c == inbound
        ));

        let _ = router_b.shutdown().await;
        endpoint_a.close().await;
    }

    const STEP: Duration = Duration::from_secs(10);

    async fn next(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(STEP, events.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("transport event channel closed")
    }

    async fn local_endpoint() -> Result<Endpoint> {
        let endpoint = Endpoint::builder()
            .secret_key(SecretKey::generate(&mut rand::thread_rng()))
            .relay_mode(iroh::RelayMode::Disabled)
            .bind()
            .await?;
        Ok(endpoint)
    }
}
