//! Vivre - peer-to-peer location link
//!
//! Two peers find each other by node id, open a single iroh link and stream
//! their positions to one another. Each side turns the pair of positions into
//! a bearing and distance. When the link burns, the session stays severed for
//! a short grace period before it accepts a new target.
//!
//! ## Layout
//!
//! * [`geodesy`] - great-circle bearing and distance
//! * [`location`] - position samples and the sources that produce them
//! * [`protocol`] - the JSON-lines wire format
//! * [`session`] - the connection state machine, independent of any network
//! * [`coordinator`] - the task that owns a session and its severance timer
//! * [`transport`] - the iroh implementation of the session's transport
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use vivre::geodesy::Coordinate;
//! use vivre::location::{FixedSource, LocationSource};
//! use vivre::transport::{bind_endpoint, IrohTransport};
//! use vivre::{PeerSession, SessionConfig, SessionCoordinator, ALPN};
//! use iroh::protocol::Router;
//! use iroh::SecretKey;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let endpoint = bind_endpoint(SecretKey::generate(&mut rand::thread_rng())).await?;
//! let (transport, handler, events) = IrohTransport::new(endpoint.clone());
//! let router = Router::builder(endpoint).accept(ALPN, handler).spawn().await?;
//!
//! let session = PeerSession::new(transport.local_id(), transport);
//! let (coordinator, handle) = SessionCoordinator::new(session, SessionConfig::default());
//! let position = Coordinate::new(51.5, -0.12)?;
//! let watch = FixedSource::new(position, Duration::from_secs(1)).start();
//! tokio::spawn(coordinator.run(events, watch));
//!
//! handle.connect_to("<peer node id>").await?;
//! # router.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod coordinator;
pub mod error;
pub mod geodesy;
pub mod identity;
pub mod location;
pub mod protocol;
pub mod session;
pub mod transport;

pub use coordinator::{SessionConfig, SessionCoordinator, SessionHandle, Signal, Snapshot};
pub use error::{InvalidTarget, ProtocolError, SessionError};
pub use geodesy::{Coordinate, Tracking};
pub use identity::PeerId;
pub use location::{LocationError, LocationSample, LocationSource};
pub use protocol::{ProtocolMessage, ALPN};
pub use session::{ConnectionState, PeerSession, Transport, TransportEvent};
pub use transport::{IrohTransport, LinkHandler};
