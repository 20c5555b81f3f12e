//! Vivre - peer-to-peer location link
//!
//! Console front end: prints this node's id, links to one peer at a time and
//! shows where that peer is.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use iroh::protocol::Router;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};

use vivre::coordinator::{SessionConfig, SessionCoordinator, SessionHandle, Signal, Snapshot};
use vivre::geodesy::Coordinate;
use vivre::identity::load_or_generate_key;
use vivre::location::{FixedSource, LocationSource, ManualFeed, ManualSource, ReplaySource};
use vivre::protocol::ALPN;
use vivre::session::PeerSession;
use vivre::transport::{bind_endpoint, IrohTransport};

/// Command-line arguments for the location link.
#[derive(Debug, Parser)]
#[command(name = "vivre")]
#[command(about = "Share your position with one peer and see where they are")]
struct Args {
    /// Path to the secret key file. If not specified, a new key is generated.
    #[arg(short, long)]
    key_file: Option<PathBuf>,

    /// Node id of a peer to link with on startup.
    #[arg(short, long)]
    connect: Option<String>,

    /// Report a fixed latitude (requires --lng).
    #[arg(long, requires = "lng", allow_negative_numbers = true)]
    lat: Option<f64>,

    /// Report a fixed longitude (requires --lat).
    #[arg(long, requires = "lat", allow_negative_numbers = true)]
    lng: Option<f64>,

    /// Replay positions from a file with one fix per line, either `lat,lng` or
    /// `{"latitude":..,"longitude":..}`.
    #[arg(long, conflicts_with_all = ["lat", "lng"])]
    replay: Option<PathBuf>,

    /// Milliseconds between reported positions for fixed and replayed sources.
    #[arg(long, default_value = "1000")]
    interval_ms: u64,

    /// Milliseconds a burned link stays severed before a new target is allowed.
    #[arg(long, default_value = "3500")]
    grace_ms: u64,
}

/// Pick the location source from the arguments. Without a fixed position or a
/// replay file, positions come from the `fix` console command.
fn location_source(args: &Args) -> Result<(Box<dyn LocationSource>, Option<ManualFeed>)> {
    let interval = Duration::from_millis(args.interval_ms);
    if let Some(path) = &args.replay {
        info!(path = %path.display(), "Replaying positions");
        return Ok((Box::new(ReplaySource::new(path, interval).repeating()), None));
    }
    if let (Some(lat), Some(lng)) = (args.lat, args.lng) {
        let position = Coordinate::new(lat, lng).context("invalid --lat/--lng")?;
        info!(%lat, %lng, "Reporting a fixed position");
        return Ok((Box::new(FixedSource::new(position, interval)), None));
    }
    let source = ManualSource::new();
    let feed = source.feed();
    Ok((Box::new(source), Some(feed)))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vivre=info".parse()?)
                .add_directive("iroh=warn".parse()?),
        )
        .init();

    let args = Args::parse();

    let secret_key = load_or_generate_key(args.key_file.as_deref())?;
    let endpoint = bind_endpoint(secret_key).await?;

    // Wait for relay connection to establish and log the relay URL
    let mut relay_watcher = endpoint.home_relay();
    match tokio::time::timeout(Duration::from_secs(10), relay_watcher.initialized()).await {
        Ok(Ok(relay_url)) => {
            info!("Relay URL: {}", relay_url);
        }
        Ok(Err(_)) => {
            warn!("Relay watcher disconnected - peers will need direct connectivity");
        }
        Err(_) => {
            warn!("Timeout waiting for relay connection - peers will need direct connectivity");
        }
    }

    let (transport, handler, events) = IrohTransport::new(endpoint.clone());
    let router = Router::builder(endpoint.clone())
        .accept(ALPN, handler)
        .spawn()
        .await?;

    let local_id = transport.local_id();
    println!("Your id: {}", local_id);
    println!("Callsign: {}", local_id.callsign());

    let (mut source, feed) = location_source(&args)?;
    let config = SessionConfig {
        severance_grace: Duration::from_millis(args.grace_ms),
    };
    let session = PeerSession::new(local_id, transport);
    let (coordinator, handle) = SessionCoordinator::new(session, config);
    let signals = handle.subscribe();
    let coordinator_task = tokio::spawn(coordinator.run(events, source.start()));
    tokio::spawn(render_signals(signals));

    if let Some(target) = &args.connect {
        if let Err(e) = handle.connect_to(target.as_str()).await {
            println!("Cannot connect: {}", e);
        }
    }

    println!("Commands: connect <id> | disconnect | fix <lat> <lng> | status | id | quit");
    tokio::select! {
        result = console(&handle, feed.as_ref()) => {
            if let Err(e) = result {
                warn!("Console stopped: {:#}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {}
    }

    info!("Shutting down...");

    handle.shutdown().await;
    if let Err(e) = coordinator_task.await {
        warn!("Coordinator task failed: {}", e);
    }
    router.shutdown().await?;
    endpoint.close().await;

    info!("Stopped");

    Ok(())
}

/// Read commands from stdin until `quit` or end of input.
async fn console(handle: &SessionHandle, feed: Option<&ManualFeed>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut words = line.split_whitespace();
        match (words.next(), words.next(), words.next()) {
            (None, _, _) => {}
            (Some("connect"), Some(target), None) => {
                if let Err(e) = handle.connect_to(target).await {
                    println!("Cannot connect: {}", e);
                }
            }
            (Some("disconnect"), None, None) => handle.disconnect().await?,
            (Some("fix"), Some(lat), Some(lng)) => match feed {
                Some(feed) => match parse_fix(lat, lng) {
                    Some(position) => {
                        feed.push(position);
                    }
                    None => println!("Not a valid position: {} {}", lat, lng),
                },
                None => println!("Positions come from the command line in this run"),
            },
            (Some("status"), None, None) => print_status(&handle.snapshot()),
            (Some("id"), None, None) => {
                let snapshot = handle.snapshot();
                println!("{} ({})", snapshot.local_id, snapshot.local_id.callsign());
            }
            (Some("quit"), None, None) => break,
            _ => println!("Commands: connect <id> | disconnect | fix <lat> <lng> | status | id | quit"),
        }
    }
    Ok(())
}

fn parse_fix(lat: &str, lng: &str) -> Option<Coordinate> {
    let lat = lat.parse().ok()?;
    let lng = lng.parse().ok()?;
    Coordinate::new(lat, lng).ok()
}

fn print_status(snapshot: &Snapshot) {
    println!("State: {}", snapshot.state);
    if let Some(remote) = &snapshot.remote_id {
        println!("Peer: {} ({})", remote.callsign(), remote);
    }
    if let Some(local) = &snapshot.local {
        println!("You: {:.5}, {:.5}", local.latitude(), local.longitude());
    }
    if let Some(remote) = &snapshot.remote {
        println!("Them: {:.5}, {:.5}", remote.latitude(), remote.longitude());
    }
    if let Some(tracking) = &snapshot.tracking {
        println!("Tracking: {}", tracking);
    }
    if let Some(error) = &snapshot.location_error {
        println!("{} (this card won't move)", error);
    }
}

async fn render_signals(mut signals: broadcast::Receiver<Signal>) {
    loop {
        match signals.recv().await {
            Ok(Signal::Incoming { remote }) => println!("{} is reaching out...", remote.callsign()),
            Ok(Signal::Linked { remote }) => println!("Linked with {}", remote.callsign()),
            Ok(Signal::Tracked(tracking)) => println!("Target at {}", tracking),
            Ok(Signal::LinkSevered { remote, reason }) => {
                println!("Link with {} burned: {}", remote.callsign(), reason)
            }
            Ok(Signal::ReadyAgain) => println!("Ready for a new target"),
            Ok(Signal::LocationUnavailable(error)) => {
                println!("location unavailable: this card won't move ({})", error)
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Dropped signals");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
