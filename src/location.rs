//! Location samples and the sources that produce them.
//!
//! A [`LocationSource`] is started to obtain a [`LocationWatch`], a
//! subscription yielding samples until it is stopped, its source runs dry, or
//! the source reports a terminal [`LocationError`]. Sources can be started
//! again after a watch ends.

use std::future::Future;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::geodesy::{Coordinate, CoordinateError};

/// Buffered updates per subscription before the producer waits.
const WATCH_CAPACITY: usize = 16;

/// Terminal failures of a location subscription.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocationError {
    #[error("location permission denied")]
    Denied,

    #[error("{0}")]
    Unavailable(String),
}

/// One observed position. Replaced wholesale, never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireSample", try_from = "WireSample")]
pub struct LocationSample {
    position: Coordinate,
    observed_at: u64,
}

/// Flat wire layout: `{ "latitude", "longitude", "observedAt" }`.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSample {
    latitude: f64,
    longitude: f64,
    observed_at: u64,
}

impl From<LocationSample> for WireSample {
    fn from(sample: LocationSample) -> Self {
        Self {
            latitude: sample.position.latitude(),
            longitude: sample.position.longitude(),
            observed_at: sample.observed_at,
        }
    }
}

impl TryFrom<WireSample> for LocationSample {
    type Error = CoordinateError;

    fn try_from(wire: WireSample) -> Result<Self, Self::Error> {
        LocationSample::new(wire.latitude, wire.longitude, wire.observed_at)
    }
}

impl LocationSample {
    /// Create a sample; `observed_at` is milliseconds since the Unix epoch.
    pub fn new(latitude: f64, longitude: f64, observed_at: u64) -> Result<Self, CoordinateError> {
        Ok(Self::at(Coordinate::new(latitude, longitude)?, observed_at))
    }

    pub fn at(position: Coordinate, observed_at: u64) -> Self {
        Self {
            position,
            observed_at,
        }
    }

    /// A sample of `position` stamped with the current wall-clock time.
    pub fn now(position: Coordinate) -> Self {
        Self::at(position, unix_millis())
    }

    pub fn position(&self) -> Coordinate {
        self.position
    }

    pub fn latitude(&self) -> f64 {
        self.position.latitude()
    }

    pub fn longitude(&self) -> f64 {
        self.position.longitude()
    }

    pub fn observed_at(&self) -> u64 {
        self.observed_at
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// What a subscription delivers.
#[derive(Debug, Clone, PartialEq)]
pub enum LocationUpdate {
    Sample(LocationSample),
    /// Terminal; delivered at most once, after which the watch yields `None`.
    Failed(LocationError),
}

/// Something that can observe the device position continuously.
pub trait LocationSource: Send {
    /// Begin a new subscription.
    fn start(&mut self) -> LocationWatch;
}

/// A running location subscription.
///
/// Timestamps are non-decreasing per watch: a fix that arrives stamped
/// earlier than its predecessor is re-stamped with the predecessor's time.
#[derive(Debug)]
pub struct LocationWatch {
    updates: mpsc::Receiver<LocationUpdate>,
    task: Option<JoinHandle<()>>,
    last_observed: Option<u64>,
    finished: bool,
}

impl LocationWatch {
    /// Run `producer` as the body of a new subscription.
    ///
    /// The producer should return once `send` fails; that means the watch
    /// was stopped or dropped.
    pub fn spawn<F, Fut>(producer: F) -> Self
    where
        F: FnOnce(mpsc::Sender<LocationUpdate>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(WATCH_CAPACITY);
        let task = tokio::spawn(producer(tx));
        Self {
            updates: rx,
            task: Some(task),
            last_observed: None,
            finished: false,
        }
    }

    /// Wait for the next update. Cancel safe.
    pub async fn next(&mut self) -> Option<LocationUpdate> {
        if self.finished {
            return None;
        }
        match self.updates.recv().await {
            Some(LocationUpdate::Sample(sample)) => {
                let sample = match self.last_observed {
                    Some(last) if sample.observed_at < last => {
                        LocationSample::at(sample.position, last)
                    }
                    _ => sample,
                };
                self.last_observed = Some(sample.observed_at);
                Some(LocationUpdate::Sample(sample))
            }
            Some(LocationUpdate::Failed(error)) => {
                self.stop();
                Some(LocationUpdate::Failed(error))
            }
            None => {
                self.finished = true;
                None
            }
        }
    }

    /// Release the subscription. Idempotent.
    pub fn stop(&mut self) {
        self.finished = true;
        self.updates.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.finished
    }
}

impl Drop for LocationWatch {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A position that never moves, re-reported every `interval`.
#[derive(Debug, Clone)]
pub struct FixedSource {
    position: Coordinate,
    interval: Duration,
}

impl FixedSource {
    pub fn new(position: Coordinate, interval: Duration) -> Self {
        Self { position, interval }
    }
}

impl LocationSource for FixedSource {
    fn start(&mut self) -> LocationWatch {
        let position = self.position;
        let interval = self.interval;
        LocationWatch::spawn(move |tx| async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let update = LocationUpdate::Sample(LocationSample::now(position));
                if tx.send(update).await.is_err() {
                    break;
                }
            }
        })
    }
}

/// Replays positions from a file with one JSON object per line,
/// `{"latitude": .., "longitude": ..}`, one every `interval`.
#[derive(Debug, Clone)]
pub struct ReplaySource {
    path: PathBuf,
    interval: Duration,
    repeat: bool,
}

impl ReplaySource {
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            interval,
            repeat: false,
        }
    }

    /// Loop back to the first fix after the last one.
    pub fn repeating(mut self) -> Self {
        self.repeat = true;
        self
    }
}

/// One fix per line, either `{"latitude":..,"longitude":..}` or `lat,lng`.
/// Blank lines and `#` comments are skipped.
fn parse_track(contents: &str) -> Vec<Coordinate> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| match parse_fix(line) {
            Ok(position) => Some(position),
            Err(e) => {
                warn!(%line, "Skipping unreadable fix: {}", e);
                None
            }
        })
        .collect()
}

fn parse_fix(line: &str) -> Result<Coordinate, String> {
    if line.starts_with('{') {
        return serde_json::from_str::<Coordinate>(line).map_err(|e| e.to_string());
    }
    let (lat, lng) = line
        .split_once(',')
        .ok_or_else(|| "expected `lat,lng` or a JSON object".to_string())?;
    let lat = lat.trim().parse::<f64>().map_err(|e| e.to_string())?;
    let lng = lng.trim().parse::<f64>().map_err(|e| e.to_string())?;
    Coordinate::new(lat, lng).map_err(|e| e.to_string())
}

impl LocationSource for ReplaySource {
    fn start(&mut self) -> LocationWatch {
        let path = self.path.clone();
        let interval = self.interval;
        let repeat = self.repeat;
        LocationWatch::spawn(move |tx| async move {
            let track = match tokio::fs::read_to_string(&path).await {
                Ok(contents) => parse_track(&contents),
                Err(e) => {
                    let reason = format!("cannot read {}: {}", path.display(), e);
                    let _ = tx
                        .send(LocationUpdate::Failed(LocationError::Unavailable(reason)))
                        .await;
                    return;
                }
            };
            if track.is_empty() {
                let reason = format!("no fixes in {}", path.display());
                let _ = tx
                    .send(LocationUpdate::Failed(LocationError::Unavailable(reason)))
                    .await;
                return;
            }

            debug!(path = %path.display(), fixes = track.len(), "Replaying track");
            let mut ticker = tokio::time::interval(interval);
            loop {
                for position in &track {
                    ticker.tick().await;
                    let update = LocationUpdate::Sample(LocationSample::now(*position));
                    if tx.send(update).await.is_err() {
                        return;
                    }
                }
                if !repeat {
                    return;
                }
            }
        })
    }
}

#[derive(Debug, Clone)]
enum ManualFix {
    Position(Coordinate),
    Fail(LocationError),
}

/// A source driven by hand through its [`ManualFeed`]s.
///
/// Fixes pushed while no watch is running are lost.
#[derive(Debug, Clone)]
pub struct ManualSource {
    fixes: broadcast::Sender<ManualFix>,
}

/// Pushes fixes into a [`ManualSource`].
#[derive(Debug, Clone)]
pub struct ManualFeed {
    fixes: broadcast::Sender<ManualFix>,
}

impl Default for ManualSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualSource {
    pub fn new() -> Self {
        let (fixes, _) = broadcast::channel(WATCH_CAPACITY);
        Self { fixes }
    }

    pub fn feed(&self) -> ManualFeed {
        ManualFeed {
            fixes: self.fixes.clone(),
        }
    }
}

impl ManualFeed {
    /// Report a new position, stamped now. Returns false if nobody is watching.
    pub fn push(&self, position: Coordinate) -> bool {
        self.fixes.send(ManualFix::Position(position)).is_ok()
    }

    /// End every running watch with `error`.
    pub fn fail(&self, error: LocationError) -> bool {
        self.fixes.send(ManualFix::Fail(error)).is_ok()
    }
}

impl LocationSource for ManualSource {
    fn start(&mut self) -> LocationWatch {
        let mut fixes = self.fixes.subscribe();
        LocationWatch::spawn(move |tx| async move {
            loop {
                let update = match fixes.recv().await {
                    Ok(ManualFix::Position(position)) => {
                        LocationUpdate::Sample(LocationSample::now(position))
                    }
                    Ok(ManualFix::Fail(error)) => {
                        let _ = tx.send(LocationUpdate::Failed(error)).await;
                        return;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Manual location feed lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                if tx.send(update).await.is_err() {
                    return;
                }
            }
        })
    }
}
