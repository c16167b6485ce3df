//! Concrete implementations of the capability traits.
//!
//! These back the `tripwatch` binary: a recorded track stands in for the
//! position sensor, sysfs supplies the battery level, trips come from a JSON
//! file, and notifications go to the log.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::checkin::{
    CheckInKind, Destination, DestinationStatus, Notification, NotificationKind, Notifier,
    NotifyError, TripCollaborator, TripError,
};
use crate::device::{BatteryMonitor, ConnectivitySource};
use crate::error::{Error, Result};
use crate::position::{
    AcquisitionOptions, PermissionStatus, PositionError, PositionFix, PositionSample,
    PositionSource, SourceKind,
};

/// Default sysfs directory listing power supplies.
const POWER_SUPPLY_DIR: &str = "/sys/class/power_supply";

/// One point of a recorded track.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct TrackPoint {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Horizontal accuracy in meters.
    pub accuracy_meters: f64,
}

/// Replays a recorded track, one point per acquisition.
///
/// Fixes are stamped with the time they are handed out.
#[derive(Debug)]
pub struct ReplaySource {
    kind: SourceKind,
    points: StdMutex<VecDeque<TrackPoint>>,
}

impl ReplaySource {
    /// Build a source from points already in memory.
    #[must_use]
    pub fn from_points(kind: SourceKind, points: impl IntoIterator<Item = TrackPoint>) -> Self {
        Self {
            kind,
            points: StdMutex::new(points.into_iter().collect()),
        }
    }

    /// Load a JSON-lines track file. Blank lines are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or a line is malformed.
    pub fn from_path(kind: SourceKind, path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut points = Vec::new();
        for (n, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let point: TrackPoint = serde_json::from_str(line).map_err(|e| {
                Error::config(format!("{}:{}: invalid track point: {e}", path.display(), n + 1))
            })?;
            points.push(point);
        }
        info!("Loaded {} track points from {}", points.len(), path.display());
        Ok(Self::from_points(kind, points))
    }

    /// Points not yet handed out.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.points.lock().map_or(0, |p| p.len())
    }
}

#[async_trait]
impl PositionSource for ReplaySource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn check_permission(&self) -> PermissionStatus {
        PermissionStatus::Granted
    }

    async fn current_position(
        &self,
        _options: AcquisitionOptions,
    ) -> std::result::Result<PositionFix, PositionError> {
        let next = self
            .points
            .lock()
            .map_err(|_| PositionError::Unavailable("track lock poisoned".to_string()))?
            .pop_front();
        let point = next.ok_or_else(|| PositionError::Unavailable("track exhausted".to_string()))?;
        Ok(PositionFix {
            latitude: point.latitude,
            longitude: point.longitude,
            accuracy_meters: point.accuracy_meters,
            timestamp_ms: Utc::now().timestamp_millis(),
        })
    }
}

/// Connectivity flag that can be flipped at runtime.
#[derive(Debug)]
pub struct SwitchableConnectivity {
    state: watch::Sender<bool>,
}

impl SwitchableConnectivity {
    /// Start in the given state.
    #[must_use]
    pub fn new(online: bool) -> Self {
        let (state, _) = watch::channel(online);
        Self { state }
    }

    /// Change the state; subscribers are notified on transitions only.
    pub fn set_online(&self, online: bool) {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!("Connectivity changed: {}", if online { "online" } else { "offline" });
        }
    }
}

impl ConnectivitySource for SwitchableConnectivity {
    fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

/// Battery level read from a Linux sysfs `capacity` file.
#[derive(Debug, Clone)]
pub struct SysfsBattery {
    capacity_path: PathBuf,
}

impl SysfsBattery {
    /// Read from an explicit `capacity` file.
    #[must_use]
    pub fn new(capacity_path: impl Into<PathBuf>) -> Self {
        Self {
            capacity_path: capacity_path.into(),
        }
    }

    /// Find the first supply of type `Battery` under `/sys/class/power_supply`.
    #[must_use]
    pub fn discover() -> Option<Self> {
        Self::discover_in(Path::new(POWER_SUPPLY_DIR))
    }

    fn discover_in(dir: &Path) -> Option<Self> {
        let mut supplies: Vec<PathBuf> = std::fs::read_dir(dir)
            .ok()?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect();
        supplies.sort();

        supplies.into_iter().find_map(|supply| {
            let kind = std::fs::read_to_string(supply.join("type")).ok()?;
            (kind.trim() == "Battery").then(|| Self::new(supply.join("capacity")))
        })
    }

    /// The file being read.
    #[must_use]
    pub fn capacity_path(&self) -> &Path {
        &self.capacity_path
    }
}

#[async_trait]
impl BatteryMonitor for SysfsBattery {
    async fn level(&self) -> Option<u8> {
        match tokio::fs::read_to_string(&self.capacity_path).await {
            Ok(text) => text.trim().parse::<u8>().ok().map(|pct| pct.min(100)),
            Err(e) => {
                debug!("Battery level unavailable: {}", e);
                None
            }
        }
    }
}

/// Battery that always reports the same level.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedBattery(pub Option<u8>);

#[async_trait]
impl BatteryMonitor for FixedBattery {
    async fn level(&self) -> Option<u8> {
        self.0
    }
}

/// A check-in recorded by [`InMemoryTrips`].
#[derive(Debug, Clone, PartialEq)]
pub struct CheckInRecord {
    /// Destination checked in at.
    pub destination_id: String,
    /// Position at check-in, if known.
    pub position: Option<PositionSample>,
    /// How the check-in happened.
    pub kind: CheckInKind,
    /// Free-form notes.
    pub notes: String,
}

/// Trip collaborator holding destinations in memory.
#[derive(Debug, Default)]
pub struct InMemoryTrips {
    destinations: Mutex<Vec<Destination>>,
    check_ins: Mutex<Vec<CheckInRecord>>,
}

impl InMemoryTrips {
    /// Hold the given destinations.
    #[must_use]
    pub fn new(destinations: Vec<Destination>) -> Arc<Self> {
        Arc::new(Self {
            destinations: Mutex::new(destinations),
            check_ins: Mutex::new(Vec::new()),
        })
    }

    /// Load destinations from a JSON array file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Arc<Self>> {
        let text = std::fs::read_to_string(path)?;
        let destinations: Vec<Destination> = serde_json::from_str(&text)?;
        info!(
            "Loaded {} destinations from {}",
            destinations.len(),
            path.display()
        );
        Ok(Self::new(destinations))
    }

    /// Current status of a destination.
    pub async fn status_of(&self, destination_id: &str) -> Option<DestinationStatus> {
        self.destinations
            .lock()
            .await
            .iter()
            .find(|d| d.id == destination_id)
            .map(|d| d.status)
    }

    /// All check-ins recorded so far.
    pub async fn check_ins(&self) -> Vec<CheckInRecord> {
        self.check_ins.lock().await.clone()
    }
}

#[async_trait]
impl TripCollaborator for InMemoryTrips {
    async fn active_destinations(&self) -> std::result::Result<Vec<Destination>, TripError> {
        Ok(self.destinations.lock().await.clone())
    }

    async fn record_check_in(
        &self,
        destination_id: &str,
        position: Option<&PositionSample>,
        kind: CheckInKind,
        notes: &str,
    ) -> std::result::Result<(), TripError> {
        let mut destinations = self.destinations.lock().await;
        let destination = destinations
            .iter_mut()
            .find(|d| d.id == destination_id)
            .ok_or_else(|| TripError::NotFound(destination_id.to_string()))?;
        destination.last_check_in_at = Some(Utc::now());

        self.check_ins.lock().await.push(CheckInRecord {
            destination_id: destination_id.to_string(),
            position: position.cloned(),
            kind,
            notes: notes.to_string(),
        });
        Ok(())
    }

    async fn set_destination_status(
        &self,
        destination_id: &str,
        status: DestinationStatus,
    ) -> std::result::Result<(), TripError> {
        let mut destinations = self.destinations.lock().await;
        let destination = destinations
            .iter_mut()
            .find(|d| d.id == destination_id)
            .ok_or_else(|| TripError::NotFound(destination_id.to_string()))?;
        destination.status = status;
        Ok(())
    }
}

/// Notifier that writes to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: Notification) -> std::result::Result<(), NotifyError> {
        match notification.kind {
            NotificationKind::GraceWarning => info!(
                destination = %notification.destination_id,
                "{}", notification.message
            ),
            NotificationKind::Missed => warn!(
                destination = %notification.destination_id,
                "{}", notification.message
            ),
        }
        Ok(())
    }
}
