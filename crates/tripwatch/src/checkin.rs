//! Check-in monitoring.
//!
//! Every cycle the [`CheckInMonitor`] walks the traveler's upcoming
//! destinations, works out whether each one is overdue, and either records
//! an automatic check-in, warns during the grace window, or marks the
//! destination missed.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::CheckInConfig;
use crate::position::PositionSample;

/// Upper bound applied to configured check-in intervals (100 years).
const MAX_INTERVAL_SECS: i64 = 100 * 365 * 24 * 3600;

/// Lifecycle of a destination on a trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationStatus {
    /// Not reached yet.
    Upcoming,
    /// Checked in.
    Completed,
    /// Deadline and grace window both passed.
    Missed,
    /// Removed from the trip.
    Cancelled,
}

impl fmt::Display for DestinationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upcoming => write!(f, "upcoming"),
            Self::Completed => write!(f, "completed"),
            Self::Missed => write!(f, "missed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A planned stop on an active trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    /// Destination identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// When the traveler planned to arrive.
    pub planned_arrival: DateTime<Utc>,
    /// Maximum time between check-ins, in seconds.
    pub check_in_interval_secs: u64,
    /// Current status.
    pub status: DestinationStatus,
    /// Destination latitude, if known.
    #[serde(default)]
    pub latitude: Option<f64>,
    /// Destination longitude, if known.
    #[serde(default)]
    pub longitude: Option<f64>,
    /// Last recorded check-in.
    #[serde(default)]
    pub last_check_in_at: Option<DateTime<Utc>>,
}

impl Destination {
    /// Coordinates, when both halves are present.
    #[must_use]
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        self.latitude.zip(self.longitude)
    }

    /// Whether the monitor still evaluates this destination.
    #[must_use]
    pub fn is_monitored(&self) -> bool {
        self.status == DestinationStatus::Upcoming
    }

    fn check_in_interval(&self) -> Duration {
        let secs = i64::try_from(self.check_in_interval_secs).unwrap_or(i64::MAX);
        Duration::seconds(secs.min(MAX_INTERVAL_SECS))
    }
}

/// How a check-in was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckInKind {
    /// Recorded automatically after the deadline, outside the grace window.
    Auto,
    /// Recorded automatically inside the grace window.
    Grace,
}

impl fmt::Display for CheckInKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Grace => write!(f, "grace"),
        }
    }
}

/// Result of evaluating one destination at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckInEvaluation {
    /// Destination evaluated.
    pub destination_id: String,
    /// When the next check-in is due.
    pub next_deadline: DateTime<Utc>,
    /// The deadline has passed.
    pub is_overdue: bool,
    /// Overdue, but the grace window is still open.
    pub in_grace_period: bool,
    /// When the grace window closes.
    pub grace_ends_at: DateTime<Utc>,
    /// Distance from the current position, when both are known.
    pub distance_m: Option<f64>,
    /// The traveler may be checked in right now.
    pub can_check_in: bool,
}

/// Errors reported by the trip collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TripError {
    /// The destination does not exist.
    #[error("destination not found: {0}")]
    NotFound(String),

    /// The collaborator could not be reached.
    #[error("trip service unavailable: {0}")]
    Unavailable(String),
}

/// Owner of trips and destinations.
#[async_trait]
pub trait TripCollaborator: Send + Sync {
    /// Destinations on the traveler's active trips.
    ///
    /// # Errors
    ///
    /// Returns an error if the trip data cannot be read.
    async fn active_destinations(&self) -> Result<Vec<Destination>, TripError>;

    /// Record a check-in at a destination.
    ///
    /// # Errors
    ///
    /// Returns an error if the check-in cannot be recorded.
    async fn record_check_in(
        &self,
        destination_id: &str,
        position: Option<&PositionSample>,
        kind: CheckInKind,
        notes: &str,
    ) -> Result<(), TripError>;

    /// Move a destination to a new status.
    ///
    /// # Errors
    ///
    /// Returns an error if the status cannot be changed.
    async fn set_destination_status(
        &self,
        destination_id: &str,
        status: DestinationStatus,
    ) -> Result<(), TripError>;
}

/// What a notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Overdue and too far away to check in; grace window still open.
    GraceWarning,
    /// The destination was missed.
    Missed,
}

/// A message for the traveler or their contacts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    /// Kind of notification.
    pub kind: NotificationKind,
    /// Destination concerned.
    pub destination_id: String,
    /// Human-readable text.
    pub message: String,
}

/// Notification delivery failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

/// Best-effort notification channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a notification.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery failed; the monitor logs and moves on.
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Outcome of one monitoring cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Destinations checked in this cycle.
    pub completed: Vec<String>,
    /// Destinations marked missed this cycle.
    pub missed: Vec<String>,
    /// Destinations that received a grace warning.
    pub warned: Vec<String>,
}

impl CycleReport {
    /// Whether anything was marked missed.
    #[must_use]
    pub fn has_missed(&self) -> bool {
        !self.missed.is_empty()
    }
}

/// Evaluates destinations and applies check-in transitions.
pub struct CheckInMonitor {
    trips: Arc<dyn TripCollaborator>,
    notifier: Arc<dyn Notifier>,
    grace_period: Duration,
    radius_m: f64,
}

impl fmt::Debug for CheckInMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckInMonitor")
            .field("grace_period", &self.grace_period)
            .field("radius_m", &self.radius_m)
            .finish_non_exhaustive()
    }
}

impl CheckInMonitor {
    /// Create a monitor.
    #[must_use]
    pub fn new(
        trips: Arc<dyn TripCollaborator>,
        notifier: Arc<dyn Notifier>,
        config: &CheckInConfig,
    ) -> Self {
        Self {
            trips,
            notifier,
            grace_period: config.grace_period(),
            radius_m: config.radius_m,
        }
    }

    /// Evaluate one destination at `now`.
    #[must_use]
    pub fn evaluate(
        &self,
        destination: &Destination,
        position: Option<&PositionSample>,
        now: DateTime<Utc>,
    ) -> CheckInEvaluation {
        let baseline = destination
            .last_check_in_at
            .unwrap_or(destination.planned_arrival);
        let next_deadline = baseline
            .checked_add_signed(destination.check_in_interval())
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let grace_ends_at = next_deadline
            .checked_add_signed(self.grace_period)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let is_overdue = now > next_deadline;
        let in_grace_period = is_overdue && now <= grace_ends_at;

        let distance_m = match (destination.coordinates(), position) {
            (Some((lat, lon)), Some(current)) => Some(current.distance_to_point(lat, lon)),
            _ => None,
        };
        let can_check_in = match (destination.coordinates(), distance_m) {
            (None, _) => true,
            (Some(_), Some(distance)) => distance <= self.radius_m,
            (Some(_), None) => false,
        };

        CheckInEvaluation {
            destination_id: destination.id.clone(),
            next_deadline,
            is_overdue,
            in_grace_period,
            grace_ends_at,
            distance_m,
            can_check_in,
        }
    }

    /// Run one monitoring cycle.
    ///
    /// Collaborator failures on one destination are logged and the cycle
    /// continues with the next.
    ///
    /// # Errors
    ///
    /// Returns an error only if the destinations cannot be listed.
    pub async fn run_cycle(
        &self,
        now: DateTime<Utc>,
        position: Option<&PositionSample>,
    ) -> Result<CycleReport, TripError> {
        let destinations = self.trips.active_destinations().await?;
        let mut report = CycleReport::default();

        for destination in destinations.iter().filter(|d| d.is_monitored()) {
            let eval = self.evaluate(destination, position, now);

            if eval.is_overdue && eval.can_check_in {
                let kind = if eval.in_grace_period {
                    CheckInKind::Grace
                } else {
                    CheckInKind::Auto
                };
                if let Err(e) = self.check_in(destination, position, kind, &eval).await {
                    warn!("Check-in at {} failed: {}", destination.id, e);
                    continue;
                }
                info!("Checked in at {} ({})", destination.name, kind);
                report.completed.push(destination.id.clone());
            } else if eval.in_grace_period {
                let minutes_left = (eval.grace_ends_at - now).num_minutes();
                self.send(Notification {
                    kind: NotificationKind::GraceWarning,
                    destination_id: destination.id.clone(),
                    message: format!(
                        "Check-in at {} is overdue; {} min until it is marked missed",
                        destination.name, minutes_left
                    ),
                })
                .await;
                report.warned.push(destination.id.clone());
            } else if eval.is_overdue {
                if let Err(e) = self
                    .trips
                    .set_destination_status(&destination.id, DestinationStatus::Missed)
                    .await
                {
                    warn!("Marking {} missed failed: {}", destination.id, e);
                    continue;
                }
                warn!("Destination {} missed", destination.name);
                self.send(Notification {
                    kind: NotificationKind::Missed,
                    destination_id: destination.id.clone(),
                    message: format!("Check-in at {} was missed", destination.name),
                })
                .await;
                report.missed.push(destination.id.clone());
            } else {
                debug!(
                    "{} due at {}",
                    destination.id,
                    eval.next_deadline.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }

        Ok(report)
    }

    async fn check_in(
        &self,
        destination: &Destination,
        position: Option<&PositionSample>,
        kind: CheckInKind,
        eval: &CheckInEvaluation,
    ) -> Result<(), TripError> {
        let notes = match eval.distance_m {
            Some(distance) => {
                format!("automatic {kind} check-in, {distance:.0} m from destination")
            }
            None => format!("automatic {kind} check-in"),
        };
        self.trips
            .record_check_in(&destination.id, position, kind, &notes)
            .await?;
        self.trips
            .set_destination_status(&destination.id, DestinationStatus::Completed)
            .await
    }

    async fn send(&self, notification: Notification) {
        if let Err(e) = self.notifier.notify(notification).await {
            warn!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryTrips;
    use chrono::TimeZone;
    use std::sync::Mutex;

    struct RecordingNotifier {
        fail: bool,
        sent: Mutex<Vec<Notification>>,
    }

    impl RecordingNotifier {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                fail,
                sent: Mutex::new(Vec::new()),
            })
        }

        fn kinds(&self) -> Vec<NotificationKind> {
            self.sent.lock().unwrap().iter().map(|n| n.kind).collect()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
            self.sent.lock().unwrap().push(notification);
            if self.fail {
                Err(NotifyError("push service down".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
    }

    fn destination(id: &str, coords: Option<(f64, f64)>) -> Destination {
        Destination {
            id: id.to_string(),
            name: format!("Camp {id}"),
            planned_arrival: t0(),
            check_in_interval_secs: 6 * 3600,
            status: DestinationStatus::Upcoming,
            latitude: coords.map(|c| c.0),
            longitude: coords.map(|c| c.1),
            last_check_in_at: None,
        }
    }

    fn position(lat: f64, lon: f64) -> PositionSample {
        PositionSample {
            latitude: lat,
            longitude: lon,
            accuracy_meters: 5.0,
            captured_at: t0(),
            resolved_address: None,
            traveler_id: "traveler-1".to_string(),
        }
    }

    fn monitor(trips: Arc<InMemoryTrips>, notifier: Arc<RecordingNotifier>) -> CheckInMonitor {
        CheckInMonitor::new(trips, notifier, &CheckInConfig::default())
    }

    fn at(hours: i64, minutes: i64) -> DateTime<Utc> {
        t0() + Duration::hours(hours) + Duration::minutes(minutes)
    }

    #[test]
    fn test_evaluate_deadline_from_planned_arrival() {
        let m = monitor(InMemoryTrips::new(Vec::new()), RecordingNotifier::new(false));
        let dest = destination("a", None);

        let eval = m.evaluate(&dest, None, at(5, 59));
        assert_eq!(eval.next_deadline, at(6, 0));
        assert_eq!(eval.grace_ends_at, at(6, 10));
        assert!(!eval.is_overdue);
        assert!(!eval.in_grace_period);
    }

    #[test]
    fn test_evaluate_deadline_from_last_check_in() {
        let m = monitor(InMemoryTrips::new(Vec::new()), RecordingNotifier::new(false));
        let mut dest = destination("a", None);
        dest.last_check_in_at = Some(at(2, 0));

        let eval = m.evaluate(&dest, None, at(7, 0));
        assert_eq!(eval.next_deadline, at(8, 0));
        assert!(!eval.is_overdue);
    }

    #[test]
    fn test_evaluate_grace_boundaries() {
        let m = monitor(InMemoryTrips::new(Vec::new()), RecordingNotifier::new(false));
        let dest = destination("a", None);

        let eval = m.evaluate(&dest, None, at(6, 10));
        assert!(eval.is_overdue);
        assert!(eval.in_grace_period);

        let eval = m.evaluate(&dest, None, at(6, 11));
        assert!(eval.is_overdue);
        assert!(!eval.in_grace_period);
    }

    #[test]
    fn test_evaluate_check_in_radius() {
        let m = monitor(InMemoryTrips::new(Vec::new()), RecordingNotifier::new(false));
        let dest = destination("a", Some((46.0, 7.0)));

        // ~500 m north of the destination.
        let near = position(46.0045, 7.0);
        let eval = m.evaluate(&dest, Some(&near), at(6, 1));
        let distance = eval.distance_m.unwrap();
        assert!((450.0..550.0).contains(&distance), "got {distance}");
        assert!(eval.can_check_in);

        // ~5.5 km away.
        let far = position(46.05, 7.0);
        assert!(!m.evaluate(&dest, Some(&far), at(6, 1)).can_check_in);
    }

    #[test]
    fn test_evaluate_missing_coordinates() {
        let m = monitor(InMemoryTrips::new(Vec::new()), RecordingNotifier::new(false));

        let no_coords = destination("a", None);
        let eval = m.evaluate(&no_coords, None, at(6, 1));
        assert!(eval.can_check_in);
        assert!(eval.distance_m.is_none());

        let with_coords = destination("b", Some((46.0, 7.0)));
        assert!(!m.evaluate(&with_coords, None, at(6, 1)).can_check_in);
    }

    #[tokio::test]
    async fn test_cycle_scenario() {
        let trips = InMemoryTrips::new(vec![
            destination("near", Some((46.0, 7.0))),
            destination("far", Some((47.0, 8.0))),
        ]);
        let notifier = RecordingNotifier::new(false);
        let m = monitor(trips.clone(), notifier.clone());
        let here = position(46.0045, 7.0);

        let report = m.run_cycle(at(5, 59), Some(&here)).await.unwrap();
        assert_eq!(report, CycleReport::default());

        let report = m.run_cycle(at(6, 1), Some(&here)).await.unwrap();
        assert_eq!(report.completed, vec!["near".to_string()]);
        assert_eq!(report.warned, vec!["far".to_string()]);
        assert_eq!(
            trips.status_of("near").await,
            Some(DestinationStatus::Completed)
        );
        let check_ins = trips.check_ins().await;
        assert_eq!(check_ins.len(), 1);
        assert_eq!(check_ins[0].kind, CheckInKind::Grace);

        let report = m.run_cycle(at(6, 11), Some(&here)).await.unwrap();
        assert!(report.completed.is_empty());
        assert_eq!(report.missed, vec!["far".to_string()]);
        assert!(report.has_missed());
        assert_eq!(trips.status_of("far").await, Some(DestinationStatus::Missed));

        assert_eq!(
            notifier.kinds(),
            vec![NotificationKind::GraceWarning, NotificationKind::Missed]
        );
    }

    #[tokio::test]
    async fn test_auto_check_in_after_grace() {
        let trips = InMemoryTrips::new(vec![destination("a", None)]);
        let m = monitor(trips.clone(), RecordingNotifier::new(false));

        let report = m.run_cycle(at(7, 0), None).await.unwrap();
        assert_eq!(report.completed, vec!["a".to_string()]);
        assert_eq!(trips.check_ins().await[0].kind, CheckInKind::Auto);
    }

    #[tokio::test]
    async fn test_skips_completed_and_cancelled() {
        let mut done = destination("done", None);
        done.status = DestinationStatus::Completed;
        let mut cancelled = destination("cancelled", None);
        cancelled.status = DestinationStatus::Cancelled;
        let trips = InMemoryTrips::new(vec![done, cancelled]);
        let m = monitor(trips.clone(), RecordingNotifier::new(false));

        let report = m.run_cycle(at(12, 0), None).await.unwrap();
        assert_eq!(report, CycleReport::default());
        assert!(trips.check_ins().await.is_empty());
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_abort_cycle() {
        let trips = InMemoryTrips::new(vec![
            destination("x", Some((47.0, 8.0))),
            destination("y", Some((47.0, 8.0))),
        ]);
        let notifier = RecordingNotifier::new(true);
        let m = monitor(trips.clone(), notifier.clone());

        let report = m.run_cycle(at(6, 30), None).await.unwrap();
        assert_eq!(report.missed, vec!["x".to_string(), "y".to_string()]);
        assert_eq!(notifier.kinds().len(), 2);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(DestinationStatus::Missed.to_string(), "missed");
        assert_eq!(CheckInKind::Grace.to_string(), "grace");
    }

    #[test]
    fn test_destination_deserialize_without_coordinates() {
        let json = r#"{
            "id": "d1",
            "name": "Hut",
            "planned_arrival": "2026-03-01T08:00:00Z",
            "check_in_interval_secs": 3600,
            "status": "upcoming"
        }"#;
        let dest: Destination = serde_json::from_str(json).unwrap();
        assert!(dest.coordinates().is_none());
        assert!(dest.is_monitored());
    }
}
