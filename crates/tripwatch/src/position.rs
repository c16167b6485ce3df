//! Core position types for tripwatch.
//!
//! This module defines the position sample that flows through the pipeline,
//! the buffer tier it is filed under, the validity rules every sample must
//! pass before it is stored, and the [`PositionSource`] capability that
//! platform integrations implement.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Mean Earth radius used for great-circle distances, in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Fixes reporting a worse horizontal accuracy than this are never stored.
pub const MAX_STORABLE_ACCURACY_M: f64 = 1000.0;

/// Reasons a position is rejected before it reaches storage.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// Latitude outside [-90, 90].
    #[error("latitude {latitude} out of range")]
    LatitudeOutOfRange {
        /// The offending latitude.
        latitude: f64,
    },

    /// Longitude outside [-180, 180].
    #[error("longitude {longitude} out of range")]
    LongitudeOutOfRange {
        /// The offending longitude.
        longitude: f64,
    },

    /// A coordinate or the accuracy is NaN or infinite.
    #[error("position contains non-finite values")]
    NonFinite,

    /// Accuracy below zero.
    #[error("negative accuracy {accuracy}")]
    NegativeAccuracy {
        /// The reported accuracy.
        accuracy: f64,
    },

    /// Accuracy too coarse to be worth storing.
    #[error("accuracy {accuracy} m exceeds storable limit")]
    AccuracyTooLow {
        /// The reported accuracy.
        accuracy: f64,
    },

    /// Capture time lies in the future.
    #[error("capture time {captured_at} is in the future")]
    FutureTimestamp {
        /// The reported capture time.
        captured_at: DateTime<Utc>,
    },

    /// Capture time could not be interpreted.
    #[error("unparsable timestamp: {raw}")]
    InvalidTimestamp {
        /// The raw value the source reported.
        raw: String,
    },
}

/// Errors reported by a position source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PositionError {
    /// The user or platform refused location access.
    #[error("location permission denied: {0}")]
    PermissionDenied(String),

    /// No fix arrived within the acquisition timeout.
    #[error("position acquisition timed out after {timeout_ms} ms")]
    Timeout {
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// The source could not produce a fix.
    #[error("position unavailable: {0}")]
    Unavailable(String),

    /// The source has no continuous mode.
    #[error("position source does not support watching")]
    WatchUnsupported,
}

/// Which kind of hardware or API backs a position source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// A dedicated GNSS sensor on the device.
    DeviceSensor,
    /// A generic browser-style geolocation API.
    BrowserGeolocation,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceSensor => write!(f, "device_sensor"),
            Self::BrowserGeolocation => write!(f, "browser_geolocation"),
        }
    }
}

/// Result of a permission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionStatus {
    /// Location access is available.
    Granted,
    /// Location access was refused.
    Denied {
        /// Human-readable reason.
        reason: String,
    },
}

impl PermissionStatus {
    /// Whether access is granted.
    #[must_use]
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// Options passed to every acquisition call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionOptions {
    /// Ask for the most precise fix the source can deliver.
    pub high_accuracy: bool,
    /// Give up after this many milliseconds.
    pub timeout_ms: u64,
    /// Accept a cached fix no older than this.
    pub max_age_ms: u64,
}

impl Default for AcquisitionOptions {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            timeout_ms: 15_000,
            max_age_ms: 10_000,
        }
    }
}

/// A raw fix as reported by a position source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionFix {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Horizontal accuracy radius in meters.
    pub accuracy_meters: f64,
    /// Fix time in milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
}

/// Buffer partition a record is filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Captured while the device had connectivity.
    Online,
    /// Captured while the device was offline.
    Offline,
}

impl Tier {
    /// Both tiers, in upload order.
    pub const ALL: [Tier; 2] = [Tier::Online, Tier::Offline];

    /// Tier matching the current connectivity.
    #[must_use]
    pub fn for_connectivity(online: bool) -> Self {
        if online {
            Self::Online
        } else {
            Self::Offline
        }
    }

    /// Stable string form used in storage.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

/// A validated position of one traveler at one instant.
///
/// This is also the per-record wire format handed to the upload sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Horizontal accuracy radius in meters.
    pub accuracy_meters: f64,
    /// When the fix was taken.
    pub captured_at: DateTime<Utc>,
    /// Reverse-geocoded address, when one could be resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_address: Option<String>,
    /// Owner of this sample.
    pub traveler_id: String,
}

impl PositionSample {
    /// Build a sample from a raw fix.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidTimestamp`] if the fix time cannot be
    /// represented.
    pub fn from_fix(
        fix: PositionFix,
        traveler_id: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let captured_at = DateTime::from_timestamp_millis(fix.timestamp_ms).ok_or_else(|| {
            ValidationError::InvalidTimestamp {
                raw: fix.timestamp_ms.to_string(),
            }
        })?;
        Ok(Self {
            latitude: fix.latitude,
            longitude: fix.longitude,
            accuracy_meters: fix.accuracy_meters,
            captured_at,
            resolved_address: None,
            traveler_id: traveler_id.into(),
        })
    }

    /// Check the sample against the storage validity rules.
    ///
    /// # Errors
    ///
    /// Returns the first rule the sample violates.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        if !self.latitude.is_finite()
            || !self.longitude.is_finite()
            || !self.accuracy_meters.is_finite()
        {
            return Err(ValidationError::NonFinite);
        }
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(ValidationError::LatitudeOutOfRange {
                latitude: self.latitude,
            });
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(ValidationError::LongitudeOutOfRange {
                longitude: self.longitude,
            });
        }
        if self.accuracy_meters < 0.0 {
            return Err(ValidationError::NegativeAccuracy {
                accuracy: self.accuracy_meters,
            });
        }
        if self.accuracy_meters > MAX_STORABLE_ACCURACY_M {
            return Err(ValidationError::AccuracyTooLow {
                accuracy: self.accuracy_meters,
            });
        }
        if self.captured_at > now {
            return Err(ValidationError::FutureTimestamp {
                captured_at: self.captured_at,
            });
        }
        Ok(())
    }

    /// Great-circle distance to another sample, in meters.
    #[must_use]
    pub fn distance_to(&self, other: &PositionSample) -> f64 {
        haversine_meters(self.latitude, self.longitude, other.latitude, other.longitude)
    }

    /// Great-circle distance to a coordinate pair, in meters.
    #[must_use]
    pub fn distance_to_point(&self, latitude: f64, longitude: f64) -> f64 {
        haversine_meters(self.latitude, self.longitude, latitude, longitude)
    }
}

/// Haversine distance between two points, in meters.
#[must_use]
pub fn haversine_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let lat1 = lat1.to_radians();
    let lat2 = lat2.to_radians();
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().min(1.0).asin();
    EARTH_RADIUS_M * c
}

/// Stream of fixes produced by [`PositionSource::watch_position`].
pub type FixStream = mpsc::Receiver<Result<PositionFix, PositionError>>;

/// Trait for platform-specific position sources.
///
/// Implementors wrap whatever the platform offers (a GNSS chip, a browser
/// geolocation API, a recorded track) behind one-shot and continuous reads.
#[async_trait]
pub trait PositionSource: Send + Sync {
    /// Which kind of source this is; drives the accuracy ceiling.
    fn kind(&self) -> SourceKind;

    /// Check whether location access is currently allowed.
    async fn check_permission(&self) -> PermissionStatus;

    /// Take a single fix.
    ///
    /// # Errors
    ///
    /// Returns an error on timeout, permission denial, or source failure.
    async fn current_position(
        &self,
        options: AcquisitionOptions,
    ) -> Result<PositionFix, PositionError>;

    /// Start a continuous stream of fixes.
    ///
    /// # Errors
    ///
    /// Returns [`PositionError::WatchUnsupported`] unless overridden.
    async fn watch_position(
        &self,
        options: AcquisitionOptions,
    ) -> Result<FixStream, PositionError> {
        let _ = options;
        Err(PositionError::WatchUnsupported)
    }
}

/// Best-effort reverse geocoding.
#[async_trait]
pub trait Geocoder: Send + Sync {
    /// Resolve a coordinate pair to a human-readable address.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails; callers treat this as "no address".
    async fn reverse(&self, latitude: f64, longitude: f64) -> Result<String, PositionError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample(lat: f64, lon: f64) -> PositionSample {
        PositionSample {
            latitude: lat,
            longitude: lon,
            accuracy_meters: 5.0,
            captured_at: Utc::now() - Duration::seconds(1),
            resolved_address: None,
            traveler_id: "traveler-1".to_string(),
        }
    }

    #[test]
    fn test_tier_display_and_parse() {
        assert_eq!(Tier::Online.to_string(), "online");
        assert_eq!(Tier::Offline.to_string(), "offline");
        assert_eq!("offline".parse::<Tier>().unwrap(), Tier::Offline);
        assert!("sideways".parse::<Tier>().is_err());
    }

    #[test]
    fn test_tier_for_connectivity() {
        assert_eq!(Tier::for_connectivity(true), Tier::Online);
        assert_eq!(Tier::for_connectivity(false), Tier::Offline);
    }

    #[test]
    fn test_haversine_zero_distance() {
        assert!(haversine_meters(51.5, -0.12, 51.5, -0.12).abs() < 1e-9);
    }

    #[test]
    fn test_haversine_known_distance() {
        // One degree of latitude is ~111.2 km on the mean sphere.
        let d = haversine_meters(0.0, 0.0, 1.0, 0.0);
        assert!((d - 111_195.0).abs() < 50.0, "got {d}");
    }

    #[test]
    fn test_haversine_is_symmetric() {
        let a = haversine_meters(40.7128, -74.0060, 34.0522, -118.2437);
        let b = haversine_meters(34.0522, -118.2437, 40.7128, -74.0060);
        assert!((a - b).abs() < 1e-6);
    }

    #[test]
    fn test_validate_accepts_plausible_sample() {
        assert!(sample(45.0, 7.0).validate(Utc::now()).is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_coordinates() {
        assert!(matches!(
            sample(91.0, 0.0).validate(Utc::now()),
            Err(ValidationError::LatitudeOutOfRange { .. })
        ));
        assert!(matches!(
            sample(0.0, -180.5).validate(Utc::now()),
            Err(ValidationError::LongitudeOutOfRange { .. })
        ));
        assert_eq!(
            sample(f64::NAN, 0.0).validate(Utc::now()),
            Err(ValidationError::NonFinite)
        );
    }

    #[test]
    fn test_validate_rejects_accuracy() {
        let mut s = sample(10.0, 10.0);
        s.accuracy_meters = 1000.5;
        assert!(matches!(
            s.validate(Utc::now()),
            Err(ValidationError::AccuracyTooLow { .. })
        ));
        s.accuracy_meters = -1.0;
        assert!(matches!(
            s.validate(Utc::now()),
            Err(ValidationError::NegativeAccuracy { .. })
        ));
        s.accuracy_meters = 1000.0;
        assert!(s.validate(Utc::now()).is_ok());
    }

    #[test]
    fn test_validate_rejects_future_timestamp() {
        let mut s = sample(10.0, 10.0);
        s.captured_at = Utc::now() + Duration::minutes(5);
        assert!(matches!(
            s.validate(Utc::now()),
            Err(ValidationError::FutureTimestamp { .. })
        ));
    }

    #[test]
    fn test_from_fix_rejects_unrepresentable_timestamp() {
        let fix = PositionFix {
            latitude: 1.0,
            longitude: 1.0,
            accuracy_meters: 3.0,
            timestamp_ms: i64::MAX,
        };
        assert!(matches!(
            PositionSample::from_fix(fix, "t"),
            Err(ValidationError::InvalidTimestamp { .. })
        ));
    }

    #[test]
    fn test_from_fix_copies_fields() {
        let fix = PositionFix {
            latitude: 48.85,
            longitude: 2.35,
            accuracy_meters: 8.0,
            timestamp_ms: 1_700_000_000_000,
        };
        let s = PositionSample::from_fix(fix, "traveler-9").unwrap();
        assert_eq!(s.traveler_id, "traveler-9");
        assert_eq!(s.captured_at.timestamp_millis(), 1_700_000_000_000);
        assert!(s.resolved_address.is_none());
    }

    #[test]
    fn test_sample_serialization_omits_missing_address() {
        let s = sample(1.0, 2.0);
        let json = serde_json::to_string(&s).unwrap();
        assert!(!json.contains("resolved_address"));
        assert!(json.contains("traveler_id"));
    }

    #[test]
    fn test_permission_status() {
        assert!(PermissionStatus::Granted.is_granted());
        assert!(!PermissionStatus::Denied {
            reason: "no".to_string()
        }
        .is_granted());
    }
}
