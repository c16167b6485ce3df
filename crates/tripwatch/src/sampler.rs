//! Position sampling.
//!
//! The [`PositionSampler`] acquires fixes on a battery-aware cadence, filters
//! them by source accuracy, stores them in the buffer and reports what
//! happened on an event channel the orchestrator reads.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::buffer::{Admission, SharedBuffer};
use crate::config::{SamplingConfig, SamplingMode};
use crate::device::{is_low_battery, ConnectivitySource};
use crate::error::{Error, Result};
use crate::position::{
    Geocoder, PermissionStatus, PositionError, PositionFix, PositionSample, PositionSource, Tier,
    ValidationError,
};

/// Sampler lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    /// Not acquiring positions.
    Idle,
    /// The sampling task is running.
    Tracking,
}

/// Why an upload was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadTrigger {
    /// The buffered record count reached the threshold.
    Threshold,
    /// Someone asked for a flush.
    Manual,
}

/// Events emitted by the sampler.
#[derive(Debug, Clone, PartialEq)]
pub enum SamplerEvent {
    /// A sample was accepted into the buffer.
    LocationUpdate(PositionSample),
    /// Acquisition or validation failed; sampling continues.
    LocationError(String),
    /// The battery crossed the low-battery threshold.
    BatteryOptimizationChanged {
        /// Whether low-battery mode is now on.
        low_battery: bool,
        /// Cadence now in force.
        interval: Duration,
    },
    /// Connectivity changed.
    NetworkStatusChanged {
        /// Whether the device is now online.
        online: bool,
    },
    /// The buffer wants to be uploaded.
    UploadRequested(UploadTrigger),
}

/// State shared with the sampling task.
struct SamplerCore {
    source: Arc<dyn PositionSource>,
    geocoder: Option<Arc<dyn Geocoder>>,
    buffer: SharedBuffer,
    connectivity: Arc<dyn ConnectivitySource>,
    config: SamplingConfig,
    traveler_id: String,
    events: mpsc::Sender<SamplerEvent>,
    last_known: watch::Sender<Option<PositionSample>>,
}

impl SamplerCore {
    async fn emit(&self, event: SamplerEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Sampler event dropped, no receiver");
        }
    }

    /// Emit without waiting for channel space.
    ///
    /// Used for events raised from the orchestrator loop, which is also the
    /// only reader of the channel.
    fn try_emit(&self, event: SamplerEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => warn!("Event channel full, dropped {:?}", event),
            Err(TrySendError::Closed(_)) => debug!("Sampler event dropped, no receiver"),
        }
    }

    /// One fix from the source, bounded by the acquisition timeout.
    async fn acquire(&self) -> std::result::Result<PositionFix, PositionError> {
        let options = self.config.acquisition_options();
        let timeout = Duration::from_millis(options.timeout_ms);
        match tokio::time::timeout(timeout, self.source.current_position(options)).await {
            Ok(fix) => fix,
            Err(_) => Err(PositionError::Timeout {
                timeout_ms: options.timeout_ms,
            }),
        }
    }

    /// One timed read that only refreshes the last known position.
    async fn read_position(&self) -> Option<PositionSample> {
        let fix = match self.acquire().await {
            Ok(fix) => fix,
            Err(e) => {
                debug!("Position read failed: {}", e);
                return None;
            }
        };

        let sample = match PositionSample::from_fix(fix, &self.traveler_id) {
            Ok(sample) => sample,
            Err(e) => {
                debug!("Position read rejected: {}", e);
                return None;
            }
        };
        if let Err(e) = sample.validate(chrono::Utc::now()) {
            debug!("Position read rejected: {}", e);
            return None;
        }
        self.last_known.send_replace(Some(sample.clone()));
        Some(sample)
    }

    /// One periodic acquisition.
    async fn sample_once(&self) -> Option<Admission> {
        match self.acquire().await {
            Ok(fix) => Some(self.handle_fix(fix).await),
            Err(e) => {
                warn!("Position acquisition failed: {}", e);
                self.emit(SamplerEvent::LocationError(e.to_string())).await;
                None
            }
        }
    }

    async fn handle_fix(&self, fix: PositionFix) -> Admission {
        let mut sample = match PositionSample::from_fix(fix, &self.traveler_id) {
            Ok(sample) => sample,
            Err(e) => return self.reject(e).await,
        };
        if let Err(e) = sample.validate(chrono::Utc::now()) {
            return self.reject(e).await;
        }

        self.last_known.send_replace(Some(sample.clone()));

        let ceiling = self.config.accuracy_ceiling(self.source.kind());
        if sample.accuracy_meters > ceiling {
            debug!(
                "Fix accuracy {:.1} m above {} ceiling {} m",
                sample.accuracy_meters,
                self.source.kind(),
                ceiling
            );
            return Admission::Invalid(ValidationError::AccuracyTooLow {
                accuracy: sample.accuracy_meters,
            });
        }

        if let (true, Some(geocoder)) = (self.config.resolve_addresses, &self.geocoder) {
            match geocoder.reverse(sample.latitude, sample.longitude).await {
                Ok(address) => sample.resolved_address = Some(address),
                Err(e) => debug!("Reverse geocoding failed: {}", e),
            }
        }

        let online = self.connectivity.is_online();
        let tier = Tier::for_connectivity(online);
        let (admission, stats) = {
            let mut buffer = self.buffer.lock().await;
            let admission = buffer.store(&sample, tier);
            let stats = if admission.is_accepted() {
                buffer.stats().ok()
            } else {
                None
            };
            (admission, stats)
        };

        if admission.is_accepted() {
            self.emit(SamplerEvent::LocationUpdate(sample)).await;
            if let Some(stats) = stats {
                if stats.total() >= self.config.upload_threshold(online) {
                    debug!("Buffered {} records, requesting upload", stats.total());
                    self.emit(SamplerEvent::UploadRequested(UploadTrigger::Threshold))
                        .await;
                }
            }
        }
        admission
    }

    async fn reject(&self, error: ValidationError) -> Admission {
        debug!("Rejected fix: {}", error);
        self.emit(SamplerEvent::LocationError(error.to_string())).await;
        Admission::Invalid(error)
    }

    async fn run_periodic(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sample_once().await;
        }
    }

    async fn run_watch(&self, interval: Duration) {
        let mut stream = match self
            .source
            .watch_position(self.config.acquisition_options())
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Watch mode unavailable ({}), sampling periodically", e);
                return self.run_periodic(interval).await;
            }
        };

        let mut last_handled: Option<Instant> = None;
        while let Some(item) = stream.recv().await {
            match item {
                Ok(fix) => {
                    if last_handled.is_some_and(|at| at.elapsed() < interval) {
                        continue;
                    }
                    last_handled = Some(Instant::now());
                    self.handle_fix(fix).await;
                }
                Err(e) => {
                    warn!("Watch stream error: {}", e);
                    self.emit(SamplerEvent::LocationError(e.to_string())).await;
                }
            }
        }
        warn!("Position watch stream ended");
    }
}

/// Acquires positions and feeds the buffer.
pub struct PositionSampler {
    core: Arc<SamplerCore>,
    state: SamplerState,
    low_battery: bool,
    online: Option<bool>,
    task: Option<JoinHandle<()>>,
}

impl fmt::Debug for PositionSampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PositionSampler")
            .field("source", &self.core.source.kind())
            .field("mode", &self.core.config.mode)
            .field("state", &self.state)
            .field("low_battery", &self.low_battery)
            .finish_non_exhaustive()
    }
}

impl PositionSampler {
    /// Create an idle sampler.
    #[must_use]
    pub fn new(
        source: Arc<dyn PositionSource>,
        buffer: SharedBuffer,
        connectivity: Arc<dyn ConnectivitySource>,
        traveler_id: impl Into<String>,
        config: SamplingConfig,
        events: mpsc::Sender<SamplerEvent>,
    ) -> Self {
        let (last_known, _) = watch::channel(None);
        Self {
            core: Arc::new(SamplerCore {
                source,
                geocoder: None,
                buffer,
                connectivity,
                config,
                traveler_id: traveler_id.into(),
                events,
                last_known,
            }),
            state: SamplerState::Idle,
            low_battery: false,
            online: None,
            task: None,
        }
    }

    /// Attach a reverse geocoder. Only effective before [`start`](Self::start).
    #[must_use]
    pub fn with_geocoder(mut self, geocoder: Arc<dyn Geocoder>) -> Self {
        if let Some(core) = Arc::get_mut(&mut self.core) {
            core.geocoder = Some(geocoder);
        }
        self
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SamplerState {
        self.state
    }

    /// Whether low-battery cadence is in force.
    #[must_use]
    pub fn is_low_battery(&self) -> bool {
        self.low_battery
    }

    /// Cadence currently in force.
    #[must_use]
    pub fn current_interval(&self) -> Duration {
        self.core.config.interval_for(self.low_battery)
    }

    /// Subscribe to the last known valid position.
    #[must_use]
    pub fn last_known(&self) -> watch::Receiver<Option<PositionSample>> {
        self.core.last_known.subscribe()
    }

    /// Start sampling.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PermissionDenied`] if the source refuses access.
    pub async fn start(&mut self) -> Result<()> {
        if self.state == SamplerState::Tracking {
            return Ok(());
        }

        if let PermissionStatus::Denied { reason } = self.core.source.check_permission().await {
            warn!("Location permission denied: {}", reason);
            return Err(Error::permission_denied(reason));
        }

        self.spawn_loop();
        self.state = SamplerState::Tracking;
        info!(
            "Sampling started ({:?}, every {:?})",
            self.core.config.mode,
            self.current_interval()
        );
        Ok(())
    }

    /// Stop sampling and cancel the sampling task.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if self.state == SamplerState::Tracking {
            info!("Sampling stopped");
        }
        self.state = SamplerState::Idle;
    }

    /// Take one sample right away, outside the regular cadence.
    pub async fn sample_now(&self) -> Option<Admission> {
        self.core.sample_once().await
    }

    /// Position recent enough to judge a check-in against.
    ///
    /// Returns the last known sample when it is younger than `max_age`,
    /// otherwise takes one timed read from the source. The read is not
    /// buffered and raises no events. `None` when nothing recent is known.
    pub async fn recent_position(&self, max_age: Duration) -> Option<PositionSample> {
        let last = self.core.last_known.borrow().clone();
        if let Some(sample) = last {
            if is_recent(&sample, max_age) {
                return Some(sample);
            }
            debug!("Last known position from {} is stale, reading again", sample.captured_at);
        }

        let sample = self.core.read_position().await?;
        if is_recent(&sample, max_age) {
            Some(sample)
        } else {
            debug!("Fresh read returned a stale fix from {}", sample.captured_at);
            None
        }
    }

    /// Feed a battery reading; switches cadence on threshold crossings only.
    pub fn observe_battery(&mut self, level: Option<u8>) {
        let low = is_low_battery(level, self.core.config.low_battery_threshold_percent);
        if low == self.low_battery {
            return;
        }

        self.low_battery = low;
        let interval = self.current_interval();
        info!(
            "Battery {} ({:?}), sampling every {:?}",
            if low { "low" } else { "recovered" },
            level,
            interval
        );
        self.core.try_emit(SamplerEvent::BatteryOptimizationChanged {
            low_battery: low,
            interval,
        });

        if self.state == SamplerState::Tracking {
            self.spawn_loop();
        }
    }

    /// Feed a connectivity reading; reports changes only.
    pub fn observe_connectivity(&mut self, online: bool) {
        if self.online == Some(online) {
            return;
        }
        self.online = Some(online);
        self.core.try_emit(SamplerEvent::NetworkStatusChanged { online });
    }

    /// Take one sample right away, then ask for an upload.
    ///
    /// The upload request is sent even when the acquisition fails, so
    /// whatever is already buffered still goes out.
    pub async fn flush_now(&self) -> Option<Admission> {
        let admission = self.core.sample_once().await;
        self.core
            .emit(SamplerEvent::UploadRequested(UploadTrigger::Manual))
            .await;
        admission
    }

    fn spawn_loop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let core = Arc::clone(&self.core);
        let interval = self.current_interval();
        self.task = Some(tokio::spawn(async move {
            match core.config.mode {
                SamplingMode::Periodic => core.run_periodic(interval).await,
                SamplingMode::Watch => core.run_watch(interval).await,
            }
        }));
    }
}

fn is_recent(sample: &PositionSample, max_age: Duration) -> bool {
    match chrono::Utc::now().signed_duration_since(sample.captured_at).to_std() {
        Ok(age) => age <= max_age,
        // Captured after now; clock skew, not staleness.
        Err(_) => true,
    }
}

impl Drop for PositionSampler {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
