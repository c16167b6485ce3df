//! Wiring and the orchestrator loop.
//!
//! [`Pipeline::build`] assembles the codec, buffer, sampler, upload
//! coordinator and check-in monitor from a [`Config`] and a set of
//! capability implementations. [`Pipeline::run`] then drives everything from
//! one `select!` loop until the shutdown future resolves.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::buffer::{BufferStats, EncryptedBuffer, SharedBuffer};
use crate::checkin::{CheckInMonitor, Notifier, TripCollaborator};
use crate::config::{Config, UploadConfig};
use crate::crypto::CryptoCodec;
use crate::device::{BatteryMonitor, ConnectivitySource};
use crate::error::Result;
use crate::position::{Geocoder, PositionSource};
use crate::sampler::{PositionSampler, SamplerEvent, SamplerState, UploadTrigger};
use crate::storage::Backend;
use crate::upload::{HttpUploadSink, LogUploadSink, UploadCoordinator, UploadResult, UploadSink};

/// Capacity of the sampler event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Capability implementations the pipeline runs on.
pub struct PipelineDeps {
    /// Where positions come from.
    pub source: Arc<dyn PositionSource>,
    /// Network state.
    pub connectivity: Arc<dyn ConnectivitySource>,
    /// Battery state.
    pub battery: Arc<dyn BatteryMonitor>,
    /// Where uploads go.
    pub sink: Arc<dyn UploadSink>,
    /// Trip data; check-in monitoring is off without it.
    pub trips: Option<Arc<dyn TripCollaborator>>,
    /// Check-in notifications.
    pub notifier: Arc<dyn Notifier>,
    /// Optional reverse geocoder.
    pub geocoder: Option<Arc<dyn Geocoder>>,
}

impl fmt::Debug for PipelineDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineDeps")
            .field("source", &self.source.kind())
            .field("sink", &self.sink.name())
            .field("trips", &self.trips.is_some())
            .field("geocoder", &self.geocoder.is_some())
            .finish_non_exhaustive()
    }
}

/// Build the upload sink the configuration asks for.
///
/// # Errors
///
/// Returns an error if the HTTP client cannot be created.
pub fn sink_from_config(config: &UploadConfig) -> Result<Arc<dyn UploadSink>> {
    match &config.endpoint {
        Some(endpoint) => {
            let sink = HttpUploadSink::new(
                endpoint.clone(),
                config.auth_token.clone(),
                config.chunk_timeout(),
            )?;
            Ok(Arc::new(sink))
        }
        None => Ok(Arc::new(LogUploadSink)),
    }
}

/// Snapshot of the pipeline for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineStatus {
    /// Storage backend in use.
    pub backend: Backend,
    /// Buffered records per tier.
    pub buffered: BufferStats,
    /// Batches waiting for a retry.
    pub retry_batches: usize,
    /// Records inside those batches.
    pub retry_records: usize,
    /// Whether the sampler is running.
    pub tracking: bool,
    /// Whether low-battery cadence is in force.
    pub low_battery: bool,
}

/// The assembled pipeline.
pub struct Pipeline {
    config: Config,
    buffer: SharedBuffer,
    sampler: PositionSampler,
    coordinator: Arc<UploadCoordinator>,
    monitor: Option<CheckInMonitor>,
    connectivity: Arc<dyn ConnectivitySource>,
    battery: Arc<dyn BatteryMonitor>,
    events: mpsc::Receiver<SamplerEvent>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("sampler", &self.sampler)
            .field("coordinator", &self.coordinator)
            .field("monitor", &self.monitor)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Open the buffer and wire up every component.
    ///
    /// # Errors
    ///
    /// Returns an error if the traveler id is missing, no storage backend can
    /// be opened, or persisted retry batches cannot be read.
    pub async fn build(config: Config, deps: PipelineDeps) -> Result<Self> {
        let codec = CryptoCodec::new(config.crypto.kdf_iterations);
        let buffer = EncryptedBuffer::initialize(&config, codec).await?;
        Self::with_buffer(config, Arc::new(Mutex::new(buffer)), codec, deps).await
    }

    /// Wire up every component around an already-open buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the traveler id is missing or persisted retry
    /// batches cannot be read.
    pub async fn with_buffer(
        config: Config,
        buffer: SharedBuffer,
        codec: CryptoCodec,
        deps: PipelineDeps,
    ) -> Result<Self> {
        let traveler_id = config.traveler_id()?.to_string();

        let coordinator = Arc::new(UploadCoordinator::new(
            buffer.clone(),
            codec,
            traveler_id.clone(),
            deps.sink,
            deps.connectivity.clone(),
            &config.upload,
        ));
        coordinator.restore_retry_queue().await?;

        let (events_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut sampler = PositionSampler::new(
            deps.source,
            buffer.clone(),
            deps.connectivity.clone(),
            traveler_id,
            config.sampling.clone(),
            events_tx,
        );
        if let Some(geocoder) = deps.geocoder {
            sampler = sampler.with_geocoder(geocoder);
        }

        let monitor = deps
            .trips
            .map(|trips| CheckInMonitor::new(trips, deps.notifier, &config.check_in));

        Ok(Self {
            config,
            buffer,
            sampler,
            coordinator,
            monitor,
            connectivity: deps.connectivity,
            battery: deps.battery,
            events,
        })
    }

    /// Handle to the shared buffer.
    #[must_use]
    pub fn buffer(&self) -> SharedBuffer {
        self.buffer.clone()
    }

    /// Handle to the upload coordinator.
    #[must_use]
    pub fn coordinator(&self) -> Arc<UploadCoordinator> {
        Arc::clone(&self.coordinator)
    }

    /// Current status snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer cannot be read.
    pub async fn status(&self) -> Result<PipelineStatus> {
        let (backend, buffered) = {
            let buffer = self.buffer.lock().await;
            (buffer.backend(), buffer.stats()?)
        };
        let (retry_batches, retry_records) = self.coordinator.pending_retries().await;
        Ok(PipelineStatus {
            backend,
            buffered,
            retry_batches,
            retry_records,
            tracking: self.sampler.state() == SamplerState::Tracking,
            low_battery: self.sampler.is_low_battery(),
        })
    }

    /// Run until `shutdown` resolves.
    ///
    /// On shutdown the sampler stops, one last upload is attempted and the
    /// coordinator is disposed.
    ///
    /// # Errors
    ///
    /// Returns an error if sampling cannot start.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);

        self.sampler.observe_battery(self.battery.level().await);
        self.sampler.start().await?;
        self.sampler.observe_connectivity(self.connectivity.is_online());

        let mut connectivity_rx = self.connectivity.subscribe();
        let mut connectivity_open = true;

        let upload_every = self.config.upload.periodic_interval();
        let mut upload_tick = interval_at(Instant::now() + upload_every, upload_every);
        upload_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let battery_every = self.config.sampling.battery_poll_interval();
        let mut battery_tick = interval_at(Instant::now() + battery_every, battery_every);
        battery_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut check_in_tick = interval(self.config.check_in.interval());
        check_in_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let monitoring = self.monitor.is_some();

        info!("Pipeline running");
        loop {
            let next_retry = self.coordinator.next_retry_at().await;

            tokio::select! {
                () = &mut shutdown => break,
                Some(event) = self.events.recv() => self.handle_event(event).await,
                _ = upload_tick.tick() => {
                    let result = self.coordinator.upload_pending().await;
                    log_upload("periodic", &result);
                }
                () = tokio::time::sleep_until(next_retry.unwrap_or_else(Instant::now)),
                    if next_retry.is_some() =>
                {
                    let result = self.coordinator.process_retry_queue(false).await;
                    log_upload("retry", &result);
                }
                changed = connectivity_rx.changed(), if connectivity_open => {
                    if changed.is_err() {
                        warn!("Connectivity source closed");
                        connectivity_open = false;
                        continue;
                    }
                    let online = *connectivity_rx.borrow_and_update();
                    self.on_connectivity(online).await;
                }
                _ = battery_tick.tick() => {
                    let level = self.battery.level().await;
                    self.sampler.observe_battery(level);
                }
                _ = check_in_tick.tick(), if monitoring => self.check_in_cycle().await,
            }
        }

        info!("Pipeline shutting down");
        self.sampler.stop();
        let result = self.coordinator.upload_pending().await;
        log_upload("shutdown", &result);
        self.coordinator.dispose();
        Ok(())
    }

    async fn handle_event(&mut self, event: SamplerEvent) {
        match event {
            SamplerEvent::LocationUpdate(sample) => {
                debug!(
                    "Stored position {:.5},{:.5} (±{:.0} m)",
                    sample.latitude, sample.longitude, sample.accuracy_meters
                );
            }
            SamplerEvent::LocationError(message) => debug!("Sampling error: {}", message),
            SamplerEvent::BatteryOptimizationChanged {
                low_battery,
                interval,
            } => {
                info!(low_battery, "Sampling cadence now {:?}", interval);
            }
            SamplerEvent::NetworkStatusChanged { online } => {
                debug!(online, "Network status reported");
            }
            SamplerEvent::UploadRequested(trigger) => {
                let result = self.coordinator.upload_pending().await;
                log_upload(
                    match trigger {
                        UploadTrigger::Threshold => "threshold",
                        UploadTrigger::Manual => "manual",
                    },
                    &result,
                );
            }
        }
    }

    async fn on_connectivity(&mut self, online: bool) {
        self.sampler.observe_connectivity(online);
        if !online {
            return;
        }

        let retried = self.coordinator.process_retry_queue(true).await;
        log_upload("reconnect retry", &retried);
        let result = self.coordinator.upload_pending().await;
        log_upload("reconnect", &result);
    }

    async fn check_in_cycle(&self) {
        let Some(monitor) = &self.monitor else {
            return;
        };
        let max_age = self.config.check_in.max_position_age(self.sampler.current_interval());
        let position = self.sampler.recent_position(max_age).await;

        match monitor.run_cycle(Utc::now(), position.as_ref()).await {
            Ok(report) => {
                if report.has_missed() {
                    warn!(
                        "Missed destinations {:?}, flushing buffered positions",
                        report.missed
                    );
                    let result = self.coordinator.emergency_flush().await;
                    log_upload("emergency", &result);
                }
            }
            Err(e) => warn!("Check-in cycle failed: {}", e),
        }
    }
}

fn log_upload(trigger: &str, result: &UploadResult) {
    match &result.error {
        Some(e) => debug!(trigger, "Upload skipped: {}", e),
        None if result.uploaded_count + result.failed_count + result.dropped_count == 0 => {
            debug!(trigger, "Nothing to upload");
        }
        None => info!(
            trigger,
            uploaded = result.uploaded_count,
            failed = result.failed_count,
            dropped = result.dropped_count,
            "Upload finished"
        ),
    }
}
