//! End-to-end runs of the assembled pipeline on a paused clock.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;

use tripwatch::adapters::{
    FixedBattery, InMemoryTrips, LogNotifier, ReplaySource, SwitchableConnectivity, TrackPoint,
};
use tripwatch::checkin::{Destination, DestinationStatus};
use tripwatch::position::SourceKind;
use tripwatch::upload::SinkError;
use tripwatch::{
    Config, CryptoCodec, EncryptedBuffer, Pipeline, PipelineDeps, PositionSample, Tier, UploadSink,
};

#[derive(Default)]
struct CollectingSink {
    calls: Mutex<Vec<(Instant, Vec<PositionSample>)>>,
}

impl CollectingSink {
    fn total(&self) -> usize {
        self.calls.lock().unwrap().iter().map(|(_, r)| r.len()).sum()
    }

    fn first_call_at(&self) -> Option<Instant> {
        self.calls.lock().unwrap().first().map(|(at, _)| *at)
    }
}

#[async_trait]
impl UploadSink for CollectingSink {
    fn name(&self) -> &'static str {
        "collecting"
    }

    async fn upload(
        &self,
        _traveler_id: &str,
        records: &[PositionSample],
    ) -> Result<(), SinkError> {
        self.calls
            .lock()
            .unwrap()
            .push((Instant::now(), records.to_vec()));
        Ok(())
    }
}

fn config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.traveler.id = Some("traveler-it".to_string());
    config.storage.database_path = Some(dir.join("buffer.db"));
    config.storage.fallback_path = Some(dir.join("buffer.json"));
    config
}

fn track(count: u32) -> Vec<TrackPoint> {
    (0..count)
        .map(|i| TrackPoint {
            latitude: 45.8 + f64::from(i) * 0.001,
            longitude: 6.86,
            accuracy_meters: 6.0,
        })
        .collect()
}

fn deps(
    points: Vec<TrackPoint>,
    connectivity: Arc<SwitchableConnectivity>,
    sink: Arc<CollectingSink>,
    trips: Option<Arc<InMemoryTrips>>,
) -> PipelineDeps {
    PipelineDeps {
        source: Arc::new(ReplaySource::from_points(SourceKind::DeviceSensor, points)),
        connectivity,
        battery: Arc::new(FixedBattery(Some(80))),
        sink,
        trips: trips.map(|t| t as Arc<dyn tripwatch::checkin::TripCollaborator>),
        notifier: Arc::new(LogNotifier),
        geocoder: None,
    }
}

#[tokio::test(start_paused = true)]
async fn online_track_is_uploaded_and_buffer_emptied() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(CollectingSink::default());
    let connectivity = Arc::new(SwitchableConnectivity::new(true));

    let pipeline = Pipeline::build(
        config(dir.path()),
        deps(track(12), connectivity, sink.clone(), None),
    )
    .await
    .unwrap();
    let buffer = pipeline.buffer();
    let started = Instant::now();

    pipeline
        .run(tokio::time::sleep(Duration::from_secs(400)))
        .await
        .unwrap();

    assert_eq!(sink.total(), 12);
    // The tenth record crossed the upload threshold well before shutdown.
    let first = sink.first_call_at().unwrap();
    assert!(first.duration_since(started) < Duration::from_secs(300));
    assert_eq!(buffer.lock().await.stats().unwrap().total(), 0);
}

#[tokio::test(start_paused = true)]
async fn offline_records_go_out_on_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(CollectingSink::default());
    let connectivity = Arc::new(SwitchableConnectivity::new(false));

    let pipeline = Pipeline::build(
        config(dir.path()),
        deps(track(5), connectivity.clone(), sink.clone(), None),
    )
    .await
    .unwrap();
    let buffer = pipeline.buffer();
    let started = Instant::now();

    let offline_count = {
        let buffer = buffer.clone();
        let connectivity = connectivity.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(200)).await;
            let count = buffer.lock().await.stats().unwrap().get(Tier::Offline);
            connectivity.set_online(true);
            count
        })
    };

    pipeline
        .run(tokio::time::sleep(Duration::from_secs(280)))
        .await
        .unwrap();

    assert_eq!(offline_count.await.unwrap(), 5);
    assert_eq!(sink.total(), 5);
    let first = sink.first_call_at().unwrap().duration_since(started);
    assert!(
        first >= Duration::from_secs(200) && first < Duration::from_secs(280),
        "first upload at {first:?}"
    );
    assert_eq!(buffer.lock().await.stats().unwrap().total(), 0);
}

#[tokio::test(start_paused = true)]
async fn missed_destination_triggers_emergency_flush() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());

    // Leave three offline records behind from an earlier run.
    {
        let mut buffer =
            EncryptedBuffer::initialize(&config, CryptoCodec::new(config.crypto.kdf_iterations))
                .await
                .unwrap();
        for i in 0..3 {
            let sample = PositionSample {
                latitude: 45.0 + f64::from(i) * 0.01,
                longitude: 7.0,
                accuracy_meters: 5.0,
                captured_at: Utc::now() - chrono::Duration::minutes(10 - i64::from(i)),
                resolved_address: None,
                traveler_id: "traveler-it".to_string(),
            };
            assert!(buffer.store(&sample, Tier::Offline).is_accepted());
        }
    }

    let trips = InMemoryTrips::new(vec![Destination {
        id: "refuge".to_string(),
        name: "Refuge du Goûter".to_string(),
        planned_arrival: Utc::now() - chrono::Duration::hours(7),
        check_in_interval_secs: 3600,
        status: DestinationStatus::Upcoming,
        latitude: Some(45.85),
        longitude: Some(6.83),
        last_check_in_at: None,
    }]);
    let sink = Arc::new(CollectingSink::default());
    let connectivity = Arc::new(SwitchableConnectivity::new(true));

    let pipeline = Pipeline::build(
        config,
        deps(Vec::new(), connectivity, sink.clone(), Some(trips.clone())),
    )
    .await
    .unwrap();
    let started = Instant::now();

    pipeline
        .run(tokio::time::sleep(Duration::from_secs(60)))
        .await
        .unwrap();

    assert_eq!(trips.status_of("refuge").await, Some(DestinationStatus::Missed));
    assert_eq!(sink.total(), 3);
    let first = sink.first_call_at().unwrap().duration_since(started);
    assert!(first < Duration::from_secs(5), "first upload at {first:?}");
}
