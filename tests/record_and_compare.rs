//! End-to-end capture over a real UDP socket: datagrams in, aligned lap
//! comparison out.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::net::UdpSocket;
use tokio::time::sleep;

use stint::{
    AlignConfig, IngestHandle, Pipeline, PipelineConfig, RecorderConfig, SessionStore, UdpSource,
};

const CAR_DASH_LEN: usize = 331;
const DASH_OFFSET: usize = 232;

/// Minimal encoder for the 331-byte layout, covering the fields these
/// tests assert on.
fn car_dash_packet(
    timestamp_us: u32,
    lap_number: u16,
    distance: f32,
    speed: f32,
    current_lap_s: f32,
    last_lap_s: f32,
) -> Vec<u8> {
    let mut raw = vec![0u8; CAR_DASH_LEN];
    let put = |raw: &mut [u8], off: usize, bytes: [u8; 4]| {
        raw[off..off + 4].copy_from_slice(&bytes);
    };

    put(&mut raw, 0, 1i32.to_le_bytes());
    put(&mut raw, 4, timestamp_us.to_le_bytes());
    put(&mut raw, 16, 6000.0f32.to_le_bytes());
    put(&mut raw, 212, 1234i32.to_le_bytes());
    put(&mut raw, 216, 5i32.to_le_bytes());
    put(&mut raw, 220, 700i32.to_le_bytes());

    put(&mut raw, DASH_OFFSET + 12, speed.to_le_bytes());
    put(&mut raw, DASH_OFFSET + 48, distance.to_le_bytes());
    put(&mut raw, DASH_OFFSET + 56, last_lap_s.to_le_bytes());
    put(&mut raw, DASH_OFFSET + 60, current_lap_s.to_le_bytes());
    raw[DASH_OFFSET + 68..DASH_OFFSET + 70].copy_from_slice(&lap_number.to_le_bytes());
    raw[DASH_OFFSET + 71] = 200;
    raw[DASH_OFFSET + 75] = 4;

    put(&mut raw, 327, 860i32.to_le_bytes());
    raw
}

async fn start_capture(dir: &TempDir) -> (Arc<SessionStore>, IngestHandle, UdpSocket) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let store = Arc::new(SessionStore::open(dir.path()).unwrap());
    let source = UdpSource::bind("127.0.0.1:0").await.unwrap();
    let target = source.local_addr().unwrap();

    let handle = Pipeline::start(
        source,
        Arc::clone(&store),
        PipelineConfig::default(),
        RecorderConfig::default(),
    );

    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender.connect(target).await.unwrap();
    (store, handle, sender)
}

/// Poll ingest stats until `recorded` reaches `expected`.
async fn wait_recorded(handle: &IngestHandle, expected: u64) {
    for _ in 0..500 {
        if handle.stats().recorded >= expected {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "timed out waiting for {expected} recorded samples, stats: {:?}",
        handle.stats()
    );
}

#[tokio::test]
async fn records_two_laps_and_aligns_them() {
    let dir = TempDir::new().unwrap();
    let (store, handle, sender) = start_capture(&dir).await;

    // Lap 1: ten samples, 0..900 m. Lap 2: same spacing, higher speeds.
    let mut ts = 1_000_000u32;
    for i in 0..10u32 {
        let packet =
            car_dash_packet(ts, 1, i as f32 * 100.0, 40.0 + i as f32, i as f32 * 2.0, 0.0);
        sender.send(&packet).await.unwrap();
        ts += 16_667;
    }
    for i in 0..10u32 {
        // Lap 1 took 90 s, reported on lap 2's samples.
        let packet =
            car_dash_packet(ts, 2, i as f32 * 100.0, 50.0 + i as f32, i as f32 * 2.0, 90.0);
        sender.send(&packet).await.unwrap();
        ts += 16_667;
    }

    wait_recorded(&handle, 20).await;
    let session = handle.wait_for_session().await.unwrap();
    let stats = handle.stop().await.unwrap();
    assert_eq!(stats.recorded, 20);
    assert_eq!(stats.decode_errors, 0);

    let laps = stint::laps(&store, session).unwrap();
    assert_eq!(laps.len(), 2);
    assert!(laps[0].complete);
    assert!(!laps[1].complete);
    assert_eq!(laps[0].time.ms(), 90_000);

    let meta = store.meta(session).unwrap();
    assert_eq!(meta.ident.car_ordinal, 1234);
    assert_eq!(meta.ident.track_ordinal, Some(860));

    let config = AlignConfig { step_m: 100.0, ..AlignConfig::default() };
    let cmp = stint::compare_laps(&store, &laps[0], &laps[1], &config).unwrap();
    assert_eq!(cmp.points.len(), 10);
    // Lap 2 carries 10 m/s more everywhere.
    for point in &cmp.points {
        assert!((point.b.speed_mps - point.a.speed_mps - 10.0).abs() < 1e-6);
    }
}

#[tokio::test]
async fn duplicate_datagrams_are_recorded_once() {
    let dir = TempDir::new().unwrap();
    let (store, handle, sender) = start_capture(&dir).await;

    let first = car_dash_packet(1_000_000, 1, 0.0, 40.0, 0.0, 0.0);
    sender.send(&first).await.unwrap();
    // Paused game: the title re-sends the same datagram verbatim.
    sender.send(&first).await.unwrap();
    sender.send(&first).await.unwrap();
    let second = car_dash_packet(1_016_667, 1, 10.0, 41.0, 0.02, 0.0);
    sender.send(&second).await.unwrap();

    wait_recorded(&handle, 2).await;
    // Give the duplicates time to be counted before asserting.
    sleep(Duration::from_millis(50)).await;

    let session = handle.wait_for_session().await.unwrap();
    let stats = handle.stop().await.unwrap();
    assert_eq!(stats.received, 4);
    assert_eq!(stats.duplicates, 2);
    assert_eq!(stats.recorded, 2);

    assert_eq!(store.durable_len(session).unwrap(), 2);
}

#[tokio::test]
async fn malformed_datagrams_are_counted_and_dropped() {
    let dir = TempDir::new().unwrap();
    let (store, handle, sender) = start_capture(&dir).await;

    sender.send(&[0u8; 100]).await.unwrap();
    let mut ts = 1_000_000u32;
    for i in 0..3u32 {
        sender
            .send(&car_dash_packet(ts, 1, i as f32 * 10.0, 40.0, 0.0, 0.0))
            .await
            .unwrap();
        ts += 16_667;
    }
    sender.send(&[0u8; 320]).await.unwrap();

    wait_recorded(&handle, 3).await;
    sleep(Duration::from_millis(50)).await;

    let session = handle.wait_for_session().await.unwrap();
    let stats = handle.stop().await.unwrap();
    assert_eq!(stats.decode_errors, 2);
    assert_eq!(stats.recorded, 3);
    assert_eq!(store.durable_len(session).unwrap(), 3);
}

#[tokio::test]
async fn stopping_without_traffic_creates_no_session() {
    let dir = TempDir::new().unwrap();
    let (store, handle, _sender) = start_capture(&dir).await;

    sleep(Duration::from_millis(50)).await;
    let stats = handle.stop().await.unwrap();
    assert_eq!(stats.received, 0);
    assert!(store.sessions().is_empty());
}
