//! End-to-end playback scenarios against the simulated DAQ backend.

use daqplay_engine::client::Client;
use daqplay_engine::error::EngineError;
use daqplay_engine::hw::sim::{Pace, ProbeHandle, SimBackend};
use daqplay_engine::init_with_backend;
use daqplay_engine::message::{Action, Event, LoadRequest, Reply, SeekTarget};
use daqplay_engine::transport::TransportState;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

fn write_mono_fixture(dir: &Path, frames: usize, rate: i32) -> PathBuf {
    let path = dir.join("mono.wav");
    let samples: Vec<f32> = (0..frames).map(|i| (i % 100) as f32 / 200.0).collect();
    wavers::write::<f32, _>(&path, &samples, rate, 1).expect("fixture write");
    path
}

/// Stereo fixture with constant, sign-distinguishable channels: left +0.5,
/// right -0.5. Makes flip transitions visible in the capture.
fn write_stereo_fixture(dir: &Path, frames: usize, rate: i32) -> PathBuf {
    let path = dir.join("stereo.wav");
    let mut samples = Vec::with_capacity(frames * 2);
    for _ in 0..frames {
        samples.push(0.5_f32);
        samples.push(-0.5_f32);
    }
    wavers::write::<f32, _>(&path, &samples, rate, 2).expect("fixture write");
    path
}

fn start_engine(pace: Pace) -> (Client, ProbeHandle) {
    let backend = SimBackend::new(pace);
    let probe = backend.probe();
    let (tx, handle) = init_with_backend(Arc::new(backend));
    (Client::new(tx, handle), probe)
}

fn load_request(path: &Path, ao: &[&str]) -> LoadRequest {
    LoadRequest {
        file_path: path.to_path_buf(),
        device_name: "SimDev1".to_string(),
        ao_channels: ao.iter().map(|s| s.to_string()).collect(),
        do_channels: None,
        ai_channels: vec![],
        volume: None,
        samples_per_frame: Some(1024),
        flip_lr_stereo: None,
    }
}

async fn wait_completed(events: &mut tokio::sync::mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            match events.recv().await {
                Some(event @ Event::Completed(_)) => return event,
                Some(Event::Stopped { error, .. }) => {
                    panic!("playback stopped early: {:?}", error)
                }
                Some(_) => {}
                None => panic!("event stream closed before completion"),
            }
        }
    })
    .await
    .expect("timed out waiting for completion")
}

#[tokio::test]
async fn mono_fan_out_plays_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_mono_fixture(dir.path(), 4000, 48_000);
    let (client, probe) = start_engine(Pace::Immediate);

    let reply = client
        .request(Action::LoadAudio(Box::new(load_request(
            &path,
            &["ao0", "ao1", "ao2", "ao3"],
        ))))
        .await
        .unwrap();
    let Reply::Status(Some(info)) = reply else {
        panic!("expected status reply");
    };
    assert_eq!(info.state, TransportState::Loaded);
    assert_eq!(info.total_samples, 4000);
    assert_eq!(info.sample_rate_hz, 48_000);

    let mut events = client.subscribe();
    client
        .request(Action::Play {
            start_position_s: None,
            volume: None,
            loop_mode: None,
        })
        .await
        .unwrap();

    let Event::Completed(info) = wait_completed(&mut events).await else {
        unreachable!()
    };
    assert_eq!(info.position_samples, 4000);
    assert_eq!(info.state, TransportState::Completed);
    assert_eq!(info.underflow_events, 0);

    let probe = probe.lock().unwrap();
    assert_eq!(probe.ao_written.len(), 4000 * 4);
    for (i, frame) in probe.ao_written.chunks(4).enumerate() {
        let expected = (i % 100) as f64 / 200.0;
        for sample in frame {
            assert!(
                (sample - expected).abs() < 1.0e-6,
                "frame {} expected {} got {}",
                i,
                expected,
                sample
            );
        }
    }
    assert!(!probe.do_high);
    assert_eq!(probe.do_transitions.first(), Some(&true));
    assert_eq!(probe.do_transitions.last(), Some(&false));
}

#[tokio::test]
async fn stereo_flip_applies_at_a_callback_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_stereo_fixture(dir.path(), 8000, 8000);
    let (client, probe) = start_engine(Pace::Realtime);

    let mut request = load_request(&path, &["ao0", "ao1", "ao2", "ao3"]);
    request.samples_per_frame = Some(256);
    client
        .request(Action::LoadAudio(Box::new(request)))
        .await
        .unwrap();

    let mut events = client.subscribe();
    client
        .request(Action::Play {
            start_position_s: None,
            volume: None,
            loop_mode: None,
        })
        .await
        .unwrap();

    // Let some unflipped audio through first.
    let mut positions = vec![];
    loop {
        match events.recv().await.expect("event stream closed") {
            Event::Progress(update) => {
                positions.push(update.position_samples);
                break;
            }
            Event::Completed(_) => panic!("completed before any progress"),
            Event::Stopped { error, .. } => panic!("stopped early: {:?}", error),
        }
    }
    let reply = client.request(Action::FlipStereo(Some(true))).await.unwrap();
    let Reply::Flip { flip_lr_stereo } = reply else {
        panic!("expected flip reply");
    };
    assert!(flip_lr_stereo);

    loop {
        match events.recv().await.expect("event stream closed") {
            Event::Progress(update) => positions.push(update.position_samples),
            Event::Completed(info) => {
                positions.push(info.position_samples);
                break;
            }
            Event::Stopped { error, .. } => panic!("stopped early: {:?}", error),
        }
    }
    assert!(positions.windows(2).all(|w| w[0] <= w[1]));

    let probe = probe.lock().unwrap();
    // ao0 carries LEFT (+0.5) until the flip block, RIGHT (-0.5) after.
    let frames: Vec<&[f64]> = probe.ao_written.chunks(4).collect();
    let first_flipped = frames.iter().position(|f| f[0] < 0.0);
    let flipped_at = first_flipped.expect("flip never reached the output");
    assert_eq!(flipped_at % 256, 0, "flip must land on a callback boundary");
    assert!(frames[..flipped_at].iter().all(|f| f[0] > 0.0 && f[1] < 0.0));
    assert!(frames[flipped_at..].iter().all(|f| f[0] < 0.0 && f[1] > 0.0));
    // Even/odd line pairing holds on both sides of the flip.
    assert!(frames.iter().all(|f| f[0] == f[2] && f[1] == f[3]));
}

#[tokio::test]
async fn seek_then_play_reports_target_position() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_mono_fixture(dir.path(), 48_000, 48_000);
    let (client, _probe) = start_engine(Pace::Immediate);

    client
        .request(Action::LoadAudio(Box::new(load_request(&path, &["ao0"]))))
        .await
        .unwrap();
    let reply = client
        .request(Action::Seek(SeekTarget::Seconds(0.5)))
        .await
        .unwrap();
    let Reply::Status(Some(info)) = reply else {
        panic!("expected status reply");
    };
    assert_eq!(info.position_samples, 24_000);

    let reply = client.request(Action::GetPosition).await.unwrap();
    let Reply::Position {
        position_s,
        duration_s,
        ..
    } = reply
    else {
        panic!("expected position reply");
    };
    assert!((position_s - 0.5).abs() < 1.0 / 48_000.0 * 1024.0);
    assert!((duration_s - 1.0).abs() < 1.0e-9);

    let mut events = client.subscribe();
    client
        .request(Action::Play {
            start_position_s: None,
            volume: None,
            loop_mode: None,
        })
        .await
        .unwrap();
    let Event::Completed(info) = wait_completed(&mut events).await else {
        unreachable!()
    };
    assert_eq!(info.position_samples, 48_000);
}

#[tokio::test]
async fn forced_underflows_escalate_to_paused_with_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_mono_fixture(dir.path(), 48_000, 48_000);
    let (client, probe) = start_engine(Pace::Immediate);

    let mut request = load_request(&path, &["ao0"]);
    request.samples_per_frame = Some(2048);
    client
        .request(Action::LoadAudio(Box::new(request)))
        .await
        .unwrap();
    probe.lock().unwrap().force_underflow_writes = 3;

    let mut events = client.subscribe();
    client
        .request(Action::Play {
            start_position_s: None,
            volume: None,
            loop_mode: None,
        })
        .await
        .unwrap();

    let stopped = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            match events.recv().await.expect("event stream closed") {
                Event::Stopped { error, .. } => return error,
                Event::Completed(_) => panic!("completed despite forced underflows"),
                Event::Progress(_) => {}
            }
        }
    })
    .await
    .expect("no stop event");
    assert!(stopped.unwrap_or_default().contains("underflow"));

    let reply = client.request(Action::Status).await.unwrap();
    let Reply::Status(Some(info)) = reply else {
        panic!("expected status reply");
    };
    assert_eq!(info.state, TransportState::Paused);
    assert!(info.error.is_some());
    assert!(info.underflow_events >= 3);
}

#[tokio::test]
async fn device_loss_drops_to_idle() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_mono_fixture(dir.path(), 48_000, 48_000);
    let (client, probe) = start_engine(Pace::Immediate);

    client
        .request(Action::LoadAudio(Box::new(load_request(&path, &["ao0"]))))
        .await
        .unwrap();
    probe.lock().unwrap().fail_writes_after = Some(3);

    let mut events = client.subscribe();
    client
        .request(Action::Play {
            start_position_s: None,
            volume: None,
            loop_mode: None,
        })
        .await
        .unwrap();

    let error = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            match events.recv().await.expect("event stream closed") {
                Event::Stopped { error, .. } => return error,
                Event::Completed(_) => panic!("completed on a dead device"),
                Event::Progress(_) => {}
            }
        }
    })
    .await
    .expect("no stop event");
    assert!(error.unwrap_or_default().contains("device"));

    let reply = client.request(Action::Status).await.unwrap();
    assert!(matches!(reply, Reply::Status(None)));
    assert!(!probe.lock().unwrap().do_high);
}

#[tokio::test]
async fn validation_failures_leave_state_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_mono_fixture(dir.path(), 1000, 48_000);
    let (client, _probe) = start_engine(Pace::Immediate);

    // Unknown device.
    let mut request = load_request(&path, &["ao0"]);
    request.device_name = "Dev99".to_string();
    let result = client.request(Action::LoadAudio(Box::new(request))).await;
    assert!(matches!(result, Err(EngineError::Validation(_))));

    // Channel not present on the device.
    let request = load_request(&path, &["ao0", "ao7"]);
    let result = client.request(Action::LoadAudio(Box::new(request))).await;
    assert!(matches!(result, Err(EngineError::Validation(_))));

    // Volume out of range.
    let mut request = load_request(&path, &["ao0"]);
    request.volume = Some(150);
    let result = client.request(Action::LoadAudio(Box::new(request))).await;
    assert!(matches!(result, Err(EngineError::Validation(_))));

    let reply = client.request(Action::Status).await.unwrap();
    assert!(matches!(reply, Reply::Status(None)));

    // Good load, then an out-of-range volume change is rejected and the
    // old volume survives.
    client
        .request(Action::LoadAudio(Box::new(load_request(&path, &["ao0"]))))
        .await
        .unwrap();
    let result = client.request(Action::SetVolume(101)).await;
    assert!(matches!(result, Err(EngineError::Validation(_))));
    let Reply::Status(Some(info)) = client.request(Action::Status).await.unwrap() else {
        panic!("expected status reply");
    };
    assert_eq!(info.volume, 100);
}

#[tokio::test]
async fn devices_task_lists_simulated_hardware() {
    let (client, _probe) = start_engine(Pace::Immediate);
    let reply = client
        .request(Action::ListDevices { refresh: false })
        .await
        .unwrap();
    let Reply::Devices {
        devices,
        driver_version,
    } = reply
    else {
        panic!("expected devices reply");
    };
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].name, "SimDev1");
    assert_eq!(driver_version.as_deref(), Some("sim-1.0.0"));
}

#[tokio::test]
async fn terminate_releases_everything() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_mono_fixture(dir.path(), 1000, 48_000);
    let (client, probe) = start_engine(Pace::Immediate);

    client
        .request(Action::LoadAudio(Box::new(load_request(&path, &["ao0"]))))
        .await
        .unwrap();
    let reply = client.request(Action::Terminate).await.unwrap();
    assert!(matches!(reply, Reply::Ack));
    let reply = client.request(Action::Status).await.unwrap();
    assert!(matches!(reply, Reply::Status(None)));
    assert!(!probe.lock().unwrap().do_high);
}
