//! The command channel driven over an in-memory pipe.

use crabrig::backend::{BackendSet, MockBackend};
use crabrig::cache::CapabilityCache;
use crabrig::protocol::{ChannelSettings, ChannelSink, CommandChannel, StatusKind, StatusMessage};
use crabrig::registry::{DeviceRegistry, RegistrySettings};
use crabrig::testing::reference_probe_report;
use crabrig::types::{BackendKind, DeviceIdentity, Lifecycle};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio::io::{AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc::UnboundedReceiver;

const CAM: &str = "cam-0001";

struct Harness {
    mock: MockBackend,
    registry: DeviceRegistry,
    channel: CommandChannel<ChannelSink>,
    statuses: UnboundedReceiver<StatusMessage>,
    client: DuplexStream,
    server: DuplexStream,
    _dir: tempfile::TempDir,
}

fn harness(devices: usize, command_timeout: Duration) -> Harness {
    harness_with(
        devices,
        ChannelSettings {
            command_timeout,
            telemetry_interval: None,
        },
    )
}

fn harness_with(devices: usize, channel_settings: ChannelSettings) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockBackend::new();
    for n in 1..=devices {
        mock.plug(
            DeviceIdentity::new(BackendKind::Mock, format!("cam-{:04}", n)),
            reference_probe_report(),
        );
    }
    let settings = RegistrySettings {
        poll_interval: None,
        probe_timeout: Duration::from_secs(5),
        flapping_threshold: Duration::ZERO,
        grace_period: Duration::from_millis(500),
        recording_dir: dir.path().join("recordings"),
        snapshot_dir: dir.path().join("snapshots"),
        ..RegistrySettings::default()
    };
    let (registry, events) = DeviceRegistry::spawn(
        settings,
        BackendSet::new().with(Arc::new(mock.clone())),
        Arc::new(CapabilityCache::in_memory()),
    );
    let (sink, statuses) = ChannelSink::new();
    let channel = CommandChannel::new(
        registry.clone(),
        events,
        sink,
        channel_settings,
    )
    .with_backends(vec!["mock".to_string()]);
    let (client, server) = tokio::io::duplex(4096);
    Harness {
        mock,
        registry,
        channel,
        statuses,
        client,
        server,
        _dir: dir,
    }
}

async fn send(client: &mut DuplexStream, line: &str) {
    client.write_all(line.as_bytes()).await.unwrap();
    client.write_all(b"\n").await.unwrap();
}

async fn next_of(
    statuses: &mut UnboundedReceiver<StatusMessage>,
    kinds: &[StatusKind],
) -> StatusMessage {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let status = statuses.recv().await.expect("status stream closed");
            if kinds.contains(&status.status) {
                return status;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {:?} status within 5s", kinds))
}

#[tokio::test]
async fn test_start_recording_before_select_is_refused() {
    let Harness {
        registry,
        channel,
        mut statuses,
        mut client,
        server,
        ..
    } = harness(1, Duration::from_secs(2));
    registry.discover_now().await.unwrap();

    let driver = async {
        let initialized = next_of(&mut statuses, &[StatusKind::Initialized]).await;
        assert_eq!(initialized.data["backends"][0], "mock");
        assert!(initialized.data["session_id"].is_string());
        next_of(&mut statuses, &[StatusKind::CapabilitiesReady]).await;

        send(&mut client, r#"{"command":"start_recording","device_id":"cam-0001"}"#).await;
        let error = next_of(&mut statuses, &[StatusKind::Error]).await;
        assert_eq!(error.message_type, "status");
        assert_eq!(error.data["message"], "invalid_transition");
        assert_eq!(error.data["device_id"], CAM);
        assert_eq!(
            registry.device(CAM).await.unwrap().lifecycle,
            Lifecycle::Discovered
        );

        send(&mut client, r#"{"command":"quit"}"#).await;
        next_of(&mut statuses, &[StatusKind::Quitting]).await;
    };
    let (result, ()) = tokio::join!(channel.run(BufReader::new(server)), driver);
    result.unwrap();
    assert!(registry.devices().await.is_err());
}

#[tokio::test]
async fn test_bad_input_handling() {
    let Harness {
        registry,
        channel,
        mut statuses,
        mut client,
        server,
        ..
    } = harness(1, Duration::from_secs(2));
    registry.discover_now().await.unwrap();

    let driver = async {
        send(&mut client, "this is not json").await;
        send(&mut client, r#"{"no_command":true}"#).await;
        send(&mut client, r#"{"command":"get_status"}"#).await;
        let first = next_of(&mut statuses, &[StatusKind::Error, StatusKind::Status]).await;
        assert_eq!(first.status, StatusKind::Status, "malformed lines get no reply");
        assert_eq!(first.data["devices"][0]["identity"]["stable_id"], CAM);

        send(&mut client, r#"{"command":"launch_rocket"}"#).await;
        let error = next_of(&mut statuses, &[StatusKind::Error]).await;
        assert_eq!(error.data["message"], "unsupported_command");

        send(&mut client, r#"{"command":"select_device","preview":{"width":"wide"}}"#).await;
        let error = next_of(&mut statuses, &[StatusKind::Error]).await;
        assert_eq!(error.data["message"], "invalid_arguments");

        send(&mut client, r#"{"command":"quit"}"#).await;
    };
    let (result, ()) = tokio::join!(channel.run(BufReader::new(server)), driver);
    result.unwrap();
}

#[tokio::test]
async fn test_implicit_target_and_preview() {
    let Harness {
        registry,
        channel,
        mut statuses,
        mut client,
        server,
        ..
    } = harness(1, Duration::from_secs(2));
    registry.discover_now().await.unwrap();

    let driver = async {
        next_of(&mut statuses, &[StatusKind::CapabilitiesReady]).await;
        send(
            &mut client,
            r#"{"command":"select_device","preview":{"width":3840,"height":2160,"fps":30}}"#,
        )
        .await;
        let selected = next_of(&mut statuses, &[StatusKind::DeviceSelected, StatusKind::Error]).await;
        assert_eq!(selected.status, StatusKind::DeviceSelected);
        assert_eq!(selected.data["device_id"], CAM);
        assert_eq!(selected.data["config"]["preview_mode"]["width"], 1920);
        assert_eq!(selected.data["warnings"].as_array().unwrap().len(), 1);

        send(&mut client, r#"{"command":"enable_preview"}"#).await;
        next_of(&mut statuses, &[StatusKind::PreviewStarted]).await;

        send(&mut client, r#"{"command":"get_status"}"#).await;
        let status = next_of(&mut statuses, &[StatusKind::Status]).await;
        assert_eq!(status.data["selected"], CAM);
        assert_eq!(status.data["devices"][0]["lifecycle"], "previewing");

        send(&mut client, r#"{"command":"quit"}"#).await;
        next_of(&mut statuses, &[StatusKind::PreviewStopped, StatusKind::Quitting]).await;
    };
    let (result, ()) = tokio::join!(channel.run(BufReader::new(server)), driver);
    result.unwrap();
}

#[tokio::test]
async fn test_ambiguous_or_missing_target() {
    let Harness {
        registry,
        channel,
        mut statuses,
        mut client,
        server,
        mock,
        ..
    } = harness(2, Duration::from_secs(2));
    registry.discover_now().await.unwrap();

    let driver = async {
        send(&mut client, r#"{"command":"enable_preview"}"#).await;
        let error = next_of(&mut statuses, &[StatusKind::Error]).await;
        assert_eq!(error.data["message"], "invalid_arguments");

        mock.unplug("cam-0001");
        mock.unplug("cam-0002");
        registry.discover_now().await.unwrap();
        send(&mut client, r#"{"command":"enable_preview"}"#).await;
        // the empty discovery round reports not-found too, without a command
        loop {
            let status = next_of(&mut statuses, &[StatusKind::DeviceNotFound]).await;
            if !status.data["command"].is_null() {
                assert_eq!(status.data["command"], "enable_preview");
                break;
            }
        }

        send(&mut client, r#"{"command":"quit"}"#).await;
    };
    let (result, ()) = tokio::join!(channel.run(BufReader::new(server)), driver);
    result.unwrap();
}

#[tokio::test]
async fn test_slow_registry_answers_busy() {
    let Harness {
        registry,
        channel,
        mut statuses,
        mut client,
        server,
        mock,
        ..
    } = harness(1, Duration::from_millis(100));
    mock.set_probe_delay(CAM, Duration::from_millis(600));
    registry.discover_now().await.unwrap();

    let driver = async {
        send(&mut client, r#"{"command":"select_device","device_id":"cam-0001"}"#).await;
        let busy = next_of(&mut statuses, &[StatusKind::Busy, StatusKind::DeviceSelected]).await;
        assert_eq!(busy.status, StatusKind::Busy);
        assert_eq!(busy.data["command"], "select_device");

        // the abandoned selection is not applied once the probe lands
        next_of(&mut statuses, &[StatusKind::CapabilitiesReady]).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            registry.device(CAM).await.unwrap().lifecycle,
            Lifecycle::Discovered
        );

        send(&mut client, r#"{"command":"quit"}"#).await;
    };
    let (result, ()) = tokio::join!(channel.run(BufReader::new(server)), driver);
    result.unwrap();
}

#[tokio::test]
async fn test_end_of_input_quits() {
    let Harness {
        registry,
        channel,
        mut statuses,
        client,
        server,
        ..
    } = harness(1, Duration::from_secs(2));
    drop(client);
    channel.run(BufReader::new(server)).await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(status) = statuses.try_recv() {
        kinds.push(status.status);
    }
    assert_eq!(kinds.first(), Some(&StatusKind::Initialized));
    assert_eq!(kinds.last(), Some(&StatusKind::Quitting));
    assert!(registry.is_closed() || registry.devices().await.is_err());
}

#[tokio::test]
async fn test_interrupt_quits() {
    let Harness {
        channel,
        mut statuses,
        client: _client,
        server,
        ..
    } = harness(0, Duration::from_secs(2));
    channel.interrupt_handle().notify_one();
    channel.run(BufReader::new(server)).await.unwrap();
    next_of(&mut statuses, &[StatusKind::Quitting]).await;
}

#[tokio::test]
async fn test_undecodable_line_is_skipped() {
    let Harness {
        registry,
        channel,
        mut statuses,
        mut client,
        server,
        ..
    } = harness(1, Duration::from_secs(2));
    registry.discover_now().await.unwrap();

    let driver = async {
        client.write_all(b"\xff\xfe garbage\n").await.unwrap();
        send(&mut client, r#"{"command":"get_status"}"#).await;
        let reply = next_of(
            &mut statuses,
            &[StatusKind::Status, StatusKind::Error, StatusKind::Quitting],
        )
        .await;
        assert_eq!(reply.status, StatusKind::Status);
        assert_eq!(reply.data["devices"][0]["identity"]["stable_id"], CAM);

        send(&mut client, r#"{"command":"quit"}"#).await;
        next_of(&mut statuses, &[StatusKind::Quitting]).await;
    };
    let (result, ()) = tokio::join!(channel.run(BufReader::new(server)), driver);
    result.unwrap();
}

#[tokio::test]
async fn test_telemetry_is_rate_limited_while_streaming() {
    let interval = Duration::from_millis(100);
    let Harness {
        registry,
        channel,
        mut statuses,
        mut client,
        server,
        ..
    } = harness_with(
        1,
        ChannelSettings {
            command_timeout: Duration::from_secs(2),
            telemetry_interval: Some(interval),
        },
    );
    registry.discover_now().await.unwrap();
    let started = Instant::now();

    let driver = async {
        next_of(&mut statuses, &[StatusKind::CapabilitiesReady]).await;
        send(&mut client, r#"{"command":"select_device"}"#).await;
        next_of(&mut statuses, &[StatusKind::DeviceSelected]).await;
        send(&mut client, r#"{"command":"enable_preview"}"#).await;
        next_of(&mut statuses, &[StatusKind::PreviewStarted]).await;

        let window_end = Instant::now() + Duration::from_secs(1);
        let mut telemetry = Vec::new();
        while let Ok(Some(status)) = tokio::time::timeout_at(window_end, statuses.recv()).await {
            if status.status == StatusKind::Telemetry {
                telemetry.push(status);
            }
        }
        let elapsed = started.elapsed();

        let allowed = (elapsed.as_millis() / interval.as_millis()) as usize + 1;
        assert!(!telemetry.is_empty());
        assert!(
            telemetry.len() <= allowed,
            "{} telemetry lines in {:?}",
            telemetry.len(),
            elapsed
        );
        let frames = telemetry
            .last()
            .and_then(|t| t.data["devices"][0]["metrics"]["frames_captured"].as_u64())
            .unwrap_or(0);
        assert!(
            frames as usize > telemetry.len(),
            "{} frames against {} telemetry lines",
            frames,
            telemetry.len()
        );

        send(&mut client, r#"{"command":"quit"}"#).await;
        next_of(&mut statuses, &[StatusKind::Quitting]).await;
    };
    let (result, ()) = tokio::join!(channel.run(BufReader::new(server)), driver);
    result.unwrap();
}
