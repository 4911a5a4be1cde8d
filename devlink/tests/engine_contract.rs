//! End-to-end behavior of the engine against the simulated device.

use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};

use devlink::protocol::decoder::{DecodeRules, Decoded, FrameDecoder};
use devlink::{
    AccessViolation, BackoffConfig, BatchKind, Command, ConnectionState, Engine, EngineConfig,
    Error, Event, FailureReason, ImageBuilder, Mode, ParameterValue, SimHandle, SimulatedDevice,
    Status, SyncStatus, UpgradeFailure, UpgradeSession, UpgradeState,
};

fn config() -> EngineConfig {
    EngineConfig::default()
        .with_request_timeout(Duration::from_millis(50))
        .with_max_retries(1)
        .with_command_timeout(Duration::from_millis(300))
        .with_heartbeat(None)
        .with_backoff(BackoffConfig {
            initial: Duration::from_millis(5),
            max: Duration::from_millis(40),
            multiplier: 2.0,
        })
}

fn connect(version: &str, mode: Mode) -> (Engine<SimulatedDevice>, SimHandle, Receiver<Event>) {
    let _ = env_logger::builder()
        .is_test(true)
        .try_init();
    let device = SimulatedDevice::new(version);
    let handle = device.handle();
    let mut engine = Engine::new(device, config().with_initial_mode(mode));
    let events = engine.subscribe();
    engine
        .connect()
        .expect("simulated device should connect");
    (engine, handle, events)
}

fn id_of(engine: &Engine<SimulatedDevice>, name: &str) -> u16 {
    engine
        .table()
        .and_then(|t| t.find(name))
        .map(|p| p.id)
        .expect("parameter should exist")
}

#[test]
fn write_then_read_returns_written_value() {
    let (mut engine, handle, _events) = connect("2.0.0", Mode::Parameter);
    let cases = [
        ("gain", ParameterValue::Integer(640)),
        ("threshold", ParameterValue::Float(2.25)),
        ("trigger", ParameterValue::Boolean(true)),
        ("filter", ParameterValue::Enumerated(2)),
    ];

    for (name, value) in cases {
        let id = id_of(&engine, name);
        engine
            .write_one(id, value.clone())
            .unwrap();
        assert_eq!(engine.read_one(id).unwrap(), value, "{name}");
        assert_eq!(handle.param_value(id), Some(value));
        assert_eq!(engine.parameter(id).unwrap().status(), SyncStatus::Synced);
    }
}

#[test]
fn read_all_without_failures_reports_every_parameter() {
    let (mut engine, _handle, events) = connect("2.0.0", Mode::Parameter);
    let readable = engine
        .table()
        .unwrap()
        .iter()
        .filter(|p| p.access.is_readable())
        .count();

    let report = engine.read_all().unwrap();
    assert!(report.is_success());
    assert_eq!(report.kind, BatchKind::ReadAll);
    assert_eq!(report.succeeded(), readable);
    assert!(report.failed_ids().is_empty());

    let completed = events
        .try_iter()
        .find_map(|e| match e {
            Event::BatchOperationCompleted(report) => Some(report),
            _ => None,
        })
        .unwrap();
    assert_eq!(completed, report);
}

#[test]
fn store_all_with_one_rejection_reports_only_that_id() {
    let (mut engine, handle, _events) = connect("2.0.0", Mode::Parameter);
    let gain = id_of(&engine, "gain");
    let threshold = id_of(&engine, "threshold");
    engine
        .stage(threshold, ParameterValue::Float(3.5))
        .unwrap();
    handle.reject(gain, Status::InvalidValue);

    let report = engine.store_all().unwrap();
    assert!(!report.is_success());
    assert_eq!(report.failed_ids(), vec![gain]);
    assert_eq!(
        report.failures().next().map(|(_, r)| r.clone()),
        Some(FailureReason::Rejected(Status::InvalidValue))
    );
    assert_eq!(report.succeeded(), report.len() - 1);

    assert_eq!(engine.parameter(gain).unwrap().status(), SyncStatus::Error);
    assert_eq!(
        engine.parameter(gain).unwrap().value(),
        Some(&ParameterValue::Integer(10))
    );
    assert_eq!(engine.parameter(threshold).unwrap().status(), SyncStatus::Synced);
    assert_eq!(handle.param_value(threshold), Some(ParameterValue::Float(3.5)));
}

#[test]
fn reply_split_over_four_reads_is_one_line() {
    let mut decoder = FrameDecoder::with_rules(DecodeRules::Lines);
    let mut out = Vec::new();
    for chunk in [b"O", b"K", b"\r", b"\n"] {
        out.extend(decoder.feed(chunk, Instant::now()));
    }
    assert_eq!(out, vec![Decoded::Line("OK".to_string())]);
}

#[test]
fn link_loss_fails_request_and_reconnect_restores_parameter_mode() {
    let device = SimulatedDevice::new("2.0.0");
    let handle = device.handle();
    let mut engine = Engine::new(
        device,
        config()
            .with_request_timeout(Duration::from_secs(2))
            .with_initial_mode(Mode::Parameter),
    );
    let events = engine.subscribe();
    engine.connect().unwrap();
    let gain = id_of(&engine, "gain");

    handle.drop_link_on(Command::ReadParameter);
    let started = Instant::now();
    let err = engine.read_one(gain).unwrap_err();
    assert!(matches!(err, Error::LinkLost { sequence: Some(_) }), "{err}");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(engine.state(), ConnectionState::Reconnecting);
    assert_eq!(engine.parameter(gain).unwrap().status(), SyncStatus::Error);

    handle.clear_drop_link();
    handle.set_link_down(false);
    assert_eq!(handle.mode(), Mode::Cli);

    let before = handle.received_frames().len();
    assert_eq!(engine.read_one(gain).unwrap(), ParameterValue::Integer(10));
    assert_eq!(engine.state(), ConnectionState::Connected);
    assert_eq!(handle.mode(), Mode::Parameter);

    // Only the new read went out in binary; mode restore used the text handshake.
    let frames = handle.received_frames();
    assert_eq!(frames.len(), before + 1);
    let lines = handle.received_lines();
    assert_eq!(
        lines
            .iter()
            .filter(|l| *l == "mode par")
            .count(),
        2
    );

    let states: Vec<ConnectionState> = events
        .try_iter()
        .filter_map(|e| match e {
            Event::ConnectionStateChanged { new, .. } => Some(new),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Reconnecting,
            ConnectionState::Connected,
        ]
    );
}

#[test]
fn reconnect_marks_synced_parameters_stale() {
    let (mut engine, handle, _events) = connect("2.0.0", Mode::Parameter);
    let gain = id_of(&engine, "gain");
    engine.read_one(gain).unwrap();

    handle.set_link_down(true);
    assert!(engine.ping().is_err());
    handle.set_link_down(false);
    engine.ensure_ready().unwrap();

    let param = engine.parameter(gain).unwrap();
    assert_eq!(param.status(), SyncStatus::Stale);
    assert_eq!(param.value(), Some(&ParameterValue::Integer(10)));
}

#[test]
fn reconnect_retries_with_backoff_until_open_succeeds() {
    let (mut engine, handle, _events) = connect("2.0.0", Mode::Bootloader);
    handle.set_link_down(true);
    assert!(engine.ping().is_err());
    handle.set_link_down(false);
    handle.refuse_opens(2);

    assert!(engine.ensure_ready().is_err());
    assert!(engine.ensure_ready().is_err());
    engine.ensure_ready().unwrap();
    assert_eq!(engine.mode(), Mode::Bootloader);
    engine.ping().unwrap();
}

#[test]
fn transfer_out_of_order_is_a_sequence_error() {
    let (mut engine, _handle, _events) = connect("2.0.0", Mode::Cli);
    let image = ImageBuilder::new(vec![0x5A; 600])
        .into_image()
        .unwrap();
    let mut session = UpgradeSession::for_engine(&engine, image).unwrap();

    assert!(matches!(
        session.transfer_chunk(&mut engine),
        Err(Error::UpgradeSequence {
            state: UpgradeState::Idle,
            ..
        })
    ));

    session.prepare(&mut engine).unwrap();
    assert!(matches!(
        session.transfer_chunk(&mut engine),
        Err(Error::UpgradeSequence {
            state: UpgradeState::Preparing,
            ..
        })
    ));
    assert!(matches!(
        session.finalize(&mut engine),
        Err(Error::UpgradeSequence { .. })
    ));
    assert_eq!(session.state(), &UpgradeState::Preparing);
}

#[test]
fn legacy_device_gets_install_and_current_device_gets_prepare() {
    let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();

    let (mut engine, handle, _events) = connect("1.5.0", Mode::Cli);
    let image = ImageBuilder::new(payload.clone())
        .into_image()
        .unwrap();
    UpgradeSession::for_engine(&engine, image)
        .unwrap()
        .run(&mut engine)
        .unwrap();
    let commands = handle.received_commands();
    assert!(commands.contains(&Command::Install));
    assert!(!commands.contains(&Command::Prepare));
    assert_eq!(handle.installed_image(), Some(payload.clone()));

    let (mut engine, handle, _events) = connect("2.0.0", Mode::Cli);
    let image = ImageBuilder::new(payload.clone())
        .into_image()
        .unwrap();
    UpgradeSession::for_engine(&engine, image)
        .unwrap()
        .run(&mut engine)
        .unwrap();
    let commands = handle.received_commands();
    assert!(commands.contains(&Command::Prepare));
    assert!(!commands.contains(&Command::Install));
    assert_eq!(handle.installed_image(), Some(payload));
}

#[test]
fn upgrade_reports_progress_until_complete() {
    let (mut engine, _handle, events) = connect("2.0.0", Mode::Cli);
    let image = ImageBuilder::new(vec![1u8; 1024])
        .version(1, 4, 0)
        .with_crc(true)
        .with_digest(true)
        .into_image()
        .unwrap();
    let mut session = UpgradeSession::for_engine(&engine, image)
        .unwrap()
        .with_validation(true)
        .with_chunk_size(256);
    session.run(&mut engine).unwrap();
    assert!(!engine.is_upgrading());

    let progress: Vec<(UpgradeState, u8)> = events
        .try_iter()
        .filter_map(|e| match e {
            Event::UpgradeProgress { state, percent } => Some((state, percent)),
            _ => None,
        })
        .collect();
    assert_eq!(progress.first().map(|p| &p.0), Some(&UpgradeState::Preparing));
    assert_eq!(progress.last(), Some(&(UpgradeState::Complete, 100)));
    let percents: Vec<u8> = progress
        .iter()
        .filter(|(s, _)| *s == UpgradeState::Transferring)
        .map(|(_, p)| *p)
        .collect();
    assert_eq!(percents, vec![25, 50, 75]);
}

#[test]
fn validation_on_legacy_device_is_a_version_mismatch() {
    let (mut engine, handle, _events) = connect("1.5.0", Mode::Cli);
    let image = ImageBuilder::new(vec![0u8; 64])
        .into_image()
        .unwrap();
    let mut session = UpgradeSession::for_engine(&engine, image)
        .unwrap()
        .with_validation(true);

    let err = session.run(&mut engine).unwrap_err();
    assert!(matches!(err, Error::VersionMismatch { .. }));
    assert!(matches!(
        session.state(),
        UpgradeState::Failed(UpgradeFailure::Version(_))
    ));
    assert!(handle.received_frames().is_empty());
}

#[test]
fn link_loss_during_upgrade_fails_the_session() {
    let (mut engine, handle, events) = connect("2.0.0", Mode::Cli);
    let image = ImageBuilder::new(vec![9u8; 2048])
        .into_image()
        .unwrap();
    let mut session = UpgradeSession::for_engine(&engine, image).unwrap();
    handle.drop_link_on(Command::Data);

    assert!(session.run(&mut engine).is_err());
    assert_eq!(
        session.state(),
        &UpgradeState::Failed(UpgradeFailure::LinkLost)
    );
    assert!(!engine.is_upgrading());
    assert!(events.try_iter().any(|e| matches!(
        e,
        Event::UpgradeProgress {
            state: UpgradeState::Failed(UpgradeFailure::LinkLost),
            ..
        }
    )));
    assert!(handle.installed_image().is_none());
}

#[test]
fn abort_before_erase_is_safe_and_after_erase_is_not() {
    let (mut engine, _handle, _events) = connect("2.0.0", Mode::Cli);
    let image = || {
        ImageBuilder::new(vec![3u8; 512])
            .into_image()
            .unwrap()
    };

    let mut session = UpgradeSession::for_engine(&engine, image()).unwrap();
    session.prepare(&mut engine).unwrap();
    assert_eq!(session.abort(&mut engine).unwrap(), devlink::AbortOutcome::Safe);
    assert!(session.state().is_terminal());

    let mut session = UpgradeSession::for_engine(&engine, image()).unwrap();
    session.prepare(&mut engine).unwrap();
    session.erase(&mut engine).unwrap();
    assert_eq!(
        session.abort(&mut engine).unwrap(),
        devlink::AbortOutcome::FirmwareStateUnknown
    );
    assert!(session.prepare(&mut engine).is_err());
}

#[test]
fn abort_after_link_loss_reports_a_single_failure() {
    let (mut engine, handle, events) = connect("2.0.0", Mode::Cli);
    let image = ImageBuilder::new(vec![7u8; 512])
        .into_image()
        .unwrap();
    let mut session = UpgradeSession::for_engine(&engine, image).unwrap();
    session.prepare(&mut engine).unwrap();
    session.erase(&mut engine).unwrap();

    handle.set_link_down(true);
    assert!(engine.ping().is_err());
    assert_eq!(
        session.refresh(&engine),
        &UpgradeState::Failed(UpgradeFailure::LinkLost)
    );
    assert_eq!(
        session.abort(&mut engine).unwrap(),
        devlink::AbortOutcome::FirmwareStateUnknown
    );
    assert_eq!(
        session.state(),
        &UpgradeState::Failed(UpgradeFailure::LinkLost)
    );
    assert!(!engine.is_upgrading());

    let terminal: Vec<UpgradeState> = events
        .try_iter()
        .filter_map(|e| match e {
            Event::UpgradeProgress { state, .. } if state.is_terminal() => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(
        terminal,
        vec![UpgradeState::Failed(UpgradeFailure::LinkLost)]
    );
}

#[test]
fn abort_after_link_loss_before_erase_is_safe() {
    let (mut engine, handle, _events) = connect("2.0.0", Mode::Cli);
    let image = ImageBuilder::new(vec![7u8; 64])
        .into_image()
        .unwrap();
    let mut session = UpgradeSession::for_engine(&engine, image).unwrap();
    session.prepare(&mut engine).unwrap();

    handle.set_link_down(true);
    assert!(engine.ping().is_err());
    assert_eq!(session.abort(&mut engine).unwrap(), devlink::AbortOutcome::Safe);
    assert!(handle.installed_image().is_none());
}

#[test]
fn old_device_cannot_enter_parameter_mode() {
    let device = SimulatedDevice::new("1.2.0");
    let mut engine = Engine::new(device, config());
    engine.connect().unwrap();

    let err = engine
        .switch_mode(Mode::Parameter)
        .unwrap_err();
    assert!(matches!(err, Error::VersionMismatch { .. }));
    assert_eq!(engine.mode(), Mode::Cli);
    assert_eq!(engine.state(), ConnectionState::Connected);
}

#[test]
fn legacy_listing_makes_every_parameter_read_write() {
    let (engine, _handle, _events) = connect("1.3.0", Mode::Parameter);
    let table = engine.table().unwrap();
    assert!(table.iter().all(|p| p.access == devlink::Access::ReadWrite));
    assert_eq!(
        table.find("gain").and_then(|p| p.group.clone()),
        Some("Control".to_string())
    );
}

#[test]
fn access_violations_never_reach_the_device() {
    let (mut engine, handle, _events) = connect("2.0.0", Mode::Parameter);
    let serial = id_of(&engine, "serial");
    let gain = id_of(&engine, "gain");

    let err = engine
        .write_one(serial, ParameterValue::String("x".into()))
        .unwrap_err();
    assert!(matches!(
        err,
        Error::ParameterAccess {
            violation: AccessViolation::ReadOnly,
            ..
        }
    ));
    let err = engine
        .write_one(gain, ParameterValue::Float(1.0))
        .unwrap_err();
    assert!(matches!(
        err,
        Error::ParameterAccess {
            violation: AccessViolation::TypeMismatch { .. },
            ..
        }
    ));
    assert!(handle.received_frames().is_empty());
}
