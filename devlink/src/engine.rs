//! The device link engine.
//!
//! One [`Engine`] owns one transport and everything tied to the connection:
//! the protocol session, the active mode, the negotiated version, the
//! parameter table and the connection state. Callers drive it directly from
//! one thread, or through [`crate::EngineHandle`] from many.
//!
//! ## Connect
//!
//! 1. Open the transport with the line rules active.
//! 2. `version` → `CLI vX.Y.Z`, fixed for the session.
//! 3. `par_print` → parameter table.
//! 4. Enter the configured initial mode.
//!
//! ## Link loss
//!
//! A failed read or write, a failed health ping, or silence beyond the
//! heartbeat window in a binary mode ends the link. Outstanding requests
//! fail with [`Error::LinkLost`], a running upgrade is reported failed, and
//! the state moves to `Reconnecting`. Reconnect attempts run from
//! [`Engine::service`] as the backoff allows, or immediately (after waiting
//! out the backoff) when a caller issues a new operation. A reconnect
//! re-reads the version, marks synced parameters stale and restores the
//! previous mode before the state returns to `Connected`.

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::config::EngineConfig;
use crate::correlator::Correlator;
use crate::error::{Error, Result};
use crate::events::{Event, Line, LineSource, publish};
use crate::mode::{Mode, ModeChange, ModeController};
use crate::param::schema::SchemaParser;
use crate::param::{Parameter, ParameterTable};
use crate::protocol::decoder::{DecodeRules, Decoded, FrameDecoder};
use crate::protocol::text::{SCHEMA_COMMAND, VERSION_COMMAND};
use crate::protocol::{Command, Frame, Request};
use crate::session::CancelToken;
use crate::stats::LinkStats;
use crate::supervisor::{ConnectionState, StateChange, Supervisor};
use crate::transport::{Channel, Transport};
use crate::upgrade::{UpgradeFailure, UpgradeState};
use crate::version::{DeviceVersion, PARAMETER_MODE_MIN};

const BACKOFF_SLICE: Duration = Duration::from_millis(10);

/// Protocol engine over one transport.
pub struct Engine<T: Transport> {
    channel: Channel<T>,
    correlator: Correlator,
    modes: ModeController,
    supervisor: Supervisor,
    version: Option<DeviceVersion>,
    table: Option<ParameterTable>,
    events: Option<Sender<Event>>,
    config: EngineConfig,
    generation: u64,
    upgrade_active: bool,
    cancel: CancelToken,
}

impl<T: Transport> Engine<T> {
    /// Engine over `transport`. Nothing is opened until [`Engine::connect`].
    pub fn new(transport: T, config: EngineConfig) -> Self {
        let decoder = FrameDecoder::new(DecodeRules::Lines, config.max_line, config.frame_deadline);
        Self {
            channel: Channel::new(transport, decoder, config.heartbeat),
            correlator: Correlator::new(Mode::Cli, config.request_timeout, config.max_retries),
            modes: ModeController::new(Mode::Cli, config.command_timeout),
            supervisor: Supervisor::new(config.backoff.clone()),
            version: None,
            table: None,
            events: None,
            config,
            generation: 0,
            upgrade_active: false,
            cancel: CancelToken::new(),
        }
    }

    /// Engine that reports to `events`.
    pub fn with_events(transport: T, config: EngineConfig, events: Sender<Event>) -> Self {
        let mut engine = Self::new(transport, config);
        engine.events = Some(events);
        engine
    }

    /// Replace the event queue and return its receiving end.
    pub fn subscribe(&mut self) -> Receiver<Event> {
        let (tx, rx) = mpsc::channel();
        self.events = Some(tx);
        rx
    }

    /// Connection state.
    pub fn state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    /// Active mode. While reconnecting, the mode that will be restored.
    pub fn mode(&self) -> Mode {
        match self.supervisor.state() {
            ConnectionState::Reconnecting => self.modes.restore_target(),
            _ => self.correlator.session().mode(),
        }
    }

    /// Version negotiated at connect.
    pub fn version(&self) -> Option<&DeviceVersion> {
        self.version.as_ref()
    }

    /// Parameter table of the current connection.
    pub fn table(&self) -> Option<&ParameterTable> {
        self.table.as_ref()
    }

    /// One parameter.
    pub fn parameter(&self, id: u16) -> Option<&Parameter> {
        self.table
            .as_ref()
            .and_then(|t| t.get(id))
    }

    /// Configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Token that cancels the in-flight operation. Cancellation is sticky
    /// until the token is reset.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Use `token` for cancellation from now on.
    pub fn set_cancel_token(&mut self, token: CancelToken) {
        self.cancel = token;
    }

    /// Counter bumped on every link loss and disconnect.
    pub fn link_generation(&self) -> u64 {
        self.generation
    }

    /// Whether an upgrade session is running.
    pub fn is_upgrading(&self) -> bool {
        self.upgrade_active
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        self.channel.transport()
    }

    /// Traffic and error counters since the engine was created.
    pub fn stats(&self) -> LinkStats {
        self.channel.stats()
    }

    /// Open the link, negotiate the version and load the parameter table.
    pub fn connect(&mut self) -> Result<()> {
        if self.supervisor.state() != ConnectionState::Disconnected {
            return Err(Error::Busy(format!(
                "connection is {}",
                self.supervisor.state()
            )));
        }
        self.config.validate()?;

        let change = self.supervisor.connecting();
        self.publish_state(change);
        info!("Connecting to {}", self.channel.transport().name());

        if let Err(e) = self.establish() {
            warn!("Connection to {} failed: {e}", self.channel.transport().name());
            self.teardown();
            return Err(e);
        }

        let change = self.supervisor.connected();
        self.publish_state(change);
        info!(
            "Connected to {} ({}, {} parameter(s))",
            self.channel.transport().name(),
            self.version
                .as_ref()
                .map_or_else(String::new, ToString::to_string),
            self.table.as_ref().map_or(0, ParameterTable::len)
        );

        let initial = self.config.initial_mode;
        if initial != Mode::Cli {
            self.switch_mode(initial)?;
        }
        Ok(())
    }

    /// Close the link and drop the session. Running upgrades fail.
    pub fn disconnect(&mut self) {
        if self.supervisor.state() == ConnectionState::Disconnected {
            return;
        }
        if self.supervisor.state() == ConnectionState::Connected && self.mode().is_binary() {
            if let Err(e) = self.leave_binary_mode() {
                warn!("Could not return to CLI mode before disconnecting: {e}");
            }
        }
        self.correlator.fail_outstanding();
        self.fail_upgrade();
        self.teardown();
        info!("Disconnected");
    }

    /// Stop reconnecting and go to `Disconnected`.
    pub fn cancel_reconnect(&mut self) {
        if self.supervisor.state() == ConnectionState::Reconnecting {
            info!("Reconnect cancelled");
            self.teardown();
        }
    }

    /// Switch the device to `target`.
    pub fn switch_mode(&mut self, target: Mode) -> Result<Option<ModeChange>> {
        self.ensure_ready()?;
        if self.upgrade_active && target != Mode::Bootloader {
            return Err(Error::Busy("an upgrade is running".to_string()));
        }
        let version = self.version.clone().ok_or(Error::NotConnected)?;

        let events = self.events.as_ref();
        let result = self.modes.switch(
            target,
            &mut self.channel,
            &mut self.correlator,
            &version,
            &self.cancel,
            |text| publish_line(events, text, LineSource::Device),
        );
        match result {
            Ok(Some(change)) => {
                self.emit(Event::ModeChanged {
                    old: change.old,
                    new: change.new,
                });
                Ok(Some(change))
            },
            Ok(None) => Ok(None),
            Err(e) => {
                self.absorb(&e);
                Err(e)
            },
        }
    }

    /// Send one text line in CLI mode.
    pub fn send_line(&mut self, text: &str) -> Result<()> {
        self.ensure_ready()?;
        let active = self.mode();
        if active != Mode::Cli {
            return Err(Error::WrongMode {
                expected: Mode::Cli,
                active,
            });
        }
        if let Err(e) = self.channel.send_line(text) {
            self.absorb(&e);
            return Err(e);
        }
        self.emit(Event::LineReceived(Line::new(text, LineSource::Host)));
        Ok(())
    }

    /// Read pending device output in CLI mode and publish it as lines.
    pub fn pump_lines(&mut self) -> Result<usize> {
        if self.supervisor.state() != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        let active = self.mode();
        if active != Mode::Cli {
            return Err(Error::WrongMode {
                expected: Mode::Cli,
                active,
            });
        }

        let decoded = match self.channel.poll() {
            Ok(decoded) => decoded,
            Err(e) => {
                self.absorb(&e);
                return Err(e);
            },
        };
        let mut lines = 0;
        for item in decoded {
            match item {
                Decoded::Line(text) => {
                    lines += 1;
                    self.emit(Event::LineReceived(Line::new(text, LineSource::Device)));
                },
                Decoded::Error(e) => warn!("Malformed device output: {e}"),
                Decoded::Frame(frame) => {
                    warn!("Unsolicited frame cmd={:#04x} in CLI mode", frame.command);
                },
            }
        }
        Ok(lines)
    }

    /// Send a raw binary request and return the response frame.
    pub fn request(&mut self, request: Request) -> Result<Frame> {
        self.exchange(request)
    }

    /// Ping the device in a binary mode.
    pub fn ping(&mut self) -> Result<()> {
        let response = self.exchange(Request::new(Command::Ping))?;
        match response.status() {
            Some(status) if status.is_ok() => Ok(()),
            Some(status) => Err(Error::DeviceStatus {
                command: Command::Ping.name(),
                status,
            }),
            None => Err(Error::Protocol("empty ping response".to_string())),
        }
    }

    /// Do one step of background work: pump lines, keep the link alive,
    /// re-check a suspect link, or attempt a due reconnect.
    pub fn service(&mut self) -> Result<()> {
        match self.supervisor.state() {
            ConnectionState::Disconnected | ConnectionState::Connecting => Ok(()),
            ConnectionState::Reconnecting => {
                if self.supervisor.attempt_due(Instant::now()) {
                    self.try_reconnect()?;
                }
                Ok(())
            },
            ConnectionState::Connected => {
                if self.channel.take_suspect() || !self.channel.is_healthy() {
                    return self.check_health();
                }
                if self.mode() == Mode::Cli {
                    self.pump_lines().map(|_| ())
                } else {
                    self.heartbeat()
                }
            },
        }
    }

    /// Make sure the link is usable before an operation.
    ///
    /// While reconnecting this waits out the backoff and makes one attempt,
    /// so a caller never runs before the previous mode is restored.
    pub fn ensure_ready(&mut self) -> Result<()> {
        match self.supervisor.state() {
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                return Err(Error::NotConnected);
            },
            ConnectionState::Reconnecting => self.reconnect_when_due()?,
            ConnectionState::Connected => {},
        }
        if self.channel.take_suspect() || !self.channel.is_healthy() {
            self.check_health()?;
        }
        Ok(())
    }

    pub(crate) fn exchange(&mut self, request: Request) -> Result<Frame> {
        self.ensure_ready()?;
        let result = self
            .correlator
            .exchange(&mut self.channel, request, &self.cancel);
        if let Err(e) = &result {
            self.absorb(e);
        }
        result
    }

    pub(crate) fn emit(&self, event: Event) {
        publish(self.events.as_ref(), event);
    }

    pub(crate) fn table_mut(&mut self) -> Option<&mut ParameterTable> {
        self.table.as_mut()
    }

    pub(crate) fn begin_upgrade(&mut self) -> Result<()> {
        if self.supervisor.state() != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        if self.upgrade_active {
            return Err(Error::Busy("an upgrade is already running".to_string()));
        }
        self.upgrade_active = true;
        Ok(())
    }

    pub(crate) fn end_upgrade(&mut self) {
        self.upgrade_active = false;
    }

    fn establish(&mut self) -> Result<()> {
        self.open_link()?;
        let version = self.query_version()?;
        let table = self.fetch_schema(&version)?;
        self.version = Some(version);
        self.table = Some(table);
        Ok(())
    }

    fn open_link(&mut self) -> Result<()> {
        self.channel.open()?;
        self.channel.set_rules(DecodeRules::Lines);
        self.correlator.reset(Mode::Cli);
        Ok(())
    }

    fn query_version(&mut self) -> Result<DeviceVersion> {
        self.channel.send_line(VERSION_COMMAND)?;
        let events = self.events.as_ref();
        let result = self.channel.await_line(
            self.config.command_timeout,
            &self.cancel,
            DeviceVersion::from_banner,
            |text| publish_line(events, text, LineSource::Device),
        );
        match result {
            Ok(version) => {
                info!("Device reports {version}");
                Ok(version)
            },
            Err(Error::Timeout { .. }) => Err(Error::VersionMismatch {
                device: "unknown".to_string(),
                required: format!(">={PARAMETER_MODE_MIN}"),
                feature: "version negotiation".to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    fn fetch_schema(&mut self, version: &DeviceVersion) -> Result<ParameterTable> {
        self.channel.send_line(SCHEMA_COMMAND)?;
        let mut parser = SchemaParser::new(version.schema_format());
        let mut failure = None;
        self.channel.await_line(
            self.config.schema_timeout,
            &self.cancel,
            |line| match parser.feed(line) {
                Ok(true) => Some(()),
                Ok(false) => None,
                Err(e) => {
                    failure = Some(e);
                    Some(())
                },
            },
            |_| {},
        )?;
        if let Some(e) = failure {
            return Err(e);
        }
        parser.finish()
    }

    fn reconnect_when_due(&mut self) -> Result<()> {
        if let Some(at) = self.supervisor.backoff().next_attempt() {
            loop {
                let now = Instant::now();
                if now >= at {
                    break;
                }
                if self.cancel.is_cancelled() {
                    return Err(Error::Cancelled { sequence: None });
                }
                thread::sleep((at - now).min(BACKOFF_SLICE));
            }
        }
        self.try_reconnect()
    }

    fn try_reconnect(&mut self) -> Result<()> {
        debug!(
            "Reconnect attempt {} to {}",
            self.supervisor.backoff().attempt(),
            self.channel.transport().name()
        );
        match self.reestablish() {
            Ok(()) => {
                let change = self.supervisor.connected();
                self.publish_state(change);
                self.channel.note_reconnect();
                info!("Reconnected to {}", self.channel.transport().name());
                self.emit_system("link restored");
                Ok(())
            },
            Err(e @ Error::VersionMismatch { .. }) => {
                warn!("Giving up reconnect: {e}");
                self.teardown();
                Err(e)
            },
            Err(e) => {
                self.channel.close();
                let delay = self.supervisor.attempt_failed(Instant::now());
                debug!("Reconnect failed: {e}; next attempt in {delay:?}");
                Err(e)
            },
        }
    }

    fn reestablish(&mut self) -> Result<()> {
        self.open_link()?;
        let version = self.query_version()?;
        let Some(known) = self.version.clone() else {
            return Err(Error::NotConnected);
        };
        if known != version {
            return Err(Error::VersionMismatch {
                device: version.version().to_string(),
                required: format!("={}", known.version()),
                feature: "reconnect to the same firmware".to_string(),
            });
        }
        if let Some(table) = self.table.as_mut() {
            table.mark_stale();
        }

        let target = self.modes.restore_target();
        if target != Mode::Cli {
            let events = self.events.as_ref();
            self.modes.switch(
                target,
                &mut self.channel,
                &mut self.correlator,
                &known,
                &self.cancel,
                |text| publish_line(events, text, LineSource::Device),
            )?;
            debug!("Restored {target} mode");
        }
        Ok(())
    }

    fn heartbeat(&mut self) -> Result<()> {
        let Some(window) = self.channel.heartbeat() else {
            return Ok(());
        };
        if self.channel.idle_for() < window / 2 {
            return Ok(());
        }
        trace!("Heartbeat ping");
        let result = self.correlator.exchange(
            &mut self.channel,
            Request::new(Command::Ping),
            &self.cancel,
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                self.absorb(&e);
                Err(e)
            },
        }
    }

    /// Single ping without retries; a failure counts as link loss.
    fn check_health(&mut self) -> Result<()> {
        let healthy = if self.correlator.session().mode().is_binary() {
            match self.correlator.exchange_with(
                &mut self.channel,
                Request::new(Command::Ping),
                &self.cancel,
                0,
            ) {
                Ok(_) => true,
                Err(e @ Error::Cancelled { .. }) => return Err(e),
                Err(e) => {
                    debug!("Health check failed: {e}");
                    false
                },
            }
        } else {
            !self.channel.is_failed()
        };

        if healthy {
            self.channel.take_suspect();
            Ok(())
        } else {
            self.handle_link_loss();
            Err(Error::LinkLost { sequence: None })
        }
    }

    fn absorb(&mut self, error: &Error) {
        if matches!(error, Error::LinkLost { .. }) || self.channel.is_failed() {
            self.handle_link_loss();
        }
    }

    fn handle_link_loss(&mut self) {
        if self.supervisor.state() != ConnectionState::Connected {
            return;
        }
        let failed = self.correlator.fail_outstanding();
        self.generation = self.generation.wrapping_add(1);
        warn!(
            "Link to {} lost ({} request(s) outstanding)",
            self.channel.transport().name(),
            failed.len()
        );
        self.fail_upgrade();
        self.channel.close();

        let change = self.supervisor.link_lost(Instant::now());
        self.publish_state(change);
        self.emit_system("link lost, reconnecting");
    }

    fn fail_upgrade(&mut self) {
        if std::mem::take(&mut self.upgrade_active) {
            warn!("Upgrade interrupted by link loss");
            self.emit(Event::UpgradeProgress {
                state: UpgradeState::Failed(UpgradeFailure::LinkLost),
                percent: 0,
            });
        }
    }

    fn leave_binary_mode(&mut self) -> Result<()> {
        let version = self.version.clone().ok_or(Error::NotConnected)?;
        self.modes.switch(
            Mode::Cli,
            &mut self.channel,
            &mut self.correlator,
            &version,
            &self.cancel,
            |_| {},
        )?;
        Ok(())
    }

    fn teardown(&mut self) {
        self.channel.close();
        self.channel.set_rules(DecodeRules::Lines);
        self.correlator.reset(Mode::Cli);
        self.modes = ModeController::new(Mode::Cli, self.config.command_timeout);
        self.version = None;
        self.table = None;
        self.generation = self.generation.wrapping_add(1);
        let change = self.supervisor.disconnected();
        self.publish_state(change);
    }

    fn publish_state(&self, change: Option<StateChange>) {
        if let Some(StateChange { old, new }) = change {
            self.emit(Event::ConnectionStateChanged { old, new });
        }
    }

    fn emit_system(&self, text: &str) {
        self.emit(Event::LineReceived(Line::new(text, LineSource::System)));
    }
}

impl<T: Transport> Drop for Engine<T> {
    fn drop(&mut self) {
        self.channel.close();
    }
}

fn publish_line(events: Option<&Sender<Event>>, text: String, source: LineSource) {
    publish(events, Event::LineReceived(Line::new(text, source)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedDevice;

    fn fast_config() -> EngineConfig {
        EngineConfig::default()
            .with_request_timeout(Duration::from_millis(30))
            .with_command_timeout(Duration::from_millis(200))
            .with_heartbeat(None)
            .with_backoff(crate::config::BackoffConfig {
                initial: Duration::from_millis(5),
                max: Duration::from_millis(20),
                multiplier: 2.0,
            })
    }

    #[test]
    fn test_connect_negotiates_and_loads_table() {
        let device = SimulatedDevice::new("2.0.0");
        let mut engine = Engine::new(device, fast_config());
        let events = engine.subscribe();

        engine.connect().unwrap();
        assert_eq!(engine.state(), ConnectionState::Connected);
        assert_eq!(engine.mode(), Mode::Cli);
        assert_eq!(engine.version().map(ToString::to_string).as_deref(), Some("CLI v2.0.0"));
        assert!(!engine.table().unwrap().is_empty());

        let states: Vec<_> = events
            .try_iter()
            .filter_map(|e| match e {
                Event::ConnectionStateChanged { new, .. } => Some(new),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
    }

    #[test]
    fn test_connect_fails_without_version_answer() {
        let device = SimulatedDevice::new("2.0.0");
        device.handle().set_silent(true);
        let mut engine = Engine::new(device, fast_config());

        let err = engine.connect().unwrap_err();
        assert!(matches!(err, Error::VersionMismatch { .. }));
        assert_eq!(engine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_initial_mode_is_entered() {
        let device = SimulatedDevice::new("2.0.0");
        let mut engine = Engine::new(device, fast_config().with_initial_mode(Mode::Parameter));
        engine.connect().unwrap();
        assert_eq!(engine.mode(), Mode::Parameter);
        engine.ping().unwrap();
    }

    #[test]
    fn test_send_line_requires_cli_mode() {
        let device = SimulatedDevice::new("2.0.0");
        let mut engine = Engine::new(device, fast_config());
        engine.connect().unwrap();
        engine.switch_mode(Mode::Bootloader).unwrap();

        assert!(matches!(
            engine.send_line("help"),
            Err(Error::WrongMode {
                expected: Mode::Cli,
                active: Mode::Bootloader
            })
        ));
    }

    #[test]
    fn test_cli_lines_are_published() {
        let device = SimulatedDevice::new("2.0.0");
        let mut engine = Engine::new(device, fast_config());
        engine.connect().unwrap();
        let events = engine.subscribe();

        engine.send_line("status").unwrap();
        for _ in 0..20 {
            engine.service().unwrap();
        }

        let lines: Vec<Line> = events
            .try_iter()
            .filter_map(|e| match e {
                Event::LineReceived(line) => Some(line),
                _ => None,
            })
            .collect();
        assert_eq!(lines[0].source, LineSource::Host);
        assert_eq!(lines[0].text, "status");
        assert!(
            lines
                .iter()
                .any(|l| l.source == LineSource::Device && l.text.contains("status"))
        );
    }

    #[test]
    fn test_version_change_on_reconnect_disconnects() {
        let device = SimulatedDevice::new("2.0.0");
        let handle = device.handle();
        let mut engine = Engine::new(device, fast_config().with_initial_mode(Mode::Parameter));
        engine.connect().unwrap();

        handle.set_link_down(true);
        assert!(engine.ping().is_err());
        assert_eq!(engine.state(), ConnectionState::Reconnecting);

        handle.set_version("2.1.0");
        handle.set_link_down(false);
        let err = engine.ensure_ready().unwrap_err();
        assert!(matches!(err, Error::VersionMismatch { .. }));
        assert_eq!(engine.state(), ConnectionState::Disconnected);
        assert!(engine.table().is_none());
    }

    #[test]
    fn test_cancel_reconnect() {
        let device = SimulatedDevice::new("2.0.0");
        let handle = device.handle();
        let mut engine = Engine::new(device, fast_config().with_initial_mode(Mode::Parameter));
        engine.connect().unwrap();

        handle.set_link_down(true);
        assert!(engine.ping().is_err());
        engine.cancel_reconnect();
        assert_eq!(engine.state(), ConnectionState::Disconnected);
        assert!(matches!(engine.ping(), Err(Error::NotConnected)));
    }

    #[test]
    fn test_service_reconnects_when_due() {
        let device = SimulatedDevice::new("2.0.0");
        let handle = device.handle();
        let mut engine = Engine::new(device, fast_config().with_initial_mode(Mode::Bootloader));
        engine.connect().unwrap();

        handle.set_link_down(true);
        assert!(engine.ping().is_err());
        for _ in 0..3 {
            let _ = engine.service();
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(engine.state(), ConnectionState::Reconnecting);

        handle.set_link_down(false);
        let deadline = Instant::now() + Duration::from_secs(2);
        while engine.state() != ConnectionState::Connected && Instant::now() < deadline {
            let _ = engine.service();
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(engine.state(), ConnectionState::Connected);
        assert_eq!(engine.mode(), Mode::Bootloader);
        assert_eq!(handle.mode(), Mode::Bootloader);
    }

    #[test]
    fn test_disconnect_returns_device_to_cli() {
        let device = SimulatedDevice::new("2.0.0");
        let handle = device.handle();
        let mut engine = Engine::new(device, fast_config().with_initial_mode(Mode::Parameter));
        engine.connect().unwrap();
        assert_eq!(handle.mode(), Mode::Parameter);

        engine.disconnect();
        assert_eq!(engine.state(), ConnectionState::Disconnected);
        assert_eq!(handle.mode(), Mode::Cli);
        assert!(engine.table().is_none());
    }

    #[test]
    fn test_disconnect_completes_when_device_refuses_cli() {
        let device = SimulatedDevice::new("2.0.0");
        let handle = device.handle();
        let mut engine = Engine::new(device, fast_config().with_initial_mode(Mode::Parameter));
        engine.connect().unwrap();

        handle.refuse_mode_switch(true);
        engine.disconnect();
        assert_eq!(engine.state(), ConnectionState::Disconnected);
        assert_eq!(handle.mode(), Mode::Parameter);
        assert!(!handle.is_open());
    }

    #[test]
    fn test_stats_count_traffic_and_errors() {
        let device = SimulatedDevice::new("2.0.0");
        let handle = device.handle();
        let mut engine = Engine::new(device, fast_config());
        engine.connect().unwrap();

        let connected = engine.stats();
        assert!(connected.bytes_sent > 0);
        assert!(connected.bytes_received > 0);
        assert!(connected.lines_received > 0);
        assert_eq!(connected.errors, 0);

        engine.send_line("status").unwrap();
        assert_eq!(engine.stats().lines_sent, connected.lines_sent + 1);

        engine.switch_mode(Mode::Parameter).unwrap();
        let before = engine.stats();
        engine.ping().unwrap();
        let after = engine.stats();
        assert_eq!(after.frames_sent, before.frames_sent + 1);
        assert_eq!(after.frames_received, before.frames_received + 1);

        handle.drop_responses(1);
        engine.ping().unwrap();
        let retried = engine.stats();
        assert!(retried.warnings > after.warnings);
        assert!(retried.frames_sent >= after.frames_sent + 2);

        handle.corrupt_responses(1);
        assert!(engine.ping().is_err());
        assert!(engine.stats().errors > retried.errors);
    }

    #[test]
    fn test_stats_count_reconnects() {
        let device = SimulatedDevice::new("2.0.0");
        let handle = device.handle();
        let mut engine = Engine::new(device, fast_config().with_initial_mode(Mode::Parameter));
        engine.connect().unwrap();

        handle.set_link_down(true);
        assert!(engine.ping().is_err());
        assert!(engine.stats().errors > 0);
        handle.set_link_down(false);
        let deadline = Instant::now() + Duration::from_secs(2);
        while engine.state() != ConnectionState::Connected && Instant::now() < deadline {
            let _ = engine.service();
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(engine.state(), ConnectionState::Connected);
        assert_eq!(engine.stats().reconnects, 1);
    }
}
