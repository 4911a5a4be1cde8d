//! Engine actor running on a background thread.
//!
//! The actor owns the [`Engine`] and with it the transport. Callers on any
//! thread submit operations through an [`EngineHandle`]; the actor runs them
//! one at a time in submission order, so requests are never interleaved on
//! the link. Between operations it calls [`Engine::service`] to pump CLI
//! output, send heartbeats and attempt due reconnects.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, trace};

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::events::Event;
use crate::image::FirmwareImage;
use crate::mode::{Mode, ModeChange};
use crate::param::{BatchReport, ParameterTable, ParameterValue};
use crate::session::CancelToken;
use crate::stats::LinkStats;
use crate::supervisor::ConnectionState;
use crate::transport::Transport;
use crate::upgrade::UpgradeSession;

/// Idle time between two service steps.
const SERVICE_INTERVAL: Duration = Duration::from_millis(10);

type Job<T> = Box<dyn FnOnce(&mut Engine<T>) + Send>;

enum Message<T: Transport> {
    Run(Job<T>, CancelToken),
    Shutdown,
}

/// Pending result of a submitted operation.
#[derive(Debug)]
pub struct Ticket<R> {
    rx: Receiver<Result<R>>,
    cancel: CancelToken,
}

impl<R> Ticket<R> {
    /// Block until the operation finished.
    pub fn wait(self) -> Result<R> {
        self.rx
            .recv()
            .unwrap_or_else(|_| Err(stopped()))
    }

    /// Block at most `timeout`; `None` if the operation is still running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<R>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(stopped())),
        }
    }

    /// Cancel the operation. A queued operation fails as soon as it starts.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token cancelling this operation.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}

/// Thread-safe front end of an engine actor.
pub struct EngineHandle<T: Transport + 'static> {
    tx: Sender<Message<T>>,
    thread: Option<JoinHandle<()>>,
}

impl<T: Transport + 'static> EngineHandle<T> {
    /// Move `engine` onto its own thread. Returns the handle and the
    /// engine's event stream.
    pub fn spawn(mut engine: Engine<T>) -> Result<(Self, Receiver<Event>)> {
        let events = engine.subscribe();
        let (tx, rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("devlink-engine".to_string())
            .spawn(move || run_actor(engine, &rx))?;
        Ok((
            Self {
                tx,
                thread: Some(thread),
            },
            events,
        ))
    }

    /// Run `op` on the engine thread.
    pub fn submit<R, F>(&self, op: F) -> Ticket<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Engine<T>) -> Result<R> + Send + 'static,
    {
        let (result_tx, result_rx) = mpsc::channel();
        let cancel = CancelToken::new();
        let job: Job<T> = Box::new(move |engine| {
            let _ = result_tx.send(op(engine));
        });
        // A closed actor drops the job and with it `result_tx`; the ticket
        // then reports the engine as stopped.
        let _ = self.tx.send(Message::Run(job, cancel.clone()));
        Ticket {
            rx: result_rx,
            cancel,
        }
    }

    /// See [`Engine::connect`].
    pub fn connect(&self) -> Ticket<()> {
        self.submit(Engine::connect)
    }

    /// See [`Engine::disconnect`].
    pub fn disconnect(&self) -> Ticket<()> {
        self.submit(|engine| {
            engine.disconnect();
            Ok(())
        })
    }

    /// See [`Engine::cancel_reconnect`].
    pub fn cancel_reconnect(&self) -> Ticket<()> {
        self.submit(|engine| {
            engine.cancel_reconnect();
            Ok(())
        })
    }

    /// Current connection state.
    pub fn state(&self) -> Ticket<ConnectionState> {
        self.submit(|engine| Ok(engine.state()))
    }

    /// Traffic and error counters.
    pub fn stats(&self) -> Ticket<LinkStats> {
        self.submit(|engine| Ok(engine.stats()))
    }

    /// Copy of the parameter table.
    pub fn table(&self) -> Ticket<Option<ParameterTable>> {
        self.submit(|engine| Ok(engine.table().cloned()))
    }

    /// See [`Engine::switch_mode`].
    pub fn switch_mode(&self, target: Mode) -> Ticket<Option<ModeChange>> {
        self.submit(move |engine| engine.switch_mode(target))
    }

    /// See [`Engine::send_line`].
    pub fn send_line(&self, text: impl Into<String>) -> Ticket<()> {
        let text = text.into();
        self.submit(move |engine| engine.send_line(&text))
    }

    /// See [`Engine::ping`].
    pub fn ping(&self) -> Ticket<()> {
        self.submit(Engine::ping)
    }

    /// See [`Engine::read_one`].
    pub fn read_one(&self, id: u16) -> Ticket<ParameterValue> {
        self.submit(move |engine| engine.read_one(id))
    }

    /// See [`Engine::write_one`].
    pub fn write_one(&self, id: u16, value: ParameterValue) -> Ticket<()> {
        self.submit(move |engine| engine.write_one(id, value))
    }

    /// See [`Engine::write_one_persistent`].
    pub fn write_one_persistent(&self, id: u16, value: ParameterValue) -> Ticket<()> {
        self.submit(move |engine| engine.write_one_persistent(id, value))
    }

    /// See [`Engine::stage`].
    pub fn stage(&self, id: u16, value: ParameterValue) -> Ticket<()> {
        self.submit(move |engine| engine.stage(id, value))
    }

    /// See [`Engine::read_all`].
    pub fn read_all(&self) -> Ticket<BatchReport> {
        self.submit(Engine::read_all)
    }

    /// See [`Engine::store_all`].
    pub fn store_all(&self) -> Ticket<BatchReport> {
        self.submit(Engine::store_all)
    }

    /// Run a complete upgrade with `image`. Progress arrives as events.
    pub fn upgrade(&self, image: FirmwareImage) -> Ticket<()> {
        self.submit(move |engine| {
            let mut session = UpgradeSession::for_engine(engine, image)?;
            session.run(engine)
        })
    }

    /// Stop the actor after the queued operations and disconnect.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.tx.send(Message::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                debug!("Engine thread panicked");
            }
        }
    }
}

impl<T: Transport + 'static> Drop for EngineHandle<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_actor<T: Transport>(mut engine: Engine<T>, rx: &Receiver<Message<T>>) {
    let idle = CancelToken::new();
    engine.set_cancel_token(idle.clone());
    loop {
        match rx.recv_timeout(SERVICE_INTERVAL) {
            Ok(Message::Run(job, cancel)) => {
                engine.set_cancel_token(cancel);
                job(&mut engine);
                engine.set_cancel_token(idle.clone());
            },
            Ok(Message::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                if let Err(e) = engine.service() {
                    trace!("Service step: {e}");
                }
            },
        }
    }
    engine.disconnect();
    debug!("Engine actor stopped");
}

fn stopped() -> Error {
    Error::Busy("engine actor stopped".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::sim::SimulatedDevice;

    fn spawn() -> (EngineHandle<SimulatedDevice>, Receiver<Event>) {
        let config = EngineConfig::default()
            .with_request_timeout(Duration::from_millis(30))
            .with_heartbeat(None);
        EngineHandle::spawn(Engine::new(SimulatedDevice::new("2.0.0"), config)).unwrap()
    }

    #[test]
    fn test_operations_run_in_order() {
        let (handle, _events) = spawn();
        handle.connect().wait().unwrap();
        handle
            .switch_mode(Mode::Parameter)
            .wait()
            .unwrap();

        let write = handle.write_one(1, ParameterValue::Integer(77));
        let read = handle.read_one(1);
        write.wait().unwrap();
        assert_eq!(read.wait().unwrap(), ParameterValue::Integer(77));
        assert_eq!(
            handle.state().wait().unwrap(),
            ConnectionState::Connected
        );
    }

    #[test]
    fn test_cancelled_ticket_fails() {
        let (handle, _events) = spawn();
        handle.connect().wait().unwrap();
        handle
            .switch_mode(Mode::Parameter)
            .wait()
            .unwrap();

        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let blocker = handle.submit(move |_| {
            let _ = gate_rx.recv();
            Ok(())
        });
        let ticket = handle.read_one(1);
        ticket.cancel();
        gate_tx.send(()).unwrap();
        blocker.wait().unwrap();
        assert!(matches!(ticket.wait(), Err(Error::Cancelled { .. })));
        assert!(handle.ping().wait().is_ok());
    }

    #[test]
    fn test_cli_lines_arrive_as_events() {
        let (handle, events) = spawn();
        handle.connect().wait().unwrap();
        handle.send_line("status").wait().unwrap();

        let line = events
            .iter()
            .find_map(|e| match e {
                Event::LineReceived(line) if line.text.starts_with("status:") => Some(line),
                _ => None,
            })
            .unwrap();
        assert_eq!(line.source, crate::events::LineSource::Device);
    }

    #[test]
    fn test_stats_advance_through_handle() {
        let (handle, _events) = spawn();
        handle.connect().wait().unwrap();
        let before = handle.stats().wait().unwrap();
        handle.send_line("status").wait().unwrap();
        let after = handle.stats().wait().unwrap();
        assert_eq!(after.lines_sent, before.lines_sent + 1);
        assert!(after.bytes_sent > before.bytes_sent);
    }

    #[test]
    fn test_shutdown_stops_actor() {
        let (handle, _events) = spawn();
        handle.connect().wait().unwrap();
        let table = handle.table().wait().unwrap();
        assert!(table.is_some());
        handle.shutdown();
    }
}
