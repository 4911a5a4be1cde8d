//! Per-connection protocol session state and request cancellation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::mode::Mode;
use crate::protocol::Command;

/// Metadata of a request waiting for its response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    /// Command that was sent.
    pub command: Command,
    /// When the current attempt gives up.
    pub deadline: Instant,
    /// Transmissions made so far.
    pub attempts: u32,
}

/// Active mode, sequence counter and in-flight requests of one connection.
#[derive(Debug)]
pub struct ProtocolSession {
    mode: Mode,
    next_sequence: u16,
    pending: BTreeMap<u16, PendingRequest>,
}

impl ProtocolSession {
    /// Fresh session in `mode`.
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            next_sequence: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Active protocol mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Whether any request is waiting for a response.
    pub fn has_outstanding(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Pending request metadata for `sequence`.
    pub fn pending(&self, sequence: u16) -> Option<&PendingRequest> {
        self.pending.get(&sequence)
    }

    /// Sequence numbers of all requests in flight.
    pub fn outstanding(&self) -> impl Iterator<Item = u16> + '_ {
        self.pending.keys().copied()
    }

    pub(crate) fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    /// Next free sequence number. Wraps, skipping slots still in flight.
    pub(crate) fn allocate(&mut self) -> u16 {
        loop {
            let seq = self.next_sequence;
            self.next_sequence = self.next_sequence.wrapping_add(1);
            if !self.pending.contains_key(&seq) {
                return seq;
            }
        }
    }

    pub(crate) fn track(&mut self, sequence: u16, request: PendingRequest) {
        self.pending.insert(sequence, request);
    }

    pub(crate) fn pending_mut(&mut self, sequence: u16) -> Option<&mut PendingRequest> {
        self.pending.get_mut(&sequence)
    }

    pub(crate) fn release(&mut self, sequence: u16) -> Option<PendingRequest> {
        self.pending.remove(&sequence)
    }

    /// Drop every in-flight request, returning their sequence numbers.
    pub(crate) fn drain(&mut self) -> Vec<u16> {
        let drained = self.pending.keys().copied().collect();
        self.pending.clear();
        drained
    }
}

/// Shared flag a caller uses to cancel an in-flight operation.
///
/// Cancellation is sticky until [`CancelToken::reset`]. The process-wide
/// interrupt checker (see [`crate::set_interrupt_checker`]) also counts.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// New, not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Clear a previous cancellation.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst) || crate::is_interrupted_requested()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(command: Command) -> PendingRequest {
        PendingRequest {
            command,
            deadline: Instant::now(),
            attempts: 1,
        }
    }

    #[test]
    fn test_sequences_increase() {
        let mut session = ProtocolSession::new(Mode::Parameter);
        assert_eq!(session.allocate(), 0);
        assert_eq!(session.allocate(), 1);
        assert_eq!(session.allocate(), 2);
    }

    #[test]
    fn test_allocation_skips_occupied_slot_after_wrap() {
        let mut session = ProtocolSession::new(Mode::Parameter);
        session.track(0, pending(Command::Ping));
        session.next_sequence = u16::MAX;
        assert_eq!(session.allocate(), u16::MAX);
        assert_eq!(session.allocate(), 1);
    }

    #[test]
    fn test_track_release_and_drain() {
        let mut session = ProtocolSession::new(Mode::Bootloader);
        let a = session.allocate();
        let b = session.allocate();
        session.track(a, pending(Command::Erase));
        session.track(b, pending(Command::Data));
        assert!(session.has_outstanding());
        assert_eq!(session.pending(a).map(|p| p.command), Some(Command::Erase));

        assert!(session.release(a).is_some());
        assert!(session.release(a).is_none());
        assert_eq!(session.drain(), vec![b]);
        assert!(!session.has_outstanding());
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
        token.reset();
        assert!(!clone.is_cancelled());
    }
}
