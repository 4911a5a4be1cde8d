//! Traffic and error counters for one link.

use std::fmt;

use crate::protocol::decoder::Decoded;

/// Counters kept by the channel for the life of an engine.
///
/// They survive reconnects; [`LinkStats::reconnects`] tells how often the
/// link was re-established.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LinkStats {
    /// Raw bytes read from the transport.
    pub bytes_received: u64,
    /// Raw bytes written to the transport.
    pub bytes_sent: u64,
    /// Text lines decoded.
    pub lines_received: u64,
    /// Text lines written.
    pub lines_sent: u64,
    /// Binary frames decoded.
    pub frames_received: u64,
    /// Binary frames written, retransmissions included.
    pub frames_sent: u64,
    /// Framing errors plus failed reads and writes.
    pub errors: u64,
    /// Request timeouts and retries.
    pub warnings: u64,
    /// Successful reconnects after link loss.
    pub reconnects: u64,
}

impl LinkStats {
    /// Account for decoder output.
    pub(crate) fn record_decoded(&mut self, decoded: &[Decoded]) {
        for item in decoded {
            match item {
                Decoded::Line(_) => self.lines_received += 1,
                Decoded::Frame(_) => self.frames_received += 1,
                Decoded::Error(_) => self.errors += 1,
            }
        }
    }
}

impl fmt::Display for LinkStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rx {} B ({} lines, {} frames), tx {} B ({} lines, {} frames), {} error(s), {} warning(s), {} reconnect(s)",
            self.bytes_received,
            self.lines_received,
            self.frames_received,
            self.bytes_sent,
            self.lines_sent,
            self.frames_sent,
            self.errors,
            self.warnings,
            self.reconnects
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FramingError;

    #[test]
    fn test_record_decoded_counts_each_kind() {
        let mut stats = LinkStats::default();
        stats.record_decoded(&[
            Decoded::Line("ok".to_string()),
            Decoded::Line("ready".to_string()),
            Decoded::Error(FramingError::LineTooLong { max: 4 }),
        ]);
        assert_eq!(stats.lines_received, 2);
        assert_eq!(stats.frames_received, 0);
        assert_eq!(stats.errors, 1);
    }

    #[test]
    fn test_display_mentions_counters() {
        let stats = LinkStats {
            bytes_received: 12,
            errors: 3,
            ..LinkStats::default()
        };
        let text = stats.to_string();
        assert!(text.starts_with("rx 12 B"));
        assert!(text.contains("3 error(s)"));
    }
}
