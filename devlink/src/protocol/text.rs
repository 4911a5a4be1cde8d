//! CLI-mode command lines.
//!
//! The device shell answers host commands with free-form lines. Only a few
//! commands have a structured reply the engine relies on: `version`,
//! `par_print` (see [`crate::param::schema`]) and the `mode` switch.

use crate::mode::Mode;

/// Terminator appended to every host command.
pub const LINE_TERMINATOR: &str = "\r\n";

/// Query the device CLI version.
pub const VERSION_COMMAND: &str = "version";

/// Dump the parameter table.
pub const SCHEMA_COMMAND: &str = "par_print";

/// Last line of the parameter table dump.
pub const SCHEMA_END: &str = ";END";

/// Text command that moves the device out of CLI mode into `target`.
///
/// CLI mode itself is left through a binary switch frame, so it has none.
pub fn mode_command(target: Mode) -> Option<&'static str> {
    match target {
        Mode::Cli => None,
        Mode::Parameter => Some("mode par"),
        Mode::Bootloader => Some("mode boot"),
    }
}

/// Append the line terminator to `text`.
pub fn encode_line(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() + LINE_TERMINATOR.len());
    out.extend_from_slice(text.as_bytes());
    out.extend_from_slice(LINE_TERMINATOR.as_bytes());
    out
}

/// Acknowledgement line of a text command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Command accepted; carries the line.
    Ok(String),
    /// Command refused; carries the line.
    Err(String),
}

/// Classify a device line as an acknowledgement, if it is one.
pub fn classify_reply(line: &str) -> Option<Reply> {
    let trimmed = line.trim();
    if trimmed.contains("ERR") {
        Some(Reply::Err(trimmed.to_string()))
    } else if trimmed == "OK" || trimmed.starts_with("OK ") {
        Some(Reply::Ok(trimmed.to_string()))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_line_appends_crlf() {
        assert_eq!(encode_line("par_print"), b"par_print\r\n".to_vec());
    }

    #[test]
    fn test_mode_commands() {
        assert_eq!(mode_command(Mode::Parameter), Some("mode par"));
        assert_eq!(mode_command(Mode::Bootloader), Some("mode boot"));
        assert_eq!(mode_command(Mode::Cli), None);
    }

    #[test]
    fn test_classify_reply() {
        assert_eq!(classify_reply(" OK "), Some(Reply::Ok("OK".into())));
        assert_eq!(
            classify_reply("OK boot=1"),
            Some(Reply::Ok("OK boot=1".into()))
        );
        assert_eq!(
            classify_reply("ERR unsupported"),
            Some(Reply::Err("ERR unsupported".into()))
        );
        assert_eq!(classify_reply("OKAY then"), None);
        assert_eq!(classify_reply("hello"), None);
    }
}
