//! Interactive console on the device's command line.
//!
//! - Printer thread: engine events → terminal (optional timestamps) and log file
//! - Main thread: keyboard (crossterm raw mode) → `send_line`, one line per Enter
//! - Up/Down: browse previously sent commands
//! - Without a terminal on stdin, each input line is sent as a command
//! - Ctrl+C / Ctrl+D: exit

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead as _, IsTerminal, Write as _};
use std::path::Path;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use console::style;
use devlink::{EngineHandle, Event, Line, LineSource, Mode};
use log::warn;

use super::{Link, Session};
use crate::config::Config;
use crate::{Cli, was_interrupted};

const PROMPT: &str = "> ";

/// Commands kept for Up/Down browsing.
const HISTORY_LIMIT: usize = 100;

/// Input being typed, redrawn after every printed line in raw mode.
#[derive(Default)]
struct Prompt {
    input: String,
    raw: bool,
}

impl Prompt {
    fn print_line(&self, text: &str, to_stderr: bool) {
        let out = if self.raw {
            format!("\r\x1b[2K{text}\r\n{PROMPT}{}", self.input)
        } else {
            format!("{text}\n")
        };
        if to_stderr {
            eprint!("{out}");
            io::stderr().flush().ok();
        } else {
            print!("{out}");
            io::stdout().flush().ok();
        }
    }

    fn redraw(&self) {
        print!("\r\x1b[2K{PROMPT}{}", self.input);
        io::stdout().flush().ok();
    }
}

/// UTC wall clock of `time` as `HH:MM:SS.mmm`.
fn clock(time: SystemTime) -> String {
    let millis = time
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis());
    let day = millis % 86_400_000;
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        day / 3_600_000,
        day / 60_000 % 60,
        day / 1000 % 60,
        day % 1000
    )
}

fn format_line(line: &Line, timestamp: bool) -> String {
    if timestamp {
        format!("[{}] {}", clock(line.timestamp), line.text)
    } else {
        line.text.clone()
    }
}

/// Sent commands, oldest first, with a browsing cursor.
struct History {
    entries: VecDeque<String>,
    limit: usize,
    /// Steps back from the newest entry while browsing.
    cursor: Option<usize>,
    /// Input that was being typed when browsing started.
    draft: String,
}

impl History {
    fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(limit),
            limit,
            cursor: None,
            draft: String::new(),
        }
    }

    /// Remember a sent command. Blank lines and repeats of the newest entry
    /// are skipped.
    fn push(&mut self, command: &str) {
        self.cursor = None;
        if command.trim().is_empty() || self.entries.back().is_some_and(|last| last == command) {
            return;
        }
        if self.entries.len() == self.limit {
            self.entries.pop_front();
        }
        self.entries.push_back(command.to_string());
    }

    /// Step to an older entry. `current` is kept so [`History::newer`] can
    /// return to it.
    fn older(&mut self, current: &str) -> Option<&str> {
        let next = self.cursor.map_or(0, |c| c + 1);
        if next >= self.entries.len() {
            return None;
        }
        if self.cursor.is_none() {
            self.draft = current.to_string();
        }
        self.cursor = Some(next);
        self.entries
            .get(self.entries.len() - 1 - next)
            .map(String::as_str)
    }

    /// Step to a newer entry, ending at the saved draft.
    fn newer(&mut self) -> Option<&str> {
        match self.cursor? {
            0 => {
                self.cursor = None;
                Some(self.draft.as_str())
            },
            c => {
                self.cursor = Some(c - 1);
                self.entries
                    .get(self.entries.len() - c)
                    .map(String::as_str)
            },
        }
    }
}

/// Log record for one line: `[HH:MM:SS.mmm] [source] text`.
fn log_record(line: &Line) -> String {
    format!("[{}] [{}] {}", clock(line.timestamp), line.source, line.text)
}

fn open_log(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file: {}", path.display()))
}

fn print_events(
    events: &Receiver<Event>,
    prompt: &Mutex<Prompt>,
    timestamp: bool,
    quiet: bool,
    mut log: Option<&mut dyn io::Write>,
) {
    for event in events {
        let failed = match (&event, log.as_deref_mut()) {
            (Event::LineReceived(line), Some(out)) => writeln!(out, "{}", log_record(line)).err(),
            _ => None,
        };
        if let Some(e) = failed {
            warn!("Stopped writing the terminal log: {e}");
            log = None;
        }
        let Ok(prompt) = prompt.lock() else {
            return;
        };
        match event {
            Event::LineReceived(line) => match line.source {
                LineSource::Device => prompt.print_line(&format_line(&line, timestamp), false),
                LineSource::System if !quiet => prompt.print_line(
                    &style(format_line(&line, timestamp))
                        .dim()
                        .to_string(),
                    true,
                ),
                _ => {},
            },
            Event::ConnectionStateChanged { new, .. } if !quiet => prompt.print_line(
                &format!("{} link {new}", style("ℹ").blue()),
                true,
            ),
            _ => {},
        }
    }
}

/// Terminal command implementation.
pub(crate) fn cmd_terminal(
    cli: &Cli,
    config: &mut Config,
    timestamp: bool,
    log_path: Option<&Path>,
) -> Result<()> {
    let settle = config.engine_config().command_timeout;
    let log_file = log_path.map(open_log).transpose()?;
    let Session { handle, events } = Session::open(cli, config, Mode::Cli)?;
    let interactive = io::stdin().is_terminal() && io::stdout().is_terminal();

    if let Some(path) = log_path.filter(|_| !cli.quiet) {
        eprintln!("{} Logging to {}", style("📝").cyan(), style(path.display()).yellow());
    }

    let prompt = Arc::new(Mutex::new(Prompt::default()));
    let printer = {
        let prompt = Arc::clone(&prompt);
        let quiet = cli.quiet;
        let mut log_file = log_file;
        thread::spawn(move || {
            let log = log_file
                .as_mut()
                .map(|f| f as &mut dyn io::Write);
            print_events(&events, &prompt, timestamp, quiet, log);
        })
    };

    if interactive && !cli.quiet {
        eprintln!("{}", style("Ctrl+C or Ctrl+D to exit").dim());
    }
    let result = if interactive {
        run_interactive(&handle, &prompt)
    } else {
        run_scripted(&handle, settle)
    };

    // Stopping the engine closes the event stream and ends the printer.
    handle.shutdown();
    let _ = printer.join();
    result
}

/// Send each stdin line as a command, then wait `settle` for late replies.
fn run_scripted(handle: &EngineHandle<Link>, settle: Duration) -> Result<()> {
    for line in io::stdin().lock().lines() {
        if was_interrupted() {
            return Ok(());
        }
        let line = line.context("failed to read stdin")?;
        let command = line.trim_end();
        if command.is_empty() {
            continue;
        }
        handle
            .send_line(command)
            .wait()
            .with_context(|| format!("failed to send '{command}'"))?;
    }
    thread::sleep(settle);
    Ok(())
}

fn run_interactive(handle: &EngineHandle<Link>, prompt: &Mutex<Prompt>) -> Result<()> {
    use crossterm::event::{self, Event as Input, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
    use crossterm::terminal;

    terminal::enable_raw_mode().context("Failed to enable raw terminal mode")?;
    let _raw_guard = RawModeGuard;
    if let Ok(mut prompt) = prompt.lock() {
        prompt.raw = true;
        prompt.redraw();
    }
    let mut history = History::new(HISTORY_LIMIT);

    while !was_interrupted() {
        if !event::poll(Duration::from_millis(50))? {
            continue;
        }
        let Input::Key(KeyEvent {
            code,
            modifiers,
            kind: KeyEventKind::Press,
            ..
        }) = event::read()?
        else {
            continue;
        };

        let command = {
            let Ok(mut prompt) = prompt.lock() else {
                break;
            };
            match (code, modifiers) {
                (KeyCode::Char('c' | 'd'), KeyModifiers::CONTROL) => break,
                (KeyCode::Enter, _) => {
                    print!("\r\n");
                    let command = std::mem::take(&mut prompt.input);
                    history.push(&command);
                    prompt.redraw();
                    Some(command)
                },
                (KeyCode::Up, _) => {
                    if let Some(entry) = history.older(&prompt.input) {
                        prompt.input = entry.to_string();
                        prompt.redraw();
                    }
                    None
                },
                (KeyCode::Down, _) => {
                    if let Some(entry) = history.newer() {
                        prompt.input = entry.to_string();
                        prompt.redraw();
                    }
                    None
                },
                (KeyCode::Backspace, _) => {
                    prompt.input.pop();
                    prompt.redraw();
                    None
                },
                (KeyCode::Char(c), KeyModifiers::NONE | KeyModifiers::SHIFT) => {
                    prompt.input.push(c);
                    prompt.redraw();
                    None
                },
                _ => None,
            }
        };

        // The lock is released here so replies can print while we wait.
        if let Some(command) = command.filter(|c| !c.trim().is_empty()) {
            if let Err(e) = handle.send_line(command).wait() {
                if let Ok(prompt) = prompt.lock() {
                    prompt.print_line(&format!("{} {e}", style("⚠").yellow()), true);
                }
            }
        }
    }

    if let Ok(mut prompt) = prompt.lock() {
        prompt.raw = false;
    }
    print!("\r\n");
    io::stdout().flush().ok();
    Ok(())
}

/// RAII guard to restore terminal mode on drop.
struct RawModeGuard;

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = crossterm::terminal::disable_raw_mode();
    }
}
