//! Link status and traffic counters.

use anyhow::Result;
use console::style;
use devlink::{ConnectionState, LinkStats, Mode};

use super::Session;
use crate::Cli;
use crate::config::Config;

struct Status {
    state: ConnectionState,
    version: Option<String>,
    mode: Mode,
    parameters: usize,
    stats: LinkStats,
}

fn status_json(status: &Status) -> serde_json::Value {
    serde_json::json!({
        "state": status.state.to_string(),
        "version": status.version,
        "mode": status.mode.to_string(),
        "parameters": status.parameters,
        "stats": serde_json::to_value(status.stats).unwrap_or_default(),
    })
}

fn print_status(status: &Status) {
    let stats = &status.stats;
    eprintln!("{}", style("Device status").bold().underlined());
    eprintln!("  State:      {}", status.state);
    eprintln!(
        "  Version:    {}",
        status.version.as_deref().unwrap_or("unknown")
    );
    eprintln!("  Mode:       {}", status.mode);
    eprintln!("  Parameters: {}", status.parameters);
    eprintln!(
        "  Received:   {} bytes, {} lines, {} frames",
        stats.bytes_received, stats.lines_received, stats.frames_received
    );
    eprintln!(
        "  Sent:       {} bytes, {} lines, {} frames",
        stats.bytes_sent, stats.lines_sent, stats.frames_sent
    );
    let errors = if stats.errors > 0 {
        style(stats.errors).red()
    } else {
        style(stats.errors).green()
    };
    eprintln!("  Errors:     {errors}");
    eprintln!("  Warnings:   {}", stats.warnings);
    eprintln!("  Reconnects: {}", stats.reconnects);
}

/// Status command implementation.
pub(crate) fn cmd_status(cli: &Cli, config: &mut Config, json: bool) -> Result<()> {
    let session = Session::open(cli, config, Mode::Cli)?;
    let status = session
        .handle
        .submit(|engine| {
            Ok(Status {
                state: engine.state(),
                version: engine.version().map(ToString::to_string),
                mode: engine.mode(),
                parameters: engine.table().map_or(0, |t| t.len()),
                stats: engine.stats(),
            })
        })
        .wait();
    session.close();
    let status = status?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&status_json(&status)).unwrap_or_default()
        );
    } else {
        print_status(&status);
    }
    Ok(())
}
