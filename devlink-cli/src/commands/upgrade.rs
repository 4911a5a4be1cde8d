//! Firmware upgrade command.

use std::io::IsTerminal;
use std::path::Path;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use anyhow::{Context, Result};
use console::style;
use devlink::{Event, FirmwareImage, Mode, UpgradeState};
use dialoguer::{Confirm, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;

use super::Session;
use crate::config::Config;
use crate::{Cli, CliError, use_fancy_output};

/// Whether the device may have lost its old firmware once `state` was reached.
fn touches_firmware(state: &UpgradeState) -> bool {
    matches!(
        state,
        UpgradeState::Erasing
            | UpgradeState::Transferring
            | UpgradeState::Verifying
            | UpgradeState::Finalizing
    )
}

fn confirm_upgrade(cli: &Cli, image: &FirmwareImage, yes: bool) -> Result<()> {
    if yes {
        return Ok(());
    }
    if cli.non_interactive || !std::io::stdin().is_terminal() {
        return Err(CliError::Usage(
            "upgrade replaces the device firmware; pass --yes to confirm".to_string(),
        )
        .into());
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!(
            "Install firmware {} ({} bytes)? The current firmware will be erased",
            image.header().version,
            image.size()
        ))
        .default(false)
        .interact_opt()
        .map_err(|e| CliError::Usage(format!("prompt failed: {e}")))?
        .unwrap_or(false);

    if confirmed {
        Ok(())
    } else {
        Err(CliError::Cancelled("upgrade cancelled".to_string()).into())
    }
}

fn progress_bar(cli: &Cli) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Upgrade command implementation.
pub(crate) fn cmd_upgrade(cli: &Cli, config: &mut Config, path: &Path, yes: bool) -> Result<()> {
    let image = FirmwareImage::from_file(path)
        .with_context(|| format!("failed to load image {}", path.display()))?;
    confirm_upgrade(cli, &image, yes)?;

    let session = Session::open(cli, config, Mode::Cli)?;
    if !cli.quiet {
        eprintln!(
            "{} Installing firmware {} ({} bytes)",
            style("📦").cyan(),
            image.header().version,
            image.size()
        );
    }

    let pb = progress_bar(cli);
    let ticket = session.handle.upgrade(image);
    let mut firmware_touched = false;
    let mut last_state = UpgradeState::Idle;

    let result = loop {
        match session
            .events
            .recv_timeout(Duration::from_millis(50))
        {
            Ok(Event::UpgradeProgress { state, percent }) => {
                firmware_touched |= touches_firmware(&state);
                if state != last_state {
                    debug!("Upgrade {state} ({percent}%)");
                    pb.set_message(state.to_string());
                    last_state = state;
                }
                pb.set_position(u64::from(percent));
            },
            Ok(_) | Err(RecvTimeoutError::Timeout) => {},
            Err(RecvTimeoutError::Disconnected) => break ticket.wait(),
        }
        if let Some(result) = ticket.wait_timeout(Duration::ZERO) {
            break result;
        }
    };
    session.close();

    match result {
        Ok(()) => {
            pb.finish_with_message("complete");
            if !cli.quiet {
                eprintln!("\n{} Upgrade completed", style("🎉").green().bold());
            }
            Ok(())
        },
        Err(e) => {
            pb.abandon_with_message(last_state.to_string());
            if firmware_touched {
                eprintln!(
                    "{} The device firmware state is unknown until an upgrade succeeds",
                    style("⚠").yellow()
                );
            }
            Err(e).context("upgrade failed")
        },
    }
}
