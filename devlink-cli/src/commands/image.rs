//! Firmware image inspection.

use std::path::Path;

use anyhow::{Context, Result};
use console::style;
use devlink::FirmwareImage;

fn load(path: &Path) -> Result<FirmwareImage> {
    FirmwareImage::from_file(path)
        .with_context(|| format!("failed to load image {}", path.display()))
}

/// Image summary as JSON.
fn image_json(image: &FirmwareImage) -> serde_json::Value {
    let header = image.header();
    let validation = image.validate();
    serde_json::json!({
        "header_version": header.header_version,
        "version": header.version.to_string(),
        "size": header.size,
        "flags": format!("0x{:02X}", header.flags),
        "crc32": header.has_crc().then(|| format!("0x{:08X}", header.crc32)),
        "sha256": header.has_digest().then(|| hex::encode(header.digest)),
        "valid": validation.is_ok(),
        "validation_error": validation.err().map(|e| e.to_string()),
    })
}

/// Image info command implementation.
pub(crate) fn cmd_image_info(path: &Path, json: bool) -> Result<()> {
    let image = load(path)?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&image_json(&image)).unwrap_or_default()
        );
        return Ok(());
    }

    let header = image.header();
    eprintln!("{}", style("Firmware image").bold().underlined());
    eprintln!("  File:           {}", path.display());
    eprintln!("  Version:        {}", header.version);
    eprintln!("  Header version: {}", header.header_version);
    eprintln!("  Payload size:   {} bytes", header.size);
    if header.has_crc() {
        eprintln!("  CRC-32:         {:08X}", header.crc32);
    }
    if header.has_digest() {
        eprintln!("  SHA-256:        {}", hex::encode(header.digest));
    }

    match image.validate() {
        Ok(()) => eprintln!("  Integrity:      {}", style("valid").green()),
        Err(e) => eprintln!("  Integrity:      {}", style(e).red()),
    }

    Ok(())
}
