//! Parameter commands: list, get, set, read-all and store-all.

use anyhow::{Context, Result, bail};
use console::style;
use devlink::{
    Access, BatchReport, Mode, Parameter, ParameterTable, ParameterValue, Persistence, SyncStatus,
};

use super::Session;
use crate::config::Config;
use crate::{Cli, CliError};

/// Find a parameter by name, or by id when `key` is numeric.
fn resolve<'t>(table: &'t ParameterTable, key: &str) -> Result<&'t Parameter> {
    table
        .find(key)
        .or_else(|| {
            key.parse::<u16>()
                .ok()
                .and_then(|id| table.get(id))
        })
        .ok_or_else(|| CliError::Usage(format!("unknown parameter '{key}'")).into())
}

fn access_str(access: Access) -> &'static str {
    match access {
        Access::ReadOnly => "ro",
        Access::ReadWrite => "rw",
        Access::WriteOnly => "wo",
    }
}

fn persistence_str(persistence: Persistence) -> &'static str {
    match persistence {
        Persistence::Volatile => "volatile",
        Persistence::Stored => "stored",
    }
}

fn value_text(param: &Parameter, value: Option<&ParameterValue>) -> String {
    value.map_or_else(String::new, |v| v.to_text(&param.kind))
}

fn parameter_json(param: &Parameter) -> serde_json::Value {
    serde_json::json!({
        "id": param.id,
        "name": param.name,
        "group": param.group,
        "type": param.kind.name(),
        "access": access_str(param.access),
        "persistence": persistence_str(param.persistence),
        "min": param.range.min,
        "max": param.range.max,
        "unit": param.unit,
        "value": param.value().map(|v| v.to_text(&param.kind)),
        "status": param.status().to_string(),
    })
}

/// Text form of a batch report, one object per item in submission order.
fn report_json(table: &ParameterTable, report: &BatchReport) -> serde_json::Value {
    let items: Vec<serde_json::Value> = report
        .items
        .iter()
        .map(|item| {
            let param = table.get(item.id);
            let name = param.map(|p| p.name.clone());
            match &item.outcome {
                Ok(value) => serde_json::json!({
                    "id": item.id,
                    "name": name,
                    "ok": true,
                    "value": param.map_or_else(|| value.to_string(), |p| value.to_text(&p.kind)),
                }),
                Err(reason) => serde_json::json!({
                    "id": item.id,
                    "name": name,
                    "ok": false,
                    "error": reason.to_string(),
                }),
            }
        })
        .collect();
    serde_json::json!({
        "operation": report.kind.to_string(),
        "succeeded": report.succeeded(),
        "total": report.len(),
        "items": items,
    })
}

fn print_report(cli: &Cli, table: &ParameterTable, report: &BatchReport, json: bool) {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report_json(table, report)).unwrap_or_default()
        );
        return;
    }

    for item in &report.items {
        let param = table.get(item.id);
        let name = param.map_or_else(|| item.id.to_string(), |p| p.name.clone());
        match &item.outcome {
            Ok(value) => {
                let text = param.map_or_else(|| value.to_string(), |p| value.to_text(&p.kind));
                match param.map(|p| p.unit.as_str()) {
                    Some(unit) if !unit.is_empty() => println!("{name} = {text} {unit}"),
                    _ => println!("{name} = {text}"),
                }
            },
            Err(reason) => eprintln!("{} {name}: {reason}", style("✗").red()),
        }
    }
    if !cli.quiet {
        eprintln!(
            "{} {}: {}/{} succeeded",
            if report.is_success() {
                style("✓").green()
            } else {
                style("⚠").yellow()
            },
            report.kind,
            report.succeeded(),
            report.len()
        );
    }
}

fn ensure_success(report: &BatchReport) -> Result<()> {
    if report.is_success() {
        Ok(())
    } else {
        bail!(
            "{} of {} parameter(s) failed during {}",
            report.len() - report.succeeded(),
            report.len(),
            report.kind
        )
    }
}

fn load_table(session: &Session) -> Result<ParameterTable> {
    session
        .handle
        .table()
        .wait()?
        .context("device sent no parameter table")
}

/// Print the parameter table from the device listing.
pub(crate) fn cmd_list(cli: &Cli, config: &mut Config, json: bool) -> Result<()> {
    let session = Session::open(cli, config, Mode::Cli)?;
    let table = load_table(&session)?;
    session.close();

    if json {
        let params: Vec<serde_json::Value> = table
            .iter()
            .map(parameter_json)
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&params).unwrap_or_default()
        );
        return Ok(());
    }

    println!(
        "{:>5}  {:<20} {:<8} {:<3} {:<8} {:<12} {}",
        "ID", "NAME", "TYPE", "ACC", "STORAGE", "VALUE", "UNIT"
    );
    for param in table.iter() {
        println!(
            "{:>5}  {:<20} {:<8} {:<3} {:<8} {:<12} {}",
            param.id,
            param.name,
            param.kind.name(),
            access_str(param.access),
            persistence_str(param.persistence),
            value_text(param, param.value()),
            param.unit
        );
    }
    Ok(())
}

/// Read parameters one by one.
pub(crate) fn cmd_get(cli: &Cli, config: &mut Config, names: &[String], json: bool) -> Result<()> {
    let session = Session::open(cli, config, Mode::Parameter)?;
    let table = load_table(&session)?;

    let mut values = serde_json::Map::new();
    for key in names {
        let param = resolve(&table, key)?;
        let value = session
            .handle
            .read_one(param.id)
            .wait()
            .with_context(|| format!("failed to read {}", param.name))?;
        let text = value.to_text(&param.kind);
        if json {
            values.insert(param.name.clone(), serde_json::Value::String(text));
        } else if param.unit.is_empty() {
            println!("{} = {text}", param.name);
        } else {
            println!("{} = {text} {}", param.name, param.unit);
        }
    }
    session.close();

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::Value::Object(values)).unwrap_or_default()
        );
    }
    Ok(())
}

/// Parse `text` as a value of `param`, refusing it as a usage error.
fn parse_value(param: &Parameter, text: &str) -> Result<ParameterValue> {
    if !param.access.is_writable() {
        bail!(CliError::Usage(format!("{} is read-only", param.name)));
    }
    let value = ParameterValue::parse_text(&param.kind, text)
        .map_err(|v| CliError::Usage(format!("{}: {v}", param.name)))?;
    param
        .check_value(&value)
        .map_err(|v| CliError::Usage(format!("{}: {v}", param.name)))?;
    Ok(value)
}

/// Write one parameter.
pub(crate) fn cmd_set(
    cli: &Cli,
    config: &mut Config,
    key: &str,
    text: &str,
    persist: bool,
) -> Result<()> {
    let session = Session::open(cli, config, Mode::Parameter)?;
    let table = load_table(&session)?;
    let param = resolve(&table, key)?;
    let value = parse_value(param, text)?;
    let shown = value.to_text(&param.kind);

    let ticket = if persist {
        session
            .handle
            .write_one_persistent(param.id, value)
    } else {
        session.handle.write_one(param.id, value)
    };
    ticket
        .wait()
        .with_context(|| format!("failed to write {}", param.name))?;
    session.close();

    if !cli.quiet {
        eprintln!(
            "{} {} = {shown}{}",
            style("✓").green(),
            param.name,
            if persist { " (stored)" } else { "" }
        );
    }
    Ok(())
}

/// Read every readable parameter.
pub(crate) fn cmd_read_all(cli: &Cli, config: &mut Config, json: bool) -> Result<()> {
    let session = Session::open(cli, config, Mode::Parameter)?;
    let report = session.handle.read_all().wait()?;
    let table = load_table(&session)?;
    session.close();

    print_report(cli, &table, &report, json);
    ensure_success(&report)
}

/// Stage `assignments`, then store every stored parameter.
pub(crate) fn cmd_store_all(
    cli: &Cli,
    config: &mut Config,
    assignments: &[(String, String)],
    json: bool,
) -> Result<()> {
    let session = Session::open(cli, config, Mode::Parameter)?;
    let table = load_table(&session)?;

    for (key, text) in assignments {
        let param = resolve(&table, key)?;
        let value = parse_value(param, text)?;
        session
            .handle
            .stage(param.id, value)
            .wait()
            .with_context(|| format!("failed to stage {}", param.name))?;
    }

    let report = session.handle.store_all().wait()?;
    let table = load_table(&session)?;
    session.close();

    let stale = table
        .iter()
        .filter(|p| p.status() == SyncStatus::Stale)
        .count();
    if stale > 0 && !cli.quiet {
        eprintln!("{} {stale} parameter(s) left stale", style("ℹ").blue());
    }

    print_report(cli, &table, &report, json);
    ensure_success(&report)
}
