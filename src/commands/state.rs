//! Inspect recorded state

use anyhow::Result;
use colored::Colorize;
use serde_json::Value;

use super::{Session, runtime};
use crate::Context;
use crate::cli::ShowArgs;
use crate::ui;

pub fn show(ctx: &Context, args: &ShowArgs) -> Result<()> {
    let session = Session::open(ctx, None, None)?;
    let state = runtime()?.block_on(session.engine.state())?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    ui::header("Recorded State");
    ui::kv("Location", &session.engine.state_location());
    if let Some(updated) = state.last_updated {
        ui::kv("Updated", &updated.format("%Y-%m-%d %H:%M:%S UTC").to_string());
    }

    if state.is_empty() {
        println!();
        ui::info("No resources recorded");
        return Ok(());
    }

    println!();
    println!(
        "  {:<20} {:<24} {}",
        "NAME".bold(),
        "KIND".bold(),
        "PHYSICAL ID".bold()
    );
    for (name, record) in &state.resources {
        println!(
            "  {:<20} {:<24} {}",
            name,
            record.kind.to_string(),
            record.physical_id.dimmed()
        );
        if ctx.verbose > 0 && !record.dependencies.is_empty() {
            ui::dim(&format!("  depends on {}", record.dependencies.join(", ")));
        }
    }
    println!();
    ui::dim(&format!("{} resources", state.len()));
    Ok(())
}

pub fn outputs(ctx: &Context, args: &ShowArgs) -> Result<()> {
    let session = Session::open(ctx, None, None)?;
    let state = runtime()?.block_on(session.engine.state())?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&state.exports)?);
        return Ok(());
    }

    if state.exports.is_empty() {
        ui::info("No outputs recorded; run `gantry up` first");
        return Ok(());
    }
    ui::section("Outputs");
    for (name, value) in &state.exports {
        ui::kv(name, &display_value(value));
    }
    Ok(())
}

/// Strings unquoted, everything else as compact JSON
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
