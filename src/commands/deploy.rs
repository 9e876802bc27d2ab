//! Preview, up and destroy

use anyhow::{Result, bail};
use colored::Colorize;
use declarative::{Action, PlanSummary, RunResult, RunStatus};
use std::time::Instant;

use super::{Session, interrupt_token, runtime};
use crate::Context;
use crate::cli::{DestroyArgs, UpArgs};
use crate::ui;

pub fn preview(ctx: &Context) -> Result<()> {
    let session = Session::open(ctx, None, None)?;
    let rt = runtime()?;

    if !ctx.quiet {
        ui::header(&format!("Preview: {}", session.config.stack.name));
        session.describe();
    }
    let plan = rt.block_on(session.engine.plan(session.stack()?))?;
    display_plan(&plan, "Planned Changes");
    Ok(())
}

pub fn up(ctx: &Context, args: &UpArgs) -> Result<()> {
    let session = Session::open(ctx, args.jobs, args.timeout)?;
    let rt = runtime()?;

    if !ctx.quiet {
        ui::header(&format!("Up: {}", session.config.stack.name));
        session.describe();
        ui::kv("Jobs", &session.engine.options().max_in_flight.to_string());
    }

    let plan = rt.block_on(session.engine.plan(session.stack()?))?;
    display_plan(&plan, "Planned Changes");
    if !plan.to_replace.is_empty() {
        ui::warn(&format!(
            "{} resource(s) will be deleted and recreated with a new identity",
            plan.to_replace.len()
        ));
    }

    if plan.has_changes() && !args.yes && !confirm_proceed()? {
        println!();
        println!("  {} Aborted", "✗".red());
        return Ok(());
    }

    let cancel = interrupt_token(&rt);
    let started = Instant::now();
    println!();
    let result = rt.block_on(session.engine.run(session.stack()?, &cancel))?;

    print_summary(&result, started);
    if result.is_success() {
        print_exports(&result);
        Ok(())
    } else {
        bail!("Stack '{}' did not converge", session.config.stack.name)
    }
}

pub fn destroy(ctx: &Context, args: &DestroyArgs) -> Result<()> {
    let session = Session::open(ctx, None, args.timeout)?;
    let rt = runtime()?;

    if !ctx.quiet {
        ui::header(&format!("Destroy: {}", session.config.stack.name));
        session.describe();
    }

    let plan = rt.block_on(session.engine.plan_destroy())?;
    display_plan(&plan, "Resources to Delete");
    if !plan.has_changes() {
        return Ok(());
    }

    if !args.yes && !confirm_proceed()? {
        println!();
        println!("  {} Aborted", "✗".red());
        return Ok(());
    }

    let cancel = interrupt_token(&rt);
    let started = Instant::now();
    println!();
    let result = rt.block_on(session.engine.destroy(&cancel))?;

    print_summary(&result, started);
    if !result.is_success() {
        bail!("Some resources could not be deleted");
    }
    ui::success("All recorded resources deleted");
    Ok(())
}

/// Boxed listing of a plan, grouped by action
fn display_plan(plan: &PlanSummary, title: &str) {
    if !plan.has_changes() {
        println!();
        println!("  {} No changes needed", "✓".green());
        if !plan.no_op.is_empty() {
            ui::dim(&format!("{} resources up to date", plan.no_op.len()));
        }
        return;
    }

    let groups = [
        ("Create", Action::Create, &plan.to_create),
        ("Update in place", Action::Update, &plan.to_update),
        ("Replace", Action::Replace, &plan.to_replace),
        ("Delete", Action::Delete, &plan.to_delete),
    ];

    println!();
    println!(
        "┌─ {} ─────────────────────────────────────────┐",
        title.bold()
    );
    println!("│");
    for (label, action, names) in groups {
        if names.is_empty() {
            continue;
        }
        println!("│ {}", label.bold());
        for name in names {
            println!("│   {} {}", ui::action_symbol(action), name);
        }
        println!("│");
    }

    println!("├─────────────────────────────────────────────────────┤");
    println!(
        "│ Summary: {} to create, {} to update, {} to replace, {} to delete",
        plan.to_create.len().to_string().green(),
        plan.to_update.len().to_string().yellow(),
        plan.to_replace.len().to_string().magenta(),
        plan.to_delete.len().to_string().red()
    );
    if !plan.no_op.is_empty() {
        println!("│ {}", format!("{} unchanged", plan.no_op.len()).dimmed());
    }
    println!("└─────────────────────────────────────────────────────┘");
}

fn confirm_proceed() -> Result<bool> {
    use dialoguer::Confirm;

    let confirmed = Confirm::new()
        .with_prompt("Continue?")
        .default(true)
        .interact()?;

    Ok(confirmed)
}

fn print_summary(result: &RunResult, started: Instant) {
    let elapsed = ui::format_duration(started.elapsed());
    println!();
    match result.status {
        RunStatus::Succeeded => println!(
            "  {} Stack converged in {}",
            "✓".green().bold(),
            elapsed
        ),
        RunStatus::Failed => println!(
            "  {} Run failed after {}",
            "✗".red().bold(),
            elapsed
        ),
        RunStatus::Cancelled => println!(
            "  {} Run cancelled after {}",
            "⚠".yellow().bold(),
            elapsed
        ),
    }

    let summary = &result.summary;
    if summary.created > 0 {
        println!("    • {} resources created", summary.created);
    }
    if summary.updated > 0 {
        println!("    • {} resources updated", summary.updated);
    }
    if summary.replaced > 0 {
        println!("    • {} resources replaced", summary.replaced);
    }
    if summary.deleted > 0 {
        println!("    • {} resources deleted", summary.deleted);
    }
    if summary.unchanged > 0 {
        println!("    • {} resources unchanged", summary.unchanged);
    }
    if !result.skipped.is_empty() {
        println!("    • {} resources skipped", result.skipped.len());
    }
    if !result.failures.is_empty() {
        println!("    • {} {} failed", result.failures.len(), "resources".red());
        for failure in &result.failures {
            let action = failure
                .action
                .map(|a| format!(" ({a})"))
                .unwrap_or_default();
            ui::error(&format!("{}{}: {}", failure.name, action, failure.cause));
        }
    }
}

fn print_exports(result: &RunResult) {
    if result.exports.is_empty() {
        return;
    }
    ui::section("Outputs");
    for (name, value) in &result.exports {
        ui::kv(name, &super::state::display_value(value));
    }
}
