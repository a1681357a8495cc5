//! `warden approve-item` / `warden approve-phase` - human overrides for
//! manual gates.

use std::path::Path;

use anyhow::{Context, Result};

use warden::engine::WorkflowEngine;
use warden::paths::OrchestratorPaths;

fn load_engine(dir: &Path) -> Result<WorkflowEngine> {
    let paths = OrchestratorPaths::current_or_new(dir);
    let mut engine = WorkflowEngine::new(dir, Some(paths.session_id().to_string()));
    engine
        .load_state()?
        .context("No workflow found in the current session")?;
    Ok(engine)
}

pub fn cmd_approve_item(dir: &Path, item_id: &str, notes: Option<String>) -> Result<()> {
    let mut engine = load_engine(dir)?;
    let (ok, message) = engine.approve_item(item_id, notes)?;
    if ok {
        println!("{} {message}", console::style("✓").green());
    } else {
        eprintln!("{} {message}", console::style("✗").red());
        std::process::exit(1);
    }
    Ok(())
}

pub fn cmd_approve_phase(dir: &Path, phase_id: Option<String>) -> Result<()> {
    let mut engine = load_engine(dir)?;
    let (ok, message) = engine.approve_phase(phase_id.as_deref())?;
    if ok {
        println!("{} {message}", console::style("✓").green());
    } else {
        eprintln!("{} {message}", console::style("✗").red());
        std::process::exit(1);
    }
    Ok(())
}
