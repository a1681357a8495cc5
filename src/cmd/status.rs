//! `warden status` - show the current session's workflow state.

use std::path::Path;

use anyhow::Result;

use warden::engine::{ItemStatus, WorkflowEngine};
use warden::paths::OrchestratorPaths;

pub fn cmd_status(dir: &Path) -> Result<()> {
    let paths = OrchestratorPaths::current_or_new(dir);
    let mut engine = WorkflowEngine::new(dir, Some(paths.session_id().to_string()));

    let Some(state) = engine.load_state()? else {
        println!("No workflow in session {}", paths.session_id());
        return Ok(());
    };
    let state = state.clone();

    println!(
        "{} {} ({})",
        console::style("Workflow:").bold(),
        state.workflow_id,
        state.status
    );
    println!("  Task: {}", state.task_description);
    println!(
        "  Phase: {}",
        console::style(&state.current_phase_id).cyan()
    );

    if let Some(phase) = state.current_phase() {
        for (item_id, item) in &phase.items {
            let marker = match item.status {
                ItemStatus::Completed => console::style("✓").green(),
                ItemStatus::Skipped => console::style("~").yellow(),
                ItemStatus::Failed => console::style("✗").red(),
                ItemStatus::InProgress => console::style("▸").cyan(),
                _ => console::style("·").dim(),
            };
            println!("    {marker} {item_id} ({})", item.status);
        }
    }

    let (can_advance, blockers, skipped) = engine.can_advance_phase();
    if can_advance {
        println!("  {}", console::style("Ready to advance").green());
    } else {
        println!("  {}", console::style("Blocked:").red());
        for blocker in blockers {
            println!("    - {blocker}");
        }
    }
    if !skipped.is_empty() {
        println!("  Skipped:");
        for entry in skipped {
            println!("    - {entry}");
        }
    }

    Ok(())
}
