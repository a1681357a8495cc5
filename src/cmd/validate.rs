//! `warden validate` - structural validation of a workflow document.

use std::path::Path;

use anyhow::Result;

use warden::workflow::WorkflowDef;

pub fn cmd_validate(path: &Path) -> Result<()> {
    match WorkflowDef::load(path) {
        Ok(def) => {
            println!(
                "{} {} v{}",
                console::style("✓ Valid workflow:").green(),
                def.name,
                def.version
            );
            println!("  Phases: {}", def.phases.len());
            for phase in &def.phases {
                println!(
                    "    {} - {} ({} items, {} gates)",
                    console::style(&phase.id).cyan(),
                    phase.name,
                    phase.items.len(),
                    phase.gates.len()
                );
            }
            println!("  Transitions: {}", def.transitions.len());
            println!("  Enforcement: {}", def.enforcement.mode);
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {e}", console::style("✗ Invalid workflow:").red());
            std::process::exit(1);
        }
    }
}
