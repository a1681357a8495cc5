//! `warden audit` - query the process-global tool audit log.

use std::path::Path;

use anyhow::Result;

use warden::audit::{AuditLog, AuditQuery};
use warden::paths::OrchestratorPaths;

fn audit_log(dir: &Path) -> AuditLog {
    let paths = OrchestratorPaths::current_or_new(dir);
    AuditLog::new(paths.audit_file())
}

pub fn cmd_audit_query(dir: &Path, query: AuditQuery) -> Result<()> {
    let entries = audit_log(dir).query(&query)?;
    if entries.is_empty() {
        println!("No matching audit entries");
        return Ok(());
    }
    for entry in &entries {
        let outcome = if entry.success {
            console::style("ok").green()
        } else {
            console::style("failed").red()
        };
        println!(
            "{} {} {} {} [{}] {:.1}ms",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.task_id,
            entry.phase,
            entry.tool_name,
            outcome,
            entry.duration_ms.unwrap_or(0.0)
        );
        if let Some(error) = &entry.error {
            println!("    {}", console::style(error).red());
        }
    }
    println!("{} entries", entries.len());
    Ok(())
}

pub fn cmd_audit_stats(dir: &Path) -> Result<()> {
    let stats = audit_log(dir).stats()?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
