//! `warden serve` - run the orchestrator HTTP server.
//!
//! The library core brokers tool calls but implements no tool logic; this
//! binary is the host process, so the baseline backends are registered
//! here. Deployments embedding the library register their own.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use warden::broker::ToolBackend;
use warden::orchestrator::{Orchestrator, SECRET_ENV_VAR};
use warden::server::{start_server, AppState, ServerConfig};
use warden::workflow::{defaults::default_workflow, WorkflowDef};

pub async fn cmd_serve(
    dir: &Path,
    workflow: Option<PathBuf>,
    port: u16,
    dev_mode: bool,
) -> Result<()> {
    let secret = std::env::var(SECRET_ENV_VAR).with_context(|| {
        format!("{SECRET_ENV_VAR} environment variable not set. Generate one with: openssl rand -hex 32")
    })?;

    let def = match &workflow {
        Some(path) => WorkflowDef::load(path)
            .with_context(|| format!("Failed to load workflow from {}", path.display()))?,
        None => default_workflow(),
    };

    println!(
        "  {} {} v{} ({} phases, enforcement: {})",
        console::style("Workflow:").dim(),
        def.name,
        def.version,
        def.phases.len(),
        def.enforcement.mode
    );

    let orchestrator = Orchestrator::new(dir, def, &secret)?;
    register_host_backends(&orchestrator, dir);
    println!(
        "  {} http://127.0.0.1:{port}",
        console::style("Listening:").dim()
    );

    start_server(
        Arc::new(AppState { orchestrator }),
        ServerConfig { port, dev_mode },
    )
    .await
}

fn register_host_backends(orchestrator: &Orchestrator, dir: &Path) {
    orchestrator.register_backend("echo", Arc::new(EchoBackend));
    orchestrator.register_backend(
        "read_files",
        Arc::new(ReadFilesBackend {
            root: dir.to_path_buf(),
        }),
    );
    orchestrator.register_backend(
        "write_files",
        Arc::new(WriteFilesBackend {
            root: dir.to_path_buf(),
        }),
    );
}

/// Diagnostic backend: returns its arguments.
struct EchoBackend;

#[async_trait]
impl ToolBackend for EchoBackend {
    async fn invoke(&self, args: Value) -> Result<Value, String> {
        Ok(json!({"status": "success", "echo": args}))
    }
}

struct ReadFilesBackend {
    root: PathBuf,
}

#[async_trait]
impl ToolBackend for ReadFilesBackend {
    async fn invoke(&self, args: Value) -> Result<Value, String> {
        let path = args
            .get("path")
            .and_then(Value::as_str)
            .ok_or("missing 'path' argument")?;
        let resolved = resolve_under(&self.root, path)?;
        let content = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| format!("failed to read {path}: {e}"))?;
        Ok(json!({"status": "success", "path": path, "content": content}))
    }
}

struct WriteFilesBackend {
    root: PathBuf,
}

#[async_trait]
impl ToolBackend for WriteFilesBackend {
    async fn invoke(&self, args: Value) -> Result<Value, String> {
        let path = args
            .get("path")
            .and_then(Value::as_str)
            .ok_or("missing 'path' argument")?;
        let content = args
            .get("content")
            .and_then(Value::as_str)
            .ok_or("missing 'content' argument")?;
        let resolved = resolve_under(&self.root, path)?;
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("failed to create parent dirs: {e}"))?;
        }
        tokio::fs::write(&resolved, content)
            .await
            .map_err(|e| format!("failed to write {path}: {e}"))?;
        Ok(json!({"status": "success", "path": path, "bytes_written": content.len()}))
    }
}

/// Keep backend file access inside the working directory.
fn resolve_under(root: &Path, relative: &str) -> Result<PathBuf, String> {
    let joined = root.join(relative);
    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            std::path::Component::ParentDir => {
                if !normalized.pop() {
                    return Err(format!("path escapes working directory: {relative}"));
                }
            }
            std::path::Component::CurDir => {}
            other => normalized.push(other),
        }
    }
    if normalized.starts_with(root) {
        Ok(normalized)
    } else {
        Err(format!("path escapes working directory: {relative}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn read_backend_reads_relative_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("hello.txt"), "hello world").unwrap();
        let backend = ReadFilesBackend {
            root: dir.path().to_path_buf(),
        };
        let result = backend.invoke(json!({"path": "hello.txt"})).await.unwrap();
        assert!(result["content"].as_str().unwrap().contains("hello"));
    }

    #[tokio::test]
    async fn read_backend_blocks_traversal() {
        let dir = TempDir::new().unwrap();
        let backend = ReadFilesBackend {
            root: dir.path().to_path_buf(),
        };
        let err = backend
            .invoke(json!({"path": "../../etc/passwd"}))
            .await
            .unwrap_err();
        assert!(err.contains("escapes working directory"));
    }

    #[tokio::test]
    async fn write_backend_round_trips() {
        let dir = TempDir::new().unwrap();
        let write = WriteFilesBackend {
            root: dir.path().to_path_buf(),
        };
        write
            .invoke(json!({"path": "out/notes.md", "content": "# notes"}))
            .await
            .unwrap();
        let read = ReadFilesBackend {
            root: dir.path().to_path_buf(),
        };
        let result = read.invoke(json!({"path": "out/notes.md"})).await.unwrap();
        assert_eq!(result["content"], "# notes");
    }
}
