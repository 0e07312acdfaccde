//! Scripted mock language servers for driving the client over real pipes.
//!
//! A mock is a small `sh` script: it tees everything the client writes into
//! a capture file (for later assertions) while printing canned LSP frames on
//! its own schedule. Fixed sleeps take the place of real request handling,
//! which works because the client's request ids are deterministic.

#![allow(dead_code)]
#![cfg(unix)]

use polyglot_lsp::languages::ServerProfile;
use polyglot_lsp::{Language, ProcessLaunchInfo};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const INIT_RESPONSE: &str = r#"{"jsonrpc":"2.0","id":0,"result":{"capabilities":{"textDocumentSync":2,"definitionProvider":true,"typeDefinitionProvider":true,"implementationProvider":true,"referencesProvider":true,"hoverProvider":true,"documentSymbolProvider":true,"workspaceSymbolProvider":true,"completionProvider":{}}}}"#;

const TEMPLATE: &str = r#"{
  "_description": "initialize params for the scripted mock server",
  "processId": null,
  "rootPath": "$rootPath",
  "rootUri": "$rootUri",
  "capabilities": {},
  "workspaceFolders": [
    {
      "uri": "$uri",
      "name": "$name"
    }
  ]
}"#;

const NO_DEPENDENCIES: &str = r#"{ "runtimeDependencies": [] }"#;

pub fn null_result(id: u64) -> String {
    format!(r#"{{"jsonrpc":"2.0","id":{id},"result":null}}"#)
}

pub struct MockServer {
    pub dir: TempDir,
    pub script: PathBuf,
    pub capture: PathBuf,
}

impl MockServer {
    pub fn workspace(&self) -> &Path {
        self.dir.path()
    }

    pub fn captured(&self) -> String {
        std::fs::read_to_string(&self.capture).unwrap_or_default()
    }

    pub fn profile(&self) -> Arc<dyn ServerProfile> {
        Arc::new(MockProfile {
            script: self.script.clone(),
        })
    }

    /// Put a file into the mock workspace.
    pub fn add_file(&self, relative_path: &str, text: &str) {
        let path = self.dir.path().join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, text).unwrap();
    }
}

pub struct MockServerBuilder {
    steps: String,
    exit_when_done: bool,
}

impl MockServerBuilder {
    pub fn new() -> Self {
        Self {
            steps: String::new(),
            exit_when_done: false,
        }
    }

    /// End the script (closing both pipes) after the last step instead of
    /// lingering until teardown. Simulates a server that dies mid-session.
    pub fn exit_when_done(mut self) -> Self {
        self.exit_when_done = true;
        self
    }

    /// Pause the output schedule.
    pub fn sleep(mut self, seconds: f64) -> Self {
        writeln!(self.steps, "sleep {seconds}").unwrap();
        self
    }

    /// Print one framed message to stdout.
    pub fn send(mut self, body: &str) -> Self {
        assert!(
            !body.contains('\''),
            "mock bodies must not contain single quotes"
        );
        let frame = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);
        writeln!(self.steps, "printf '%s' '{frame}'").unwrap();
        self
    }

    /// Fork a descendant with a recognizable sleep duration, so tests can
    /// scan the process table for survivors after teardown.
    pub fn spawn_sleeper(mut self, marker_duration: &str) -> Self {
        writeln!(self.steps, "sleep {marker_duration} &").unwrap();
        self
    }

    pub fn build(self) -> MockServer {
        let dir = tempfile::tempdir().unwrap();
        let capture = dir.path().join("client-to-server.log");
        let script = dir.path().join("mock-server.sh");

        let mut body = String::from("#!/bin/sh\n");
        // record everything the client sends while the schedule plays out
        writeln!(body, "cat > '{}' &", capture.display()).unwrap();
        body.push_str(&self.steps);
        if self.exit_when_done {
            body.push_str("exit 0\n");
        } else {
            // stay alive until torn down
            body.push_str("sleep 60\n");
        }

        std::fs::write(&script, body).unwrap();
        make_executable(&script);

        MockServer {
            dir,
            script,
            capture,
        }
    }
}

fn make_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let mut permissions = std::fs::metadata(path).unwrap().permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(path, permissions).unwrap();
}

struct MockProfile {
    script: PathBuf,
}

impl ServerProfile for MockProfile {
    fn language(&self) -> Language {
        Language::Go
    }

    fn name(&self) -> &'static str {
        "mock-server"
    }

    fn language_id(&self) -> &'static str {
        "go"
    }

    fn initialize_params_template(&self) -> &'static str {
        TEMPLATE
    }

    fn runtime_dependencies(&self) -> &'static str {
        NO_DEPENDENCIES
    }

    fn launch_info(&self, workspace_root: &Path, _static_dir: &Path) -> polyglot_lsp::Result<ProcessLaunchInfo> {
        let mut info = ProcessLaunchInfo::new("sh", workspace_root);
        info.args = vec![self.script.to_string_lossy().into_owned()];
        Ok(info)
    }

    fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(10)
    }
}

/// Poll the capture file until `needle` shows up or the deadline passes.
pub async fn wait_for_capture(server: &MockServer, needle: &str, deadline: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if server.captured().contains(needle) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
