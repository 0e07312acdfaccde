//! Rust support via `rust-analyzer`.
//!
//! rust-analyzer answers queries from an incomplete index while it is still
//! crunching the workspace, so the session holds off until the
//! `experimental/serverStatus` notification reports `quiescent`.

use super::{find_binary, ServerProfile};
use crate::config::Language;
use crate::process::ProcessLaunchInfo;
use crate::{jsonrpc, Result};
use std::path::Path;
use std::time::Duration;

pub struct RustAnalyzer;

impl ServerProfile for RustAnalyzer {
    fn language(&self) -> Language {
        Language::Rust
    }

    fn name(&self) -> &'static str {
        "rust-analyzer"
    }

    fn language_id(&self) -> &'static str {
        "rust"
    }

    fn initialize_params_template(&self) -> &'static str {
        include_str!("rust_analyzer/initialize_params.json")
    }

    fn runtime_dependencies(&self) -> &'static str {
        include_str!("rust_analyzer/runtime_dependencies.json")
    }

    fn launch_info(&self, workspace_root: &Path, static_dir: &Path) -> Result<ProcessLaunchInfo> {
        let binary_name = if cfg!(windows) {
            "rust-analyzer.exe"
        } else {
            "rust-analyzer"
        };
        let binary = find_binary("rust-analyzer", static_dir, binary_name)?;
        Ok(ProcessLaunchInfo::new(binary, workspace_root))
    }

    fn readiness_latches(&self) -> &'static [&'static str] {
        &["quiescent"]
    }

    fn readiness_latch_for(&self, method: &str, params: &jsonrpc::Params) -> Option<&'static str> {
        if method != "experimental/serverStatus" {
            return None;
        }
        match params {
            jsonrpc::Params::Map(map) if map.get("quiescent").and_then(|v| v.as_bool()) == Some(true) => {
                Some("quiescent")
            }
            _ => None,
        }
    }

    fn readiness_timeout(&self) -> Duration {
        // indexing a large workspace takes a while on first run
        Duration::from_secs(300)
    }
}
