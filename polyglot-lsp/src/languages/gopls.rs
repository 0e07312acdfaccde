//! Go support via `gopls`.

use super::{find_binary, ServerProfile};
use crate::config::Language;
use crate::process::ProcessLaunchInfo;
use crate::Result;
use std::path::Path;

pub struct Gopls;

impl ServerProfile for Gopls {
    fn language(&self) -> Language {
        Language::Go
    }

    fn name(&self) -> &'static str {
        "gopls"
    }

    fn language_id(&self) -> &'static str {
        "go"
    }

    fn initialize_params_template(&self) -> &'static str {
        include_str!("gopls/initialize_params.json")
    }

    fn runtime_dependencies(&self) -> &'static str {
        include_str!("gopls/runtime_dependencies.json")
    }

    fn launch_info(&self, workspace_root: &Path, static_dir: &Path) -> Result<ProcessLaunchInfo> {
        let binary = find_binary("gopls", static_dir, "bin/gopls")?;
        Ok(ProcessLaunchInfo::new(binary, workspace_root))
    }
}
