//! Ruby support via `solargraph`.

use super::{find_binary, ServerProfile};
use crate::config::Language;
use crate::process::ProcessLaunchInfo;
use crate::Result;
use std::path::Path;

pub struct Solargraph;

impl ServerProfile for Solargraph {
    fn language(&self) -> Language {
        Language::Ruby
    }

    fn name(&self) -> &'static str {
        "solargraph"
    }

    fn language_id(&self) -> &'static str {
        "ruby"
    }

    fn initialize_params_template(&self) -> &'static str {
        include_str!("solargraph/initialize_params.json")
    }

    fn runtime_dependencies(&self) -> &'static str {
        include_str!("solargraph/runtime_dependencies.json")
    }

    fn launch_info(&self, workspace_root: &Path, static_dir: &Path) -> Result<ProcessLaunchInfo> {
        let binary = find_binary("solargraph", static_dir, "bin/solargraph")?;
        let mut info = ProcessLaunchInfo::new(binary, workspace_root);
        info.args.push("stdio".to_string());
        // a gem --install-dir tree is only importable with GEM_HOME pointed at it
        if info.command.starts_with(static_dir) {
            if let Some(dir) = static_dir.to_str() {
                info.env.insert("GEM_HOME".to_string(), dir.to_string());
            }
        }
        Ok(info)
    }
}
