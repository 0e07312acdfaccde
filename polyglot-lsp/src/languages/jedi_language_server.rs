//! Python support via `jedi-language-server`.

use super::{find_binary, ServerProfile};
use crate::config::Language;
use crate::process::ProcessLaunchInfo;
use crate::Result;
use std::path::Path;

pub struct JediLanguageServer;

impl ServerProfile for JediLanguageServer {
    fn language(&self) -> Language {
        Language::Python
    }

    fn name(&self) -> &'static str {
        "jedi-language-server"
    }

    fn language_id(&self) -> &'static str {
        "python"
    }

    fn initialize_params_template(&self) -> &'static str {
        include_str!("jedi_language_server/initialize_params.json")
    }

    fn runtime_dependencies(&self) -> &'static str {
        include_str!("jedi_language_server/runtime_dependencies.json")
    }

    fn launch_info(&self, workspace_root: &Path, static_dir: &Path) -> Result<ProcessLaunchInfo> {
        let binary = find_binary("jedi-language-server", static_dir, "bin/jedi-language-server")?;
        let mut info = ProcessLaunchInfo::new(binary, workspace_root);
        // pip --prefix installs put the module tree next to the script
        if info.command.starts_with(static_dir) {
            if let Some(site) = python_site_dir(static_dir) {
                info.env.insert("PYTHONPATH".to_string(), site);
            }
        }
        Ok(info)
    }
}

/// A `pip install --prefix` drops modules under `lib/pythonX.Y/site-packages`;
/// find that directory so the cached script can import its own code.
fn python_site_dir(static_dir: &Path) -> Option<String> {
    let lib = static_dir.join("lib");
    let entries = std::fs::read_dir(lib).ok()?;
    for entry in entries.flatten() {
        let site = entry.path().join("site-packages");
        if site.is_dir() {
            return site.to_str().map(str::to_owned);
        }
    }
    None
}
