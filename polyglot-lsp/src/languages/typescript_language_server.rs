//! TypeScript and JavaScript support via `typescript-language-server`.
//! Both tags share one server; only the reported `languageId` differs.

use super::{find_binary, ServerProfile};
use crate::config::Language;
use crate::process::ProcessLaunchInfo;
use crate::Result;
use std::path::Path;

pub struct TypeScriptLanguageServer {
    language: Language,
}

impl TypeScriptLanguageServer {
    pub fn new(language: Language) -> Self {
        debug_assert!(matches!(
            language,
            Language::TypeScript | Language::JavaScript
        ));
        Self { language }
    }
}

impl ServerProfile for TypeScriptLanguageServer {
    fn language(&self) -> Language {
        self.language
    }

    fn name(&self) -> &'static str {
        "typescript-language-server"
    }

    fn language_id(&self) -> &'static str {
        match self.language {
            Language::JavaScript => "javascript",
            _ => "typescript",
        }
    }

    fn initialize_params_template(&self) -> &'static str {
        include_str!("typescript_language_server/initialize_params.json")
    }

    fn runtime_dependencies(&self) -> &'static str {
        include_str!("typescript_language_server/runtime_dependencies.json")
    }

    fn launch_info(&self, workspace_root: &Path, static_dir: &Path) -> Result<ProcessLaunchInfo> {
        let binary = find_binary(
            "typescript-language-server",
            static_dir,
            "node_modules/.bin/typescript-language-server",
        )?;
        let mut info = ProcessLaunchInfo::new(binary, workspace_root);
        info.args.push("--stdio".to_string());
        Ok(info)
    }
}
