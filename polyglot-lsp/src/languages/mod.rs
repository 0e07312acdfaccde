//! Per-language server profiles.
//!
//! A profile bundles everything that distinguishes one language server from
//! another: the launch command, the embedded `initialize` template, the
//! runtime-dependency descriptor and the readiness predicate. Dispatch is by
//! language tag, there is no registry and no inheritance; adding a language
//! means adding a module here and wiring it into [`profile`].

mod gopls;
mod jedi_language_server;
mod rust_analyzer;
mod solargraph;
mod typescript_language_server;

use crate::config::Language;
use crate::process::ProcessLaunchInfo;
use crate::{jsonrpc, lsp, Error, Result};
use anyhow::Context;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub use gopls::Gopls;
pub use jedi_language_server::JediLanguageServer;
pub use rust_analyzer::RustAnalyzer;
pub use solargraph::Solargraph;
pub use typescript_language_server::TypeScriptLanguageServer;

/// The capability set one language's server module contributes.
pub trait ServerProfile: Send + Sync {
    fn language(&self) -> Language;

    /// Server name, used for log lines ("gopls").
    fn name(&self) -> &'static str;

    /// The `languageId` reported in `textDocument/didOpen`.
    fn language_id(&self) -> &'static str;

    /// Embedded `initialize` params template carrying `$rootPath`,
    /// `$rootUri`, `$uri` and `$name` placeholders.
    fn initialize_params_template(&self) -> &'static str;

    /// Embedded per-platform runtime dependency descriptor.
    fn runtime_dependencies(&self) -> &'static str;

    /// Build the launch command. `static_dir` is this language's binary
    /// cache under `static/<lang>`.
    fn launch_info(&self, workspace_root: &Path, static_dir: &Path) -> Result<ProcessLaunchInfo>;

    /// Latches that must be set before the session reports `Ready`, beyond
    /// the `initialize` handshake itself.
    fn readiness_latches(&self) -> &'static [&'static str] {
        &[]
    }

    /// Map a server notification onto one of [`Self::readiness_latches`].
    fn readiness_latch_for(
        &self,
        _method: &str,
        _params: &jsonrpc::Params,
    ) -> Option<&'static str> {
        None
    }

    /// Budget for the handshake plus readiness wait.
    fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    /// Post-`initialize` capability checks. Mismatches are warnings, not
    /// errors: a query against a missing provider fails on its own.
    fn validate_capabilities(&self, capabilities: &lsp::ServerCapabilities) -> Vec<String> {
        default_capability_warnings(capabilities)
    }
}

/// Resolve the compiled-in profile for `language`.
pub fn profile(language: Language) -> Result<Arc<dyn ServerProfile>> {
    match language {
        Language::Go => Ok(Arc::new(Gopls)),
        Language::TypeScript | Language::JavaScript => {
            Ok(Arc::new(TypeScriptLanguageServer::new(language)))
        }
        Language::Rust => Ok(Arc::new(RustAnalyzer)),
        Language::Python => Ok(Arc::new(JediLanguageServer)),
        Language::Ruby => Ok(Arc::new(Solargraph)),
        other => Err(Error::UnsupportedLanguage(other)),
    }
}

pub(crate) fn default_capability_warnings(capabilities: &lsp::ServerCapabilities) -> Vec<String> {
    let mut warnings = Vec::new();

    if capabilities.text_document_sync.is_none() {
        warnings.push("server does not advertise textDocumentSync".to_string());
    }
    if !matches!(
        capabilities.definition_provider,
        Some(lsp::OneOf::Left(true) | lsp::OneOf::Right(_))
    ) {
        warnings.push("server does not advertise a definition provider".to_string());
    }
    if !matches!(
        capabilities.references_provider,
        Some(lsp::OneOf::Left(true) | lsp::OneOf::Right(_))
    ) {
        warnings.push("server does not advertise a references provider".to_string());
    }
    if !matches!(
        capabilities.document_symbol_provider,
        Some(lsp::OneOf::Left(true) | lsp::OneOf::Right(_))
    ) {
        warnings.push("server does not advertise a document symbol provider".to_string());
    }
    if capabilities.completion_provider.is_none() {
        warnings.push("server does not advertise a completion provider".to_string());
    }

    warnings
}

/// Fill a profile's `initialize` template: substitute the placeholder
/// fields, stamp our process id and drop the descriptive comment field.
pub(crate) fn substitute_initialize_params(
    template: &str,
    workspace_root: &Path,
) -> anyhow::Result<Value> {
    let mut params: Value = serde_json::from_str(template)?;
    let map = params
        .as_object_mut()
        .context("initialize template is not a JSON object")?;
    map.remove("_description");

    let root_str = workspace_root
        .to_str()
        .context("workspace root is not valid UTF-8")?
        .to_string();
    let root_uri = lsp::Url::from_file_path(workspace_root)
        .map_err(|_| anyhow::anyhow!("workspace root is not an absolute path"))?;
    let name = workspace_root
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    map.insert("processId".to_string(), Value::from(std::process::id()));

    let root_path = map
        .get_mut("rootPath")
        .context("template is missing rootPath")?;
    anyhow::ensure!(*root_path == Value::from("$rootPath"), "unexpected rootPath placeholder");
    *root_path = Value::from(root_str);

    let uri_field = map
        .get_mut("rootUri")
        .context("template is missing rootUri")?;
    anyhow::ensure!(*uri_field == Value::from("$rootUri"), "unexpected rootUri placeholder");
    *uri_field = Value::from(root_uri.to_string());

    let folder = map
        .get_mut("workspaceFolders")
        .and_then(|folders| folders.as_array_mut())
        .and_then(|folders| folders.first_mut())
        .and_then(|folder| folder.as_object_mut())
        .context("template is missing workspaceFolders[0]")?;
    anyhow::ensure!(
        folder.get("uri") == Some(&Value::from("$uri")),
        "unexpected workspaceFolders uri placeholder"
    );
    anyhow::ensure!(
        folder.get("name") == Some(&Value::from("$name")),
        "unexpected workspaceFolders name placeholder"
    );
    folder.insert("uri".to_string(), Value::from(root_uri.to_string()));
    folder.insert("name".to_string(), Value::from(name));

    Ok(params)
}

/// Locate a server binary: `$PATH` first, then the language's static cache.
pub(crate) fn find_binary(
    binary: &str,
    static_dir: &Path,
    cached_subpath: &str,
) -> Result<PathBuf> {
    if let Ok(path) = which::which(binary) {
        return Ok(path);
    }
    let cached = static_dir.join(cached_subpath);
    if cached.is_file() {
        return Ok(cached);
    }
    Err(Error::MissingBinary(format!(
        "{binary} is neither on PATH nor in {}",
        static_dir.display()
    )))
}
