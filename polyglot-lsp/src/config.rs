//! Client configuration and the language tag menu.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Languages the client knows how to talk about. Having a tag here does not
/// guarantee a compiled-in server profile; see [`crate::languages::profile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    CSharp,
    Python,
    Rust,
    Java,
    Kotlin,
    TypeScript,
    JavaScript,
    Go,
    Ruby,
    Dart,
    Cpp,
    Clojure,
    Php,
    Perl,
    Elixir,
}

impl Language {
    /// The tag used in configuration files and on the command line.
    pub fn tag(&self) -> &'static str {
        match self {
            Language::CSharp => "csharp",
            Language::Python => "python",
            Language::Rust => "rust",
            Language::Java => "java",
            Language::Kotlin => "kotlin",
            Language::TypeScript => "typescript",
            Language::JavaScript => "javascript",
            Language::Go => "go",
            Language::Ruby => "ruby",
            Language::Dart => "dart",
            Language::Cpp => "cpp",
            Language::Clojure => "clojure",
            Language::Php => "php",
            Language::Perl => "perl",
            Language::Elixir => "elixir",
        }
    }

    pub const ALL: &'static [Language] = &[
        Language::CSharp,
        Language::Python,
        Language::Rust,
        Language::Java,
        Language::Kotlin,
        Language::TypeScript,
        Language::JavaScript,
        Language::Go,
        Language::Ruby,
        Language::Dart,
        Language::Cpp,
        Language::Clojure,
        Language::Php,
        Language::Perl,
        Language::Elixir,
    ];
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Language {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Language::ALL
            .iter()
            .copied()
            .find(|language| language.tag() == s)
            .with_context(|| format!("unknown language tag '{s}'"))
    }
}

fn default_true() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    15
}

/// Configuration for one client session. Deserializable from TOML (and any
/// other serde format); unspecified fields take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Which language server to drive.
    pub code_language: Language,
    /// Mirror every client<->server payload to the log sink at info level.
    #[serde(default)]
    pub trace_lsp_communication: bool,
    /// Start the server in its own process group so signals aimed at the
    /// host do not reach it.
    #[serde(default = "default_true")]
    pub start_independent_lsp_process: bool,
    /// Per-request timeout, in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    /// Overrides the profile's readiness wait, in seconds.
    #[serde(default)]
    pub readiness_timeout: Option<u64>,
}

impl ClientConfig {
    pub fn new(code_language: Language) -> Self {
        Self {
            code_language,
            trace_lsp_communication: false,
            start_independent_lsp_process: true,
            request_timeout: default_request_timeout(),
            readiness_timeout: None,
        }
    }

    pub fn from_toml_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn readiness_timeout(&self) -> Option<Duration> {
        self.readiness_timeout.map(Duration::from_secs)
    }
}
