//! Mission configuration stored in `codeloop.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::verdict::CompletionMatch;

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "codeloop.toml";

/// Mission loop configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to values that work
/// with a local Docker engine and an OpenAI-compatible endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MissionConfig {
    /// Maximum rounds per mission. `0` means unbounded.
    pub max_iterations: u32,

    /// How evaluator answers are matched against the completion token.
    pub completion_match: CompletionMatch,

    pub oracle: OracleConfig,

    pub packages: PackageConfig,

    pub backend: BackendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OracleConfig {
    /// Base URL of an OpenAI-compatible API (`.../v1`).
    pub base_url: String,
    pub model: String,
    /// Name of the environment variable holding the API key. Empty for none.
    pub api_key_env: String,
    pub timeout_secs: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PackageConfig {
    /// Also ask the oracle which packages the generated code needs.
    pub ask_oracle: bool,
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self { ask_oracle: true }
    }
}

/// Which sandbox runs generated code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Container,
    Page,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub container: ContainerConfig,
    pub page: PageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContainerConfig {
    /// Image with Node.js and npm available.
    pub image: String,
    /// Absolute working directory inside the container.
    pub workdir: String,
    pub exec_timeout_secs: u64,
    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Top-level entries of the workdir that are not exported.
    pub export_exclude: Vec<String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: "node:20".to_string(),
            workdir: "/home/node/work".to_string(),
            exec_timeout_secs: 600,
            output_limit_bytes: 1_000_000,
            export_exclude: ["node_modules", "code.js", "package.json", "package-lock.json"]
                .map(String::from)
                .to_vec(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PageConfig {
    /// Control page served locally for the browser sandbox.
    pub url: String,
    pub ready_timeout_secs: u64,
    pub exec_timeout_secs: u64,
    /// Global object on the control page exposing `boot`, `runCode`,
    /// `writeFile`, `listFiles` and `readFile`.
    pub bridge: String,
}

impl Default for PageConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".to_string(),
            ready_timeout_secs: 60,
            exec_timeout_secs: 600,
            bridge: "_electrons".to_string(),
        }
    }
}

impl Default for MissionConfig {
    fn default() -> Self {
        Self {
            max_iterations: 0,
            completion_match: CompletionMatch::Loose,
            oracle: OracleConfig::default(),
            packages: PackageConfig::default(),
            backend: BackendConfig::default(),
        }
    }
}

impl MissionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.oracle.base_url.trim().is_empty() {
            return Err(anyhow!("oracle.base_url must be non-empty"));
        }
        if self.oracle.model.trim().is_empty() {
            return Err(anyhow!("oracle.model must be non-empty"));
        }
        if self.oracle.timeout_secs == 0 {
            return Err(anyhow!("oracle.timeout_secs must be > 0"));
        }
        // Only the selected backend has to be usable.
        match self.backend.kind {
            BackendKind::Container => self.backend.container.validate(),
            BackendKind::Page => self.backend.page.validate(),
        }
    }
}

impl ContainerConfig {
    fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(anyhow!("backend.container.image must be non-empty"));
        }
        if !self.workdir.starts_with('/') {
            return Err(anyhow!(
                "backend.container.workdir must be an absolute path (got {:?})",
                self.workdir
            ));
        }
        if self.exec_timeout_secs == 0 {
            return Err(anyhow!("backend.container.exec_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("backend.container.output_limit_bytes must be > 0"));
        }
        Ok(())
    }
}

impl PageConfig {
    fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(anyhow!("backend.page.url must be non-empty"));
        }
        if self.ready_timeout_secs == 0 || self.exec_timeout_secs == 0 {
            return Err(anyhow!("backend.page timeouts must be > 0"));
        }
        let valid_ident = self
            .bridge
            .chars()
            .enumerate()
            .all(|(i, c)| c == '_' || c == '$' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit()));
        if self.bridge.is_empty() || !valid_ident {
            return Err(anyhow!(
                "backend.page.bridge must be a JavaScript identifier (got {:?})",
                self.bridge
            ));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `MissionConfig::default()`.
pub fn load_config(path: &Path) -> Result<MissionConfig> {
    if !path.exists() {
        let cfg = MissionConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: MissionConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &MissionConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
