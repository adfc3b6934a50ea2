use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

pub const CONFIG_FILENAME: &str = "epub-translator.toml";
pub const CONFIG_ENV: &str = "EPUB_TRANSLATOR_CONFIG";
pub const DEFAULT_API_KEY_ENV: &str = "GEMINI_API_KEY";

#[derive(Clone, Debug, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub job: JobSection,
    #[serde(default)]
    pub service: ServiceSection,
    #[serde(default)]
    pub prompts: PromptsSection,
    #[serde(default)]
    pub output: OutputSection,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct JobSection {
    /// "replace" or "bilingual".
    #[serde(default)]
    pub mode: Option<String>,

    /// Free-text instruction naming the target language, e.g. "Translate into German.".
    #[serde(default)]
    pub target_language: Option<String>,

    #[serde(default)]
    pub model: Option<String>,

    /// 0 or unset = unbounded.
    #[serde(default)]
    pub max_blocks_per_chunk: Option<usize>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct ServiceSection {
    #[serde(default)]
    pub base_url: Option<String>,

    /// Credential stored in the file. Prefer `api_key_env`.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable holding the credential (default: GEMINI_API_KEY).
    #[serde(default)]
    pub api_key_env: Option<String>,

    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct PromptsSection {
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub translate: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct OutputSection {
    #[serde(default)]
    pub autosave: Option<bool>,
    #[serde(default)]
    pub autosave_suffix: Option<String>,
    #[serde(default)]
    pub trace_dir: Option<String>,
    #[serde(default)]
    pub trace_prompts: Option<bool>,
}

pub fn find_file_upwards(start_dir: &Path, filename: &str, max_levels: usize) -> Option<PathBuf> {
    let mut dir = start_dir;
    for _ in 0..=max_levels {
        let candidate = dir.join(filename);
        if candidate.exists() {
            return Some(candidate);
        }
        dir = dir.parent()?;
    }
    None
}

pub fn find_default_config(workdir: &Path, filename: &str) -> Option<PathBuf> {
    if let Ok(cwd) = std::env::current_dir() {
        if let Some(p) = find_file_upwards(&cwd, filename, 8) {
            return Some(p);
        }
    }
    if let Some(p) = find_file_upwards(workdir, filename, 8) {
        return Some(p);
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if let Some(p) = find_file_upwards(dir, filename, 10) {
                return Some(p);
            }
        }
    }
    None
}

pub fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    parse_config(&text)
}

pub fn parse_config(text: &str) -> anyhow::Result<AppConfig> {
    let cfg: AppConfig = toml::from_str(text).context("parse config toml")?;
    Ok(cfg)
}
