use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use crate::config::{
    find_default_config, load_config, AppConfig, CONFIG_ENV, CONFIG_FILENAME, DEFAULT_API_KEY_ENV,
};
use crate::epub::apply::TranslationMode;
use crate::epub::chunk::DEFAULT_CHUNK_CHAR_BUDGET;
use crate::pipeline::prompts::{default_prompt_files, PromptSet, DEFAULT_PROMPTS_DIR};

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_TARGET_LANGUAGE: &str = "Translate into Simplified Chinese.";
pub const DEFAULT_AUTOSAVE_SUFFIX: &str = "_partial.epub";

/// Everything one translation job needs, passed in explicitly at start.
#[derive(Clone, Debug)]
pub struct JobConfig {
    pub translation_mode: TranslationMode,
    /// Character budget per request chunk. Not exposed on the CLI or in the config file.
    pub chunk_char_budget: usize,
    /// `None` = unbounded.
    pub max_blocks_per_chunk: Option<usize>,
    pub target_language_instruction: String,
    pub model_id: String,
    pub service_base_url: Option<String>,
    pub credential: String,
    pub request_timeout: Option<Duration>,
    pub trace_dir: Option<PathBuf>,
    pub prompts: PromptSet,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            translation_mode: TranslationMode::default(),
            chunk_char_budget: DEFAULT_CHUNK_CHAR_BUDGET,
            max_blocks_per_chunk: None,
            target_language_instruction: DEFAULT_TARGET_LANGUAGE.to_string(),
            model_id: DEFAULT_MODEL.to_string(),
            service_base_url: None,
            credential: String::new(),
            request_timeout: Some(Duration::from_secs(300)),
            trace_dir: None,
            prompts: PromptSet::default(),
        }
    }
}

/// Values given on the command line; each one overrides the config file.
#[derive(Clone, Debug, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub mode: Option<String>,
    pub target_language: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub max_blocks: Option<usize>,
    pub autosave: bool,
}

/// Resolved job config plus the CLI-only output settings.
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub job: JobConfig,
    pub config_path: Option<PathBuf>,
    pub autosave: bool,
    pub autosave_suffix: String,
}

impl RunConfig {
    pub fn from_paths_and_args(input: &Path, output: &Path, args: CliOverrides) -> anyhow::Result<Self> {
        let workdir = input
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        let workdir = workdir.canonicalize().unwrap_or(workdir);

        let cfg_file = args
            .config_path
            .clone()
            .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from))
            .or_else(|| find_default_config(&workdir, CONFIG_FILENAME));

        let mut file_cfg = AppConfig::default();
        if let Some(p) = cfg_file.as_ref() {
            if p.exists() {
                file_cfg = load_config(p)?;
            } else if args.config_path.is_some() {
                anyhow::bail!("config file not found: {}", p.display());
            }
        }
        let cfg_path = cfg_file
            .clone()
            .unwrap_or_else(|| workdir.join(CONFIG_FILENAME));

        let mode = TranslationMode::parse(args.mode.as_deref().or(file_cfg.job.mode.as_deref()));
        let target_language_instruction = args
            .target_language
            .or_else(|| file_cfg.job.target_language.clone())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_TARGET_LANGUAGE.to_string());
        let model_id = args
            .model
            .or_else(|| file_cfg.job.model.clone())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let max_blocks_per_chunk = args
            .max_blocks
            .or(file_cfg.job.max_blocks_per_chunk)
            .filter(|n| *n > 0);
        let service_base_url = args
            .base_url
            .or_else(|| file_cfg.service.base_url.clone())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let key_env = file_cfg
            .service
            .api_key_env
            .clone()
            .unwrap_or_else(|| DEFAULT_API_KEY_ENV.to_string());
        let credential = args
            .api_key
            .or_else(|| std::env::var(&key_env).ok())
            .or_else(|| file_cfg.service.api_key.clone())
            .map(|s| s.trim().to_string())
            .unwrap_or_default();

        let output_dir = output
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| workdir.clone());
        let trace_dir = if file_cfg.output.trace_prompts.unwrap_or(false) {
            let dir = file_cfg
                .output
                .trace_dir
                .clone()
                .unwrap_or_else(|| "_trace".to_string());
            Some(if Path::new(&dir).is_absolute() {
                PathBuf::from(dir)
            } else {
                output_dir.join(dir)
            })
        } else {
            None
        };

        let prompts = PromptSet::load(&cfg_path, &file_cfg.prompts).context("load prompts")?;

        let job = JobConfig {
            translation_mode: mode,
            chunk_char_budget: DEFAULT_CHUNK_CHAR_BUDGET,
            max_blocks_per_chunk,
            target_language_instruction,
            model_id,
            service_base_url,
            credential,
            request_timeout: Some(Duration::from_secs(
                file_cfg.service.timeout_secs.unwrap_or(300).max(1),
            )),
            trace_dir,
            prompts,
        };

        Ok(Self {
            job,
            config_path: cfg_file.filter(|p| p.exists()),
            autosave: args.autosave || file_cfg.output.autosave.unwrap_or(false),
            autosave_suffix: file_cfg
                .output
                .autosave_suffix
                .clone()
                .unwrap_or_else(|| DEFAULT_AUTOSAVE_SUFFIX.to_string()),
        })
    }
}

pub fn init_default_config(dir: &Path, force: bool) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create config dir: {}", dir.display()))?;
    let cfg_path = dir.join(CONFIG_FILENAME);

    let prompts_dir = dir.join(DEFAULT_PROMPTS_DIR);
    std::fs::create_dir_all(&prompts_dir)
        .with_context(|| format!("create prompts dir: {}", prompts_dir.display()))?;

    for (fname, body) in default_prompt_files() {
        let p = prompts_dir.join(fname);
        if p.exists() && !force {
            continue;
        }
        std::fs::write(&p, body).with_context(|| format!("write prompt: {}", p.display()))?;
    }

    if cfg_path.exists() && !force {
        return Ok(cfg_path);
    }

    std::fs::write(&cfg_path, DEFAULT_CONFIG_TOML)
        .with_context(|| format!("write config: {}", cfg_path.display()))?;
    Ok(cfg_path)
}

const DEFAULT_CONFIG_TOML: &str = r#"[job]
# "bilingual" keeps the original text and adds the translation beside it;
# "replace" overwrites the original.
mode = "bilingual"
target_language = "Translate into Simplified Chinese."
model = "gemini-2.5-flash"
# 0 = no limit on paragraphs per request.
max_blocks_per_chunk = 0

[service]
# base_url = "https://generativelanguage.googleapis.com"
api_key_env = "GEMINI_API_KEY"
timeout_secs = 300

[prompts]
context = "prompts/context.txt"
translate = "prompts/translate.txt"

[output]
autosave = false
autosave_suffix = "_partial.epub"
trace_dir = "_trace"
trace_prompts = false
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    #[test]
    fn default_config_text_parses() {
        let cfg = parse_config(DEFAULT_CONFIG_TOML).unwrap();
        assert_eq!(cfg.job.mode.as_deref(), Some("bilingual"));
        assert_eq!(cfg.job.max_blocks_per_chunk, Some(0));
        assert_eq!(cfg.output.autosave_suffix.as_deref(), Some(DEFAULT_AUTOSAVE_SUFFIX));
    }

    #[test]
    fn cli_overrides_win_and_zero_cap_means_unbounded() {
        let dir = std::env::temp_dir().join(format!("epub-translator-cfg-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cfg_path = dir.join(CONFIG_FILENAME);
        std::fs::write(
            &cfg_path,
            "[job]\nmode = \"replace\"\nmodel = \"file-model\"\nmax_blocks_per_chunk = 0\n[service]\napi_key = \"file-key\"\napi_key_env = \"EPUB_TRANSLATOR_TEST_UNSET_KEY\"\n",
        )
        .unwrap();

        let run = RunConfig::from_paths_and_args(
            &dir.join("book.epub"),
            &dir.join("book_translated.epub"),
            CliOverrides {
                config_path: Some(cfg_path.clone()),
                model: Some("cli-model".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(run.job.translation_mode, TranslationMode::Replace);
        assert_eq!(run.job.model_id, "cli-model");
        assert_eq!(run.job.max_blocks_per_chunk, None);
        assert_eq!(run.job.credential, "file-key");
        assert_eq!(run.job.chunk_char_budget, DEFAULT_CHUNK_CHAR_BUDGET);
        assert!(run.job.trace_dir.is_none());
        assert!(!run.autosave);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn init_writes_config_and_prompts() {
        let dir = std::env::temp_dir().join(format!("epub-translator-init-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let path = init_default_config(&dir, false).unwrap();
        assert!(path.exists());
        assert!(dir.join("prompts").join("translate.txt").exists());
        let loaded = PromptSet::load(&path, &crate::config::load_config(&path).unwrap().prompts).unwrap();
        assert_eq!(loaded, PromptSet::default());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
