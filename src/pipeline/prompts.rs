use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};

use crate::config::PromptsSection;

pub const DEFAULT_PROMPTS_DIR: &str = "prompts";

pub const DEFAULT_CONTEXT: &str = "context.txt";
pub const DEFAULT_TRANSLATE: &str = "translate.txt";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PromptSet {
    /// Wraps neighbouring chunk text. Placeholder: `{{context}}`.
    pub context: String,
    /// The chunk itself. Placeholders: `{{language_instruction}}`, `{{count}}`, `{{field}}`,
    /// `{{paragraphs}}`.
    pub translate: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            context: DEFAULT_CONTEXT_TEXT.to_string(),
            translate: DEFAULT_TRANSLATE_TEXT.to_string(),
        }
    }
}

impl PromptSet {
    /// Built-in prompts, with any file listed in `[prompts]` taking precedence.
    pub fn load(config_path: &Path, p: &PromptsSection) -> anyhow::Result<Self> {
        let config_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
        let defaults = Self::default();
        Ok(Self {
            context: read_prompt(config_dir, "context", p.context.as_deref())?
                .unwrap_or(defaults.context),
            translate: read_prompt(config_dir, "translate", p.translate.as_deref())?
                .unwrap_or(defaults.translate),
        })
    }
}

fn read_prompt(config_dir: &Path, key: &str, path: Option<&str>) -> anyhow::Result<Option<String>> {
    let Some(path) = path.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    let mut p = PathBuf::from(path);
    if p.is_relative() {
        p = config_dir.join(&p);
    }
    if !p.exists() {
        return Err(anyhow!(
            "prompt file not found for {key}: {} (run: epub-translator --init-config)",
            p.display()
        ));
    }
    let text = std::fs::read_to_string(&p).with_context(|| format!("read prompt: {}", p.display()))?;
    Ok(Some(text))
}

pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (k, v) in vars {
        let pat = format!("{{{{{k}}}}}");
        out = out.replace(&pat, v);
    }
    out
}

pub fn default_prompt_files() -> Vec<(&'static str, &'static str)> {
    vec![
        (DEFAULT_CONTEXT, DEFAULT_CONTEXT_TEXT),
        (DEFAULT_TRANSLATE, DEFAULT_TRANSLATE_TEXT),
    ]
}

pub const DEFAULT_CONTEXT_TEXT: &str = r#"The text below is CONTEXT ONLY, taken from the passages around the paragraphs you will be asked to translate next.
Do NOT translate it. Do NOT include any of it in your answer. Use it only to keep terminology, tone and meaning consistent.

{{context}}"#;

pub const DEFAULT_TRANSLATE_TEXT: &str = r#"{{language_instruction}}

Rules:
- Translate each of the {{count}} paragraphs below; paragraphs are separated by a blank line.
- Respond with JSON holding a single field "{{field}}": an array of exactly {{count}} strings.
- Entry i is the translation of paragraph i, in the same order. Do not merge, split, skip or reorder paragraphs.
- Plain text only: no HTML, no markup, no notes.

PARAGRAPHS:
{{paragraphs}}"#;
