//! Contract with the external structured-generation service.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::TranslateResult;

pub mod client;
pub mod gemini;

pub use client::{parse_translation_payload, translation_schema, TranslationClient};
pub use gemini::GeminiService;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    /// Neighbouring text supplied for reference only.
    Context,
    /// The blocks to translate plus the output instructions.
    Content,
}

/// One user turn of a request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Turn {
    pub kind: TurnKind,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub model: String,
    pub turns: Vec<Turn>,
    /// JSON Schema (lower-case type names) the response must satisfy.
    pub response_schema: serde_json::Value,
    /// Number of strings the response array must hold.
    pub expected_items: usize,
}

impl GenerationRequest {
    /// Human-readable dump for trace files.
    pub fn render(&self) -> String {
        let mut out = format!("MODEL: {}\nEXPECTED_ITEMS: {}\n", self.model, self.expected_items);
        for (i, turn) in self.turns.iter().enumerate() {
            out.push_str(&format!("\n--- turn {i} ({:?}) ---\n", turn.kind));
            out.push_str(&turn.text);
            out.push('\n');
        }
        out
    }
}

/// A backend able to answer one schema-constrained request.
///
/// Implementations return the raw response text; validation against the schema is done by
/// [`TranslationClient`]. Dropping the returned future must abort the request.
#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> TranslateResult<String>;
}

#[async_trait]
impl<S: GenerationService + ?Sized> GenerationService for std::sync::Arc<S> {
    async fn generate(&self, request: &GenerationRequest) -> TranslateResult<String> {
        (**self).generate(request).await
    }
}

#[async_trait]
impl<S: GenerationService + ?Sized> GenerationService for Box<S> {
    async fn generate(&self, request: &GenerationRequest) -> TranslateResult<String> {
        (**self).generate(request).await
    }
}
