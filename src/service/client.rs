use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::{GenerationRequest, GenerationService, Turn, TurnKind};
use crate::epub::chunk::{Chunk, BLOCK_SEPARATOR};
use crate::error::{TranslateError, TranslateResult};
use crate::pipeline::prompts::{render_template, PromptSet};

pub const RESULT_FIELD: &str = "translation_paragraphs";

/// `{translation_paragraphs: [string]}`
pub fn translation_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            RESULT_FIELD: {
                "type": "array",
                "items": { "type": "string" }
            }
        },
        "required": [RESULT_FIELD]
    })
}

#[derive(Deserialize)]
struct TranslationPayload {
    translation_paragraphs: Vec<String>,
}

/// Validate a raw response against the result schema. Anything else is a contract
/// violation; nothing is repaired.
pub fn parse_translation_payload(raw: &str) -> TranslateResult<Vec<String>> {
    serde_json::from_str::<TranslationPayload>(raw.trim())
        .map(|p| p.translation_paragraphs)
        .map_err(|e| TranslateError::contract(format!("response does not match schema: {e}")))
}

/// Turns chunks into requests, sends them and validates the answers.
pub struct TranslationClient<S> {
    service: S,
    model_id: String,
    language_instruction: String,
    prompts: PromptSet,
}

impl<S: GenerationService> TranslationClient<S> {
    pub fn new(
        service: S,
        model_id: impl Into<String>,
        language_instruction: impl Into<String>,
        prompts: PromptSet,
    ) -> Self {
        Self {
            service,
            model_id: model_id.into(),
            language_instruction: language_instruction.into(),
            prompts,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Build the request for `chunk`. Neighbouring chunk text, when given, goes into a
    /// leading context turn that is explicitly marked as not to be translated.
    pub fn build_request(
        &self,
        chunk: &Chunk,
        preceding: Option<&str>,
        following: Option<&str>,
    ) -> GenerationRequest {
        let mut turns = Vec::with_capacity(2);

        let mut context = String::new();
        if let Some(before) = preceding.filter(|s| !s.trim().is_empty()) {
            context.push_str("PRECEDING TEXT:\n");
            context.push_str(before);
            context.push_str("\n\n");
        }
        if let Some(after) = following.filter(|s| !s.trim().is_empty()) {
            context.push_str("FOLLOWING TEXT:\n");
            context.push_str(after);
            context.push_str("\n\n");
        }
        if !context.is_empty() {
            turns.push(Turn {
                kind: TurnKind::Context,
                text: render_template(&self.prompts.context, &[("context", context.trim_end())]),
            });
        }

        let count = chunk.len().to_string();
        let paragraphs = chunk.texts().join(BLOCK_SEPARATOR);
        turns.push(Turn {
            kind: TurnKind::Content,
            text: render_template(
                &self.prompts.translate,
                &[
                    ("language_instruction", self.language_instruction.as_str()),
                    ("count", count.as_str()),
                    ("field", RESULT_FIELD),
                    ("paragraphs", paragraphs.as_str()),
                ],
            ),
        });

        GenerationRequest {
            model: self.model_id.clone(),
            turns,
            response_schema: translation_schema(),
            expected_items: chunk.len(),
        }
    }

    /// Send a built request, aborting it as soon as `cancel` fires.
    pub async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> TranslateResult<String> {
        if cancel.is_cancelled() {
            return Err(TranslateError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TranslateError::Cancelled),
            raw = self.service.generate(request) => raw,
        }
    }

    /// Translate one chunk: build, send, validate.
    pub async fn translate(
        &self,
        chunk: &Chunk,
        preceding: Option<&str>,
        following: Option<&str>,
        cancel: &CancellationToken,
    ) -> TranslateResult<Vec<String>> {
        let request = self.build_request(chunk, preceding, following);
        let raw = self.generate(&request, cancel).await?;
        parse_translation_payload(&raw)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::epub::chunk::chunk_blocks;
    use crate::epub::extract::extract_blocks;
    use crate::epub::tree::Document;

    struct Scripted {
        reply: String,
        seen: Mutex<Vec<GenerationRequest>>,
    }

    #[async_trait]
    impl GenerationService for Scripted {
        async fn generate(&self, request: &GenerationRequest) -> TranslateResult<String> {
            self.seen.lock().unwrap().push(request.clone());
            Ok(self.reply.clone())
        }
    }

    struct Hanging {
        started: AtomicUsize,
    }

    #[async_trait]
    impl GenerationService for Hanging {
        async fn generate(&self, _request: &GenerationRequest) -> TranslateResult<String> {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(String::new())
        }
    }

    fn chunk() -> Chunk {
        let doc = Document::parse("c.xhtml", b"<html><body><p>One.</p><p>Two.</p></body></html>")
            .expect("parse");
        chunk_blocks(&extract_blocks(&doc), 4096, None).remove(0)
    }

    fn client<S: GenerationService>(service: S) -> TranslationClient<S> {
        TranslationClient::new(service, "test-model", "Translate into French.", PromptSet::default())
    }

    #[test]
    fn request_carries_context_then_content() {
        let c = client(Scripted {
            reply: String::new(),
            seen: Mutex::new(Vec::new()),
        });
        let req = c.build_request(&chunk(), Some("Before."), Some("After."));
        assert_eq!(req.model, "test-model");
        assert_eq!(req.expected_items, 2);
        assert_eq!(req.turns.len(), 2);
        assert_eq!(req.turns[0].kind, TurnKind::Context);
        assert!(req.turns[0].text.contains("PRECEDING TEXT:\nBefore."));
        assert!(req.turns[0].text.contains("FOLLOWING TEXT:\nAfter."));
        let content = &req.turns[1].text;
        assert!(content.contains("Translate into French."));
        assert!(content.contains("One.\n\nTwo."));
        assert!(content.contains("exactly 2"));
        assert!(!content.contains("Before."));

        let req = c.build_request(&chunk(), None, None);
        assert_eq!(req.turns.len(), 1);
        assert_eq!(req.turns[0].kind, TurnKind::Content);
    }

    #[test]
    fn payload_validation_is_strict() {
        assert_eq!(
            parse_translation_payload(r#" {"translation_paragraphs": ["a", "b"]} "#).unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
        for bad in [
            r#"{"paragraphs": ["a"]}"#,
            r#"{"translation_paragraphs": [1, 2]}"#,
            r#"["a"]"#,
            "not json",
        ] {
            let err = parse_translation_payload(bad).unwrap_err();
            assert!(matches!(err, TranslateError::GenerationContractViolation { .. }), "{bad}");
        }
    }

    #[tokio::test]
    async fn translate_returns_ordered_array() {
        let service = Arc::new(Scripted {
            reply: r#"{"translation_paragraphs": ["Un.", "Deux."]}"#.to_string(),
            seen: Mutex::new(Vec::new()),
        });
        let c = client(service.clone());
        let out = c
            .translate(&chunk(), None, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, vec!["Un.".to_string(), "Deux.".to_string()]);
        assert_eq!(service.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancellation_aborts_in_flight_request() {
        let service = Arc::new(Hanging {
            started: AtomicUsize::new(0),
        });
        let c = client(service.clone());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = c.translate(&chunk(), None, None, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(service.started.load(Ordering::SeqCst), 1);

        // Already-cancelled token never reaches the service.
        let err = c.translate(&chunk(), None, None, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(service.started.load(Ordering::SeqCst), 1);
    }
}
