use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

use super::config::JobConfig;
use super::gate::PauseGate;
use super::trace::TraceWriter;
use crate::epub::apply::apply_chunk;
use crate::epub::chunk::{chunk_blocks, Chunk};
use crate::epub::extract::extract_blocks;
use crate::epub::manifest::resolve_spine;
use crate::epub::package::EpubArchive;
use crate::epub::tree::Document;
use crate::error::{TranslateError, TranslateResult};
use crate::service::{parse_translation_payload, GenerationService, TranslationClient};
use crate::textutil::preview;

/// Where the job currently is. Indices are positions in the reading order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum JobPhase {
    #[default]
    Idle,
    Initializing,
    Unpacking,
    ProcessingDocument { index: usize },
    ChunkTranslating { document: usize, chunk: usize },
    Applying { document: usize },
    Rewriting { document: usize },
    /// Waiting at the gate after `after` finished.
    Paused { after: usize },
    Repacking,
    Complete,
    Cancelled,
    Failed,
}

/// Emitted once per document, translated or skipped.
#[derive(Clone, Debug)]
pub struct ProgressSnapshot {
    pub document_path: String,
    pub document_index: usize,
    pub total_documents: usize,
    pub status_text: String,
    /// The whole archive as it stands after this document.
    pub partial_archive: Arc<Vec<u8>>,
    /// Body markup of the document just written; `None` when it was skipped.
    pub last_document_html_preview: Option<String>,
}

/// Something the caller should know about that did not stop the job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobNote {
    /// The service returned `received` entries for a chunk of `expected` blocks.
    ResultCountMismatch {
        document: String,
        chunk: usize,
        expected: usize,
        received: usize,
    },
    DocumentSkipped { document: String, reason: String },
    NoBlocks { document: String },
}

impl JobNote {
    /// A short result array: some blocks got no translation. Extra entries lose nothing.
    pub fn is_degradation(&self) -> bool {
        matches!(
            self,
            Self::ResultCountMismatch { expected, received, .. } if received < expected
        )
    }
}

impl fmt::Display for JobNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResultCountMismatch {
                document,
                chunk,
                expected,
                received,
            } => write!(
                f,
                "{document} chunk {chunk}: expected {expected} translations, got {received}"
            ),
            Self::DocumentSkipped { document, reason } => write!(f, "{document} skipped: {reason}"),
            Self::NoBlocks { document } => write!(f, "{document}: nothing to translate"),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct JobReport {
    pub archive: Vec<u8>,
    pub notes: Vec<JobNote>,
    pub documents_total: usize,
    pub documents_translated: usize,
    pub documents_skipped: usize,
    pub chunks_translated: usize,
}

impl JobReport {
    /// True when some block was left without a translation because the service returned
    /// fewer entries than the chunk had blocks.
    pub fn is_degraded(&self) -> bool {
        self.notes.iter().any(JobNote::is_degradation)
    }

    pub fn status_text(&self) -> String {
        let mut s = format!(
            "translated {}/{} documents ({} chunks), {} skipped",
            self.documents_translated,
            self.documents_total,
            self.chunks_translated,
            self.documents_skipped
        );
        let mismatches = self.notes.iter().filter(|n| n.is_degradation()).count();
        if mismatches > 0 {
            s.push_str(&format!(
                "; DEGRADED: {mismatches} chunk(s) with missing translations"
            ));
        }
        s
    }
}

#[derive(Default)]
struct SharedState {
    phase: JobPhase,
    snapshot: Option<ProgressSnapshot>,
}

/// Control surface for a running job. Cheap to clone and safe to use from other tasks.
#[derive(Clone)]
pub struct JobHandle {
    cancel: CancellationToken,
    gate: Arc<PauseGate>,
    shared: Arc<Mutex<SharedState>>,
}

impl JobHandle {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            gate: Arc::new(PauseGate::new()),
            shared: Arc::new(Mutex::new(SharedState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, SharedState> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Abort the job at the next checkpoint; an in-flight request is dropped.
    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    /// Stop at the next document boundary. Never interrupts a chunk.
    pub fn request_pause(&self) {
        self.gate.pause();
    }

    pub fn resume(&self) {
        self.gate.resume();
    }

    pub fn phase(&self) -> JobPhase {
        self.state().phase
    }

    pub fn latest_snapshot(&self) -> Option<ProgressSnapshot> {
        self.state().snapshot.clone()
    }

    /// Archive bytes as of the last finished document.
    pub fn partial_archive(&self) -> Option<Arc<Vec<u8>>> {
        self.state()
            .snapshot
            .as_ref()
            .map(|s| s.partial_archive.clone())
    }

    fn set_phase(&self, phase: JobPhase) {
        self.state().phase = phase;
    }

    fn store_snapshot(&self, snapshot: ProgressSnapshot) {
        self.state().snapshot = Some(snapshot);
    }
}

type ProgressCallback = Box<dyn Fn(&ProgressSnapshot) + Send + Sync>;

enum DocumentOutcome {
    Translated { chunks: usize, preview: Option<String> },
    NoBlocks,
}

/// Runs one translation job over one archive, strictly one request at a time.
pub struct JobController<S> {
    config: JobConfig,
    client: TranslationClient<S>,
    handle: JobHandle,
    on_progress: Option<ProgressCallback>,
}

impl<S: GenerationService> JobController<S> {
    pub fn new(config: JobConfig, service: S) -> Self {
        let client = TranslationClient::new(
            service,
            config.model_id.clone(),
            config.target_language_instruction.clone(),
            config.prompts.clone(),
        );
        Self {
            config,
            client,
            handle: JobHandle::new(),
            on_progress: None,
        }
    }

    pub fn on_progress(mut self, cb: impl Fn(&ProgressSnapshot) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Box::new(cb));
        self
    }

    pub fn handle(&self) -> JobHandle {
        self.handle.clone()
    }

    /// Translate `input` (EPUB bytes) and return the finished archive.
    ///
    /// On cancellation or failure the archive from the last finished document stays
    /// available through [`JobHandle::partial_archive`].
    pub async fn start(&self, input: &[u8]) -> TranslateResult<JobReport> {
        let result = self.run(input).await;
        match &result {
            Ok(report) => {
                tracing::info!(status = %report.status_text(), "job complete");
                self.handle.set_phase(JobPhase::Complete);
            }
            Err(e) if e.is_cancelled() => {
                tracing::info!("job cancelled");
                self.handle.set_phase(JobPhase::Cancelled);
            }
            Err(e) => {
                tracing::error!(error = %e, "job failed");
                self.handle.set_phase(JobPhase::Failed);
            }
        }
        result
    }

    async fn run(&self, input: &[u8]) -> TranslateResult<JobReport> {
        self.handle.set_phase(JobPhase::Initializing);
        let trace = self.open_trace();

        self.handle.set_phase(JobPhase::Unpacking);
        let mut archive = EpubArchive::from_bytes(input)?;
        let spine = resolve_spine(&archive)?;
        let total = spine.len();
        tracing::info!(
            documents = total,
            mode = self.config.translation_mode.as_str(),
            model = self.client.model_id(),
            "reading order resolved"
        );

        let mut report = JobReport {
            documents_total: total,
            ..Default::default()
        };

        for (index, path) in spine.iter().enumerate() {
            if self.handle.cancel.is_cancelled() {
                return Err(TranslateError::Cancelled);
            }
            self.handle
                .set_phase(JobPhase::ProcessingDocument { index });

            let (status_text, preview_markup) = match self
                .process_document(&mut archive, index, path, trace.as_ref(), &mut report)
                .await
            {
                Ok(DocumentOutcome::Translated { chunks, preview }) => {
                    report.documents_translated += 1;
                    (format!("translated {path} ({chunks} chunks)"), preview)
                }
                Ok(DocumentOutcome::NoBlocks) => {
                    tracing::debug!(document = path, "no translatable blocks");
                    report.documents_skipped += 1;
                    report.notes.push(JobNote::NoBlocks {
                        document: path.to_string(),
                    });
                    (format!("skipped {path}: nothing to translate"), None)
                }
                Err(e) if e.is_document_skip() => {
                    tracing::warn!(document = path, error = %e, "document skipped");
                    report.documents_skipped += 1;
                    report.notes.push(JobNote::DocumentSkipped {
                        document: path.to_string(),
                        reason: e.to_string(),
                    });
                    (format!("skipped {path}: {e}"), None)
                }
                Err(e) => return Err(e),
            };

            let snapshot = ProgressSnapshot {
                document_path: path.to_string(),
                document_index: index,
                total_documents: total,
                status_text,
                partial_archive: Arc::new(archive.to_bytes()?),
                last_document_html_preview: preview_markup,
            };
            self.handle.store_snapshot(snapshot.clone());
            if let Some(cb) = self.on_progress.as_ref() {
                cb(&snapshot);
            }

            if index + 1 < total {
                let handle = &self.handle;
                handle
                    .gate
                    .wait_with(&handle.cancel, || {
                        tracing::info!(after = path, "paused");
                        handle.set_phase(JobPhase::Paused { after: index });
                    })
                    .await?;
            }
        }

        self.handle.set_phase(JobPhase::Repacking);
        report.archive = archive.to_bytes()?;
        Ok(report)
    }

    async fn process_document(
        &self,
        archive: &mut EpubArchive,
        index: usize,
        path: &str,
        trace: Option<&TraceWriter>,
        report: &mut JobReport,
    ) -> TranslateResult<DocumentOutcome> {
        let bytes = archive
            .read_entry(path)
            .ok_or_else(|| TranslateError::MissingDocument {
                path: path.to_string(),
            })?
            .to_vec();
        let mut doc = Document::parse(path, &bytes).map_err(|e| markup_error(path, e))?;

        let blocks = extract_blocks(&doc);
        if blocks.is_empty() {
            return Ok(DocumentOutcome::NoBlocks);
        }
        let chunks = chunk_blocks(
            &blocks,
            self.config.chunk_char_budget,
            self.config.max_blocks_per_chunk,
        );
        tracing::info!(
            document = path,
            index,
            blocks = blocks.len(),
            chunks = chunks.len(),
            "translating document"
        );

        // Neighbour context is always the untranslated text.
        let originals: Vec<String> = chunks.iter().map(Chunk::joined_text).collect();

        for (j, chunk) in chunks.iter().enumerate() {
            self.handle.set_phase(JobPhase::ChunkTranslating {
                document: index,
                chunk: j,
            });
            let preceding = j.checked_sub(1).map(|k| originals[k].as_str());
            let following = originals.get(j + 1).map(String::as_str);

            let request = self.client.build_request(chunk, preceding, following);
            if let Some(t) = trace {
                let _ = t.write_chunk_text(index, path, j, "request", &request.render());
            }
            let raw = self
                .client
                .generate(&request, &self.handle.cancel)
                .await
                .map_err(|e| e.at_chunk(path, j))?;
            if let Some(t) = trace {
                let _ = t.write_chunk_text(index, path, j, "response", &raw);
            }
            let result = parse_translation_payload(&raw).map_err(|e| e.at_chunk(path, j))?;

            self.handle
                .set_phase(JobPhase::Applying { document: index });
            let outcome = apply_chunk(&mut doc, chunk, &result, self.config.translation_mode)
                .map_err(|e| markup_error(path, e))?;
            if outcome.is_count_mismatch() {
                tracing::warn!(
                    document = path,
                    chunk = j,
                    expected = outcome.expected,
                    received = outcome.received,
                    "result count mismatch"
                );
                report.notes.push(JobNote::ResultCountMismatch {
                    document: path.to_string(),
                    chunk: j,
                    expected: outcome.expected,
                    received: outcome.received,
                });
            }
            report.chunks_translated += 1;
            tracing::debug!(
                document = path,
                chunk = j,
                chars = chunk.char_count,
                preview = %preview(&originals[j], 60),
                "chunk applied"
            );
        }

        self.handle
            .set_phase(JobPhase::Rewriting { document: index });
        let out = doc.to_bytes().map_err(|e| markup_error(path, e))?;
        archive.write_entry(path, out);
        let preview_markup = doc.body_markup().ok();
        Ok(DocumentOutcome::Translated {
            chunks: chunks.len(),
            preview: preview_markup,
        })
    }

    fn open_trace(&self) -> Option<TraceWriter> {
        let dir = self.config.trace_dir.clone()?;
        match TraceWriter::new(dir) {
            Ok(t) => {
                tracing::info!(dir = %t.dir().display(), "tracing requests");
                Some(t)
            }
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "trace disabled");
                None
            }
        }
    }
}

fn markup_error(path: &str, e: anyhow::Error) -> TranslateError {
    TranslateError::Markup {
        document: path.to_string(),
        detail: format!("{e:#}"),
    }
}
