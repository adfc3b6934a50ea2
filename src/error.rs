use thiserror::Error;

pub type TranslateResult<T> = Result<T, TranslateError>;

/// Failures surfaced by the translation job.
///
/// `MissingDocument` and `Markup` are recoverable inside the job loop (the document is
/// skipped); everything else aborts the job. `Cancelled` is kept apart from genuine
/// failures so callers can tell "stopped by request" from "stopped by error".
#[derive(Error, Debug)]
pub enum TranslateError {
    #[error("malformed archive: {0}")]
    MalformedArchive(String),

    #[error("missing document: {path}")]
    MissingDocument { path: String },

    #[error("unparsable markup in {document}: {detail}")]
    Markup { document: String, detail: String },

    #[error(
        "generation contract violation{}: {detail}",
        fmt_location(.document, .chunk)
    )]
    GenerationContractViolation {
        document: Option<String>,
        chunk: Option<usize>,
        detail: String,
    },

    #[error("job cancelled")]
    Cancelled,

    #[error("generation service returned HTTP {status}: {body}")]
    Service { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TranslateError {
    pub fn contract(detail: impl Into<String>) -> Self {
        Self::GenerationContractViolation {
            document: None,
            chunk: None,
            detail: detail.into(),
        }
    }

    /// Attach the offending document/chunk to a contract violation. Other variants pass through.
    pub fn at_chunk(self, document: &str, chunk: usize) -> Self {
        match self {
            Self::GenerationContractViolation { detail, .. } => Self::GenerationContractViolation {
                document: Some(document.to_string()),
                chunk: Some(chunk),
                detail,
            },
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Errors the job loop treats as "skip this document" rather than fatal.
    pub fn is_document_skip(&self) -> bool {
        matches!(self, Self::MissingDocument { .. } | Self::Markup { .. })
    }
}

fn fmt_location(document: &Option<String>, chunk: &Option<usize>) -> String {
    match (document.as_deref(), *chunk) {
        (Some(d), Some(c)) => format!(" in {d} (chunk {c})"),
        (Some(d), None) => format!(" in {d}"),
        (None, Some(c)) => format!(" (chunk {c})"),
        (None, None) => String::new(),
    }
}
