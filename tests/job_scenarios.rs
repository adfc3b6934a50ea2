use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use epub_translator::epub::apply::TranslationMode;
use epub_translator::epub::package::EpubArchive;
use epub_translator::pipeline::{JobConfig, JobController, JobNote, JobPhase};
use epub_translator::service::{GenerationRequest, GenerationService, TurnKind};
use epub_translator::{TranslateError, TranslateResult};

const CONTAINER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<container xmlns="urn:oasis:names:tc:opendocument:xmlns:container" version="1.0">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;

fn opf(ids: &[&str]) -> String {
    let items: String = ids
        .iter()
        .map(|id| format!(r#"<item id="{id}" href="text/{id}.xhtml" media-type="application/xhtml+xml"/>"#))
        .collect();
    let refs: String = ids
        .iter()
        .map(|id| format!(r#"<itemref idref="{id}"/>"#))
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0" unique-identifier="id">
  <metadata/>
  <manifest>{items}</manifest>
  <spine>{refs}</spine>
</package>"#
    )
}

fn xhtml(body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml"><head><title>t</title></head><body>{body}</body></html>"#
    )
}

/// In-memory EPUB with one content document per `(id, body)`.
fn epub(docs: &[(&str, &str)]) -> Vec<u8> {
    let ids: Vec<&str> = docs.iter().map(|(id, _)| *id).collect();
    let mut zout = ZipWriter::new(Cursor::new(Vec::new()));
    let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    let deflated = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    zout.start_file("mimetype", stored).unwrap();
    zout.write_all(b"application/epub+zip").unwrap();
    zout.start_file("META-INF/container.xml", deflated).unwrap();
    zout.write_all(CONTAINER.as_bytes()).unwrap();
    zout.start_file("OEBPS/content.opf", deflated).unwrap();
    zout.write_all(opf(&ids).as_bytes()).unwrap();
    for (id, body) in docs {
        zout.start_file(format!("OEBPS/text/{id}.xhtml"), deflated).unwrap();
        zout.write_all(xhtml(body).as_bytes()).unwrap();
    }
    zout.finish().unwrap().into_inner()
}

fn entry_text(archive: &[u8], path: &str) -> String {
    let archive = EpubArchive::from_bytes(archive).unwrap();
    String::from_utf8(archive.read_entry(path).unwrap().to_vec()).unwrap()
}

#[derive(Clone, Copy)]
enum Reply {
    /// One "T<call>.<i>" per expected item.
    Full,
    /// Like `Full`, minus the last entry.
    ShortByOne,
    /// A payload that does not match the schema.
    OffSchema,
    /// Like `Full` until the given call, then an HTTP 503 from the service.
    UnavailableFrom(usize),
}

/// Records every request. Calls from `hang_from` onwards never return.
struct MockService {
    reply: Reply,
    hang_from: Option<usize>,
    requests: Mutex<Vec<GenerationRequest>>,
    calls: AtomicUsize,
    hanging: Notify,
}

impl MockService {
    fn new(reply: Reply) -> Arc<Self> {
        Self::hanging_from(reply, None)
    }

    fn hanging_from(reply: Reply, hang_from: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            reply,
            hang_from,
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            hanging: Notify::new(),
        })
    }

    fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationService for MockService {
    async fn generate(&self, request: &GenerationRequest) -> TranslateResult<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        if self.hang_from.is_some_and(|n| call >= n) {
            self.hanging.notify_one();
            std::future::pending::<()>().await;
        }
        let n = match self.reply {
            Reply::UnavailableFrom(n) if call >= n => {
                return Err(TranslateError::Service {
                    status: 503,
                    body: "unavailable".to_string(),
                })
            }
            Reply::Full | Reply::UnavailableFrom(_) => request.expected_items,
            Reply::ShortByOne => request.expected_items.saturating_sub(1),
            Reply::OffSchema => return Ok(r#"{"paragraphs": "nope"}"#.to_string()),
        };
        let items: Vec<String> = (0..n).map(|i| format!("T{call}.{i}")).collect();
        Ok(serde_json::json!({ "translation_paragraphs": items }).to_string())
    }
}

fn config(mode: TranslationMode) -> JobConfig {
    JobConfig {
        translation_mode: mode,
        chunk_char_budget: 4096,
        ..Default::default()
    }
}

fn content_turn(req: &GenerationRequest) -> &str {
    &req
        .turns
        .iter()
        .find(|t| t.kind == TurnKind::Content)
        .unwrap()
        .text
}

fn context_turn(req: &GenerationRequest) -> Option<&str> {
    req.turns
        .iter()
        .find(|t| t.kind == TurnKind::Context)
        .map(|t| t.text.as_str())
}

#[tokio::test]
async fn greedy_packing_splits_at_the_budget_and_passes_neighbours_as_context() {
    let (p1, p2, p3) = ("a".repeat(10), "b".repeat(4000), "c".repeat(100));
    let body = format!("<p>{p1}</p><p>{p2}</p><p>{p3}</p>");
    let service = MockService::new(Reply::Full);
    let controller = JobController::new(config(TranslationMode::Bilingual), service.clone());

    let report = controller.start(&epub(&[("ch1", &body)])).await.unwrap();
    assert_eq!(report.chunks_translated, 2);

    let reqs = service.requests();
    assert_eq!(reqs.len(), 2);
    assert_eq!(reqs[0].expected_items, 2);
    assert_eq!(reqs[1].expected_items, 1);

    let first = content_turn(&reqs[0]);
    assert!(first.contains(&format!("{p1}\n\n{p2}")));
    assert!(!first.contains(&p3));
    assert!(context_turn(&reqs[0]).unwrap().contains(&p3));

    assert!(content_turn(&reqs[1]).contains(&p3));
    assert!(!content_turn(&reqs[1]).contains(&p1));
    assert!(context_turn(&reqs[1]).unwrap().contains(&format!("{p1}\n\n{p2}")));
}

#[tokio::test]
async fn oversized_paragraph_goes_alone() {
    let body = format!("<p>{}</p>", "x".repeat(9000));
    let service = MockService::new(Reply::Full);
    let controller = JobController::new(config(TranslationMode::Replace), service.clone());

    let report = controller.start(&epub(&[("ch1", &body)])).await.unwrap();
    let reqs = service.requests();
    assert_eq!(reqs.len(), 1);
    assert_eq!(reqs[0].expected_items, 1);
    assert!(context_turn(&reqs[0]).is_none());
    assert!(entry_text(&report.archive, "OEBPS/text/ch1.xhtml").contains("<p>T0.0</p>"));
}

#[tokio::test]
async fn short_result_array_empties_the_tail_and_is_reported() {
    let service = MockService::new(Reply::ShortByOne);
    let controller = JobController::new(config(TranslationMode::Replace), service.clone());

    let report = controller
        .start(&epub(&[("ch1", "<p>One.</p><p>Two.</p><p>Three.</p>")]))
        .await
        .unwrap();
    assert!(report.is_degraded());
    assert_eq!(
        report.notes,
        vec![JobNote::ResultCountMismatch {
            document: "OEBPS/text/ch1.xhtml".to_string(),
            chunk: 0,
            expected: 3,
            received: 2,
        }]
    );
    assert!(report.status_text().contains("DEGRADED"));

    let doc = entry_text(&report.archive, "OEBPS/text/ch1.xhtml");
    assert!(doc.contains("<p>T0.0</p><p>T0.1</p><p></p>"));
}

#[tokio::test]
async fn cancel_mid_chunk_keeps_finished_documents_and_leaves_the_current_one_untouched() {
    // ch1 takes call 0; ch2 is split in two chunks, the second of which hangs.
    let mut cfg = config(TranslationMode::Replace);
    cfg.max_blocks_per_chunk = Some(1);
    let service = MockService::hanging_from(Reply::Full, Some(2));
    let controller = Arc::new(JobController::new(cfg, service.clone()));
    let handle = controller.handle();

    let input = epub(&[
        ("ch1", "<p>First document.</p>"),
        ("ch2", "<p>Second A.</p><p>Second B.</p>"),
        ("ch3", "<p>Third.</p>"),
    ]);
    let original = entry_text(&input, "OEBPS/text/ch2.xhtml");

    let job = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.start(&input).await })
    };
    service.hanging.notified().await;
    assert_eq!(
        handle.phase(),
        JobPhase::ChunkTranslating {
            document: 1,
            chunk: 1
        }
    );
    handle.request_cancel();

    let err = job.await.unwrap().unwrap_err();
    assert!(matches!(err, TranslateError::Cancelled));
    assert_eq!(handle.phase(), JobPhase::Cancelled);
    assert_eq!(service.calls.load(Ordering::SeqCst), 3);

    let partial = handle.partial_archive().unwrap();
    assert!(entry_text(&partial, "OEBPS/text/ch1.xhtml").contains("<p>T0.0</p>"));
    assert_eq!(entry_text(&partial, "OEBPS/text/ch2.xhtml"), original);
    assert_eq!(handle.latest_snapshot().unwrap().document_index, 0);
}

#[tokio::test]
async fn pause_holds_between_documents_until_resume() {
    let service = MockService::new(Reply::Full);
    let snapshots = Arc::new(AtomicUsize::new(0));
    let counter = snapshots.clone();
    let controller = Arc::new(
        JobController::new(config(TranslationMode::Bilingual), service.clone()).on_progress(
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        ),
    );
    let handle = controller.handle();
    handle.request_pause();

    let input = epub(&[("ch1", "<p>One.</p>"), ("ch2", "<p>Two.</p>")]);
    let job = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.start(&input).await })
    };

    let mut waited = 0;
    while handle.phase() != (JobPhase::Paused { after: 0 }) {
        assert!(waited < 500, "job never paused");
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += 1;
    }
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(service.calls.load(Ordering::SeqCst), 1);
    assert_eq!(snapshots.load(Ordering::SeqCst), 1);
    assert!(handle.partial_archive().is_some());

    handle.resume();
    let report = job.await.unwrap().unwrap();
    assert_eq!(report.documents_translated, 2);
    assert_eq!(snapshots.load(Ordering::SeqCst), 2);
    assert_eq!(handle.phase(), JobPhase::Complete);
}

#[tokio::test]
async fn cancel_while_paused_stops_the_job() {
    let service = MockService::new(Reply::Full);
    let controller = Arc::new(JobController::new(config(TranslationMode::Bilingual), service.clone()));
    let handle = controller.handle();
    handle.request_pause();

    let input = epub(&[("ch1", "<p>One.</p>"), ("ch2", "<p>Two.</p>")]);
    let job = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.start(&input).await })
    };
    while handle.phase() != (JobPhase::Paused { after: 0 }) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.request_cancel();
    let err = job.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(service.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn off_schema_response_fails_the_job_with_its_location() {
    let service = MockService::new(Reply::OffSchema);
    let controller = JobController::new(config(TranslationMode::Replace), service.clone());
    let handle = controller.handle();

    let err = controller
        .start(&epub(&[("ch1", "<p>One.</p>")]))
        .await
        .unwrap_err();
    match err {
        TranslateError::GenerationContractViolation {
            document, chunk, ..
        } => {
            assert_eq!(document.as_deref(), Some("OEBPS/text/ch1.xhtml"));
            assert_eq!(chunk, Some(0));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(handle.phase(), JobPhase::Failed);
    assert_eq!(service.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn service_error_keeps_the_finished_documents_in_the_partial_archive() {
    let service = MockService::new(Reply::UnavailableFrom(1));
    let controller = JobController::new(config(TranslationMode::Replace), service.clone());
    let handle = controller.handle();

    let input = epub(&[("ch1", "<p>One.</p>"), ("ch2", "<p>Two.</p>")]);
    let err = controller.start(&input).await.unwrap_err();
    assert!(
        matches!(&err, TranslateError::Service { status: 503, body } if body == "unavailable"),
        "unexpected error: {err}"
    );
    assert_eq!(handle.phase(), JobPhase::Failed);
    assert_eq!(service.calls.load(Ordering::SeqCst), 2);

    let partial = handle.partial_archive().expect("partial archive after ch1");
    assert!(entry_text(&partial, "OEBPS/text/ch1.xhtml").contains("<p>T0.0</p>"));
    assert_eq!(
        entry_text(&partial, "OEBPS/text/ch2.xhtml"),
        entry_text(&input, "OEBPS/text/ch2.xhtml")
    );
}

#[tokio::test]
async fn unreadable_documents_are_skipped() {
    let service = MockService::new(Reply::Full);
    let controller = JobController::new(config(TranslationMode::Bilingual), service.clone());

    let report = controller
        .start(&epub(&[("ch1", "<p>Broken</div>"), ("ch2", "<h2>Fine</h2>")]))
        .await
        .unwrap();
    assert_eq!(report.documents_translated, 1);
    assert_eq!(report.documents_skipped, 1);
    assert!(matches!(
        &report.notes[0],
        JobNote::DocumentSkipped { document, .. } if document == "OEBPS/text/ch1.xhtml"
    ));
    let ch2 = entry_text(&report.archive, "OEBPS/text/ch2.xhtml");
    assert!(ch2.contains(r#"<h2>Fine</h2><h2 class="epub-translator-text" data-epub-translator="true">T0.0</h2>"#));
}
