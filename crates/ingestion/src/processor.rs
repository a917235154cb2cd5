//! Ingestion pipeline
//!
//! Turns an uploaded file into Markdown, chunks it and submits the chunks to
//! the knowledge base as one document:
//! 1. PDF text extraction, checked by the extractability heuristic
//! 2. Gemini OCR when the text layer is too thin or unreadable
//! 3. Markdown chunking
//! 4. `create-by-text` with chunks joined by the segment separator

use crate::chunker::{Chunker, ChunkingConfig};
use crate::errors::IngestionError;
use crate::extractability::{TextQuality, Thresholds};
use crate::markdown::{to_markdown, with_title};
use crate::ocr::OcrEngine;
use crate::pdf::PdfFile;
use condoportal_common::config::AppConfig;
use condoportal_common::dify::{KnowledgeBase, TextDocument};
use condoportal_common::metrics;
use condoportal_common::models::{ExtractionMethod, IngestionSummary};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Pipeline tuning, usually taken from [`AppConfig`]
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub thresholds: Thresholds,
    pub chunking: ChunkingConfig,
    /// Upper bound on page images sent to OCR per document
    pub max_ocr_images: usize,
    pub segment_separator: String,
    pub segment_max_tokens: u32,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            thresholds: Thresholds {
                min_chars_per_page: config.ingestion.min_chars_per_page,
                max_garbage_ratio: config.ingestion.max_garbage_ratio,
            },
            chunking: ChunkingConfig {
                chunk_size: config.ingestion.chunk_size,
                chunk_overlap: config.ingestion.chunk_overlap,
            },
            max_ocr_images: config.ingestion.max_ocr_images,
            segment_separator: config.dify.segment_separator.clone(),
            segment_max_tokens: config.dify.segment_max_tokens,
        }
    }
}

/// An uploaded file
#[derive(Debug, Clone, Copy)]
pub struct SourceFile<'a> {
    pub bytes: &'a [u8],
    pub content_type: &'a str,
    pub file_name: &'a str,
    pub title: &'a str,
}

/// Markdown and chunks ready for the knowledge base
#[derive(Debug, Clone)]
pub struct PreparedDocument {
    pub markdown: String,
    pub chunks: Vec<String>,
    pub method: ExtractionMethod,
    pub page_count: usize,
    /// Characters of Markdown produced
    pub characters: usize,
}

/// Result of a completed ingestion
#[derive(Debug, Clone, PartialEq)]
pub struct IngestionOutcome {
    pub knowledge_base_id: String,
    pub method: ExtractionMethod,
    pub page_count: usize,
    pub chunk_count: usize,
    pub characters: usize,
    pub markdown_len: usize,
}

impl IngestionOutcome {
    pub fn summary(&self) -> IngestionSummary {
        IngestionSummary {
            method: self.method,
            page_count: self.page_count as u32,
            chunk_count: self.chunk_count as u32,
            characters: self.characters as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceKind {
    Pdf,
    Markdown,
    PlainText,
}

/// Classify by media type, falling back to the file extension for generic types
fn source_kind(content_type: &str, file_name: &str) -> Option<SourceKind> {
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    match media_type.as_str() {
        "application/pdf" => return Some(SourceKind::Pdf),
        "text/markdown" | "text/x-markdown" | "application/markdown" => {
            return Some(SourceKind::Markdown)
        }
        t if t.starts_with("text/") => return Some(SourceKind::PlainText),
        "" | "application/octet-stream" => {}
        _ => return None,
    }

    let extension = file_name.rsplit_once('.')?.1.to_ascii_lowercase();
    match extension.as_str() {
        "pdf" => Some(SourceKind::Pdf),
        "md" | "markdown" => Some(SourceKind::Markdown),
        "txt" => Some(SourceKind::PlainText),
        _ => None,
    }
}

/// Whether the pipeline can ingest a file of this type
pub fn is_supported(content_type: &str, file_name: &str) -> bool {
    source_kind(content_type, file_name).is_some()
}

/// The ingestion pipeline
pub struct IngestionPipeline {
    settings: PipelineSettings,
    chunker: Chunker,
    ocr: Arc<dyn OcrEngine>,
    knowledge_base: Arc<dyn KnowledgeBase>,
}

impl IngestionPipeline {
    pub fn new(
        settings: PipelineSettings,
        ocr: Arc<dyn OcrEngine>,
        knowledge_base: Arc<dyn KnowledgeBase>,
    ) -> Result<Self, IngestionError> {
        let chunker = Chunker::new(settings.chunking)?;
        Ok(Self {
            settings,
            chunker,
            ocr,
            knowledge_base,
        })
    }

    /// Convert and chunk a file without storing it
    #[instrument(skip(self, source), fields(file = %source.file_name, bytes = source.bytes.len()))]
    pub async fn prepare(&self, source: SourceFile<'_>) -> Result<PreparedDocument, IngestionError> {
        let kind = source_kind(source.content_type, source.file_name)
            .ok_or_else(|| IngestionError::UnsupportedContentType(source.content_type.to_string()))?;

        let (markdown, method, page_count) = match kind {
            SourceKind::Pdf => self.pdf_to_markdown(source).await?,
            SourceKind::Markdown => {
                let text = String::from_utf8_lossy(source.bytes);
                (with_title(source.title, &text), ExtractionMethod::Text, 1)
            }
            SourceKind::PlainText => {
                let text = String::from_utf8_lossy(source.bytes);
                (to_markdown(source.title, &[text]), ExtractionMethod::Text, 1)
            }
        };

        let chunks = self.chunker.chunk(&markdown);
        if chunks.is_empty() {
            return Err(IngestionError::NoTextExtracted {
                file_name: source.file_name.to_string(),
            });
        }

        Ok(PreparedDocument {
            characters: markdown.chars().count(),
            markdown,
            chunks,
            method,
            page_count,
        })
    }

    async fn pdf_to_markdown(
        &self,
        source: SourceFile<'_>,
    ) -> Result<(String, ExtractionMethod, usize), IngestionError> {
        let pdf = PdfFile::load(source.bytes, source.file_name)?;
        let page_count = pdf.page_count();
        let pages = pdf.page_texts();

        let quality = TextQuality::measure(&pages);
        debug!(
            chars_per_page = quality.chars_per_page,
            garbage_ratio = quality.garbage_ratio,
            "Measured text layer"
        );

        if quality.is_sufficient(&self.settings.thresholds) {
            return Ok((to_markdown(source.title, &pages), ExtractionMethod::Text, page_count));
        }

        info!(
            file = %source.file_name,
            chars_per_page = quality.chars_per_page,
            garbage_ratio = quality.garbage_ratio,
            "Text layer insufficient, falling back to OCR"
        );

        let body = self.ocr_pdf(&pdf, source.bytes).await?;
        if body.trim().is_empty() {
            return Err(IngestionError::NoTextExtracted {
                file_name: source.file_name.to_string(),
            });
        }

        Ok((with_title(source.title, &body), ExtractionMethod::Ocr, page_count))
    }

    /// Page images when every page has one, otherwise the whole file
    async fn ocr_pdf(&self, pdf: &PdfFile, bytes: &[u8]) -> Result<String, IngestionError> {
        let images = pdf.page_jpegs(self.settings.max_ocr_images);

        if !images.is_empty() && images.iter().all(|page| !page.is_empty()) {
            metrics::record_ocr_fallback("images");
            let mut pages = Vec::with_capacity(images.len());
            for (number, page_images) in images.iter().enumerate() {
                let text = self.ocr.transcribe_images(page_images).await?;
                if text.trim().is_empty() {
                    warn!(page = number + 1, "OCR returned no text for page");
                    continue;
                }
                pages.push(text.trim().to_string());
            }
            return Ok(pages.join("\n\n"));
        }

        metrics::record_ocr_fallback("pdf");
        Ok(self.ocr.transcribe_pdf(bytes).await?)
    }

    /// Prepare a file and store it in the knowledge base
    #[instrument(skip(self, source), fields(file = %source.file_name))]
    pub async fn ingest(&self, source: SourceFile<'_>) -> Result<IngestionOutcome, IngestionError> {
        let start = Instant::now();
        let prepared = self.prepare(source).await?;

        let document = self
            .knowledge_base
            .create_document_by_text(TextDocument {
                name: source.title.to_string(),
                text: prepared.chunks.join(&self.settings.segment_separator),
                separator: self.settings.segment_separator.clone(),
                max_tokens: self.settings.segment_max_tokens,
            })
            .await?;

        let outcome = IngestionOutcome {
            knowledge_base_id: document.id,
            method: prepared.method,
            page_count: prepared.page_count,
            chunk_count: prepared.chunks.len(),
            characters: prepared.characters,
            markdown_len: prepared.markdown.len(),
        };

        metrics::record_ingestion(
            start.elapsed().as_secs_f64(),
            outcome.method.as_str(),
            outcome.chunk_count,
        );

        info!(
            knowledge_base_id = %outcome.knowledge_base_id,
            method = outcome.method.as_str(),
            pages = outcome.page_count,
            chunks = outcome.chunk_count,
            "Document ingested"
        );

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf::fixtures::{build, Page};
    use async_trait::async_trait;
    use condoportal_common::dify::{KbDocument, KbDocumentPage, RetrievalQuery, RetrievalRecord};
    use condoportal_common::errors::Result as AppResult;
    use std::sync::Mutex;

    #[derive(Default)]
    struct StubOcr {
        image_calls: Mutex<usize>,
        pdf_calls: Mutex<usize>,
        reply: String,
    }

    #[async_trait]
    impl OcrEngine for StubOcr {
        async fn transcribe_images(&self, images: &[Vec<u8>]) -> AppResult<String> {
            *self.image_calls.lock().unwrap() += 1;
            assert!(!images.is_empty());
            assert!(images.iter().all(|image| image.starts_with(&[0xFF, 0xD8])));
            Ok(self.reply.clone())
        }

        async fn transcribe_pdf(&self, pdf: &[u8]) -> AppResult<String> {
            *self.pdf_calls.lock().unwrap() += 1;
            assert!(pdf.starts_with(b"%PDF"));
            Ok(self.reply.clone())
        }
    }

    #[derive(Default)]
    struct RecordingKnowledgeBase {
        created: Mutex<Vec<TextDocument>>,
    }

    #[async_trait]
    impl KnowledgeBase for RecordingKnowledgeBase {
        async fn create_document_by_text(&self, document: TextDocument) -> AppResult<KbDocument> {
            let name = document.name.clone();
            self.created.lock().unwrap().push(document);
            Ok(KbDocument {
                id: "kb-1".to_string(),
                name,
                created_at: Some(1_700_000_000),
                indexing_status: Some("waiting".to_string()),
                word_count: None,
            })
        }

        async fn list_documents(&self, _: u32, _: u32, _: Option<&str>) -> AppResult<KbDocumentPage> {
            Ok(KbDocumentPage::default())
        }

        async fn get_document(&self, _: &str) -> AppResult<Option<KbDocument>> {
            Ok(None)
        }

        async fn delete_document(&self, _: &str) -> AppResult<bool> {
            Ok(false)
        }

        async fn retrieve(&self, _: &RetrievalQuery) -> AppResult<Vec<RetrievalRecord>> {
            Ok(Vec::new())
        }
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            thresholds: Thresholds::default(),
            chunking: ChunkingConfig {
                chunk_size: 200,
                chunk_overlap: 0,
            },
            max_ocr_images: 10,
            segment_separator: "\n\n<<<chunk>>>\n\n".to_string(),
            segment_max_tokens: 500,
        }
    }

    fn pipeline(ocr: Arc<StubOcr>, kb: Arc<RecordingKnowledgeBase>) -> IngestionPipeline {
        IngestionPipeline::new(settings(), ocr, kb).unwrap()
    }

    fn pdf_source<'a>(bytes: &'a [u8]) -> SourceFile<'a> {
        SourceFile {
            bytes,
            content_type: "application/pdf",
            file_name: "documento.pdf",
            title: "Regolamento",
        }
    }

    const DENSE_LINES: &[&str] = &[
        "REGOLAMENTO DI CONDOMINIO",
        "Le spese di manutenzione ordinaria delle parti comuni",
        "sono ripartite tra i condomini in base ai millesimi.",
    ];

    #[test]
    fn test_source_kind() {
        assert_eq!(source_kind("application/pdf", "a.bin"), Some(SourceKind::Pdf));
        assert_eq!(source_kind("text/plain; charset=utf-8", "a"), Some(SourceKind::PlainText));
        assert_eq!(source_kind("text/markdown", "a"), Some(SourceKind::Markdown));
        assert_eq!(source_kind("application/octet-stream", "Verbale.PDF"), Some(SourceKind::Pdf));
        assert_eq!(source_kind("", "note.md"), Some(SourceKind::Markdown));
        assert_eq!(source_kind("image/png", "scan.pdf"), None);
        assert!(!is_supported("application/octet-stream", "archive"));
    }

    #[tokio::test]
    async fn test_text_path() {
        let ocr = Arc::new(StubOcr::default());
        let kb = Arc::new(RecordingKnowledgeBase::default());
        let bytes = build(&[Page::Text(DENSE_LINES), Page::Text(DENSE_LINES)]);

        let prepared = pipeline(ocr.clone(), kb).prepare(pdf_source(&bytes)).await.unwrap();

        assert_eq!(prepared.method, ExtractionMethod::Text);
        assert_eq!(prepared.page_count, 2);
        assert!(prepared.markdown.starts_with("# Regolamento\n\n## REGOLAMENTO DI CONDOMINIO"));
        assert!(prepared.markdown.contains("millesimi"));
        assert_eq!(*ocr.image_calls.lock().unwrap(), 0);
        assert_eq!(*ocr.pdf_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_scanned_pages_use_image_ocr() {
        let ocr = Arc::new(StubOcr {
            reply: "Verbale di assemblea ordinaria.".to_string(),
            ..Default::default()
        });
        let kb = Arc::new(RecordingKnowledgeBase::default());
        let bytes = build(&[Page::Jpeg, Page::Jpeg]);

        let prepared = pipeline(ocr.clone(), kb).prepare(pdf_source(&bytes)).await.unwrap();

        assert_eq!(prepared.method, ExtractionMethod::Ocr);
        assert_eq!(*ocr.image_calls.lock().unwrap(), 2);
        assert_eq!(*ocr.pdf_calls.lock().unwrap(), 0);
        assert_eq!(
            prepared.markdown,
            "# Regolamento\n\nVerbale di assemblea ordinaria.\n\nVerbale di assemblea ordinaria.\n"
        );
    }

    #[tokio::test]
    async fn test_page_without_image_sends_whole_pdf() {
        let ocr = Arc::new(StubOcr {
            reply: "# Contratto\n\nTesto del contratto.".to_string(),
            ..Default::default()
        });
        let kb = Arc::new(RecordingKnowledgeBase::default());
        let bytes = build(&[Page::Jpeg, Page::Blank]);

        let prepared = pipeline(ocr.clone(), kb).prepare(pdf_source(&bytes)).await.unwrap();

        assert_eq!(*ocr.image_calls.lock().unwrap(), 0);
        assert_eq!(*ocr.pdf_calls.lock().unwrap(), 1);
        // OCR output that already has a top heading keeps it
        assert!(prepared.markdown.starts_with("# Contratto"));
    }

    #[tokio::test]
    async fn test_flate_wrapped_jpegs_send_whole_pdf() {
        let ocr = Arc::new(StubOcr {
            reply: "Polizza assicurativa del fabbricato.".to_string(),
            ..Default::default()
        });
        let kb = Arc::new(RecordingKnowledgeBase::default());
        let bytes = build(&[Page::FlateJpeg, Page::FlateJpeg]);

        let prepared = pipeline(ocr.clone(), kb).prepare(pdf_source(&bytes)).await.unwrap();

        assert_eq!(prepared.method, ExtractionMethod::Ocr);
        assert_eq!(*ocr.image_calls.lock().unwrap(), 0);
        assert_eq!(*ocr.pdf_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_empty_ocr_output() {
        let ocr = Arc::new(StubOcr::default());
        let kb = Arc::new(RecordingKnowledgeBase::default());
        let bytes = build(&[Page::Blank]);

        let err = pipeline(ocr, kb).prepare(pdf_source(&bytes)).await.unwrap_err();
        assert!(matches!(err, IngestionError::NoTextExtracted { .. }));
    }

    #[test]
    fn test_unsupported_content_type() {
        let ocr = Arc::new(StubOcr::default());
        let kb = Arc::new(RecordingKnowledgeBase::default());
        let source = SourceFile {
            bytes: b"\x89PNG",
            content_type: "image/png",
            file_name: "foto.png",
            title: "Foto",
        };

        let err = tokio_test::block_on(pipeline(ocr, kb).prepare(source)).unwrap_err();
        assert!(matches!(err, IngestionError::UnsupportedContentType(t) if t == "image/png"));
    }

    #[tokio::test]
    async fn test_ingest_joins_chunks_with_separator() {
        let ocr = Arc::new(StubOcr::default());
        let kb = Arc::new(RecordingKnowledgeBase::default());
        let text = "Paragrafo sulle spese condominiali e sulla loro ripartizione. ".repeat(12);
        let source = SourceFile {
            bytes: text.as_bytes(),
            content_type: "text/plain",
            file_name: "avviso.txt",
            title: "Avviso",
        };

        let outcome = pipeline(ocr, kb.clone()).ingest(source).await.unwrap();

        assert_eq!(outcome.knowledge_base_id, "kb-1");
        assert_eq!(outcome.method, ExtractionMethod::Text);
        assert!(outcome.chunk_count > 1);

        let created = kb.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].name, "Avviso");
        assert_eq!(created[0].max_tokens, 500);
        assert_eq!(
            created[0].text.split(created[0].separator.as_str()).count(),
            outcome.chunk_count
        );
        assert_eq!(outcome.summary().chunk_count as usize, outcome.chunk_count);
    }
}
