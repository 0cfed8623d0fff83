use std::{collections::HashMap, path::Path, sync::Arc};

use async_trait::async_trait;
use common::error::AppError;
use dom_smoothie::{Article, Readability, TextMode};

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "rst", "log", "csv", "tsv", "json", "toml", "yaml", "yml", "xml",
    "rs", "py", "js", "ts", "go", "java", "c", "h", "cpp", "hpp", "cs", "rb", "sh", "sql",
];

/// Turns raw file bytes into plain text.
#[async_trait]
pub trait Extractor: Send + Sync {
    fn supported_types(&self) -> &[&'static str];

    fn supports_extension(&self, _extension: &str) -> bool {
        false
    }

    async fn extract(&self, path: &Path, bytes: Vec<u8>) -> Result<String, AppError>;
}

pub struct PlainTextExtractor;

#[async_trait]
impl Extractor for PlainTextExtractor {
    fn supported_types(&self) -> &[&'static str] {
        &[
            "text/plain",
            "text/markdown",
            "text/x-markdown",
            "text/csv",
            "text/x-rust",
            "text/x-python",
            "text/x-c",
            "text/x-java",
            "application/json",
            "application/toml",
            "application/x-sh",
            "application/xml",
            "text/xml",
        ]
    }

    fn supports_extension(&self, extension: &str) -> bool {
        TEXT_EXTENSIONS.contains(&extension)
    }

    async fn extract(&self, path: &Path, bytes: Vec<u8>) -> Result<String, AppError> {
        String::from_utf8(bytes).map_err(|err| {
            AppError::Extraction(format!(
                "{} is not valid UTF-8 text: {err}",
                path.display()
            ))
        })
    }
}

/// Main-content extraction from HTML pages via readability.
pub struct HtmlExtractor;

#[async_trait]
impl Extractor for HtmlExtractor {
    fn supported_types(&self) -> &[&'static str] {
        &["text/html", "application/xhtml+xml"]
    }

    async fn extract(&self, path: &Path, bytes: Vec<u8>) -> Result<String, AppError> {
        let label = path.display().to_string();
        tokio::task::spawn_blocking(move || -> Result<String, AppError> {
            let raw_content = String::from_utf8_lossy(&bytes).into_owned();
            let config = dom_smoothie::Config {
                text_mode: TextMode::Markdown,
                ..Default::default()
            };
            let mut readability = Readability::new(raw_content, None, Some(config))
                .map_err(|err| AppError::Extraction(format!("failed to parse {label}: {err}")))?;
            let article: Article = readability.parse().map_err(|err| {
                AppError::Extraction(format!("no readable content in {label}: {err}"))
            })?;
            Ok(article.text_content.into())
        })
        .await?
    }
}

pub struct PdfExtractor;

#[async_trait]
impl Extractor for PdfExtractor {
    fn supported_types(&self) -> &[&'static str] {
        &["application/pdf"]
    }

    async fn extract(&self, path: &Path, bytes: Vec<u8>) -> Result<String, AppError> {
        let text = tokio::task::spawn_blocking(move || {
            pdf_extract::extract_text_from_mem(&bytes).map(|s| s.trim().to_string())
        })
        .await?
        .map_err(|err| {
            AppError::Extraction(format!(
                "failed to extract text from PDF {}: {err}",
                path.display()
            ))
        })?;

        if text.is_empty() {
            return Err(AppError::Extraction(format!(
                "PDF {} has no text layer",
                path.display()
            )));
        }
        Ok(text)
    }
}

/// Extractors keyed by MIME type, with an extension fallback.
pub struct ExtractorRegistry {
    extractors: HashMap<String, Arc<dyn Extractor>>,
    mime_mapping: HashMap<String, String>,
    max_file_bytes: u64,
}

impl ExtractorRegistry {
    pub fn new(max_file_bytes: u64) -> Self {
        Self {
            extractors: HashMap::new(),
            mime_mapping: HashMap::new(),
            max_file_bytes,
        }
    }

    /// Text, HTML and PDF extractors.
    pub fn with_defaults(max_file_bytes: u64) -> Self {
        let mut registry = Self::new(max_file_bytes);
        registry.register("text", PlainTextExtractor);
        registry.register("html", HtmlExtractor);
        registry.register("pdf", PdfExtractor);
        registry
    }

    pub fn register<E: Extractor + 'static>(&mut self, name: &str, extractor: E) {
        let extractor = Arc::new(extractor);
        for mime in extractor.supported_types() {
            self.mime_mapping
                .insert((*mime).to_string(), name.to_string());
        }
        self.extractors.insert(name.to_string(), extractor);
    }

    /// MIME type guessed from the file extension.
    pub fn detect_mime(path: &Path) -> String {
        mime_guess::from_path(path)
            .first()
            .map_or_else(
                || mime::APPLICATION_OCTET_STREAM.to_string(),
                |m| m.essence_str().to_string(),
            )
    }

    fn get_for_file(&self, path: &Path, mime_type: &str) -> Option<Arc<dyn Extractor>> {
        if let Some(extractor) = self
            .mime_mapping
            .get(mime_type)
            .and_then(|name| self.extractors.get(name))
        {
            return Some(Arc::clone(extractor));
        }

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)?;
        self.extractors
            .values()
            .find(|extractor| extractor.supports_extension(&extension))
            .map(Arc::clone)
    }

    pub fn supports(&self, path: &Path) -> bool {
        self.get_for_file(path, &Self::detect_mime(path)).is_some()
    }

    pub async fn extract(&self, path: &Path, mime_type: &str) -> Result<String, AppError> {
        let extractor = self.get_for_file(path, mime_type).ok_or_else(|| {
            AppError::Extraction(format!(
                "unsupported document type {mime_type} for {}",
                path.display()
            ))
        })?;

        let metadata = tokio::fs::metadata(path).await.map_err(|err| {
            AppError::Extraction(format!("cannot stat {}: {err}", path.display()))
        })?;
        if metadata.len() > self.max_file_bytes {
            return Err(AppError::Extraction(format!(
                "{} is {} bytes, above the {} byte limit",
                path.display(),
                metadata.len(),
                self.max_file_bytes
            )));
        }

        let bytes = tokio::fs::read(path).await.map_err(|err| {
            AppError::Extraction(format!("cannot read {}: {err}", path.display()))
        })?;
        extractor.extract(path, bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn extracts_plain_text_and_code() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = ExtractorRegistry::with_defaults(1024);

        let note = dir.path().join("note.txt");
        tokio::fs::write(&note, "hello world").await.expect("write");
        let mime = ExtractorRegistry::detect_mime(&note);
        assert_eq!(mime, "text/plain");
        assert_eq!(
            registry.extract(&note, &mime).await.expect("extract"),
            "hello world"
        );

        let code = dir.path().join("lib.rs");
        tokio::fs::write(&code, "fn main() {}").await.expect("write");
        assert!(registry.supports(&code));
    }

    #[tokio::test]
    async fn extracts_readable_html() {
        let dir = tempfile::tempdir().expect("tempdir");
        let page = dir.path().join("page.html");
        let paragraph = "<p>Readable paragraph about vector ingestion pipelines, the way they \
            checkpoint every stage, and how an interrupted run picks up where it stopped.</p>";
        let html = format!(
            "<html><head><title>Checkpoints</title></head><body><nav>menu</nav><article>{}</article></body></html>",
            paragraph.repeat(6)
        );
        tokio::fs::write(&page, html).await.expect("write");

        let registry = ExtractorRegistry::with_defaults(1024 * 1024);
        let text = registry
            .extract(&page, "text/html")
            .await
            .expect("extract");
        assert!(text.contains("Readable paragraph"));
    }

    #[tokio::test]
    async fn unsupported_and_oversized_files_are_extraction_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = ExtractorRegistry::with_defaults(4);

        let binary = dir.path().join("archive.zip");
        tokio::fs::write(&binary, [0u8, 1, 2]).await.expect("write");
        assert!(!registry.supports(&binary));
        assert!(matches!(
            registry
                .extract(&binary, &ExtractorRegistry::detect_mime(&binary))
                .await,
            Err(AppError::Extraction(_))
        ));

        let big = dir.path().join("big.txt");
        tokio::fs::write(&big, "more than four bytes").await.expect("write");
        assert!(matches!(
            registry.extract(&big, "text/plain").await,
            Err(AppError::Extraction(_))
        ));
    }

    #[tokio::test]
    async fn invalid_utf8_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.txt");
        tokio::fs::write(&path, [0xff, 0xfe, 0xfd]).await.expect("write");
        let registry = ExtractorRegistry::with_defaults(1024);
        assert!(matches!(
            registry.extract(&path, "text/plain").await,
            Err(AppError::Extraction(_))
        ));
    }
}
