//! Page images to text.

use std::sync::{Arc, LazyLock};

use clap::Args;
use futures::StreamExt as _;
use regex::Regex;

use crate::prelude::*;

pub mod tesseract;

/// OCR often reads `•` as `e`, `o` or `-` at the start of a line.
static BULLET_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[eo\-][ \t]+").expect("failed to compile regex"));

/// Runs of spaces and tabs.
static HORIZONTAL_SPACE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t\x0C\r]+").expect("failed to compile regex"));

/// Three or more newlines, possibly with whitespace between them.
static BLANK_LINES_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n(?:[ \t]*\n){2,}").expect("failed to compile regex"));

/// OCR options.
#[derive(Args, Clone, Debug)]
pub struct OcrOpts {
    /// Tesseract language(s), such as `eng` or `eng+fra`.
    #[clap(long, default_value = "eng")]
    pub ocr_lang: String,

    /// How many pages of a single résumé to OCR at once.
    #[clap(long, default_value_t = 4)]
    pub ocr_page_concurrency: usize,
}

impl Default for OcrOpts {
    fn default() -> Self {
        Self {
            ocr_lang: "eng".to_owned(),
            ocr_page_concurrency: 4,
        }
    }
}

/// Input for [`OcrEngine::ocr_page`].
#[derive(Clone, Debug)]
pub struct OcrPageInput {
    /// The job this page belongs to, for logging.
    pub job_id: String,

    /// Zero-based page index.
    pub page_idx: usize,

    /// The page image.
    pub image_path: PathBuf,
}

/// Interface for OCR engines.
#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    /// Read the text on a single page.
    async fn ocr_page(&self, input: OcrPageInput) -> Result<String>;
}

/// OCR every page of a document and return the cleaned text.
///
/// Pages are processed concurrently but joined in page order. Any failed
/// page fails the whole document, as does a document with no text at all.
#[instrument(level = "debug", skip_all, fields(job_id = %job_id, pages = pages.len()))]
pub async fn ocr_document(
    engine: Arc<dyn OcrEngine>,
    job_id: &str,
    pages: &[PathBuf],
    concurrency_limit: usize,
) -> Result<String> {
    let page_texts = futures::stream::iter(pages.iter().cloned().enumerate())
        .map(|(page_idx, image_path)| {
            let engine = engine.clone();
            let input = OcrPageInput {
                job_id: job_id.to_owned(),
                page_idx,
                image_path,
            };
            async move {
                engine
                    .ocr_page(input)
                    .await
                    .with_context(|| format!("OCR failed on page {}", page_idx + 1))
            }
        })
        .buffered(concurrency_limit.max(1))
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<Vec<_>>>()?;

    let text = clean_text(&page_texts.join("\n\n"));
    if text.is_empty() {
        return Err(anyhow!("no text found on {} page(s)", pages.len()));
    }
    Ok(text)
}

/// Clean up raw OCR output.
///
/// Misread bullets become `•`, runs of horizontal whitespace become one space,
/// and runs of blank lines become a single blank line. Line breaks are kept,
/// since they're most of what tells the LLM where one section ends.
pub fn clean_text(text: &str) -> String {
    let text = HORIZONTAL_SPACE_REGEX.replace_all(text, " ");
    let text = text
        .lines()
        .map(|line| line.trim())
        .collect::<Vec<_>>()
        .join("\n");
    let text = BULLET_REGEX.replace_all(&text, "• ");
    let text = BLANK_LINES_REGEX.replace_all(&text, "\n\n");
    text.trim().to_owned()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    /// An OCR engine that returns canned text for each file name.
    struct CannedOcr(HashMap<String, Result<String, String>>);

    #[async_trait]
    impl OcrEngine for CannedOcr {
        async fn ocr_page(&self, input: OcrPageInput) -> Result<String> {
            let name = input.image_path.to_string_lossy().into_owned();
            match self.0.get(&name) {
                Some(Ok(text)) => Ok(text.clone()),
                Some(Err(err)) => Err(anyhow!("{}", err)),
                None => Err(anyhow!("unexpected page {}", name)),
            }
        }
    }

    fn engine(pages: &[(&str, Result<&str, &str>)]) -> Arc<dyn OcrEngine> {
        Arc::new(CannedOcr(
            pages
                .iter()
                .map(|(name, result)| {
                    (
                        (*name).to_owned(),
                        result.map(str::to_owned).map_err(str::to_owned),
                    )
                })
                .collect(),
        ))
    }

    #[test]
    fn bullets_and_whitespace_are_cleaned() {
        let raw = "Jane   Doe\t\n\n\n\nSKILLS\ne Rust\no SQL\n- Go\neverything  else\x0C\n";
        assert_eq!(
            clean_text(raw),
            "Jane Doe\n\nSKILLS\n• Rust\n• SQL\n• Go\neverything else"
        );
    }

    #[tokio::test]
    async fn pages_are_joined_in_order() -> Result<()> {
        let engine = engine(&[("p1.png", Ok("Page one")), ("p2.png", Ok("Page two"))]);
        let pages = vec![PathBuf::from("p1.png"), PathBuf::from("p2.png")];
        let text = ocr_document(engine, "job", &pages, 2).await?;
        assert_eq!(text, "Page one\n\nPage two");
        Ok(())
    }

    #[tokio::test]
    async fn any_failed_page_fails_the_document() {
        let engine = engine(&[("p1.png", Ok("Page one")), ("p2.png", Err("boom"))]);
        let pages = vec![PathBuf::from("p1.png"), PathBuf::from("p2.png")];
        let err = ocr_document(engine, "job", &pages, 2).await.unwrap_err();
        assert_eq!(format!("{err:#}"), "OCR failed on page 2: boom");
    }

    #[tokio::test]
    async fn empty_output_is_an_error() {
        let engine = engine(&[("p1.png", Ok("  \n\x0C"))]);
        let err = ocr_document(engine, "job", &[PathBuf::from("p1.png")], 1)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no text found"), "{err}");
    }
}
