//! OCR engine wrapping the `tesseract` CLI tool.

use tokio::process::Command;

use crate::{
    async_utils::check_for_command_failure, cpu_limit::with_cpu_semaphore, prelude::*,
};

use super::{OcrEngine, OcrPageInput};

/// OCR engine wrapping the `tesseract` CLI tool.
#[derive(Clone, Debug)]
pub struct TesseractOcrEngine {
    lang: String,
}

impl TesseractOcrEngine {
    /// Create a new `tesseract` engine for the given language(s).
    pub fn new(lang: &str) -> Self {
        Self {
            lang: lang.to_owned(),
        }
    }
}

#[async_trait]
impl OcrEngine for TesseractOcrEngine {
    #[instrument(level = "debug", skip_all, fields(job_id = %input.job_id, page = %input.page_idx))]
    async fn ocr_page(&self, input: OcrPageInput) -> Result<String> {
        // Tesseract adds `.txt` to the output base name, so `page-1.png`
        // produces `page-1.txt` next to it.
        let output_base = input.image_path.with_extension("");
        let output_path = input.image_path.with_extension("txt");

        let output = with_cpu_semaphore(|| async {
            Command::new("tesseract")
                .arg(&input.image_path)
                .arg(&output_base)
                .arg("-l")
                .arg(&self.lang)
                .output()
                .await
                .context("cannot run tesseract")
        })
        .await?;
        check_for_command_failure("tesseract", &output, None)?;

        tokio::fs::read_to_string(&output_path)
            .await
            .with_context(|| format!("cannot read tesseract output {:?}", output_path))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ocr::ocr_document;

    #[tokio::test]
    #[ignore = "Requires tesseract and ImageMagick to be installed"]
    async fn reads_rendered_text() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let image = dir.path().join("page-1.png");
        let status = Command::new("convert")
            .args(["-size", "800x200", "xc:white", "-pointsize", "48"])
            .args(["-annotate", "+20+100", "Jane Doe"])
            .arg(&image)
            .status()
            .await?;
        assert!(status.success());

        let engine = Arc::new(TesseractOcrEngine::new("eng"));
        let text = ocr_document(engine, "job", &[image], 1).await?;
        assert!(text.contains("Jane"), "{text}");
        Ok(())
    }
}
