//! Failures that stop a single résumé job.
//!
//! Plumbing code uses [`anyhow`] and attaches context as it goes. At each
//! stage boundary the orchestrator wraps whatever went wrong in a
//! [`StageError`], which says *which kind* of failure it was. That kind is what
//! gets persisted on the job record, so an operator can grep `job.json` files
//! for `"kind": "ocr"` without parsing free-form messages.

use schemars::JsonSchema;
use thiserror::Error;

use crate::prelude::*;

/// A failure at one pipeline stage.
#[derive(Debug, Error)]
pub enum StageError {
    /// The input file could not be claimed from the input directory.
    #[error("intake failed: {0:#}")]
    Intake(anyhow::Error),

    /// The PDF could not be rasterized (malformed, unreadable, or not a PDF).
    #[error("PDF conversion failed: {0:#}")]
    Conversion(anyhow::Error),

    /// The OCR engine failed or produced no text.
    #[error("OCR failed: {0:#}")]
    Ocr(anyhow::Error),

    /// The LLM call failed, timed out, or returned something unparseable.
    #[error("field extraction failed: {0:#}")]
    Extraction(anyhow::Error),

    /// The extracted fields do not match the résumé schema.
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// The source file could not be archived.
    #[error("archive failed: {0:#}")]
    Archive(anyhow::Error),
}

impl StageError {
    /// What kind of failure is this?
    pub fn kind(&self) -> FailureKind {
        match self {
            StageError::Intake(_) => FailureKind::Intake,
            StageError::Conversion(_) => FailureKind::Conversion,
            StageError::Ocr(_) => FailureKind::Ocr,
            StageError::Extraction(_) => FailureKind::Extraction,
            StageError::Validation(_) => FailureKind::Validation,
            StageError::Archive(_) => FailureKind::Archive,
        }
    }
}

/// Serializable tag for a [`StageError`].
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Intake,
    Conversion,
    Ocr,
    Extraction,
    Validation,
    Archive,
}
