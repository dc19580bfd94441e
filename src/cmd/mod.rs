//! Command-line entry points.

use std::sync::Arc;

use clap::Args;

use crate::{
    extract::ExtractorOpts,
    layout::Layout,
    ocr::{OcrOpts, tesseract::TesseractOcrEngine},
    pipeline::Pipeline,
    prelude::*,
    rasterize::{PopplerRasterizer, RasterizeOpts},
    store::FsJobStore,
};

pub mod reparse;
pub mod run;
pub mod schema;
pub mod status;
pub mod watch;

/// Where to find inputs and put everything else.
#[derive(Debug, Clone, Args)]
pub struct LayoutOpts {
    /// Directory to pick up PDF résumés from.
    #[clap(long, env = "RESUME_INGEST_INPUT_DIR", default_value = "input")]
    pub input_dir: PathBuf,

    /// Directory for job records, intermediate artifacts and archived PDFs.
    #[clap(long, env = "RESUME_INGEST_WORK_DIR", default_value = "work")]
    pub work_dir: PathBuf,

    /// Directory to publish one JSON file per résumé to.
    #[clap(long, env = "RESUME_INGEST_OUTPUT_DIR", default_value = "output")]
    pub output_dir: PathBuf,
}

impl LayoutOpts {
    /// Build our layout and create any missing directories.
    pub async fn to_layout(&self) -> Result<Layout> {
        let layout = Layout {
            input_dir: self.input_dir.clone(),
            work_dir: self.work_dir.clone(),
            output_dir: self.output_dir.clone(),
        };
        layout.ensure_dirs().await?;
        Ok(layout)
    }
}

/// Options for commands that run the full pipeline.
#[derive(Debug, Clone, Args)]
pub struct PipelineOpts {
    #[clap(flatten)]
    pub layout_opts: LayoutOpts,

    #[clap(flatten)]
    pub rasterize_opts: RasterizeOpts,

    #[clap(flatten)]
    pub ocr_opts: OcrOpts,

    #[clap(flatten)]
    pub extractor_opts: ExtractorOpts,

    /// Max number of résumés to process at a time.
    #[clap(short = 'j', long = "jobs", default_value = "1")]
    pub job_count: usize,

    /// What portion of résumés should we allow to fail? Specified as a
    /// number between 0.0 and 1.0.
    #[clap(long, default_value = "1.0")]
    pub allowed_failure_rate: f32,
}

impl PipelineOpts {
    /// Build our pipeline from the command line.
    pub async fn build_pipeline(&self) -> Result<Pipeline> {
        let layout = self.layout_opts.to_layout().await?;
        let store = Arc::new(FsJobStore::new(layout.clone()));
        let rasterizer = Arc::new(PopplerRasterizer::new(self.rasterize_opts.clone()));
        let ocr_engine = Arc::new(TesseractOcrEngine::new(&self.ocr_opts.ocr_lang));
        let extractor = self.extractor_opts.create_extractor().await?;
        Pipeline::new(
            layout,
            store,
            rasterizer,
            ocr_engine,
            self.ocr_opts.ocr_page_concurrency,
            extractor,
        )
    }
}
