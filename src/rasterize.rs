//! PDF to page images, via poppler's `pdfinfo` and `pdftocairo`.

use std::{collections::BTreeMap, sync::LazyLock};

use clap::Args;
use regex::Regex;
use tokio::process::Command;

use crate::{
    async_utils::check_for_command_failure, cpu_limit::with_cpu_semaphore, prelude::*,
};

/// Anything mentioning "error" in poppler's stderr.
static ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

/// Poppler errors that don't stop it from producing usable pages.
static DOWNGRADE_TO_WARNING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error: xref num").expect("failed to compile regex")
});

/// Extracts the page number from `page-07.png`.
static PAGE_NUMBER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-(\d+)\.png$").expect("failed to compile regex"));

/// Does this line of poppler output report a real error?
fn is_error_line(line: &str) -> bool {
    ERROR_REGEX.is_match(line) && !DOWNGRADE_TO_WARNING_REGEX.is_match(line)
}

/// Rasterization options.
#[derive(Args, Clone, Debug)]
pub struct RasterizeOpts {
    /// Resolution for page images. Tesseract does best at around 300 DPI.
    #[clap(long, default_value_t = 300)]
    pub dpi: u32,

    /// Only process the first N pages of each résumé.
    #[clap(long)]
    pub max_pages: Option<usize>,
}

impl Default for RasterizeOpts {
    fn default() -> Self {
        Self {
            dpi: 300,
            max_pages: None,
        }
    }
}

/// The output of a [`Rasterizer`].
#[derive(Clone, Debug, PartialEq)]
pub struct RasterizedPages {
    /// One image per page, in page order.
    pub pages: Vec<PathBuf>,

    /// The number of pages in the PDF, which may be more than `pages.len()`
    /// if `--max-pages` was used.
    pub total_pages: usize,
}

/// Interface for turning a PDF into page images.
#[async_trait]
pub trait Rasterizer: Send + Sync + 'static {
    /// Write one image per page of `pdf` into `pages_dir`, replacing anything
    /// already there.
    async fn rasterize(&self, pdf: &Path, pages_dir: &Path) -> Result<RasterizedPages>;
}

/// A [`Rasterizer`] using poppler's command-line tools.
#[derive(Clone, Debug, Default)]
pub struct PopplerRasterizer {
    opts: RasterizeOpts,
}

impl PopplerRasterizer {
    pub fn new(opts: RasterizeOpts) -> Self {
        Self { opts }
    }
}

#[async_trait]
impl Rasterizer for PopplerRasterizer {
    #[instrument(level = "debug", skip_all, fields(pdf = %pdf.display()))]
    async fn rasterize(&self, pdf: &Path, pages_dir: &Path) -> Result<RasterizedPages> {
        check_is_pdf(pdf)?;
        let total_pages = get_pdf_page_count(pdf).await?;
        if total_pages == 0 {
            return Err(anyhow!("{:?} has no pages", pdf));
        }
        let expected_pages = self
            .opts
            .max_pages
            .map_or(total_pages, |max| max.min(total_pages));

        // Start from an empty directory, so a re-run never picks up pages
        // left over from an earlier attempt.
        if tokio::fs::try_exists(pages_dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(pages_dir)
                .await
                .with_context(|| format!("failed to clear {:?}", pages_dir))?;
        }
        tokio::fs::create_dir_all(pages_dir)
            .await
            .with_context(|| format!("failed to create {:?}", pages_dir))?;

        // `pdftocairo` will use at least 100% of a CPU.
        let mut cmd = Command::new("pdftocairo");
        cmd.arg("-png").arg("-r").arg(self.opts.dpi.to_string());
        if expected_pages < total_pages {
            cmd.arg("-l").arg(expected_pages.to_string());
        }
        cmd.arg(pdf).arg(pages_dir.join("page"));
        let output = with_cpu_semaphore(|| async {
            cmd.output()
                .await
                .with_context(|| format!("failed to run pdftocairo on {:?}", pdf))
        })
        .await?;
        check_for_command_failure("pdftocairo", &output, Some(&is_error_line))?;

        let pages = list_page_images(pages_dir).await?;
        if pages.len() != expected_pages {
            return Err(anyhow!(
                "pdftocairo produced {} page images for {:?}, expected {}",
                pages.len(),
                pdf,
                expected_pages
            ));
        }
        debug!(total_pages, rasterized = pages.len(), "Rasterized PDF");
        Ok(RasterizedPages { pages, total_pages })
    }
}

/// Make sure a file is really a PDF, not just named like one.
fn check_is_pdf(path: &Path) -> Result<()> {
    let kind = infer::get_from_path(path)
        .with_context(|| format!("failed to read {:?}", path))?;
    match kind {
        Some(kind) if kind.mime_type() == "application/pdf" => Ok(()),
        Some(kind) => Err(anyhow!("{:?} is {}, not a PDF", path, kind.mime_type())),
        None => Err(anyhow!("{:?} is not a PDF", path)),
    }
}

/// Count the pages in a PDF using `pdfinfo`.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn get_pdf_page_count(path: &Path) -> Result<usize> {
    let output = Command::new("pdfinfo")
        .arg(path)
        .output()
        .await
        .with_context(|| format!("failed to run pdfinfo on {:?}", path))?;
    check_for_command_failure("pdfinfo", &output, None)?;
    let output =
        String::from_utf8(output.stdout).context("pdfinfo output was not valid UTF-8")?;
    parse_pdfinfo_page_count(&output)
        .with_context(|| format!("failed to get page count for {:?}", path))
}

/// Get `Pages:` from `pdfinfo` output.
fn parse_pdfinfo_page_count(output: &str) -> Result<usize> {
    let properties = output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim(), value.trim()))
        .collect::<BTreeMap<_, _>>();
    let pages = properties
        .get("Pages")
        .ok_or_else(|| anyhow!("no page count in pdfinfo output"))?;
    pages
        .parse::<usize>()
        .with_context(|| format!("bad page count {:?}", pages))
}

/// List `page-N.png` files, ordered by page number.
async fn list_page_images(pages_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(pages_dir)
        .await
        .with_context(|| format!("failed to read {:?}", pages_dir))?;
    let mut pages = vec![];
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed to read {:?}", pages_dir))?
    {
        let path = entry.path();
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if let Some(number) = PAGE_NUMBER_REGEX
            .captures(&file_name)
            .and_then(|caps| caps[1].parse::<usize>().ok())
        {
            pages.push((number, path));
        }
    }
    pages.sort();
    Ok(pages.into_iter().map(|(_, path)| path).collect())
}
