//! I/O utilities.
//!
//! Every artifact the pipeline produces goes through this module. Writes are
//! atomic: we write to a temporary file in the destination directory and
//! rename it into place, so a crash mid-write never leaves a half-written
//! `job.json` or output file for the next run to trip over.

use std::{fs, io::Write as _};

use serde::de::DeserializeOwned;
use tokio::{
    fs::File,
    io::{AsyncWrite, AsyncWriteExt as _, BufWriter},
};

use crate::prelude::*;

use super::spawn_blocking_propagating_panics;

/// Read TOML or JSON from a file, choosing the format by extension.
pub async fn read_json_or_toml<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read file at path: {:?}", path))?;
    let ext = path.extension().unwrap_or_default();
    if ext == "json" {
        serde_json::from_str(&data).with_context(|| {
            format!("Failed to parse JSON from file at path: {:?}", path)
        })
    } else {
        toml::from_str(&data).with_context(|| {
            format!("Failed to parse TOML from file at path: {:?}", path)
        })
    }
}

/// Read a JSON file, returning `None` if it does not exist.
pub async fn read_json_if_exists<T>(path: &Path) -> Result<Option<T>>
where
    T: DeserializeOwned,
{
    match tokio::fs::read(path).await {
        Ok(data) => {
            let value = serde_json::from_slice(&data).with_context(|| {
                format!("Failed to parse JSON from file at path: {:?}", path)
            })?;
            Ok(Some(value))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(err).with_context(|| format!("Failed to read file at path: {:?}", path))
        }
    }
}

/// Atomically replace `path` with `data`.
pub async fn write_atomic(path: &Path, data: Vec<u8>) -> Result<()> {
    let path = path.to_owned();
    spawn_blocking_propagating_panics(move || write_atomic_sync(&path, &data)).await
}

/// Synchronous half of [`write_atomic`].
fn write_atomic_sync(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("no parent directory for {:?}", path))?;
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory {:?}", dir))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temporary file in {:?}", dir))?;
    tmp.write_all(data)
        .with_context(|| format!("Failed to write temporary file for {:?}", path))?;
    tmp.flush()
        .with_context(|| format!("Failed to flush temporary file for {:?}", path))?;
    tmp.persist(path)
        .with_context(|| format!("Failed to move temporary file to {:?}", path))?;
    Ok(())
}

/// Atomically write pretty-printed JSON to `path`.
pub async fn write_json_atomic<T>(path: &Path, value: &T) -> Result<()>
where
    T: Serialize + ?Sized,
{
    let mut data = serde_json::to_vec_pretty(value)
        .with_context(|| format!("Failed to serialize JSON for {:?}", path))?;
    data.push(b'\n');
    write_atomic(path, data).await
}

/// Move a file, falling back to copy-and-delete when `rename` can't cross
/// filesystems.
pub async fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(dir) = to.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create directory {:?}", dir))?;
    }
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to)
        .await
        .with_context(|| format!("Failed to copy {:?} to {:?}", from, to))?;
    tokio::fs::remove_file(from)
        .await
        .with_context(|| format!("Failed to remove {:?} after copying", from))?;
    Ok(())
}

/// Create an [`AsyncWrite`] for a file or stdout.
pub async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Write values as JSON Lines to either standard output or a file.
pub async fn write_jsonl<T>(path: Option<&Path>, values: &[T]) -> Result<()>
where
    T: Serialize,
{
    let mut writer = BufWriter::new(create_writer(path).await?);
    for value in values {
        let json = serde_json::to_string(value).context("Failed to serialize JSON")?;
        writer
            .write_all(json.as_bytes())
            .await
            .context("Failed to write JSON to output")?;
        writer
            .write_all(b"\n")
            .await
            .context("Failed to write newline to output")?;
    }
    writer.flush().await.context("Failed to flush output")?;
    Ok(())
}
