// Model download helper.
//
// Fetches the tokenizer and the ONNX export of the streaming guard model from
// a HuggingFace repo. Files are stored in a platform-appropriate directory
// (~/.local/share/guardstream/models/ on Linux) so they persist across runs.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::AsyncWriteExt;
use tracing::info;

use super::onnx::MODEL_FILE;

pub const DEFAULT_HF_REPO: &str = "Qwen/Qwen3Guard-Stream-0.6B";

pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// Location of the ONNX export inside the repo.
const REMOTE_MODEL_FILE: &str = "onnx/model.onnx";

/// Returns the default directory for storing model files.
pub fn default_model_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("guardstream")
        .join("models")
}

pub fn tokenizer_present(dir: &Path) -> bool {
    dir.join(TOKENIZER_FILE).exists()
}

/// Check whether both the model and the tokenizer exist.
pub fn model_files_present(dir: &Path) -> bool {
    dir.join(MODEL_FILE).exists() && tokenizer_present(dir)
}

fn resolve_url(repo: &str, file: &str) -> String {
    format!("https://huggingface.co/{repo}/resolve/main/{file}")
}

/// Download the tokenizer and the ONNX model. Skips files that already exist.
pub async fn download_model(dir: &Path, repo: &str) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create model directory: {}", dir.display()))?;

    println!("\nGuard model ({repo}):");

    let tokenizer_path = dir.join(TOKENIZER_FILE);
    if tokenizer_path.exists() {
        info!("Tokenizer already exists, skipping");
        println!("  {} (already exists)", TOKENIZER_FILE);
    } else {
        println!("  Downloading {}...", TOKENIZER_FILE);
        download_file(&resolve_url(repo, TOKENIZER_FILE), &tokenizer_path, false).await?;
    }

    let model_path = dir.join(MODEL_FILE);
    if model_path.exists() {
        info!("Model already exists, skipping");
        println!("  {} (already exists)", MODEL_FILE);
    } else {
        println!("  Downloading {}...", MODEL_FILE);
        download_file(&resolve_url(repo, REMOTE_MODEL_FILE), &model_path, true).await?;
    }

    Ok(())
}

/// Path the body is written to until the download completes.
fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

fn progress_bar(total_size: Option<u64>) -> Result<ProgressBar> {
    let (pb, template) = match total_size {
        Some(size) => (
            ProgressBar::new(size),
            "    [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
        ),
        None => (ProgressBar::new_spinner(), "    {spinner} {bytes}"),
    };
    pb.set_style(
        ProgressStyle::default_bar()
            .template(template)
            .context("Invalid progress template")?
            .progress_chars("=> "),
    );
    Ok(pb)
}

/// Stream `url` into `dest` chunk by chunk. The body goes to a `.part` file
/// that is renamed into place only once every byte has arrived, so an
/// interrupted download never looks like a model file.
async fn download_file(url: &str, dest: &Path, show_progress: bool) -> Result<u64> {
    let client = reqwest::Client::new();
    let mut response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to download {}", url))?;

    if !response.status().is_success() {
        anyhow::bail!("Download failed with status {}: {}", response.status(), url);
    }

    let expected = response.content_length();
    let pb = if show_progress {
        Some(progress_bar(expected)?)
    } else {
        None
    };

    let partial = partial_path(dest);
    let mut file = tokio::fs::File::create(&partial)
        .await
        .with_context(|| format!("Failed to create {}", partial.display()))?;

    let mut written: u64 = 0;
    let streamed = async {
        while let Some(chunk) = response
            .chunk()
            .await
            .with_context(|| format!("Download of {} interrupted", url))?
        {
            file.write_all(&chunk)
                .await
                .with_context(|| format!("Failed to write {}", partial.display()))?;
            written += chunk.len() as u64;
            if let Some(ref pb) = pb {
                pb.inc(chunk.len() as u64);
            }
        }
        file.flush().await.context("Failed to flush download")?;
        if let Some(expected) = expected {
            if written != expected {
                anyhow::bail!("Download of {} ended after {written} of {expected} bytes", url);
            }
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;
    drop(file);

    if let Err(e) = streamed {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(e);
    }

    tokio::fs::rename(&partial, dest)
        .await
        .with_context(|| format!("Failed to move download into {}", dest.display()))?;

    if let Some(pb) = pb {
        pb.finish_and_clear();
    }

    info!("Downloaded {} ({written} bytes) to {}", url, dest.display());
    Ok(written)
}
