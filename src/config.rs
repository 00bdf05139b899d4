use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::guard::download::{default_model_dir, model_files_present, tokenizer_present, DEFAULT_HF_REPO};
use crate::moderation::service::{ServiceOptions, DEFAULT_CALL_TIMEOUT};

pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_BIND: &str = "0.0.0.0";

/// Which guard model backend to use.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardBackend {
    /// Local ONNX export of the streaming guard model (default)
    Onnx,
    /// Rule-based lexicon — needs only the tokenizer
    Lexicon,
}

/// Central configuration loaded from environment variables.
///
/// The .env file is loaded automatically at startup via dotenvy.
pub struct Config {
    pub backend: GuardBackend,
    /// Directory containing `tokenizer.json` and `model.onnx`
    pub model_dir: PathBuf,
    /// HuggingFace repo used by `download-model`
    pub hf_repo: String,
    pub bind: String,
    pub port: u16,
    /// Upper bound on a single model call
    pub call_timeout: Duration,
    /// Force a global lock around model calls
    pub serialize_calls: bool,
}

impl Config {
    /// Load configuration from environment variables. Everything has a default.
    pub fn load() -> Result<Self> {
        let backend = match env::var("GUARDSTREAM_BACKEND").as_deref() {
            Ok("lexicon") => GuardBackend::Lexicon,
            Ok("onnx") | Err(_) => GuardBackend::Onnx,
            Ok(other) => anyhow::bail!(
                "Unknown GUARDSTREAM_BACKEND {other:?} (expected \"onnx\" or \"lexicon\")"
            ),
        };

        let model_dir = env::var("GUARDSTREAM_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_model_dir());

        let port = match env::var("GUARDSTREAM_PORT") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("GUARDSTREAM_PORT is not a valid port: {raw:?}"))?,
            Err(_) => DEFAULT_PORT,
        };

        let call_timeout = match env::var("GUARDSTREAM_CALL_TIMEOUT_MS") {
            Ok(raw) => {
                let millis: u64 = raw.parse().with_context(|| {
                    format!("GUARDSTREAM_CALL_TIMEOUT_MS is not a number: {raw:?}")
                })?;
                if millis == 0 {
                    anyhow::bail!("GUARDSTREAM_CALL_TIMEOUT_MS must be greater than zero");
                }
                Duration::from_millis(millis)
            }
            Err(_) => DEFAULT_CALL_TIMEOUT,
        };

        let serialize_calls = matches!(
            env::var("GUARDSTREAM_SERIALIZE_CALLS").as_deref(),
            Ok("1") | Ok("true") | Ok("yes")
        );

        Ok(Self {
            backend,
            model_dir,
            hf_repo: env::var("GUARDSTREAM_HF_REPO").unwrap_or_else(|_| DEFAULT_HF_REPO.to_string()),
            bind: env::var("GUARDSTREAM_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string()),
            port,
            call_timeout,
            serialize_calls,
        })
    }

    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            call_timeout: self.call_timeout,
            serialize_calls: self.serialize_calls,
        }
    }

    /// Validate that the chosen backend has the files it needs.
    pub fn require_backend(&self) -> Result<()> {
        let present = match self.backend {
            GuardBackend::Onnx => model_files_present(&self.model_dir),
            GuardBackend::Lexicon => tokenizer_present(&self.model_dir),
        };
        if !present {
            anyhow::bail!(
                "Model files not found in {}\n\
                 Run `guardstream download-model` to download them.\n\
                 Or set GUARDSTREAM_BACKEND=lexicon to run with the tokenizer only.",
                self.model_dir.display()
            );
        }
        Ok(())
    }
}
