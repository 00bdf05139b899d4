// Local ONNX guard model.
//
// The exported graph takes `input_ids` / `attention_mask` of shape [1, seq]
// and returns per-token logits from two pairs of heads: query heads judge the
// user turn, response heads judge the assistant turn.
//
// The graph carries no KV cache, so the stream state is the accumulated token
// ids of the conversation so far. Every call re-runs the prefix and reads the
// logits at the positions of the newly fed tokens.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use ort::session::Session;
use ort::value::Tensor;
use tracing::debug;

use super::streams::StreamTable;
use super::traits::{Category, GuardModel, RiskLevel, Role, StreamState, Verdict};

pub const MODEL_FILE: &str = "model.onnx";

const QUERY_RISK_OUTPUT: &str = "query_risk_level_logits";
const QUERY_CATEGORY_OUTPUT: &str = "query_category_logits";
const RESPONSE_RISK_OUTPUT: &str = "risk_level_logits";
const RESPONSE_CATEGORY_OUTPUT: &str = "category_logits";

/// Risk head labels, in the order the model returns them.
const RISK_LABELS: [RiskLevel; 3] = [RiskLevel::Safe, RiskLevel::Unsafe, RiskLevel::Controversial];

/// Query category head labels.
const QUERY_CATEGORIES: [Category; 9] = [
    Category::Violent,
    Category::NonViolentIllegalActs,
    Category::SexualContent,
    Category::Pii,
    Category::SuicideSelfHarm,
    Category::UnethicalActs,
    Category::PoliticallySensitive,
    Category::CopyrightViolation,
    Category::Jailbreak,
];

/// Response category head labels. Jailbreak only applies to prompts.
const RESPONSE_CATEGORIES: [Category; 8] = [
    Category::Violent,
    Category::NonViolentIllegalActs,
    Category::SexualContent,
    Category::Pii,
    Category::SuicideSelfHarm,
    Category::UnethicalActs,
    Category::PoliticallySensitive,
    Category::CopyrightViolation,
];

pub struct OnnxGuardModel {
    // ort::Session::run takes &mut self.
    session: Mutex<Session>,
    streams: StreamTable<Vec<u32>>,
    name: String,
}

impl OnnxGuardModel {
    /// Load `model.onnx` from `model_dir`.
    pub fn load(model_dir: &Path, name: impl Into<String>) -> Result<Self> {
        let model_path = model_dir.join(MODEL_FILE);
        if !model_path.exists() {
            anyhow::bail!(
                "Model file not found: {}\nRun `guardstream download-model` to download it.",
                model_path.display()
            );
        }

        let session = Session::builder()
            .context("Failed to create ONNX session builder")?
            .commit_from_file(&model_path)
            .with_context(|| format!("Failed to load ONNX model from {}", model_path.display()))?;

        debug!("Loaded ONNX guard model from {}", model_dir.display());

        Ok(Self {
            session: Mutex::new(session),
            streams: StreamTable::default(),
            name: name.into(),
        })
    }

    /// Streams currently holding model-side state.
    pub fn open_streams(&self) -> usize {
        self.streams.open_count()
    }

    /// Run the graph over `ids` and classify the last `fed` positions.
    fn classify_tail(&self, ids: &[u32], fed: usize, role: Role) -> Result<Vec<Verdict>> {
        let (risk_output, category_output, categories) = match role {
            Role::User => (QUERY_RISK_OUTPUT, QUERY_CATEGORY_OUTPUT, &QUERY_CATEGORIES[..]),
            Role::Assistant => (
                RESPONSE_RISK_OUTPUT,
                RESPONSE_CATEGORY_OUTPUT,
                &RESPONSE_CATEGORIES[..],
            ),
        };

        let seq_len = ids.len();
        let shape = [1_i64, seq_len as i64];
        let input_ids: Vec<i64> = ids.iter().map(|&id| id as i64).collect();
        let attention_mask: Vec<i64> = vec![1; seq_len];

        let input_ids_tensor = Tensor::from_array((shape, input_ids))
            .context("Failed to create input_ids tensor")?;
        let attention_mask_tensor = Tensor::from_array((shape, attention_mask))
            .context("Failed to create attention_mask tensor")?;

        let (risk_logits, category_logits) = {
            let mut session = self
                .session
                .lock()
                .map_err(|e| anyhow::anyhow!("Session lock poisoned: {}", e))?;

            let outputs = session
                .run(ort::inputs! {
                    "input_ids" => input_ids_tensor,
                    "attention_mask" => attention_mask_tensor
                })
                .context("ONNX inference failed")?;

            let extract = |name: &str| -> Result<Vec<f32>> {
                let value = outputs
                    .get(name)
                    .with_context(|| format!("Model has no output named {name}"))?;
                let (_shape, data) = value
                    .try_extract_tensor::<f32>()
                    .with_context(|| format!("Failed to extract {name} tensor"))?;
                Ok(data.to_vec())
            };

            (extract(risk_output)?, extract(category_output)?)
        };

        // Both outputs are [1, seq, labels].
        let risk_width = RISK_LABELS.len();
        let category_width = categories.len();
        if risk_logits.len() != seq_len * risk_width {
            anyhow::bail!(
                "{risk_output} has {} values, expected {} for {seq_len} tokens",
                risk_logits.len(),
                seq_len * risk_width
            );
        }
        if category_logits.len() != seq_len * category_width {
            anyhow::bail!(
                "{category_output} has {} values, expected {} for {seq_len} tokens",
                category_logits.len(),
                seq_len * category_width
            );
        }

        let verdicts = (seq_len - fed..seq_len)
            .map(|pos| {
                let risk_row = &risk_logits[pos * risk_width..(pos + 1) * risk_width];
                let category_row =
                    &category_logits[pos * category_width..(pos + 1) * category_width];
                logits_to_verdict(risk_row, category_row, categories)
            })
            .collect();
        Ok(verdicts)
    }
}

impl GuardModel for OnnxGuardModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn stream_moderate(
        &self,
        token_ids: &[u32],
        role: Role,
        state: Option<StreamState>,
    ) -> Result<(Vec<Verdict>, StreamState)> {
        let (state, mut context) = self.streams.checkout(state)?;
        context.extend_from_slice(token_ids);

        let verdicts = match self.classify_tail(&context, token_ids.len(), role) {
            Ok(v) => v,
            Err(e) => {
                self.streams.close(state);
                return Err(e);
            }
        };

        if let Err(e) = self.streams.checkin(&state, context) {
            self.streams.close(state);
            return Err(e);
        }

        debug!(
            stream = state.id(),
            role = %role,
            fed = token_ids.len(),
            last = ?verdicts.last(),
            "ONNX guard step"
        );
        Ok((verdicts, state))
    }

    fn close_stream(&self, state: StreamState) {
        self.streams.close(state);
    }
}

/// Index of the largest logit. NaN rows fall back to index 0.
fn argmax(row: &[f32]) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, best_val), (i, &v)| {
            if v > best_val {
                (i, v)
            } else {
                (best, best_val)
            }
        })
        .0
}

fn logits_to_verdict(risk_row: &[f32], category_row: &[f32], categories: &[Category]) -> Verdict {
    let risk_level = RISK_LABELS[argmax(risk_row)];
    if risk_level.is_safe() {
        return Verdict::safe();
    }
    Verdict::flagged(risk_level, categories[argmax(category_row)])
}
