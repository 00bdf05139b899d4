// Guard models — the streaming classifier behind a trait.
//
// GuardModel is the only seam the moderation service talks to. The ONNX
// backend runs the exported guard model locally; the lexicon backend is a
// rule-based fallback that needs nothing but the tokenizer.

pub mod download;
pub mod lexicon;
pub mod onnx;
pub mod streams;
pub mod traits;
