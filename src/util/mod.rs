//! Small utilities shared across components: lenient LLM JSON extraction
//! and prompt-oriented state compression.

pub mod compress;
pub mod json;

pub use compress::{compress_state_for_prompt, compress_value, state_fingerprint, truncate_preview};
pub use json::extract_json;
