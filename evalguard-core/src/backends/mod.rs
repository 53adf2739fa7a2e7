//! Model backend implementations.
//!
//! - [`OpenAiBackend`]: any endpoint following the OpenAI chat completions API.
//! - [`MockBackend`]: scripted, deterministic backend for tests and dry runs.

pub mod mock;
pub mod openai;

pub use mock::MockBackend;
pub use openai::OpenAiBackend;
