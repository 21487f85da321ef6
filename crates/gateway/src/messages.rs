//! Wire envelopes for the three protocols the gateway speaks.
//!
//! `anthropic` is the client-facing shape, `openai` is the canonical
//! interior shape all OpenAI-compatible providers consume, and `gemini` is
//! the wrapper envelope for Google upstreams. Translation between them
//! lives in [`crate::translate`].

pub mod anthropic;
pub mod gemini;
pub mod openai;
