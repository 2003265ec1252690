//! # ReachClaw Providers
//!
//! Concrete collaborators for the outreach pipeline:
//! - [`OllamaGenerator`]: prompt-templated text generation against a local Ollama server
//! - [`HttpBridge`]: discovery and delivery through the browser-automation service

pub mod bridge;
pub mod ollama;

pub use bridge::HttpBridge;
pub use ollama::OllamaGenerator;
