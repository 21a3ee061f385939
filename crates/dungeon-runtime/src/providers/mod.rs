//! Text-generation backends
//!
//! Concrete implementations of the AIProvider trait.

pub mod ollama;

pub use ollama::OllamaProvider;
