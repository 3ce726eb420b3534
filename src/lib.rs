//! Real-time telephony-to-LLM bridge.
//!
//! Accepts telephony WebSocket audio, proxies it bidirectionally to a
//! cloud multimodal streaming model, returns synthesized speech to the
//! caller, and runs a post-call pipeline (call-detail fetch, transcript
//! persistence, analysis, WhatsApp notification) once the call ends.

pub mod analyzer;
pub mod audio;
pub mod cli;
pub mod config;
pub mod error;
pub mod generative;
pub mod llm;
pub mod notification;
pub mod persistence;
pub mod server;
pub mod session;
pub mod telephony;
pub mod tenant;
pub mod token;
pub mod transcript;

pub use config::Config;
pub use session::{Session, SessionClients};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
