// src/lib.rs

// Import the top-level `promptloom` module.
pub mod promptloom;

// Re-exporting key items for easier external access.
pub use promptloom::config::{HarnessConfig, TraceMode};
pub use promptloom::errand::{Errand, ErrandProfile, MultipleChoiceErrand};
pub use promptloom::error::HarnessError;
pub use promptloom::harness::{Harness, MessageType, Notification, NotificationStream};
pub use promptloom::lm_client::{CompletionConfig, LmClient, LmMessage, Role};
pub use promptloom::skill::Skill;
pub use promptloom::tiding::Tiding;
pub use promptloom::trace::Trace;

// Convenience paths to the submodules most callers need.
pub use promptloom::clients;
pub use promptloom::lm_client;
