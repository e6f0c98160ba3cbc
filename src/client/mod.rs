//! Client-side core - bridge supervision and event consumption
//!
//! Everything the embedding desktop shell links against: `process`
//! supervises the bridge child and correlates commands with responses,
//! `router` folds the event stream into per-session conversation state, and
//! `stream` holds the delta-reconciliation algebra the router applies.

pub mod process;
pub mod router;
pub mod stream;

pub use process::{AgentProcess, AgentProcessStreams};
pub use router::{ConversationItem, EventRouter, ItemKind, SessionView, TokenUsage, ToolStatus};
pub use stream::{merge_overlap, normalize_ingest, StreamingCursor};
