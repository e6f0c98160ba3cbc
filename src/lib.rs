//! Clawdeck - session bridge and orchestration core
//!
//! Clawdeck multiplexes concurrent Claude Code conversations, one per
//! user-selected project directory, behind a line-framed JSON protocol that
//! a desktop shell drives over the bridge's stdio.
//!
//! ## Architecture
//!
//! ```text
//! Desktop shell ←→ line JSON ←→ clawdeck serve ←→ stream-json ←→ Claude Code CLI
//!  ├ client::process (C1)       ├ bridge::dispatcher             (one per session)
//!  ├ client::router  (C4)       ├ bridge::session   (C2)
//!  └ registry        (C5)       ├ bridge::permission (C3)
//!                               └ vendor::query
//! ```
//!
//! Commands flow shell → dispatcher → session manager → vendor process;
//! events flow back through the single stdout writer to the shell's event
//! router. The registry sits beside the shell and records which sessions
//! are visible per workspace, surviving restarts via atomic rewrites.
//!
//! ## Modules
//!
//! - [`protocol`]: command/response and event envelopes (the stdio wire)
//! - [`vendor`]: Claude Code CLI processes and their stream-json frames
//! - [`bridge`]: command dispatch, session lifecycle, tool approvals
//! - [`client`]: bridge supervision and per-session conversation state
//! - [`registry`]: persistent per-workspace session visibility
//! - [`config`]: configuration management

pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod vendor;

pub use config::ClawdeckConfig;
pub use error::{Error, Result};
