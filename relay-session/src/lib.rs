//! Relay Session - Per-user bounded conversation state.
//!
//! The stateful core of the chat relay:
//! - [`RateLimiter`]: per-user minute/hour sliding windows
//! - [`ConversationStore`]: capped turn log with an incrementally folded summary
//! - [`Summarizer`]: merges aged-out turns into the running summary
//! - [`Sweeper`]: evicts idle users on a timer
//! - [`Orchestrator`]: admit → record → prompt → reply
//!
//! ## Architecture
//!
//! ```text
//! webhook → Orchestrator ── RateLimiter
//!               │
//!               ├── ConversationStore ── Summarizer ── Provider
//!               ├── Provider (reply)
//!               └── MessageSender
//!
//! Sweeper ──(interval)──► RateLimiter + ConversationStore
//! ```
//!
//! Everything is in process memory; nothing survives a restart.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

mod capacity;

pub mod orchestrator;
pub mod rate_limit;
pub mod store;
pub mod summarizer;
pub mod sweeper;
pub mod traits;
pub mod types;

pub use orchestrator::{MessageOutcome, Orchestrator, ReplyTexts};
pub use rate_limit::{RateDecision, RateLimiter, RateLimits, RateScope};
pub use store::{ConversationRecord, ConversationStore, SessionGuard, StoreLimits, SummaryPlan};
pub use summarizer::{Summarizer, SUMMARY_SYSTEM_PROMPT};
pub use sweeper::{SweepReport, Sweeper};
pub use traits::{MessageSender, Provider};
pub use types::{now_millis, ChatMessage, MessageRole, Turn, TurnRole};
