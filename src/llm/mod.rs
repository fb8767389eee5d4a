//! Shared language-model request manager.
//!
//! All model consumers (site discovery, profile extraction, link ranking)
//! go through [`StructuredCaller`], which enforces concurrency limits, rate
//! budgets, structured-output constraints, degeneration detection, and
//! health-weighted vendor fallback.

mod caller;
mod config;
pub mod degeneration;
mod health;
pub mod schema;

pub use caller::{CallContext, ChatMessage, LlmError, StructuredCaller};
pub use config::VendorConfig;
pub use health::{CallSample, VendorHealth, SCORE_FLOOR};
