//! HTTP API for Nakle
//!
//! OpenAI-style chat completions plus usage reporting.

mod handlers;
mod sse;
mod types;

pub use handlers::create_router;

use crate::db::Database;
use crate::runner::ProductionRunner;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<ProductionRunner>,
    /// Usage queries read straight from the database
    pub db: Database,
    /// Model alias used when a request names none
    pub default_model: String,
}
