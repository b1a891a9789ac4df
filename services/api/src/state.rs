//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds all shared,
//! clonable resources like the database pool, the question bank and the
//! flow capabilities.

use qflow_core::{FlowServices, QuestionBank};
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
/// All fields are public to be accessible from other modules.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<crate::db::Db>,
    pub bank: Arc<QuestionBank>,
    pub services: FlowServices,
}
