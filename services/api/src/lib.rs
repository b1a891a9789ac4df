//! Question Flow API Library Crate
//!
//! This library contains the web service around the question flow: the
//! application state, database access, API handlers and routing. The `api`
//! binary is a thin wrapper around this library.

pub mod config;
pub mod db;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
