//! Command handlers
//!
//! Each handler returns `AppResult`; `main` turns errors into exit codes.

pub mod config;
pub mod record;
