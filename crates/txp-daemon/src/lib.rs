//! txp-daemon library surface.
//!
//! `main.rs` is intentionally thin; everything the scenario tests need —
//! router construction, state wiring, response types — is exported here.

pub mod api_types;
pub mod error;
pub mod routes;
pub mod state;
