//! Coordination layer for a multiplayer map wargame: match phases, sector
//! and deployment zone definition, readiness, director election, and a
//! resilient event channel to the match authority.

pub mod authority;
pub mod config;
pub mod connection;
pub mod constants;
pub mod engine;
pub mod error;
pub mod geometry;
pub mod observer;
pub mod protocol;
pub mod reconcile;
pub mod router;
pub mod session;
pub mod types;
pub mod utils;
