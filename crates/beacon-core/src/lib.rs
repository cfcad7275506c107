//! # beacon-core - Domain Types for the Beacon SDK
//!
//! Shared foundation for the Beacon attribution client: error taxonomy,
//! session state machine, session-token storage, configuration, and the
//! logging bootstrap.
//!
//! Depends on nothing else in the workspace; `beacon-queue` and
//! `beacon-sdk` build on top of it.
//!
//! ## Public API
//!
//! - [`Error`] / [`Result`] - error taxonomy with retryability predicates
//! - [`SessionState`] / [`SessionStateMachine`] - validated session lifecycle
//! - [`SessionTokens`] / [`TokenStore`] - session-identifying tokens
//! - [`BeaconConfig`] - timeouts, retry limits, and service endpoints
//! - [`logging::init()`] - tracing subscriber setup

pub mod config;
pub mod error;
pub mod logging;
pub mod prelude;
pub mod session;
pub mod tokens;

pub use config::BeaconConfig;
pub use error::{Error, Result, ResultExt};
pub use session::{ObserverId, SessionState, SessionStateMachine};
pub use tokens::{SessionTokens, TokenStore};
