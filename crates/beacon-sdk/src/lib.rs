//! # beacon-sdk - Attribution Client SDK
//!
//! Public surface of the Beacon SDK: a dependency-injected [`Beacon`]
//! client that serializes sessions, link creation, and event logging
//! through the asynchronous request queue in [`beacon_queue`].
//!
//! ```no_run
//! use beacon_core::BeaconConfig;
//! use beacon_sdk::{Beacon, EventData, StandardEvent};
//! # use beacon_core::Result;
//! # async fn run(transport: impl beacon_queue::Transport + Send + Sync + 'static) -> Result<()> {
//! let beacon = Beacon::new(BeaconConfig::with_key("key_live_example"), transport)?;
//! beacon.open_session().outcome().await?;
//! beacon
//!     .log_event(&EventData::standard(StandardEvent::Purchase).revenue(19.99, "USD"))
//!     .outcome()
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Public API
//!
//! - [`Beacon`] - the SDK root object (sessions, links, events, identity)
//! - [`LinkData`] - link parameters and long-link fallback
//! - [`EventData`] / [`StandardEvent`] - event payloads
//! - [`TrackingController`] - user data tracking switch

pub mod client;
pub mod events;
pub mod link;
pub mod tracking;

pub use client::Beacon;
pub use events::{EventData, StandardEvent};
pub use link::LinkData;
pub use tracking::TrackingController;

// Re-exported so hosts implementing a transport or inspecting state need
// only this crate.
pub use beacon_core::{BeaconConfig, Error, ObserverId, Result, SessionState};
pub use beacon_queue::{
    OperationHandle, PreparedRequest, Transport, TransportResponse, WaitLock,
};
