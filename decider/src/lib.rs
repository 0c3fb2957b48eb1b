//! Autopolicy decider, the central authority.
//!
//! Accepts identity descriptions over HTTP, verifies them against
//! persistent filesystem state (blocking identity downgrades), and
//! resolves traffic profiles with a decreasing-specificity lookup
//! against device-advertised upstreams.

pub mod api;
pub mod db;
pub mod resolver;

pub use db::{Db, VerifyError};
pub use resolver::{ResolveError, Resolver};

/// The decider's long-lived state, shared across request handlers.
pub struct Decider {
    /// This authority's own identity, e.g. its host name.
    pub me: String,
    pub db: std::sync::Arc<Db>,
    pub resolver: Resolver,
}
