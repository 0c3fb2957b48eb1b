//! Shared data model for the autopolicy enforcer and decider.
//!
//! An [`Identity`] is the set of claims a device asserts about itself
//! plus the administrative metadata the enforcer fills in. A
//! [`Profile`] is the free-form traffic description the decider hands
//! back, interpreted by the enforcer's traffic-control compiler via
//! [`ServiceSpec`] rules.

pub mod identity;
pub mod profile;
pub mod service;

pub use identity::{Identity, IdentityError};
pub use profile::{DeviceRules, Direction, Profile, ProfileError};
pub use service::{Dir, PortSpec, Prefix, Proto, ServiceSpec, SpecError};
