//! Registry of externally registered capability providers.
//!
//! # Main types
//!
//! - [`CapabilityProvider`] — Trait implemented by every provider kind.
//! - [`HttpCapabilityProvider`] — Provider reached over HTTP.
//! - [`CapabilityRegistry`] — Registration, invocation and health tracking.

/// Provider trait and the HTTP implementation.
pub mod provider;
/// Provider registry with health probes.
pub mod registry;

pub use provider::{CapabilityProvider, HttpCapabilityProvider, Invocation};
pub use registry::CapabilityRegistry;
