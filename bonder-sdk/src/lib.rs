//! Shared, dependency-light types for the bridge bonder.
//!
//! Everything here is safe to depend on from dashboards and other external
//! consumers of the published liquidity snapshot.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

#[cfg(feature = "client")]
pub mod client;
pub mod objects;
pub mod signature;
