//! Provider-side implementations consumed by the factory.
//!
//! Real platform builders live in host applications; this crate ships only
//! the deterministic mock used for wiring and tests.

pub mod mock;

pub use mock::{MockBuilder, MockHandle};
