//! An out-of-the-box agent that assembles the built-in tools around a model
//! provider.
//!
//! The crate includes a CLI tool that plays a scripted model in the
//! terminal. And you can also use it as a library to bring the agent loop
//! into your own host apps.

#![deny(missing_docs)]

#[macro_use]
extern crate tracing;

pub mod config;
mod session;
pub mod tools;

pub use session::{Session, SessionBuilder};

/// Re-exports of [`relay_core`] crate.
pub mod core {
    pub use relay_core::*;
}

/// Re-exports of [`relay_model`] crate.
pub mod model {
    pub use relay_model::*;
}
