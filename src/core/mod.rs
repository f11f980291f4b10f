//! Runtime provisioning, environment composition and process supervision.

pub mod augment;
pub mod compose;
mod error;
pub mod keychain;
pub mod process;
pub mod python;
pub mod secret;
pub mod supervisor;
pub mod types;

pub use error::{Error, Result};
