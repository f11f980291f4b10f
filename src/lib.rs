//! agent-host - Python runtime provisioning and subprocess supervision for a
//! desktop agent host.
//!
//! # Architecture
//!
//! ```text
//!                  ┌──────────────┐
//!                  │  Supervisor  │
//!                  └──────┬───────┘
//!        ┌────────────────┼────────────────┐
//! ┌──────┴──────┐  ┌──────┴──────┐  ┌──────┴──────┐
//! │ Provisioner │  │  Composer   │  │   Runner    │
//! └──────┬──────┘  └──────┬──────┘  └─────────────┘
//!        └───────┬────────┘
//!         ┌──────┴──────┐
//!         │  Augmenter  │
//!         └─────────────┘
//! ```

pub mod cli;
pub mod config;
pub mod core;

pub use config::Config;
pub use core::compose::EnvComposer;
pub use core::python::Provisioner;
pub use core::supervisor::Supervisor;
