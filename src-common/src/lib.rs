//! camrec common library
//!
//! Types shared between the capture/recording service crate and the CLI:
//! capture configuration, codec policy values, recording state, the on-disk
//! configuration file and the platform log directory.

pub mod config;
pub mod logging;
pub mod types;

pub use types::*;
