//! # Multibeam DAQ
//!
//! Acquisition control for a multibeam scanning electron microscope whose
//! scanning and detection are handled by an Acquisition Scan Module (ASM).
//!
//! ## Crate Structure
//!
//! - **`config`**: loading and validating the application configuration from
//!   TOML files and `MULTIBEAM_DAQ_` environment variables.
//! - **`logging`**: `tracing` subscriber set-up (pretty, compact or JSON).
//! - **`commands`**: the operations behind the command-line subcommands.
//!
//! The device model lives in the workspace crates, re-exported here:
//! [`mb_core`] (attributes, image data, errors) and [`mb_driver_asm`]
//! (ASM client, scanner, descanner, MPPC detector, acquisition sequencer and
//! calibration loop).

pub mod commands;
pub mod config;
pub mod logging;

pub use mb_core;
pub use mb_driver_asm;
