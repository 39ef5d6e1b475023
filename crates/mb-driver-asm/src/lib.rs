//! `mb-driver-asm`
//!
//! Driver for the Acquisition Scan Module (ASM) of a multibeam scanning
//! electron microscope, and for the devices it controls: the e-beam scanner,
//! the mirror descanner and the MPPC detector.
//!
//! ## Key Types
//!
//! - [`server::AcquisitionServer`]: connects to the ASM and owns the devices
//! - [`mppc::Mppc`] / [`mppc::DataFlow`]: mega-field acquisition and the
//!   field image stream
//! - [`sequencer::AcquisitionSequencer`]: command queue and worker task
//! - [`calibration::CalibrationController`]: continuous calibration loop
//! - [`client::AsmClient`]: typed REST client, over any [`transport::AsmTransport`]
//! - [`simulator::SimulatedAsm`]: in-process ASM for tests and `--simulate`
//!
//! ## Example
//!
//! ```no_run
//! use mb_driver_asm::{AcquisitionServer, AsmDriverConfig, DataContent};
//!
//! # async fn run() -> Result<(), mb_driver_asm::AsmError> {
//! let server = AcquisitionServer::connect(AsmDriverConfig::new("http://localhost:8080/v2")).await?;
//! let image = server.mppc().data().get_with(DataContent::Thumbnail, (0, 0)).await?;
//! println!("{} x {}", image.width, image.height);
//! server.terminate().await;
//! # Ok(())
//! # }
//! ```

pub mod calibration;
pub mod client;
pub mod config;
pub mod descanner;
pub mod descriptors;
pub mod error;
pub mod mppc;
pub mod scanner;
pub mod sequencer;
pub mod server;
pub mod setpoints;
pub mod simulator;
pub mod storage;
pub mod transport;

pub use client::{AsmClient, HwState};
pub use config::AsmDriverConfig;
pub use descriptors::{CalibrationLoopParameters, DataContent, FieldMetadata, MegaFieldMetadata};
pub use error::{ApiError, AsmError, AsmResult};
pub use mppc::{DataFlow, Mppc};
pub use sequencer::SequencerState;
pub use server::AcquisitionServer;
pub use simulator::SimulatedAsm;
pub use transport::{AsmTransport, HttpTransport};
