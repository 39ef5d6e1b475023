//! `mb-core`
//!
//! Building blocks shared by the multibeam acquisition drivers.
//!
//! ## Key Types
//!
//! - [`attribute::Attribute`]: typed configuration value with write hooks
//!   and synchronous listeners
//! - [`attribute::AttributeSet`]: name-indexed registry of a device's attributes
//! - [`listeners::ListenerSet`]: ordered synchronous fan-out, also used for
//!   image streams
//! - [`data::DataArray`]: grey-level image with metadata
//! - [`error::DaqError`]: workspace error type

pub mod attribute;
pub mod data;
pub mod error;
pub mod listeners;

pub use attribute::{Attribute, AttributeBase, AttributeSet, WritePolicy};
pub use data::{DataArray, Metadata};
pub use error::{AppResult, DaqError, DriverError, DriverErrorKind};
pub use listeners::{ListenerId, ListenerSet};
