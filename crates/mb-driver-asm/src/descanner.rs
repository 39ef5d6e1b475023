//! Mirror descanner.
//!
//! Counter-scans the beam movement so the signal of each beamlet stays
//! centred on its detector cell. Owns the acquisition setpoint computation
//! for its mirror.

use crate::config::DescannerSettings;
use crate::error::{AsmError, AsmResult};
use crate::setpoints;
use mb_core::attribute::{Attribute, AttributeSet};
use mb_core::data::Metadata;
use parking_lot::Mutex;
use std::f64::consts::PI;

/// Descan mirror that keeps the beamlets on their detector cells.
pub struct MirrorDescanner {
    clock_period: Attribute<f64>,
    rotation: Attribute<f64>,
    scan_offset: Attribute<(i32, i32)>,
    scan_gain: Attribute<(f64, f64)>,
    physical_flyback_time: f64,
    metadata: Mutex<Metadata>,
    attributes: AttributeSet,
}

impl std::fmt::Debug for MirrorDescanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorDescanner")
            .field("clock_period", &self.clock_period.get())
            .field("physical_flyback_time", &self.physical_flyback_time)
            .finish_non_exhaustive()
    }
}

impl MirrorDescanner {
    /// Create the descanner for a control clock running at `clock_frequency` Hz.
    pub fn new(clock_frequency: u64, settings: &DescannerSettings) -> AsmResult<Self> {
        if clock_frequency == 0 {
            return Err(AsmError::Configuration(
                "The ASM reported a descan control frequency of 0 Hz".to_string(),
            ));
        }
        if settings.physical_flyback_time < 0.0 {
            return Err(AsmError::Configuration(format!(
                "Physical flyback time must not be negative, got {} s",
                settings.physical_flyback_time
            )));
        }

        let clock_period = Attribute::new("clockPeriod", 1.0 / clock_frequency as f64)
            .with_units("s")
            .read_only();
        let rotation = Attribute::new("rotation", 0.0)
            .with_units("rad")
            .with_range(0.0, 2.0 * PI);
        let scan_offset = Attribute::new("scanOffset", (4000_i32, 4000_i32))
            .with_description("Mirror offset in setpoint units")
            .with_pair_range((-32768, -32768), (32767, 32767));
        let scan_gain = Attribute::new("scanGain", (10.0, 10.0))
            .with_description("Setpoint units per pixel")
            .with_pair_range((-1000.0, -1000.0), (1000.0, 1000.0));

        let mut attributes = AttributeSet::new();
        attributes.register(clock_period.clone());
        attributes.register(rotation.clone());
        attributes.register(scan_offset.clone());
        attributes.register(scan_gain.clone());

        Ok(Self {
            clock_period,
            rotation,
            scan_offset,
            scan_gain,
            physical_flyback_time: settings.physical_flyback_time,
            metadata: Mutex::new(Metadata::new()),
            attributes,
        })
    }

    /// Descanner clock period [s].
    pub fn clock_period(&self) -> f64 {
        self.clock_period.get()
    }

    /// Rotation of the descan pattern [rad].
    pub fn rotation(&self) -> &Attribute<f64> {
        &self.rotation
    }

    /// Offset of the descan signal (x, y) [setpoint units].
    pub fn scan_offset(&self) -> &Attribute<(i32, i32)> {
        &self.scan_offset
    }

    /// Gain of the descan signal (x, y).
    pub fn scan_gain(&self) -> &Attribute<(f64, f64)> {
        &self.scan_gain
    }

    /// Time for the mirror to return to its start position [s].
    pub fn physical_flyback_time(&self) -> f64 {
        self.physical_flyback_time
    }

    /// Attributes by name.
    pub fn attributes(&self) -> &AttributeSet {
        &self.attributes
    }

    /// Descanner metadata.
    pub fn metadata(&self) -> Metadata {
        self.metadata.lock().clone()
    }

    /// Merge `values` into the descanner metadata.
    pub fn update_metadata(&self, values: Metadata) {
        self.metadata.lock().extend(values);
    }

    /// X setpoints for one row of `cell_size` pixels at `dwell_time`.
    pub fn x_acq_setpoints(&self, dwell_time: f64, cell_size: u32) -> AsmResult<Vec<i16>> {
        setpoints::x_acquisition_setpoints(
            f64::from(self.scan_offset.get().0),
            self.scan_gain.get().0,
            cell_size,
            dwell_time,
            self.clock_period(),
            self.physical_flyback_time,
        )
    }

    /// Y setpoints, one per row of a cell of `cell_size` rows.
    pub fn y_acq_setpoints(&self, cell_size: u32) -> AsmResult<Vec<i16>> {
        setpoints::y_acquisition_setpoints(
            f64::from(self.scan_offset.get().1),
            self.scan_gain.get().1,
            cell_size,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descanner() -> MirrorDescanner {
        MirrorDescanner::new(1_000_000, &DescannerSettings::default()).unwrap()
    }

    #[test]
    fn defaults_and_ranges() {
        let descanner = descanner();
        assert_eq!(descanner.scan_offset().get(), (4000, 4000));
        assert_eq!(descanner.scan_gain().get(), (10.0, 10.0));
        assert!(descanner.scan_offset().set((40000, 0)).is_err());
        assert!(descanner.scan_gain().set((0.0, -1001.0)).is_err());
        assert!(descanner.rotation().set(7.0).is_err());
    }

    #[test]
    fn acquisition_setpoints_use_current_values() {
        let descanner = descanner();
        let y = descanner.y_acq_setpoints(800).unwrap();
        assert_eq!(y.len(), 800);
        assert_eq!(y[0], (4000.0 - 0.5 * 800.0 * 10.0) as i16);

        let x = descanner.x_acq_setpoints(1e-6, 800).unwrap();
        let period = descanner.clock_period();
        let expected = (1e-6 * 800.0 / period).ceil() as usize
            + (descanner.physical_flyback_time() / period).ceil() as usize;
        assert_eq!(x.len(), expected);

        // Large gains leave the 16 bit range of the API.
        descanner.scan_gain().set((100.0, 100.0)).unwrap();
        assert!(descanner.y_acq_setpoints(800).is_err());
    }

    #[test]
    fn invalid_construction() {
        assert!(MirrorDescanner::new(0, &DescannerSettings::default()).is_err());
        let settings = DescannerSettings {
            physical_flyback_time: -1.0,
        };
        assert!(MirrorDescanner::new(1_000_000, &settings).is_err());
    }
}
