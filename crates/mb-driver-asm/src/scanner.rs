//! Electron-beam scanner.

use crate::error::{AsmError, AsmResult};
use mb_core::attribute::{Attribute, AttributeSet};
use mb_core::data::{Metadata, MD_DWELL_TIME, MD_PIXEL_SIZE};
use parking_lot::Mutex;
use serde_json::json;
use std::f64::consts::PI;

/// Shortest dwell time the hardware supports [s].
pub const MIN_DWELL_TIME: f64 = 4e-7;
/// Longest dwell time [s].
pub const MAX_DWELL_TIME: f64 = 1e-4;

/// Added before truncating to clock ticks, so that values that are a whole
/// number of ticks do not lose one to floating point error.
const TICK_EPSILON: f64 = 1e-6;

/// Convert a duration to a whole number of clock ticks (truncated).
pub(crate) fn to_ticks(seconds: f64, clock_period: f64) -> i64 {
    (seconds / clock_period + TICK_EPSILON).floor() as i64
}

/// The e-beam scanner of the multibeam system.
///
/// Its clock period is fixed at construction from the clock frequency
/// reported by the ASM.
pub struct EBeamScanner {
    clock_period: Attribute<f64>,
    resolution: Attribute<(u32, u32)>,
    dwell_time: Attribute<f64>,
    pixel_size: Attribute<(f64, f64)>,
    rotation: Attribute<f64>,
    scan_offset: Attribute<(f64, f64)>,
    scan_gain: Attribute<(f64, f64)>,
    scan_delay: Attribute<(f64, f64)>,
    metadata: Mutex<Metadata>,
    attributes: AttributeSet,
}

impl std::fmt::Debug for EBeamScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EBeamScanner")
            .field("clock_period", &self.clock_period.get())
            .field("resolution", &self.resolution.get())
            .field("dwell_time", &self.dwell_time.get())
            .finish_non_exhaustive()
    }
}

impl EBeamScanner {
    /// Create the scanner for a clock running at `clock_frequency` Hz.
    pub fn new(clock_frequency: u64) -> AsmResult<Self> {
        if clock_frequency == 0 {
            return Err(AsmError::Configuration(
                "The ASM reported a scanner clock frequency of 0 Hz".to_string(),
            ));
        }
        let clock_period = 1.0 / clock_frequency as f64;
        let min_dwell_time = clock_period.max(MIN_DWELL_TIME);

        let clock_period = Attribute::new("clockPeriod", clock_period)
            .with_units("s")
            .read_only();
        let resolution = Attribute::new("resolution", (6400_u32, 6400_u32))
            .with_units("px")
            .with_pair_range((10, 10), (8000, 8000));
        let dwell_time = Attribute::new("dwellTime", min_dwell_time)
            .with_units("s")
            .with_range(min_dwell_time, MAX_DWELL_TIME);
        let pixel_size = Attribute::new("pixelSize", (4e-9, 4e-9))
            .with_description("Square pixels only, the height follows the width")
            .with_units("m")
            .with_coercion(|size: (f64, f64)| {
                if size.0 == size.1 {
                    size
                } else {
                    tracing::warn!(
                        "Non-square pixel size entered, only square pixel sizes are supported. \
                         Width of pixel size is used as height."
                    );
                    (size.0, size.0)
                }
            })
            .with_pair_range((1e-9, 1e-9), (1e-3, 1e-3));
        let rotation = Attribute::new("rotation", 0.0)
            .with_units("rad")
            .with_range(0.0, 2.0 * PI);
        let scan_offset = Attribute::new("scanOffset", (0.0, 0.0))
            .with_pair_range((-10.0, -10.0), (10.0, 10.0));
        let scan_gain = Attribute::new("scanGain", (0.0, 0.0))
            .with_pair_range((-10.0, -10.0), (10.0, 10.0));
        let scan_delay = Attribute::new("scanDelay", (0.0, 0.0))
            .with_description("Delay before the scanner starts, per axis")
            .with_units("s")
            .with_pair_range((0.0, 0.0), (200e-6, 10.0));

        let mut metadata = Metadata::new();
        metadata.insert(MD_PIXEL_SIZE.to_string(), json!(pixel_size.get()));
        metadata.insert(MD_DWELL_TIME.to_string(), json!(dwell_time.get()));

        let mut attributes = AttributeSet::new();
        attributes.register(clock_period.clone());
        attributes.register(resolution.clone());
        attributes.register(dwell_time.clone());
        attributes.register(pixel_size.clone());
        attributes.register(rotation.clone());
        attributes.register(scan_offset.clone());
        attributes.register(scan_gain.clone());
        attributes.register(scan_delay.clone());

        Ok(Self {
            clock_period,
            resolution,
            dwell_time,
            pixel_size,
            rotation,
            scan_offset,
            scan_gain,
            scan_delay,
            metadata: Mutex::new(metadata),
            attributes,
        })
    }

    /// Scanner clock period [s].
    pub fn clock_period(&self) -> f64 {
        self.clock_period.get()
    }

    /// Field resolution [px].
    pub fn resolution(&self) -> &Attribute<(u32, u32)> {
        &self.resolution
    }

    /// Time spent on each pixel [s].
    pub fn dwell_time(&self) -> &Attribute<f64> {
        &self.dwell_time
    }

    /// Pixel size (x, y) [m]. Always square.
    pub fn pixel_size(&self) -> &Attribute<(f64, f64)> {
        &self.pixel_size
    }

    /// Scan rotation [rad].
    pub fn rotation(&self) -> &Attribute<f64> {
        &self.rotation
    }

    /// Offset of the scan signal (x, y) [V].
    pub fn scan_offset(&self) -> &Attribute<(f64, f64)> {
        &self.scan_offset
    }

    /// Gain of the scan signal (x, y).
    pub fn scan_gain(&self) -> &Attribute<(f64, f64)> {
        &self.scan_gain
    }

    /// Delay between the trigger and the start of the scan (x, y) [s].
    pub fn scan_delay(&self) -> &Attribute<(f64, f64)> {
        &self.scan_delay
    }

    /// Attributes by name.
    pub fn attributes(&self) -> &AttributeSet {
        &self.attributes
    }

    /// Dwell time in ticks of the scanner clock.
    pub fn ticks_dwell_time(&self) -> i64 {
        to_ticks(self.dwell_time.get(), self.clock_period())
    }

    /// Scan delay in ticks of the scanner clock.
    pub fn ticks_scan_delay(&self) -> (i64, i64) {
        let (x, y) = self.scan_delay.get();
        let period = self.clock_period();
        (to_ticks(x, period), to_ticks(y, period))
    }

    /// Metadata with the current pixel size and dwell time.
    pub fn metadata(&self) -> Metadata {
        let mut metadata = self.metadata.lock();
        metadata.insert(MD_PIXEL_SIZE.to_string(), json!(self.pixel_size.get()));
        metadata.insert(MD_DWELL_TIME.to_string(), json!(self.dwell_time.get()));
        metadata.clone()
    }

    /// Merge `values` into the scanner metadata.
    pub fn update_metadata(&self, values: Metadata) {
        self.metadata.lock().extend(values);
    }
}
