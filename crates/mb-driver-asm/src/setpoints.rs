//! Setpoint generation for the descan mirror and the scanner.
//!
//! All functions are pure. Values are computed in floating point, checked
//! against the signed 16-bit range of the API and then truncated toward zero.

use crate::error::{AsmError, AsmResult};
use std::f64::consts::PI;

/// Smallest value the ASM accepts for a setpoint.
pub const SETPOINT_MIN: f64 = -32768.0;
/// Largest value the ASM accepts for a setpoint.
pub const SETPOINT_MAX: f64 = 32767.0;

/// Relative tolerance when comparing clock periods.
const PERIOD_TOLERANCE: f64 = 1e-6;

/// Number of samples of `arange(start, stop, step)`.
fn arange_len(start: f64, stop: f64, step: f64) -> usize {
    let len = ((stop - start) / step).ceil();
    if len.is_finite() && len > 0.0 {
        len as usize
    } else {
        0
    }
}

/// Sawtooth of period 2π rising from -1 to 1.
fn sawtooth(phase: f64) -> f64 {
    phase.rem_euclid(2.0 * PI) / PI - 1.0
}

fn to_wire(values: &[f64]) -> AsmResult<Vec<i16>> {
    if values
        .iter()
        .any(|&v| !(SETPOINT_MIN..=SETPOINT_MAX).contains(&v))
    {
        return Err(AsmError::Configuration(
            "Setpoint values are too big/small to be handled by the ASM API".to_string(),
        ));
    }
    Ok(values.iter().map(|&v| v as i16).collect())
}

/// Descan setpoints in X for one row of pixels.
///
/// A linear ramp over `dwell_time * cell_size` sampled every `descan_period`,
/// followed by `ceil(flyback_time / descan_period)` points at the base value
/// `offset - 0.5 * cell_size * gain`.
pub fn x_acquisition_setpoints(
    offset: f64,
    gain: f64,
    cell_size: u32,
    dwell_time: f64,
    descan_period: f64,
    flyback_time: f64,
) -> AsmResult<Vec<i16>> {
    if descan_period <= 0.0 || dwell_time <= 0.0 {
        return Err(AsmError::Configuration(format!(
            "Cannot compute X setpoints with descan period {} s and dwell time {} s",
            descan_period, dwell_time
        )));
    }

    let cell_size = f64::from(cell_size);
    let base = offset - 0.5 * cell_size * gain;
    let slope = gain / dwell_time;

    let scanning = arange_len(0.0, dwell_time * cell_size, descan_period);
    let flyback = (flyback_time / descan_period).ceil().max(0.0) as usize;

    let mut values = Vec::with_capacity(scanning + flyback);
    values.extend((0..scanning).map(|i| base + slope * (i as f64 * descan_period)));
    values.extend(std::iter::repeat(base).take(flyback));

    to_wire(&values)
}

/// Descan setpoints in Y, one per row of pixels.
///
/// Steps of `gain` from `offset - 0.5 * cell_size * gain` up to (excluding)
/// `offset + 0.5 * cell_size * gain`. Exactly `cell_size` values are required.
pub fn y_acquisition_setpoints(offset: f64, gain: f64, cell_size: u32) -> AsmResult<Vec<i16>> {
    let half_span = 0.5 * f64::from(cell_size) * gain;
    let first = offset - half_span;
    let last = offset + half_span;

    let len = if gain == 0.0 {
        0
    } else {
        arange_len(first, last, gain)
    };
    if len != cell_size as usize {
        return Err(AsmError::Configuration(format!(
            "Error in creation of Y setpoints: {} values for a cell size of {}",
            len, cell_size
        )));
    }

    let values: Vec<f64> = (0..len).map(|i| first + i as f64 * gain).collect();
    to_wire(&values)
}

/// Check that the descanner period is a whole multiple of the scanner period.
pub fn ensure_clock_multiple(descan_period: f64, scan_period: f64) -> AsmResult<()> {
    let ratio = descan_period / scan_period;
    if !ratio.is_finite() || (ratio - ratio.round()).abs() > PERIOD_TOLERANCE * ratio.max(1.0) {
        tracing::error!(
            "Descanner clock period {} s is not a whole multiple of the scanner clock period {} s",
            descan_period,
            scan_period
        );
        return Err(AsmError::Configuration(
            "Descanner clock period is no longer a whole multiple of the scanner clock period"
                .to_string(),
        ));
    }
    Ok(())
}

/// Inputs of the calibration signal computation.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationInputs {
    /// Scanner dwell time [s].
    pub dwell_time: f64,
    /// Scanner clock period [s].
    pub scan_clock_period: f64,
    /// Descanner clock period [s].
    pub descan_clock_period: f64,
    /// Cell resolution along X [px].
    pub resolution: u32,
    /// Descan mirror flyback time [s].
    pub flyback_time: f64,
    /// Descanner gain (x, y).
    pub descan_gain: (f64, f64),
    /// Scanner gain (x, y).
    pub scan_gain: (f64, f64),
    /// Scanner setpoints per period.
    pub scan_points: usize,
    /// Lowest allowed frequency [Hz].
    pub min_frequency: f64,
    /// Highest allowed frequency [Hz].
    pub max_frequency: f64,
}

/// Sampled calibration waveforms, ready for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationWaveforms {
    /// Period of the signal [s].
    pub period: f64,
    /// Frequency of the signal [Hz].
    pub frequency: f64,
    /// Descanner X setpoints.
    pub x_descan: Vec<i16>,
    /// Descanner Y setpoints.
    pub y_descan: Vec<i16>,
    /// Scanner X setpoints.
    pub x_scan: Vec<i16>,
    /// Scanner Y setpoints.
    pub y_scan: Vec<i16>,
}

/// One period of the calibration signal: a sine in X and a sawtooth in Y.
///
/// The descanner is sampled at its clock period, the scanner with
/// `scan_points` evenly spaced points including both ends of the period.
pub fn calibration_waveforms(inputs: &CalibrationInputs) -> AsmResult<CalibrationWaveforms> {
    ensure_clock_multiple(inputs.descan_clock_period, inputs.scan_clock_period)?;

    let descan_period = inputs.descan_clock_period;
    let scanning_time = inputs.dwell_time * f64::from(inputs.resolution);

    // Round the period up to whole descan clock periods.
    let periods = scanning_time / descan_period;
    let flyback_time = if (periods - periods.round()).abs() > PERIOD_TOLERANCE {
        inputs.flyback_time + descan_period
    } else {
        inputs.flyback_time
    };

    let period = scanning_time + flyback_time;
    let frequency = 1.0 / period;
    if !(inputs.min_frequency..=inputs.max_frequency).contains(&frequency) {
        tracing::error!(
            "Calibration would require a frequency of {:.1} Hz, supported range is {} to {} Hz",
            frequency,
            inputs.min_frequency,
            inputs.max_frequency
        );
        return Err(AsmError::Configuration(format!(
            "Calibration of given values requires a calibration frequency of {:.1} Hz which is \
             out of range [{}, {}] Hz",
            frequency, inputs.min_frequency, inputs.max_frequency
        )));
    }

    let omega = 2.0 * PI * frequency;

    let descan_times: Vec<f64> = (0..arange_len(0.0, period, descan_period))
        .map(|i| i as f64 * descan_period)
        .collect();
    let scan_times: Vec<f64> = match inputs.scan_points {
        0 => Vec::new(),
        1 => vec![0.0],
        n => (0..n)
            .map(|i| period * i as f64 / (n - 1) as f64)
            .collect(),
    };

    let sine = |gain: f64, times: &[f64]| -> Vec<f64> {
        times.iter().map(|t| gain * (omega * t).sin()).collect()
    };
    let saw = |gain: f64, times: &[f64]| -> Vec<f64> {
        times.iter().map(|t| gain * sawtooth(omega * t)).collect()
    };

    Ok(CalibrationWaveforms {
        period,
        frequency,
        x_descan: to_wire(&sine(inputs.descan_gain.0, &descan_times))?,
        y_descan: to_wire(&saw(inputs.descan_gain.1, &descan_times))?,
        x_scan: to_wire(&sine(inputs.scan_gain.0, &scan_times))?,
        y_scan: to_wire(&saw(inputs.scan_gain.1, &scan_times))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCAN_PERIOD: f64 = 1e-6;
    const FLYBACK: f64 = 250e-6;

    #[test]
    fn x_setpoints_length_and_bounds() {
        for &(dwell, cell, gain, offset) in &[
            (1e-6, 800_u32, 10.0, 4000.0),
            (4e-7, 900, 7.5, 1000.0),
            (2.5e-6, 100, -3.0, -2000.0),
        ] {
            let setpoints =
                x_acquisition_setpoints(offset, gain, cell, dwell, DESCAN_PERIOD, FLYBACK).unwrap();
            let expected_len = (dwell * f64::from(cell) / DESCAN_PERIOD).ceil() as usize
                + (FLYBACK / DESCAN_PERIOD).ceil() as usize;
            assert_eq!(setpoints.len(), expected_len);

            let base = (offset - 0.5 * f64::from(cell) * gain) as i16;
            assert_eq!(setpoints[0], base);
            assert_eq!(*setpoints.last().unwrap(), base);
            if gain > 0.0 {
                let top = (offset + 0.5 * f64::from(cell) * gain) as i16;
                assert_eq!(*setpoints.iter().min().unwrap(), base);
                assert!(*setpoints.iter().max().unwrap() <= top);
            }
        }
    }

    #[test]
    fn y_setpoints_span_the_cell() {
        for &(cell, gain, offset) in &[(800_u32, 10.0, 4000.0), (777, 7.0, 0.0), (10, 1.0, -5.0)] {
            let setpoints = y_acquisition_setpoints(offset, gain, cell).unwrap();
            assert_eq!(setpoints.len(), cell as usize);
            let half = 0.5 * f64::from(cell);
            assert_eq!(
                *setpoints.iter().min().unwrap(),
                (offset - half * gain) as i16
            );
            assert_eq!(
                *setpoints.iter().max().unwrap(),
                (offset + 0.5 * f64::from(cell - 2) * gain) as i16
            );
        }
    }

    #[test]
    fn out_of_range_setpoints_are_rejected() {
        let err = x_acquisition_setpoints(32000.0, 10.0, 800, 1e-6, DESCAN_PERIOD, FLYBACK)
            .unwrap_err();
        assert!(matches!(err, AsmError::Configuration(_)));
        assert!(y_acquisition_setpoints(-32000.0, 10.0, 800).is_err());
    }

    #[test]
    fn zero_y_gain_is_a_configuration_error() {
        assert!(matches!(
            y_acquisition_setpoints(4000.0, 0.0, 800),
            Err(AsmError::Configuration(_))
        ));
    }

    fn calibration_inputs() -> CalibrationInputs {
        CalibrationInputs {
            dwell_time: 1e-6,
            scan_clock_period: 2e-7,
            descan_clock_period: DESCAN_PERIOD,
            resolution: 800,
            flyback_time: FLYBACK,
            descan_gain: (1.0, 0.0),
            scan_gain: (1.0, 1.0),
            scan_points: 9000,
            min_frequency: 125.0,
            max_frequency: 5000.0,
        }
    }

    #[test]
    fn calibration_waveforms_cover_one_period() {
        let waves = calibration_waveforms(&calibration_inputs()).unwrap();
        assert!(waves.period >= 800.0 * 1e-6 + FLYBACK);
        assert!((waves.frequency * waves.period - 1.0).abs() < 1e-12);
        assert_eq!(
            waves.x_descan.len(),
            (waves.period / DESCAN_PERIOD).ceil() as usize
        );
        assert_eq!(waves.y_descan.len(), waves.x_descan.len());
        assert_eq!(waves.x_scan.len(), 9000);
        assert!(waves.y_descan.iter().all(|&v| v == 0));
        assert_eq!(waves.y_scan[0], -1);
        assert!(waves.x_scan.iter().all(|&v| (-1..=1).contains(&v)));
    }

    #[test]
    fn calibration_frequency_out_of_band() {
        let mut inputs = calibration_inputs();
        inputs.dwell_time = 1e-4;
        inputs.resolution = 1000;
        assert!(calibration_waveforms(&inputs).is_err());
    }

    #[test]
    fn clock_periods_must_be_multiples() {
        assert!(ensure_clock_multiple(1e-6, 2e-7).is_ok());
        assert!(ensure_clock_multiple(1e-6, 5e-9).is_ok());
        assert!(ensure_clock_multiple(1e-6, 3e-7).is_err());

        let mut inputs = calibration_inputs();
        inputs.scan_clock_period = 3e-7;
        assert!(calibration_waveforms(&inputs).is_err());
    }

    #[test]
    fn sawtooth_rises_from_minus_one() {
        assert!((sawtooth(0.0) + 1.0).abs() < 1e-12);
        assert!(sawtooth(PI).abs() < 1e-12);
        assert!((sawtooth(2.0 * PI) + 1.0).abs() < 1e-12);
    }
}
