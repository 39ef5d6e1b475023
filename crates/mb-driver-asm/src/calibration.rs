//! Calibration mode.
//!
//! While active, the ASM runs a continuous calibration loop: a sine on X and
//! a sawtooth on Y, for scanner and descanner. Any change to an attribute the
//! signal depends on restarts the loop with recomputed setpoints.

use crate::client::AsmClient;
use crate::config::CalibrationSettings;
use crate::descanner::MirrorDescanner;
use crate::descriptors::CalibrationLoopParameters;
use crate::error::{AsmError, AsmResult};
use crate::mppc::Mppc;
use crate::scanner::EBeamScanner;
use crate::setpoints::{calibration_waveforms, CalibrationInputs};
use mb_core::attribute::{Attribute, AttributeBase, AttributeSet};
use mb_core::listeners::ListenerId;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Descanner gains while calibrating (x, y).
const CALIBRATION_DESCAN_GAIN: (f64, f64) = (1.0, 0.0);
/// Scanner gains while calibrating (x, y).
const CALIBRATION_SCAN_GAIN: (f64, f64) = (1.0, 1.0);
/// Descanner and scanner gains set when calibration mode is left.
const ACQUISITION_GAIN: (f64, f64) = (1.0, 1.0);

const DESCANNER_TRIGGERS: [&str; 3] = ["rotation", "scanOffset", "scanGain"];
const SCANNER_TRIGGERS: [&str; 5] = ["dwellTime", "rotation", "scanDelay", "scanOffset", "scanGain"];
const MPPC_TRIGGERS: [&str; 1] = ["cellCompleteResolution"];

#[derive(Clone)]
struct CalibrationContext {
    client: AsmClient,
    scanner: Arc<EBeamScanner>,
    descanner: Arc<MirrorDescanner>,
    mppc: Arc<Mppc>,
    settings: CalibrationSettings,
}

impl CalibrationContext {
    fn compute(&self) -> AsmResult<CalibrationLoopParameters> {
        let scanner = &self.scanner;
        let descanner = &self.descanner;
        let waves = calibration_waveforms(&CalibrationInputs {
            dwell_time: scanner.dwell_time().get(),
            scan_clock_period: scanner.clock_period(),
            descan_clock_period: descanner.clock_period(),
            resolution: self.mppc.cell_complete_resolution().get().0,
            flyback_time: descanner.physical_flyback_time(),
            descan_gain: descanner.scan_gain().get(),
            scan_gain: scanner.scan_gain().get(),
            scan_points: self.settings.scan_setpoints_per_period,
            min_frequency: self.settings.min_frequency_hz,
            max_frequency: self.settings.max_frequency_hz,
        })?;
        tracing::debug!(
            frequency = waves.frequency,
            "Computed calibration signal ({} descan, {} scan setpoints)",
            waves.x_descan.len(),
            waves.x_scan.len()
        );

        let descan_offset = descanner.scan_offset().get();
        let scan_offset = scanner.scan_offset().get();
        Ok(CalibrationLoopParameters {
            descan_rotation: descanner.rotation().get(),
            x_descan_offset: descan_offset.0,
            x_descan_setpoints: waves.x_descan,
            y_descan_offset: descan_offset.1,
            y_descan_setpoints: waves.y_descan,
            dwell_time: scanner.ticks_dwell_time(),
            scan_rotation: scanner.rotation().get(),
            x_scan_delay: scanner.ticks_scan_delay().0,
            x_scan_offset: scan_offset.0,
            x_scan_setpoints: waves.x_scan,
            y_scan_offset: scan_offset.1,
            y_scan_setpoints: waves.y_scan,
        })
    }

    /// Stop the running loop and start one with the current configuration.
    async fn restart(&self) -> AsmResult<CalibrationLoopParameters> {
        self.client.stop_calibration_loop().await?;
        let parameters = self.compute()?;
        self.client.start_calibration_loop(&parameters).await?;
        Ok(parameters)
    }

    /// Attributes whose changes invalidate the calibration signal.
    fn triggers(&self) -> AsmResult<Vec<Arc<dyn AttributeBase>>> {
        fn pick(
            device: &str,
            set: &AttributeSet,
            names: &[&str],
        ) -> AsmResult<Vec<Arc<dyn AttributeBase>>> {
            names
                .iter()
                .map(|name| {
                    set.get(name).ok_or_else(|| {
                        AsmError::Configuration(format!(
                            "The {} has no attribute '{}' to follow in calibration mode",
                            device, name
                        ))
                    })
                })
                .collect()
        }
        let mut triggers = pick("descanner", self.descanner.attributes(), &DESCANNER_TRIGGERS)?;
        triggers.extend(pick("scanner", self.scanner.attributes(), &SCANNER_TRIGGERS)?);
        triggers.extend(pick("detector", self.mppc.attributes(), &MPPC_TRIGGERS)?);
        Ok(triggers)
    }
}

struct ActiveLoop {
    subscriptions: Vec<(Arc<dyn AttributeBase>, ListenerId)>,
    restarter: JoinHandle<()>,
}

/// Switches the system in and out of calibration mode.
pub struct CalibrationController {
    context: CalibrationContext,
    runtime: Handle,
    mode: Attribute<bool>,
    parameters: Arc<Mutex<Option<CalibrationLoopParameters>>>,
    active: tokio::sync::Mutex<Option<ActiveLoop>>,
}

impl std::fmt::Debug for CalibrationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalibrationController")
            .field("mode", &self.mode.get())
            .finish_non_exhaustive()
    }
}

impl CalibrationController {
    pub(crate) fn new(
        client: AsmClient,
        scanner: Arc<EBeamScanner>,
        descanner: Arc<MirrorDescanner>,
        mppc: Arc<Mppc>,
        settings: CalibrationSettings,
        runtime: Handle,
    ) -> Self {
        Self {
            context: CalibrationContext {
                client,
                scanner,
                descanner,
                mppc,
                settings,
            },
            runtime,
            mode: Attribute::new("calibrationMode", false)
                .with_description("Continuous calibration loop running")
                .read_only(),
            parameters: Arc::new(Mutex::new(None)),
            active: tokio::sync::Mutex::new(None),
        }
    }

    /// Calibration mode flag. Changed through [`CalibrationController::enter`]
    /// and [`CalibrationController::exit`].
    pub fn mode(&self) -> &Attribute<bool> {
        &self.mode
    }

    /// Whether calibration mode is on.
    pub fn is_active(&self) -> bool {
        self.mode.get()
    }

    /// Parameters of the loop currently running on the ASM.
    pub fn parameters(&self) -> Option<CalibrationLoopParameters> {
        self.parameters.lock().clone()
    }

    /// Enter calibration mode.
    ///
    /// Subscribers of the detector data are removed, the gains replaced by the
    /// calibration gains and the loop started. On failure the gains are
    /// restored to what they were before the call and the mode is left off.
    pub async fn enter(&self) -> AsmResult<()> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            tracing::debug!("Calibration mode already active");
            return Ok(());
        }

        let context = &self.context;
        let triggers = context.triggers()?;
        let removed = context.mppc.data().clear_listeners();
        if removed > 0 {
            tracing::warn!(
                "Entering calibration mode removed {} subscribers of the detector data",
                removed
            );
        }

        let saved_descan_gain = context.descanner.scan_gain().get();
        let saved_scan_gain = context.scanner.scan_gain().get();
        let gains_applied = context
            .descanner
            .scan_gain()
            .set(CALIBRATION_DESCAN_GAIN)
            .and_then(|_| context.scanner.scan_gain().set(CALIBRATION_SCAN_GAIN));

        let started = match gains_applied {
            Ok(_) => context.restart().await,
            Err(e) => Err(e.into()),
        };
        let parameters = match started {
            Ok(parameters) => parameters,
            Err(e) => {
                tracing::error!("Failed to start the calibration loop: {}", e);
                self.restore_gains(saved_descan_gain, saved_scan_gain);
                return Err(e);
            }
        };

        let (trigger, mut restarts) = mpsc::unbounded_channel::<()>();
        let subscriptions = triggers
            .into_iter()
            .map(|attribute| {
                let trigger = trigger.clone();
                let id = attribute.subscribe_change(Arc::new(move || {
                    let _ = trigger.send(());
                }));
                (attribute, id)
            })
            .collect();

        let restart_context = context.clone();
        let shared_parameters = Arc::clone(&self.parameters);
        let restarter = self.runtime.spawn(async move {
            while restarts.recv().await.is_some() {
                // Coalesce bursts of changes into one restart.
                while restarts.try_recv().is_ok() {}
                match restart_context.restart().await {
                    Ok(parameters) => {
                        tracing::info!("Calibration loop restarted with updated configuration");
                        *shared_parameters.lock() = Some(parameters);
                    }
                    Err(e) => tracing::error!("Failed to restart the calibration loop: {}", e),
                }
            }
        });

        *self.parameters.lock() = Some(parameters);
        *active = Some(ActiveLoop {
            subscriptions,
            restarter,
        });
        self.mode.update(true);
        tracing::info!("Calibration mode active");
        Ok(())
    }

    /// Leave calibration mode, stopping the loop and setting the acquisition
    /// gains.
    pub async fn exit(&self) -> AsmResult<()> {
        let Some(active) = self.active.lock().await.take() else {
            tracing::debug!("Calibration mode not active");
            return Ok(());
        };

        for (attribute, id) in &active.subscriptions {
            attribute.unsubscribe(*id);
        }
        active.restarter.abort();
        *self.parameters.lock() = None;
        self.mode.update(false);

        let stopped = self.context.client.stop_calibration_loop().await;
        self.restore_gains(ACQUISITION_GAIN, ACQUISITION_GAIN);
        stopped?;
        tracing::info!("Calibration mode stopped");
        Ok(())
    }

    /// Enter or exit calibration mode.
    pub async fn set_mode(&self, enabled: bool) -> AsmResult<()> {
        if enabled {
            self.enter().await
        } else {
            self.exit().await
        }
    }

    fn restore_gains(&self, descan_gain: (f64, f64), scan_gain: (f64, f64)) {
        if let Err(e) = self.context.descanner.scan_gain().set(descan_gain) {
            tracing::warn!("Could not restore the descanner gain: {}", e);
        }
        if let Err(e) = self.context.scanner.scan_gain().set(scan_gain) {
            tracing::warn!("Could not restore the scanner gain: {}", e);
        }
    }
}

impl Drop for CalibrationController {
    fn drop(&mut self) {
        if let Some(active) = self.active.get_mut().take() {
            for (attribute, id) in &active.subscriptions {
                attribute.unsubscribe(*id);
            }
            active.restarter.abort();
        }
    }
}
