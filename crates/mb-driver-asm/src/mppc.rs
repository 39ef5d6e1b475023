//! MPPC detector and its image data flow.
//!
//! The detector gathers the scanner, descanner and its own cell parameters
//! into the mega-field descriptor, and feeds commands to the
//! [`AcquisitionSequencer`]. Images come out of the [`DataFlow`].

use crate::config::AcquisitionSettings;
use crate::descriptors::{CellParameters, DataContent, FieldMetadata, MegaFieldMetadata};
use crate::descanner::MirrorDescanner;
use crate::error::{AsmError, AsmResult};
use crate::client::AsmClient;
use crate::scanner::{to_ticks, EBeamScanner};
use crate::sequencer::{AcquisitionSequencer, FieldSink, SequencerState};
use crate::storage::{validate_filename, StorageUrl};
use mb_core::attribute::{Attribute, AttributeSet, WeakAttribute};
use mb_core::data::{
    merge_metadata, DataArray, Metadata, MD_ACQ_DATE, MD_HW_NAME, MD_POS,
};
use mb_core::error::{AppResult, DaqError};
use mb_core::listeners::{ListenerId, ListenerSet};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;

/// Detector cells (x, y).
pub const MPPC_SHAPE: (usize, usize) = (8, 8);

/// Placeholder of the mega-field descriptor field of the same name.
const CUSTOM_DATA: &str = "No_custom_data";

type Grid<T> = Vec<Vec<T>>;

/// Non-owning link to the acquisition server.
#[derive(Clone)]
pub(crate) struct ServerLink {
    pub storage_url: WeakAttribute<String>,
    pub metadata: Weak<Mutex<Metadata>>,
}

fn uniform_grid<T: Clone>(value: T) -> Grid<T> {
    vec![vec![value; MPPC_SHAPE.0]; MPPC_SHAPE.1]
}

fn check_grid_shape<T>(name: &str, grid: &Grid<T>) -> AppResult<()> {
    if grid.len() != MPPC_SHAPE.1 || grid.iter().any(|row| row.len() != MPPC_SHAPE.0) {
        return Err(DaqError::Configuration(format!(
            "{}: expected {} rows of {} cells",
            name, MPPC_SHAPE.1, MPPC_SHAPE.0
        )));
    }
    Ok(())
}

fn check_non_negative<T: PartialOrd + Default + Copy + std::fmt::Debug>(
    name: &str,
    values: impl IntoIterator<Item = T>,
) -> AppResult<()> {
    match values.into_iter().find(|value| *value < T::default()) {
        Some(value) => Err(DaqError::Configuration(format!(
            "{}: negative value {:?} is not allowed",
            name, value
        ))),
        None => Ok(()),
    }
}

/// Multi-pixel photon counter detector.
pub struct Mppc {
    scanner: Arc<EBeamScanner>,
    descanner: Arc<MirrorDescanner>,
    server: ServerLink,
    filename: Attribute<String>,
    data_content: Attribute<DataContent>,
    acq_delay: Attribute<f64>,
    cell_translation: Attribute<Grid<(i64, i64)>>,
    cell_dark_offset: Attribute<Grid<i64>>,
    cell_digital_gain: Attribute<Grid<f64>>,
    cell_complete_resolution: Attribute<(u32, u32)>,
    metadata: Mutex<Metadata>,
    attributes: AttributeSet,
    sequencer: AcquisitionSequencer,
    data: DataFlow,
}

impl std::fmt::Debug for Mppc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mppc")
            .field("filename", &self.filename.get())
            .field("data_content", &self.data_content.get())
            .field("sequencer", &self.sequencer)
            .finish_non_exhaustive()
    }
}

impl Mppc {
    pub(crate) fn new(
        client: AsmClient,
        scanner: Arc<EBeamScanner>,
        descanner: Arc<MirrorDescanner>,
        server: ServerLink,
        settings: AcquisitionSettings,
        runtime: Handle,
    ) -> Arc<Self> {
        let filename = Attribute::new(
            "filename",
            chrono::Local::now()
                .format("default--%Y-%m-%d-%H-%M-%S")
                .to_string(),
        )
        .with_description("Mega-field id, characters [a-z0-9_()-]")
        .with_validator(|name: &String| validate_filename(name).map_err(DaqError::from));

        let data_content = Attribute::new("dataContent", DataContent::Empty);

        let scan_delay = scanner.scan_delay().downgrade();
        let acq_delay = Attribute::new("acqDelay", 0.0)
            .with_units("s")
            .with_range(0.0, 200e-6)
            .with_validator(move |delay: &f64| match scan_delay.get() {
                Some((scan_delay, _)) if *delay < scan_delay => {
                    Err(DaqError::Configuration(format!(
                        "Detector cannot record images before the e-beam scanner has started to \
                         scan: acquisition delay {} s is shorter than the scan delay {} s",
                        delay, scan_delay
                    )))
                }
                _ => Ok(()),
            });

        let weak_acq_delay = acq_delay.downgrade();
        scanner.scan_delay().add_validator(move |delay: &(f64, f64)| {
            match weak_acq_delay.get() {
                Some(acq_delay) if delay.0 > acq_delay => Err(DaqError::Configuration(format!(
                    "Detector needs to start after the scanner: scan delay {} s exceeds the \
                     acquisition delay {} s",
                    delay.0, acq_delay
                ))),
                _ => Ok(()),
            }
        });

        let cell_translation = Attribute::new("cellTranslation", uniform_grid((50_i64, 50_i64)))
            .with_units("px")
            .with_validator(|grid: &Grid<(i64, i64)>| {
                check_grid_shape("cellTranslation", grid)?;
                check_non_negative(
                    "cellTranslation",
                    grid.iter().flatten().flat_map(|&(x, y)| [x, y]),
                )
            });
        let cell_dark_offset = Attribute::new("cellDarkOffset", uniform_grid(0_i64))
            .with_validator(|grid: &Grid<i64>| {
                check_grid_shape("cellDarkOffset", grid)?;
                check_non_negative("cellDarkOffset", grid.iter().flatten().copied())
            });
        let cell_digital_gain = Attribute::new("cellDigitalGain", uniform_grid(1.2_f64))
            .with_validator(|grid: &Grid<f64>| {
                check_grid_shape("cellDigitalGain", grid)?;
                check_non_negative("cellDigitalGain", grid.iter().flatten().copied())
            });
        let cell_complete_resolution = Attribute::new("cellCompleteResolution", (800_u32, 800_u32))
            .with_units("px")
            .with_pair_range((10, 10), (1000, 1000));

        let mut metadata = Metadata::new();
        metadata.insert(MD_HW_NAME.to_string(), json!("MPPC"));
        metadata.insert(MD_POS.to_string(), json!([0.0, 0.0]));

        let mut attributes = AttributeSet::new();
        attributes.register(filename.clone());
        attributes.register(data_content.clone());
        attributes.register(acq_delay.clone());
        attributes.register(cell_translation.clone());
        attributes.register(cell_dark_offset.clone());
        attributes.register(cell_digital_gain.clone());
        attributes.register(cell_complete_resolution.clone());

        let sequencer = AcquisitionSequencer::new(client, settings, runtime);

        Arc::new_cyclic(|mppc| Self {
            scanner,
            descanner,
            server,
            filename,
            data_content,
            acq_delay,
            cell_translation,
            cell_dark_offset,
            cell_digital_gain,
            cell_complete_resolution,
            metadata: Mutex::new(metadata),
            attributes,
            sequencer,
            data: DataFlow {
                mppc: mppc.clone(),
                listeners: Arc::new(ListenerSet::new()),
            },
        })
    }

    // =========================================================================
    // Attributes
    // =========================================================================

    /// Number of detector cells (x, y).
    pub fn shape(&self) -> (usize, usize) {
        MPPC_SHAPE
    }

    /// Id of the next mega-field.
    pub fn filename(&self) -> &Attribute<String> {
        &self.filename
    }

    /// Image content fetched for each field.
    pub fn data_content(&self) -> &Attribute<DataContent> {
        &self.data_content
    }

    /// Delay between the start of the scan and the start of recording [s].
    pub fn acq_delay(&self) -> &Attribute<f64> {
        &self.acq_delay
    }

    /// Origin of the effective area of each cell [px].
    pub fn cell_translation(&self) -> &Attribute<Vec<Vec<(i64, i64)>>> {
        &self.cell_translation
    }

    /// Dark offset of each cell.
    pub fn cell_dark_offset(&self) -> &Attribute<Vec<Vec<i64>>> {
        &self.cell_dark_offset
    }

    /// Digital gain of each cell.
    pub fn cell_digital_gain(&self) -> &Attribute<Vec<Vec<f64>>> {
        &self.cell_digital_gain
    }

    /// Full resolution of a cell image [px].
    pub fn cell_complete_resolution(&self) -> &Attribute<(u32, u32)> {
        &self.cell_complete_resolution
    }

    /// Attributes by name.
    pub fn attributes(&self) -> &AttributeSet {
        &self.attributes
    }

    /// Field image stream.
    pub fn data(&self) -> &DataFlow {
        &self.data
    }

    /// Acquisition worker owner.
    pub fn sequencer(&self) -> &AcquisitionSequencer {
        &self.sequencer
    }

    /// Acquisition delay in ticks of the scanner clock.
    pub fn ticks_acq_delay(&self) -> i64 {
        to_ticks(self.acq_delay.get(), self.scanner.clock_period())
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    /// Detector metadata.
    pub fn metadata(&self) -> Metadata {
        self.metadata.lock().clone()
    }

    /// Merge `values` into the detector metadata, e.g. the stage position
    /// under [`MD_POS`].
    pub fn update_metadata(&self, values: Metadata) {
        self.metadata.lock().extend(values);
    }

    /// Metadata of the server, the detector, the descanner and the scanner,
    /// merged in that order.
    pub fn merged_metadata(&self) -> Metadata {
        let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        let own = {
            let mut metadata = self.metadata.lock();
            metadata.insert(MD_ACQ_DATE.to_string(), json!(now));
            metadata.clone()
        };
        let server = self
            .server
            .metadata
            .upgrade()
            .map(|metadata| metadata.lock().clone())
            .unwrap_or_default();
        let descanner = self.descanner.metadata();
        let scanner = self.scanner.metadata();
        merge_metadata([&server, &own, &descanner, &scanner])
    }

    fn stage_position(&self) -> (f64, f64) {
        let metadata = self.metadata.lock();
        let coordinate = |index: usize| {
            metadata
                .get(MD_POS)
                .and_then(|pos| pos.get(index))
                .and_then(Value::as_f64)
                .unwrap_or(0.0)
        };
        (coordinate(0), coordinate(1))
    }

    /// Snapshot of the current configuration in the format of the ASM.
    pub fn assemble_megafield_metadata(&self) -> AsmResult<MegaFieldMetadata> {
        let storage_url = self.server.storage_url.get().ok_or_else(|| {
            AsmError::Configuration("The acquisition server is no longer available".to_string())
        })?;
        let storage_directory = StorageUrl::parse(&storage_url)?.path;

        let scanner = &self.scanner;
        let descanner = &self.descanner;
        let resolution = scanner.resolution().get();
        let cell_resolution = self.cell_complete_resolution.get();
        let eff_cell_size = (
            resolution.0 / MPPC_SHAPE.0 as u32,
            resolution.1 / MPPC_SHAPE.1 as u32,
        );

        let dwell_time = scanner.dwell_time().get();
        let scan_delay = scanner.scan_delay().get();
        let (x_scan_delay, y_prescan_lines) = scanner.ticks_scan_delay();
        let scan_to_acq_delay = to_ticks(self.acq_delay.get() - scan_delay.0, scanner.clock_period());

        let x_descan_setpoints = descanner.x_acq_setpoints(dwell_time, cell_resolution.0)?;
        let y_descan_setpoints = descanner.y_acq_setpoints(cell_resolution.1)?;

        let translation = self.cell_translation.get();
        let dark_offset = self.cell_dark_offset.get();
        let digital_gain = self.cell_digital_gain.get();
        let cell_parameters = translation
            .iter()
            .flatten()
            .zip(dark_offset.iter().flatten())
            .zip(digital_gain.iter().flatten())
            .map(|((&(x, y), &dark_offset), &digital_gain)| CellParameters {
                x_eff_orig: x,
                y_eff_orig: y,
                digital_gain,
                dark_offset,
            })
            .collect();

        let stage_position = self.stage_position();
        let scan_gain = scanner.scan_gain().get();
        let scan_offset = scanner.scan_offset().get();
        let descan_offset = descanner.scan_offset().get();

        Ok(MegaFieldMetadata {
            mega_field_id: self.filename.get(),
            storage_directory,
            custom_data: CUSTOM_DATA.to_string(),
            stage_position_x: stage_position.0,
            stage_position_y: stage_position.1,
            pixel_size: (scanner.pixel_size().get().0 * 1e9).round() as i64,
            dwell_time: scanner.ticks_dwell_time(),
            x_scan_to_acq_delay: scan_to_acq_delay,
            x_scan_delay,
            x_cell_size: cell_resolution.0,
            y_cell_size: cell_resolution.1,
            x_eff_cell_size: eff_cell_size.0,
            y_eff_cell_size: eff_cell_size.1,
            y_prescan_lines,
            x_scan_gain: scan_gain.0,
            y_scan_gain: scan_gain.1,
            x_scan_offset: scan_offset.0,
            y_scan_offset: scan_offset.1,
            x_descan_setpoints,
            y_descan_setpoints,
            x_descan_offset: descan_offset.0,
            y_descan_offset: descan_offset.1,
            scan_rotation: scanner.rotation().get(),
            descan_rotation: descanner.rotation().get(),
            cell_parameters,
        })
    }

    /// Field index to the pixel position of the field.
    pub fn field_position(&self, field: (u32, u32)) -> FieldMetadata {
        FieldMetadata::from_field_index(field, self.scanner.resolution().get())
    }

    // =========================================================================
    // Acquisition control
    // =========================================================================

    /// Open a mega-field with the current configuration.
    ///
    /// Restarts the acquisition worker if a previous acquisition failed.
    pub fn start_acquisition(&self) -> AsmResult<()> {
        let megafield = self.assemble_megafield_metadata()?;
        let metadata = self.merged_metadata();
        tracing::debug!(mega_field_id = %megafield.mega_field_id, "Queueing start of mega field");
        self.sequencer.start(megafield, metadata);
        Ok(())
    }

    /// Queue the scan of field `field` (x, y index), delivered to the
    /// subscribers of [`Mppc::data`].
    pub fn get_next_field(&self, field: (u32, u32)) {
        self.sequencer.next(
            self.field_position(field),
            self.data_content.get(),
            FieldSink::Subscribers(Arc::clone(&self.data.listeners)),
        );
    }

    /// Queue the closing of the mega-field.
    pub fn stop_acquisition(&self) {
        self.sequencer.stop();
    }

    /// Scan one field in its own mega-field and return its image.
    pub async fn acquire_single_field(
        &self,
        content: DataContent,
        field: (u32, u32),
    ) -> AsmResult<DataArray> {
        let megafield = self.assemble_megafield_metadata()?;
        let metadata = self.merged_metadata();
        self.sequencer
            .single_field(megafield, metadata, self.field_position(field), content)
            .await
    }

    /// Drop pending fields and close the mega-field.
    pub async fn cancel_acquisition(&self) -> AsmResult<()> {
        self.sequencer.cancel().await
    }

    /// State of the acquisition worker.
    pub fn acquisition_state(&self) -> SequencerState {
        self.sequencer.state()
    }

    /// Stop the acquisition worker.
    pub async fn terminate(&self) {
        self.sequencer.terminate().await;
    }
}

// =============================================================================
// DataFlow
// =============================================================================

/// Stream of field images.
///
/// The first subscriber opens a mega-field, each [`DataFlow::next`] scans one
/// field, and removing the last subscriber closes the mega-field.
pub struct DataFlow {
    mppc: Weak<Mppc>,
    listeners: Arc<ListenerSet<DataArray>>,
}

impl std::fmt::Debug for DataFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFlow")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl DataFlow {
    fn mppc(&self) -> AsmResult<Arc<Mppc>> {
        self.mppc.upgrade().ok_or(AsmError::WorkerStopped)
    }

    /// Register a listener called with every field image, in field order.
    pub fn subscribe<F>(&self, listener: F) -> AsmResult<ListenerId>
    where
        F: Fn(&DataArray) + Send + Sync + 'static,
    {
        let mppc = self.mppc()?;
        let (id, count) = self.listeners.add(Arc::new(listener));
        if count == 1 {
            if let Err(e) = mppc.start_acquisition() {
                self.listeners.remove(id);
                return Err(e);
            }
        }
        Ok(id)
    }

    /// Remove a listener. Returns false if it was not subscribed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        match self.listeners.remove(id) {
            Some(0) => {
                if let Some(mppc) = self.mppc.upgrade() {
                    mppc.stop_acquisition();
                }
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Request the next field (x, y index).
    pub fn next(&self, field: (u32, u32)) -> AsmResult<()> {
        self.mppc()?.get_next_field(field);
        Ok(())
    }

    /// Acquire field (0, 0) with the current `dataContent`.
    pub async fn get(&self) -> AsmResult<DataArray> {
        let content = self.mppc()?.data_content.get();
        self.get_with(content, (0, 0)).await
    }

    /// Acquire a single field. Fails without contacting the ASM when a
    /// streaming acquisition has subscribers.
    pub async fn get_with(&self, content: DataContent, field: (u32, u32)) -> AsmResult<DataArray> {
        let listeners = self.listeners.len();
        if listeners > 0 {
            return Err(AsmError::AcquisitionBusy { listeners });
        }
        self.mppc()?.acquire_single_field(content, field).await
    }

    /// Number of subscribers.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Remove every listener, closing the mega-field if there were any.
    pub fn clear_listeners(&self) -> usize {
        let removed = self.listeners.clear();
        if removed > 0 {
            if let Some(mppc) = self.mppc.upgrade() {
                mppc.stop_acquisition();
            }
        }
        removed
    }
}
