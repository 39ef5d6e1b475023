//! Acquisition server: the root of the ASM device tree.
//!
//! Owns the client, the three devices and the calibration controller. The
//! MPPC only holds weak links back to the server state it reads (storage URL
//! and metadata).

use crate::calibration::CalibrationController;
use crate::client::{AsmClient, HwState};
use crate::config::AsmDriverConfig;
use crate::descanner::MirrorDescanner;
use crate::descriptors::CalibrationLoopParameters;
use crate::error::{AsmError, AsmResult};
use crate::mppc::{Mppc, ServerLink};
use crate::scanner::EBeamScanner;
use crate::storage::{validate_filename, validate_storage_path, StorageUrl};
use crate::transport::{AsmTransport, HttpTransport};
use mb_core::attribute::{Attribute, AttributeSet};
use mb_core::data::{Metadata, MD_HW_NAME, MD_SW_VERSION};
use mb_core::error::DaqError;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Entry point to the ASM: owns the client, the scanner, the descanner,
/// the detector and the calibration controller.
pub struct AcquisitionServer {
    client: AsmClient,
    scanner: Arc<EBeamScanner>,
    descanner: Arc<MirrorDescanner>,
    mppc: Arc<Mppc>,
    calibration: CalibrationController,
    external_storage_url: Attribute<String>,
    metadata: Arc<Mutex<Metadata>>,
    attributes: AttributeSet,
}

impl std::fmt::Debug for AcquisitionServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionServer")
            .field("client", &self.client)
            .field("calibration_mode", &self.calibration.is_active())
            .finish_non_exhaustive()
    }
}

impl AcquisitionServer {
    /// Connect to the ASM at `config.asm.host` over HTTP.
    pub async fn connect(config: AsmDriverConfig) -> AsmResult<Self> {
        let transport = HttpTransport::new(config.asm.host.clone())?;
        Self::with_transport(config, Arc::new(transport)).await
    }

    /// Build the device tree on top of any transport.
    ///
    /// Must be called from within a Tokio runtime; the acquisition worker
    /// and calibration restarts run on it.
    pub async fn with_transport(
        config: AsmDriverConfig,
        transport: Arc<dyn AsmTransport>,
    ) -> AsmResult<Self> {
        let client = AsmClient::new(transport, &config.asm);
        client
            .connect(config.asm.connect_attempts, config.asm.connect_retry_delay())
            .await?;

        let storage_url = config.external_storage.url();
        let storage = StorageUrl::parse(&storage_url)?;
        client
            .set_external_storage(&storage.host, &storage.username, &storage.password)
            .await?;
        client.set_system_sw_name(&config.asm.software_name).await?;

        let scanner = Arc::new(EBeamScanner::new(client.clock_frequency().await?)?);
        let descanner = Arc::new(MirrorDescanner::new(
            client.descan_control_frequency().await?,
            &config.descanner,
        )?);

        let external_storage_url = Attribute::new("externalStorageURL", storage_url)
            .with_description("ftp://<user>:<password>@<host>/<directory>")
            .with_validator(|url: &String| {
                StorageUrl::parse(url).map(|_| ()).map_err(DaqError::from)
            });

        let mut metadata = Metadata::new();
        metadata.insert(MD_HW_NAME.to_string(), json!("ASM"));
        metadata.insert(
            MD_SW_VERSION.to_string(),
            json!(format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))),
        );
        let metadata = Arc::new(Mutex::new(metadata));

        let runtime = Handle::current();
        let mppc = Mppc::new(
            client.clone(),
            Arc::clone(&scanner),
            Arc::clone(&descanner),
            ServerLink {
                storage_url: external_storage_url.downgrade(),
                metadata: Arc::downgrade(&metadata),
            },
            config.acquisition.clone(),
            runtime.clone(),
        );
        let calibration = CalibrationController::new(
            client.clone(),
            Arc::clone(&scanner),
            Arc::clone(&descanner),
            Arc::clone(&mppc),
            config.calibration.clone(),
            runtime,
        );

        let mut attributes = AttributeSet::new();
        attributes.register(external_storage_url.clone());
        attributes.register(calibration.mode().clone());
        attributes.register(client.state().clone());

        let server = Self {
            client,
            scanner,
            descanner,
            mppc,
            calibration,
            external_storage_url,
            metadata,
            attributes,
        };
        server.apply_attribute_overrides(&config)?;
        tracing::info!("Acquisition server ready at {}", server.client.base_url());
        Ok(server)
    }

    fn apply_attribute_overrides(&self, config: &AsmDriverConfig) -> AsmResult<()> {
        for (device, values) in &config.attributes {
            let set = match device.as_str() {
                "scanner" => self.scanner.attributes(),
                "descanner" => self.descanner.attributes(),
                "mppc" => self.mppc.attributes(),
                other => {
                    return Err(AsmError::Configuration(format!(
                        "Unknown device '{}' in attribute settings, expected scanner, descanner \
                         or mppc",
                        other
                    )))
                }
            };
            set.apply_json(values)?;
            tracing::debug!("Applied {} attribute settings to {}", values.len(), device);
        }
        Ok(())
    }

    /// Client used by every device.
    pub fn client(&self) -> &AsmClient {
        &self.client
    }

    /// E-beam scanner.
    pub fn scanner(&self) -> &Arc<EBeamScanner> {
        &self.scanner
    }

    /// Descan mirror.
    pub fn descanner(&self) -> &Arc<MirrorDescanner> {
        &self.descanner
    }

    /// Detector.
    pub fn mppc(&self) -> &Arc<Mppc> {
        &self.mppc
    }

    /// Server attributes by name.
    pub fn attributes(&self) -> &AttributeSet {
        &self.attributes
    }

    /// Server metadata.
    pub fn metadata(&self) -> Metadata {
        self.metadata.lock().clone()
    }

    /// Merge `values` into the server metadata.
    pub fn update_metadata(&self, values: Metadata) {
        self.metadata.lock().extend(values);
    }

    /// Health of the ASM, switched to an error when a failing call finds
    /// problems in the health checks.
    pub fn state(&self) -> &Attribute<HwState> {
        self.client.state()
    }

    // =========================================================================
    // External storage
    // =========================================================================

    /// Storage URL last pushed to the ASM.
    pub fn external_storage_url(&self) -> &Attribute<String> {
        &self.external_storage_url
    }

    /// Validate a new storage URL, push it to the ASM and store it.
    ///
    /// An invalid URL is rejected and the previous value kept.
    pub async fn set_external_storage_url(&self, url: &str) -> AsmResult<()> {
        let storage = StorageUrl::parse(url)?;
        self.client
            .set_external_storage(&storage.host, &storage.username, &storage.password)
            .await?;
        self.external_storage_url.set(url.to_string())?;
        tracing::info!("External storage set to {}@{}{}", storage.username, storage.host, storage.path);
        Ok(())
    }

    /// Whether the ASM stored a mega-field `mega_field_id` in
    /// `storage_directory`.
    pub async fn check_mega_field_exists(
        &self,
        mega_field_id: &str,
        storage_directory: &str,
    ) -> AsmResult<bool> {
        validate_filename(mega_field_id)?;
        validate_storage_path(storage_directory)?;
        self.client
            .check_mega_field(mega_field_id, storage_directory)
            .await
    }

    // =========================================================================
    // Calibration
    // =========================================================================

    /// Enter or leave calibration mode.
    pub async fn set_calibration_mode(&self, enabled: bool) -> AsmResult<()> {
        self.calibration.set_mode(enabled).await
    }

    /// Whether calibration mode is on. Read-only.
    pub fn calibration_mode(&self) -> &Attribute<bool> {
        self.calibration.mode()
    }

    /// Parameters of the running calibration loop.
    pub fn calibration_parameters(&self) -> Option<CalibrationLoopParameters> {
        self.calibration.parameters()
    }

    /// Stop calibration and the acquisition worker.
    pub async fn terminate(&self) {
        if self.calibration.is_active() {
            if let Err(e) = self.calibration.exit().await {
                tracing::warn!("Failed to stop calibration mode while terminating: {}", e);
            }
        }
        self.mppc.terminate().await;
        tracing::info!("Acquisition server terminated");
    }
}
