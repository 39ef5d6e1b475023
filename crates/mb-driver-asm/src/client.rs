//! Typed client for the ASM REST API.
//!
//! Every call states the status code it expects. Any other answer becomes an
//! [`AsmError::Protocol`] carrying the URL, the received status and reason,
//! the expected status and whatever the ASM said about it.

use crate::config::AsmSettings;
use crate::descriptors::{
    CalibrationLoopParameters, ExistsReply, FieldMetadata, FrequencyReply, MegaFieldMetadata,
};
use crate::error::{ApiError, AsmError, AsmResult};
use crate::transport::{ApiRequest, ApiResponse, AsmTransport};
use base64::Engine;
use image::DynamicImage;
use mb_core::attribute::Attribute;
use mb_core::data::DataArray;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use url::form_urlencoded;

/// Arrays longer than this are shortened in error logs.
const MAX_LOGGED_VALUES: usize = 10;

/// Offload queue fill level (percent) considered problematic.
const MAX_QUEUE_FILL: f64 = 99.0;

/// Operational state reported by the ASM health checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HwState {
    /// All health checks pass.
    Running,
    /// A health check or a call failed, with the reason.
    Error(String),
}

/// Shared handle to the ASM. Cheap to clone.
#[derive(Clone)]
pub struct AsmClient {
    transport: Arc<dyn AsmTransport>,
    timeout: Duration,
    health_checks_on_error: bool,
    state: Attribute<HwState>,
}

impl std::fmt::Debug for AsmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsmClient")
            .field("base_url", &self.transport.base_url())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl AsmClient {
    /// Create a client sending its calls over `transport`.
    pub fn new(transport: Arc<dyn AsmTransport>, settings: &AsmSettings) -> Self {
        Self {
            transport,
            timeout: settings.request_timeout(),
            health_checks_on_error: settings.health_checks_on_error,
            state: Attribute::new("state", HwState::Running).read_only(),
        }
    }

    /// Host URL the endpoint paths are relative to.
    pub fn base_url(&self) -> &str {
        self.transport.base_url()
    }

    /// Health state of the ASM, switched to `Error` by failed health checks.
    pub fn state(&self) -> &Attribute<HwState> {
        &self.state
    }

    // =========================================================================
    // Generic calls
    // =========================================================================

    async fn call(&self, request: ApiRequest, expected: u16) -> AsmResult<ApiResponse> {
        let url = format!("{}{}", self.transport.base_url(), request.path);
        let logged_body = request.body.as_ref().map(abbreviate_json);
        tracing::debug!(method = ?request.method, "ASM call {}", url);

        let response = self
            .transport
            .send(request.with_timeout(self.timeout))
            .await?;
        if response.status == expected {
            return Ok(response);
        }

        let mut error = ApiError::from_response(url, &response, expected);
        if self.health_checks_on_error {
            error.diagnostics = self.system_health().await;
            if !error.diagnostics.is_empty() {
                self.state
                    .update(HwState::Error(error.diagnostics.join("; ")));
            }
        }
        match logged_body {
            Some(body) => tracing::error!("{} (request data: {})", error, body),
            None => tracing::error!("{}", error),
        }
        Err(AsmError::Protocol(Box::new(error)))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, expected: u16) -> AsmResult<T> {
        self.call(ApiRequest::get(path), expected).await?.json()
    }

    async fn post(&self, path: &str, expected: u16, body: Option<Value>) -> AsmResult<ApiResponse> {
        let request = match body {
            Some(body) => ApiRequest::post(path).with_body(body),
            None => ApiRequest::post(path),
        };
        self.call(request, expected).await
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Verify the ASM is reachable, closing any mega-field left open.
    pub async fn connect(&self, attempts: u32, retry_delay: Duration) -> AsmResult<()> {
        let attempts = attempts.max(1);
        for attempt in 1..=attempts {
            match self.finish_mega_field().await {
                Ok(()) => {
                    tracing::info!("Connected to ASM at {}", self.base_url());
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        "Try number {} of {} to connect with the ASM host failed: {}",
                        attempt,
                        attempts,
                        e
                    );
                    if attempt < attempts {
                        tokio::time::sleep(retry_delay).await;
                    }
                }
            }
        }
        tracing::error!("Could not connect with the ASM host {}", self.base_url());
        Err(AsmError::Connectivity(format!(
            "Could not connect with the ASM host {}. Check if the connection with the host is \
             available and if the host URL is entered correctly",
            self.base_url()
        )))
    }

    // =========================================================================
    // Endpoints
    // =========================================================================

    /// Close the open mega-field. Accepted even when none is open.
    pub async fn finish_mega_field(&self) -> AsmResult<()> {
        self.post("/scan/finish_mega_field", 204, None).await?;
        Ok(())
    }

    /// Open a mega-field.
    pub async fn start_mega_field(&self, megafield: &MegaFieldMetadata) -> AsmResult<()> {
        let body = serde_json::to_value(megafield)?;
        self.post("/scan/start_mega_field", 204, Some(body)).await?;
        Ok(())
    }

    /// Scan one field of the open mega-field.
    pub async fn scan_field(&self, field: &FieldMetadata) -> AsmResult<()> {
        let body = serde_json::to_value(field)?;
        self.post("/scan/scan_field", 204, Some(body)).await?;
        Ok(())
    }

    /// Fetch and decode the image of a scanned field.
    pub async fn field_image(&self, field: &FieldMetadata, thumbnail: bool) -> AsmResult<DataArray> {
        let (x, y) = (field.position_x.to_string(), field.position_y.to_string());
        let path = format!(
            "/scan/field?{}",
            query(&[
                ("x", x.as_str()),
                ("y", y.as_str()),
                ("thumbnail", if thumbnail { "true" } else { "false" }),
            ])
        );
        let response = self.call(ApiRequest::get(path), 200).await?;
        decode_field_image(&response.body)
    }

    /// Whether a mega-field with this id was stored in `storage_directory`.
    pub async fn check_mega_field(
        &self,
        mega_field_id: &str,
        storage_directory: &str,
    ) -> AsmResult<bool> {
        let path = format!(
            "/scan/check_mega_field?{}",
            query(&[
                ("mega_field_id", mega_field_id),
                ("storage_directory", storage_directory),
            ])
        );
        let reply: ExistsReply = self.post(&path, 200, None).await?.json()?;
        Ok(reply.exists)
    }

    /// Scanner clock frequency [Hz].
    pub async fn clock_frequency(&self) -> AsmResult<u64> {
        let reply: FrequencyReply = self.get("/scan/clock_frequency", 200).await?;
        Ok(reply.frequency)
    }

    /// Descanner control frequency [Hz].
    pub async fn descan_control_frequency(&self) -> AsmResult<u64> {
        let reply: Value = self.get("/scan/descan_control_frequency", 200).await?;
        let reply: FrequencyReply = serde_json::from_value(reply).map_err(|e| {
            tracing::error!(
                "Could not obtain the descan control frequency, received data does not hold the proper key: {}",
                e
            );
            AsmError::Json(e)
        })?;
        Ok(reply.frequency)
    }

    /// Tell the ASM where to store images.
    pub async fn set_external_storage(&self, host: &str, user: &str, password: &str) -> AsmResult<()> {
        let path = format!(
            "/config/set_external_storage?{}",
            query(&[("host", host), ("user", user), ("password", password)])
        );
        self.post(&path, 204, None).await?;
        Ok(())
    }

    /// Report the name of the controlling software.
    pub async fn set_system_sw_name(&self, software: &str) -> AsmResult<()> {
        let path = format!("/config/set_system_sw_name?{}", query(&[("software", software)]));
        self.post(&path, 204, None).await?;
        Ok(())
    }

    /// Start the periodic calibration signal.
    pub async fn start_calibration_loop(&self, parameters: &CalibrationLoopParameters) -> AsmResult<()> {
        let body = serde_json::to_value(parameters)?;
        self.post("/scan/start_calibration_loop", 204, Some(body)).await?;
        Ok(())
    }

    /// Stop the calibration signal. Accepted when none is running.
    pub async fn stop_calibration_loop(&self) -> AsmResult<()> {
        self.post("/scan/stop_calibration_loop", 204, None).await?;
        Ok(())
    }

    // =========================================================================
    // Health checks
    // =========================================================================

    async fn monitor(&self, item: &str) -> AsmResult<Value> {
        let path = format!("/monitor/{}", item);
        let url = format!("{}{}", self.base_url(), path);
        let response = self
            .transport
            .send(ApiRequest::get(path).with_timeout(self.timeout))
            .await?;
        if response.status != 200 {
            return Err(AsmError::Protocol(Box::new(ApiError::from_response(
                url, &response, 200,
            ))));
        }
        response.json()
    }

    /// Consult the ASM monitor items and describe every problem found.
    ///
    /// A health check that fails is reported as a finding too, it never aborts the
    /// remaining checks.
    pub async fn system_health(&self) -> Vec<String> {
        let mut findings = Vec::new();

        match self.monitor("sam_connection_operational").await {
            Ok(Value::Bool(false)) => findings.push("Sam connection not operational.".to_string()),
            Ok(_) => {}
            Err(e) => findings.push(format!(
                "Checking if the sam connection is operational failed: {}",
                e
            )),
        }

        match self.monitor("ext_store_connection_operational").await {
            Ok(Value::Bool(false)) => findings.push(
                "External storage connection not operational. Scanning continues until the \
                 offload queue is full."
                    .to_string(),
            ),
            Ok(_) => {}
            Err(e) => findings.push(format!(
                "Checking the external storage connection failed: {}",
                e
            )),
        }

        match self.monitor("install_in_progress").await {
            Ok(Value::Bool(true)) => findings.push("Installation in progress.".to_string()),
            Ok(_) => {}
            Err(e) => findings.push(format!(
                "Checking if an installation is in progress failed: {}",
                e
            )),
        }

        match self.monitor("last_install_success").await {
            Ok(Value::Bool(false)) => {
                findings.push("Last installation was unsuccessful.".to_string())
            }
            Ok(_) => {}
            Err(e) => findings.push(format!(
                "Checking if last installation was successful failed: {}",
                e
            )),
        }

        match self.monitor("offload_queue_fill_level").await {
            Ok(level) => {
                if let Some(level) = level.as_f64().filter(|l| *l >= MAX_QUEUE_FILL) {
                    findings.push(format!(
                        "The offload queue is full, filling rate is: {} percent.",
                        level
                    ));
                }
            }
            Err(e) => findings.push(format!(
                "Checking monitor status of offload_queue_fill_level failed: {}",
                e
            )),
        }

        for finding in &findings {
            tracing::error!("ASM system check: {}", finding);
        }
        findings
    }
}

fn query(pairs: &[(&str, &str)]) -> String {
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

/// Replace arrays longer than [`MAX_LOGGED_VALUES`] by their head.
fn abbreviate_json(value: &Value) -> Value {
    match value {
        Value::Array(items) if items.len() > MAX_LOGGED_VALUES => {
            let mut head: Vec<Value> = items[..MAX_LOGGED_VALUES]
                .iter()
                .map(abbreviate_json)
                .collect();
            head.push(Value::String(format!("... ({} values)", items.len())));
            Value::Array(head)
        }
        Value::Array(items) => Value::Array(items.iter().map(abbreviate_json).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), abbreviate_json(value)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Decode a base64 encoded grey-level image (PNG or TIFF).
pub(crate) fn decode_field_image(body: &[u8]) -> AsmResult<DataArray> {
    let text = String::from_utf8_lossy(body);
    let encoded: String = text
        .trim()
        .trim_matches('"')
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    let raw = base64::engine::general_purpose::STANDARD
        .decode(encoded.as_bytes())
        .map_err(|e| AsmError::ImageDecode(format!("invalid base64 payload: {}", e)))?;
    let decoded =
        image::load_from_memory(&raw).map_err(|e| AsmError::ImageDecode(e.to_string()))?;

    let (width, height) = (decoded.width(), decoded.height());
    Ok(match decoded {
        DynamicImage::ImageLuma16(buffer) => DataArray::from_u16(width, height, buffer.as_raw()),
        other => DataArray::from_u8(width, height, other.to_luma8().into_raw()),
    })
}
