//! In-process ASM simulator.
//!
//! Implements [`AsmTransport`] by answering requests from memory, with the
//! same endpoints and status codes as the real ASM. Used by the tests and by
//! `--simulate` runs of the CLI.
//!
//! Faults can be injected per endpoint ([`SimulatedAsm::fail_endpoint`]), the
//! whole host can be made unreachable, and monitor items can be changed to
//! exercise the health checks.

use crate::descriptors::{CalibrationLoopParameters, FieldMetadata, MegaFieldMetadata};
use crate::error::{AsmError, AsmResult};
use crate::transport::{ApiRequest, ApiResponse, AsmTransport, HttpMethod};
use async_trait::async_trait;
use base64::Engine;
use image::{DynamicImage, ImageBuffer, ImageFormat, Luma};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::time::Duration;

/// Host URL reported by the simulator.
pub const SIMULATED_HOST: &str = "http://simulated-asm/v2";

/// Side length of the thumbnails returned by the ASM [px].
pub const THUMBNAIL_SIZE: u32 = 100;

const DEFAULT_CLOCK_FREQUENCY: u64 = 5_000_000;
const DEFAULT_DESCAN_FREQUENCY: u64 = 1_000_000;

/// One request received by the simulator.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    /// HTTP method.
    pub method: HttpMethod,
    /// Path without the query string.
    pub path: String,
    /// Decoded query parameters.
    pub query: BTreeMap<String, String>,
    /// JSON body, if any.
    pub body: Option<Value>,
}

/// External storage pushed with `set_external_storage`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageTarget {
    /// Storage host.
    pub host: String,
    /// Storage user.
    pub user: String,
    /// Storage password.
    pub password: String,
}

struct SimState {
    clock_frequency: u64,
    descan_frequency: u64,
    open_megafield: Option<MegaFieldMetadata>,
    finished_megafields: Vec<(String, String)>,
    scanned_fields: Vec<FieldMetadata>,
    calibration: Option<CalibrationLoopParameters>,
    storage: Option<StorageTarget>,
    software_name: Option<String>,
    monitor: HashMap<String, Value>,
    failures: HashMap<String, u16>,
    unreachable: bool,
    scan_delay: Duration,
    finish_delay: Duration,
    requests: Vec<RecordedRequest>,
}

/// Simulated ASM.
pub struct SimulatedAsm {
    state: Mutex<SimState>,
}

impl Default for SimulatedAsm {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedAsm {
    /// Simulator with the default clock frequencies and a healthy system.
    pub fn new() -> Self {
        let monitor = HashMap::from([
            ("sam_connection_operational".to_string(), json!(true)),
            ("ext_store_connection_operational".to_string(), json!(true)),
            ("install_in_progress".to_string(), json!(false)),
            ("last_install_success".to_string(), json!(true)),
            ("offload_queue_fill_level".to_string(), json!(0)),
        ]);
        Self {
            state: Mutex::new(SimState {
                clock_frequency: DEFAULT_CLOCK_FREQUENCY,
                descan_frequency: DEFAULT_DESCAN_FREQUENCY,
                open_megafield: None,
                finished_megafields: Vec::new(),
                scanned_fields: Vec::new(),
                calibration: None,
                storage: None,
                software_name: None,
                monitor,
                failures: HashMap::new(),
                unreachable: false,
                scan_delay: Duration::ZERO,
                finish_delay: Duration::ZERO,
                requests: Vec::new(),
            }),
        }
    }

    /// Override the scanner and descanner clock frequencies [Hz].
    pub fn with_clock_frequencies(self, scanner: u64, descanner: u64) -> Self {
        {
            let mut state = self.state.lock();
            state.clock_frequency = scanner;
            state.descan_frequency = descanner;
        }
        self
    }

    /// Time spent in each `scan_field` call.
    pub fn with_scan_delay(self, delay: Duration) -> Self {
        self.state.lock().scan_delay = delay;
        self
    }

    /// Time spent in each `finish_mega_field` call.
    pub fn with_finish_delay(self, delay: Duration) -> Self {
        self.state.lock().finish_delay = delay;
        self
    }

    // =========================================================================
    // Fault injection
    // =========================================================================

    /// Answer every request to `path` with `status`.
    pub fn fail_endpoint(&self, path: &str, status: u16) {
        self.state.lock().failures.insert(path.to_string(), status);
    }

    /// Remove every injected failure.
    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Make every request fail as if the host could not be reached.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Change the value reported for a monitor item.
    pub fn set_monitor(&self, item: &str, value: Value) {
        self.state.lock().monitor.insert(item.to_string(), value);
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }

    /// Number of requests received for `path` (without query string).
    pub fn request_count(&self, path: &str) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|request| request.path == path)
            .count()
    }

    /// Forget the recorded requests.
    pub fn clear_requests(&self) {
        self.state.lock().requests.clear();
    }

    /// Descriptor of the mega-field being acquired.
    pub fn open_megafield(&self) -> Option<MegaFieldMetadata> {
        self.state.lock().open_megafield.clone()
    }

    /// Field positions scanned so far, in order.
    pub fn scanned_fields(&self) -> Vec<FieldMetadata> {
        self.state.lock().scanned_fields.clone()
    }

    /// Parameters of the running calibration loop.
    pub fn calibration_loop(&self) -> Option<CalibrationLoopParameters> {
        self.state.lock().calibration.clone()
    }

    /// Storage last pushed with `set_external_storage`.
    pub fn storage(&self) -> Option<StorageTarget> {
        self.state.lock().storage.clone()
    }

    /// Name last pushed with `set_system_sw_name`.
    pub fn software_name(&self) -> Option<String> {
        self.state.lock().software_name.clone()
    }

    // =========================================================================
    // Request handling
    // =========================================================================

    fn handle(&self, request: &RecordedRequest) -> ApiResponse {
        let mut state = self.state.lock();
        state.requests.push(request.clone());

        if let Some(&status) = state.failures.get(&request.path) {
            return error_response(status, 500, "Simulated failure");
        }

        match (request.method, request.path.as_str()) {
            (HttpMethod::Post, "/scan/finish_mega_field") => {
                if let Some(megafield) = state.open_megafield.take() {
                    state
                        .finished_megafields
                        .push((megafield.mega_field_id, megafield.storage_directory));
                }
                no_content()
            }
            (HttpMethod::Post, "/scan/start_mega_field") => {
                if state.open_megafield.is_some() {
                    return error_response(400, 3, "A mega field is already being acquired");
                }
                match parse_body::<MegaFieldMetadata>(request) {
                    Ok(megafield) => {
                        state.open_megafield = Some(megafield);
                        no_content()
                    }
                    Err(response) => response,
                }
            }
            (HttpMethod::Post, "/scan/scan_field") => {
                if state.open_megafield.is_none() {
                    return error_response(400, 4, "No mega field acquisition in progress");
                }
                match parse_body::<FieldMetadata>(request) {
                    Ok(field) => {
                        state.scanned_fields.push(field);
                        no_content()
                    }
                    Err(response) => response,
                }
            }
            (HttpMethod::Get, "/scan/field") => {
                let Some(megafield) = state.open_megafield.as_ref() else {
                    return error_response(400, 4, "No mega field acquisition in progress");
                };
                let position = (
                    query_number(request, "x").unwrap_or(0),
                    query_number(request, "y").unwrap_or(0),
                );
                let thumbnail = request.query.get("thumbnail").map(String::as_str) == Some("true");
                match field_image(megafield, position, thumbnail) {
                    Ok(body) => ApiResponse::new(200, body),
                    Err(message) => error_response(500, 5, &message),
                }
            }
            (HttpMethod::Post, "/scan/check_mega_field") => {
                let id = request.query.get("mega_field_id").cloned().unwrap_or_default();
                let directory = request
                    .query
                    .get("storage_directory")
                    .cloned()
                    .unwrap_or_default();
                let exists = state
                    .finished_megafields
                    .iter()
                    .any(|(stored_id, stored_dir)| *stored_id == id && *stored_dir == directory);
                json_response(json!({ "exists": exists }))
            }
            (HttpMethod::Get, "/scan/clock_frequency") => {
                json_response(json!({ "frequency": state.clock_frequency }))
            }
            (HttpMethod::Get, "/scan/descan_control_frequency") => {
                json_response(json!({ "frequency": state.descan_frequency }))
            }
            (HttpMethod::Post, "/scan/start_calibration_loop") => {
                match parse_body::<CalibrationLoopParameters>(request) {
                    Ok(parameters) => {
                        state.calibration = Some(parameters);
                        no_content()
                    }
                    Err(response) => response,
                }
            }
            (HttpMethod::Post, "/scan/stop_calibration_loop") => {
                state.calibration = None;
                no_content()
            }
            (HttpMethod::Post, "/config/set_external_storage") => {
                let get = |key: &str| request.query.get(key).cloned().unwrap_or_default();
                state.storage = Some(StorageTarget {
                    host: get("host"),
                    user: get("user"),
                    password: get("password"),
                });
                no_content()
            }
            (HttpMethod::Post, "/config/set_system_sw_name") => {
                state.software_name = request.query.get("software").cloned();
                no_content()
            }
            (HttpMethod::Get, path) if path.starts_with("/monitor/") => {
                let item = &path["/monitor/".len()..];
                match state.monitor.get(item) {
                    Some(value) => json_response(value.clone()),
                    None => ApiResponse::new(404, "Not Found"),
                }
            }
            _ => ApiResponse::new(404, "Not Found"),
        }
    }
}

#[async_trait]
impl AsmTransport for SimulatedAsm {
    fn base_url(&self) -> &str {
        SIMULATED_HOST
    }

    async fn send(&self, request: ApiRequest) -> AsmResult<ApiResponse> {
        let (unreachable, scan_delay, finish_delay) = {
            let state = self.state.lock();
            (state.unreachable, state.scan_delay, state.finish_delay)
        };
        if unreachable {
            return Err(AsmError::Connectivity(format!(
                "Request to {}{} failed: connection refused",
                SIMULATED_HOST, request.path
            )));
        }

        let (path, query) = split_query(&request.path);
        let delay = match path.as_str() {
            "/scan/scan_field" => scan_delay,
            "/scan/finish_mega_field" => finish_delay,
            _ => Duration::ZERO,
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let recorded = RecordedRequest {
            method: request.method,
            path,
            query,
            body: request.body,
        };
        let response = self.handle(&recorded);
        tracing::trace!("Simulated ASM {} -> {}", recorded.path, response.status);
        Ok(response)
    }
}

fn split_query(raw: &str) -> (String, BTreeMap<String, String>) {
    match raw.split_once('?') {
        Some((path, query)) => (
            path.to_string(),
            url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect(),
        ),
        None => (raw.to_string(), BTreeMap::new()),
    }
}

fn query_number(request: &RecordedRequest, key: &str) -> Option<u64> {
    request.query.get(key).and_then(|value| value.parse().ok())
}

fn parse_body<T: DeserializeOwned>(request: &RecordedRequest) -> Result<T, ApiResponse> {
    let body = request.body.clone().unwrap_or(Value::Null);
    serde_json::from_value(body)
        .map_err(|e| error_response(422, 2, &format!("Invalid request body: {}", e)))
}

fn no_content() -> ApiResponse {
    ApiResponse::new(204, "")
}

fn json_response(value: Value) -> ApiResponse {
    ApiResponse::new(200, value.to_string())
}

fn error_response(status: u16, status_code: i64, message: &str) -> ApiResponse {
    ApiResponse::new(
        status,
        json!({ "status_code": status_code, "message": message }).to_string(),
    )
}

/// Base64 encoded PNG: 8 bit thumbnails, 16 bit full images.
fn field_image(
    megafield: &MegaFieldMetadata,
    position: (u64, u64),
    thumbnail: bool,
) -> Result<String, String> {
    let offset = (position.0 + position.1) as u32;
    let image = if thumbnail {
        DynamicImage::ImageLuma8(ImageBuffer::from_fn(THUMBNAIL_SIZE, THUMBNAIL_SIZE, |x, y| {
            Luma([((x + y + offset) % 256) as u8])
        }))
    } else {
        let cells_per_side = (megafield.cell_parameters.len() as f64).sqrt().round().max(1.0) as u32;
        let width = megafield.x_eff_cell_size * cells_per_side;
        let height = megafield.y_eff_cell_size * cells_per_side;
        let pixels: ImageBuffer<Luma<u16>, Vec<u16>> = ImageBuffer::from_fn(width, height, |x, y| {
            Luma([((x * 7 + y * 13 + offset) % 4096) as u16])
        });
        DynamicImage::ImageLuma16(pixels)
    };

    let mut encoded = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut encoded), ImageFormat::Png)
        .map_err(|e| format!("Failed to encode field image: {}", e))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(encoded))
}
