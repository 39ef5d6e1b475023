//! Operations behind the `multibeam-daq` subcommands.

use crate::config::AppConfig;
use mb_core::data::{DataArray, MD_FIELD_POSITION};
use mb_driver_asm::simulator::SimulatedAsm;
use mb_driver_asm::storage::StorageUrl;
use mb_driver_asm::{AcquisitionServer, AsmError, DataContent};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Failure of a CLI operation.
#[derive(Error, Debug)]
pub enum CommandError {
    /// The field grid argument could not be parsed.
    #[error("Invalid field grid '{0}', expected <columns>x<rows> such as 3x4")]
    InvalidGrid(String),

    /// Fewer fields arrived than requested.
    #[error("Acquisition ended after {received} of {expected} fields")]
    Incomplete {
        /// Fields requested.
        expected: usize,
        /// Fields delivered before the wait ran out.
        received: usize,
    },

    /// Error reported by the ASM driver.
    #[error(transparent)]
    Driver(#[from] AsmError),
}

/// Result of a CLI operation.
pub type CommandResult<T> = std::result::Result<T, CommandError>;

/// Per-field outcome printed by the CLI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldSummary {
    /// Pixel position of the field in its mega-field.
    pub position: (u64, u64),
    /// Image width [px].
    pub width: u32,
    /// Image height [px].
    pub height: u32,
    /// Bits per pixel.
    pub bit_depth: u32,
    /// Mean grey level.
    pub mean: f64,
}

impl From<&DataArray> for FieldSummary {
    fn from(image: &DataArray) -> Self {
        let coordinate = |index: usize| {
            image
                .metadata
                .get(MD_FIELD_POSITION)
                .and_then(|position| position.get(index))
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0)
        };
        Self {
            position: (coordinate(0), coordinate(1)),
            width: image.width,
            height: image.height,
            bit_depth: image.bit_depth,
            mean: image.mean(),
        }
    }
}

/// Parse `<columns>x<rows>`, both at least 1.
pub fn parse_field_grid(value: &str) -> CommandResult<(u32, u32)> {
    let invalid = || CommandError::InvalidGrid(value.to_string());
    let (columns, rows) = value
        .to_lowercase()
        .split_once('x')
        .map(|(c, r)| (c.trim().parse::<u32>(), r.trim().parse::<u32>()))
        .ok_or_else(invalid)?;
    match (columns, rows) {
        (Ok(columns), Ok(rows)) if columns > 0 && rows > 0 => Ok((columns, rows)),
        _ => Err(invalid()),
    }
}

/// Connect to the configured ASM, or to an in-process simulator.
pub async fn open_server(config: &AppConfig, simulate: bool) -> CommandResult<AcquisitionServer> {
    let driver_config = config.driver_config();
    let server = if simulate {
        tracing::info!("Using the simulated ASM");
        AcquisitionServer::with_transport(driver_config, Arc::new(SimulatedAsm::new())).await?
    } else {
        AcquisitionServer::connect(driver_config).await?
    };
    Ok(server)
}

/// Scan a `columns` x `rows` mega-field row by row.
pub async fn acquire_megafield(
    server: &AcquisitionServer,
    grid: (u32, u32),
    content: DataContent,
    field_timeout: Duration,
) -> CommandResult<Vec<FieldSummary>> {
    let mppc = server.mppc();
    mppc.data_content().set(content).map_err(AsmError::from)?;

    let (sender, mut images) = mpsc::unbounded_channel();
    let id = mppc.data().subscribe(move |image| {
        let _ = sender.send(FieldSummary::from(image));
    })?;

    let expected = (grid.0 * grid.1) as usize;
    for y in 0..grid.1 {
        for x in 0..grid.0 {
            mppc.data().next((x, y))?;
        }
    }

    let mut summaries = Vec::with_capacity(expected);
    while summaries.len() < expected {
        match tokio::time::timeout(field_timeout, images.recv()).await {
            Ok(Some(summary)) => {
                tracing::info!(
                    "Field {}/{} at {:?}: mean {:.1}",
                    summaries.len() + 1,
                    expected,
                    summary.position,
                    summary.mean
                );
                summaries.push(summary);
            }
            Ok(None) | Err(_) => break,
        }
    }
    mppc.data().unsubscribe(id);

    if summaries.len() < expected {
        mppc.cancel_acquisition().await?;
        return Err(CommandError::Incomplete {
            expected,
            received: summaries.len(),
        });
    }
    Ok(summaries)
}

/// Acquire field (0, 0) in its own mega-field.
pub async fn acquire_single(
    server: &AcquisitionServer,
    content: DataContent,
) -> CommandResult<FieldSummary> {
    let image = server.mppc().data().get_with(content, (0, 0)).await?;
    Ok(FieldSummary::from(&image))
}

/// Run the calibration loop for `duration`.
pub async fn run_calibration(server: &AcquisitionServer, duration: Duration) -> CommandResult<()> {
    server.set_calibration_mode(true).await?;
    if let Some(parameters) = server.calibration_parameters() {
        tracing::info!(
            "Calibration loop running with {} descan and {} scan setpoints per period",
            parameters.x_descan_setpoints.len(),
            parameters.x_scan_setpoints.len()
        );
    }
    tokio::time::sleep(duration).await;
    server.set_calibration_mode(false).await?;
    Ok(())
}

/// Whether `mega_field_id` exists in the current storage directory.
pub async fn check_stored(server: &AcquisitionServer, mega_field_id: &str) -> CommandResult<bool> {
    let storage = StorageUrl::parse(&server.external_storage_url().get())?;
    Ok(server
        .check_mega_field_exists(mega_field_id, &storage.path)
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_grid_parsing() {
        assert_eq!(parse_field_grid("3x4").unwrap(), (3, 4));
        assert_eq!(parse_field_grid("10X2").unwrap(), (10, 2));
        assert_eq!(parse_field_grid(" 1 x 1 ").unwrap(), (1, 1));
        assert!(parse_field_grid("0x4").is_err());
        assert!(parse_field_grid("3").is_err());
        assert!(parse_field_grid("ax4").is_err());
    }

    #[test]
    fn summary_reads_field_position() {
        let mut image = DataArray::from_u16(2, 1, &[10, 30]);
        image
            .metadata
            .insert(MD_FIELD_POSITION.to_string(), serde_json::json!([640, 1280]));
        let summary = FieldSummary::from(&image);
        assert_eq!(summary.position, (640, 1280));
        assert_eq!((summary.width, summary.height, summary.bit_depth), (2, 1, 16));
        assert_eq!(summary.mean, 20.0);
    }
}
