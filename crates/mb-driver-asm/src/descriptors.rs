//! Wire-format descriptors exchanged with the ASM.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Image content requested for each field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataContent {
    /// No image, a 1×1 placeholder is delivered.
    Empty,
    /// Fixed-size thumbnail computed by the ASM.
    Thumbnail,
    /// Full resolution field image.
    Full,
}

impl DataContent {
    /// Value of the `thumbnail` query parameter, `None` when no image is fetched.
    pub fn thumbnail_flag(self) -> Option<bool> {
        match self {
            DataContent::Empty => None,
            DataContent::Thumbnail => Some(true),
            DataContent::Full => Some(false),
        }
    }
}

impl FromStr for DataContent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "empty" => Ok(DataContent::Empty),
            "thumbnail" => Ok(DataContent::Thumbnail),
            "full" => Ok(DataContent::Full),
            other => Err(format!(
                "Invalid data content '{}'. Must be one of: empty, thumbnail, full",
                other
            )),
        }
    }
}

impl fmt::Display for DataContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DataContent::Empty => "empty",
            DataContent::Thumbnail => "thumbnail",
            DataContent::Full => "full",
        };
        write!(f, "{}", label)
    }
}

/// Acquisition parameters of one detector cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellParameters {
    /// Cell origin in x [px].
    pub x_eff_orig: i64,
    /// Cell origin in y [px].
    pub y_eff_orig: i64,
    /// Gain applied to the cell signal.
    pub digital_gain: f64,
    /// Offset subtracted from the cell signal.
    pub dark_offset: i64,
}

/// Pixel position of one field inside the mega-field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMetadata {
    /// Field position in x [px].
    pub position_x: u64,
    /// Field position in y [px].
    pub position_y: u64,
}

impl FieldMetadata {
    /// Field index `(ix, iy)` to pixel position `(ix * res_x, iy * res_y)`.
    pub fn from_field_index(field: (u32, u32), resolution: (u32, u32)) -> Self {
        Self {
            position_x: u64::from(field.0) * u64::from(resolution.0),
            position_y: u64::from(field.1) * u64::from(resolution.1),
        }
    }
}

/// Everything the ASM needs to open a mega-field.
///
/// Times are in scanner clock ticks, the pixel size in nm, setpoints in
/// descanner units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MegaFieldMetadata {
    /// Name of the mega-field.
    pub mega_field_id: String,
    /// Sub directory of the external storage.
    pub storage_directory: String,
    /// Free text stored with the images.
    pub custom_data: String,
    /// Stage position in x [m].
    pub stage_position_x: f64,
    /// Stage position in y [m].
    pub stage_position_y: f64,
    /// Pixel size [nm].
    pub pixel_size: i64,
    /// Dwell time per pixel [ticks].
    pub dwell_time: i64,
    /// Delay between scan start and acquisition [ticks].
    pub x_scan_to_acq_delay: i64,
    /// Scanner delay [ticks].
    pub x_scan_delay: i64,
    /// Cell width [px].
    pub x_cell_size: u32,
    /// Cell height [px].
    pub y_cell_size: u32,
    /// Effective cell width [px].
    pub x_eff_cell_size: u32,
    /// Effective cell height [px].
    pub y_eff_cell_size: u32,
    /// Lines scanned before acquiring.
    pub y_prescan_lines: i64,
    /// Scanner gain in x.
    pub x_scan_gain: f64,
    /// Scanner gain in y.
    pub y_scan_gain: f64,
    /// Scanner offset in x.
    pub x_scan_offset: f64,
    /// Scanner offset in y.
    pub y_scan_offset: f64,
    /// Descanner setpoints in x.
    pub x_descan_setpoints: Vec<i16>,
    /// Descanner setpoints in y.
    pub y_descan_setpoints: Vec<i16>,
    /// Descanner offset in x.
    pub x_descan_offset: i32,
    /// Descanner offset in y.
    pub y_descan_offset: i32,
    /// Scan rotation [rad].
    pub scan_rotation: f64,
    /// Descan rotation [rad].
    pub descan_rotation: f64,
    /// Per cell parameters, row by row.
    pub cell_parameters: Vec<CellParameters>,
}

/// Parameters of the periodic calibration signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationLoopParameters {
    /// Descan rotation [rad].
    pub descan_rotation: f64,
    /// Descanner offset in x.
    pub x_descan_offset: i32,
    /// Descanner setpoints in x.
    pub x_descan_setpoints: Vec<i16>,
    /// Descanner offset in y.
    pub y_descan_offset: i32,
    /// Descanner setpoints in y.
    pub y_descan_setpoints: Vec<i16>,
    /// Dwell time per setpoint [ticks].
    pub dwell_time: i64,
    /// Scan rotation [rad].
    pub scan_rotation: f64,
    /// Scanner delay [ticks].
    pub x_scan_delay: i64,
    /// Scanner offset in x.
    pub x_scan_offset: f64,
    /// Scanner setpoints in x.
    pub x_scan_setpoints: Vec<i16>,
    /// Scanner offset in y.
    pub y_scan_offset: f64,
    /// Scanner setpoints in y.
    pub y_scan_setpoints: Vec<i16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub(crate) struct FrequencyReply {
    pub frequency: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub(crate) struct ExistsReply {
    pub exists: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_content_flags() {
        assert_eq!(DataContent::Empty.thumbnail_flag(), None);
        assert_eq!(DataContent::Thumbnail.thumbnail_flag(), Some(true));
        assert_eq!(DataContent::Full.thumbnail_flag(), Some(false));
        assert_eq!("full".parse::<DataContent>().unwrap(), DataContent::Full);
        assert!("bogus".parse::<DataContent>().is_err());
        assert_eq!(
            serde_json::to_value(DataContent::Empty).unwrap(),
            serde_json::json!("empty")
        );
    }

    #[test]
    fn field_index_scales_with_resolution() {
        let field = FieldMetadata::from_field_index((2, 3), (6400, 6000));
        assert_eq!(field.position_x, 12800);
        assert_eq!(field.position_y, 18000);
    }
}
