//! Image data and metadata.

use serde_json::Value;
use std::collections::BTreeMap;

/// Free-form metadata attached to images and owned by devices.
pub type Metadata = BTreeMap<String, Value>;

/// Name of the hardware component(s) that produced the data.
pub const MD_HW_NAME: &str = "Hardware name";
/// Hardware version(s).
pub const MD_HW_VERSION: &str = "Hardware version";
/// Software/driver version(s).
pub const MD_SW_VERSION: &str = "Software version";
/// Stage position (x, y) in m.
pub const MD_POS: &str = "Centre position";
/// Pixel size (x, y) in m.
pub const MD_PIXEL_SIZE: &str = "Pixel size";
/// Dwell time in s.
pub const MD_DWELL_TIME: &str = "Pixel dwell time";
/// Acquisition date, in seconds since the UNIX epoch.
pub const MD_ACQ_DATE: &str = "Acquisition date";
/// Pixel position (x, y) of a field inside its mega-field.
pub const MD_FIELD_POSITION: &str = "Field position";

const JOINED_KEYS: [&str; 3] = [MD_HW_NAME, MD_HW_VERSION, MD_SW_VERSION];

/// Merge metadata maps in order.
///
/// The first map holding a key wins, except for the hardware/software name
/// and version keys whose string values are joined with `", "`.
pub fn merge_metadata<'a, I>(sources: I) -> Metadata
where
    I: IntoIterator<Item = &'a Metadata>,
{
    let mut merged = Metadata::new();
    for source in sources {
        for (key, value) in source {
            match merged.get_mut(key) {
                None => {
                    merged.insert(key.clone(), value.clone());
                }
                Some(Value::String(previous)) if JOINED_KEYS.contains(&key.as_str()) => {
                    if let Value::String(next) = value {
                        previous.push_str(", ");
                        previous.push_str(next);
                    }
                }
                Some(_) => {}
            }
        }
    }
    merged
}

/// A 2D grey-level image with metadata.
///
/// # Storage
/// Data is stored as a raw byte vector (`Vec<u8>`), row-major.
/// - 8-bit images: 1 byte per pixel.
/// - 16-bit images: 2 bytes per pixel, Little Endian.
#[derive(Debug, Clone, PartialEq)]
pub struct DataArray {
    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    /// Bits per pixel (8 or 16)
    pub bit_depth: u32,

    /// Raw pixel data
    pub data: Vec<u8>,

    /// Metadata of the acquisition
    pub metadata: Metadata,
}

impl DataArray {
    /// Create a new array from 16-bit pixel data.
    pub fn from_u16(width: u32, height: u32, pixels: &[u16]) -> Self {
        let mut data = Vec::with_capacity(pixels.len() * 2);
        for pixel in pixels {
            data.extend_from_slice(&pixel.to_le_bytes());
        }

        Self {
            width,
            height,
            bit_depth: 16,
            data,
            metadata: Metadata::new(),
        }
    }

    /// Create a new array from 8-bit pixel data.
    pub fn from_u8(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            bit_depth: 8,
            data,
            metadata: Metadata::new(),
        }
    }

    /// The 1×1 zero image returned when no image content was requested.
    pub fn placeholder() -> Self {
        Self::from_u8(1, 1, vec![0])
    }

    /// Replace the metadata.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Shape as (rows, columns).
    pub fn shape(&self) -> (usize, usize) {
        (self.height as usize, self.width as usize)
    }

    /// Get pixel value at (x, y), widening 8-bit data.
    pub fn get(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }

        let idx = y as usize * self.width as usize + x as usize;

        match self.bit_depth {
            8 => self.data.get(idx).map(|&v| u16::from(v)),
            16 => {
                let start = idx * 2;
                let bytes = self.data.get(start..start + 2)?;
                Some(u16::from_le_bytes([bytes[0], bytes[1]]))
            }
            _ => None,
        }
    }

    /// Calculate mean pixel value.
    pub fn mean(&self) -> f64 {
        let (sum, count) = match self.bit_depth {
            8 => (
                self.data.iter().map(|&v| u64::from(v)).sum::<u64>(),
                self.data.len(),
            ),
            16 => (
                self.data
                    .chunks_exact(2)
                    .map(|b| u64::from(u16::from_le_bytes([b[0], b[1]])))
                    .sum::<u64>(),
                self.data.len() / 2,
            ),
            _ => (0, 0),
        };
        if count == 0 {
            0.0
        } else {
            sum as f64 / count as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn placeholder_is_single_zero_pixel() {
        let da = DataArray::placeholder();
        assert_eq!(da.shape(), (1, 1));
        assert_eq!(da.get(0, 0), Some(0));
        assert_eq!(da.get(1, 0), None);
    }

    #[test]
    fn sixteen_bit_access() {
        let da = DataArray::from_u16(2, 2, &[1, 2, 300, 4000]);
        assert_eq!(da.get(0, 1), Some(300));
        assert_eq!(da.get(1, 1), Some(4000));
        assert!((da.mean() - 1076.75).abs() < 1e-9);
    }

    #[test]
    fn merge_joins_names_and_keeps_first_value() {
        let server: Metadata = [(MD_SW_VERSION.to_string(), json!("odemis 3"))].into();
        let mppc: Metadata = [
            (MD_HW_NAME.to_string(), json!("MPPC")),
            (MD_SW_VERSION.to_string(), json!("asm 1.0")),
            (MD_POS.to_string(), json!([0.0, 0.0])),
        ]
        .into();
        let scanner: Metadata = [
            (MD_HW_NAME.to_string(), json!("scanner")),
            (MD_POS.to_string(), json!([1.0, 2.0])),
        ]
        .into();

        let merged = merge_metadata([&server, &mppc, &scanner]);
        assert_eq!(merged[MD_HW_NAME], json!("MPPC, scanner"));
        assert_eq!(merged[MD_SW_VERSION], json!("odemis 3, asm 1.0"));
        assert_eq!(merged[MD_POS], json!([0.0, 0.0]));
    }
}
