//! Data Types
//!
//! The physical quantities an instrument can record per bin, their on-disk
//! storage width, and the conversion from stored integers to physical units.

use std::fmt;
use std::str::FromStr;

use super::error::VolumeError;

/// Value stored for bins with no valid sample
pub const NO_DATA: f32 = f32::MIN;

/// Whether a converted value carries data
pub fn is_data(v: f32) -> bool {
    v != NO_DATA
}

pub fn is_no_data(v: f32) -> bool {
    v == NO_DATA
}

/// On-disk width of one sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageWidth {
    One,
    Two,
}

impl StorageWidth {
    pub fn bytes(self) -> usize {
        match self {
            Self::One => 1,
            Self::Two => 2,
        }
    }
}

/// Volume-wide inputs some conversions need
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConversionParams {
    /// Nyquist velocity, m/s
    pub nyquist: f64,
    /// Radar wavelength, cm
    pub wavelength_cm: f64,
}

/// Instrument data types, in data-type-mask order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataType {
    Xhdr,
    Dbt,
    Dbz,
    Vel,
    Width,
    Zdr,
    Dbzc,
    Dbt2,
    Dbz2,
    Vel2,
    Width2,
    Zdr2,
    Rainrate2,
    Kdp,
    Kdp2,
    Phidp,
    Velc,
    Sqi,
    Rhohv,
    Rhohv2,
    Dbzc2,
    Velc2,
    Sqi2,
    Phidp2,
    Ldrh,
    Ldrh2,
    Ldrv,
    Ldrv2,
}

impl DataType {
    pub const COUNT: usize = 28;

    pub const ALL: [DataType; Self::COUNT] = [
        Self::Xhdr,
        Self::Dbt,
        Self::Dbz,
        Self::Vel,
        Self::Width,
        Self::Zdr,
        Self::Dbzc,
        Self::Dbt2,
        Self::Dbz2,
        Self::Vel2,
        Self::Width2,
        Self::Zdr2,
        Self::Rainrate2,
        Self::Kdp,
        Self::Kdp2,
        Self::Phidp,
        Self::Velc,
        Self::Sqi,
        Self::Rhohv,
        Self::Rhohv2,
        Self::Dbzc2,
        Self::Velc2,
        Self::Sqi2,
        Self::Phidp2,
        Self::Ldrh,
        Self::Ldrh2,
        Self::Ldrv,
        Self::Ldrv2,
    ];

    /// Position in [`DataType::ALL`]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Bit in the DSP data type mask that announces this type.
    ///
    /// Bit 6 is unused by the instrument, so types from index 6 on are
    /// shifted up by one.
    pub fn mask_bit(self) -> u32 {
        let y = self.index() as u32;
        if y < 6 {
            y
        } else {
            y + 1
        }
    }

    /// Types announced by a data type mask, in mask order
    pub fn from_mask(mask: u32) -> Vec<DataType> {
        Self::ALL
            .iter()
            .copied()
            .filter(|t| mask & (1 << t.mask_bit()) != 0)
            .collect()
    }

    /// Extended header pseudo-type, never user visible
    pub fn is_pseudo(self) -> bool {
        self == Self::Xhdr
    }

    pub fn abbrev(self) -> &'static str {
        match self {
            Self::Xhdr => "DB_XHDR",
            Self::Dbt => "DB_DBT",
            Self::Dbz => "DB_DBZ",
            Self::Vel => "DB_VEL",
            Self::Width => "DB_WIDTH",
            Self::Zdr => "DB_ZDR",
            Self::Dbzc => "DB_DBZC",
            Self::Dbt2 => "DB_DBT2",
            Self::Dbz2 => "DB_DBZ2",
            Self::Vel2 => "DB_VEL2",
            Self::Width2 => "DB_WIDTH2",
            Self::Zdr2 => "DB_ZDR2",
            Self::Rainrate2 => "DB_RAINRATE2",
            Self::Kdp => "DB_KDP",
            Self::Kdp2 => "DB_KDP2",
            Self::Phidp => "DB_PHIDP",
            Self::Velc => "DB_VELC",
            Self::Sqi => "DB_SQI",
            Self::Rhohv => "DB_RHOHV",
            Self::Rhohv2 => "DB_RHOHV2",
            Self::Dbzc2 => "DB_DBZC2",
            Self::Velc2 => "DB_VELC2",
            Self::Sqi2 => "DB_SQI2",
            Self::Phidp2 => "DB_PHIDP2",
            Self::Ldrh => "DB_LDRH",
            Self::Ldrh2 => "DB_LDRH2",
            Self::Ldrv => "DB_LDRV",
            Self::Ldrv2 => "DB_LDRV2",
        }
    }

    pub fn descr(self) -> &'static str {
        match self {
            Self::Xhdr => "Extended header",
            Self::Dbt => "Total power, 1 byte",
            Self::Dbz => "Reflectivity, 1 byte",
            Self::Vel => "Velocity, 1 byte",
            Self::Width => "Spectrum width, 1 byte",
            Self::Zdr => "Differential reflectivity, 1 byte",
            Self::Dbzc => "Corrected reflectivity, 1 byte",
            Self::Dbt2 => "Total power, 2 byte",
            Self::Dbz2 => "Reflectivity, 2 byte",
            Self::Vel2 => "Velocity, 2 byte",
            Self::Width2 => "Spectrum width, 2 byte",
            Self::Zdr2 => "Differential reflectivity, 2 byte",
            Self::Rainrate2 => "Rainfall rate, 2 byte",
            Self::Kdp => "Specific differential phase, 1 byte",
            Self::Kdp2 => "Specific differential phase, 2 byte",
            Self::Phidp => "Differential phase, 1 byte",
            Self::Velc => "Unfolded velocity, 1 byte",
            Self::Sqi => "Signal quality index, 1 byte",
            Self::Rhohv => "Correlation coefficient, 1 byte",
            Self::Rhohv2 => "Correlation coefficient, 2 byte",
            Self::Dbzc2 => "Corrected reflectivity, 2 byte",
            Self::Velc2 => "Unfolded velocity, 2 byte",
            Self::Sqi2 => "Signal quality index, 2 byte",
            Self::Phidp2 => "Differential phase, 2 byte",
            Self::Ldrh => "Horizontal linear depolarization ratio, 1 byte",
            Self::Ldrh2 => "Horizontal linear depolarization ratio, 2 byte",
            Self::Ldrv => "Vertical linear depolarization ratio, 1 byte",
            Self::Ldrv2 => "Vertical linear depolarization ratio, 2 byte",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Self::Xhdr => "none",
            Self::Dbt | Self::Dbz | Self::Dbzc | Self::Dbt2 | Self::Dbz2 | Self::Dbzc2 => "dBZ",
            Self::Vel | Self::Width | Self::Vel2 | Self::Width2 => "m/s",
            Self::Velc | Self::Velc2 => "m/s",
            Self::Zdr | Self::Zdr2 => "dB",
            Self::Ldrh | Self::Ldrh2 | Self::Ldrv | Self::Ldrv2 => "dB",
            Self::Rainrate2 => "mm/hr",
            Self::Kdp | Self::Kdp2 => "deg/km",
            Self::Phidp | Self::Phidp2 => "deg",
            Self::Sqi | Self::Rhohv | Self::Sqi2 | Self::Rhohv2 => "none",
        }
    }

    pub fn width(self) -> StorageWidth {
        match self {
            Self::Xhdr
            | Self::Dbt2
            | Self::Dbz2
            | Self::Vel2
            | Self::Width2
            | Self::Zdr2
            | Self::Rainrate2
            | Self::Kdp2
            | Self::Rhohv2
            | Self::Dbzc2
            | Self::Velc2
            | Self::Sqi2
            | Self::Phidp2
            | Self::Ldrh2
            | Self::Ldrv2 => StorageWidth::Two,
            _ => StorageWidth::One,
        }
    }

    /// Convert a stored sample to physical units, or [`NO_DATA`]
    pub fn convert(self, raw: u16, params: &ConversionParams) -> f32 {
        if raw == 0 {
            return NO_DATA;
        }
        let value = match self.width() {
            StorageWidth::One => {
                if raw >= 255 {
                    return NO_DATA;
                }
                self.convert_byte(f64::from(raw), params)
            }
            StorageWidth::Two => {
                if raw == u16::MAX && self != Self::Rainrate2 {
                    return NO_DATA;
                }
                self.convert_word(raw)
            }
        };
        match value {
            Some(v) if v.is_finite() => v as f32,
            _ => NO_DATA,
        }
    }

    fn convert_byte(self, x: f64, params: &ConversionParams) -> Option<f64> {
        let v = match self {
            Self::Dbt | Self::Dbz | Self::Dbzc => (x - 64.0) / 2.0,
            Self::Vel => (x - 128.0) / 127.0 * params.nyquist,
            Self::Width => x / 256.0 * params.nyquist,
            Self::Zdr => (x - 128.0) / 16.0,
            Self::Kdp => {
                if params.wavelength_cm <= 0.0 {
                    return None;
                }
                let scale = 0.25 / params.wavelength_cm;
                if x > 128.0 {
                    scale * 600f64.powf((x - 129.0) / 126.0)
                } else if x < 128.0 {
                    -scale * 600f64.powf((127.0 - x) / 126.0)
                } else {
                    0.0
                }
            }
            Self::Phidp => 180.0 * (x - 1.0) / 254.0,
            Self::Velc => 75.0 * (x - 128.0) / 127.0,
            Self::Sqi | Self::Rhohv => ((x - 1.0) / 253.0).sqrt(),
            Self::Ldrh | Self::Ldrv => (x - 1.0) / 5.0 - 45.0,
            _ => return None,
        };
        Some(v)
    }

    fn convert_word(self, raw: u16) -> Option<f64> {
        let x = f64::from(raw);
        let v = match self {
            Self::Dbt2
            | Self::Dbz2
            | Self::Vel2
            | Self::Width2
            | Self::Zdr2
            | Self::Kdp2
            | Self::Dbzc2
            | Self::Velc2
            | Self::Ldrh2
            | Self::Ldrv2 => (x - 32768.0) / 100.0,
            Self::Rainrate2 => {
                let exp = u32::from(raw >> 12);
                let mantissa = u64::from(raw & 0x0FFF);
                let v = if exp == 0 {
                    mantissa
                } else {
                    (mantissa + 0x1000) << (exp - 1)
                };
                (v as f64 - 1.0) / 10000.0
            }
            Self::Phidp2 => 360.0 * (x - 1.0) / 65534.0,
            Self::Sqi2 | Self::Rhohv2 => (x - 1.0) / 65533.0,
            _ => return None,
        };
        Some(v)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.abbrev())
    }
}

impl FromStr for DataType {
    type Err = VolumeError;

    /// Accepts the full abbreviation (`DB_DBZ`) or the bare name (`DBZ`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bare = s.strip_prefix("DB_").unwrap_or(s);
        Self::ALL
            .iter()
            .copied()
            .find(|t| &t.abbrev()[3..] == bare)
            .ok_or_else(|| VolumeError::UnknownDataType(s.to_string()))
    }
}

/// Nyquist velocity in m/s.
///
/// `wavelength_m` in metres, `prf` in Hz, `multiplier` from the multi-PRF
/// mode (1 for single PRF).
pub fn nyquist_velocity(wavelength_m: f64, prf: f64, multiplier: u32) -> f64 {
    0.25 * wavelength_m * prf * f64::from(multiplier)
}
