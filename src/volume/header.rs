//! Header Decoder
//!
//! Positional decoding of the two header records at the start of a raw
//! product volume: the product header (record 1) and the ingest header
//! (record 2). There is no self-description in these records; every field
//! lives at a fixed offset from the start of its enclosing structure.

use chrono::{NaiveDate, NaiveDateTime};

use super::bytes::{bin2_to_rad, bin4_to_rad, ByteOrder, Cursor};
use super::data_type::{nyquist_velocity, ConversionParams, DataType};
use super::error::{Result, VolumeError};

/// Size of every physical record
pub const RECORD_LEN: usize = 6144;

/// `raw_prod_bhdr` at the start of each data record
pub const RAW_PROD_BHDR_LEN: usize = 12;

/// `ingest_data_header`, one per file type, at the start of a sweep
pub const INGEST_DATA_HDR_LEN: usize = 76;

/// Fixed ray header words preceding ray data
pub const RAY_HDR_LEN: usize = 12;

const PRODUCT_END: usize = 332;
const INGEST_CONFIG: usize = 12;
const TASK_CONFIG: usize = 492;
const MAX_SWEEP_ANGLES: usize = 40;

// ============ Common structures ============

/// `ymds_time`: seconds since midnight plus a calendar date
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct YmdsTime {
    pub sec: i32,
    pub msec: u16,
    pub utc: bool,
    pub year: i16,
    pub month: i16,
    pub day: i16,
}

impl YmdsTime {
    pub fn parse(c: &Cursor<'_>) -> Result<Self> {
        let msec_word = c.u16_at(4)?;
        Ok(Self {
            sec: c.i32_at(0)?,
            msec: msec_word & 0x3FF,
            utc: msec_word & 0x800 != 0,
            year: c.i16_at(6)?,
            month: c.i16_at(8)?,
            day: c.i16_at(10)?,
        })
    }

    /// Calendar time, or `None` if any date field is zero or out of range
    pub fn to_datetime(&self) -> Option<NaiveDateTime> {
        if self.year == 0 || self.month == 0 || self.day == 0 {
            return None;
        }
        let midnight = NaiveDate::from_ymd_opt(
            i32::from(self.year),
            u32::try_from(self.month).ok()?,
            u32::try_from(self.day).ok()?,
        )?
        .and_hms_opt(0, 0, 0)?;
        let offset = chrono::Duration::seconds(i64::from(self.sec))
            + chrono::Duration::milliseconds(i64::from(self.msec));
        midnight.checked_add_signed(offset)
    }
}

/// `structure_header`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StructureHeader {
    pub id: i16,
    pub format: i16,
    pub size: i32,
    pub flags: i16,
}

impl StructureHeader {
    fn parse(c: &Cursor<'_>) -> Result<Self> {
        Ok(Self {
            id: c.i16_at(0)?,
            format: c.i16_at(2)?,
            size: c.i32_at(4)?,
            flags: c.i16_at(10)?,
        })
    }
}

// ============ Product header (record 1) ============

#[derive(Debug, Clone, Default)]
pub struct ProductConfiguration {
    pub product_type: u16,
    pub generation_time: YmdsTime,
    pub config_file: String,
    pub task_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct ProductEnd {
    pub site_name: String,
    pub iris_version: String,
    pub prf: i32,
    /// 1/100 cm
    pub wave_len: i32,
    /// cm
    pub range_first_bin: i32,
    /// cm
    pub range_last_bin: i32,
    pub num_out_bins: i32,
}

#[derive(Debug, Clone, Default)]
pub struct ProductHeader {
    pub structure: StructureHeader,
    pub config: ProductConfiguration,
    pub end: ProductEnd,
}

impl ProductHeader {
    fn parse(rec: &Cursor<'_>) -> Result<Self> {
        let end = rec.sub(PRODUCT_END);
        Ok(Self {
            structure: StructureHeader::parse(rec)?,
            config: ProductConfiguration {
                product_type: rec.u16_at(12)?,
                generation_time: YmdsTime::parse(&rec.sub(20))?,
                config_file: rec.text_at(62, 12)?,
                task_name: rec.text_at(74, 12)?,
            },
            end: ProductEnd {
                site_name: end.text_at(0, 16)?,
                iris_version: end.text_at(16, 8)?,
                prf: end.i32_at(120)?,
                wave_len: end.i32_at(148)?,
                range_first_bin: end.i32_at(156)?,
                range_last_bin: end.i32_at(160)?,
                num_out_bins: end.i32_at(164)?,
            },
        })
    }
}

// ============ Ingest header (record 2) ============

#[derive(Debug, Clone, Default)]
pub struct IngestConfiguration {
    pub file_name: String,
    pub num_assoc_files: i16,
    pub num_sweeps: i16,
    pub size_files: i32,
    pub volume_start: YmdsTime,
    pub ray_headers_size: i16,
    pub extended_ray_headers_size: i16,
    pub task_config_table_num: i16,
    pub playback_version: i16,
    pub iris_version: String,
    pub hardware_site_name: String,
    pub local_minutes_west: i16,
    pub site_name: String,
    pub recorded_minutes_west: i16,
    /// Binary angle
    pub latitude: u32,
    /// Binary angle
    pub longitude: u32,
    /// metres
    pub ground_elevation: i16,
    /// metres above ground
    pub radar_height: i16,
    pub resolution: u16,
    pub index_first_ray: u16,
    pub num_rays: u16,
    pub num_bytes_gparam: i16,
    /// cm
    pub altitude: i32,
    pub fault: u32,
    pub melting_level: i16,
    pub time_zone: String,
    pub flags: u32,
    pub config_name: String,
}

impl IngestConfiguration {
    fn parse(c: &Cursor<'_>) -> Result<Self> {
        Ok(Self {
            file_name: c.text_at(0, 80)?,
            num_assoc_files: c.i16_at(80)?,
            num_sweeps: c.i16_at(82)?,
            size_files: c.i32_at(84)?,
            volume_start: YmdsTime::parse(&c.sub(88))?,
            ray_headers_size: c.i16_at(112)?,
            extended_ray_headers_size: c.i16_at(114)?,
            task_config_table_num: c.i16_at(116)?,
            playback_version: c.i16_at(118)?,
            iris_version: c.text_at(124, 8)?,
            hardware_site_name: c.text_at(132, 16)?,
            local_minutes_west: c.i16_at(148)?,
            site_name: c.text_at(150, 16)?,
            recorded_minutes_west: c.i16_at(166)?,
            latitude: c.u32_at(168)?,
            longitude: c.u32_at(172)?,
            ground_elevation: c.i16_at(176)?,
            radar_height: c.i16_at(178)?,
            resolution: c.u16_at(180)?,
            index_first_ray: c.u16_at(182)?,
            num_rays: c.u16_at(184)?,
            num_bytes_gparam: c.i16_at(186)?,
            altitude: c.i32_at(188)?,
            fault: c.u32_at(216)?,
            melting_level: c.i16_at(220)?,
            time_zone: c.text_at(224, 8)?,
            flags: c.u32_at(232)?,
            config_name: c.text_at(236, 16)?,
        })
    }

    pub fn latitude_rad(&self) -> f64 {
        signed_angle(bin4_to_rad(self.latitude))
    }

    pub fn longitude_rad(&self) -> f64 {
        signed_angle(bin4_to_rad(self.longitude))
    }
}

/// Fold an angle in [0, 2pi) into (-pi, pi]
fn signed_angle(a: f64) -> f64 {
    if a > std::f64::consts::PI {
        a - std::f64::consts::TAU
    } else {
        a
    }
}

/// Multiple PRF mode of the signal processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MultiPrf {
    #[default]
    OneOne,
    TwoThree,
    ThreeFour,
    FourFive,
    Unknown(u16),
}

impl MultiPrf {
    fn from_code(code: u16) -> Self {
        match code {
            0 => Self::OneOne,
            1 => Self::TwoThree,
            2 => Self::ThreeFour,
            3 => Self::FourFive,
            other => Self::Unknown(other),
        }
    }

    /// Nyquist multiplier, `None` for unknown modes
    pub fn multiplier(self) -> Option<u32> {
        match self {
            Self::OneOne => Some(1),
            Self::TwoThree => Some(2),
            Self::ThreeFour => Some(3),
            Self::FourFive => Some(4),
            Self::Unknown(_) => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::OneOne => "1:1",
            Self::TwoThree => "2:3",
            Self::ThreeFour => "3:4",
            Self::FourFive => "4:5",
            Self::Unknown(_) => "unknown",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DspInfo {
    pub major_mode: u16,
    pub dsp_type: u16,
    /// Word 0 of the current data type mask
    pub data_mask: u32,
    pub ext_hdr_type: u32,
    /// Hz
    pub prf: i32,
    /// 1/100 microseconds
    pub pulse_width: i32,
    pub multi_prf: MultiPrf,
    pub dual_prf_delay: i16,
}

impl DspInfo {
    fn parse(c: &Cursor<'_>) -> Result<Self> {
        Ok(Self {
            major_mode: c.u16_at(0)?,
            dsp_type: c.u16_at(2)?,
            data_mask: c.u32_at(4)?,
            ext_hdr_type: c.u32_at(8)?,
            prf: c.i32_at(136)?,
            pulse_width: c.i32_at(140)?,
            multi_prf: MultiPrf::from_code(c.u16_at(144)?),
            dual_prf_delay: c.i16_at(146)?,
        })
    }
}

/// Range geometry. Distances in cm.
#[derive(Debug, Clone, Default)]
pub struct RangeInfo {
    pub range_first_bin: i32,
    pub range_last_bin: i32,
    pub num_bins_in: i16,
    pub num_bins_out: i16,
    pub step_in: i32,
    pub step_out: i32,
}

impl RangeInfo {
    fn parse(c: &Cursor<'_>) -> Result<Self> {
        Ok(Self {
            range_first_bin: c.i32_at(0)?,
            range_last_bin: c.i32_at(4)?,
            num_bins_in: c.i16_at(8)?,
            num_bins_out: c.i16_at(10)?,
            step_in: c.i32_at(12)?,
            step_out: c.i32_at(16)?,
        })
    }
}

/// Scan strategy payload, selected by the task's scan mode
#[derive(Debug, Clone, PartialEq)]
pub enum ScanInfo {
    Ppi {
        /// Sector scan if true, full circle otherwise
        sector: bool,
        left_azimuth: f64,
        right_azimuth: f64,
        elevations: Vec<f64>,
        start: u8,
    },
    Rhi {
        low_elevation: f64,
        high_elevation: f64,
        azimuths: Vec<f64>,
        start: u8,
    },
    File {
        first_azimuth: f64,
        first_elevation: f64,
        antenna_control: String,
    },
    Manual {
        flags: u16,
    },
}

impl ScanInfo {
    fn parse(mode: u16, num_sweeps: i16, c: &Cursor<'_>) -> Result<Self> {
        let n = usize::try_from(num_sweeps).unwrap_or(0).min(MAX_SWEEP_ANGLES);
        let angles = |c: &Cursor<'_>| -> Result<Vec<f64>> {
            (0..n).map(|i| Ok(bin2_to_rad(c.u16_at(4 + 2 * i)?))).collect()
        };
        let info = match mode {
            1 | 4 => Self::Ppi {
                sector: mode == 1,
                left_azimuth: bin2_to_rad(c.u16_at(0)?),
                right_azimuth: bin2_to_rad(c.u16_at(2)?),
                elevations: angles(c)?,
                start: c.u8_at(199)?,
            },
            2 => Self::Rhi {
                low_elevation: bin2_to_rad(c.u16_at(0)?),
                high_elevation: bin2_to_rad(c.u16_at(2)?),
                azimuths: angles(c)?,
                start: c.u8_at(199)?,
            },
            3 => Self::Manual {
                flags: c.u16_at(0)?,
            },
            5 => Self::File {
                first_azimuth: bin2_to_rad(c.u16_at(0)?),
                first_elevation: bin2_to_rad(c.u16_at(2)?),
                antenna_control: c.text_at(4, 12)?,
            },
            other => {
                return Err(VolumeError::Malformed(format!("unknown scan mode {}", other)));
            }
        };
        Ok(info)
    }

    pub fn mode_name(&self) -> &'static str {
        match self {
            Self::Ppi { sector: true, .. } => "PPI sector",
            Self::Ppi { sector: false, .. } => "PPI continuous",
            Self::Rhi { .. } => "RHI",
            Self::File { .. } => "file",
            Self::Manual { .. } => "manual",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskScanInfo {
    pub resolution: i16,
    pub num_sweeps: i16,
    pub scan: ScanInfo,
}

impl TaskScanInfo {
    fn parse(c: &Cursor<'_>) -> Result<Self> {
        let num_sweeps = c.i16_at(6)?;
        Ok(Self {
            resolution: c.i16_at(2)?,
            num_sweeps,
            scan: ScanInfo::parse(c.u16_at(0)?, num_sweeps, &c.sub(8))?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct MiscInfo {
    /// 1/100 cm
    pub wave_len: i32,
    pub transmitter_serial: String,
    pub power: i32,
    pub flags: u16,
    pub polarization: u16,
    /// cm
    pub truncation_height: i32,
    /// Binary angle
    pub horiz_beam_width: u32,
    /// Binary angle
    pub vert_beam_width: u32,
}

impl MiscInfo {
    fn parse(c: &Cursor<'_>) -> Result<Self> {
        Ok(Self {
            wave_len: c.i32_at(0)?,
            transmitter_serial: c.text_at(4, 16)?,
            power: c.i32_at(20)?,
            flags: c.u16_at(24)?,
            polarization: c.u16_at(26)?,
            truncation_height: c.i32_at(28)?,
            horiz_beam_width: c.u32_at(64)?,
            vert_beam_width: c.u32_at(68)?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct EndInfo {
    pub task_major: i16,
    pub task_minor: i16,
    pub task_config: String,
    pub description: String,
    pub hybrid_tasks: i32,
    pub task_state: u16,
    pub data_time: YmdsTime,
}

impl EndInfo {
    fn parse(c: &Cursor<'_>) -> Result<Self> {
        Ok(Self {
            task_major: c.i16_at(0)?,
            task_minor: c.i16_at(2)?,
            task_config: c.text_at(4, 12)?,
            description: c.text_at(16, 80)?,
            hybrid_tasks: c.i32_at(96)?,
            task_state: c.u16_at(100)?,
            data_time: YmdsTime::parse(&c.sub(104))?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct TaskConfiguration {
    pub structure: StructureHeader,
    pub dsp: DspInfo,
    pub range: RangeInfo,
    pub scan: TaskScanInfo,
    pub misc: MiscInfo,
    pub end: EndInfo,
}

impl TaskConfiguration {
    fn parse(c: &Cursor<'_>) -> Result<Self> {
        Ok(Self {
            structure: StructureHeader::parse(c)?,
            dsp: DspInfo::parse(&c.sub(132))?,
            range: RangeInfo::parse(&c.sub(772))?,
            scan: TaskScanInfo::parse(&c.sub(932))?,
            misc: MiscInfo::parse(&c.sub(1252))?,
            end: EndInfo::parse(&c.sub(1572))?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct IngestHeader {
    pub structure: StructureHeader,
    pub config: IngestConfiguration,
    pub task: TaskConfiguration,
}

impl IngestHeader {
    fn parse(rec: &Cursor<'_>) -> Result<Self> {
        Ok(Self {
            structure: StructureHeader::parse(rec)?,
            config: IngestConfiguration::parse(&rec.sub(INGEST_CONFIG))?,
            task: TaskConfiguration::parse(&rec.sub(TASK_CONFIG))?,
        })
    }
}

// ============ Decoded headers ============

/// Everything known about a volume before its data records are read
#[derive(Debug, Clone)]
pub struct Headers {
    pub order: ByteOrder,
    pub product: ProductHeader,
    pub ingest: IngestHeader,
    /// Types in on-disk order, including the extended header pseudo-type
    pub file_types: Vec<DataType>,
    /// User visible types
    pub types: Vec<DataType>,
}

impl Headers {
    /// Decode the first two records. Byte order comes from record 1.
    pub fn parse(rec1: &[u8], rec2: &[u8]) -> Result<Self> {
        let order = ByteOrder::detect(rec1)?;
        let product = ProductHeader::parse(&Cursor::new(rec1, order))?;
        let ingest = IngestHeader::parse(&Cursor::new(rec2, order))?;

        let file_types = DataType::from_mask(ingest.task.dsp.data_mask);
        let types = file_types
            .iter()
            .copied()
            .filter(|t| !t.is_pseudo())
            .collect();

        Ok(Self {
            order,
            product,
            ingest,
            file_types,
            types,
        })
    }

    pub fn has_extended_headers(&self) -> bool {
        self.file_types.first() == Some(&DataType::Xhdr)
    }

    /// Sweep count declared by the task
    pub fn num_sweeps(&self) -> usize {
        usize::try_from(self.ingest.task.scan.num_sweeps).unwrap_or(0)
    }

    pub fn num_rays(&self) -> usize {
        usize::from(self.ingest.config.num_rays)
    }

    /// Nominal bins per ray
    pub fn num_bins(&self) -> usize {
        usize::try_from(self.product.end.num_out_bins).unwrap_or(0)
    }

    /// Bytes in one ray buffer: fixed header, extended header, samples
    pub fn ray_buffer_len(&self) -> usize {
        let ext = usize::try_from(self.ingest.config.extended_ray_headers_size).unwrap_or(0);
        RAY_HDR_LEN + ext + self.num_bins() * 2
    }

    /// Offset of the compressed data in the first record of a sweep
    pub fn sweep_data_offset(&self) -> usize {
        RAW_PROD_BHDR_LEN + self.file_types.len() * INGEST_DATA_HDR_LEN
    }

    /// Wavelength in metres
    pub fn wavelength_m(&self) -> f64 {
        f64::from(self.ingest.task.misc.wave_len) * 1.0e-4
    }

    pub fn prf(&self) -> f64 {
        f64::from(self.ingest.task.dsp.prf)
    }

    /// Nyquist velocity in m/s, `None` for an unknown PRF mode
    pub fn nyquist_velocity(&self) -> Option<f64> {
        let multiplier = self.ingest.task.dsp.multi_prf.multiplier()?;
        Some(nyquist_velocity(self.wavelength_m(), self.prf(), multiplier))
    }

    pub fn conversion_params(&self) -> ConversionParams {
        ConversionParams {
            nyquist: self.nyquist_velocity().unwrap_or(0.0),
            wavelength_cm: self.wavelength_m() * 100.0,
        }
    }

    /// Range to the first bin, metres
    pub fn range_first_bin_m(&self) -> f64 {
        f64::from(self.ingest.task.range.range_first_bin) / 100.0
    }

    /// Bin spacing, metres
    pub fn bin_step_m(&self) -> f64 {
        f64::from(self.ingest.task.range.step_out) / 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_u16(buf: &mut [u8], off: usize, v: u16) {
        buf[off..off + 2].copy_from_slice(&v.to_be_bytes());
    }

    fn put_i32(buf: &mut [u8], off: usize, v: i32) {
        buf[off..off + 4].copy_from_slice(&v.to_be_bytes());
    }

    fn records() -> (Vec<u8>, Vec<u8>) {
        let mut r1 = vec![0u8; RECORD_LEN];
        let mut r2 = vec![0u8; RECORD_LEN];
        put_u16(&mut r1, 0, 27);
        r1[74..78].copy_from_slice(b"VOL1");
        r1[PRODUCT_END..PRODUCT_END + 4].copy_from_slice(b"SITE");
        put_i32(&mut r1, PRODUCT_END + 164, 100);

        let ic = INGEST_CONFIG;
        r2[ic + 150..ic + 159].copy_from_slice(b"RADAR  \0x");
        put_u16(&mut r2, ic + 184, 360);
        put_u16(&mut r2, ic + 172, 0xC000);

        let tc = TASK_CONFIG;
        let mask = (1u32 << 0) | (1 << 2) | (1 << 3);
        put_i32(&mut r2, tc + 132 + 4, mask as i32);
        put_i32(&mut r2, tc + 132 + 136, 1000);
        put_u16(&mut r2, tc + 132 + 144, 1);
        put_i32(&mut r2, tc + 772, 100_000);
        put_i32(&mut r2, tc + 772 + 16, 25_000);
        put_u16(&mut r2, tc + 932, 4);
        put_u16(&mut r2, tc + 932 + 6, 2);
        put_u16(&mut r2, tc + 932 + 8 + 4, 0x0100);
        put_u16(&mut r2, tc + 932 + 8 + 6, 0x0200);
        put_i32(&mut r2, tc + 1252, 533);
        (r1, r2)
    }

    #[test]
    fn parses_big_endian_headers() {
        let (r1, r2) = records();
        let h = Headers::parse(&r1, &r2).unwrap();

        assert_eq!(h.order, ByteOrder::Big);
        assert_eq!(h.product.config.task_name, "VOL1");
        assert_eq!(h.product.end.site_name, "SITE");
        assert_eq!(h.ingest.config.site_name, "RADAR");
        assert_eq!(h.num_rays(), 360);
        assert_eq!(h.num_bins(), 100);
        assert_eq!(h.num_sweeps(), 2);
        assert!(h.has_extended_headers());
        assert_eq!(h.types, vec![DataType::Dbz, DataType::Vel]);
        assert_eq!(h.sweep_data_offset(), 12 + 3 * 76);
        assert_eq!(h.range_first_bin_m(), 1000.0);
        assert_eq!(h.bin_step_m(), 250.0);
        assert!((h.ingest.config.longitude_rad() + std::f64::consts::FRAC_PI_2).abs() < 1e-9);
    }

    #[test]
    fn scan_info_is_a_tagged_variant() {
        let (r1, r2) = records();
        let h = Headers::parse(&r1, &r2).unwrap();
        match &h.ingest.task.scan.scan {
            ScanInfo::Ppi {
                sector, elevations, ..
            } => {
                assert!(!sector);
                assert_eq!(elevations.len(), 2);
                assert!(elevations[1] > elevations[0]);
            }
            other => panic!("expected PPI, got {:?}", other),
        }
    }

    #[test]
    fn unknown_scan_mode_is_malformed() {
        let (r1, mut r2) = records();
        put_u16(&mut r2, TASK_CONFIG + 932, 9);
        assert!(matches!(
            Headers::parse(&r1, &r2),
            Err(VolumeError::Malformed(_))
        ));
    }

    #[test]
    fn nyquist_uses_prf_mode_multiplier() {
        let (r1, r2) = records();
        let h = Headers::parse(&r1, &r2).unwrap();
        assert_eq!(h.ingest.task.dsp.multi_prf, MultiPrf::TwoThree);
        let v = h.nyquist_velocity().unwrap();
        assert!((v - 2.0 * 0.25 * 0.0533 * 1000.0).abs() < 1e-9);
    }

    #[test]
    fn ymds_time_rejects_zero_fields() {
        let t = YmdsTime {
            sec: 3600,
            msec: 500,
            utc: true,
            year: 2010,
            month: 6,
            day: 1,
        };
        let dt = t.to_datetime().unwrap();
        assert_eq!(dt.to_string(), "2010-06-01 01:00:00.500");

        assert!(YmdsTime { year: 0, ..t }.to_datetime().is_none());
        assert!(YmdsTime { month: 13, ..t }.to_datetime().is_none());
    }
}
