//! Raw Product Volumes
//!
//! Decoding of Sigmet/IRIS raw product files into an in-memory [`Volume`]:
//! headers, per-sweep and per-ray metadata, and a dense sample array
//! indexed `[channel][sweep][ray][bin]` holding physical values.
//!
//! ```text
//! record 1      product header (byte order probe)
//! record 2      ingest header (task, geometry, data type mask)
//! record 3..    data records, compressed ray data
//! ```

pub mod bytes;
pub mod data_type;
pub mod decoder;
pub mod error;
pub mod header;

use std::mem::size_of;

use chrono::NaiveDateTime;

pub use data_type::{is_data, is_no_data, DataType, StorageWidth, NO_DATA};
pub use decoder::{read_headers, read_volume};
pub use error::{Result, VolumeError};
pub use header::Headers;

/// Per-sweep metadata
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SweepHeader {
    pub ok: bool,
    pub time: Option<NaiveDateTime>,
    /// Fixed angle, radians
    pub angle: f64,
}

/// Per-ray metadata. Angles in radians.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RayHeader {
    /// End of ray reached with a non-empty bin count
    pub ok: bool,
    pub time: Option<NaiveDateTime>,
    pub az0: f64,
    pub az1: f64,
    pub tilt0: f64,
    pub tilt1: f64,
    pub num_bins: usize,
}

/// Polar corners of one bin
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinOutline {
    /// Start and end azimuth, radians
    pub az0: f64,
    pub az1: f64,
    /// Near and far range, metres
    pub r0: f64,
    pub r1: f64,
}

/// A decoded raw product volume
#[derive(Debug, Clone)]
pub struct Volume {
    headers: Headers,
    truncated: bool,
    sweep_count: usize,
    num_rays: usize,
    num_bins: usize,
    /// One entry per declared sweep
    sweeps: Vec<SweepHeader>,
    /// `[sweep][ray]`, flattened
    rays: Vec<RayHeader>,
    /// `[channel][sweep][ray][bin]`, flattened
    data: Vec<f32>,
}

impl Volume {
    /// Empty volume sized from the headers, every bin set to [`NO_DATA`]
    fn allocate(headers: Headers) -> Result<Self> {
        let num_sweeps = headers.num_sweeps();
        let num_rays = headers.num_rays();
        let num_bins = headers.num_bins();
        let channels = headers.types.len();

        let ray_count = num_sweeps
            .checked_mul(num_rays)
            .ok_or(VolumeError::AllocFailure { what: "ray headers" })?;
        let sample_count = ray_count
            .checked_mul(num_bins)
            .and_then(|n| n.checked_mul(channels))
            .ok_or(VolumeError::AllocFailure { what: "sample array" })?;

        let mut rays = Vec::new();
        rays.try_reserve_exact(ray_count)
            .map_err(|_| VolumeError::AllocFailure { what: "ray headers" })?;
        rays.resize(ray_count, RayHeader::default());

        let mut data = Vec::new();
        data.try_reserve_exact(sample_count)
            .map_err(|_| VolumeError::AllocFailure { what: "sample array" })?;
        data.resize(sample_count, NO_DATA);

        Ok(Self {
            headers,
            truncated: false,
            sweep_count: num_sweeps,
            num_rays,
            num_bins,
            sweeps: vec![SweepHeader::default(); num_sweeps],
            rays,
            data,
        })
    }

    fn finish(&mut self, sweep_count: usize, truncated: bool) {
        self.sweep_count = sweep_count;
        self.truncated = truncated;
        for (s, sweep) in self.sweeps.iter_mut().enumerate() {
            sweep.ok = s < sweep_count && sweep.time.is_some();
        }
    }

    fn offset(&self, c: usize, s: usize, r: usize) -> usize {
        ((c * self.sweeps.len() + s) * self.num_rays + r) * self.num_bins
    }

    fn row_mut(&mut self, c: usize, s: usize, r: usize) -> &mut [f32] {
        let start = self.offset(c, s, r);
        &mut self.data[start..start + self.num_bins]
    }

    fn check(what: &'static str, index: usize, count: usize) -> Result<()> {
        if index < count {
            Ok(())
        } else {
            Err(VolumeError::IndexOutOfRange { what, index, count })
        }
    }

    // ============ Volume-wide ============

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// User visible data types, in channel order
    pub fn channels(&self) -> &[DataType] {
        &self.headers.types
    }

    pub fn channel_index(&self, data_type: DataType) -> Option<usize> {
        self.headers.types.iter().position(|&t| t == data_type)
    }

    /// Sweeps fully received
    pub fn sweep_count(&self) -> usize {
        self.sweep_count
    }

    pub fn rays_per_sweep(&self) -> usize {
        self.num_rays
    }

    /// Nominal bins per ray. Individual rays may carry fewer.
    pub fn bins_per_ray(&self) -> usize {
        self.num_bins
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn nyquist_velocity(&self) -> Option<f64> {
        self.headers.nyquist_velocity()
    }

    /// Approximate heap footprint in bytes
    pub fn memory_size(&self) -> usize {
        size_of::<Self>()
            + self.sweeps.len() * size_of::<SweepHeader>()
            + self.rays.len() * size_of::<RayHeader>()
            + self.data.len() * size_of::<f32>()
    }

    // ============ Sweeps ============

    pub fn sweep_ok(&self, s: usize) -> bool {
        s < self.sweep_count && self.sweeps[s].ok
    }

    pub fn sweep(&self, s: usize) -> Result<&SweepHeader> {
        Self::check("sweep", s, self.sweep_count)?;
        Ok(&self.sweeps[s])
    }

    pub fn sweep_time(&self, s: usize) -> Result<Option<NaiveDateTime>> {
        Ok(self.sweep(s)?.time)
    }

    pub fn sweep_angle(&self, s: usize) -> Result<f64> {
        Ok(self.sweep(s)?.angle)
    }

    // ============ Rays ============

    pub fn ray(&self, s: usize, r: usize) -> Result<&RayHeader> {
        Self::check("sweep", s, self.sweep_count)?;
        Self::check("ray", r, self.num_rays)?;
        Ok(&self.rays[s * self.num_rays + r])
    }

    pub fn ray_ok(&self, s: usize, r: usize) -> bool {
        self.ray(s, r).map(|h| h.ok).unwrap_or(false)
    }

    pub fn ray_time(&self, s: usize, r: usize) -> Result<Option<NaiveDateTime>> {
        Ok(self.ray(s, r)?.time)
    }

    pub fn ray_az0(&self, s: usize, r: usize) -> Result<f64> {
        Ok(self.ray(s, r)?.az0)
    }

    pub fn ray_az1(&self, s: usize, r: usize) -> Result<f64> {
        Ok(self.ray(s, r)?.az1)
    }

    pub fn ray_tilt0(&self, s: usize, r: usize) -> Result<f64> {
        Ok(self.ray(s, r)?.tilt0)
    }

    pub fn ray_tilt1(&self, s: usize, r: usize) -> Result<f64> {
        Ok(self.ray(s, r)?.tilt1)
    }

    pub fn ray_num_bins(&self, s: usize, r: usize) -> Result<usize> {
        Ok(self.ray(s, r)?.num_bins)
    }

    // ============ Samples ============

    /// Value of one bin. Rays that are not ok read as [`NO_DATA`].
    pub fn value(&self, c: usize, s: usize, r: usize, b: usize) -> Result<f32> {
        Self::check("channel", c, self.headers.types.len())?;
        Self::check("bin", b, self.num_bins)?;
        let ray = self.ray(s, r)?;
        if !ray.ok || b >= ray.num_bins {
            return Ok(NO_DATA);
        }
        Ok(self.data[self.offset(c, s, r) + b])
    }

    /// Samples of one ray, `None` if the ray is not ok
    pub fn ray_values(&self, c: usize, s: usize, r: usize) -> Result<Option<&[f32]>> {
        Self::check("channel", c, self.headers.types.len())?;
        let ray = self.ray(s, r)?;
        if !ray.ok {
            return Ok(None);
        }
        let start = self.offset(c, s, r);
        Ok(Some(&self.data[start..start + ray.num_bins]))
    }

    /// Corners of bin `b` of a ray, without any geographic projection
    pub fn bin_outline(&self, s: usize, r: usize, b: usize) -> Result<BinOutline> {
        Self::check("bin", b, self.num_bins)?;
        let ray = self.ray(s, r)?;
        let step = self.headers.bin_step_m();
        let r0 = self.headers.range_first_bin_m() + b as f64 * step;
        Ok(BinOutline {
            az0: ray.az0,
            az1: ray.az1,
            r0,
            r1: r0 + step,
        })
    }
}
