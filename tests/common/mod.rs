//! Synthetic raw product volumes for integration tests.
//!
//! Writes volumes in either byte order. Samples are stored one or two bytes
//! wide according to their data type.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use sigmet_raw::volume::header::RECORD_LEN;
use sigmet_raw::volume::StorageWidth;
use sigmet_raw::DataType;

const BHDR_LEN: usize = 12;
const INGEST_DATA_HDR_LEN: usize = 76;
const PRODUCT_END: usize = 332;
const INGEST_CONFIG: usize = 12;
const TASK_CONFIG: usize = 492;

fn put_u16(buf: &mut [u8], off: usize, v: u16, big: bool) {
    let b = if big { v.to_be_bytes() } else { v.to_le_bytes() };
    buf[off..off + 2].copy_from_slice(&b);
}

fn put_i32(buf: &mut [u8], off: usize, v: i32, big: bool) {
    let b = if big { v.to_be_bytes() } else { v.to_le_bytes() };
    buf[off..off + 4].copy_from_slice(&b);
}

fn put_text(buf: &mut [u8], off: usize, s: &str) {
    buf[off..off + s.len()].copy_from_slice(s.as_bytes());
}

/// One ray as written: raw samples per type, and whether its end-of-ray
/// tokens are emitted
#[derive(Debug, Clone)]
pub struct SyntheticRay {
    pub az: u16,
    pub tilt: u16,
    pub seconds: u16,
    /// Raw samples, one row per type
    pub samples: Vec<Vec<u16>>,
    pub terminated: bool,
}

#[derive(Debug, Clone)]
pub struct SyntheticVolume {
    pub declared_sweeps: usize,
    pub num_rays: usize,
    pub num_bins: usize,
    pub types: Vec<DataType>,
    /// Sweeps actually written, each a list of rays
    pub sweeps: Vec<Vec<SyntheticRay>>,
    /// Zero words written before the first token of every sweep. Shifts
    /// record boundaries without changing what decodes.
    pub pad_words: usize,
    /// Write a record announcing that no more sweeps follow
    pub end_marker: bool,
    pub prf: i32,
    /// 1/100 cm
    pub wave_len: i32,
    pub big_endian: bool,
    /// Sweep whose start time is written with a zero date
    pub garbled_sweep: Option<usize>,
}

impl SyntheticVolume {
    /// Volume with every declared sweep and ray present. Sample `b` of ray
    /// `r` in sweep `s` for type `t` is `sample(s, r, t, b)`.
    pub fn new<S: Into<u16>>(
        declared_sweeps: usize,
        num_rays: usize,
        num_bins: usize,
        types: Vec<DataType>,
        sample: impl Fn(usize, usize, usize, usize) -> S,
    ) -> Self {
        let sweeps = (0..declared_sweeps)
            .map(|s| {
                (0..num_rays)
                    .map(|r| SyntheticRay {
                        az: (r * 65536 / num_rays.max(1)) as u16,
                        tilt: (s as u16 + 1) * 0x100,
                        seconds: r as u16,
                        samples: (0..types.len())
                            .map(|t| (0..num_bins).map(|b| sample(s, r, t, b).into()).collect())
                            .collect(),
                        terminated: true,
                    })
                    .collect()
            })
            .collect();
        Self {
            declared_sweeps,
            num_rays,
            num_bins,
            types,
            sweeps,
            pad_words: 0,
            end_marker: true,
            prf: 1000,
            wave_len: 533,
            big_endian: false,
            garbled_sweep: None,
        }
    }

    fn mask(&self) -> u32 {
        self.types.iter().fold(0, |m, t| m | (1 << t.mask_bit()))
    }

    fn header_records(&self) -> (Vec<u8>, Vec<u8>) {
        let big = self.big_endian;
        let mut r1 = vec![0u8; RECORD_LEN];
        put_u16(&mut r1, 0, 27, big);
        put_text(&mut r1, 74, "SYNTH");
        put_text(&mut r1, PRODUCT_END, "TESTSITE");
        put_i32(&mut r1, PRODUCT_END + 164, self.num_bins as i32, big);

        let mut r2 = vec![0u8; RECORD_LEN];
        put_u16(&mut r2, 0, 23, big);
        let ic = INGEST_CONFIG;
        put_u16(&mut r2, ic + 82, self.declared_sweeps as u16, big);
        put_i32(&mut r2, ic + 88, 43_200, big);
        put_u16(&mut r2, ic + 94, 2024, big);
        put_u16(&mut r2, ic + 96, 5, big);
        put_u16(&mut r2, ic + 98, 17, big);
        put_u16(&mut r2, ic + 184, self.num_rays as u16, big);

        let tc = TASK_CONFIG;
        put_i32(&mut r2, tc + 132 + 4, self.mask() as i32, big);
        put_i32(&mut r2, tc + 132 + 136, self.prf, big);
        put_i32(&mut r2, tc + 772, 100_000, big);
        put_i32(&mut r2, tc + 772 + 16, 25_000, big);
        put_u16(&mut r2, tc + 932, 4, big);
        put_u16(&mut r2, tc + 932 + 6, self.declared_sweeps as u16, big);
        put_i32(&mut r2, tc + 1252, self.wave_len, big);
        (r1, r2)
    }

    /// Token stream for one sweep
    fn sweep_words(&self, rays: &[SyntheticRay]) -> Vec<u16> {
        let mut words = vec![0u16; self.pad_words];
        for ray in rays {
            for (row, t) in ray.samples.iter().zip(&self.types) {
                let mut run = vec![ray.az, ray.tilt, ray.az.wrapping_add(180), ray.tilt];
                run.push(row.len() as u16);
                run.push(ray.seconds);
                match t.width() {
                    StorageWidth::Two => run.extend(row),
                    StorageWidth::One => run.extend(row.chunks(2).map(|p| {
                        (p[0] & 0xFF) | ((p.get(1).copied().unwrap_or(0) & 0xFF) << 8)
                    })),
                }
                words.push(0x8000 | run.len() as u16);
                words.extend(run);
                if ray.terminated {
                    words.push(1);
                }
            }
        }
        words
    }

    /// Physical records, headers included, numbered consecutively
    pub fn records(&self) -> Vec<Vec<u8>> {
        let big = self.big_endian;
        let (r1, r2) = self.header_records();
        let mut records = vec![r1, r2];
        let mut seq: i16 = 2;
        let data_offset = BHDR_LEN + self.types.len() * INGEST_DATA_HDR_LEN;

        for (s, rays) in self.sweeps.iter().enumerate() {
            let words = self.sweep_words(rays);
            let mut pos = 0;
            let mut first = true;
            while first || pos < words.len() {
                let mut rec = vec![0u8; RECORD_LEN];
                put_u16(&mut rec, 0, seq as u16, big);
                put_u16(&mut rec, 2, s as u16 + 1, big);
                let mut off = BHDR_LEN;
                if first {
                    put_i32(&mut rec, 24, 43_200 + 60 * s as i32, big);
                    if self.garbled_sweep != Some(s) {
                        put_u16(&mut rec, 30, 2024, big);
                        put_u16(&mut rec, 32, 5, big);
                        put_u16(&mut rec, 34, 17, big);
                    }
                    put_u16(&mut rec, 36, s as u16 + 1, big);
                    put_u16(&mut rec, 46, (s as u16 + 1) * 0x100, big);
                    off = data_offset;
                    first = false;
                }
                while off + 2 <= RECORD_LEN && pos < words.len() {
                    put_u16(&mut rec, off, words[pos], big);
                    off += 2;
                    pos += 1;
                }
                records.push(rec);
                seq += 1;
            }
        }

        if self.end_marker {
            let mut rec = vec![0u8; RECORD_LEN];
            put_u16(&mut rec, 0, seq as u16, big);
            put_u16(&mut rec, 2, self.sweeps.len() as u16 + 1, big);
            records.push(rec);
        }
        records
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.records().concat()
    }

    /// Write the volume to `dir/name`
    pub fn write_to(&self, dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, self.to_bytes()).unwrap();
        path
    }
}

/// Raw one-byte reflectivity for `dbz`
pub fn dbz_raw(dbz: f32) -> u8 {
    (dbz * 2.0 + 64.0) as u8
}

/// Extended header payload carrying a ray time of `ms` milliseconds after
/// the sweep start, as the two words a reader sees in file order
pub fn xhdr_words(ms: u32, big_endian: bool) -> Vec<u16> {
    let (hi, lo) = ((ms >> 16) as u16, ms as u16);
    if big_endian {
        vec![hi, lo]
    } else {
        vec![lo, hi]
    }
}
