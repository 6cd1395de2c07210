//! Volume Decoder
//!
//! Rebuilds the sweep/ray/bin arrays of a volume from the physical records
//! that follow the two header records.
//!
//! Each data record starts with a `raw_prod_bhdr` holding the record number
//! and sweep number. The rest of the record is a stream of 16-bit tokens:
//!
//! ```text
//! 0x8000 | n   n literal words follow (may continue in the next record)
//! 0x0001       end of ray for the current data type
//! n            skip n words, leaving them zero
//! ```

use std::io::{ErrorKind, Read};
use std::time::Instant;

use chrono::{Duration, NaiveDateTime};
use tracing::{debug, trace};

use super::bytes::{bin2_to_rad, ByteOrder, Cursor};
use super::data_type::{ConversionParams, DataType, StorageWidth, NO_DATA};
use super::error::{Result, VolumeError};
use super::header::{Headers, YmdsTime, RAW_PROD_BHDR_LEN, RAY_HDR_LEN, RECORD_LEN};
use super::{SweepHeader, Volume};

const RAY_HDR_WORDS: usize = RAY_HDR_LEN / 2;

/// Fill `buf` completely. `Ok(false)` on end of input, including a short
/// final record.
fn read_record<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

/// Read and decode the two header records
pub fn read_headers<R: Read>(reader: &mut R) -> Result<Headers> {
    let mut rec1 = vec![0u8; RECORD_LEN];
    let mut rec2 = vec![0u8; RECORD_LEN];
    if !read_record(reader, &mut rec1)? {
        return Err(VolumeError::MissingHeader { record: 1 });
    }
    if !read_record(reader, &mut rec2)? {
        return Err(VolumeError::MissingHeader { record: 2 });
    }
    Headers::parse(&rec1, &rec2)
}

/// Sequence-checked source of data records
struct RecordStream<R> {
    reader: R,
    buf: Vec<u8>,
    order: ByteOrder,
    /// Record number of the last record read. Headers are records 1 and 2.
    last: i32,
    deadline: Option<Instant>,
}

impl<R: Read> RecordStream<R> {
    fn new(reader: R, order: ByteOrder, deadline: Option<Instant>) -> Self {
        Self {
            reader,
            buf: vec![0u8; RECORD_LEN],
            order,
            last: 1,
            deadline,
        }
    }

    /// Load the next record. `Ok(false)` at end of input.
    fn advance(&mut self) -> Result<bool> {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(VolumeError::DeadlineExceeded);
            }
        }
        if !read_record(&mut self.reader, &mut self.buf)? {
            return Ok(false);
        }
        let found = i32::from(self.cursor().i16_at(0)?);
        let expected = self.last + 1;
        if found != expected {
            return Err(VolumeError::RecordOutOfSequence { expected, found });
        }
        self.last = found;
        Ok(true)
    }

    fn cursor(&self) -> Cursor<'_> {
        Cursor::new(&self.buf, self.order)
    }

    fn word(&self, pos: usize) -> Result<u16> {
        self.cursor().u16_at(pos)
    }
}

/// Decode state for the ray currently being assembled
struct RayAssembler {
    words: Vec<u16>,
    pos: usize,
}

impl RayAssembler {
    fn new(len_bytes: usize) -> Result<Self> {
        let n = len_bytes.div_ceil(2);
        let mut words = Vec::new();
        words
            .try_reserve_exact(n)
            .map_err(|_| VolumeError::AllocFailure { what: "ray buffer" })?;
        words.resize(n, 0);
        Ok(Self { words, pos: 0 })
    }

    fn reset(&mut self) {
        self.words.fill(0);
        self.pos = 0;
    }

    fn push(&mut self, w: u16) -> Result<()> {
        let slot = self
            .words
            .get_mut(self.pos)
            .ok_or_else(|| VolumeError::Malformed("data run overflows ray buffer".into()))?;
        *slot = w;
        self.pos += 1;
        Ok(())
    }

    fn skip(&mut self, n: usize) {
        self.pos += n;
    }

    /// Sample `b` of the data area, widened to 16 bits
    fn sample(&self, width: StorageWidth, b: usize) -> u16 {
        match width {
            StorageWidth::Two => self.words.get(RAY_HDR_WORDS + b).copied().unwrap_or(0),
            StorageWidth::One => {
                let w = self.words.get(RAY_HDR_WORDS + b / 2).copied().unwrap_or(0);
                if b % 2 == 0 {
                    w & 0xFF
                } else {
                    w >> 8
                }
            }
        }
    }
}

/// How the record stream ended
enum Ending {
    /// A sweep header announced that no sweeps follow
    Marker { observed: usize },
    /// End of input between tokens
    Eof,
    /// End of input in the middle of a data run
    EofInRun,
}

/// Decoder walking the token stream and writing into a [`Volume`]
struct Decoder {
    vol: Volume,
    params: ConversionParams,
    has_xhdr: bool,
    sweep: Option<usize>,
    sweep_time: Option<NaiveDateTime>,
    ray: usize,
    file_type: usize,
}

impl Decoder {
    fn new(headers: Headers) -> Result<Self> {
        if headers.types.is_empty() {
            return Err(VolumeError::Malformed("volume has no data types".into()));
        }
        let params = headers.conversion_params();
        let has_xhdr = headers.has_extended_headers();
        Ok(Self {
            vol: Volume::allocate(headers)?,
            params,
            has_xhdr,
            sweep: None,
            sweep_time: None,
            ray: 0,
            file_type: 0,
        })
    }

    /// Record starts a new sweep. Returns `false` if the record announces
    /// that the volume has no more sweeps.
    fn begin_sweep(&mut self, number: i16, rec: &Cursor<'_>) -> Result<bool> {
        if rec.i16_at(36)? == 0 {
            return Ok(false);
        }
        let s = usize::try_from(number)
            .ok()
            .and_then(|n| n.checked_sub(1))
            .ok_or_else(|| VolumeError::Malformed(format!("bad sweep number {}", number)))?;
        if s >= self.vol.sweeps.len() {
            return Err(VolumeError::Malformed(format!(
                "sweep {} beyond sweep count {}",
                s,
                self.vol.sweeps.len()
            )));
        }
        let time = YmdsTime::parse(&rec.sub(24))?
            .to_datetime()
            .ok_or(VolumeError::GarbledSweepTime { sweep: s })?;

        self.vol.sweeps[s] = SweepHeader {
            ok: false,
            time: Some(time),
            angle: bin2_to_rad(rec.u16_at(46)?),
        };
        self.sweep = Some(s);
        self.sweep_time = Some(time);
        self.ray = 0;
        self.file_type = 0;
        debug!(sweep = s, %time, "sweep start");
        Ok(true)
    }

    /// End-of-ray token: store the assembled data for the current type
    fn end_ray(&mut self, asm: &RayAssembler, order: ByteOrder) -> Result<()> {
        let s = self
            .sweep
            .ok_or_else(|| VolumeError::Malformed("ray data before first sweep".into()))?;
        let r = self.ray;
        let num_rays = self.vol.num_rays;
        if r >= num_rays {
            return Err(VolumeError::Malformed(format!(
                "ray {} beyond ray count {} in sweep {}",
                r, num_rays, s
            )));
        }
        let sweep_time = self.sweep_time;
        let w = &asm.words;
        let num_bins = usize::from(w[4]).min(self.vol.num_bins);
        let file_types = &self.vol.headers.file_types;
        let data_type = file_types[self.file_type];
        let last_type = self.file_type + 1 == file_types.len();

        let idx = s * num_rays + r;
        let ray = &mut self.vol.rays[idx];
        ray.az0 = bin2_to_rad(w[0]);
        ray.tilt0 = bin2_to_rad(w[1]);
        ray.az1 = bin2_to_rad(w[2]);
        ray.tilt1 = bin2_to_rad(w[3]);
        ray.num_bins = num_bins;
        if !self.has_xhdr {
            ray.time = sweep_time.map(|t| t + Duration::seconds(i64::from(w[5])));
        }

        if data_type == DataType::Xhdr {
            // Payload words were decoded in file order; rebuild the bytes
            // to read the 32-bit millisecond offset.
            let word = |i: usize| w.get(RAY_HDR_WORDS + i).copied().unwrap_or(0);
            let mut raw = [0u8; 4];
            raw[..2].copy_from_slice(&order.u16_to(word(0)));
            raw[2..].copy_from_slice(&order.u16_to(word(1)));
            let ms = order.u32_from(raw) as i32;
            ray.time = sweep_time.map(|t| t + Duration::milliseconds(i64::from(ms)));
        } else {
            let channel = self.file_type - usize::from(self.has_xhdr);
            let width = data_type.width();
            let row = self.vol.row_mut(channel, s, r);
            for (b, out) in row.iter_mut().enumerate() {
                *out = if b < num_bins {
                    data_type.convert(asm.sample(width, b), &self.params)
                } else {
                    NO_DATA
                };
            }
        }

        if last_type {
            let ray = &mut self.vol.rays[idx];
            ray.ok = ray.num_bins > 0;
            trace!(sweep = s, ray = r, bins = ray.num_bins, "ray complete");
            self.ray += 1;
            self.file_type = 0;
        } else {
            self.file_type += 1;
        }
        Ok(())
    }
}

/// Decode a complete volume from `reader`.
///
/// Early end of input marks the volume truncated instead of failing. Any
/// error discards everything decoded so far.
pub fn read_volume<R: Read>(mut reader: R, deadline: Option<Instant>) -> Result<Volume> {
    let headers = read_headers(&mut reader)?;
    let order = headers.order;
    let sweep_offset = headers.sweep_data_offset();
    let declared_sweeps = headers.num_sweeps();
    let ray_len = headers.ray_buffer_len();

    let mut dec = Decoder::new(headers)?;
    let mut asm = RayAssembler::new(ray_len)?;
    let mut records = RecordStream::new(reader, order, deadline);
    let mut sweep_number: i16 = 0;

    let ending = 'records: loop {
        if !records.advance()? {
            break Ending::Eof;
        }
        let number = records.cursor().i16_at(2)?;
        let mut pos = if number != sweep_number {
            sweep_number = number;
            if !dec.begin_sweep(number, &records.cursor())? {
                let observed = usize::try_from(number.saturating_sub(1)).unwrap_or(0);
                break Ending::Marker { observed };
            }
            asm.reset();
            sweep_offset
        } else {
            RAW_PROD_BHDR_LEN
        };

        while pos + 2 <= RECORD_LEN {
            let tok = records.word(pos)?;
            pos += 2;
            if tok & 0x8000 != 0 {
                let mut remaining = usize::from(tok & 0x7FFF);
                loop {
                    let available = (RECORD_LEN - pos) / 2;
                    let take = remaining.min(available);
                    for _ in 0..take {
                        asm.push(records.word(pos)?)?;
                        pos += 2;
                    }
                    remaining -= take;
                    if remaining == 0 {
                        break;
                    }
                    // Run continues in the next record, after its bhdr
                    if !records.advance()? {
                        break 'records Ending::EofInRun;
                    }
                    pos = RAW_PROD_BHDR_LEN;
                }
            } else if tok == 1 {
                dec.end_ray(&asm, order)?;
                asm.reset();
            } else {
                asm.skip(usize::from(tok & 0x7FFF));
            }
        }
    };

    let (sweep_count, truncated) = match ending {
        Ending::Marker { observed } => {
            let n = observed.min(declared_sweeps);
            (n, n < declared_sweeps)
        }
        // Input may end after the last declared sweep, but only once all of
        // its rays have arrived
        Ending::Eof
            if usize::try_from(sweep_number).unwrap_or(0) >= declared_sweeps
                && dec.ray >= dec.vol.num_rays =>
        {
            (declared_sweeps, false)
        }
        Ending::Eof | Ending::EofInRun => {
            let n = usize::try_from(sweep_number.saturating_sub(1)).unwrap_or(0);
            (n.min(declared_sweeps), true)
        }
    };

    let mut vol = dec.vol;
    vol.finish(sweep_count, truncated);
    debug!(
        sweeps = sweep_count,
        declared = declared_sweeps,
        truncated,
        "volume decoded"
    );
    Ok(vol)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_record_is_end_of_input() {
        let data = vec![0u8; 100];
        let mut buf = vec![0u8; RECORD_LEN];
        assert!(!read_record(&mut data.as_slice(), &mut buf).unwrap());
    }

    #[test]
    fn missing_second_header_record() {
        let mut data = vec![0u8; RECORD_LEN];
        data[0] = 27;
        match read_headers(&mut data.as_slice()) {
            Err(VolumeError::MissingHeader { record }) => assert_eq!(record, 2),
            other => panic!("expected missing header, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn empty_input_is_missing_first_header() {
        let data: Vec<u8> = Vec::new();
        assert!(matches!(
            read_volume(data.as_slice(), None),
            Err(VolumeError::MissingHeader { record: 1 })
        ));
    }

    #[test]
    fn one_byte_samples_are_low_byte_first() {
        let mut asm = RayAssembler::new(RAY_HDR_LEN + 4).unwrap();
        asm.skip(RAY_HDR_WORDS);
        asm.push(0x2211).unwrap();
        asm.push(0x4433).unwrap();
        assert_eq!(asm.sample(StorageWidth::One, 0), 0x11);
        assert_eq!(asm.sample(StorageWidth::One, 1), 0x22);
        assert_eq!(asm.sample(StorageWidth::One, 3), 0x44);
        assert_eq!(asm.sample(StorageWidth::Two, 1), 0x4433);
        assert!(asm.push(0).is_err());
    }

    #[test]
    fn expired_deadline_stops_decoding() {
        let data = vec![0u8; RECORD_LEN];
        let mut stream = RecordStream::new(data.as_slice(), ByteOrder::Little, Some(Instant::now()));
        assert!(matches!(stream.advance(), Err(VolumeError::DeadlineExceeded)));
    }
}
