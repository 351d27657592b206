//! Compact binary encoding for histogram points.
//!
//! A payload is a two-byte header holding the byte width of the bin axis and
//! the sample axis, followed by one fixed-size record per point:
//!
//! ```text
//! [bin width][sample width] ( bin:LE[bin width] sample:LE[sample width] value:f32 LE )*
//! ```
//!
//! Widths are picked from the declared axis maxima, so the decoder needs no
//! outside knowledge. The payload is stored as standard base64 text so it can
//! sit in a string field of a record.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::{Error, Result};
use crate::types::{Histogram, HistogramMetadata, HistogramPoint};

const HEADER_LEN: usize = 2;
const VALUE_LEN: usize = std::mem::size_of::<f32>();

/// Number of bytes used to store indices bounded by `max`.
///
/// # Example
///
/// ```
/// use hids_stream::histogram::byte_width;
///
/// assert_eq!(byte_width(0), 0);
/// assert_eq!(byte_width(254), 1);
/// assert_eq!(byte_width(65534), 2);
/// assert_eq!(byte_width(100_000), 4);
/// ```
pub fn byte_width(max: u32) -> u8 {
    if max == 0 {
        0
    } else if max < u8::MAX as u32 {
        1
    } else if max < u16::MAX as u32 {
        2
    } else {
        4
    }
}

/// Encode `points` into the raw binary layout.
pub fn encode_bytes(max_bin: u32, max_sample: u32, points: &[HistogramPoint]) -> Vec<u8> {
    let bin_width = byte_width(max_bin);
    let sample_width = byte_width(max_sample);
    let record_len = bin_width as usize + sample_width as usize + VALUE_LEN;

    let mut out = Vec::with_capacity(HEADER_LEN + points.len() * record_len);
    out.push(bin_width);
    out.push(sample_width);

    for point in points {
        write_index(&mut out, point.bin, bin_width);
        write_index(&mut out, point.sample, sample_width);
        out.extend_from_slice(&point.value.to_le_bytes());
    }

    out
}

/// Encode `points` as base64 text.
pub fn encode(max_bin: u32, max_sample: u32, points: &[HistogramPoint]) -> String {
    STANDARD.encode(encode_bytes(max_bin, max_sample, points))
}

/// Decode the raw binary layout.
///
/// Bytes left over after the last complete record are ignored.
pub fn decode_bytes(bytes: &[u8]) -> Result<Vec<HistogramPoint>> {
    let [bin_width, sample_width] = match bytes.get(..HEADER_LEN) {
        Some(&[b, s]) => [b, s],
        _ => {
            return Err(Error::malformed(format!(
                "expected {} header bytes, got {}",
                HEADER_LEN,
                bytes.len()
            )));
        }
    };
    check_width("bin", bin_width)?;
    check_width("sample", sample_width)?;

    let bin_width = bin_width as usize;
    let sample_width = sample_width as usize;
    let record_len = bin_width + sample_width + VALUE_LEN;

    let points = bytes[HEADER_LEN..]
        .chunks_exact(record_len)
        .map(|record| {
            let (bin, rest) = record.split_at(bin_width);
            let (sample, value) = rest.split_at(sample_width);
            HistogramPoint {
                bin: read_index(bin),
                sample: read_index(sample),
                value: f32::from_le_bytes([value[0], value[1], value[2], value[3]]),
            }
        })
        .collect();

    Ok(points)
}

/// Decode base64 text produced by [`encode`].
pub fn decode(text: &str) -> Result<Vec<HistogramPoint>> {
    let bytes = STANDARD
        .decode(text)
        .map_err(|e| Error::malformed(format!("invalid base64: {}", e)))?;
    decode_bytes(&bytes)
}

fn write_index(out: &mut Vec<u8>, index: u32, width: u8) {
    let bytes = index.to_le_bytes();
    out.extend_from_slice(&bytes[..width as usize]);
}

fn read_index(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf[..bytes.len()].copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}

fn check_width(axis: &str, width: u8) -> Result<()> {
    match width {
        0 | 1 | 2 | 4 => Ok(()),
        other => Err(Error::malformed(format!(
            "invalid {} width {}",
            axis, other
        ))),
    }
}

/// The four encoded point sets of a stored histogram record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistogramFields {
    pub cyclic: String,
    pub residual: String,
    pub frequency: String,
    pub rms: String,
}

impl HistogramFields {
    /// Encode every point set of `histogram`.
    ///
    /// Cyclic and residual histograms are indexed by sample within a cycle;
    /// frequency and RMS histograms have no sample axis.
    pub fn encode(histogram: &Histogram) -> Self {
        let info = &histogram.info;
        let samples = info.samples_per_cycle();

        Self {
            cyclic: encode(axis_max(info.cyclic_histogram_bins), samples, &histogram.cyclic),
            residual: encode(
                axis_max(info.residual_histogram_bins),
                samples,
                &histogram.residual,
            ),
            frequency: encode(
                axis_max(info.frequency_histogram_bins),
                0,
                &histogram.frequency,
            ),
            rms: encode(axis_max(info.rms_histogram_bins), 0, &histogram.rms),
        }
    }

    /// Rebuild a histogram from its metadata and encoded fields.
    pub fn decode(&self, info: HistogramMetadata) -> Result<Histogram> {
        Ok(Histogram {
            info,
            cyclic: decode_field(&self.cyclic)?,
            residual: decode_field(&self.residual)?,
            frequency: decode_field(&self.frequency)?,
            rms: decode_field(&self.rms)?,
        })
    }
}

fn axis_max(bins: i32) -> u32 {
    bins.max(0) as u32
}

// Absent fields come back as empty strings.
fn decode_field(text: &str) -> Result<Vec<HistogramPoint>> {
    if text.is_empty() {
        return Ok(Vec::new());
    }
    decode(text)
}
