//! Domain values carried by query result streams.
//!
//! Every value that travels through a [`PullBridge`](crate::PullBridge) and
//! out of a [`PointStream`](crate::PointStream) is one of the
//! [`DomainValue`] variants. A single stream only ever carries one kind.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// An aggregated measurement for one tag over one interval.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Point {
    /// Identifier of the measured signal.
    pub tag: Option<String>,
    /// Start of the interval. The source's time zone is not known on read.
    pub timestamp: NaiveDateTime,
    /// Bitmask describing validity of the measurement.
    pub quality_flags: u32,
    /// Smallest observed value.
    pub minimum: f64,
    /// Largest observed value.
    pub maximum: f64,
    /// Mean of the observed values.
    pub average: f64,
}

/// Number of stored points for one tag in one window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PointCount {
    /// Identifier of the counted signal.
    pub tag: Option<String>,
    /// Start of the counted window.
    pub timestamp: NaiveDateTime,
    /// Number of points.
    pub count: u64,
}

/// Descriptive fields stored alongside a histogram.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HistogramMetadata {
    /// Identifier of the measured signal.
    pub tag: Option<String>,
    /// Nominal fundamental frequency in Hz.
    pub fundamental_frequency: i32,
    /// Samples per second of the capture.
    pub sampling_rate: i32,
    /// First sample covered by the histogram.
    pub start_time: NaiveDateTime,
    /// Last sample covered by the histogram.
    pub end_time: NaiveDateTime,
    /// Number of cycles folded into the histogram.
    pub total_captured_cycles: i32,
    /// Upper bound of the cyclic amplitude axis.
    pub cycles_max: f64,
    /// Lower bound of the cyclic amplitude axis.
    pub cycles_min: f64,
    /// Upper bound of the residual amplitude axis.
    pub residual_max: f64,
    /// Lower bound of the residual amplitude axis.
    pub residual_min: f64,
    /// Upper bound of the frequency axis.
    pub frequency_max: f64,
    /// Lower bound of the frequency axis.
    pub frequency_min: f64,
    /// Upper bound of the RMS axis.
    #[serde(rename = "RMSMax")]
    pub rms_max: f64,
    /// Lower bound of the RMS axis.
    #[serde(rename = "RMSMin")]
    pub rms_min: f64,
    /// Bin count of the cyclic histogram.
    pub cyclic_histogram_bins: i32,
    /// Bin count of the residual histogram.
    pub residual_histogram_bins: i32,
    /// Bin count of the frequency histogram.
    pub frequency_histogram_bins: i32,
    /// Bin count of the RMS histogram.
    #[serde(rename = "RMSHistogramBins")]
    pub rms_histogram_bins: i32,
}

impl HistogramMetadata {
    /// Samples per cycle, used as the sample-axis maximum of the cyclic and
    /// residual histograms. Zero when the fundamental frequency is unknown.
    pub fn samples_per_cycle(&self) -> u32 {
        self.sampling_rate
            .checked_div(self.fundamental_frequency)
            .map_or(0, |n| n.max(0) as u32)
    }
}

/// One cell of a histogram.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HistogramPoint {
    /// Index on the amplitude axis.
    pub bin: u32,
    /// Index on the cycle-sample axis.
    pub sample: u32,
    /// Cell value.
    pub value: f32,
}

impl HistogramPoint {
    /// Create a cell at (`bin`, `sample`).
    ///
    /// ```
    /// use hids_stream::HistogramPoint;
    ///
    /// let cell = HistogramPoint::new(3, 7, 0.25);
    /// assert_eq!((cell.bin, cell.sample, cell.value), (3, 7, 0.25));
    /// ```
    pub fn new(bin: u32, sample: u32, value: f32) -> Self {
        Self { bin, sample, value }
    }
}

/// A complete histogram record: metadata plus the four point sets.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Histogram {
    /// Descriptive fields, including the axis maxima used for encoding.
    pub info: HistogramMetadata,
    /// Cells of the cyclic histogram.
    pub cyclic: Vec<HistogramPoint>,
    /// Cells of the residual histogram.
    pub residual: Vec<HistogramPoint>,
    /// Cells of the frequency histogram.
    pub frequency: Vec<HistogramPoint>,
    /// Cells of the RMS histogram.
    pub rms: Vec<HistogramPoint>,
}

/// A single value produced by a query.
///
/// Serializes as the inner value itself, without a variant tag, so each
/// rendered line has exactly the fields of the active variant.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DomainValue {
    /// Aggregated measurement.
    Point(Point),
    /// Point count for a window.
    PointCount(PointCount),
    /// Histogram descriptive fields.
    HistogramMetadata(HistogramMetadata),
    /// Decoded histogram cells.
    HistogramPoints(Vec<HistogramPoint>),
}

impl DomainValue {
    /// Returns the tag of the value, if the variant carries one.
    pub fn tag(&self) -> Option<&str> {
        match self {
            DomainValue::Point(p) => p.tag.as_deref(),
            DomainValue::PointCount(c) => c.tag.as_deref(),
            DomainValue::HistogramMetadata(m) => m.tag.as_deref(),
            DomainValue::HistogramPoints(_) => None,
        }
    }

    /// Returns the inner point if this is a `Point` variant.
    pub fn as_point(&self) -> Option<&Point> {
        match self {
            DomainValue::Point(p) => Some(p),
            _ => None,
        }
    }

    /// Returns the inner count if this is a `PointCount` variant.
    pub fn as_point_count(&self) -> Option<&PointCount> {
        match self {
            DomainValue::PointCount(c) => Some(c),
            _ => None,
        }
    }
}

impl From<Point> for DomainValue {
    fn from(p: Point) -> Self {
        DomainValue::Point(p)
    }
}

impl From<PointCount> for DomainValue {
    fn from(c: PointCount) -> Self {
        DomainValue::PointCount(c)
    }
}

impl From<HistogramMetadata> for DomainValue {
    fn from(m: HistogramMetadata) -> Self {
        DomainValue::HistogramMetadata(m)
    }
}

impl From<Vec<HistogramPoint>> for DomainValue {
    fn from(points: Vec<HistogramPoint>) -> Self {
        DomainValue::HistogramPoints(points)
    }
}
