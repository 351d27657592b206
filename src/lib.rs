//! # hids-stream
//!
//! Stream time-series query results to a consumer as bytes, one line of JSON
//! per value, without holding the result set in memory.
//!
//! ## Why?
//!
//! Query clients for time-series stores usually deliver results through
//! callbacks on their own thread:
//!
//! ```ignore
//! query_api.query(flux, org, on_record, on_error, on_complete);
//! ```
//!
//! That does not fit callers that want to *pull*: an HTTP response body, a
//! file copy, or anything else that reads with its own buffer size.
//! `hids-stream` bridges the two with a one-slot rendezvous, so memory stays
//! constant no matter how many rows the query returns:
//!
//! ```ignore
//! use hids_stream::PointStream;
//!
//! let mut stream = PointStream::from_producer(query_producer);
//! let mut buf = [0u8; 5];
//! loop {
//!     let n = stream.read(&mut buf).await?;
//!     if n == 0 {
//!         break;
//!     }
//!     out.write_all(&buf[..n]).await?;
//! }
//! ```
//!
//! ## Pieces
//!
//! - [`PullBridge`]: turns a callback-driven [`Producer`] into a cancellable
//!   pull sequence with at most one value in flight
//! - [`PointStream`]: renders a [`PullSequence`] as JSON lines readable in
//!   any buffer size, never splitting a UTF-8 character
//! - [`histogram`]: compact binary encoding for histogram points
//!
//! ## Features
//!
//! - **Memory efficient**: One value in flight, one line buffered
//! - **Async native**: Built on tokio and futures; also an `AsyncRead` adapter
//! - **Cancellable**: Producers are stopped and released exactly once
//! - **Error handling**: All errors are returned as Results, no panics

pub mod bridge;
pub mod error;
pub mod histogram;
pub mod sequence;
pub mod stream;
pub mod types;

// Re-export main types at crate root
pub use bridge::{CancelHandle, Delivery, Producer, PullBridge, RecordSink};
pub use error::{BoxError, Error, Result};
pub use histogram::HistogramFields;
pub use sequence::{PullSequence, StreamSequence};
pub use stream::{PointStream, SequenceFactory};
pub use types::{DomainValue, Histogram, HistogramMetadata, HistogramPoint, Point, PointCount};
