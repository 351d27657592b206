//! Byte stream over a sequence of query results.
//!
//! [`PointStream`] renders every value of a [`PullSequence`] as one line of
//! compact JSON and hands the text out through [`PointStream::read`] in
//! whatever buffer sizes the caller picks. Nothing beyond the current line is
//! held in memory.

use std::future::Future;
use std::pin::Pin;

use async_stream::stream;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{FutureExt, Stream};
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::sync::OnceCell;
use tokio_util::io::StreamReader;
use tracing::{debug, trace};

use crate::bridge::{Producer, PullBridge};
use crate::error::{Error, Result};
use crate::sequence::PullSequence;

/// Chunk size used by [`PointStream::into_async_read`].
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// Longest UTF-8 encoding of a single character.
const MAX_CHAR_LEN: usize = 4;

/// Deferred constructor for the sequence behind a [`PointStream`].
pub type SequenceFactory<S> = Box<dyn FnOnce() -> BoxFuture<'static, Result<S>> + Send>;

/// A read-only, forward-only byte stream of JSON lines.
///
/// # Example
///
/// ```ignore
/// use hids_stream::PointStream;
///
/// let mut stream = PointStream::from_producer(producer);
/// let mut buf = [0u8; 4096];
/// loop {
///     let n = stream.read(&mut buf).await?;
///     if n == 0 {
///         break;
///     }
///     sink.write_all(&buf[..n]).await?;
/// }
/// ```
pub struct PointStream<S: PullSequence> {
    factory: Option<SequenceFactory<S>>,
    sequence: OnceCell<S>,
    /// Current rendered line.
    pending: String,
    /// Bytes of `pending` already handed out. Always on a char boundary.
    offset: usize,
    position: u64,
    complete: bool,
    closed: bool,
    /// Failure hit after bytes were already produced by the same read.
    deferred: Option<Error>,
}

impl<S> PointStream<S>
where
    S: PullSequence + 'static,
    S::Item: Serialize,
{
    /// Create a stream whose sequence is built by `factory` on the first
    /// read.
    pub fn new<F, Fut>(factory: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<S>> + Send + 'static,
    {
        let boxed: SequenceFactory<S> = Box::new(move || factory().boxed());
        Self::with_parts(Some(boxed), OnceCell::new())
    }

    /// Create a stream over an existing sequence.
    pub fn from_sequence(sequence: S) -> Self {
        Self::with_parts(None, OnceCell::new_with(Some(sequence)))
    }

    fn with_parts(factory: Option<SequenceFactory<S>>, sequence: OnceCell<S>) -> Self {
        Self {
            factory,
            sequence,
            pending: String::new(),
            offset: 0,
            position: 0,
            complete: false,
            closed: false,
            deferred: None,
        }
    }

    /// Read the next bytes of the stream into `buf`.
    ///
    /// Only whole characters are written. A character that does not fit in
    /// the rest of `buf` is kept for the next call.
    ///
    /// A sequence failure is raised exactly once. When the same call already
    /// wrote bytes, those bytes are returned first and the failure is raised
    /// by the next call instead.
    ///
    /// Returns:
    /// - `Ok(n)` with `n > 0` - `n` bytes were written to `buf`
    /// - `Ok(0)` - End of stream
    /// - `Err(Error::BufferTooSmall { .. })` - `buf` cannot hold the next character
    /// - `Err(e)` - The sequence failed; the stream is finished afterwards
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if let Some(err) = self.deferred.take() {
            return Err(err);
        }
        if self.complete {
            return Ok(0);
        }

        let mut written = 0;

        loop {
            if self.offset >= self.pending.len() {
                match self.pull().await {
                    Ok(Some(line)) => {
                        self.pending = line;
                        self.offset = 0;
                    }
                    Ok(None) => {
                        self.complete = true;
                        debug!(position = self.position + written as u64, "Point stream finished");
                        break;
                    }
                    Err(e) => {
                        self.complete = true;
                        if written == 0 {
                            return Err(e);
                        }
                        // Hand out what this call produced; fail the next one.
                        self.deferred = Some(e);
                        break;
                    }
                }
            }

            written += self.copy_chars(&mut buf[written..]);

            if self.offset < self.pending.len() {
                if written == 0 {
                    return Err(Error::BufferTooSmall {
                        needed: self.next_char_len(),
                        available: buf.len(),
                    });
                }
                break;
            }
            if written == buf.len() {
                break;
            }
        }

        self.position += written as u64;
        trace!(bytes = written, position = self.position, "Read from point stream");
        Ok(written)
    }

    async fn pull(&mut self) -> Result<Option<String>> {
        let sequence = self.sequence_mut().await?;
        let Some(value) = sequence.next().await? else {
            return Ok(None);
        };

        let mut line = serde_json::to_string(&value)?;
        line.push('\n');
        Ok(Some(line))
    }

    async fn sequence_mut(&mut self) -> Result<&mut S> {
        if !self.sequence.initialized() {
            let factory = self.factory.take().ok_or(Error::Cancelled)?;
            debug!("Creating point stream sequence");
            let sequence = factory().await?;
            // Only fails when already set, which `&mut self` rules out.
            let _ = self.sequence.set(sequence);
        }
        self.sequence.get_mut().ok_or(Error::Cancelled)
    }

    /// Copy as many whole characters of the pending line as fit into `dst`.
    fn copy_chars(&mut self, dst: &mut [u8]) -> usize {
        let remaining = &self.pending[self.offset..];
        let mut end = remaining.len().min(dst.len());
        while !remaining.is_char_boundary(end) {
            end -= 1;
        }

        dst[..end].copy_from_slice(&remaining.as_bytes()[..end]);
        self.offset += end;
        end
    }

    fn next_char_len(&self) -> usize {
        self.pending[self.offset..]
            .chars()
            .next()
            .map_or(1, char::len_utf8)
    }

    /// Convert into a [`tokio::io::AsyncRead`] reading chunks of
    /// [`DEFAULT_CHUNK_SIZE`] bytes.
    pub fn into_async_read(self) -> impl AsyncRead + Send + Unpin {
        self.into_async_read_with_capacity(DEFAULT_CHUNK_SIZE)
    }

    /// Convert into a [`tokio::io::AsyncRead`] reading chunks of up to
    /// `capacity` bytes. Capacities below 4 bytes are raised to 4 so every
    /// character fits.
    pub fn into_async_read_with_capacity(self, capacity: usize) -> impl AsyncRead + Send + Unpin {
        let mut source = self;
        let mut buf = vec![0u8; capacity.max(MAX_CHAR_LEN)];

        let chunks = stream! {
            loop {
                match source.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => yield Ok(Bytes::copy_from_slice(&buf[..n])),
                    Err(e) => {
                        yield Err(std::io::Error::from(e));
                        break;
                    }
                }
            }
        };

        let chunks: Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>> = Box::pin(chunks);
        StreamReader::new(chunks)
    }
}

impl<T> PointStream<PullBridge<T>>
where
    T: Serialize + Send + 'static,
{
    /// Create a stream over a callback-driven producer. The producer starts
    /// on the first read.
    pub fn from_producer(producer: impl Producer<T>) -> Self {
        Self::from_sequence(PullBridge::new(producer))
    }
}

impl<S: PullSequence> PointStream<S> {
    /// Number of bytes handed out so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Returns true once the stream has ended, failed or been closed.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Close the stream and release the underlying sequence. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.complete = true;
        self.factory = None;
        self.deferred = None;
        self.pending = String::new();
        self.offset = 0;

        if let Some(sequence) = self.sequence.get_mut() {
            sequence.close();
        }
        debug!(position = self.position, "Point stream closed");
    }
}

impl<S: PullSequence> Drop for PointStream<S> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::StreamSequence;
    use crate::types::{DomainValue, Point, PointCount};
    use chrono::{NaiveDate, NaiveDateTime};
    use futures::stream;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ts(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 11, 14)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn point(tag: &str, hour: u32) -> DomainValue {
        DomainValue::Point(Point {
            tag: Some(tag.to_string()),
            timestamp: ts(hour),
            quality_flags: 0,
            minimum: 1.0,
            maximum: 10.0,
            average: 5.5,
        })
    }

    fn values() -> Vec<DomainValue> {
        vec![point("PPA:1", 0), point("温度✓😀", 1), point("é", 2)]
    }

    fn expected_text(values: &[DomainValue]) -> String {
        values
            .iter()
            .map(|v| serde_json::to_string(v).unwrap() + "\n")
            .collect()
    }

    /// Serves values from memory and counts `close` calls.
    struct MemorySequence {
        items: VecDeque<Result<DomainValue>>,
        closes: Arc<AtomicUsize>,
    }

    impl MemorySequence {
        fn new(items: Vec<Result<DomainValue>>, closes: &Arc<AtomicUsize>) -> Self {
            Self {
                items: items.into(),
                closes: closes.clone(),
            }
        }
    }

    impl PullSequence for MemorySequence {
        type Item = DomainValue;

        async fn next(&mut self) -> Result<Option<DomainValue>> {
            self.items.pop_front().transpose()
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn memory_stream(values: Vec<DomainValue>) -> PointStream<MemorySequence> {
        let closes = Arc::new(AtomicUsize::new(0));
        PointStream::from_sequence(MemorySequence::new(
            values.into_iter().map(Ok).collect(),
            &closes,
        ))
    }

    async fn read_all_with<S>(stream: &mut PointStream<S>, sizes: &[usize]) -> Vec<u8>
    where
        S: PullSequence + 'static,
        S::Item: Serialize,
    {
        let mut out = Vec::new();
        for &size in sizes.iter().cycle() {
            let mut buf = vec![0u8; size];
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    // =========================================================================
    // Whole output
    // =========================================================================

    #[tokio::test]
    async fn test_single_large_read() {
        let mut stream = memory_stream(values());
        let mut buf = vec![0u8; 64 * 1024];

        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(std::str::from_utf8(&buf[..n]).unwrap(), expected_text(&values()));
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        assert_eq!(stream.position(), n as u64);
    }

    #[tokio::test]
    async fn test_mixed_buffer_sizes_match_single_read() {
        let expected = expected_text(&values()).into_bytes();

        let cases: [&[usize]; 4] = [&[4], &[4, 7, 4096], &[5], &[4096, 4, 9, 13]];
        for sizes in cases {
            let mut stream = memory_stream(values());
            assert_eq!(read_all_with(&mut stream, sizes).await, expected, "sizes {:?}", sizes);
        }
    }

    #[tokio::test]
    async fn test_ascii_only_one_byte_reads() {
        let v = vec![DomainValue::PointCount(PointCount {
            tag: Some("abc".to_string()),
            timestamp: ts(3),
            count: 9,
        })];
        let mut stream = memory_stream(v.clone());
        let out = read_all_with(&mut stream, &[1, 3, 7]).await;
        assert_eq!(out, expected_text(&v).into_bytes());
    }

    #[tokio::test]
    async fn test_empty_sequence() {
        let mut stream = memory_stream(vec![]);
        let mut buf = [0u8; 16];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        assert!(stream.is_complete());
    }

    // =========================================================================
    // Character boundaries
    // =========================================================================

    #[tokio::test]
    async fn test_multibyte_char_deferred_to_next_read() {
        // `{"Tag":"` is 8 bytes, then a 2-byte character.
        let mut stream = memory_stream(vec![point("é", 0)]);

        let mut buf = [0u8; 9];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 8);
        assert_eq!(&buf[..8], br#"{"Tag":""#);

        let mut small = [0u8; 1];
        match stream.read(&mut small).await {
            Err(Error::BufferTooSmall { needed, available }) => {
                assert_eq!(needed, 2);
                assert_eq!(available, 1);
            }
            other => panic!("expected BufferTooSmall, got {:?}", other),
        }
        assert_eq!(stream.position(), 8);

        let mut two = [0u8; 2];
        assert_eq!(stream.read(&mut two).await.unwrap(), 2);
        assert_eq!(std::str::from_utf8(&two).unwrap(), "é");
    }

    #[tokio::test]
    async fn test_four_byte_char() {
        let mut stream = memory_stream(vec![point("😀", 0)]);
        let mut head = [0u8; 8];
        assert_eq!(stream.read(&mut head).await.unwrap(), 8);

        let mut three = [0u8; 3];
        assert!(matches!(
            stream.read(&mut three).await,
            Err(Error::BufferTooSmall { needed: 4, available: 3 })
        ));

        let mut four = [0u8; 4];
        assert_eq!(stream.read(&mut four).await.unwrap(), 4);
        assert_eq!(std::str::from_utf8(&four).unwrap(), "😀");
    }

    #[tokio::test]
    async fn test_random_sizes_never_fail_from_four_bytes() {
        use rand::Rng;

        let expected = expected_text(&values()).into_bytes();
        let mut rng = rand::thread_rng();

        for _ in 0..50 {
            let sizes: Vec<usize> = (0..8).map(|_| rng.gen_range(4..64)).collect();
            let mut stream = memory_stream(values());
            assert_eq!(read_all_with(&mut stream, &sizes).await, expected);
        }
    }

    // =========================================================================
    // Errors
    // =========================================================================

    #[tokio::test]
    async fn test_error_on_first_read() {
        let items: Vec<Result<DomainValue>> = vec![Err(Error::upstream("no such bucket"))];
        let mut stream = PointStream::from_sequence(StreamSequence::new(stream::iter(items)));
        let mut buf = [0u8; 64];

        assert!(matches!(stream.read(&mut buf).await, Err(Error::Upstream(_))));
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_error_after_bytes_is_deferred() {
        let closes = Arc::new(AtomicUsize::new(0));
        let items = vec![Ok(point("a", 0)), Err(Error::upstream("lost connection"))];
        let mut stream = PointStream::from_sequence(MemorySequence::new(items, &closes));
        let mut buf = vec![0u8; 4096];

        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], expected_text(&[point("a", 0)]).as_bytes());

        assert!(matches!(stream.read(&mut buf).await, Err(Error::Upstream(_))));
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        assert_eq!(stream.position(), n as u64);
    }

    #[tokio::test]
    async fn test_error_raised_exactly_once() {
        let expected = expected_text(&values()).into_bytes();

        for size in [4usize, 7, 64, 4096] {
            let closes = Arc::new(AtomicUsize::new(0));
            let mut items: Vec<Result<DomainValue>> = values().into_iter().map(Ok).collect();
            items.push(Err(Error::upstream("lost connection")));
            let mut stream = PointStream::from_sequence(MemorySequence::new(items, &closes));

            let mut out = Vec::new();
            let mut errors = 0;
            let mut buf = vec![0u8; size];
            for _ in 0..10_000 {
                match stream.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => out.extend_from_slice(&buf[..n]),
                    Err(Error::Upstream(_)) => errors += 1,
                    Err(other) => panic!("unexpected error {:?}", other),
                }
            }

            assert_eq!(errors, 1, "buffer size {}", size);
            assert_eq!(out, expected, "buffer size {}", size);
            assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_read_future_is_send_for_send_only_sequence() {
        fn assert_send<F: Send>(_: &F) {}

        /// `Send` but not `Sync`.
        struct CellSequence(std::cell::Cell<u32>);

        impl PullSequence for CellSequence {
            type Item = u32;

            async fn next(&mut self) -> Result<Option<u32>> {
                let n = self.0.get();
                self.0.set(n + 1);
                Ok((n < 3).then_some(n))
            }

            fn close(&mut self) {}
        }

        let mut stream = PointStream::new(|| async { Ok(CellSequence(std::cell::Cell::new(0))) });
        let mut buf = [0u8; 16];
        {
            let read = stream.read(&mut buf);
            assert_send(&read);
            assert_eq!(read.await.unwrap(), 6);
        }
        assert_eq!(&buf[..6], b"0\n1\n2\n");

        let mut reader = PointStream::from_sequence(CellSequence(std::cell::Cell::new(0)))
            .into_async_read();
        let mut text = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut reader, &mut text)
            .await
            .unwrap();
        assert_eq!(text, "0\n1\n2\n");
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    #[tokio::test]
    async fn test_factory_runs_once_on_first_read() {
        let created = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));

        let counter = created.clone();
        let closes_for_factory = closes.clone();
        let mut stream = PointStream::new(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(MemorySequence::new(
                values().into_iter().map(Ok).collect(),
                &closes_for_factory,
            ))
        });
        assert_eq!(created.load(Ordering::SeqCst), 0);

        let out = read_all_with(&mut stream, &[5]).await;
        assert_eq!(out, expected_text(&values()).into_bytes());
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_factory_failure() {
        let mut stream: PointStream<MemorySequence> =
            PointStream::new(|| async { Err(Error::upstream("unauthorized")) });
        let mut buf = [0u8; 16];
        assert!(matches!(stream.read(&mut buf).await, Err(Error::Upstream(_))));
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_mid_iteration_releases_once() {
        let closes = Arc::new(AtomicUsize::new(0));
        let items = values().into_iter().map(Ok).collect();
        let mut stream = PointStream::from_sequence(MemorySequence::new(items, &closes));

        let mut buf = [0u8; 10];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 10);

        stream.close();
        stream.close();
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        assert_eq!(stream.position(), 10);

        drop(stream);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_before_first_read_skips_factory() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let mut stream: PointStream<MemorySequence> = PointStream::new(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(Error::Cancelled)
        });

        stream.close();
        let mut buf = [0u8; 16];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        assert_eq!(created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_into_async_read() {
        use tokio::io::AsyncReadExt;

        let mut reader = memory_stream(values()).into_async_read_with_capacity(1);
        let mut text = String::new();
        reader.read_to_string(&mut text).await.unwrap();
        assert_eq!(text, expected_text(&values()));
    }
}
