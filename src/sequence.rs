//! The pull contract consumed by [`PointStream`](crate::PointStream).

use std::future::Future;

use futures::{Stream, StreamExt};

use crate::error::{Error, Result};

/// A cancellable sequence that hands out one value per request.
///
/// Returns:
/// - `Ok(Some(value))` - The next value, in producer order
/// - `Ok(None)` - End of sequence; repeated on every later call
/// - `Err(e)` - The pending request failed
pub trait PullSequence: Send {
    /// Value type handed out by the sequence.
    type Item: Send;

    /// Wait for the next value.
    fn next(&mut self) -> impl Future<Output = Result<Option<Self::Item>>> + Send;

    /// Stop the sequence and release whatever it holds. Idempotent.
    fn close(&mut self);
}

/// Adapts any fallible [`Stream`] to [`PullSequence`].
///
/// Useful for feeding a [`PointStream`](crate::PointStream) from a source that
/// is already pull-based.
///
/// # Example
///
/// ```
/// use futures::stream;
/// use hids_stream::{Error, PullSequence, StreamSequence};
///
/// # futures::executor::block_on(async {
/// let items = vec![Ok::<_, Error>(1), Ok(2)];
/// let mut seq = StreamSequence::new(stream::iter(items));
/// assert_eq!(seq.next().await.unwrap(), Some(1));
/// assert_eq!(seq.next().await.unwrap(), Some(2));
/// assert_eq!(seq.next().await.unwrap(), None);
/// # });
/// ```
pub struct StreamSequence<St> {
    inner: Option<St>,
    closed: bool,
}

impl<St> StreamSequence<St> {
    pub fn new(stream: St) -> Self {
        Self {
            inner: Some(stream),
            closed: false,
        }
    }
}

impl<St, T> PullSequence for StreamSequence<St>
where
    St: Stream<Item = Result<T>> + Send + Unpin,
    T: Send,
{
    type Item = T;

    async fn next(&mut self) -> Result<Option<T>> {
        if self.closed {
            return Err(Error::Cancelled);
        }
        let Some(stream) = self.inner.as_mut() else {
            return Ok(None);
        };

        match stream.next().await {
            Some(Ok(value)) => Ok(Some(value)),
            Some(Err(e)) => {
                self.inner = None;
                Err(e)
            }
            None => {
                self.inner = None;
                Ok(None)
            }
        }
    }

    fn close(&mut self) {
        self.inner = None;
        self.closed = true;
    }
}
