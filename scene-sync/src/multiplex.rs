//! Arrival-order merge of independent event streams.
//!
//! `Multiplexed` races its sources: each poll yields whichever source has
//! an item ready, exhausted sources drop out of the race, and the merged
//! stream ends only when every source has ended. Polling starts one past
//! the source that produced the previous item, so a busy source cannot
//! starve a quieter one.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::stream::{BoxStream, Stream, StreamExt};

/// Merged view over N boxed streams.
pub struct Multiplexed<T> {
    sources: Vec<BoxStream<'static, T>>,
    next: usize,
}

/// Merge `sources` into one stream.
pub fn multiplex<T>(sources: Vec<BoxStream<'static, T>>) -> Multiplexed<T> {
    Multiplexed { sources, next: 0 }
}

impl<T> Default for Multiplexed<T> {
    fn default() -> Self {
        multiplex(Vec::new())
    }
}

impl<T> Multiplexed<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add another source to the race.
    pub fn push<S>(&mut self, source: S)
    where
        S: Stream<Item = T> + Send + 'static,
    {
        self.sources.push(source.boxed());
    }

    /// Number of sources that have not ended yet.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl<T> Stream for Multiplexed<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = &mut *self;
        let mut index = this.next;
        let mut remaining = this.sources.len();

        while remaining > 0 {
            if index >= this.sources.len() {
                index = 0;
            }
            match this.sources[index].poll_next_unpin(cx) {
                Poll::Ready(Some(item)) => {
                    this.next = index + 1;
                    return Poll::Ready(Some(item));
                }
                // Exhausted: the next source slides into `index`.
                Poll::Ready(None) => {
                    drop(this.sources.remove(index));
                }
                Poll::Pending => index += 1,
            }
            remaining -= 1;
        }

        if this.sources.is_empty() {
            Poll::Ready(None)
        } else {
            Poll::Pending
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.sources.iter().fold((0, Some(0)), |(low, high), source| {
            let (source_low, source_high) = source.size_hint();
            let high = match (high, source_high) {
                (Some(a), Some(b)) => a.checked_add(b),
                _ => None,
            };
            (low.saturating_add(source_low), high)
        })
    }
}
