//! Latest-wins stream throttling.

use futures::{ready, Stream};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};

/// Extension trait adding rate limiting to any stream.
pub trait ThrottleExt: Stream {
    /// Emit at most one item per `period`, keeping only the newest item that
    /// arrived during the window. Suited to high-rate progress updates
    /// (replay position, timing deltas) where consumers only care about the
    /// current value.
    fn throttle_latest(self, period: Duration) -> Throttle<Self>
    where
        Self: Sized,
    {
        Throttle::new(self, period)
    }
}

impl<S: Stream> ThrottleExt for S {}

pin_project! {
    /// Stream combinator produced by [`ThrottleExt::throttle_latest`].
    pub struct Throttle<S: Stream> {
        #[pin]
        stream: S,
        ticker: Interval,
        pending: Option<S::Item>,
        upstream_done: bool,
    }
}

impl<S: Stream> Throttle<S> {
    fn new(stream: S, period: Duration) -> Self {
        let mut ticker = interval(period);
        // A stalled consumer must not be repaid with a burst.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { stream, ticker, pending: None, upstream_done: false }
    }
}

impl<S: Stream> Stream for Throttle<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        // Drain the upstream first so `pending` always holds the newest item.
        while !*this.upstream_done {
            match this.stream.as_mut().poll_next(cx) {
                Poll::Ready(Some(item)) => *this.pending = Some(item),
                Poll::Ready(None) => *this.upstream_done = true,
                Poll::Pending => break,
            }
        }

        if *this.upstream_done {
            // Flush the tail without waiting for the ticker.
            return Poll::Ready(this.pending.take());
        }

        ready!(this.ticker.poll_tick(cx));
        match this.pending.take() {
            Some(item) => Poll::Ready(Some(item)),
            None => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test(start_paused = true)]
    async fn keeps_newest_item_per_window() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<u32>();
        let mut throttled =
            tokio_stream::wrappers::UnboundedReceiverStream::new(rx)
                .throttle_latest(Duration::from_millis(250));

        for n in 1..=5 {
            tx.send(n).unwrap();
        }
        // First tick fires immediately and sees the newest of the burst.
        assert_eq!(throttled.next().await, Some(5));

        tx.send(6).unwrap();
        tx.send(7).unwrap();
        drop(tx);
        // Upstream ended: the tail flushes.
        assert_eq!(throttled.next().await, Some(7));
        assert_eq!(throttled.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_stream_ends_cleanly() {
        let mut throttled =
            futures::stream::empty::<u32>().throttle_latest(Duration::from_millis(100));
        assert_eq!(throttled.next().await, None);
    }
}
