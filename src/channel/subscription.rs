use std::future::Future;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::ChannelError;

const SUBSCRIPTION_BUFFER: usize = 16;

/// Handle to a live snapshot stream.
///
/// Dropping the handle (or calling [`Subscription::cancel`]) stops the
/// producer task and closes the receiver, so nothing is delivered afterwards.
pub struct Subscription<T> {
    receiver: mpsc::Receiver<Result<T, ChannelError>>,
    task: JoinHandle<()>,
}

impl<T: Send + 'static> Subscription<T> {
    /// Runs `producer` on the runtime, feeding whatever it sends to this handle.
    pub fn spawn<F, Fut>(producer: F) -> Self
    where
        F: FnOnce(mpsc::Sender<Result<T, ChannelError>>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let task = tokio::spawn(producer(sender));
        Self { receiver, task }
    }
}

impl<T> Subscription<T> {
    /// Next snapshot, or `None` once the producer has stopped.
    pub async fn next(&mut self) -> Option<Result<T, ChannelError>> {
        self.receiver.recv().await
    }

    pub fn cancel(self) {}
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.task.abort();
        self.receiver.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn delivers_until_producer_finishes() {
        let mut subscription = Subscription::spawn(|sender| async move {
            for n in 0..3u32 {
                if sender.send(Ok(n)).await.is_err() {
                    return;
                }
            }
        });

        let mut seen = Vec::new();
        while let Some(item) = subscription.next().await {
            seen.push(item.unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn cancel_stops_producer() {
        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
        let subscription = Subscription::spawn(move |sender| async move {
            let _guard = done_tx;
            loop {
                if sender.send(Ok(())).await.is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        subscription.cancel();
        let finished = tokio::time::timeout(Duration::from_secs(1), done_rx.recv()).await;
        assert!(matches!(finished, Ok(None)));
    }
}
