use std::sync::Arc;

use tokio::sync::Semaphore;

/// A synchronization utility for sending / receiving shutdown signals.
///
/// One of these fans SIGINT out to every worker loop in the process: the
/// HTTP server stops accepting, the scheduled jobs break out of their tick
/// loops, and the webhook workers drain their queue before exiting, so no
/// accepted event is dropped on the floor.
///
/// Features:
///
/// - Multi-producer and multi-consumer - simply clone to get another handle.
/// - Consumers can receive shutdown signals that were sent prior to
///   'subscribing' to the channel (unlike [`tokio::sync::broadcast`]).
/// - It is safe to send a shutdown signal multiple times.
///
/// The implementation (ab)uses the fact that calling [`acquire`] on a
/// [`Semaphore`] with 0 permits only returns once the [`Semaphore`] has been
/// closed. Closing the [`Semaphore`] is equivalent to sending a shutdown
/// signal; receiving an [`AcquireError`] is equivalent to receiving one.
///
/// [`acquire`]: Semaphore::acquire
/// [`AcquireError`]: tokio::sync::AcquireError
#[derive(Clone, Debug)]
pub struct ShutdownChannel {
    inner: Arc<Semaphore>,
}

impl ShutdownChannel {
    /// Construct a new [`ShutdownChannel`].
    /// This function should only be called *once* in the lifetime of a program.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Semaphore::new(0)),
        }
    }

    /// Send a shutdown signal, causing all actors waiting on this channel to
    /// complete their call to [`recv`].
    ///
    /// [`recv`]: ShutdownChannel::recv
    pub fn send(&self) {
        self.inner.close()
    }

    /// Wait for a shutdown signal.
    /// If a shutdown signal was already sent, this fn returns immediately.
    pub async fn recv(&self) {
        self.inner
            .acquire()
            .await
            .map(|_permit| ())
            .expect_err("Shouldn't've been able to acquire a permit");
    }

    /// Immediately returns whether a shutdown signal has been sent.
    pub fn try_recv(&self) -> bool {
        self.inner.is_closed()
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use tokio::{sync::mpsc, time};

    use super::*;
    use crate::task::{self, PtTask};

    #[test]
    fn multiple_sends_doesnt_panic() {
        let shutdown = ShutdownChannel::new();
        shutdown.send();
        shutdown.send();
        shutdown.send();
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_after_close_is_ok() {
        let shutdown1 = ShutdownChannel::new();
        let shutdown2 = shutdown1.clone();
        time::sleep(Duration::from_secs(1)).await;
        shutdown1.send();
        time::timeout(Duration::from_nanos(1), shutdown2.recv())
            .await
            .expect("Did not finish immediately");

        // 'Subscribing' after close should immediately finish
        let shutdown3 = shutdown2.clone();
        assert!(shutdown3.try_recv());
        time::timeout(Duration::from_nanos(1), shutdown3.recv())
            .await
            .expect("Did not finish immediately");
    }

    /// The webhook-pool exit contract: workers select between their queue
    /// and the shutdown channel (queue biased first), so everything
    /// already enqueued when the signal fires is still processed before
    /// the pool joins.
    #[tokio::test]
    async fn worker_pool_drains_queued_work_before_exit() {
        let shutdown = ShutdownChannel::new();
        let (tx, rx) = mpsc::channel::<u32>(16);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let processed = Arc::new(AtomicUsize::new(0));

        let workers: Vec<PtTask<()>> = (0..2)
            .map(|_| {
                let rx = Arc::clone(&rx);
                let shutdown = shutdown.clone();
                let processed = Arc::clone(&processed);
                PtTask::spawn_named("drain worker", async move {
                    loop {
                        let next = {
                            let mut rx = rx.lock().await;
                            tokio::select! {
                                biased;
                                item = rx.recv() => item,
                                () = shutdown.recv() => None,
                            }
                        };
                        match next {
                            Some(_) => {
                                processed.fetch_add(1, Ordering::SeqCst);
                            }
                            None => break,
                        }
                    }
                })
            })
            .collect();

        for item in 0..5u32 {
            tx.send(item).await.unwrap();
        }
        shutdown.send();

        task::join_all_and_log(workers).await;
        assert_eq!(processed.load(Ordering::SeqCst), 5);
    }
}
