//! Queue consumer loop and graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use hccflow_core::RunnerSettings;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::pool::WorkerPool;
use crate::runner::{DeliveryOutcome, DeliveryReport, Runner};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: usize,
    pub acked: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
    /// Deliveries still running when the pool was torn down; the broker
    /// redelivers them.
    pub aborted: usize,
}

impl ConsumerStats {
    fn tally(&mut self, reports: Vec<DeliveryReport>) {
        for r in reports {
            match r.outcome {
                DeliveryOutcome::Acked => self.acked += 1,
                DeliveryOutcome::Requeued => self.requeued += 1,
                DeliveryOutcome::DeadLettered => self.dead_lettered += 1,
            }
        }
    }
}

pub struct Consumer {
    runner: Arc<Runner>,
    concurrency: usize,
    poll_interval: Duration,
    shutdown_grace: Duration,
    cancel_grace: Duration,
}

impl Consumer {
    /// `inference_timeout` bounds how long cancelled work may take to wind
    /// down after the grace period.
    pub fn new(runner: Arc<Runner>, settings: &RunnerSettings, inference_timeout: Duration) -> Self {
        Self {
            runner,
            concurrency: settings.worker_concurrency,
            poll_interval: settings.poll_interval,
            shutdown_grace: settings.shutdown_grace,
            cancel_grace: inference_timeout,
        }
    }

    /// Consume until `shutdown` fires, then drain.
    ///
    /// On shutdown no new deliveries are taken; in-flight ones get the grace
    /// period, then their work is cancelled (they requeue), and anything
    /// still running after one more inference timeout is aborted.
    pub async fn run(&self, shutdown: CancellationToken) -> ConsumerStats {
        let mut pool = WorkerPool::new(self.concurrency);
        let work = CancellationToken::new();
        let mut stats = ConsumerStats::default();
        info!(workers = pool.concurrency(), "consumer started");

        loop {
            stats.tally(pool.collect_finished());

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = pool.reserve() => match permit {
                    Some(p) => p,
                    None => break,
                },
            };
            if shutdown.is_cancelled() {
                break;
            }

            // A receive abandoned on shutdown leaves its message unsettled;
            // the broker redelivers it.
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.runner.broker().receive() => received,
            };
            match received {
                Ok(Some(delivery)) => {
                    stats.received += 1;
                    let runner = self.runner.clone();
                    let work = work.clone();
                    pool.spawn_reserved(permit, async move { runner.handle(delivery, &work).await });
                }
                Ok(None) => {
                    drop(permit);
                    if self.idle(&shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    drop(permit);
                    warn!(error = %e, "receive failed");
                    if self.idle(&shutdown).await {
                        break;
                    }
                }
            }
        }

        self.drain(pool, work, stats).await
    }

    /// Sleep one poll interval. `true` if shutdown was requested meanwhile.
    async fn idle(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => true,
            _ = tokio::time::sleep(self.poll_interval) => false,
        }
    }

    async fn drain(
        &self,
        mut pool: WorkerPool<DeliveryReport>,
        work: CancellationToken,
        mut stats: ConsumerStats,
    ) -> ConsumerStats {
        pool.close();
        info!(
            in_flight = pool.in_flight(),
            grace_secs = self.shutdown_grace.as_secs(),
            "shutting down, draining in-flight deliveries"
        );
        stats.tally(pool.drain_within(self.shutdown_grace).await);

        if pool.in_flight() > 0 {
            warn!(remaining = pool.in_flight(), "grace period elapsed, cancelling in-flight work");
            work.cancel();
            stats.tally(pool.drain_within(self.cancel_grace).await);
            stats.aborted = pool.abort_all().await;
        }

        info!(
            received = stats.received,
            acked = stats.acked,
            requeued = stats.requeued,
            dead_lettered = stats.dead_lettered,
            aborted = stats.aborted,
            "consumer stopped"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, Fixture};
    use async_trait::async_trait;
    use hccflow_store::{ArtifactStore, StatusSink};
    use hccflow_sync::{Broker, BrokerError, Delivery, MemoryBroker};

    /// A gateway whose receive never completes.
    struct StalledBroker;

    #[async_trait]
    impl Broker for StalledBroker {
        async fn receive(&self) -> Result<Option<Delivery>, BrokerError> {
            std::future::pending().await
        }
        async fn ack(&self, _: &str) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn nack(&self, _: &str, _: bool) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn dead_letter(&self, _: &str, _: &str) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn publish(&self, _: &str, _: &[u8]) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    fn settings(workers: usize, grace: Duration) -> RunnerSettings {
        RunnerSettings {
            worker_concurrency: workers,
            max_delivery_attempts: 5,
            shutdown_grace: grace,
            poll_interval: Duration::from_millis(10),
        }
    }

    async fn wait_for(what: &str, cond: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    fn spawn_consumer(
        fx: &Fixture,
        settings: RunnerSettings,
    ) -> (CancellationToken, tokio::task::JoinHandle<ConsumerStats>) {
        let runner = Arc::new(fx.runner(settings.max_delivery_attempts));
        let consumer = Consumer::new(runner, &settings, Duration::from_secs(2));
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        (shutdown, tokio::spawn(async move { consumer.run(token).await }))
    }

    #[tokio::test]
    async fn consumes_until_shutdown() {
        let fx = Fixture::new(None);
        for i in 0..6 {
            let doc = format!("doc-{i}");
            fx.write_input(&format!("{doc}.json"), &testing::extraction(&doc, &[("c1", "E11.65")]));
            fx.broker.push(testing::event(&doc, &format!("{doc}.json")));
        }
        fx.broker.push("garbage");

        let (shutdown, handle) = spawn_consumer(&fx, settings(3, Duration::from_secs(5)));
        let broker: Arc<MemoryBroker> = fx.broker.clone();
        wait_for("all deliveries settled", || {
            broker.acked() + broker.dead_letters().len() == 7
        })
        .await;
        shutdown.cancel();

        let stats = handle.await.unwrap();
        assert_eq!(stats.received, 7);
        assert_eq!(stats.acked, 6);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(stats.aborted, 0);
        assert_eq!(fx.broker.published().len(), 6);
    }

    #[tokio::test]
    async fn shutdown_cancels_stuck_inference_and_requeues() {
        let fx = Fixture::new(Some(testing::stuck_backend()));
        fx.write_input("doc-1.json", &testing::extraction("doc-1", &[("c1", "K21.9")]));
        fx.broker.push(testing::event("doc-1", "doc-1.json"));

        let (shutdown, handle) = spawn_consumer(&fx, settings(2, Duration::from_millis(50)));
        let broker = fx.broker.clone();
        wait_for("delivery in flight", || broker.in_flight() == 1).await;
        shutdown.cancel();

        let stats = handle.await.unwrap();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.requeued, 1);
        assert_eq!(stats.aborted, 0);
        assert_eq!(fx.broker.pending(), 1, "message back on the queue");
        assert!(fx.broker.dead_letters().is_empty());
        assert!(fx.broker.published().is_empty());
    }

    #[tokio::test]
    async fn idle_consumer_stops_promptly() {
        let fx = Fixture::new(None);
        let (shutdown, handle) = spawn_consumer(&fx, settings(1, Duration::from_secs(5)));
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();

        let stats = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats, ConsumerStats::default());
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_stalled_receive() {
        let fx = Fixture::new(None);
        let settings = settings(1, Duration::from_secs(5));
        let runner = Arc::new(Runner::new(
            fx.pipeline.clone(),
            fx.artifacts.clone() as Arc<dyn ArtifactStore>,
            Arc::new(StalledBroker),
            fx.status.clone() as Arc<dyn StatusSink>,
            &settings,
        ));
        let consumer = Consumer::new(runner, &settings, Duration::from_secs(2));
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { consumer.run(token).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();

        let stats = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("consumer stuck in receive")
            .unwrap();
        assert_eq!(stats, ConsumerStats::default());
    }
}
