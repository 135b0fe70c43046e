use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, error, info};

use crate::dispatcher::{Dispatcher, Outcome};
use crate::queue::{deliveries, Delivery, QueueConsumer};

/// Consume the queue with at most `workers` envelopes in flight until the queue
/// closes.
pub async fn run_workers(consumer: Arc<dyn QueueConsumer>, dispatcher: Arc<Dispatcher>, workers: usize) {
    let workers = workers.max(1);
    info!(workers, "queue workers started");

    deliveries(consumer.clone())
        .for_each_concurrent(workers, |delivery| {
            let consumer = consumer.clone();
            let dispatcher = dispatcher.clone();
            async move { settle(consumer.as_ref(), &dispatcher, delivery).await }
        })
        .await;

    info!("queue closed, workers stopped");
}

/// Process one delivery and tell the queue how it went.
async fn settle(consumer: &dyn QueueConsumer, dispatcher: &Dispatcher, delivery: Delivery) {
    let envelope = match delivery.decode() {
        Ok(envelope) => envelope,
        Err(e) => {
            // Redelivering an undecodable body can never succeed.
            error!(message_id = %delivery.id, error = %e, "dropping malformed envelope");
            consumer.ack(&delivery).await;
            return;
        }
    };

    match dispatcher.process(&envelope).await {
        Outcome::Delivered | Outcome::Suppressed => consumer.ack(&delivery).await,
        Outcome::Failed(err) if err.is_retryable() => {
            let disposition = consumer.retry(delivery, &err.to_string()).await;
            debug!(dedup_key = %envelope.dedup_key, ?disposition, "delivery handed back");
        }
        Outcome::Failed(err) => {
            error!(
                dedup_key = %envelope.dedup_key,
                attempt = envelope.attempt,
                error = %err,
                "dropping envelope after non-retryable failure"
            );
            consumer.ack(&delivery).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::tests::{dispatcher, Behavior, RecordingSender, ScriptedPlugin};
    use crate::dispatcher::UnmatchedPolicy;
    use crate::plugins::Plugin;
    use crate::queue::tests::envelope;
    use crate::queue::{MemoryQueue, QueuePublisher};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    async fn wait_for(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_transient_failure_delivered_max_attempts_then_dead_lettered() {
        let queue = Arc::new(MemoryQueue::new(16, 3, Duration::from_millis(1)));
        let flaky = ScriptedPlugin::new(Behavior::Transient);
        let d = Arc::new(dispatcher(
            vec![("flaky", "flaky", flaky.clone() as Arc<dyn Plugin>)],
            Arc::new(RecordingSender::default()),
            UnmatchedPolicy::Hint,
        ));

        let handle = tokio::spawn(run_workers(queue.clone(), d, 4));
        queue.publish(&envelope("src:t1", "flaky")).await.unwrap();

        wait_for(|| queue.stats().dead_lettered == 1).await;
        // No redelivery after the dead letter.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);

        let dead = queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 3);

        queue.close();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_envelopes_processed_once() {
        let queue = Arc::new(MemoryQueue::new(16, 3, Duration::from_millis(1)));
        let plugin = ScriptedPlugin::new(Behavior::Incident);
        let sender = Arc::new(RecordingSender::default());
        let d = Arc::new(dispatcher(
            vec![("incident", r"incident\s+(\d+)", plugin.clone() as Arc<dyn Plugin>)],
            sender.clone(),
            UnmatchedPolicy::Hint,
        ));

        let handle = tokio::spawn(run_workers(queue.clone(), d, 4));
        let env = envelope("src:evt1", "incident 456");
        queue.publish(&env).await.unwrap();
        queue.publish(&env).await.unwrap();

        wait_for(|| queue.stats().acked == 2).await;
        assert_eq!(plugin.calls.load(Ordering::SeqCst), 1);
        assert_eq!(plugin.captures.lock().await[0].get(1), Some("456"));
        assert_eq!(sender.sent.lock().await.len(), 1);

        queue.close();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_non_retryable_failure_is_acked() {
        let queue = Arc::new(MemoryQueue::new(16, 3, Duration::from_millis(1)));
        let bad = ScriptedPlugin::new(Behavior::Fatal);
        let d = Arc::new(dispatcher(
            vec![("bad", "bad", bad.clone() as Arc<dyn Plugin>)],
            Arc::new(RecordingSender::default()),
            UnmatchedPolicy::Hint,
        ));

        let handle = tokio::spawn(run_workers(queue.clone(), d, 2));
        queue.publish(&envelope("src:b1", "bad")).await.unwrap();

        wait_for(|| queue.stats().acked == 1).await;
        assert_eq!(bad.calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.stats().dead_lettered, 0);

        queue.close();
        handle.await.unwrap();
    }
}
