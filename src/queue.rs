//! Bounded at-least-once work queue with delayed redelivery.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::models::QueueMessage;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,
}

/// A message handed to the consumer. Must end in [`Delivery::ack`] or
/// [`JobQueue::retry`].
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: QueueMessage,
    /// 1 on first delivery.
    pub attempt: u32,
}

impl Delivery {
    pub fn ack(self) {
        tracing::debug!(
            "acknowledged {} after {} delivery(ies)",
            self.message.request_id,
            self.attempt
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Scheduled { attempt: u32 },
    DeadLettered,
}

#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Delivery>,
    max_deliveries: u32,
}

pub struct QueueReceiver {
    rx: mpsc::Receiver<Delivery>,
}

pub fn channel(capacity: usize, max_deliveries: u32) -> (JobQueue, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let queue = JobQueue {
        tx,
        max_deliveries: max_deliveries.max(1),
    };
    (queue, QueueReceiver { rx })
}

impl JobQueue {
    /// Enqueues a new message, waiting if the queue is full.
    pub async fn send(&self, message: QueueMessage) -> Result<(), QueueError> {
        self.tx
            .send(Delivery {
                message,
                attempt: 1,
            })
            .await
            .map_err(|_| QueueError::Closed)
    }

    /// Schedules redelivery after `delay`, or dead-letters the message once
    /// it has been delivered `max_deliveries` times. A dead-lettered message
    /// is dropped; the consumer records the failure on the job.
    pub fn retry(&self, delivery: Delivery, delay: Duration) -> RetryOutcome {
        if delivery.attempt >= self.max_deliveries {
            tracing::error!(
                "dead-lettered {} after {} deliveries",
                delivery.message.request_id,
                delivery.attempt
            );
            return RetryOutcome::DeadLettered;
        }

        let attempt = delivery.attempt + 1;
        let redelivery = Delivery {
            message: delivery.message,
            attempt,
        };
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let request_id = redelivery.message.request_id.clone();
            if tx.send(redelivery).await.is_err() {
                tracing::warn!("queue closed before redelivering {}", request_id);
            }
        });
        RetryOutcome::Scheduled { attempt }
    }

}

impl QueueReceiver {
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    /// Returns a delivery only if one is ready right now.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QueuedImage;

    fn message(id: &str) -> QueueMessage {
        QueueMessage {
            image: QueuedImage {
                key: format!("u/{}", id),
                mime_type: "image/jpeg".into(),
            },
            style_id: "anime-default-001".into(),
            user_id: "u".into(),
            timestamp: 0,
            request_id: id.into(),
        }
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let (queue, mut rx) = channel(4, 3);
        queue.send(message("a")).await.unwrap();
        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.attempt, 1);
        assert_eq!(delivery.message.request_id, "a");
        delivery.ack();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_redelivers_after_delay() {
        let (queue, mut rx) = channel(4, 3);
        queue.send(message("a")).await.unwrap();
        let delivery = rx.recv().await.unwrap();

        let outcome = queue.retry(delivery, Duration::from_secs(5));
        assert_eq!(outcome, RetryOutcome::Scheduled { attempt: 2 });

        let redelivered = rx.recv().await.unwrap();
        assert_eq!(redelivered.attempt, 2);
        assert_eq!(redelivered.message.request_id, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_dead_letters_at_limit() {
        let (queue, mut rx) = channel(4, 2);
        let delivery = Delivery {
            message: message("a"),
            attempt: 2,
        };
        assert_eq!(
            queue.retry(delivery, Duration::ZERO),
            RetryOutcome::DeadLettered
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_waits_while_queue_is_full() {
        let (queue, mut rx) = channel(1, 3);
        queue.send(message("a")).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_secs(1), queue.send(message("b"))).await;
        assert!(blocked.is_err());

        let sender = tokio::spawn({
            let queue = queue.clone();
            async move { queue.send(message("c")).await }
        });
        tokio::task::yield_now().await;
        assert!(!sender.is_finished());

        assert_eq!(rx.recv().await.unwrap().message.request_id, "a");
        sender.await.unwrap().unwrap();
        assert_eq!(rx.recv().await.unwrap().message.request_id, "c");
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (queue, rx) = channel(1, 1);
        drop(rx);
        assert!(matches!(
            queue.send(message("a")).await,
            Err(QueueError::Closed)
        ));
    }
}
