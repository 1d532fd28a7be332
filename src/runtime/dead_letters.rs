//! Sink for messages that could not be delivered.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use opentelemetry::metrics::Counter;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

/// How many dead letters are kept around for inspection.
const RETAINED: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetter {
    pub recipient: String,
    pub message: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Cheap to clone; every clone feeds the same sink task.
#[derive(Debug, Clone)]
pub struct DeadLetters {
    tx: mpsc::UnboundedSender<DeadLetter>,
    recent: Arc<Mutex<VecDeque<DeadLetter>>>,
}

impl DeadLetters {
    /// Start the sink task. Must be called inside a tokio runtime.
    pub fn start() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<DeadLetter>();
        let recent = Arc::new(Mutex::new(VecDeque::with_capacity(RETAINED)));

        let counter: Counter<u64> = crate::metrics::meter()
            .u64_counter("runtime.dead_letters")
            .with_description("Messages that could not be delivered")
            .init();
        let retained = recent.clone();
        tokio::spawn(async move {
            while let Some(letter) = rx.recv().await {
                tracing::warn!(
                    recipient = %letter.recipient,
                    reason = %letter.reason,
                    "Dead letter: {}",
                    letter.message
                );
                counter.add(1, &[]);
                let mut retained = retained.lock().await;
                if retained.len() == RETAINED {
                    retained.pop_front();
                }
                retained.push_back(letter);
            }
        });

        Self { tx, recent }
    }

    pub fn publish(
        &self,
        recipient: impl fmt::Display,
        message: impl Into<String>,
        reason: impl Into<String>,
    ) {
        let letter = DeadLetter {
            recipient: recipient.to_string(),
            message: message.into(),
            reason: reason.into(),
            at: Utc::now(),
        };
        if let Err(mpsc::error::SendError(letter)) = self.tx.send(letter) {
            // Sink is gone during shutdown; still leave a trace.
            tracing::warn!("Dead letter after shutdown: {letter:?}");
        }
    }

    /// The most recent dead letters, oldest first.
    pub async fn recent(&self) -> Vec<DeadLetter> {
        self.recent.lock().await.iter().cloned().collect()
    }

    /// Poll until at least `count` letters were sunk or `timeout`
    /// passes.
    #[cfg(test)]
    pub(crate) async fn wait_for(&self, count: usize, timeout: std::time::Duration) -> Vec<DeadLetter> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let letters = self.recent().await;
            if letters.len() >= count || tokio::time::Instant::now() >= deadline {
                return letters;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }
}

#[tokio::test]
async fn sink_retains_latest_letters() {
    let sink = DeadLetters::start();
    for i in 0..(RETAINED + 5) {
        sink.publish("Worker:x-0", format!("msg {i}"), "gone");
    }
    let letters = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            let letters = sink.recent().await;
            if letters.last().map(|l| l.message.as_str()) == Some("msg 104") {
                return letters;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(letters.len(), RETAINED);
    assert_eq!(letters[0].message, "msg 5");
    assert_eq!(letters[0].recipient, "Worker:x-0");
}
