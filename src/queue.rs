use crate::error::{Result, TetherError};
use crate::logger::redact;
use crate::message::Command;
use crate::transport::BoxedStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A queued protocol line.
#[derive(Debug, Clone)]
pub struct OutboundCommand {
    pub line: String,
    pub sensitive: bool,
    pub submitted_at: Instant,
    /// Connection the line belongs to; `None` goes to whichever is live.
    pub generation: Option<u64>,
}

/// The write half of the live connection, tagged with its generation.
#[derive(Clone, Default)]
pub struct WriterSlot {
    inner: Arc<Mutex<Option<(u64, WriteHalf<BoxedStream>)>>>,
}

impl WriterSlot {
    pub async fn install(&self, generation: u64, writer: WriteHalf<BoxedStream>) {
        *self.inner.lock().await = Some((generation, writer));
    }

    /// Drops the writer if it still belongs to `generation`.
    pub async fn clear(&self, generation: u64) {
        let mut slot = self.inner.lock().await;
        if matches!(slot.as_ref(), Some((current, _)) if *current == generation) {
            if let Some((_, mut writer)) = slot.take() {
                let _ = writer.shutdown().await;
            }
        }
    }

    pub async fn clear_any(&self) {
        if let Some((_, mut writer)) = self.inner.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    pub async fn write_line(&self, generation: Option<u64>, line: &str) -> Result<()> {
        let mut slot = self.inner.lock().await;
        let Some((current, writer)) = slot.as_mut() else {
            return Err(TetherError::Connection("Not connected".to_string()));
        };
        if generation.is_some_and(|g| g != *current) {
            return Err(TetherError::Connection(format!(
                "Line belongs to a previous connection (generation {:?})",
                generation
            )));
        }
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Bounded, rate-limited outbound queue drained by a single consumer task.
#[derive(Clone)]
pub struct OutboundQueue {
    tx: mpsc::Sender<OutboundCommand>,
    closed: Arc<AtomicBool>,
    close_notify: Arc<Notify>,
}

impl OutboundQueue {
    /// Creates the queue and starts its consumer. `spacing` is slept after
    /// every transmitted line.
    pub fn spawn(capacity: usize, spacing: Duration, writer: WriterSlot) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let closed = Arc::new(AtomicBool::new(false));
        let close_notify = Arc::new(Notify::new());

        let consumer = tokio::spawn(run_consumer(
            rx,
            writer,
            spacing,
            closed.clone(),
            close_notify.clone(),
        ));

        (
            Self {
                tx,
                closed,
                close_notify,
            },
            consumer,
        )
    }

    /// Non-blocking; a full queue is an immediate `QueueFull`.
    pub fn submit(&self, command: Command) -> Result<()> {
        self.submit_for(None, command)
    }

    pub fn submit_for(&self, generation: Option<u64>, command: Command) -> Result<()> {
        command.validate()?;
        if self.is_closed() {
            return Err(TetherError::QueueClosed);
        }

        let outbound = OutboundCommand {
            line: command.to_string(),
            sensitive: command.is_sensitive(),
            submitted_at: Instant::now(),
            generation,
        };

        self.tx.try_send(outbound).map_err(|e| match e {
            TrySendError::Full(_) => TetherError::QueueFull,
            TrySendError::Closed(_) => TetherError::QueueClosed,
        })
    }

    /// Stops the consumer without draining; later submits fail.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Closing outbound queue");
            self.close_notify.notify_one();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.tx.is_closed()
    }
}

async fn run_consumer(
    mut rx: mpsc::Receiver<OutboundCommand>,
    writer: WriterSlot,
    spacing: Duration,
    closed: Arc<AtomicBool>,
    close_notify: Arc<Notify>,
) {
    loop {
        let outbound = tokio::select! {
            biased;
            _ = close_notify.notified() => break,
            next = rx.recv() => match next {
                Some(outbound) => outbound,
                None => break,
            },
        };

        if closed.load(Ordering::SeqCst) {
            break;
        }

        match writer.write_line(outbound.generation, &outbound.line).await {
            Ok(()) => debug!(
                ">> {} (queued {:?})",
                redact(&outbound.line, outbound.sensitive),
                outbound.submitted_at.elapsed()
            ),
            Err(e) => warn!(
                "Dropped outbound line '{}': {}",
                redact(&outbound.line, outbound.sensitive),
                e
            ),
        }

        tokio::time::sleep(spacing).await;
    }

    rx.close();
    debug!("Outbound queue consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use tokio::io::AsyncBufReadExt;
    use tokio::io::BufReader;

    async fn connected_slot(generation: u64) -> (WriterSlot, tokio::io::Lines<BufReader<tokio::io::DuplexStream>>) {
        let (client, server) = tokio::io::duplex(4096);
        let (_read, write) = Transport::new(client, false, "test").into_split();
        let slot = WriterSlot::default();
        slot.install(generation, write).await;
        (slot, BufReader::new(server).lines())
    }

    #[tokio::test(start_paused = true)]
    async fn test_lines_sent_in_order_with_spacing() {
        let (slot, mut lines) = connected_slot(1).await;
        let spacing = Duration::from_millis(100);
        let (queue, _consumer) = OutboundQueue::spawn(8, spacing, slot);

        queue.submit(Command::Raw("A".into())).unwrap();
        queue.submit(Command::Raw("B".into())).unwrap();
        queue.submit(Command::Raw("C".into())).unwrap();

        let mut stamps = Vec::new();
        for expected in ["A", "B", "C"] {
            let line = lines.next_line().await.unwrap().unwrap();
            assert_eq!(line, expected);
            stamps.push(tokio::time::Instant::now());
        }
        assert!(stamps[1] - stamps[0] >= spacing);
        assert!(stamps[2] - stamps[1] >= spacing);
    }

    #[tokio::test]
    async fn test_dropped_consumer_closes_queue() {
        let (queue, consumer) = OutboundQueue::spawn(1, Duration::from_secs(60), WriterSlot::default());
        consumer.abort();
        let _ = consumer.await;

        let result = queue.submit(Command::Raw("A".into()));
        assert!(matches!(result, Err(TetherError::QueueClosed)));
    }

    #[tokio::test]
    async fn test_full_queue_rejects_immediately() {
        let (slot, _lines) = connected_slot(1).await;
        let (queue, _consumer) = OutboundQueue::spawn(2, Duration::from_secs(60), slot);

        // The consumer has not been polled yet, so nothing leaves the channel.
        queue.submit(Command::Raw("first".into())).unwrap();
        queue.submit(Command::Raw("second".into())).unwrap();
        assert!(matches!(
            queue.submit(Command::Raw("third".into())),
            Err(TetherError::QueueFull)
        ));
    }

    #[tokio::test]
    async fn test_close_rejects_later_submits() {
        let (slot, _lines) = connected_slot(1).await;
        let (queue, consumer) = OutboundQueue::spawn(8, Duration::from_millis(1), slot);

        queue.close();
        assert!(matches!(
            queue.submit(Command::Raw("late".into())),
            Err(TetherError::QueueClosed)
        ));
        consumer.await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_line_rejected_before_queueing() {
        let (queue, _consumer) = OutboundQueue::spawn(8, Duration::ZERO, WriterSlot::default());
        let result = queue.submit(Command::Raw("PRIVMSG #a :x\r\nQUIT".into()));
        assert!(matches!(result, Err(TetherError::InvalidMessage(_))));
    }

    #[tokio::test]
    async fn test_stale_generation_not_written() {
        let (slot, _lines) = connected_slot(2).await;
        let result = slot.write_line(Some(1), "JOIN #old").await;
        assert!(matches!(result, Err(TetherError::Connection(_))));
        assert!(slot.write_line(Some(2), "JOIN #new").await.is_ok());
        assert!(slot.write_line(None, "PING x").await.is_ok());
    }

    #[tokio::test]
    async fn test_write_without_connection_fails() {
        let slot = WriterSlot::default();
        assert!(slot.write_line(None, "PING x").await.is_err());
    }
}
