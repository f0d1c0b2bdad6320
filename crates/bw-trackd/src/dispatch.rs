use bw_core::{encode_frame, RoomNotice, DEFAULT_MAX_FRAME_BYTES};
use std::io;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const MAX_ATTEMPTS: u32 = 5;
const MAX_BACKOFF_SECS: u64 = 30;

#[derive(Clone, Debug)]
pub struct DispatchConfig {
    pub target_addr: String,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
}

/// Handed to committers. Enqueueing never blocks and never reports failure
/// back; delivery is best-effort by contract.
#[derive(Clone)]
pub struct DispatchHandle {
    tx: mpsc::Sender<RoomNotice>,
}

impl DispatchHandle {
    pub fn enqueue(&self, notice: RoomNotice) {
        match self.tx.try_send(notice) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(notice)) => {
                warn!(event = "dispatch_queue_full", bed = %notice.bed_name);
            }
            Err(mpsc::error::TrySendError::Closed(notice)) => {
                warn!(event = "dispatch_queue_closed", bed = %notice.bed_name);
            }
        }
    }
}

/// One consumer drains the queue sequentially, which keeps notices for the
/// same bed in commit order.
pub fn spawn(config: DispatchConfig) -> (DispatchHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(config.queue_capacity);
    let task = tokio::spawn(run(config, rx));
    (DispatchHandle { tx }, task)
}

#[cfg(test)]
pub(crate) fn test_handle(capacity: usize) -> (DispatchHandle, mpsc::Receiver<RoomNotice>) {
    let (tx, rx) = mpsc::channel(capacity);
    (DispatchHandle { tx }, rx)
}

async fn run(config: DispatchConfig, mut rx: mpsc::Receiver<RoomNotice>) {
    info!(event = "dispatcher_start", target = %config.target_addr);
    while let Some(notice) = rx.recv().await {
        deliver(&config, notice).await;
    }
    info!(event = "dispatcher_stop");
}

pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt).min(MAX_BACKOFF_SECS))
}

async fn deliver(config: &DispatchConfig, notice: RoomNotice) {
    let frame = match encode_frame(&notice, DEFAULT_MAX_FRAME_BYTES) {
        Ok(frame) => frame,
        Err(err) => {
            error!(event = "dispatch_encode_error", bed = %notice.bed_name, error = %err);
            return;
        }
    };

    for attempt in 1..=MAX_ATTEMPTS {
        match attempt_send(config, &frame).await {
            Ok(()) => {
                info!(
                    event = "dispatch_sent",
                    bed = %notice.bed_name,
                    status = ?notice.status,
                    attempt
                );
                return;
            }
            Err(err) => {
                let wait = backoff_delay(attempt);
                warn!(
                    event = "dispatch_attempt_failed",
                    bed = %notice.bed_name,
                    attempt,
                    error = %err,
                    wait_secs = wait.as_secs()
                );
                tokio::time::sleep(wait).await;
            }
        }
    }

    warn!(
        event = "dispatch_dropped",
        bed = %notice.bed_name,
        attempts = MAX_ATTEMPTS
    );
}

async fn attempt_send(config: &DispatchConfig, frame: &[u8]) -> io::Result<()> {
    let connect = TcpStream::connect(&config.target_addr);
    let mut stream = tokio::time::timeout(config.connect_timeout, connect)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timeout"))??;

    let write = async {
        stream.write_all(frame).await?;
        stream.flush().await?;
        stream.shutdown().await
    };
    tokio::time::timeout(config.write_timeout, write)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timeout"))?
}
