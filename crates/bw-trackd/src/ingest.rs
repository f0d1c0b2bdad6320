use crate::aggregator::Aggregator;
use bw_core::decode_reading;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug)]
pub struct IngestConfig {
    pub listen_addr: String,
    pub max_frame_bytes: usize,
    pub ack_timeout: Duration,
}

pub async fn run(
    config: IngestConfig,
    agg: Arc<Aggregator>,
    shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!(event = "ingest_start", addr = %config.listen_addr);
    serve(listener, config, agg, shutdown).await;
    info!(event = "ingest_stop");
    Ok(())
}

async fn serve(
    listener: TcpListener,
    config: IngestConfig,
    agg: Arc<Aggregator>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, peer)) => {
                        let config = config.clone();
                        let agg = agg.clone();
                        tokio::spawn(async move {
                            handle_connection(config, agg, stream, peer).await;
                        });
                    }
                    Err(err) => {
                        warn!(event = "ingest_accept_error", error = %err);
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    config: IngestConfig,
    agg: Arc<Aggregator>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    info!(event = "sensor_connected", peer = %peer);
    let (reader_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader_half);
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = match reader.read_until(b'\n', &mut line).await {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "ingest_read_error", peer = %peer, error = %err);
                break;
            }
        };
        if read == 0 {
            break;
        }
        if line.iter().all(|byte| byte.is_ascii_whitespace()) {
            continue;
        }

        // a bad line never tears down the connection
        let reading = match decode_reading(&line, config.max_frame_bytes) {
            Ok(reading) => reading,
            Err(err) => {
                warn!(
                    event = "ingest_decode_error",
                    peer = %peer,
                    error = %err,
                    raw = %String::from_utf8_lossy(&line).trim()
                );
                continue;
            }
        };

        let raw = String::from_utf8_lossy(&line).trim().to_string();
        {
            let store = agg.lock_store();
            if let Err(err) = store.record_event(&reading, &raw) {
                error!(event = "event_log_error", peer = %peer, error = %err);
            }
        }

        debug!(
            event = "reading_received",
            peer = %peer,
            bed = %reading.bed_name,
            esp = %reading.esp_id,
            status = ?reading.status,
            rssi = reading.rssi
        );
        agg.enqueue(reading);

        let ack = async {
            writer.write_all(b"accepted\n").await?;
            writer.flush().await
        };
        match tokio::time::timeout(config.ack_timeout, ack).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                // ack is best-effort; keep reading even if the peer stopped
                // listening for replies
                debug!(event = "ack_error", peer = %peer, error = %err);
            }
            Err(_) => {
                warn!(event = "ack_timeout", peer = %peer);
                break;
            }
        }
    }

    info!(event = "sensor_disconnected", peer = %peer);
}
