//! Connection management for the runner.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use taskbroker_proto::{decode, decode_bytes, encode, BrokerToRunner, ProtoError, RunnerToBroker};

use crate::config::Config;
use crate::executor::Executor;
use crate::runner::Runner;

const CHANNEL_CAPACITY: usize = 64;
const WRITER_DRAIN: Duration = Duration::from_secs(2);

/// Errors that end a broker connection.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Protocol error: {0}")]
    Proto(#[from] ProtoError),
}

/// Manages one connection to the broker.
pub struct RunnerConnection {
    config: Arc<Config>,
    executor: Arc<dyn Executor>,
}

impl RunnerConnection {
    pub fn new(config: Arc<Config>, executor: Arc<dyn Executor>) -> Self {
        Self { config, executor }
    }

    /// Connect to the broker and serve until the connection drops or
    /// `shutdown` fires. The caller handles reconnection.
    pub async fn connect_and_run(&self, shutdown: CancellationToken) -> Result<(), RunnerError> {
        let url = self.config.connect_url();
        info!(url = %url, "Connecting to broker");

        let (socket, _) = connect_async(url.as_str()).await?;
        let (mut sink, mut stream) = socket.split();
        info!("Connected to broker");

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<RunnerToBroker>(CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<BrokerToRunner>(CHANNEL_CAPACITY);

        let mut writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let frame = match encode(&msg) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!(error = %e, "Failed to encode message");
                        continue;
                    }
                };
                if sink.send(Message::Text(frame)).await.is_err() {
                    debug!("Socket closed while sending");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(result) = stream.next().await {
                let decoded = match result {
                    Ok(Message::Text(text)) => decode::<BrokerToRunner>(&text),
                    Ok(Message::Binary(bytes)) => decode_bytes::<BrokerToRunner>(&bytes),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                };
                match decoded {
                    Ok(msg) => {
                        if inbound_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Malformed frame from broker dropped"),
                }
            }
        });

        let (runner, done_rx) = Runner::new(self.config.clone(), self.executor.clone(), outbound_tx);
        runner.run(inbound_rx, done_rx, shutdown).await;

        reader.abort();
        if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
            writer.abort();
        }

        info!("Disconnected from broker");
        Ok(())
    }
}
