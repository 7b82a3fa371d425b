//! The MLLP publisher side: one connection at a time, an optional wait for the ACK, and
//! structured results instead of errors so callers can decide to retry or dead-letter.

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use crate::ack::{self, AckInfo};
use crate::codecs::{MllpCodec, DEFAULT_MAX_FRAME_LENGTH};
use crate::error::MllpError;
use crate::hl7::parse_message;
use crate::server::DEFAULT_PORT;

type Transport = Framed<TcpStream, MllpCodec>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    /// Bound on the wait for each acknowledgment, independent of any caller deadline
    pub ack_timeout_ms: u64,
    pub wait_for_ack: bool,
    /// Drop the connection after a failed send and reconnect on the next one
    pub auto_reconnect: bool,
    /// Keep going through a batch after a failed send
    pub continue_on_error: bool,
    pub batch_delay_ms: u64,
    pub max_frame_length: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            connect_timeout_ms: 10_000,
            ack_timeout_ms: 30_000,
            wait_for_ack: true,
            auto_reconnect: true,
            continue_on_error: false,
            batch_delay_ms: 0,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl ClientConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

/// Outcome of one send. `success` requires the write to succeed and, when waiting, an
/// accepting (`AA`/`CA`) acknowledgment.
#[derive(Debug, Clone, PartialEq)]
pub struct SendResult {
    pub success: bool,
    pub ack: Option<AckInfo>,
    pub error: Option<String>,
    pub elapsed: Duration,
}

impl SendResult {
    fn failed(error: impl Into<String>, elapsed: Duration) -> SendResult {
        SendResult {
            success: false,
            ack: None,
            error: Some(error.into()),
            elapsed,
        }
    }
}

pub struct MllpClient {
    config: ClientConfig,
    // the gate: connect, send and the ACK wait all happen under this lock
    connection: Mutex<Option<Transport>>,
}

impl MllpClient {
    pub fn new(config: ClientConfig) -> MllpClient {
        MllpClient {
            config,
            connection: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    /// Connects unless already connected.
    pub async fn connect(&self) -> Result<(), MllpError> {
        let mut slot = self.connection.lock().await;
        if slot.is_none() {
            *slot = Some(self.open().await?);
        }
        Ok(())
    }

    pub async fn disconnect(&self) {
        let mut slot = self.connection.lock().await;
        if let Some(mut transport) = slot.take() {
            if let Err(e) = SinkExt::<&[u8]>::close(&mut transport).await {
                debug!("Error while closing connection to {}: {}", self.config.address(), e);
            }
            info!("Disconnected from {}", self.config.address());
        }
    }

    async fn open(&self) -> Result<Transport, MllpError> {
        let address = self.config.address();
        let stream = timeout(self.config.connect_timeout(), TcpStream::connect(&address))
            .await
            .map_err(|_| MllpError::Timeout {
                operation: format!("connecting to {}", address),
                timeout_ms: self.config.connect_timeout_ms,
            })??;
        stream.set_nodelay(true)?;
        info!("Connected to {}", address);

        Ok(Framed::new(
            stream,
            MllpCodec::with_max_frame_length(self.config.max_frame_length),
        ))
    }

    /// Sends one message, waiting for its acknowledgment if configured to.
    pub async fn send_message(&self, message: &str) -> SendResult {
        let started = Instant::now();
        let mut slot = self.connection.lock().await;

        match self.send_locked(&mut slot, message).await {
            Ok(Some(ack)) if !ack.is_accept() => {
                warn!(
                    "Message rejected by {} with {}: {:?}",
                    self.config.address(),
                    ack.raw_code,
                    ack.error
                );
                SendResult {
                    success: false,
                    error: Some(format!(
                        "negative acknowledgment {}{}",
                        ack.raw_code,
                        ack.error.as_deref().map(|e| format!(": {}", e)).unwrap_or_default()
                    )),
                    ack: Some(ack),
                    elapsed: started.elapsed(),
                }
            }
            Ok(ack) => SendResult {
                success: true,
                ack,
                error: None,
                elapsed: started.elapsed(),
            },
            Err(e) => {
                warn!("Send to {} failed: {}", self.config.address(), e);
                if self.config.auto_reconnect {
                    // the stream may still hold a late ACK, never reuse it
                    slot.take();
                }
                SendResult::failed(e.to_string(), started.elapsed())
            }
        }
    }

    async fn send_locked(
        &self,
        slot: &mut Option<Transport>,
        message: &str,
    ) -> Result<Option<AckInfo>, MllpError> {
        if slot.is_none() {
            if !self.config.auto_reconnect {
                return Err(MllpError::NotConnected);
            }
            *slot = Some(self.open().await?);
        }
        let transport = slot.as_mut().ok_or(MllpError::NotConnected)?;

        transport.send(message).await?; //because this is through the codec it gets wrapped in MLLP header/footer for us
        debug!("  Msg sent to {}", self.config.address());

        if !self.config.wait_for_ack {
            return Ok(None);
        }

        let response = timeout(self.config.ack_timeout(), transport.next())
            .await
            .map_err(|_| MllpError::Timeout {
                operation: "waiting for acknowledgment".to_string(),
                timeout_ms: self.config.ack_timeout_ms,
            })?;
        let frame = match response {
            Some(frame) => frame?,
            None => return Err(MllpError::ConnectionClosed),
        };

        let ack = ack::parse_ack(&frame)?;
        if let Some(sent_id) = parse_message(message).control_id() {
            if sent_id != ack.acknowledged_control_id {
                warn!(
                    "ACK is for control id '{}' but '{}' was sent",
                    ack.acknowledged_control_id, sent_id
                );
            }
        }
        Ok(Some(ack))
    }

    /// Sends messages in order, stopping at the first failure unless `continue_on_error`.
    pub async fn send_batch<S: AsRef<str>>(&self, messages: &[S]) -> Vec<SendResult> {
        let delay = self.config.batch_delay();
        let mut results = Vec::with_capacity(messages.len());

        for (i, message) in messages.iter().enumerate() {
            if i > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let result = self.send_message(message.as_ref()).await;
            let failed = !result.success;
            results.push(result);

            if failed && !self.config.continue_on_error {
                warn!(
                    "Stopping batch after failure at message {} of {}",
                    i + 1,
                    messages.len()
                );
                break;
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mllp;
    use crate::server::{MllpServer, ServerConfig};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    const MSG: &str = "MSH|^~\\&|X|Y|Z|W|20230101||ADT^A01|CL1|P|2.5\rPID|1";

    async fn start_server() -> (crate::server::ServerHandle, u16) {
        let server = MllpServer::bind(ServerConfig {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        })
        .await
        .unwrap();
        let port = server.local_addr().unwrap().port();
        (server.spawn(), port)
    }

    fn config_for(port: u16) -> ClientConfig {
        ClientConfig {
            port,
            ack_timeout_ms: 2_000,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn sends_and_reads_ack() {
        let (server, port) = start_server().await;
        let client = MllpClient::new(config_for(port));

        let result = client.send_message(MSG).await;
        assert!(result.success, "{:?}", result.error);
        let ack = result.ack.unwrap();
        assert_eq!(ack.raw_code, "AA");
        assert_eq!(ack.acknowledged_control_id, "CL1");
        assert!(client.is_connected().await);

        client.disconnect().await;
        assert!(!client.is_connected().await);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn negative_ack_is_a_failed_send() {
        let (server, port) = start_server().await;
        let client = MllpClient::new(config_for(port));

        let result = client.send_message("not hl7 at all").await;
        assert!(!result.success);
        assert_eq!(result.ack.unwrap().raw_code, "AR");

        client.disconnect().await;
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn ack_wait_times_out() {
        // accepts and reads but never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let silent = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            while stream.read(&mut buf).await.unwrap_or(0) > 0 {}
        });

        let client = MllpClient::new(ClientConfig {
            ack_timeout_ms: 100,
            ..config_for(port)
        });
        let result = client.send_message(MSG).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Timeout"));
        // torn down so the next send starts clean
        assert!(!client.is_connected().await);

        silent.abort();
    }

    #[tokio::test]
    async fn fire_and_forget_does_not_wait() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let reader = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let client = MllpClient::new(ClientConfig {
            wait_for_ack: false,
            ..config_for(port)
        });
        let result = client.send_message("hello").await;
        assert!(result.success);
        assert!(result.ack.is_none());
        client.disconnect().await;

        assert_eq!(reader.await.unwrap(), mllp::wrap_frame(b"hello").to_vec());
    }

    #[tokio::test]
    async fn batch_stops_on_first_failure() {
        let (server, port) = start_server().await;
        let client = MllpClient::new(config_for(port));

        let messages = [MSG, "garbage", MSG];
        let results = client.send_batch(&messages).await;
        assert_eq!(results.len(), 2);
        assert!(results[0].success);
        assert!(!results[1].success);

        client.disconnect().await;
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn batch_can_continue_past_failures() {
        let (server, port) = start_server().await;
        let client = MllpClient::new(ClientConfig {
            continue_on_error: true,
            batch_delay_ms: 10,
            ..config_for(port)
        });

        let messages = vec![MSG.to_string(), "garbage".to_string(), MSG.to_string()];
        let results = client.send_batch(&messages).await;
        assert_eq!(
            results.iter().map(|r| r.success).collect::<Vec<_>>(),
            vec![true, false, true]
        );

        client.disconnect().await;
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn no_auto_reconnect_requires_connect() {
        let (server, port) = start_server().await;
        let client = MllpClient::new(ClientConfig {
            auto_reconnect: false,
            ..config_for(port)
        });

        let result = client.send_message(MSG).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Client is not connected"));

        client.connect().await.unwrap();
        assert!(client.send_message(MSG).await.success);

        client.disconnect().await;
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_closes_an_idle_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let reader = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let client = MllpClient::new(config_for(port));
        client.connect().await.unwrap();
        assert!(client.is_connected().await);
        client.disconnect().await;
        assert!(!client.is_connected().await);

        // peer sees EOF without any bytes
        assert!(reader.await.unwrap().is_empty());
        // a second disconnect is a no-op
        client.disconnect().await;
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        // bind then drop to get a port with nothing listening
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = MllpClient::new(config_for(port));
        let result = client.send_message(MSG).await;
        assert!(!result.success);
        assert!(result.error.is_some());
    }
}
