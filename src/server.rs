//! The MLLP listener.
//!
//! One task per accepted connection, each reading frames through [`MllpCodec`], announcing
//! them as [`ServerEvent::MessageReceived`] and writing an acknowledgment back on the same
//! socket. Events go out on a broadcast channel so a slow observer only ever lags, it
//! never holds up a read loop.

use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::ack::{AckCode, Acknowledgment};
use crate::codecs::{MllpCodec, DEFAULT_MAX_FRAME_LENGTH};
use crate::error::MllpError;

pub const DEFAULT_PORT: u16 = 2575;

/// Pause after a failed `accept` so a persistent failure (e.g. fd exhaustion) can't spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub max_frame_length: usize,
    /// Events buffered per subscriber before it starts lagging
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            event_capacity: 1024,
        }
    }
}

impl ServerConfig {
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Everything observable about the listener.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Connected {
        peer: SocketAddr,
    },
    MessageReceived {
        peer: SocketAddr,
        message: String,
    },
    AckSent {
        peer: SocketAddr,
        control_id: String,
        code: AckCode,
    },
    Disconnected {
        peer: SocketAddr,
    },
    Error {
        peer: Option<SocketAddr>,
        error: String,
    },
}

#[derive(Clone)]
struct ConnectionContext {
    events: broadcast::Sender<ServerEvent>,
    shutdown: CancellationToken,
    max_frame_length: usize,
}

impl ConnectionContext {
    fn emit(&self, event: ServerEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

pub struct MllpServer {
    listener: TcpListener,
    context: ConnectionContext,
    connections: TaskTracker,
}

impl MllpServer {
    pub async fn bind(config: ServerConfig) -> Result<MllpServer, MllpError> {
        let listener = TcpListener::bind(config.socket_address()).await?;
        info!("MLLP listener bound to {}", listener.local_addr()?);

        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Ok(MllpServer {
            listener,
            context: ConnectionContext {
                events,
                shutdown: CancellationToken::new(),
                max_frame_length: config.max_frame_length,
            },
            connections: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, MllpError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.context.events.subscribe()
    }

    /// Cancelling this token stops the accept loop and every connection.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.context.shutdown.clone()
    }

    /// Accepts connections until shut down, then waits for every connection task to finish.
    pub async fn run(self) -> Result<(), MllpError> {
        let MllpServer {
            listener,
            context,
            connections,
        } = self;

        loop {
            tokio::select! {
                _ = context.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        connections.spawn(handle_connection(stream, peer, context.clone()));
                    }
                    Err(e) => {
                        error!("Failed to accept connection; error = {}", e);
                        context.emit(ServerEvent::Error {
                            peer: None,
                            error: e.to_string(),
                        });
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
            }
        }

        drop(listener);
        info!(
            "MLLP listener stopping, waiting for {} connection(s)",
            connections.len()
        );
        connections.close();
        connections.wait().await;
        info!("MLLP listener stopped");
        Ok(())
    }

    /// Runs the listener on its own task.
    pub fn spawn(self) -> ServerHandle {
        let shutdown = self.shutdown_token();
        let local_addr = self.local_addr().ok();
        ServerHandle {
            shutdown,
            local_addr,
            task: tokio::spawn(self.run()),
        }
    }
}

pub struct ServerHandle {
    shutdown: CancellationToken,
    local_addr: Option<SocketAddr>,
    task: JoinHandle<Result<(), MllpError>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Requests shutdown and returns once every connection has wound down.
    pub async fn stop(self) -> Result<(), MllpError> {
        self.shutdown.cancel();
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(MllpError::Io(std::io::Error::other(e.to_string()))),
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, context: ConnectionContext) {
    info!("Connection opened from {}", peer);
    context.emit(ServerEvent::Connected { peer });

    if let Err(e) = process(stream, peer, &context).await {
        error!("Failed to process connection {}; error = {}", peer, e);
        context.emit(ServerEvent::Error {
            peer: Some(peer),
            error: e.to_string(),
        });
    }

    info!("Connection closed from {}", peer);
    context.emit(ServerEvent::Disconnected { peer });
}

async fn process(
    stream: TcpStream,
    peer: SocketAddr,
    context: &ConnectionContext,
) -> Result<(), MllpError> {
    let mut transport = Framed::new(
        stream,
        MllpCodec::with_max_frame_length(context.max_frame_length),
    );

    loop {
        let next = tokio::select! {
            _ = context.shutdown.cancelled() => {
                debug!("Shutdown requested, closing connection {}", peer);
                return Ok(());
            }
            next = transport.next() => next,
        };

        let payload = match next {
            Some(result) => result?,
            None => return Ok(()), // remote closed
        };

        let message = match String::from_utf8(payload.to_vec()) {
            Ok(message) => message,
            Err(e) => {
                warn!("Message from {} is not valid UTF-8, decoding lossily", peer);
                String::from_utf8_lossy(e.as_bytes()).into_owned()
            }
        };
        debug!("Got message of {} bytes from {}", message.len(), peer);
        context.emit(ServerEvent::MessageReceived {
            peer,
            message: message.clone(),
        });

        let ack = Acknowledgment::for_raw(&message);
        transport.send(ack.text.as_str()).await?; //because this is through the codec it gets wrapped in MLLP header/footer for us
        debug!("  {} sent to {} for '{}'", ack.code, peer, ack.control_id);
        context.emit(ServerEvent::AckSent {
            peer,
            control_id: ack.control_id,
            code: ack.code,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ack::parse_ack;
    use crate::mllp;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn local_config() -> ServerConfig {
        ServerConfig {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        }
    }

    async fn read_one_frame(stream: &mut TcpStream) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "server closed before sending a full frame");
            buf.extend_from_slice(&chunk[..n]);
            if let mllp::FrameStatus::Complete(frame) = mllp::extract_frame(&buf, buf.len()).unwrap() {
                return frame.payload(&buf).to_vec();
            }
        }
    }

    #[tokio::test]
    async fn acknowledges_each_message_on_a_connection() {
        let server = MllpServer::bind(local_config()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.spawn();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        for id in ["A1", "A2"] {
            let msg = format!("MSH|^~\\&|X|Y|Z|W|20230101||ADT^A01|{}|P|2.5\rPID|1", id);
            stream.write_all(&mllp::wrap_frame(msg.as_bytes())).await.unwrap();
            let ack = parse_ack(&read_one_frame(&mut stream).await).unwrap();
            assert_eq!(ack.raw_code, "AA");
            assert_eq!(ack.acknowledged_control_id, id);
        }

        drop(stream);
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn two_frames_in_one_write_get_two_acks() {
        let server = MllpServer::bind(local_config()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.spawn();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut data = mllp::wrap_frame(b"MSH|^~\\&|X|Y|Z|W|||ADT^A01|B1|P|2.5").to_vec();
        data.extend_from_slice(&mllp::wrap_frame(b"MSH|^~\\&|X|Y|Z|W|||ADT^A01|B2|P|2.5"));
        stream.write_all(&data).await.unwrap();

        let mut buf = Vec::new();
        let mut acks = Vec::new();
        let mut chunk = [0u8; 1024];
        while acks.len() < 2 {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0);
            buf.extend_from_slice(&chunk[..n]);
            while let mllp::FrameStatus::Complete(frame) = mllp::extract_frame(&buf, buf.len()).unwrap() {
                acks.push(parse_ack(frame.payload(&buf)).unwrap());
                buf.drain(..frame.consumed());
            }
        }
        assert_eq!(acks[0].acknowledged_control_id, "B1");
        assert_eq!(acks[1].acknowledged_control_id, "B2");

        drop(stream);
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn rejects_content_without_header() {
        let server = MllpServer::bind(local_config()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let mut events = server.subscribe();
        let handle = server.spawn();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&mllp::wrap_frame(b"garbage")).await.unwrap();
        let ack = parse_ack(&read_one_frame(&mut stream).await).unwrap();
        assert_eq!(ack.raw_code, "AR");

        loop {
            match events.recv().await.unwrap() {
                ServerEvent::AckSent { code, .. } => {
                    assert_eq!(code, AckCode::ApplicationReject);
                    break;
                }
                _ => continue,
            }
        }

        drop(stream);
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn one_connection_dropping_does_not_affect_another() {
        let server = MllpServer::bind(local_config()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.spawn();

        let mut broken = TcpStream::connect(addr).await.unwrap();
        broken.write_all(b"\x0Bhalf a frame").await.unwrap();
        drop(broken);

        let mut healthy = TcpStream::connect(addr).await.unwrap();
        healthy
            .write_all(&mllp::wrap_frame(b"MSH|^~\\&|X|Y|Z|W|||ADT^A01|C1|P|2.5"))
            .await
            .unwrap();
        let ack = parse_ack(&read_one_frame(&mut healthy).await).unwrap();
        assert_eq!(ack.acknowledged_control_id, "C1");

        drop(healthy);
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_waits_for_open_connections() {
        let server = MllpServer::bind(local_config()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let mut events = server.subscribe();
        let handle = server.spawn();

        let mut idle = TcpStream::connect(addr).await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            ServerEvent::Connected { .. }
        ));

        handle.stop().await.unwrap();

        // the server side is gone, so the idle client reads EOF
        let mut buf = [0u8; 16];
        assert_eq!(idle.read(&mut buf).await.unwrap(), 0);
        assert!(matches!(
            events.recv().await.unwrap(),
            ServerEvent::Disconnected { .. }
        ));
    }
}
