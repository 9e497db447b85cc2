//! Per-connection send/receive plumbing for the game TCP protocol.
//!
//! Each accepted socket is split into an owned reader driven by the session
//! loop and an owned writer drained by a dedicated sender task. Outgoing
//! commands pass through an unbounded FIFO queue; each is written as a
//! ULEB128 length prefix followed by the payload, then flushed, so frames
//! never interleave.

use phira_mp_proto::{encode_uleb128, CodecError, ServerCommand, MAX_PAYLOAD_LEN};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

pub type FrameReader = BufReader<OwnedReadHalf>;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

pub struct Connection {
    peer: SocketAddr,
    queue: mpsc::UnboundedSender<ServerCommand>,
    last_receive: parking_lot::Mutex<Instant>,
    closed: AtomicBool,
    close_signal: watch::Sender<bool>,
}

impl Connection {
    /// Wires up a connection and spawns its sender task over the write half.
    pub fn start(peer: SocketAddr, writer: OwnedWriteHalf) -> Self {
        let (queue, queue_rx) = mpsc::unbounded_channel();
        let (close_signal, close_rx) = watch::channel(false);
        tokio::spawn(send_loop(writer, queue_rx, close_rx));
        Self {
            peer,
            queue,
            last_receive: parking_lot::Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            close_signal,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Enqueues a command for delivery. Silently dropped once closed.
    pub fn send(&self, command: ServerCommand) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let _ = self.queue.send(command);
    }

    pub fn touch(&self) {
        *self.last_receive.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_receive.lock().elapsed()
    }

    /// Idempotent. The sender task drains what is already queued, shuts the
    /// socket down, and exits; the session loop observes the signal and
    /// stops reading.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.close_signal.send(true);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn subscribe_close(&self) -> watch::Receiver<bool> {
        self.close_signal.subscribe()
    }
}

async fn send_loop(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<ServerCommand>,
    mut close: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            command = queue.recv() => match command {
                Some(command) => {
                    if write_command(&mut writer, &command).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = close.changed() => {
                // flush what was enqueued before the close, then shut down
                while let Ok(command) = queue.try_recv() {
                    if write_command(&mut writer, &command).await.is_err() {
                        break;
                    }
                }
                let _ = writer.shutdown().await;
                break;
            }
        }
    }
    debug!("sender task finished");
}

async fn write_command(
    writer: &mut OwnedWriteHalf,
    command: &ServerCommand,
) -> std::io::Result<()> {
    let payload = command.encode_to_vec();
    let mut prefix = Vec::with_capacity(4);
    encode_uleb128(&mut prefix, payload.len() as u64);
    writer.write_all(&prefix).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    trace!(bytes = payload.len(), "frame written");
    Ok(())
}

/// Reads one length-prefixed frame, taking and returning ownership of the
/// reader so the session loop can keep the read in flight across heartbeat
/// ticks.
pub async fn read_frame(mut reader: FrameReader) -> Result<(FrameReader, Vec<u8>), ConnectionError> {
    let length = read_uleb128_u32(&mut reader).await?;
    let length = length as usize;
    if length > MAX_PAYLOAD_LEN {
        return Err(CodecError::PayloadTooLarge.into());
    }
    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    Ok((reader, payload))
}

/// ULEB128 read limited to 32 bits, per the framing rules.
async fn read_uleb128_u32(reader: &mut FrameReader) -> Result<u32, ConnectionError> {
    let mut value = 0u32;
    for index in 0..5 {
        let byte = reader.read_u8().await?;
        let data = u32::from(byte & 0x7f);
        if index == 4 && (byte & 0x70) != 0 {
            return Err(CodecError::VarintOverflow.into());
        }
        value |= data << (7 * index);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(CodecError::VarintOverflow.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use phira_mp_proto::ClientCommand;
    use tokio::net::{TcpListener, TcpStream};

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn queued_commands_arrive_in_order() {
        let (client, server) = socket_pair().await;
        let peer = server.peer_addr().unwrap();
        let (_server_read, server_write) = server.into_split();
        let connection = Connection::start(peer, server_write);

        connection.send(ServerCommand::Pong);
        connection.send(ServerCommand::ChangeHost(true));

        let (client_read, _client_write) = client.into_split();
        let reader = BufReader::new(client_read);
        let (reader, first) = read_frame(reader).await.unwrap();
        assert_eq!(
            ServerCommand::decode_payload(&first).unwrap(),
            ServerCommand::Pong
        );
        let (_, second) = read_frame(reader).await.unwrap();
        assert_eq!(
            ServerCommand::decode_payload(&second).unwrap(),
            ServerCommand::ChangeHost(true)
        );
    }

    #[tokio::test]
    async fn close_flushes_queue_then_shuts_down() {
        let (client, server) = socket_pair().await;
        let peer = server.peer_addr().unwrap();
        let (_server_read, server_write) = server.into_split();
        let connection = Connection::start(peer, server_write);

        connection.send(ServerCommand::Pong);
        connection.close();
        connection.close();
        // dropped after close
        connection.send(ServerCommand::ChangeHost(false));

        let (client_read, _client_write) = client.into_split();
        let reader = BufReader::new(client_read);
        let (mut reader, frame) = read_frame(reader).await.unwrap();
        assert_eq!(
            ServerCommand::decode_payload(&frame).unwrap(),
            ServerCommand::Pong
        );
        // stream ends instead of delivering the post-close command
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn oversize_length_prefix_is_fatal() {
        let (client, server) = socket_pair().await;
        let (server_read, _server_write) = server.into_split();
        let (_client_read, mut client_write) = client.into_split();

        let mut prefix = Vec::new();
        encode_uleb128(&mut prefix, (MAX_PAYLOAD_LEN + 1) as u64);
        client_write.write_all(&prefix).await.unwrap();

        let result = read_frame(BufReader::new(server_read)).await;
        assert!(matches!(
            result,
            Err(ConnectionError::Codec(CodecError::PayloadTooLarge))
        ));
    }

    #[tokio::test]
    async fn frame_roundtrip_through_sockets() {
        let (client, server) = socket_pair().await;
        let (server_read, _server_write) = server.into_split();
        let (_client_read, mut client_write) = client.into_split();

        let command = ClientCommand::Authenticate {
            token: "token".into(),
        };
        let payload = command.encode_to_vec();
        let mut framed = Vec::new();
        encode_uleb128(&mut framed, payload.len() as u64);
        framed.extend_from_slice(&payload);
        client_write.write_all(&framed).await.unwrap();

        let (_, received) = read_frame(BufReader::new(server_read)).await.unwrap();
        assert_eq!(ClientCommand::decode_payload(&received).unwrap(), command);
    }
}
