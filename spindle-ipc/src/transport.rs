//! IPC transport implementations
//!
//! Frames are [`MessageEnvelope`]s serialised as single JSON lines.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};

use crate::error::IpcError;
use crate::protocol::{MessageEnvelope, IPC_PROTOCOL_VERSION};

/// IPC transport trait for different communication mechanisms
#[async_trait]
pub trait IpcTransport: Send {
    /// Send a message to the other end
    async fn send<T: Serialize + Send + Sync>(
        &mut self,
        message: &MessageEnvelope<T>,
    ) -> Result<(), IpcError>;

    /// Receive a message from the other end.
    ///
    /// Cancel safe: dropping the returned future never loses a partially read frame.
    async fn receive<T: DeserializeOwned + Send>(
        &mut self,
    ) -> Result<MessageEnvelope<T>, IpcError>;

    /// Close the transport
    async fn close(&mut self) -> Result<(), IpcError>;
}

/// Serialise an envelope into one newline-terminated frame
pub fn encode_frame<T: Serialize>(message: &MessageEnvelope<T>) -> Result<String, IpcError> {
    let mut json = serde_json::to_string(message)
        .map_err(|e| IpcError::SerializationError(e.to_string()))?;
    json.push('\n');
    Ok(json)
}

/// Parse one frame and check protocol version compatibility
pub fn decode_frame<T: DeserializeOwned>(line: &str) -> Result<MessageEnvelope<T>, IpcError> {
    let envelope: MessageEnvelope<T> = serde_json::from_str(line)
        .map_err(|e| IpcError::DeserializationError(e.to_string()))?;

    if !envelope.is_compatible() {
        return Err(IpcError::ProtocolVersionMismatch {
            expected: IPC_PROTOCOL_VERSION,
            actual: envelope.protocol_version,
        });
    }

    Ok(envelope)
}

/// Reading half of a framed stream
pub struct FrameReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }

    /// Read the next frame, skipping blank lines. EOF yields `ConnectionClosed`.
    pub async fn next<T: DeserializeOwned>(&mut self) -> Result<MessageEnvelope<T>, IpcError> {
        loop {
            let line = self
                .lines
                .next_line()
                .await?
                .ok_or(IpcError::ConnectionClosed)?;

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            return decode_frame(line);
        }
    }
}

/// Writing half of a framed stream
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn send<T: Serialize>(&mut self, message: &MessageEnvelope<T>) -> Result<(), IpcError> {
        let frame = encode_frame(message)?;
        self.writer.write_all(frame.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), IpcError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Bidirectional transport over any reader/writer pair
pub struct FramedTransport<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
}

impl<R, W> FramedTransport<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
        }
    }
}

/// Stdin/Stdout transport used inside worker processes
pub type StdioTransport = FramedTransport<tokio::io::Stdin, tokio::io::Stdout>;

impl FramedTransport<tokio::io::Stdin, tokio::io::Stdout> {
    /// Create a transport over this process's stdin and stdout
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

#[async_trait]
impl<R, W> IpcTransport for FramedTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send<T: Serialize + Send + Sync>(
        &mut self,
        message: &MessageEnvelope<T>,
    ) -> Result<(), IpcError> {
        self.writer.send(message).await
    }

    async fn receive<T: DeserializeOwned + Send>(
        &mut self,
    ) -> Result<MessageEnvelope<T>, IpcError> {
        self.reader.next().await
    }

    async fn close(&mut self) -> Result<(), IpcError> {
        self.writer.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CoordinatorMessage, WorkerMessage};
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_duplex_round_trip() {
        let (left, right) = duplex(4096);
        let (left_read, left_write) = tokio::io::split(left);
        let (right_read, right_write) = tokio::io::split(right);

        let mut controller = FramedTransport::new(left_read, left_write);
        let mut worker = FramedTransport::new(right_read, right_write);

        controller
            .send(&MessageEnvelope::new(WorkerMessage::Shutdown))
            .await
            .unwrap();
        let received: MessageEnvelope<WorkerMessage> = worker.receive().await.unwrap();
        assert!(matches!(received.message, WorkerMessage::Shutdown));

        worker
            .send(&MessageEnvelope::new(CoordinatorMessage::Ready {
                worker_id: 3,
                pid: 99,
                functions: vec!["add".to_string()],
            }))
            .await
            .unwrap();
        let reply: MessageEnvelope<CoordinatorMessage> = controller.receive().await.unwrap();
        match reply.message {
            CoordinatorMessage::Ready {
                worker_id,
                pid,
                functions,
            } => {
                assert_eq!((worker_id, pid), (3, 99));
                assert_eq!(functions, vec!["add"]);
            }
            other => panic!("expected ready, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_version_mismatch_rejected() {
        let (mut tx, rx) = duplex(1024);
        let mut reader = FrameReader::new(rx);

        let mut envelope = MessageEnvelope::new(WorkerMessage::Shutdown);
        envelope.protocol_version = IPC_PROTOCOL_VERSION + 1;
        let frame = encode_frame(&envelope).unwrap();
        tx.write_all(frame.as_bytes()).await.unwrap();

        let err = reader.next::<WorkerMessage>().await.unwrap_err();
        assert!(matches!(err, IpcError::ProtocolVersionMismatch { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_blank_lines_skipped_and_eof_closes() {
        let (mut tx, rx) = duplex(1024);
        let mut reader = FrameReader::new(rx);

        let frame = encode_frame(&MessageEnvelope::new(WorkerMessage::Shutdown)).unwrap();
        tx.write_all(b"\n\n").await.unwrap();
        tx.write_all(frame.as_bytes()).await.unwrap();
        drop(tx);

        let first: MessageEnvelope<WorkerMessage> = reader.next().await.unwrap();
        assert!(matches!(first.message, WorkerMessage::Shutdown));

        let err = reader.next::<WorkerMessage>().await.unwrap_err();
        assert!(matches!(err, IpcError::ConnectionClosed));
    }

    #[test]
    fn test_garbage_frame() {
        let err = decode_frame::<WorkerMessage>("not json").unwrap_err();
        assert!(matches!(err, IpcError::DeserializationError(_)));
    }
}
