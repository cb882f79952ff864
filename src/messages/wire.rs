use crate::messages::Envelope;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, instrument, trace, warn};

// Wire protocol constants
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024; // 4MB
pub const LENGTH_PREFIX_SIZE: usize = 4; // 4 bytes for u32 length prefix
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

// DoS protection
pub const MIN_MESSAGE_SIZE: usize = 1;
pub const SUSPICIOUS_MESSAGE_THRESHOLD: usize = 1024 * 1024; // 1MB threshold for logging

/// Configuration for wire protocol operations including timeouts and message size limits
#[derive(Debug, Clone)]
pub struct WireConfig {
    pub max_message_size: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

impl WireConfig {
    pub fn new(max_message_size: usize, read_timeout: Duration, write_timeout: Duration) -> Self {
        Self {
            max_message_size,
            read_timeout,
            write_timeout,
        }
    }

    /// Same timeout for reads and writes, default size limit
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
            read_timeout: timeout,
            write_timeout: timeout,
        }
    }

    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            ..Self::default()
        }
    }
}

/// Size thresholds enforced on every frame
#[derive(Debug, Clone)]
pub struct DosProtectionConfig {
    pub max_message_size: usize,
    pub min_message_size: usize,
    pub suspicious_threshold: usize,
}

impl Default for DosProtectionConfig {
    fn default() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
            min_message_size: MIN_MESSAGE_SIZE,
            suspicious_threshold: SUSPICIOUS_MESSAGE_THRESHOLD,
        }
    }
}

/// Custom error types for wire protocol operations
#[derive(Error, Debug)]
pub enum WireProtocolError {
    #[error("Message too large: {size} bytes exceeds maximum of {max_size} bytes")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("Message too small: {size} bytes is below minimum of {min_size} bytes")]
    MessageTooSmall { size: usize, min_size: usize },

    #[error("Read operation timed out after {timeout:?}")]
    ReadTimeout { timeout: Duration },

    #[error("Write operation timed out after {timeout:?}")]
    WriteTimeout { timeout: Duration },

    #[error("Corrupted data: {reason}")]
    CorruptedData { reason: String },

    #[error("Unexpected end of file while reading {operation}")]
    UnexpectedEof { operation: String },

    #[error("Connection closed by peer")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireProtocolError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            WireProtocolError::ReadTimeout { .. } | WireProtocolError::WriteTimeout { .. }
        )
    }

    /// Framing or payload violations, as opposed to transport failures
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            WireProtocolError::MessageTooLarge { .. }
                | WireProtocolError::MessageTooSmall { .. }
                | WireProtocolError::CorruptedData { .. }
        )
    }

    /// Failures produced while building an outbound frame
    pub fn is_encode_failure(&self) -> bool {
        matches!(self, WireProtocolError::Serialization(_))
    }
}

/// Length-prefixed JSON framing for [`Envelope`]s
#[derive(Debug, Clone, Default)]
pub struct FramedMessage {
    wire_config: WireConfig,
    dos_config: DosProtectionConfig,
}

impl FramedMessage {
    pub fn new(wire_config: WireConfig) -> Self {
        let dos_config = DosProtectionConfig {
            max_message_size: wire_config.max_message_size,
            ..DosProtectionConfig::default()
        };
        Self {
            wire_config,
            dos_config,
        }
    }

    pub fn wire_config(&self) -> &WireConfig {
        &self.wire_config
    }

    pub fn read_timeout(&self) -> Duration {
        self.wire_config.read_timeout
    }

    pub fn write_timeout(&self) -> Duration {
        self.wire_config.write_timeout
    }

    #[instrument(level = "trace", skip(self), fields(max_size = self.dos_config.max_message_size))]
    fn validate_message_size(&self, size: usize) -> Result<(), WireProtocolError> {
        if size < self.dos_config.min_message_size {
            warn!(
                size = size,
                min_size = self.dos_config.min_message_size,
                "Message size is below minimum threshold"
            );
            return Err(WireProtocolError::MessageTooSmall {
                size,
                min_size: self.dos_config.min_message_size,
            });
        }

        if size > self.dos_config.max_message_size {
            error!(
                size = size,
                max_size = self.dos_config.max_message_size,
                "Message size exceeds maximum allowed size"
            );
            return Err(WireProtocolError::MessageTooLarge {
                size,
                max_size: self.dos_config.max_message_size,
            });
        }

        if size > self.dos_config.suspicious_threshold {
            warn!(
                size = size,
                threshold = self.dos_config.suspicious_threshold,
                "Message size exceeds suspicious threshold but is still allowed"
            );
        }

        Ok(())
    }

    /// Serialize an envelope to its JSON body
    #[instrument(level = "trace", skip(self, envelope), fields(message_type = %envelope.message_type))]
    pub fn encode_envelope(&self, envelope: &Envelope) -> Result<Vec<u8>, WireProtocolError> {
        let body = serde_json::to_vec(envelope).map_err(|e| {
            error!(error = %e, "Failed to serialize envelope");
            WireProtocolError::Serialization(e)
        })?;
        self.validate_message_size(body.len())?;
        trace!("Serialized envelope to {} bytes", body.len());
        Ok(body)
    }

    /// Parse a JSON body back into an envelope
    #[instrument(level = "trace", skip(self, data), fields(data_size = data.len()))]
    pub fn decode_envelope(&self, data: &[u8]) -> Result<Envelope, WireProtocolError> {
        self.validate_message_size(data.len())?;
        serde_json::from_slice(data).map_err(|e| {
            error!(error = %e, data_size = data.len(), "Failed to decode envelope");
            WireProtocolError::CorruptedData {
                reason: format!("Failed to decode envelope: {}", e),
            }
        })
    }

    /// Encode an envelope into a complete frame (length prefix + body),
    /// ready to be queued on an outbound writer.
    pub fn encode_frame(&self, envelope: &Envelope) -> Result<Vec<u8>, WireProtocolError> {
        let body = self.encode_envelope(envelope)?;
        let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Read into `buffer` until it is full. Returns `Ok(false)` when the
    /// peer closed before the first byte.
    #[instrument(level = "trace", skip(reader, buffer), fields(buffer_size = buffer.len()))]
    async fn read_exact_with_recovery(
        reader: &mut (impl AsyncRead + Unpin),
        buffer: &mut [u8],
        operation: &str,
    ) -> Result<bool, WireProtocolError> {
        let mut total_read = 0;
        let buffer_len = buffer.len();

        while total_read < buffer_len {
            match reader.read(&mut buffer[total_read..]).await {
                Ok(0) if total_read == 0 => return Ok(false),
                Ok(0) => {
                    error!(
                        total_read = total_read,
                        expected = buffer_len,
                        "Unexpected EOF in the middle of a frame"
                    );
                    return Err(WireProtocolError::UnexpectedEof {
                        operation: operation.to_string(),
                    });
                }
                Ok(read) => {
                    total_read += read;
                    trace!(read, total_read, "Partial read completed");
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, total_read, expected = buffer_len, "Read operation failed");
                    return Err(WireProtocolError::Io(e));
                }
            }
        }
        Ok(true)
    }

    /// Write a pre-encoded frame and flush, bounded by the write timeout
    #[instrument(level = "trace", skip(self, writer, frame), fields(frame_size = frame.len()))]
    pub async fn write_frame(
        &self,
        writer: &mut (impl AsyncWrite + Unpin),
        frame: &[u8],
    ) -> Result<(), WireProtocolError> {
        let timeout = self.wire_config.write_timeout;
        let write = async {
            writer.write_all(frame).await?;
            writer.flush().await?;
            Ok::<(), std::io::Error>(())
        };
        match tokio::time::timeout(timeout, write).await {
            Ok(result) => result.map_err(WireProtocolError::Io),
            Err(_) => {
                error!(timeout = ?timeout, "Write operation timed out");
                Err(WireProtocolError::WriteTimeout { timeout })
            }
        }
    }

    #[instrument(level = "debug", skip(self, writer, envelope), fields(message_type = %envelope.message_type))]
    pub async fn write_message(
        &self,
        writer: &mut (impl AsyncWrite + Unpin),
        envelope: &Envelope,
    ) -> Result<(), WireProtocolError> {
        let frame = self.encode_frame(envelope)?;
        self.write_frame(writer, &frame).await?;
        debug!("Message write completed ({} bytes)", frame.len());
        Ok(())
    }

    /// Read one envelope. Waiting for the length prefix is unbounded (an idle
    /// link is not an error); once a frame has started, the body must arrive
    /// within the read timeout.
    #[instrument(level = "debug", skip(self, reader))]
    pub async fn read_message(
        &self,
        reader: &mut (impl AsyncRead + Unpin),
    ) -> Result<Envelope, WireProtocolError> {
        let mut length_buffer = [0u8; LENGTH_PREFIX_SIZE];
        if !Self::read_exact_with_recovery(reader, &mut length_buffer, "length prefix").await? {
            debug!("Peer closed the stream at a frame boundary");
            return Err(WireProtocolError::Closed);
        }

        let length = u32::from_be_bytes(length_buffer) as usize;
        self.validate_message_size(length)?;

        let mut body = vec![0u8; length];
        let timeout = self.wire_config.read_timeout;
        let read = Self::read_exact_with_recovery(reader, &mut body, "message body");
        match tokio::time::timeout(timeout, read).await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                return Err(WireProtocolError::UnexpectedEof {
                    operation: "message body".to_string(),
                })
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                error!(timeout = ?timeout, expected = length, "Read operation timed out");
                return Err(WireProtocolError::ReadTimeout { timeout });
            }
        }

        let envelope = self.decode_envelope(&body)?;
        debug!(message_type = %envelope.message_type, "Message read completed");
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{duplex, AsyncWriteExt};

    fn sample() -> Envelope {
        Envelope::new("update", "client-1", "linux", json!({"k": "v"}))
    }

    #[tokio::test]
    async fn test_message_crosses_duplex_stream() {
        let framed = FramedMessage::default();
        let (mut a, mut b) = duplex(1024);

        framed.write_message(&mut a, &sample()).await.unwrap();
        let received = framed.read_message(&mut b).await.unwrap();
        assert_eq!(received, sample());
    }

    #[tokio::test]
    async fn test_length_prefix_is_big_endian() {
        let framed = FramedMessage::default();
        let frame = framed.encode_frame(&sample()).unwrap();
        let body_len = frame.len() - LENGTH_PREFIX_SIZE;
        assert_eq!(&frame[..4], &(body_len as u32).to_be_bytes());
    }

    #[tokio::test]
    async fn test_zero_length_frame_rejected() {
        let framed = FramedMessage::default();
        let (mut a, mut b) = duplex(64);
        a.write_all(&0u32.to_be_bytes()).await.unwrap();

        let err = framed.read_message(&mut b).await.unwrap_err();
        assert!(matches!(err, WireProtocolError::MessageTooSmall { .. }));
        assert!(err.is_protocol_violation());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let framed = FramedMessage::new(WireConfig::with_max_message_size(16));
        let (mut a, mut b) = duplex(64);
        a.write_all(&1000u32.to_be_bytes()).await.unwrap();

        let err = framed.read_message(&mut b).await.unwrap_err();
        assert!(matches!(
            err,
            WireProtocolError::MessageTooLarge { size: 1000, max_size: 16 }
        ));
    }

    #[tokio::test]
    async fn test_oversized_outbound_rejected() {
        let framed = FramedMessage::new(WireConfig::with_max_message_size(8));
        let err = framed.encode_frame(&sample()).unwrap_err();
        assert!(matches!(err, WireProtocolError::MessageTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_clean_close_vs_truncated_frame() {
        let framed = FramedMessage::default();

        let (a, mut b) = duplex(64);
        drop(a);
        let err = framed.read_message(&mut b).await.unwrap_err();
        assert!(matches!(err, WireProtocolError::Closed));

        let (mut a, mut b) = duplex(64);
        a.write_all(&10u32.to_be_bytes()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);
        let err = framed.read_message(&mut b).await.unwrap_err();
        assert!(matches!(err, WireProtocolError::UnexpectedEof { .. }));
    }

    #[tokio::test]
    async fn test_garbage_body_is_corrupted_data() {
        let framed = FramedMessage::default();
        let (mut a, mut b) = duplex(64);
        a.write_all(&5u32.to_be_bytes()).await.unwrap();
        a.write_all(b"nope!").await.unwrap();

        let err = framed.read_message(&mut b).await.unwrap_err();
        assert!(matches!(err, WireProtocolError::CorruptedData { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_body_times_out() {
        let framed = FramedMessage::new(WireConfig::with_timeout(Duration::from_millis(50)));
        let (mut a, mut b) = duplex(64);
        a.write_all(&10u32.to_be_bytes()).await.unwrap();

        let err = framed.read_message(&mut b).await.unwrap_err();
        assert!(err.is_timeout());
    }
}
