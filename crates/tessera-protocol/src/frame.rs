// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for QUIC stream framing.
//!
//! Each QUIC stream carries one RPC exchange with the following frame format:
//! - 4 bytes: message length (big-endian)
//! - 2 bytes: message type
//! - N bytes: protobuf payload
//!
//! Server streams (schema pulls, artefact downloads) are sequences of
//! `StreamData` frames, terminated by `StreamEnd` for finite streams.

use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (32 MB). Artefact content travels in ≤1 MiB chunks, so
/// this bound is only ever approached by large module schemas.
pub const MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

/// Frame header size (4 bytes length + 2 bytes type).
pub const HEADER_SIZE: usize = 6;

/// Message types for the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    Request = 1,
    Response = 2,
    StreamData = 3,
    StreamEnd = 4,
    Error = 5,
}

impl TryFrom<u16> for MessageType {
    type Error = FrameError;

    fn try_from(value: u16) -> Result<Self, FrameError> {
        match value {
            1 => Ok(MessageType::Request),
            2 => Ok(MessageType::Response),
            3 => Ok(MessageType::StreamData),
            4 => Ok(MessageType::StreamEnd),
            5 => Ok(MessageType::Error),
            _ => Err(FrameError::InvalidMessageType(value)),
        }
    }
}

/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("invalid message type: {0}")]
    InvalidMessageType(u16),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("connection closed")]
    ConnectionClosed,
}

/// A framed message with type and payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub message_type: MessageType,
    pub payload: Bytes,
}

impl Frame {
    pub fn request<M: Message>(msg: &M) -> Result<Self, FrameError> {
        Self::new(MessageType::Request, msg)
    }

    pub fn response<M: Message>(msg: &M) -> Result<Self, FrameError> {
        Self::new(MessageType::Response, msg)
    }

    pub fn stream_data<M: Message>(msg: &M) -> Result<Self, FrameError> {
        Self::new(MessageType::StreamData, msg)
    }

    /// The zero-payload frame that terminates a finite server stream.
    pub fn stream_end() -> Self {
        Self {
            message_type: MessageType::StreamEnd,
            payload: Bytes::new(),
        }
    }

    pub fn error<M: Message>(msg: &M) -> Result<Self, FrameError> {
        Self::new(MessageType::Error, msg)
    }

    pub fn new<M: Message>(message_type: MessageType, msg: &M) -> Result<Self, FrameError> {
        let payload = msg.encode_to_vec();
        if payload.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(payload.len()));
        }
        Ok(Self {
            message_type,
            payload: Bytes::from(payload),
        })
    }

    /// Decode the payload as a protobuf message.
    pub fn decode<M: Message + Default>(&self) -> Result<M, FrameError> {
        Ok(M::decode(self.payload.clone())?)
    }

    /// Encode the frame to bytes for wire transmission.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.payload.len() as u32);
        buf.put_u16(self.message_type as u16);
        buf.put(self.payload.clone());
        buf.freeze()
    }
}

/// Write a frame to an async writer.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    writer.write_all(&frame.encode()).await?;
    Ok(())
}

/// Read a frame from an async reader.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let message_type = MessageType::try_from(u16::from_be_bytes([header[4], header[5]]))?;

    if length > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(length));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(Frame {
        message_type,
        payload: Bytes::from(payload),
    })
}

/// Framed codec over a stream.
pub struct FramedStream<S> {
    stream: S,
}

impl<S> FramedStream<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

/// Interpret the next frame of a server stream: an item, or `None` on
/// `StreamEnd`.
pub async fn read_stream_item<M: Message + Default, R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<M>, FrameError> {
    let frame = read_frame(reader).await?;
    match frame.message_type {
        MessageType::StreamData => Ok(Some(frame.decode()?)),
        MessageType::StreamEnd => Ok(None),
        MessageType::Error => Err(FrameError::Remote(
            String::from_utf8_lossy(&frame.payload).into_owned(),
        )),
        other => Err(FrameError::InvalidMessageType(other as u16)),
    }
}

/// One request/response exchange over a writer/reader pair.
pub async fn request<Req, Resp, W, R>(
    writer: &mut W,
    reader: &mut R,
    request: &Req,
) -> Result<Resp, FrameError>
where
    Req: Message,
    Resp: Message + Default,
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    write_frame(writer, &Frame::request(request)?).await?;
    let response = read_frame(reader).await?;
    match response.message_type {
        MessageType::Response => response.decode(),
        MessageType::Error => Err(FrameError::Remote(
            String::from_utf8_lossy(&response.payload).into_owned(),
        )),
        other => Err(FrameError::InvalidMessageType(other as u16)),
    }
}

/// A QUIC-style (send, recv) stream pair driven through the framed
/// interface.
impl<W: AsyncWrite + Unpin, R: AsyncRead + Unpin> FramedStream<(W, R)> {
    pub async fn read_frame(&mut self) -> Result<Frame, FrameError> {
        read_frame(&mut self.stream.1).await
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), FrameError> {
        write_frame(&mut self.stream.0, frame).await
    }

    /// Read the next stream item, or `None` on `StreamEnd`.
    pub async fn read_stream_item<M: Message + Default>(
        &mut self,
    ) -> Result<Option<M>, FrameError> {
        read_stream_item(&mut self.stream.1).await
    }

    /// Send a request and wait for a single response.
    pub async fn request<Req: Message, Resp: Message + Default>(
        &mut self,
        msg: &Req,
    ) -> Result<Resp, FrameError> {
        request(&mut self.stream.0, &mut self.stream.1, msg).await
    }

    /// Send a response.
    pub async fn respond<Resp: Message>(&mut self, response: &Resp) -> Result<(), FrameError> {
        let frame = Frame::response(response)?;
        self.write_frame(&frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller_proto::GetSchemaRequest;

    #[test]
    fn message_type_round_trip() {
        for &mt in &[
            MessageType::Request,
            MessageType::Response,
            MessageType::StreamData,
            MessageType::StreamEnd,
            MessageType::Error,
        ] {
            assert_eq!(mt, MessageType::try_from(mt as u16).unwrap());
        }
        assert!(MessageType::try_from(99).is_err());
    }

    #[tokio::test]
    async fn frame_round_trip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let frame = Frame::request(&GetSchemaRequest {}).unwrap();
        write_frame(&mut a, &frame).await.unwrap();
        let read = read_frame(&mut b).await.unwrap();
        assert_eq!(read.message_type, MessageType::Request);
        assert_eq!(read.payload, frame.payload);
    }

    #[tokio::test]
    async fn closed_reader_reports_connection_closed() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        match read_frame(&mut b).await {
            Err(FrameError::ConnectionClosed) => {}
            other => panic!("expected ConnectionClosed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buf.put_u16(MessageType::Request as u16);
        let mut reader = std::io::Cursor::new(buf.freeze().to_vec());
        let result = read_frame(&mut reader).await;
        assert!(matches!(result, Err(FrameError::FrameTooLarge(_))));
    }
}
