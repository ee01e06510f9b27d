//! Length-prefixed framing: 4-byte big-endian length + payload.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FrameError;

/// Largest payload either side may declare (1 MiB).
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

const HEADER_LEN: usize = 4;
const READ_CHUNK: usize = 8 * 1024;

/// Prefix `payload` with its length.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, FrameError> {
    if payload.is_empty() {
        return Err(FrameError::Empty);
    }
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge {
            len: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }
    let mut framed = BytesMut::with_capacity(HEADER_LEN + payload.len());
    framed.put_u32(payload.len() as u32);
    framed.extend_from_slice(payload);
    Ok(framed.freeze())
}

/// Reassembles frames from arbitrarily split reads.
///
/// A declared length above the cap (or a zero length) is a protocol
/// violation: the buffer is discarded and the error must close the stream.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_len: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_len(MAX_FRAME_LEN)
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_len,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Pop the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }

        let declared = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;

        if declared > self.max_len {
            self.buffer.clear();
            return Err(FrameError::TooLarge {
                len: declared,
                max: self.max_len,
            });
        }
        if declared == 0 {
            self.buffer.clear();
            return Err(FrameError::Empty);
        }

        let total = HEADER_LEN + declared;
        if self.buffer.len() < total {
            self.buffer.reserve(total - self.buffer.len());
            return Ok(None);
        }

        self.buffer.advance(HEADER_LEN);
        Ok(Some(self.buffer.split_to(declared).freeze()))
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

/// Write half of a framed stream.
pub struct FramedWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FramedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write one frame and wait until it has been flushed to the stream.
    ///
    /// Fails if the peer has gone away before the data drained.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        let frame = encode_frame(payload)?;
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Read frames until EOF, dispatching each complete one in arrival order.
///
/// Returns `Ok(())` on a clean EOF and the first error otherwise. Either way
/// the caller owns closing the connection; buffered bytes are discarded.
pub async fn read_frames<R, F>(mut reader: R, mut on_message: F) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
    F: FnMut(Bytes) -> Result<(), FrameError>,
{
    let mut decoder = FrameDecoder::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            if decoder.buffered_len() > 0 {
                tracing::debug!(
                    buffered = decoder.buffered_len(),
                    "Stream closed with a partial frame buffered"
                );
            }
            return Ok(());
        }
        decoder.push(&chunk[..read]);
        while let Some(frame) = decoder.next_frame()? {
            on_message(frame)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(len: u32) -> [u8; 4] {
        len.to_be_bytes()
    }

    #[test]
    fn encode_prefixes_big_endian_length() {
        let framed = encode_frame(b"hello").unwrap();
        assert_eq!(&framed[..4], &[0, 0, 0, 5]);
        assert_eq!(&framed[4..], b"hello");
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let payload = vec![b'x'; MAX_FRAME_LEN + 1];
        assert!(matches!(
            encode_frame(&payload),
            Err(FrameError::TooLarge { .. })
        ));
    }

    #[test]
    fn reassembles_split_reads() {
        let framed = encode_frame(br#"{"id":1}"#).unwrap();
        let mut decoder = FrameDecoder::new();

        decoder.push(&framed[..2]);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.push(&framed[2..6]);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.push(&framed[6..]);

        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(&frame[..], br#"{"id":1}"#);
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn yields_multiple_frames_from_one_read_in_order() {
        let mut bytes = Vec::new();
        for body in [&b"one"[..], b"two", b"three"] {
            bytes.extend_from_slice(&encode_frame(body).unwrap());
        }
        bytes.extend_from_slice(&header(10));
        bytes.extend_from_slice(b"part");

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);

        let mut seen = Vec::new();
        while let Some(frame) = decoder.next_frame().unwrap() {
            seen.push(String::from_utf8(frame.to_vec()).unwrap());
        }
        assert_eq!(seen, vec!["one", "two", "three"]);
        assert_eq!(decoder.buffered_len(), 4 + 4);
    }

    #[test]
    fn oversized_declaration_discards_buffer() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&header(MAX_FRAME_LEN as u32 + 1));
        decoder.push(b"garbage");

        assert!(matches!(
            decoder.next_frame(),
            Err(FrameError::TooLarge { len, .. }) if len == MAX_FRAME_LEN + 1
        ));
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn zero_length_frame_is_a_violation() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&header(0));
        assert!(matches!(decoder.next_frame(), Err(FrameError::Empty)));
    }

    #[tokio::test]
    async fn read_frames_stops_on_oversized_frame_without_dispatch() {
        let (mut client, server) = tokio::io::duplex(64);
        client
            .write_all(&header(MAX_FRAME_LEN as u32 + 1))
            .await
            .unwrap();
        client.write_all(b"trailing").await.unwrap();

        let mut dispatched = 0;
        let result = read_frames(server, |_frame| {
            dispatched += 1;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(FrameError::TooLarge { .. })));
        assert_eq!(dispatched, 0);
    }

    #[tokio::test]
    async fn framed_writer_fails_once_peer_is_gone() {
        let (client, server) = tokio::io::duplex(16);
        drop(server);
        let mut writer = FramedWriter::new(client);
        assert!(matches!(
            writer.send(b"hello").await,
            Err(FrameError::Io(_))
        ));
    }
}
