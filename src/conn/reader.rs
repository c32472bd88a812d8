//! Frame reader over a (possibly compressed) byte stream.
//!
//! Frames are extracted one at a time so that bytes following a frame stay
//! raw until the caller asks for them; the stream may switch to deflate
//! right after the IDENTIFY response.

use tokio::io::{AsyncRead, AsyncReadExt};

use super::compress::Inflater;
use crate::error::Result;
use crate::protocol::{Frame, FrameBuffer};

const READ_CHUNK: usize = 16 * 1024;

pub(crate) struct FrameReader {
    buffer: FrameBuffer,
    inflater: Option<Inflater>,
    chunk: Vec<u8>,
    inflated: Vec<u8>,
}

impl FrameReader {
    pub(crate) fn new() -> Self {
        Self {
            buffer: FrameBuffer::new(),
            inflater: None,
            chunk: vec![0u8; READ_CHUNK],
            inflated: Vec::new(),
        }
    }

    /// Next frame, or `None` at end of stream.
    pub(crate) async fn read_frame<R>(&mut self, reader: &mut R) -> Result<Option<Frame>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        loop {
            if let Some(frame) = self.buffer.next_frame()? {
                return Ok(Some(frame));
            }
            let n = reader.read(&mut self.chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            match &mut self.inflater {
                Some(inflater) => {
                    self.inflated.clear();
                    inflater.inflate(&self.chunk[..n], &mut self.inflated)?;
                    self.buffer.extend(&self.inflated);
                }
                None => self.buffer.extend(&self.chunk[..n]),
            }
        }
    }

    /// Whether unread bytes are buffered.
    pub(crate) fn has_buffered(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Treat everything from the next unread byte on as deflate-compressed.
    pub(crate) fn enable_deflate(&mut self) -> Result<()> {
        let mut inflater = Inflater::new();
        let leftover = self.buffer.take_remaining();
        if !leftover.is_empty() {
            self.inflated.clear();
            inflater.inflate(&leftover, &mut self.inflated)?;
            self.buffer.extend(&self.inflated);
        }
        self.inflater = Some(inflater);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::compress::Deflater;
    use crate::protocol::{encode_frame, FrameType};
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_reads_frames_across_writes() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new();

        let mut bytes = encode_frame(FrameType::Response, b"OK");
        bytes.extend(encode_frame(FrameType::Response, b"_heartbeat_"));
        server.write_all(&bytes).await.unwrap();
        drop(server);

        assert!(reader.read_frame(&mut client).await.unwrap().unwrap().is_ok());
        assert!(reader.read_frame(&mut client).await.unwrap().unwrap().is_heartbeat());
        assert!(reader.read_frame(&mut client).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_switch_to_deflate_mid_buffer() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let mut reader = FrameReader::new();
        let mut deflater = Deflater::new(6);

        // plain identify response followed immediately by a compressed OK
        let mut bytes = encode_frame(FrameType::Response, b"{}");
        bytes.extend(deflater.deflate(&[&encode_frame(FrameType::Response, b"OK")]).unwrap());
        server.write_all(&bytes).await.unwrap();

        let first = reader.read_frame(&mut client).await.unwrap().unwrap();
        assert_eq!(first.payload(), b"{}");
        reader.enable_deflate().unwrap();

        let second = reader.read_frame(&mut client).await.unwrap().unwrap();
        assert!(second.is_ok());

        let later = deflater.deflate(&[&encode_frame(FrameType::Response, b"CLOSE_WAIT")]).unwrap();
        server.write_all(&later).await.unwrap();
        assert!(reader.read_frame(&mut client).await.unwrap().unwrap().is_close_wait());
    }
}
