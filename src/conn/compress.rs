//! Raw deflate stream compression.
//!
//! Both directions are one continuous deflate stream without zlib headers.
//! The writer sync-flushes after every batch so the server can decode each
//! batch as soon as it arrives.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{NsqError, Result};

const SCRATCH_SIZE: usize = 16 * 1024;

/// Compressing half of a deflate stream.
pub(crate) struct Deflater {
    inner: Compress,
}

impl Deflater {
    pub(crate) fn new(level: u32) -> Self {
        Self {
            inner: Compress::new(Compression::new(level), false),
        }
    }

    /// Compress `chunks` and sync-flush, returning the bytes to write.
    pub(crate) fn deflate(&mut self, chunks: &[&[u8]]) -> Result<Vec<u8>> {
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        let mut out = Vec::with_capacity(total / 2 + 64);
        for chunk in chunks {
            self.compress(chunk, &mut out, FlushCompress::None)?;
        }
        self.compress(&[], &mut out, FlushCompress::Sync)?;
        Ok(out)
    }

    fn compress(&mut self, mut input: &[u8], out: &mut Vec<u8>, flush: FlushCompress) -> Result<()> {
        loop {
            if out.capacity() - out.len() < 64 {
                out.reserve(out.capacity().max(1024));
            }
            let before_in = self.inner.total_in();
            let before_out = self.inner.total_out();
            self.inner
                .compress_vec(input, out, flush)
                .map_err(|e| NsqError::Protocol(format!("deflate: {}", e)))?;
            let consumed = (self.inner.total_in() - before_in) as usize;
            let produced = self.inner.total_out() - before_out;
            input = &input[consumed..];

            // zlib is done once it stops short of filling the output
            if input.is_empty() && out.len() < out.capacity() {
                return Ok(());
            }
            if consumed == 0 && produced == 0 && out.len() < out.capacity() {
                return Ok(());
            }
        }
    }
}

/// Decompressing half of a deflate stream.
pub(crate) struct Inflater {
    inner: Decompress,
    scratch: Vec<u8>,
}

impl Inflater {
    pub(crate) fn new() -> Self {
        Self {
            inner: Decompress::new(false),
            scratch: vec![0u8; SCRATCH_SIZE],
        }
    }

    /// Decompress `input`, appending whatever output is available to `out`.
    pub(crate) fn inflate(&mut self, mut input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        loop {
            let before_in = self.inner.total_in();
            let before_out = self.inner.total_out();
            let status = self
                .inner
                .decompress(input, &mut self.scratch, FlushDecompress::Sync)
                .map_err(|e| NsqError::Protocol(format!("inflate: {}", e)))?;
            let consumed = (self.inner.total_in() - before_in) as usize;
            let produced = (self.inner.total_out() - before_out) as usize;
            out.extend_from_slice(&self.scratch[..produced]);
            input = &input[consumed..];

            if status == Status::StreamEnd {
                return Err(NsqError::Protocol("deflate stream ended".to_string()));
            }
            if input.is_empty() && produced < self.scratch.len() {
                return Ok(());
            }
            if consumed == 0 && produced == 0 {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batches_decode_independently() {
        let mut deflater = Deflater::new(6);
        let mut inflater = Inflater::new();

        let first = deflater.deflate(&[b"RDY 1\n", b"FIN 0123456789abcdef\n"]).unwrap();
        let mut out = Vec::new();
        inflater.inflate(&first, &mut out).unwrap();
        assert_eq!(&out[..], b"RDY 1\nFIN 0123456789abcdef\n");

        let second = deflater.deflate(&[b"NOP\n"]).unwrap();
        out.clear();
        inflater.inflate(&second, &mut out).unwrap();
        assert_eq!(&out[..], b"NOP\n");
    }

    #[test]
    fn test_split_input() {
        let mut deflater = Deflater::new(1);
        let mut inflater = Inflater::new();

        let body: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let compressed = deflater.deflate(&[&body]).unwrap();

        let mut out = Vec::new();
        for chunk in compressed.chunks(7) {
            inflater.inflate(chunk, &mut out).unwrap();
        }
        assert_eq!(out, body);
    }

    #[test]
    fn test_garbage_rejected() {
        let mut inflater = Inflater::new();
        let mut out = Vec::new();
        assert!(inflater.inflate(&[0xff; 32], &mut out).is_err());
    }
}
