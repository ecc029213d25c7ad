//! Transport-stream decompression.
//!
//! With `zlib-stream` negotiated, the server shares one zlib context across
//! the whole connection and marks each logical payload with a Z_SYNC_FLUSH
//! suffix. Chunks are buffered until the suffix arrives, then inflated
//! through the shared context. `zstd-stream` is declared in the config
//! surface but has no decoder; every decode fails explicitly instead of
//! passing raw bytes through.

use crate::config::Compression;
use crate::error::Error;
use flate2::{Decompress, FlushDecompress, Status};

/// Marks the end of one logical payload in a zlib stream.
const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

const OUTPUT_CHUNK: usize = 16 * 1024;

/// Per-connection inbound decompressor.
#[derive(Debug)]
pub(crate) enum Decompressor {
    /// No compression negotiated; frames pass through
    Passthrough,
    /// Shared zlib stream
    Zlib {
        inflater: Decompress,
        buffer: Vec<u8>,
    },
    /// Negotiated but unsupported
    Zstd,
}

impl Decompressor {
    pub(crate) fn new(scheme: Option<Compression>) -> Self {
        match scheme {
            None => Decompressor::Passthrough,
            Some(Compression::ZlibStream) => Decompressor::Zlib {
                inflater: Decompress::new(true),
                buffer: Vec::new(),
            },
            Some(Compression::ZstdStream) => Decompressor::Zstd,
        }
    }

    /// Feed one transport frame.
    ///
    /// Returns `Ok(Some(bytes))` when a complete payload is available,
    /// `Ok(None)` when the frame was buffered as part of a larger payload.
    pub(crate) fn decompress(&mut self, data: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        match self {
            Decompressor::Passthrough => Ok(Some(data.to_vec())),
            Decompressor::Zstd => Err(Error::CompressionUnsupported("zstd-stream")),
            Decompressor::Zlib { inflater, buffer } => {
                buffer.extend_from_slice(data);
                if !buffer.ends_with(&ZLIB_SUFFIX) {
                    return Ok(None);
                }

                let mut output = Vec::with_capacity(buffer.len().max(OUTPUT_CHUNK));
                let mut read = 0usize;
                loop {
                    if output.len() == output.capacity() {
                        output.reserve(OUTPUT_CHUNK);
                    }
                    let in_before = inflater.total_in();
                    let out_before = inflater.total_out();
                    let status = inflater
                        .decompress_vec(&buffer[read..], &mut output, FlushDecompress::Sync)
                        .map_err(|e| Error::Decompression(e.to_string()))?;
                    read += (inflater.total_in() - in_before) as usize;
                    let produced = inflater.total_out() != out_before;
                    match status {
                        Status::StreamEnd => break,
                        Status::Ok | Status::BufError => {
                            // Done once the input is consumed and the
                            // inflater has drained its pending output.
                            if read >= buffer.len() && !produced {
                                break;
                            }
                            if !produced
                                && inflater.total_in() == in_before
                                && output.len() < output.capacity()
                            {
                                return Err(Error::Decompression(
                                    "inflater made no progress".to_string(),
                                ));
                            }
                        }
                    }
                }
                buffer.clear();
                Ok(Some(output))
            }
        }
    }
}
