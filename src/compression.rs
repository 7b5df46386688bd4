//! Streaming compression, decompression and format detection.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex};

use async_compression::tokio::bufread::{
    BzDecoder, BzEncoder, GzipDecoder, GzipEncoder, XzDecoder, XzEncoder, ZstdDecoder,
    ZstdEncoder,
};
use async_compression::Level;
use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio_util::io::StreamReader;

use imgcopy_oci::compression::{
    detect, MAX_MAGIC_LEN, ZSTD_CHUNKED_MANIFEST_CHECKSUM_KEY, ZSTD_CHUNKED_MANIFEST_POSITION_KEY,
};
use imgcopy_oci::{Algorithm, Digest};

use crate::error::{Error, Result};
use crate::types::BlobReader;

/// Annotations produced while compressing, readable once the stream is drained.
pub type SharedAnnotations = Arc<Mutex<BTreeMap<String, String>>>;

/// Peek at the start of `reader` and identify its compression. The returned
/// reader still yields the peeked bytes.
pub async fn detect_compression(mut reader: BlobReader) -> io::Result<(Option<Algorithm>, BlobReader)> {
    let mut header = Vec::with_capacity(MAX_MAGIC_LEN);
    let mut buf = [0u8; MAX_MAGIC_LEN];
    while header.len() < MAX_MAGIC_LEN {
        let n = reader.read(&mut buf[..MAX_MAGIC_LEN - header.len()]).await?;
        if n == 0 {
            break;
        }
        header.extend_from_slice(&buf[..n]);
    }
    let algorithm = detect(&header);
    let rest: BlobReader = Box::pin(io::Cursor::new(header).chain(reader));
    Ok((algorithm, rest))
}

/// Wrap `reader` so it yields the decompressed content.
pub fn decompressor(algorithm: Algorithm, reader: BlobReader) -> BlobReader {
    let input = BufReader::new(reader);
    match algorithm.base_variant() {
        Algorithm::Gzip => {
            let mut d = GzipDecoder::new(input);
            d.multiple_members(true);
            Box::pin(d)
        }
        Algorithm::Bzip2 => {
            let mut d = BzDecoder::new(input);
            d.multiple_members(true);
            Box::pin(d)
        }
        Algorithm::Xz => {
            let mut d = XzDecoder::new(input);
            d.multiple_members(true);
            Box::pin(d)
        }
        Algorithm::Zstd | Algorithm::ZstdChunked => {
            let mut d = ZstdDecoder::new(input);
            d.multiple_members(true);
            Box::pin(d)
        }
    }
}

/// Wrap `reader` so it yields content compressed with `algorithm`.
/// `annotations` receives format metadata (zstd:chunked only) at end of stream.
pub fn compressor(
    algorithm: Algorithm,
    level: Option<i32>,
    reader: BlobReader,
    annotations: SharedAnnotations,
) -> Result<BlobReader> {
    if let Some(l) = level {
        if !algorithm.level_range().contains(&l) {
            return Err(Error::Config(format!(
                "compression level {} is out of range {:?} for {}",
                l,
                algorithm.level_range(),
                algorithm
            )));
        }
    }
    let quality = level.map(Level::Precise).unwrap_or(Level::Default);
    let input = BufReader::new(reader);
    Ok(match algorithm {
        Algorithm::Gzip => Box::pin(GzipEncoder::with_quality(input, quality)),
        Algorithm::Bzip2 => Box::pin(BzEncoder::with_quality(input, quality)),
        Algorithm::Xz => Box::pin(XzEncoder::with_quality(input, quality)),
        Algorithm::Zstd => Box::pin(ZstdEncoder::with_quality(input, quality)),
        Algorithm::ZstdChunked => chunked_compressor(input, level.unwrap_or(3), annotations),
    })
}

// ---------------------------------------------------------------------------
// zstd:chunked
// ---------------------------------------------------------------------------

/// Plaintext bytes per independently decompressible frame.
const CHUNK_SIZE: usize = 1024 * 1024;
const SKIPPABLE_FRAME_MAGIC: u32 = 0x184D_2A50;
/// Position annotation type tag for a JSON table of contents.
const TOC_TYPE_JSON: u32 = 1;

#[derive(Serialize)]
struct TocEntry {
    offset: u64,
    length: u64,
    #[serde(rename = "uncompressedOffset")]
    uncompressed_offset: u64,
    #[serde(rename = "uncompressedSize")]
    uncompressed_size: u64,
    digest: String,
}

#[derive(Serialize)]
struct Toc {
    version: u32,
    entries: Vec<TocEntry>,
}

struct ChunkState<R> {
    input: R,
    level: i32,
    compressed_offset: u64,
    uncompressed_offset: u64,
    entries: Vec<TocEntry>,
    annotations: SharedAnnotations,
    finished: bool,
}

/// Compress `input` as a series of zstd frames followed by a table of
/// contents in a skippable frame. Ordinary zstd decoders see only the data.
fn chunked_compressor<R>(input: R, level: i32, annotations: SharedAnnotations) -> BlobReader
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let state = ChunkState {
        input,
        level,
        compressed_offset: 0,
        uncompressed_offset: 0,
        entries: Vec::new(),
        annotations,
        finished: false,
    };
    let stream = futures_util::stream::try_unfold(state, |mut st| async move {
        if st.finished {
            return Ok(None);
        }
        let mut chunk = Vec::with_capacity(CHUNK_SIZE);
        (&mut st.input)
            .take(CHUNK_SIZE as u64)
            .read_to_end(&mut chunk)
            .await?;
        if !chunk.is_empty() {
            let uncompressed_size = chunk.len() as u64;
            let digest = Digest::from_bytes(&chunk).to_string();
            let frame = compress_frame(chunk, st.level).await?;
            st.entries.push(TocEntry {
                offset: st.compressed_offset,
                length: frame.len() as u64,
                uncompressed_offset: st.uncompressed_offset,
                uncompressed_size,
                digest,
            });
            st.compressed_offset += frame.len() as u64;
            st.uncompressed_offset += uncompressed_size;
            return Ok(Some((Bytes::from(frame), st)));
        }

        let toc = serde_json::to_vec(&Toc {
            version: 1,
            entries: std::mem::take(&mut st.entries),
        })?;
        let toc_len = toc.len();
        let payload = compress_frame(toc, st.level).await?;
        let payload_len = u32::try_from(payload.len())
            .map_err(|_| io::Error::other("zstd:chunked table of contents is too large"))?;
        let mut frame = Vec::with_capacity(payload.len() + 8);
        frame.extend_from_slice(&SKIPPABLE_FRAME_MAGIC.to_le_bytes());
        frame.extend_from_slice(&payload_len.to_le_bytes());
        frame.extend_from_slice(&payload);

        let mut a = st.annotations.lock().unwrap_or_else(|p| p.into_inner());
        a.insert(
            ZSTD_CHUNKED_MANIFEST_CHECKSUM_KEY.to_string(),
            Digest::from_bytes(&payload).to_string(),
        );
        a.insert(
            ZSTD_CHUNKED_MANIFEST_POSITION_KEY.to_string(),
            format!(
                "{}:{}:{}:{}",
                st.compressed_offset + 8,
                payload.len(),
                toc_len,
                TOC_TYPE_JSON
            ),
        );
        drop(a);
        st.finished = true;
        Ok::<_, io::Error>(Some((Bytes::from(frame), st)))
    });
    Box::pin(StreamReader::new(stream))
}

/// Compress one whole zstd frame on the blocking pool.
async fn compress_frame(data: Vec<u8>, level: i32) -> io::Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || zstd::bulk::compress(&data, level))
        .await
        .map_err(io::Error::other)?
}
