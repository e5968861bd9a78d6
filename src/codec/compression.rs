use std::io::{Read, Write};

use anyhow::{anyhow, bail};
use bytes::{Bytes, BytesMut};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::trace;

use crate::codec::constructors::ConstructorId;
use crate::util::buf::{TlBuf, TlBufMut};

/// Wraps a body in `gzip_packed` if it is at least `threshold` bytes long and compression
///  actually makes it smaller. Otherwise the body is returned unchanged.
pub fn maybe_compress(body: Bytes, threshold: usize) -> anyhow::Result<Bytes> {
    if body.len() < threshold {
        return Ok(body);
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&body)?;
    let packed = encoder.finish()?;

    let mut buf = BytesMut::with_capacity(packed.len() + 8);
    buf.put_tl_constructor(ConstructorId::GzipPacked);
    buf.put_tl_bytes(&packed);

    if buf.len() < body.len() {
        trace!("compressed body of {} bytes to {} bytes", body.len(), buf.len());
        Ok(buf.freeze())
    }
    else {
        Ok(body)
    }
}

pub fn is_compressed(body: &[u8]) -> bool {
    ConstructorId::peek_known(body) == Some(ConstructorId::GzipPacked)
}

/// Reverses [maybe_compress]: bodies without the `gzip_packed` marker are returned unchanged.
///  Decompression stops with an error once the output would exceed `max_len`.
pub fn decompress_if_packed(body: Bytes, max_len: usize) -> anyhow::Result<Bytes> {
    if !is_compressed(&body) {
        return Ok(body);
    }

    let mut buf: &[u8] = &body;
    buf.try_get_tl_constructor()?;
    let packed = buf.try_get_tl_bytes()?;

    let mut unpacked = Vec::new();
    GzDecoder::new(packed.as_ref())
        .take(max_len as u64 + 1)
        .read_to_end(&mut unpacked)
        .map_err(|e| anyhow!("corrupt gzip_packed body: {}", e))?;

    if unpacked.len() > max_len {
        bail!("gzip_packed body expands beyond the maximum message size of {} bytes", max_len);
    }
    if is_compressed(&unpacked) {
        bail!("nested gzip_packed body");
    }
    Ok(Bytes::from(unpacked))
}
