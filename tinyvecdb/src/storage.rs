//! Record region layout
//!
//! After the 8-byte header the file holds `vector_count` tightly packed
//! records:
//!
//! ```text
//! 4               id (u32, little-endian)
//! 4 * dimensions  vector (f32, little-endian, L2-normalized)
//! 4               metadata_length (u32, little-endian; 0 allowed)
//! metadata_length metadata (UTF-8 JSON; null is stored as "null")
//! ```
//!
//! Records are variable length, so scans are sequential; byte spans
//! recorded during a scan allow metadata to be re-read afterwards.

use std::borrow::Cow;
use std::io::{self, Write};

use serde_json::Value;

use crate::errors::{Result, TinyVecError};
use crate::io::{FileHeader, HEADER_SIZE};

/// A record borrowed from a mapped file image.
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    pub id: u32,
    vector_bytes: &'a [u8],
    pub metadata: &'a [u8],
    /// Absolute byte range of the metadata within the file image.
    pub metadata_span: (usize, usize),
}

impl<'a> RecordView<'a> {
    /// Decode the vector into `out`, which must be `dimensions` long.
    pub fn read_vector_into(&self, out: &mut [f32]) {
        debug_assert_eq!(out.len() * 4, self.vector_bytes.len());
        vector_from_bytes(out, self.vector_bytes);
    }

    /// Borrow the vector when the mapped bytes happen to be 4-byte aligned,
    /// otherwise decode a copy.
    pub fn vector(&self) -> Cow<'a, [f32]> {
        #[cfg(target_endian = "little")]
        if let Ok(slice) = bytemuck::try_cast_slice::<u8, f32>(self.vector_bytes) {
            return Cow::Borrowed(slice);
        }
        let mut out = vec![0.0f32; self.vector_bytes.len() / 4];
        vector_from_bytes(&mut out, self.vector_bytes);
        Cow::Owned(out)
    }

    pub(crate) fn raw_vector_bytes(&self) -> &'a [u8] {
        self.vector_bytes
    }
}

/// Iterator over the record region of a file image.
pub struct Records<'a> {
    image: &'a [u8],
    offset: usize,
    dims: usize,
    remaining: u32,
}

/// Iterate the records of a complete file image (header included).
pub fn records(image: &[u8], header: FileHeader) -> Records<'_> {
    Records {
        image,
        offset: HEADER_SIZE,
        dims: header.dimensions as usize,
        remaining: header.vector_count,
    }
}

impl<'a> Records<'a> {
    fn truncated(&mut self) -> Option<<Self as Iterator>::Item> {
        self.remaining = 0;
        Some(Err(TinyVecError::HeaderCorrupt(format!(
            "record region truncated at byte {}",
            self.offset
        ))))
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<RecordView<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let vector_len = self.dims * 4;
        let fixed_end = self.offset + 4 + vector_len + 4;
        if fixed_end > self.image.len() {
            return self.truncated();
        }

        let id = read_u32_le(self.image, self.offset);
        let vector_bytes = &self.image[self.offset + 4..self.offset + 4 + vector_len];
        let metadata_len = read_u32_le(self.image, self.offset + 4 + vector_len) as usize;

        let metadata_start = fixed_end;
        let metadata_end = metadata_start + metadata_len;
        if metadata_end > self.image.len() {
            return self.truncated();
        }

        self.offset = metadata_end;
        Some(Ok(RecordView {
            id,
            vector_bytes,
            metadata: &self.image[metadata_start..metadata_end],
            metadata_span: (metadata_start, metadata_end),
        }))
    }
}

fn read_u32_le(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

#[cfg(target_endian = "little")]
fn vector_from_bytes(out: &mut [f32], bytes: &[u8]) {
    bytemuck::cast_slice_mut::<f32, u8>(out).copy_from_slice(bytes);
}

#[cfg(target_endian = "big")]
fn vector_from_bytes(out: &mut [f32], bytes: &[u8]) {
    for (dst, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
        *dst = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
}

#[cfg(target_endian = "little")]
fn write_vector<W: Write>(out: &mut W, vector: &[f32]) -> io::Result<()> {
    out.write_all(bytemuck::cast_slice(vector))
}

#[cfg(target_endian = "big")]
fn write_vector<W: Write>(out: &mut W, vector: &[f32]) -> io::Result<()> {
    let mut buf = Vec::with_capacity(vector.len() * 4);
    for x in vector {
        buf.extend_from_slice(&x.to_le_bytes());
    }
    out.write_all(&buf)
}

/// Serializes records onto any writer, typically a temp-swap target.
pub struct RecordWriter<W: Write> {
    out: W,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn write_record(&mut self, id: u32, vector: &[f32], metadata: &[u8]) -> io::Result<()> {
        self.out.write_all(&id.to_le_bytes())?;
        write_vector(&mut self.out, vector)?;
        self.out.write_all(&(metadata.len() as u32).to_le_bytes())?;
        self.out.write_all(metadata)
    }

    /// Pass a record through unchanged, without decoding the vector.
    pub fn copy_record(&mut self, record: &RecordView<'_>) -> io::Result<()> {
        self.out.write_all(&record.id.to_le_bytes())?;
        self.out.write_all(record.raw_vector_bytes())?;
        self.out
            .write_all(&(record.metadata.len() as u32).to_le_bytes())?;
        self.out.write_all(record.metadata)
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Decode stored metadata bytes. Zero length decodes as JSON null; bytes
/// that fail to parse also surface as null rather than poisoning the scan.
pub fn decode_metadata(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    match serde_json::from_slice(bytes) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, "undecodable metadata, substituting null");
            Value::Null
        }
    }
}

/// Encode metadata as compact UTF-8 JSON (`null` for `Value::Null`).
pub fn encode_metadata(value: &Value) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| TinyVecError::Serialization(e.to_string()))
}
