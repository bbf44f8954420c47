//! Snapshot file framing and atomic file writes.
//!
//! A snapshot file is a sequence of `[tag][varint(len)][payload]` blocks,
//! one per collector of the run.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use crate::codec::{CodecError, Reader, put_block};
use crate::collector::{Collector, CollectorKind};

/// Frames the results of finished collectors.
pub fn encode_snapshot<'a>(
    collectors: impl IntoIterator<Item = &'a dyn Collector>,
) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    for collector in collectors {
        out.push(collector.kind().tag());
        put_block(&mut out, collector.result())?;
    }
    Ok(out)
}

/// Splits a snapshot file into per-collector payloads.
pub fn decode_blocks(data: &[u8]) -> Result<Vec<(CollectorKind, &[u8])>, CodecError> {
    let mut reader = Reader::new(data);
    let mut blocks: Vec<(CollectorKind, &[u8])> = Vec::new();
    while !reader.is_empty() {
        let kind = CollectorKind::from_tag(reader.u8()?)?;
        if blocks.iter().any(|(k, _)| *k == kind) {
            return Err(CodecError::Invalid(format!("{kind} block appears twice")));
        }
        let len = reader.count()?;
        blocks.push((kind, reader.bytes(len)?));
    }
    Ok(blocks)
}

/// Writes `bytes` to `path` through a `.tmp` sibling and a rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(tmp_path, path)
}
