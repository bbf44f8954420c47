//! Capability shared by every serializable unit of collected data.

use rusqlite::Connection;

use crate::codec::{CodecError, Reader};
use crate::report::{ElementType, Status};

/// Linkage of one report element to the relational store.
#[derive(Debug, Clone, Copy)]
pub struct ReportRow<'a> {
    pub report_id: &'a str,
    pub run_id: &'a str,
    /// Position inside its section, preserves element order.
    pub seq: usize,
    pub status: Status,
}

/// A collected or diffed entity with a fixed binary layout.
pub trait Collectible: Sized {
    const ELEMENT_TYPE: ElementType;

    fn encode(&self, out: &mut Vec<u8>) -> Result<(), CodecError>;

    fn decode(reader: &mut Reader<'_>) -> Result<Self, CodecError>;

    /// Key used to correlate the same entity across two snapshots.
    fn identity_key(&self) -> u64;

    /// Writes the report linkage row for this entity.
    fn export_report_db(&self, conn: &Connection, row: &ReportRow<'_>) -> rusqlite::Result<()>;

    fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        self.encode(&mut out)?;
        Ok(out)
    }

    /// Decodes one value and returns it with the bytes that follow it.
    fn from_bytes(data: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let mut reader = Reader::new(data);
        let value = Self::decode(&mut reader)?;
        Ok((value, reader.remaining()))
    }
}
