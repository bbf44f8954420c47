//! 128-bit digests used for metadata and content fingerprints.

use std::fmt;
use std::io::{self, Read};

use serde::{Serialize, Serializer};
/// BLAKE3 digest truncated to its first 128 bits.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 16]);

impl Digest {
    pub const LEN: usize = 16;

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Digest of a single buffer.
    pub fn of(data: &[u8]) -> Self {
        let mut builder = DigestBuilder::new();
        builder.update(data);
        builder.finish()
    }

    /// Digest of everything readable from `reader`, streamed in 64 KiB chunks.
    pub fn of_reader(mut reader: impl Read) -> io::Result<Self> {
        let mut builder = DigestBuilder::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            builder.update(&buf[..n]);
        }
        Ok(builder.finish())
    }

    /// Fingerprint binding a filesystem entry's path to its POSIX metadata.
    ///
    /// The path bytes are fed first, then the decimal text of each field.
    pub fn metadata(path: &str, mode: u32, inode: u64, uid: u32, gid: u32, size: u64) -> Self {
        let mut builder = DigestBuilder::new();
        builder.update(path.as_bytes());
        builder.update(mode.to_string().as_bytes());
        builder.update(inode.to_string().as_bytes());
        builder.update(uid.to_string().as_bytes());
        builder.update(gid.to_string().as_bytes());
        builder.update(size.to_string().as_bytes());
        builder.finish()
    }

    /// Parses the 32-character hex form produced by `Display`.
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 2 * Self::LEN || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let mut bytes = [0u8; 16];
        for (byte, pair) in bytes.iter_mut().zip(hex.as_bytes().chunks_exact(2)) {
            let pair = std::str::from_utf8(pair).ok()?;
            *byte = u8::from_str_radix(pair, 16).ok()?;
        }
        Some(Self(bytes))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Incremental digest over several chunks.
pub struct DigestBuilder {
    hasher: blake3::Hasher,
}

impl DigestBuilder {
    pub fn new() -> Self {
        Self {
            hasher: blake3::Hasher::new(),
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    pub fn finish(&self) -> Digest {
        let mut out = [0u8; Digest::LEN];
        self.hasher.finalize_xof().fill(&mut out);
        Digest(out)
    }
}

impl Default for DigestBuilder {
    fn default() -> Self {
        Self::new()
    }
}
