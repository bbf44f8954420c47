//! Variable-length unsigned integer encoding.
//!
//! The three high bits of the first byte hold the number of bytes that follow
//! (0 to 7). The value is the five low bits of the first byte followed by the
//! trailing bytes in big-endian order. Encoders always pick the shortest form.
//!
//! ```text
//!        14  ->  0e
//!        65  ->  20 41
//!      1000  ->  23 e8
//!     16877  ->  40 41 ed
//! ```

use super::CodecError;

/// Largest value representable: 5 + 7 * 8 = 61 payload bits.
pub const MAX_VALUE: u64 = (1 << 61) - 1;

/// Number of bytes following the first one for `value`.
fn extra_bytes(value: u64) -> usize {
    let mut n = 0;
    while n < 7 && value >= 1u64 << (5 + 8 * n) {
        n += 1;
    }
    n
}

/// Appends the encoding of `value` to `out`.
pub fn write(value: u64, out: &mut Vec<u8>) -> Result<(), CodecError> {
    if value > MAX_VALUE {
        return Err(CodecError::VarIntOverflow(value));
    }
    let n = extra_bytes(value);
    let head = ((n as u8) << 5) | ((value >> (8 * n)) as u8 & 0x1f);
    out.push(head);
    for i in (0..n).rev() {
        out.push((value >> (8 * i)) as u8);
    }
    Ok(())
}

/// Decodes one value from the front of `input`.
///
/// Returns the value and the number of bytes consumed.
pub fn read(input: &[u8]) -> Result<(u64, usize), CodecError> {
    let Some(&head) = input.first() else {
        return Err(CodecError::Truncated {
            needed: 1,
            available: 0,
        });
    };
    let n = (head >> 5) as usize;
    if input.len() < n + 1 {
        return Err(CodecError::Truncated {
            needed: n + 1,
            available: input.len(),
        });
    }
    let mut value = u64::from(head & 0x1f);
    for &byte in &input[1..=n] {
        value = (value << 8) | u64::from(byte);
    }
    Ok((value, n + 1))
}
