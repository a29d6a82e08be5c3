//! Hex dump formatting for trace-level frame logging.

use std::fmt;

/// Lazily formatted hex dump: `offset  16 hex bytes  |ascii|` per line.
/// Nothing is formatted unless the log event is actually emitted.
pub struct HexDump<'a>(pub &'a [u8]);

impl fmt::Display for HexDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, chunk) in self.0.chunks(16).enumerate() {
            write!(f, "{:08x}  ", i * 16)?;
            for j in 0..16 {
                match chunk.get(j) {
                    Some(byte) => write!(f, "{:02x} ", byte)?,
                    None => write!(f, "   ")?,
                }
                if j == 7 {
                    write!(f, " ")?;
                }
            }
            write!(f, " |")?;
            for &byte in chunk {
                let ch = if (32..127).contains(&byte) { byte as char } else { '.' };
                write!(f, "{}", ch)?;
            }
            writeln!(f, "|")?;
        }
        Ok(())
    }
}
