//! Small versioned binary framing shared by every on-disk artifact in this
//! crate: magic + format version + one length-prefixed section (§9 — used
//! in place of a pickled graph). Each artifact picks its own magic so a
//! `load` on the wrong file fails fast instead of silently misparsing.

use std::io::{Read, Write};

pub fn write_framed<W: Write>(w: &mut W, magic: &[u8; 4], version: u32, bytes: &[u8]) -> std::io::Result<()> {
    w.write_all(magic)?;
    w.write_all(&version.to_le_bytes())?;
    w.write_all(&(bytes.len() as u64).to_le_bytes())?;
    w.write_all(bytes)
}

pub fn read_framed<R: Read>(r: &mut R, expected_magic: &[u8; 4]) -> std::io::Result<Vec<u8>> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if &magic != expected_magic {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("bad magic: expected {expected_magic:?}, found {magic:?}"),
        ));
    }
    let mut version = [0u8; 4];
    r.read_exact(&mut version)?;
    let mut len_buf = [0u8; 8];
    r.read_exact(&mut len_buf)?;
    let len = u64::from_le_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut buf = Vec::new();
        write_framed(&mut buf, b"TEST", 1, b"hello").unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let out = read_framed(&mut cursor, b"TEST").unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn bad_magic_rejected() {
        let mut buf = Vec::new();
        write_framed(&mut buf, b"TEST", 1, b"hello").unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_framed(&mut cursor, b"NOPE").unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
