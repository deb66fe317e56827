use std::io::{self, Read, Write};

use isohost_contracts::MAX_FRAME_LEN;

/// Fills `buf` completely. Returns `Ok(false)` on a clean EOF before the first byte.
fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    let mut off = 0usize;
    while off < buf.len() {
        let n = match reader.read(&mut buf[off..]) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if n == 0 {
            if off == 0 {
                return Ok(false);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "unexpected EOF inside frame header",
            ));
        }
        off += n;
    }
    Ok(true)
}

/// Reads one `id | len | payload` frame; `None` when the peer closed between frames.
pub(crate) fn read_frame(reader: &mut impl Read) -> io::Result<Option<(u32, Vec<u8>)>> {
    let mut hdr = [0u8; 8];
    if !read_exact_or_eof(reader, &mut hdr)? {
        return Ok(None);
    }
    let id = u32::from_le_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
    let len_u32 = u32::from_le_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]);
    let len = usize::try_from(len_u32).unwrap_or(usize::MAX);
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} bytes"),
        ));
    }

    let mut payload = vec![0u8; len];
    if len != 0 {
        reader.read_exact(&mut payload)?;
    }
    Ok(Some((id, payload)))
}

pub(crate) fn write_frame(writer: &mut impl Write, id: u32, payload: &[u8]) -> io::Result<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame too large: {} bytes", payload.len()),
        ));
    }
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame length overflows u32"))?;
    let mut buf = Vec::with_capacity(8 + payload.len());
    buf.extend_from_slice(&id.to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(payload);
    writer.write_all(&buf)?;
    writer.flush()
}
