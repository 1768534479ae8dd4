//! Scatter-gather message buffer.
//!
//! A 9P message is packed into, or unpacked from, up to [`MAX_IOV`] separate
//! byte segments rather than one contiguous buffer — mirroring the
//! `struct l9p_message` / `struct iovec[L9P_MAX_IOV]` pair the protocol core
//! this crate implements is built around, so a [`Transport`](crate::transport::Transport)
//! can hand over scattered receive buffers without an extra copy.

use crate::error::{Error, ProtoError};
use crate::utils::Result;

/// Maximum number of segments a single message may be scattered across.
pub const MAX_IOV: usize = 8;

/// Whether a cursor is being used to fill segments (`Pack`) or to consume
/// them (`Unpack`).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    Pack,
    Unpack,
}

/// A cursor over a list of byte segments, tracking the current segment index
/// and the byte offset within it.
///
/// Segments are owned (`Vec<u8>`) rather than borrowed `iovec`s: Rust's
/// lifetime rules make a borrowed scatter list awkward to thread through an
/// async dispatcher, so each segment is copied once at the transport
/// boundary and owned from then on, the policy recorded in `DESIGN.md` for
/// the "Twrite data region lifetime" open question.
#[derive(Debug)]
pub struct Cursor {
    mode: Mode,
    segments: Vec<Vec<u8>>,
    seg: usize,
    off: usize,
}

impl Cursor {
    pub fn new(mode: Mode, segments: Vec<Vec<u8>>) -> Result<Cursor> {
        if segments.len() > MAX_IOV {
            return Err(Error::Proto(ProtoError::MalformedMessage(format!(
                "message spans {} segments, max is {}",
                segments.len(),
                MAX_IOV
            ))));
        }
        Ok(Cursor {
            mode,
            segments,
            seg: 0,
            off: 0,
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Total number of bytes remaining from the cursor's current position to
    /// the end of the last segment.
    pub fn remaining(&self) -> usize {
        if self.seg >= self.segments.len() {
            return 0;
        }
        let mut total = self.segments[self.seg].len() - self.off;
        for s in &self.segments[self.seg + 1..] {
            total += s.len();
        }
        total
    }

    /// Advance the cursor by `n` bytes, crossing segment boundaries as
    /// needed. Errors with `ShortBuffer` if `n` exceeds what remains.
    pub fn advance(&mut self, mut n: usize) -> Result<()> {
        if n > self.remaining() {
            return Err(Error::Proto(ProtoError::ShortBuffer));
        }
        while n > 0 {
            let avail = self.segments[self.seg].len() - self.off;
            if n < avail {
                self.off += n;
                n = 0;
            } else {
                n -= avail;
                self.seg += 1;
                self.off = 0;
            }
        }
        Ok(())
    }

    /// Copy up to `buf.len()` bytes from the cursor into `buf`, advancing.
    /// Errors with `ShortBuffer` if fewer bytes remain than requested.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        if buf.len() > self.remaining() {
            return Err(Error::Proto(ProtoError::ShortBuffer));
        }
        let mut written = 0;
        while written < buf.len() {
            let seg = &self.segments[self.seg];
            let avail = seg.len() - self.off;
            let take = (buf.len() - written).min(avail);
            buf[written..written + take].copy_from_slice(&seg[self.off..self.off + take]);
            written += take;
            self.off += take;
            if self.off == seg.len() {
                self.seg += 1;
                self.off = 0;
            }
        }
        Ok(())
    }

    /// Write `buf` into the cursor's segments, allocating room in the
    /// current segment if needed (pack mode only).
    pub fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(self.mode, Mode::Pack);
        if self.seg >= self.segments.len() {
            self.segments.push(Vec::new());
        }
        self.segments[self.seg].extend_from_slice(buf);
        Ok(())
    }

    /// Consume the cursor, returning the underlying segments.
    pub fn into_segments(self) -> Vec<Vec<u8>> {
        self.segments
    }

    /// Flatten the segments into one contiguous buffer.
    pub fn into_flat(self) -> Vec<u8> {
        self.segments.concat()
    }
}

fn to_io_error(e: Error) -> std::io::Error {
    crate::io_err!(Other, e.to_string())
}

/// Lets the wire codec in [`crate::serialize`] pack directly into a
/// [`Cursor`]'s segments: `byteorder`'s `WriteBytesExt` is a blanket impl
/// over any `std::io::Write`, so every `Encoder::write_*` call becomes
/// available on `Cursor` for free once this impl exists.
impl std::io::Write for Cursor {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.write_all(buf).map_err(to_io_error)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Mirror of the `Write` impl above, for the unpack side: `ReadBytesExt`'s
/// blanket impl over `std::io::Read` makes `Decoder::read_*` work on a
/// `Cursor` directly.
impl std::io::Read for Cursor {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = buf.len().min(self.remaining());
        self.read_exact(&mut buf[..n]).map_err(to_io_error)?;
        Ok(n)
    }
}

/// Build a sub-vector of `segments`' flattened bytes starting at byte
/// offset `offset`. Mirrors `l9p_seek_iov`: used when a partially consumed
/// message buffer must be handed onward (e.g. after peeling off the 7-byte
/// `size[4] type[1] tag[2]` header before dispatch).
pub fn seek(segments: &[Vec<u8>], offset: usize) -> Vec<u8> {
    let flat: Vec<u8> = segments.concat();
    if offset >= flat.len() {
        Vec::new()
    } else {
        flat[offset..].to_vec()
    }
}

/// Truncate `buf` to at most `length` bytes. Mirrors `l9p_truncate_iov`:
/// used to clamp a decoded `Twrite`/`Rread` payload to the negotiated
/// `msize` before it is queued.
pub fn truncate(buf: &mut Vec<u8>, length: usize) {
    if buf.len() > length {
        buf.truncate(length);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_crosses_segment_boundary() {
        let mut c = Cursor::new(Mode::Unpack, vec![vec![1, 2, 3], vec![4, 5]]).unwrap();
        assert_eq!(c.remaining(), 5);
        c.advance(4).unwrap();
        assert_eq!(c.remaining(), 1);
        let mut buf = [0u8; 1];
        c.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [5]);
    }

    #[test]
    fn advance_past_end_is_short_buffer() {
        let mut c = Cursor::new(Mode::Unpack, vec![vec![1, 2]]).unwrap();
        assert!(c.advance(3).is_err());
    }

    #[test]
    fn read_exact_spans_segments() {
        let mut c = Cursor::new(Mode::Unpack, vec![vec![1, 2], vec![3, 4, 5]]).unwrap();
        let mut buf = [0u8; 4];
        c.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(c.remaining(), 1);
    }

    #[test]
    fn too_many_segments_rejected() {
        let segs = vec![vec![0u8]; MAX_IOV + 1];
        assert!(Cursor::new(Mode::Unpack, segs).is_err());
    }

    #[test]
    fn cursor_round_trips_through_byteorder() {
        use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

        let mut pack = Cursor::new(Mode::Pack, vec![]).unwrap();
        pack.write_u32::<LittleEndian>(0xdead_beef).unwrap();
        pack.write_u8(7).unwrap();

        let mut unpack = Cursor::new(Mode::Unpack, pack.into_segments()).unwrap();
        assert_eq!(unpack.read_u32::<LittleEndian>().unwrap(), 0xdead_beef);
        assert_eq!(unpack.read_u8().unwrap(), 7);
    }

    #[test]
    fn seek_and_truncate() {
        let segs = vec![vec![1, 2, 3], vec![4, 5]];
        assert_eq!(seek(&segs, 2), vec![3, 4, 5]);
        let mut v = vec![1, 2, 3, 4];
        truncate(&mut v, 2);
        assert_eq!(v, vec![1, 2]);
    }
}
