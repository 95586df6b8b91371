//! Length-prefixed message framing shared by the command channel and the
//! pub/sub broker.
//!
//! # Wire Format
//!
//! ```text
//! ┌────────────────────────────┬──────────────────┐
//! │ Length (4 bytes, BE u32)   │ Body             │
//! └────────────────────────────┴──────────────────┘
//! ```
//!
//! The length is validated before anything is allocated. A clean EOF at a
//! frame boundary is reported as [`WireError::Closed`], so callers can tell a
//! peer hanging up from a broken stream.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame body.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("peer closed the connection")]
    Closed,

    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl WireError {
    /// True for read/write timeouts on a socket with a deadline set.
    pub fn is_timeout(&self) -> bool {
        matches!(self, WireError::Io(e) if is_timeout(e))
    }
}

pub fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

fn check_len(len: usize) -> Result<(), WireError> {
    if len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            len,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(())
}

/// Parses `tcp://host:port` (or a bare `host:port`).
pub fn parse_endpoint(endpoint: &str) -> Result<SocketAddr, WireError> {
    let addr = endpoint.strip_prefix("tcp://").unwrap_or(endpoint);
    addr.to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| WireError::InvalidEndpoint(endpoint.to_owned()))
}

pub fn format_endpoint(addr: SocketAddr) -> String {
    format!("tcp://{addr}")
}

// ─── Blocking ───────────────────────────────────────────────────────────────

pub fn write_frame<W: Write>(w: &mut W, body: &[u8]) -> Result<(), WireError> {
    check_len(body.len())?;
    let mut buf = Vec::with_capacity(LEN_PREFIX + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(body);
    w.write_all(&buf)?;
    w.flush()?;
    Ok(())
}

/// Reads one frame, honouring whatever read timeout the stream has.
pub fn read_frame<R: Read>(r: &mut R) -> Result<Vec<u8>, WireError> {
    read_frame_until(r, || true)
}

/// Reads one frame on a stream with a read timeout, keeping partial progress
/// across timeouts.
///
/// `give_up` is consulted on every timeout; returning `true` abandons the read
/// with the timeout error. A plain `read_exact` would lose the bytes already
/// consumed and desynchronize the stream.
pub fn read_frame_until<R: Read>(
    r: &mut R,
    mut give_up: impl FnMut() -> bool,
) -> Result<Vec<u8>, WireError> {
    let mut prefix = [0u8; LEN_PREFIX];
    if !fill(r, &mut prefix, true, &mut give_up)? {
        return Err(WireError::Closed);
    }
    let len = u32::from_be_bytes(prefix) as usize;
    check_len(len)?;
    let mut body = vec![0u8; len];
    fill(r, &mut body, false, &mut give_up)?;
    Ok(body)
}

/// Returns `Ok(false)` on EOF before the first byte when `eof_ok`.
fn fill<R: Read>(
    r: &mut R,
    buf: &mut [u8],
    eof_ok: bool,
    give_up: &mut impl FnMut() -> bool,
) -> Result<bool, WireError> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 && eof_ok => return Ok(false),
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if is_timeout(&e) => {
                // Only abandon between frames; mid-frame we keep waiting
                // unless told to stop.
                if give_up() {
                    return Err(e.into());
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

/// Incremental decoder for a stream polled with short read timeouts.
///
/// Unlike [`read_frame_until`] it can give up at any point, including mid
/// frame, without losing bytes: partial input stays buffered for the next
/// call.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pops one complete frame if enough bytes are buffered.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, WireError> {
        let Some(prefix) = self.buf.first_chunk::<LEN_PREFIX>() else {
            return Ok(None);
        };
        let len = u32::from_be_bytes(*prefix) as usize;
        check_len(len)?;
        if self.buf.len() < LEN_PREFIX + len {
            return Ok(None);
        }
        let body = self.buf[LEN_PREFIX..LEN_PREFIX + len].to_vec();
        self.buf.drain(..LEN_PREFIX + len);
        Ok(Some(body))
    }

    /// One read from `r`. `Ok(false)` means the read timed out.
    pub fn fill_from<R: Read>(&mut self, r: &mut R) -> Result<bool, WireError> {
        let mut chunk = [0u8; 4096];
        match r.read(&mut chunk) {
            Ok(0) => Err(WireError::Closed),
            Ok(n) => {
                self.buf.extend_from_slice(&chunk[..n]);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(true),
            Err(e) if is_timeout(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

// ─── Async ──────────────────────────────────────────────────────────────────

pub async fn write_frame_async<W: AsyncWrite + Unpin>(
    w: &mut W,
    body: &[u8],
) -> Result<(), WireError> {
    check_len(body.len())?;
    w.write_all(&(body.len() as u32).to_be_bytes()).await?;
    w.write_all(body).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_frame_async<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>, WireError> {
    let mut prefix = [0u8; LEN_PREFIX];
    match r.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(WireError::Closed),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(prefix) as usize;
    check_len(len)?;
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frames_are_length_prefixed_big_endian() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 5]);
        assert_eq!(&buf[4..], b"hello");

        let mut cur = Cursor::new(buf);
        assert_eq!(read_frame(&mut cur).unwrap(), b"hello");
        assert!(matches!(read_frame(&mut cur), Err(WireError::Closed)));
    }

    #[test]
    fn oversized_length_is_rejected_before_allocation() {
        let mut cur = Cursor::new(u32::MAX.to_be_bytes().to_vec());
        assert!(matches!(
            read_frame(&mut cur),
            Err(WireError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn truncated_body_is_an_error_not_a_close() {
        let mut cur = Cursor::new(vec![0, 0, 0, 9, b'a']);
        assert!(matches!(read_frame(&mut cur), Err(WireError::Io(_))));
    }

    #[test]
    fn endpoints_parse_with_or_without_scheme() {
        let a = parse_endpoint("tcp://127.0.0.1:5555").unwrap();
        assert_eq!(a.port(), 5555);
        assert_eq!(parse_endpoint("127.0.0.1:7").unwrap().port(), 7);
        assert!(parse_endpoint("tcp://nowhere").is_err());
        assert_eq!(format_endpoint(a), "tcp://127.0.0.1:5555");
    }

    /// Hands out at most `step` bytes per read.
    struct Trickle {
        data: Cursor<Vec<u8>>,
        step: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.step);
            std::io::Read::read(&mut self.data, &mut buf[..n])
        }
    }

    #[test]
    fn frame_buffer_reassembles_split_frames() {
        let mut raw = Vec::new();
        write_frame(&mut raw, b"first").unwrap();
        write_frame(&mut raw, b"").unwrap();
        write_frame(&mut raw, b"third").unwrap();
        let mut src = Trickle {
            data: Cursor::new(raw),
            step: 3,
        };

        let mut fb = FrameBuffer::new();
        let mut frames = Vec::new();
        loop {
            while let Some(f) = fb.next_frame().unwrap() {
                frames.push(f);
            }
            match fb.fill_from(&mut src) {
                Ok(_) => {}
                Err(WireError::Closed) => break,
                Err(e) => panic!("{e}"),
            }
        }
        assert_eq!(frames, vec![b"first".to_vec(), Vec::new(), b"third".to_vec()]);
        assert_eq!(fb.buffered(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn async_frames_match_blocking_frames() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame_async(&mut a, "Portimão".as_bytes()).await.unwrap();
        drop(a);

        let got = read_frame_async(&mut b).await.unwrap();
        assert_eq!(got, "Portimão".as_bytes());
        assert!(matches!(
            read_frame_async(&mut b).await,
            Err(WireError::Closed)
        ));
    }
}
