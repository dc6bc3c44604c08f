//! Framed connection: `(type: u32, payload)` frames over async byte streams.
//!
//! Wire format, all integers Big Endian:
//!
//! ```text
//! ┌──────────┬──────────┬─────────────┐
//! │ Type     │ Length   │ Payload     │
//! │ 4 bytes  │ 4 bytes  │ N bytes     │
//! │ u32 BE   │ u32 BE   │             │
//! └──────────┴──────────┴─────────────┘
//! ```
//!
//! The two halves are independent: a [`FrameWriter`] wraps any
//! `AsyncWrite`, a [`FrameReader`] wraps any `AsyncRead` and fills frame
//! payloads from a shared [`BufPool`]. Frame type `0` is reserved and
//! never valid on the wire; the values `0xFFFFFFFF` and `0xFFFFFFFE` are
//! claimed by the stream layer (see [`crate::stream`]).

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::bufpool::{BufPool, Buffer};
use crate::error::{Result, SnapferryError};

/// Frame header size in bytes.
pub const HEADER_SIZE: usize = 8;

/// Maximum payload size accepted on read or write (1 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 1 << 20;

/// Frame type reserved by the wire format; never valid on the wire.
pub const RESERVED_FRAME_TYPE: u32 = 0;

/// A frame as read off the wire: type plus pooled payload.
#[derive(Debug)]
pub struct Frame {
    pub ftype: u32,
    pub payload: Buffer,
}

/// Write half of a frame connection.
pub struct FrameWriter<W> {
    w: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(w: W) -> Self {
        Self { w }
    }

    /// Write one frame and flush.
    ///
    /// # Panics
    ///
    /// Panics if `ftype` is the reserved type `0`; callers own their type
    /// values and passing the reserved one is a programming error.
    pub async fn write_frame(&mut self, ftype: u32, payload: &[u8]) -> Result<()> {
        assert_ne!(ftype, RESERVED_FRAME_TYPE, "frame type 0 is reserved");
        if payload.len() > MAX_PAYLOAD_SIZE as usize {
            return Err(SnapferryError::Protocol(format!(
                "frame payload of {} bytes exceeds maximum {}",
                payload.len(),
                MAX_PAYLOAD_SIZE
            )));
        }
        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&ftype.to_be_bytes());
        header[4..8].copy_from_slice(&(payload.len() as u32).to_be_bytes());
        self.w.write_all(&header).await?;
        if !payload.is_empty() {
            self.w.write_all(payload).await?;
        }
        self.w.flush().await?;
        Ok(())
    }

    /// Consume the writer and return the underlying stream.
    pub fn into_inner(self) -> W {
        self.w
    }
}

/// Read half of a frame connection.
#[derive(Debug)]
pub struct FrameReader<R> {
    r: R,
    pool: BufPool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(r: R, pool: BufPool) -> Self {
        Self { r, pool }
    }

    /// Read one frame, drawing the payload buffer from the pool.
    ///
    /// A connection closed mid-frame surfaces as an I/O error
    /// (`UnexpectedEof`); a reserved type or oversized length on the wire
    /// is a protocol error.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        let mut header = [0u8; HEADER_SIZE];
        self.r.read_exact(&mut header).await?;
        let ftype = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if ftype == RESERVED_FRAME_TYPE {
            return Err(SnapferryError::Protocol(
                "reserved frame type 0 on the wire".to_string(),
            ));
        }
        if len > MAX_PAYLOAD_SIZE {
            return Err(SnapferryError::Protocol(format!(
                "frame payload of {} bytes exceeds maximum {}",
                len, MAX_PAYLOAD_SIZE
            )));
        }
        let mut payload = self.pool.get(len as usize);
        if len > 0 {
            self.r.read_exact(payload.bytes_mut()).await?;
        }
        Ok(Frame { ftype, payload })
    }
}
