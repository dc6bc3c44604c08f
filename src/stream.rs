//! Bulk-stream multiplexing over a frame connection.
//!
//! A long byte stream travels as a sequence of data frames of a
//! caller-chosen type, terminated by exactly one sentinel frame: a
//! zero-length [`SOURCE_EOF`] frame on clean end, or a [`SOURCE_ERR`]
//! frame whose payload is the textual error of the failed source. The
//! trailer turns a source failure into in-band data, so the writing side
//! reports success after emitting it and the error surfaces on the
//! reading side.
//!
//! # Architecture
//!
//! ```text
//! write side                              read side
//!
//! source ─► producer task ─┐              ┌─► reader task ─► frames
//!                          │ channel(1)   │ channel(1)
//!                          └─► consumer ──┴──► consumer ─► sink
//!                              (frames)        (payload copy)
//! ```
//!
//! Backpressure is structural: the capacity-1 channels let the producer
//! read at most one chunk ahead of the frame writer, and the frame reader
//! run at most one frame ahead of the sink.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::bufpool::{BufPool, Buffer};
use crate::error::{Result, SnapferryError};
use crate::frameconn::{Frame, FrameReader, FrameWriter, RESERVED_FRAME_TYPE};

/// Frame type marking the clean end of a multiplexed stream.
pub const SOURCE_EOF: u32 = u32::MAX;

/// Frame type carrying the error trailer of a failed stream.
pub const SOURCE_ERR: u32 = u32::MAX - 1;

/// Chunk size drawn from the pool per source read (`2^19` bytes).
const CHUNK_SHIFT: u32 = 19;
const CHUNK_SIZE: usize = 1 << CHUNK_SHIFT;

fn assert_valid_stype(stype: u32) {
    assert!(
        stype != RESERVED_FRAME_TYPE && stype != SOURCE_EOF && stype != SOURCE_ERR,
        "stream type {:#x} is reserved",
        stype
    );
}

/// One producer handoff: a filled chunk plus the outcome of the read that
/// filled it. `Ok(true)` means the source hit clean EOF after this chunk.
struct SourceRead {
    buf: Buffer,
    outcome: std::io::Result<bool>,
}

/// Fill `buf` from `r`, stopping early only at EOF. Returns the byte
/// count and whether EOF was reached.
async fn read_full<R: AsyncRead + Unpin>(r: &mut R, buf: &mut [u8]) -> std::io::Result<(usize, bool)> {
    let mut n = 0;
    while n < buf.len() {
        let m = r.read(&mut buf[n..]).await?;
        if m == 0 {
            return Ok((n, true));
        }
        n += m;
    }
    Ok((n, false))
}

async fn produce_chunks<R>(mut source: R, pool: BufPool, tx: mpsc::Sender<SourceRead>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut buf = pool.get(CHUNK_SIZE);
        match read_full(&mut source, buf.bytes_mut()).await {
            Ok((n, eof)) => {
                buf.shrink(n);
                if tx.send(SourceRead { buf, outcome: Ok(eof) }).await.is_err() {
                    return;
                }
                if eof {
                    return;
                }
            }
            Err(e) => {
                buf.shrink(0);
                let _ = tx.send(SourceRead { buf, outcome: Err(e) }).await;
                return;
            }
        }
    }
}

/// Write `source` to the connection as a stream of frames of type `stype`.
///
/// A producer task reads `2^19`-byte chunks from `source`; this function
/// writes each chunk as one frame and terminates the stream with a
/// zero-length [`SOURCE_EOF`] frame. If the *source* fails mid-stream the
/// error text is emitted as a [`SOURCE_ERR`] trailer and the call returns
/// `Ok(())` — the peer sees the error. Only a failure of the connection
/// itself is returned as an error.
///
/// # Panics
///
/// Panics if `stype` is `0` or one of the reserved sentinel types.
pub async fn write_stream<W, R>(conn: &mut FrameWriter<W>, source: R, stype: u32) -> Result<()>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin + Send + 'static,
{
    assert_valid_stype(stype);

    let pool = BufPool::new(CHUNK_SHIFT, CHUNK_SHIFT);
    let (tx, mut rx) = mpsc::channel(1);
    tokio::spawn(produce_chunks(source, pool, tx));

    while let Some(read) = rx.recv().await {
        match read.outcome {
            Err(e) => {
                read.buf.free();
                return write_error_trailer(conn, &e.to_string()).await;
            }
            Ok(eof) => {
                if !read.buf.is_empty() {
                    // hot path
                    conn.write_frame(stype, read.buf.bytes()).await?;
                }
                read.buf.free();
                if eof {
                    conn.write_frame(SOURCE_EOF, &[]).await?;
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}

/// Emit the error trailer: the message as `SOURCE_ERR` frames (at least
/// one, even for an empty message) followed by `SOURCE_EOF`.
async fn write_error_trailer<W>(conn: &mut FrameWriter<W>, msg: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = msg.as_bytes();
    if bytes.is_empty() {
        conn.write_frame(SOURCE_ERR, &[]).await?;
    } else {
        for chunk in bytes.chunks(CHUNK_SIZE) {
            conn.write_frame(SOURCE_ERR, chunk).await?;
        }
    }
    conn.write_frame(SOURCE_EOF, &[]).await?;
    Ok(())
}

/// Read a stream of frames of type `stype` from the connection into
/// `sink`.
///
/// A reader task pulls frames off the connection; this function copies
/// each payload into `sink` until a sentinel arrives: [`SOURCE_EOF`]
/// yields `Ok` and hands the reader half back for reuse, [`SOURCE_ERR`]
/// yields [`SnapferryError::StreamTrailer`] carrying the peer's message,
/// any other type is a protocol error. On any failure the reader half is
/// dropped, i.e. this routine closes the connection.
pub async fn read_stream<R, W>(
    reader: FrameReader<R>,
    sink: &mut W,
    stype: u32,
) -> Result<FrameReader<R>>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    assert_valid_stype(stype);

    let (tx, mut rx) = mpsc::channel::<Result<Frame>>(1);
    let join = tokio::spawn(async move {
        let mut reader = reader;
        loop {
            let read = reader.read_frame().await;
            let terminal = match &read {
                Err(_) => true,
                Ok(f) => f.ftype == SOURCE_EOF || f.ftype == SOURCE_ERR,
            };
            if tx.send(read).await.is_err() || terminal {
                break;
            }
        }
        reader
    });

    while let Some(read) = rx.recv().await {
        let frame = match read {
            Ok(f) => f,
            Err(e) => {
                join.abort();
                return Err(e);
            }
        };
        if frame.ftype == stype {
            if let Err(e) = sink.write_all(frame.payload.bytes()).await {
                join.abort();
                return Err(SnapferryError::Io(e));
            }
            frame.payload.free();
            continue;
        }
        match frame.ftype {
            SOURCE_EOF => {
                return join.await.map_err(|_| SnapferryError::ConnectionClosed);
            }
            SOURCE_ERR => {
                let msg = String::from_utf8_lossy(frame.payload.bytes()).into_owned();
                return Err(SnapferryError::StreamTrailer(msg));
            }
            other => {
                join.abort();
                return Err(SnapferryError::Protocol(format!(
                    "received unexpected frame type: {:#x}",
                    other
                )));
            }
        }
    }

    join.abort();
    Err(SnapferryError::ConnectionClosed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    type WriterHalf = FrameWriter<tokio::io::WriteHalf<tokio::io::DuplexStream>>;
    type ReaderHalf = FrameReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>;

    fn pipe() -> (WriterHalf, ReaderHalf) {
        let (a, b) = tokio::io::duplex(32 * 1024);
        let (_ar, aw) = tokio::io::split(a);
        let (br, _bw) = tokio::io::split(b);
        let pool = BufPool::new(4, 20);
        (FrameWriter::new(aw), FrameReader::new(br, pool))
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// Source that yields `data`, then fails with `msg`.
    struct FailingSource {
        data: Cursor<Vec<u8>>,
        msg: &'static str,
    }

    impl AsyncRead for FailingSource {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            let before = buf.filled().len();
            match Pin::new(&mut self.data).poll_read(cx, buf) {
                Poll::Ready(Ok(())) if buf.filled().len() == before => Poll::Ready(Err(
                    std::io::Error::new(std::io::ErrorKind::Other, self.msg),
                )),
                other => other,
            }
        }
    }

    async fn roundtrip(data: Vec<u8>, stype: u32) -> Vec<u8> {
        let (mut w, r) = pipe();
        let source = Cursor::new(data);
        let writer = tokio::spawn(async move { write_stream(&mut w, source, stype).await });

        let mut sink = Cursor::new(Vec::new());
        read_stream(r, &mut sink, stype).await.unwrap();
        writer.await.unwrap().unwrap();
        sink.into_inner()
    }

    #[tokio::test]
    async fn test_empty_stream_roundtrip() {
        let got = roundtrip(Vec::new(), 7).await;
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn test_empty_stream_is_single_eof_frame() {
        let (mut w, mut r) = pipe();
        write_stream(&mut w, Cursor::new(Vec::new()), 7)
            .await
            .unwrap();
        let frame = r.read_frame().await.unwrap();
        assert_eq!(frame.ftype, SOURCE_EOF);
        assert!(frame.payload.is_empty());
    }

    #[tokio::test]
    async fn test_single_frame_stream() {
        let data = pattern(4096);
        let (mut w, mut r) = pipe();
        let src = Cursor::new(data.clone());
        let writer = tokio::spawn(async move { write_stream(&mut w, src, 7).await });

        let frame = r.read_frame().await.unwrap();
        assert_eq!(frame.ftype, 7);
        assert_eq!(frame.payload.bytes(), &data[..]);
        let frame = r.read_frame().await.unwrap();
        assert_eq!(frame.ftype, SOURCE_EOF);
        writer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_multi_chunk_roundtrip() {
        let data = pattern(CHUNK_SIZE * 2 + CHUNK_SIZE / 2);
        let got = roundtrip(data.clone(), 9).await;
        assert_eq!(got, data);
    }

    #[tokio::test]
    async fn test_chunk_boundary_roundtrip() {
        let data = pattern(CHUNK_SIZE);
        let got = roundtrip(data.clone(), 9).await;
        assert_eq!(got, data);
    }

    #[tokio::test]
    async fn test_error_trailer_carries_message() {
        let data = pattern(1 << 20);
        let (mut w, r) = pipe();
        let source = FailingSource {
            data: Cursor::new(data.clone()),
            msg: "disk gone",
        };
        let writer = tokio::spawn(async move { write_stream(&mut w, source, 7).await });

        let mut sink = Cursor::new(Vec::new());
        let err = read_stream(r, &mut sink, 7).await.unwrap_err();
        assert!(matches!(err, SnapferryError::StreamTrailer(_)));
        assert!(err.to_string().contains("disk gone"));
        assert_eq!(sink.into_inner(), data);

        // The writing side reported success: the failure travelled in-band.
        writer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unexpected_frame_type_is_protocol_error() {
        let (mut w, r) = pipe();
        w.write_frame(42, b"stray").await.unwrap();
        let mut sink = Cursor::new(Vec::new());
        let err = read_stream(r, &mut sink, 7).await.unwrap_err();
        assert!(matches!(err, SnapferryError::Protocol(_)));
        assert!(err.to_string().contains("0x2a"));
    }

    #[tokio::test]
    async fn test_reader_survives_for_reuse_after_eof() {
        let (mut w, r) = pipe();
        let first = pattern(1000);
        let src = Cursor::new(first.clone());
        write_stream(&mut w, src, 7).await.unwrap();
        w.write_frame(5, b"next message").await.unwrap();

        let mut sink = Cursor::new(Vec::new());
        let mut r = read_stream(r, &mut sink, 7).await.unwrap();
        assert_eq!(sink.into_inner(), first);

        let frame = r.read_frame().await.unwrap();
        assert_eq!(frame.ftype, 5);
        assert_eq!(frame.payload.bytes(), b"next message");
    }

    #[tokio::test]
    async fn test_connection_drop_mid_stream_is_io_error() {
        let (mut w, r) = pipe();
        w.write_frame(7, &pattern(128)).await.unwrap();
        drop(w);
        let mut sink = Cursor::new(Vec::new());
        let err = read_stream(r, &mut sink, 7).await.unwrap_err();
        assert!(err.should_retry());
    }
}
