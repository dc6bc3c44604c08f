//! Request/response envelopes binding the PDU model to a frame
//! connection.
//!
//! One connection carries one call at a time: the client writes a
//! [`Request`] envelope as a single [`FRAME_TYPE_RPC`] frame, the server
//! answers with a [`Response`] envelope. Bulk payloads ride the stream
//! layer on the same connection as [`FRAME_TYPE_DATA`] frames — in the
//! request direction for `Receive`, in the response direction for
//! `Send`, after the respective envelope.
//!
//! [`RpcClient`] implements [`Target`] and [`History`], so a remote peer
//! can be wired straight into a [`crate::pruner::Pruner`].

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

use crate::bufpool::BufPool;
use crate::error::{Result, SnapferryError};
use crate::frameconn::{FrameReader, FrameWriter};
use crate::logging;
use crate::pdu::{
    DestroySnapshotsReq, DestroySnapshotsRes, Filesystem, FilesystemVersion, PduCodec,
    ReceiveReq, ReceiveRes, ReplicationCursorReq, ReplicationCursorRes, SendReq, SendRes,
    SnapshotReplicationStatusReq, SnapshotReplicationStatusRes,
};
use crate::pruner::{History, Target};
use crate::stream::{read_stream, write_stream};

/// Frame type of request and response envelopes.
pub const FRAME_TYPE_RPC: u32 = 1;

/// Frame type of bulk stream chunks.
pub const FRAME_TYPE_DATA: u32 = 2;

/// Pooled payload size classes for envelope frames (512 B to 1 MiB).
const POOL_MIN_SHIFT: u32 = 9;
const POOL_MAX_SHIFT: u32 = 20;

/// A call as it crosses the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Request {
    ListFilesystems,
    ListFilesystemVersions { filesystem: String },
    Send(SendReq),
    Receive(ReceiveReq),
    DestroySnapshots(DestroySnapshotsReq),
    ReplicationCursor(ReplicationCursorReq),
    SnapshotReplicationStatus(SnapshotReplicationStatusReq),
}

/// A call's answer. `Error` relays an application-level failure; the
/// connection remains usable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    Filesystems { filesystems: Vec<Filesystem> },
    FilesystemVersions { versions: Vec<FilesystemVersion> },
    Send(SendRes),
    Receive(ReceiveRes),
    DestroySnapshots(DestroySnapshotsRes),
    ReplicationCursor(ReplicationCursorRes),
    SnapshotReplicationStatus(SnapshotReplicationStatusRes),
    Error { message: String },
}

fn unexpected_response(method: &str, response: &Response) -> SnapferryError {
    SnapferryError::Protocol(format!(
        "unexpected response to {}: {:?}",
        method, response
    ))
}

/// Everything a serving peer offers: the pruner-facing capabilities plus
/// send/receive and the replication cursor.
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn list_filesystems(&self) -> Result<Vec<Filesystem>>;
    async fn list_filesystem_versions(&self, filesystem: &str) -> Result<Vec<FilesystemVersion>>;
    /// Produce the send stream body along with its metadata. For
    /// `dry_run` requests the body is not transmitted.
    async fn send(&self, req: &SendReq) -> Result<(SendRes, Bytes)>;
    /// Apply one received stream body.
    async fn receive(&self, req: &ReceiveReq, body: Bytes) -> Result<ReceiveRes>;
    async fn destroy_snapshots(&self, req: &DestroySnapshotsReq) -> Result<DestroySnapshotsRes>;
    async fn replication_cursor(&self, req: &ReplicationCursorReq)
        -> Result<ReplicationCursorRes>;
    async fn snapshot_replication_status(
        &self,
        req: &SnapshotReplicationStatusReq,
    ) -> Result<SnapshotReplicationStatusRes>;
}

struct ClientInner<R, W> {
    // taken while a read_stream is in flight, restored afterwards
    reader: Option<FrameReader<R>>,
    writer: FrameWriter<W>,
}

impl<R, W> ClientInner<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send,
{
    async fn call(&mut self, req: &Request, cancel: &CancellationToken) -> Result<Response> {
        if cancel.is_cancelled() {
            return Err(SnapferryError::Cancelled);
        }
        let payload = PduCodec::encode(req)?;
        self.writer.write_frame(FRAME_TYPE_RPC, &payload).await?;
        self.read_response(cancel).await
    }

    async fn read_response(&mut self, cancel: &CancellationToken) -> Result<Response> {
        let reader = self
            .reader
            .as_mut()
            .ok_or(SnapferryError::ConnectionClosed)?;
        let frame = tokio::select! {
            read = reader.read_frame() => read?,
            _ = cancel.cancelled() => return Err(SnapferryError::Cancelled),
        };
        if frame.ftype != FRAME_TYPE_RPC {
            return Err(SnapferryError::Protocol(format!(
                "expected rpc frame, got type {:#x}",
                frame.ftype
            )));
        }
        let response: Response = PduCodec::decode(frame.payload.bytes())?;
        if let Response::Error { message } = response {
            return Err(SnapferryError::Remote(message));
        }
        Ok(response)
    }
}

/// Client side of a connection, one in-flight call at a time (the
/// internal lock serializes callers — the frame connection is exclusive
/// to one exchange).
pub struct RpcClient<R, W> {
    inner: tokio::sync::Mutex<ClientInner<R, W>>,
    cancel: CancellationToken,
}

impl<R, W> RpcClient<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(r: R, w: W, cancel: CancellationToken) -> Self {
        let pool = BufPool::new(POOL_MIN_SHIFT, POOL_MAX_SHIFT);
        Self {
            inner: tokio::sync::Mutex::new(ClientInner {
                reader: Some(FrameReader::new(r, pool)),
                writer: FrameWriter::new(w),
            }),
            cancel,
        }
    }

    async fn call(&self, req: &Request) -> Result<Response> {
        let mut inner = self.inner.lock().await;
        inner
            .call(req, &self.cancel)
            .instrument(logging::subsystem_span(logging::SUBSYS_RPC))
            .await
    }

    /// Issue a `Send` call, streaming the bulk body into `sink`.
    pub async fn send_stream<S>(&self, req: SendReq, sink: &mut S) -> Result<SendRes>
    where
        S: AsyncWrite + Unpin,
    {
        let dry_run = req.dry_run;
        let mut inner = self.inner.lock().await;
        let send_res = match inner.call(&Request::Send(req), &self.cancel).await? {
            Response::Send(res) => res,
            other => return Err(unexpected_response("send", &other)),
        };
        if dry_run {
            return Ok(send_res);
        }
        let reader = inner
            .reader
            .take()
            .ok_or(SnapferryError::ConnectionClosed)?;
        let reader = read_stream(reader, sink, FRAME_TYPE_DATA).await?;
        inner.reader = Some(reader);
        Ok(send_res)
    }

    /// Issue a `Receive` call, streaming `body` in the request direction.
    pub async fn receive_stream<S>(&self, req: ReceiveReq, body: S) -> Result<ReceiveRes>
    where
        S: AsyncRead + Unpin + Send + 'static,
    {
        let mut inner = self.inner.lock().await;
        if self.cancel.is_cancelled() {
            return Err(SnapferryError::Cancelled);
        }
        let payload = PduCodec::encode(&Request::Receive(req))?;
        inner.writer.write_frame(FRAME_TYPE_RPC, &payload).await?;
        write_stream(&mut inner.writer, body, FRAME_TYPE_DATA).await?;
        let response = inner.read_response(&self.cancel).await?;
        match response {
            Response::Receive(res) => Ok(res),
            other => Err(unexpected_response("receive", &other)),
        }
    }

    pub async fn replication_cursor(
        &self,
        req: ReplicationCursorReq,
    ) -> Result<ReplicationCursorRes> {
        match self.call(&Request::ReplicationCursor(req)).await? {
            Response::ReplicationCursor(res) => Ok(res),
            other => Err(unexpected_response("replication_cursor", &other)),
        }
    }
}

#[async_trait]
impl<R, W> Target for RpcClient<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send,
{
    async fn list_filesystems(&self) -> Result<Vec<Filesystem>> {
        match self.call(&Request::ListFilesystems).await? {
            Response::Filesystems { filesystems } => Ok(filesystems),
            other => Err(unexpected_response("list_filesystems", &other)),
        }
    }

    async fn list_filesystem_versions(&self, filesystem: &str) -> Result<Vec<FilesystemVersion>> {
        let req = Request::ListFilesystemVersions {
            filesystem: filesystem.to_string(),
        };
        match self.call(&req).await? {
            Response::FilesystemVersions { versions } => Ok(versions),
            other => Err(unexpected_response("list_filesystem_versions", &other)),
        }
    }

    async fn destroy_snapshots(&self, req: &DestroySnapshotsReq) -> Result<DestroySnapshotsRes> {
        match self.call(&Request::DestroySnapshots(req.clone())).await? {
            Response::DestroySnapshots(res) => Ok(res),
            other => Err(unexpected_response("destroy_snapshots", &other)),
        }
    }
}

#[async_trait]
impl<R, W> History for RpcClient<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send,
{
    async fn snapshot_replication_status(
        &self,
        req: &SnapshotReplicationStatusReq,
    ) -> Result<SnapshotReplicationStatusRes> {
        match self
            .call(&Request::SnapshotReplicationStatus(req.clone()))
            .await?
        {
            Response::SnapshotReplicationStatus(res) => Ok(res),
            other => Err(unexpected_response("snapshot_replication_status", &other)),
        }
    }
}

fn error_response(e: SnapferryError) -> Response {
    Response::Error {
        message: e.to_string(),
    }
}

/// Serve calls on one connection until the peer disconnects or `cancel`
/// fires.
///
/// Application-level endpoint failures are relayed as [`Response::Error`]
/// and the loop continues; transport and protocol failures tear the
/// connection down.
pub async fn serve_connection<E, R, W>(
    endpoint: &E,
    r: R,
    w: W,
    cancel: CancellationToken,
) -> Result<()>
where
    E: Endpoint,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    serve_loop(endpoint, r, w, cancel)
        .instrument(logging::subsystem_span(logging::SUBSYS_SERVE))
        .await
}

async fn serve_loop<E, R, W>(endpoint: &E, r: R, w: W, cancel: CancellationToken) -> Result<()>
where
    E: Endpoint,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let pool = BufPool::new(POOL_MIN_SHIFT, POOL_MAX_SHIFT);
    let mut reader = Some(FrameReader::new(r, pool));
    let mut writer = FrameWriter::new(w);

    loop {
        let frame = {
            let rd = reader.as_mut().expect("frame reader present between calls");
            tokio::select! {
                read = rd.read_frame() => match read {
                    Ok(frame) => frame,
                    // peer hung up between calls
                    Err(SnapferryError::Io(ref e))
                        if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                    {
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                },
                _ = cancel.cancelled() => return Ok(()),
            }
        };
        if frame.ftype != FRAME_TYPE_RPC {
            return Err(SnapferryError::Protocol(format!(
                "expected rpc frame, got type {:#x}",
                frame.ftype
            )));
        }
        let request: Request = PduCodec::decode(frame.payload.bytes())?;
        debug!(request = ?request, "serving request");

        let response = match request {
            Request::ListFilesystems => match endpoint.list_filesystems().await {
                Ok(filesystems) => Response::Filesystems { filesystems },
                Err(e) => error_response(e),
            },
            Request::ListFilesystemVersions { filesystem } => {
                match endpoint.list_filesystem_versions(&filesystem).await {
                    Ok(versions) => Response::FilesystemVersions { versions },
                    Err(e) => error_response(e),
                }
            }
            Request::DestroySnapshots(req) => match endpoint.destroy_snapshots(&req).await {
                Ok(res) => Response::DestroySnapshots(res),
                Err(e) => error_response(e),
            },
            Request::ReplicationCursor(req) => match endpoint.replication_cursor(&req).await {
                Ok(res) => Response::ReplicationCursor(res),
                Err(e) => error_response(e),
            },
            Request::SnapshotReplicationStatus(req) => {
                match endpoint.snapshot_replication_status(&req).await {
                    Ok(res) => Response::SnapshotReplicationStatus(res),
                    Err(e) => error_response(e),
                }
            }
            Request::Receive(req) => {
                let rd = reader.take().expect("frame reader present between calls");
                let mut body = std::io::Cursor::new(Vec::new());
                let rd = read_stream(rd, &mut body, FRAME_TYPE_DATA).await?;
                reader = Some(rd);
                match endpoint
                    .receive(&req, Bytes::from(body.into_inner()))
                    .await
                {
                    Ok(res) => Response::Receive(res),
                    Err(e) => error_response(e),
                }
            }
            Request::Send(req) => match endpoint.send(&req).await {
                Err(e) => error_response(e),
                Ok((res, body)) => {
                    let payload = PduCodec::encode(&Response::Send(res))?;
                    writer.write_frame(FRAME_TYPE_RPC, &payload).await?;
                    if !req.dry_run {
                        write_stream(&mut writer, std::io::Cursor::new(body), FRAME_TYPE_DATA)
                            .await?;
                    }
                    continue;
                }
            },
        };
        let payload = PduCodec::encode(&response)?;
        writer.write_frame(FRAME_TYPE_RPC, &payload).await?;
    }
}
