//! Request/response transport between window processes
//!
//! Every endpoint is a Unix domain socket. The server side lives in
//! [`server`], here is the blocking client used by both monarch and peasant
//! proxies.
mod server;

pub use self::server::*;

use binrw::io::NoSeek;
use binrw::{BinRead, BinWrite};
use convi::{CastFrom, ExpectFrom};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, Cursor, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, trace};
use windowd_api::{
    ConnectionHello, ProcessId, RequestCmd, RequestHeader, ResponseHeader, ResponseStatus,
    MAX_PAYLOAD_SIZE, WINDOWD_VERSION_0,
};

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("header decoding error: {0}")]
    Header(#[from] binrw::Error),
    #[error("payload encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("payload decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("invalid protocol version: {0}")]
    ProtocolVersion(u8),
    #[error("payload too large: {0}B")]
    PayloadTooLarge(u32),
    #[error("request too large: {0}B")]
    RequestTooLarge(usize),
    #[error("expected peer {expected}, connected to {actual}")]
    UnexpectedPeer {
        expected: ProcessId,
        actual: ProcessId,
    },
    #[error("invalid response status")]
    InvalidStatus,
    #[error("remote error: {0}")]
    Remote(String),
}

impl RpcError {
    /// Is the other side gone (or talking nonsense), as opposed to the
    /// request being rejected or never sent
    pub fn is_unreachable(&self) -> bool {
        match self {
            RpcError::Io(_)
            | RpcError::Header(_)
            | RpcError::ProtocolVersion(_)
            | RpcError::PayloadTooLarge(_)
            | RpcError::InvalidStatus
            | RpcError::UnexpectedPeer { .. } => true,
            RpcError::Encode(_)
            | RpcError::Decode(_)
            | RpcError::RequestTooLarge(_)
            | RpcError::Remote(_) => false,
        }
    }
}

pub type RpcResult<T> = std::result::Result<T, RpcError>;

/// Blocking connection to an rpc endpoint
#[derive(Debug)]
pub struct RpcConnection {
    conn: UnixStream,
    remote_pid: ProcessId,
}

impl RpcConnection {
    pub fn connect(path: &Path) -> RpcResult<Self> {
        debug!(path = %path.display(), "Connecting to endpoint");
        let mut conn = UnixStream::connect(path)?;

        let mut buf = [0u8; ConnectionHello::BYTE_SIZE];
        conn.read_exact(&mut buf)?;
        let hello = ConnectionHello::read(&mut Cursor::new(&buf))?;

        if hello.version != WINDOWD_VERSION_0 {
            Err(RpcError::ProtocolVersion(hello.version))?;
        }
        trace!(path = %path.display(), remote_pid = %hello.pid, "Connected");

        Ok(Self {
            conn,
            remote_pid: hello.pid,
        })
    }

    /// Pid of the process serving the endpoint, as announced on connect
    pub fn remote_pid(&self) -> ProcessId {
        self.remote_pid
    }

    pub fn call<Req, Resp>(&mut self, cmd: RequestCmd, req: &Req) -> RpcResult<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload = rmp_serde::to_vec(req)?;
        // the server would drop the connection on it
        if usize::cast_from(MAX_PAYLOAD_SIZE) < payload.len() {
            return Err(RpcError::RequestTooLarge(payload.len()));
        }

        let mut buf = Vec::with_capacity(RequestHeader::BYTE_SIZE + payload.len());
        RequestHeader::new(cmd, u32::expect_from(payload.len()))
            .write(&mut NoSeek::new(&mut buf))
            .expect("can't fail");
        buf.extend_from_slice(&payload);

        trace!(?cmd, len = payload.len(), "Sending request");
        self.conn.write_all(&buf)?;

        let (status, payload) = read_response(&mut self.conn)?;

        match status {
            ResponseStatus::Ok => Ok(rmp_serde::from_slice(&payload)?),
            ResponseStatus::Error => Err(RpcError::Remote(rmp_serde::from_slice(&payload)?)),
            ResponseStatus::Other => Err(RpcError::InvalidStatus),
        }
    }
}

fn read_response(conn: &mut UnixStream) -> RpcResult<(ResponseStatus, Vec<u8>)> {
    let mut header_buf = [0u8; ResponseHeader::BYTE_SIZE];
    conn.read_exact(&mut header_buf)?;
    let header = ResponseHeader::read(&mut Cursor::new(&header_buf))?;

    if MAX_PAYLOAD_SIZE < header.payload_len {
        return Err(RpcError::PayloadTooLarge(header.payload_len));
    }

    let mut payload = vec![0u8; usize::cast_from(header.payload_len)];
    conn.read_exact(&mut payload)?;

    Ok((header.status(), payload))
}
