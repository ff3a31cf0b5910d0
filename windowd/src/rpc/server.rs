use binrw::io::NoSeek;
use binrw::{BinRead, BinWrite};
use convi::{CastFrom, ExpectFrom};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::{
    io::{self, Cursor},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixListener, UnixStream},
    sync::watch,
    time::sleep,
};
use tracing::{debug, error, info, trace, warn};
use windowd_api::{
    ConnectionHello, ProcessId, RequestCmd, RequestHeader, ResponseHeader, ResponseStatus,
    MAX_PAYLOAD_SIZE, WINDOWD_VERSION_0,
};

use super::{RpcError, RpcResult};
use crate::task::AutoJoinHandle;

#[derive(Error, Debug)]
pub enum RequestError {
    #[error("unsupported command: {0:?}")]
    Unsupported(RequestCmd),
    #[error("payload decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("payload encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("{0}")]
    Failed(String),
}

pub type RequestResult<T> = std::result::Result<T, RequestError>;

/// Something that can be served over an [`RpcServer`]
///
/// Called from a blocking-friendly thread, so implementations are free to
/// make blocking calls to other endpoints.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle_request(&self, cmd: RequestCmd, payload: &[u8]) -> RequestResult<Vec<u8>>;
}

pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> RequestResult<T> {
    Ok(rmp_serde::from_slice(payload)?)
}

pub fn encode_payload<T: Serialize + ?Sized>(value: &T) -> RequestResult<Vec<u8>> {
    Ok(rmp_serde::to_vec(value)?)
}

/// Serves a [`RequestHandler`] on a Unix socket
///
/// Runs a tokio runtime on a dedicated thread. Dropping stops accepting,
/// closes all connections, removes the socket file and joins the thread.
pub struct RpcServer {
    path: PathBuf,
    shutdown_tx: watch::Sender<bool>,
    #[allow(unused)]
    join_handle: AutoJoinHandle,
}

impl RpcServer {
    pub fn bind(
        name: &'static str,
        path: &Path,
        pid: ProcessId,
        handler: Arc<dyn RequestHandler>,
    ) -> io::Result<Self> {
        let std_listener = std::os::unix::net::UnixListener::bind(path)?;
        std_listener.set_nonblocking(true)?;

        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let socket_path = path.to_owned();
        let join_handle = AutoJoinHandle::spawn_res(name, move || -> Result<(), io::Error> {
            let _guard = scopeguard::guard(socket_path, |socket_path| {
                if let Err(e) = std::fs::remove_file(&socket_path) {
                    debug!(error = %e, path = %socket_path.display(), "Could not remove socket file");
                }
                info!("{name} is done");
            });

            let res: Result<(), io::Error> = rt.block_on(async {
                let listener = UnixListener::from_std(std_listener)?;
                handle_connections(listener, handler, pid, shutdown_rx).await;
                Ok(())
            });

            rt.shutdown_timeout(Duration::from_secs(1));

            res
        })?;

        info!(path = %path.display(), "{name} listening");

        Ok(Self {
            path: path.to_owned(),
            shutdown_tx,
            join_handle,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        // we don't care if everyone disconnected
        let _ = self.shutdown_tx.send(true);
    }
}

async fn handle_connections(
    listener: UnixListener,
    handler: Arc<dyn RequestHandler>,
    pid: ProcessId,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                return;
            }
            res = listener.accept() => match res {
                Ok((stream, _)) => {
                    trace!("New connection");
                    let handler = handler.clone();
                    let shutdown_rx = shutdown_rx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, handler, pid, shutdown_rx).await {
                            debug!(error = %e, "Connection error");
                        }
                    });
                }
                Err(e) => {
                    error!(%e, "rpc listener accept error");
                    sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    handler: Arc<dyn RequestHandler>,
    pid: ProcessId,
    mut shutdown_rx: watch::Receiver<bool>,
) -> RpcResult<()> {
    let mut buf = vec![];
    ConnectionHello {
        version: WINDOWD_VERSION_0,
        pid,
    }
    .write(&mut NoSeek::new(&mut buf))?;
    stream.write_all(&buf).await?;

    loop {
        let mut header_buf = [0u8; RequestHeader::BYTE_SIZE];
        tokio::select! {
            _ = shutdown_rx.changed() => {
                return Ok(());
            }
            res = stream.read_exact(&mut header_buf) => match res {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    trace!("Connection closed");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }

        let header = RequestHeader::read(&mut Cursor::new(&header_buf))?;
        if MAX_PAYLOAD_SIZE < header.payload_len {
            return Err(RpcError::PayloadTooLarge(header.payload_len));
        }
        let mut payload = vec![0u8; usize::cast_from(header.payload_len)];
        stream.read_exact(&mut payload).await?;

        let cmd = header.cmd();
        debug!(?cmd, "Handling request");

        let handler = handler.clone();
        let (status, body) =
            match tokio::task::spawn_blocking(move || handler.handle_request(cmd, &payload)).await
            {
                Ok(Ok(body)) => (ResponseStatus::Ok, body),
                Ok(Err(e)) => {
                    warn!(?cmd, error = %e, "Request failed");
                    (ResponseStatus::Error, rmp_serde::to_vec(&e.to_string())?)
                }
                Err(e) => {
                    error!(?cmd, error = %e, "Request handler panicked");
                    (ResponseStatus::Error, rmp_serde::to_vec(&e.to_string())?)
                }
            };

        let mut response = Vec::with_capacity(ResponseHeader::BYTE_SIZE + body.len());
        ResponseHeader::new(status, u32::expect_from(body.len()))
            .write(&mut NoSeek::new(&mut response))?;
        response.extend_from_slice(&body);
        stream.write_all(&response).await?;
    }
}
