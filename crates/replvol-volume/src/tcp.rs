//! TCP replica transport
//!
//! One connection per replica. Requests on a connection are strictly
//! serialized; the connection is dropped on any error (including a caller
//! abandoning the request mid-frame) and re-established lazily on the next
//! request.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use replvol_common::{BlockIndex, Generation, ReplicaId, VolumeName};
use tokio::io::BufStream;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::VolumeResult;
use crate::transport::{BlockData, ReplicaConnector, ReplicaTransport, TransportError};
use crate::wire::{self, Request, Response};

type Connection = BufStream<TcpStream>;

/// Transport to a replica reachable at `host:port`
pub struct TcpTransport {
    replica: ReplicaId,
    conn: Mutex<Option<Connection>>,
}

impl TcpTransport {
    #[must_use]
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            conn: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<Connection, TransportError> {
        let stream = TcpStream::connect(self.replica.as_str())
            .await
            .map_err(|e| TransportError::Unreachable(format!("connect {}: {e}", self.replica)))?;
        let _ = stream.set_nodelay(true);
        debug!(replica = %self.replica, "connected");
        Ok(BufStream::new(stream))
    }

    async fn call(&self, request: Request) -> Result<Response, TransportError> {
        let mut slot = self.conn.lock().await;
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => self.connect().await?,
        };

        let response = async {
            wire::write_request(&mut conn, &request).await?;
            wire::read_response(&mut conn).await
        }
        .await
        .map_err(|e| classify(&self.replica, &e))?;

        // Only a connection that completed a full exchange is reused
        *slot = Some(conn);
        Ok(response)
    }
}

fn classify(replica: &ReplicaId, err: &io::Error) -> TransportError {
    if err.kind() == io::ErrorKind::InvalidData {
        TransportError::Corrupt(format!("{replica}: {err}"))
    } else {
        TransportError::Unreachable(format!("{replica}: {err}"))
    }
}

#[async_trait]
impl ReplicaTransport for TcpTransport {
    async fn read_block(
        &self,
        volume: &VolumeName,
        block: BlockIndex,
    ) -> Result<BlockData, TransportError> {
        let request = Request::Read {
            volume: volume.clone(),
            block,
        };
        match self.call(request).await? {
            Response::Ok { generation, data } => Ok(BlockData { data, generation }),
            Response::Stale { generation } => Err(TransportError::Stale {
                current: generation,
            }),
            Response::Error { message } => Err(TransportError::Rejected(message)),
        }
    }

    async fn write_block(
        &self,
        volume: &VolumeName,
        block: BlockIndex,
        generation: Generation,
        data: Bytes,
    ) -> Result<(), TransportError> {
        let request = Request::Write {
            volume: volume.clone(),
            block,
            generation,
            data,
        };
        match self.call(request).await? {
            Response::Ok { .. } => Ok(()),
            Response::Stale { generation } => Err(TransportError::Stale {
                current: generation,
            }),
            Response::Error { message } => Err(TransportError::Rejected(message)),
        }
    }
}

/// Connects replica ids, interpreted as `host:port`, over TCP
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl ReplicaConnector for TcpConnector {
    fn connect(
        &self,
        replica: &ReplicaId,
        _block_size: u64,
    ) -> VolumeResult<Arc<dyn ReplicaTransport>> {
        Ok(Arc::new(TcpTransport::new(replica.clone())))
    }
}

/// Serve a transport's blocks to TCP clients
///
/// Runs until the listener fails. Used to expose an in-process replica to
/// remote coordinators.
pub async fn serve(listener: TcpListener, store: Arc<dyn ReplicaTransport>) {
    if let Ok(addr) = listener.local_addr() {
        info!("Replica listening on {addr}");
    }
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, store).await {
                        debug!("replica client {peer} disconnected: {e}");
                    }
                });
            }
            Err(e) => {
                error!("replica accept error: {e}");
                return;
            }
        }
    }
}

async fn handle_client(stream: TcpStream, store: Arc<dyn ReplicaTransport>) -> io::Result<()> {
    let _ = stream.set_nodelay(true);
    let mut conn = BufStream::new(stream);
    loop {
        let request = match wire::read_request(&mut conn).await {
            Ok(request) => request,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };

        let response = match request {
            Request::Read { volume, block } => match store.read_block(&volume, block).await {
                Ok(BlockData { data, generation }) => Response::Ok { generation, data },
                Err(e) => to_response(e),
            },
            Request::Write {
                volume,
                block,
                generation,
                data,
            } => match store.write_block(&volume, block, generation, data).await {
                Ok(()) => Response::Ok {
                    generation,
                    data: Bytes::new(),
                },
                Err(e) => to_response(e),
            },
        };
        wire::write_response(&mut conn, &response).await?;
    }
}

fn to_response(err: TransportError) -> Response {
    match err {
        TransportError::Stale { current } => Response::Stale {
            generation: current,
        },
        other => {
            warn!("replica request failed: {other}");
            Response::Error {
                message: other.to_string(),
            }
        }
    }
}
