//! NBD (Network Block Device) newstyle server
//!
//! Implements the fixed newstyle handshake over TCP, multiplexed by export
//! name (= volume name). One listener serves every attached volume; clients
//! select the volume with NBD_OPT_GO (or NBD_OPT_EXPORT_NAME) during the
//! handshake.

#![allow(clippy::cast_possible_truncation)]

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use parking_lot::RwLock;
use replvol_volume::VolumeCoordinator;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

// ── NBD protocol constants ────────────────────────────────────────────────────

const NBD_MAGIC: u64 = 0x4e42_444d_4147_4943; // "NBDMAGIC"
const NBD_IHAVEOPT: u64 = 0x4948_4156_454f_5054; // "IHAVEOPT"
const NBD_OPTION_REPLY_MAGIC: u64 = 0x0003_e889_0455_65a9;
const NBD_REQUEST_MAGIC: u32 = 0x2560_9513;
const NBD_REPLY_MAGIC: u32 = 0x6744_6698;

// Handshake flags
const NBD_FLAG_FIXED_NEWSTYLE: u16 = 0x0001;
const NBD_FLAG_NO_ZEROES: u16 = 0x0002;

// Client flags
const NBD_FLAG_C_NO_ZEROES: u32 = 0x0002;

// Option IDs
const NBD_OPT_EXPORT_NAME: u32 = 1;
const NBD_OPT_ABORT: u32 = 2;
const NBD_OPT_LIST: u32 = 3;
const NBD_OPT_INFO: u32 = 6;
const NBD_OPT_GO: u32 = 7;

// Reply types
const NBD_REP_ACK: u32 = 1;
const NBD_REP_SERVER: u32 = 2;
const NBD_REP_INFO: u32 = 3;
const NBD_REP_ERR_UNSUP: u32 = 0x8000_0001;
const NBD_REP_ERR_INVALID: u32 = 0x8000_0003;
const NBD_REP_ERR_UNKNOWN: u32 = 0x8000_0006;

// Transmission flags
const NBD_FLAG_HAS_FLAGS: u16 = 0x0001;
const NBD_FLAG_SEND_FLUSH: u16 = 0x0004;
const NBD_FLAG_SEND_TRIM: u16 = 0x0008;

// Info types
const NBD_INFO_EXPORT: u16 = 0;
const NBD_INFO_BLOCK_SIZE: u16 = 3;

// Commands
const NBD_CMD_READ: u16 = 0;
const NBD_CMD_WRITE: u16 = 1;
const NBD_CMD_DISC: u16 = 2;
const NBD_CMD_FLUSH: u16 = 3;
const NBD_CMD_TRIM: u16 = 4;

// Errors
const EINVAL: u32 = 22;

/// Largest READ/WRITE payload accepted from a client
const MAX_REQUEST_BYTES: u32 = 32 * 1024 * 1024;

// ── Export registry ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct NbdServer {
    exports: RwLock<HashMap<String, Arc<VolumeCoordinator>>>,
}

impl NbdServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an attached volume as an NBD export.
    pub fn register(&self, volume: Arc<VolumeCoordinator>) {
        let name = volume.name().to_string();
        let size_bytes = volume.size_bytes();
        self.exports.write().insert(name.clone(), volume);
        info!("NBD: registered export '{name}' ({size_bytes}B)");
    }

    /// Unregister a volume export.
    pub fn unregister(&self, name: &str) -> Option<Arc<VolumeCoordinator>> {
        let removed = self.exports.write().remove(name);
        if removed.is_some() {
            info!("NBD: unregistered export '{name}'");
        }
        removed
    }

    fn export(&self, name: &str) -> Option<Arc<VolumeCoordinator>> {
        self.exports.read().get(name).cloned()
    }

    /// Accept NBD clients until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!("NBD: listening on {addr}");
        }

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("NBD: set_nodelay for {peer}: {e}");
                    }
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_client(stream, peer.to_string()).await {
                            warn!("NBD: client {peer} error: {e:#}");
                        }
                    });
                }
                Err(e) => {
                    error!("NBD: accept error: {e}");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    pub async fn handle_client<S>(self: Arc<Self>, mut stream: S, peer: String) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        info!("NBD: client {peer} connected");

        // ── Handshake ─────────────────────────────────────────────────────────
        stream.write_u64(NBD_MAGIC).await?;
        stream.write_u64(NBD_IHAVEOPT).await?;
        stream
            .write_u16(NBD_FLAG_FIXED_NEWSTYLE | NBD_FLAG_NO_ZEROES)
            .await?;
        stream.flush().await?;

        let client_flags = stream.read_u32().await?;

        // ── Option negotiation ────────────────────────────────────────────────
        let volume = self
            .negotiate_options(&mut stream, client_flags & NBD_FLAG_C_NO_ZEROES != 0)
            .await?;

        // ── Data phase ────────────────────────────────────────────────────────
        self.data_phase(&mut stream, &volume, &peer).await?;

        info!("NBD: client {peer} disconnected from '{}'", volume.name());
        Ok(())
    }

    async fn negotiate_options<S>(
        &self,
        stream: &mut S,
        no_zeroes: bool,
    ) -> Result<Arc<VolumeCoordinator>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            // Option header: IHAVEOPT magic (8) + option (4) + length (4)
            let magic = stream.read_u64().await?;
            if magic != NBD_IHAVEOPT {
                bail!("bad option magic: {magic:#x}");
            }
            let option = stream.read_u32().await?;
            let data_len = stream.read_u32().await?;
            if data_len > 4096 {
                bail!("option {option} carries {data_len} bytes");
            }

            let mut option_data = vec![0u8; data_len as usize];
            stream.read_exact(&mut option_data).await?;

            match option {
                NBD_OPT_ABORT => {
                    send_option_reply(stream, option, NBD_REP_ACK, &[]).await?;
                    bail!("client sent NBD_OPT_ABORT");
                }

                NBD_OPT_LIST => {
                    let names: Vec<String> = self.exports.read().keys().cloned().collect();
                    for name in &names {
                        let name_bytes = name.as_bytes();
                        let mut reply = Vec::with_capacity(4 + name_bytes.len());
                        reply.extend_from_slice(&(name_bytes.len() as u32).to_be_bytes());
                        reply.extend_from_slice(name_bytes);
                        send_option_reply(stream, option, NBD_REP_SERVER, &reply).await?;
                    }
                    send_option_reply(stream, option, NBD_REP_ACK, &[]).await?;
                }

                NBD_OPT_INFO | NBD_OPT_GO => {
                    // u32 name_len + name + u16 info request count + requests
                    let Some(name) = export_name(&option_data) else {
                        send_option_reply(stream, option, NBD_REP_ERR_INVALID, b"malformed")
                            .await?;
                        continue;
                    };

                    let Some(volume) = self.export(&name) else {
                        send_option_reply(
                            stream,
                            option,
                            NBD_REP_ERR_UNKNOWN,
                            b"export not found",
                        )
                        .await?;
                        continue;
                    };

                    send_option_reply(stream, option, NBD_REP_INFO, &export_info(&volume))
                        .await?;
                    send_option_reply(stream, option, NBD_REP_INFO, &block_size_info(&volume))
                        .await?;
                    send_option_reply(stream, option, NBD_REP_ACK, &[]).await?;

                    if option == NBD_OPT_GO {
                        return Ok(volume);
                    }
                }

                NBD_OPT_EXPORT_NAME => {
                    // Old-style: no reply header, export info then straight to data phase
                    let name = String::from_utf8_lossy(&option_data).to_string();
                    let volume = self
                        .export(&name)
                        .ok_or_else(|| anyhow!("export '{name}' not found"))?;
                    stream.write_u64(volume.size_bytes()).await?;
                    stream.write_u16(transmission_flags()).await?;
                    if !no_zeroes {
                        stream.write_all(&[0u8; 124]).await?;
                    }
                    stream.flush().await?;
                    return Ok(volume);
                }

                _ => {
                    send_option_reply(stream, option, NBD_REP_ERR_UNSUP, b"unsupported").await?;
                }
            }
        }
    }

    async fn data_phase<S>(
        &self,
        stream: &mut S,
        volume: &VolumeCoordinator,
        peer: &str,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            // Request: magic(4) + flags(2) + type(2) + handle(8) + offset(8) + length(4)
            let magic = stream.read_u32().await?;
            if magic != NBD_REQUEST_MAGIC {
                bail!("bad request magic: {magic:#x}");
            }
            let _flags = stream.read_u16().await?;
            let cmd = stream.read_u16().await?;
            let handle = stream.read_u64().await?;
            let offset = stream.read_u64().await?;
            let length = stream.read_u32().await?;

            if matches!(cmd, NBD_CMD_READ | NBD_CMD_WRITE) && length > MAX_REQUEST_BYTES {
                bail!("request of {length} bytes exceeds {MAX_REQUEST_BYTES}");
            }

            match cmd {
                NBD_CMD_READ => match volume.read_blocks(offset, u64::from(length)).await {
                    Ok(data) => {
                        stream.write_u32(NBD_REPLY_MAGIC).await?;
                        stream.write_u32(0).await?;
                        stream.write_u64(handle).await?;
                        stream.write_all(&data).await?;
                        stream.flush().await?;
                    }
                    Err(e) => {
                        warn!("NBD read error for {peer} at {offset}+{length}: {e}");
                        send_reply(stream, handle, e.errno()).await?;
                    }
                },

                NBD_CMD_WRITE => {
                    let mut data = vec![0u8; length as usize];
                    stream.read_exact(&mut data).await?;

                    let error = match volume.write_blocks(offset, Bytes::from(data)).await {
                        Ok(()) => 0,
                        Err(e) => {
                            warn!("NBD write error for {peer} at {offset}+{length}: {e}");
                            e.errno()
                        }
                    };
                    send_reply(stream, handle, error).await?;
                }

                NBD_CMD_FLUSH => {
                    let error = match volume.flush().await {
                        Ok(()) => 0,
                        Err(e) => {
                            warn!("NBD flush error for {peer}: {e}");
                            e.errno()
                        }
                    };
                    send_reply(stream, handle, error).await?;
                }

                NBD_CMD_TRIM => {
                    let error = trim(volume, offset, length, peer).await;
                    send_reply(stream, handle, error).await?;
                }

                NBD_CMD_DISC => {
                    info!("NBD: client {peer} sent disconnect for '{}'", volume.name());
                    return Ok(());
                }

                _ => {
                    warn!("NBD: unknown command {cmd} from {peer}");
                    send_reply(stream, handle, EINVAL).await?;
                }
            }
        }
    }
}

/// Zero `offset..offset + length`; trimmed ranges read back as zeros
///
/// Writes at most `MAX_REQUEST_BYTES` at a time so a large discard never
/// allocates more than one request's worth of zeros.
async fn trim(volume: &VolumeCoordinator, offset: u64, length: u32, peer: &str) -> u32 {
    let end = offset.checked_add(u64::from(length));
    if end.is_none_or(|end| end > volume.size_bytes()) {
        warn!("NBD trim for {peer} at {offset}+{length} is past the end of the device");
        return EINVAL;
    }

    let zeros = Bytes::from(vec![0u8; length.min(MAX_REQUEST_BYTES) as usize]);
    let mut done = 0u32;
    while done < length {
        let chunk = (length - done).min(MAX_REQUEST_BYTES);
        let at = offset + u64::from(done);
        if let Err(e) = volume.write_blocks(at, zeros.slice(..chunk as usize)).await {
            warn!("NBD trim error for {peer} at {at}+{chunk}: {e}");
            return e.errno();
        }
        done += chunk;
    }
    0
}

// ── Wire helpers ──────────────────────────────────────────────────────────────

const fn transmission_flags() -> u16 {
    NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_FLUSH | NBD_FLAG_SEND_TRIM
}

/// Export name of an NBD_OPT_INFO / NBD_OPT_GO payload
fn export_name(data: &[u8]) -> Option<String> {
    let len_bytes: [u8; 4] = data.get(..4)?.try_into().ok()?;
    let name_len = u32::from_be_bytes(len_bytes) as usize;
    let name = data.get(4..4 + name_len)?;
    Some(String::from_utf8_lossy(name).to_string())
}

/// NBD_INFO_EXPORT: u16 info type + u64 size + u16 flags
fn export_info(volume: &VolumeCoordinator) -> Vec<u8> {
    let mut info = Vec::with_capacity(12);
    info.extend_from_slice(&NBD_INFO_EXPORT.to_be_bytes());
    info.extend_from_slice(&volume.size_bytes().to_be_bytes());
    info.extend_from_slice(&transmission_flags().to_be_bytes());
    info
}

/// NBD_INFO_BLOCK_SIZE: minimum, preferred and maximum block sizes
fn block_size_info(volume: &VolumeCoordinator) -> Vec<u8> {
    let block_size = u32::try_from(volume.block_size()).unwrap_or(u32::MAX);
    let mut info = Vec::with_capacity(14);
    info.extend_from_slice(&NBD_INFO_BLOCK_SIZE.to_be_bytes());
    info.extend_from_slice(&1u32.to_be_bytes());
    info.extend_from_slice(&block_size.to_be_bytes());
    info.extend_from_slice(&MAX_REQUEST_BYTES.to_be_bytes());
    info
}

async fn send_option_reply<S>(stream: &mut S, option: u32, reply_type: u32, data: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_u64(NBD_OPTION_REPLY_MAGIC).await?;
    stream.write_u32(option).await?;
    stream.write_u32(reply_type).await?;
    stream.write_u32(data.len() as u32).await?;
    if !data.is_empty() {
        stream.write_all(data).await?;
    }
    stream.flush().await.context("flush option reply")?;
    Ok(())
}

async fn send_reply<S>(stream: &mut S, handle: u64, error: u32) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_u32(NBD_REPLY_MAGIC).await?;
    stream.write_u32(error).await?;
    stream.write_u64(handle).await?;
    stream.flush().await?;
    Ok(())
}
