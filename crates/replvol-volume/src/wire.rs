//! Replica wire protocol
//!
//! Frames exchanged with a replica over a byte stream. All integers are
//! big-endian.
//!
//! ```text
//! Request:  magic(4) op(1) vlen(1) volume(vlen) block(8) generation(8)
//!           len(4) crc32c(4) data(len)
//! Response: magic(4) status(1) generation(8) len(4) crc32c(4) payload(len)
//! ```
//!
//! `volume` is the UTF-8 volume name. The checksum covers the data/payload
//! bytes only.

#![allow(clippy::cast_possible_truncation)]

use std::io;

use bytes::Bytes;
use replvol_common::{BlockIndex, Generation, VolumeName};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const REQUEST_MAGIC: u32 = 0x5256_5251; // "RVRQ"
const RESPONSE_MAGIC: u32 = 0x5256_5250; // "RVRP"

const OP_READ: u8 = 1;
const OP_WRITE: u8 = 2;

const STATUS_OK: u8 = 0;
const STATUS_STALE: u8 = 1;
const STATUS_ERROR: u8 = 2;

/// Largest payload accepted from the wire (64MiB)
pub const MAX_PAYLOAD: u32 = 64 * 1024 * 1024;

/// Request sent to a replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Read {
        volume: VolumeName,
        block: BlockIndex,
    },
    Write {
        volume: VolumeName,
        block: BlockIndex,
        generation: Generation,
        data: Bytes,
    },
}

/// Replica response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Read data (empty for writes) and the generation it belongs to
    Ok { generation: Generation, data: Bytes },
    /// The replica holds a newer generation
    Stale { generation: Generation },
    /// The replica refused the request
    Error { message: String },
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

async fn read_payload<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Bytes> {
    let len = reader.read_u32().await?;
    let crc = reader.read_u32().await?;
    if len > MAX_PAYLOAD {
        return Err(invalid(format!("payload of {len} bytes exceeds limit")));
    }

    let mut data = vec![0u8; len as usize];
    reader.read_exact(&mut data).await?;
    let actual = crc32c::crc32c(&data);
    if actual != crc {
        return Err(invalid(format!(
            "checksum mismatch: expected {crc:#010x}, got {actual:#010x}"
        )));
    }
    Ok(Bytes::from(data))
}

fn put_payload(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
    buf.extend_from_slice(&crc32c::crc32c(data).to_be_bytes());
    buf.extend_from_slice(data);
}

/// Write a request frame and flush it
pub async fn write_request<W: AsyncWrite + Unpin>(writer: &mut W, request: &Request) -> io::Result<()> {
    let (op, volume, block, generation, data): (u8, &VolumeName, BlockIndex, Generation, &[u8]) =
        match request {
            Request::Read { volume, block } => (OP_READ, volume, *block, 0, &[]),
            Request::Write {
                volume,
                block,
                generation,
                data,
            } => (OP_WRITE, volume, *block, *generation, data),
        };
    let name = volume.as_str().as_bytes();
    let name_len = u8::try_from(name.len())
        .map_err(|_| invalid(format!("volume name of {} bytes", name.len())))?;

    let mut buf = Vec::with_capacity(30 + name.len() + data.len());
    buf.extend_from_slice(&REQUEST_MAGIC.to_be_bytes());
    buf.push(op);
    buf.push(name_len);
    buf.extend_from_slice(name);
    buf.extend_from_slice(&block.to_be_bytes());
    buf.extend_from_slice(&generation.to_be_bytes());
    put_payload(&mut buf, data);

    writer.write_all(&buf).await?;
    writer.flush().await
}

/// Read a request frame
pub async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Request> {
    let magic = reader.read_u32().await?;
    if magic != REQUEST_MAGIC {
        return Err(invalid(format!("bad request magic: {magic:#x}")));
    }
    let op = reader.read_u8().await?;
    let mut name = vec![0u8; usize::from(reader.read_u8().await?)];
    reader.read_exact(&mut name).await?;
    let volume = String::from_utf8(name)
        .map_err(|e| invalid(format!("volume name: {e}")))
        .and_then(|name| VolumeName::new(name).map_err(|e| invalid(e.to_string())))?;
    let block = reader.read_u64().await?;
    let generation = reader.read_u64().await?;
    let data = read_payload(reader).await?;

    match op {
        OP_READ => Ok(Request::Read { volume, block }),
        OP_WRITE => Ok(Request::Write {
            volume,
            block,
            generation,
            data,
        }),
        _ => Err(invalid(format!("unknown op {op}"))),
    }
}

/// Write a response frame and flush it
pub async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &Response,
) -> io::Result<()> {
    let (status, generation, payload): (u8, Generation, &[u8]) = match response {
        Response::Ok { generation, data } => (STATUS_OK, *generation, data),
        Response::Stale { generation } => (STATUS_STALE, *generation, &[]),
        Response::Error { message } => (STATUS_ERROR, 0, message.as_bytes()),
    };

    let mut buf = Vec::with_capacity(21 + payload.len());
    buf.extend_from_slice(&RESPONSE_MAGIC.to_be_bytes());
    buf.push(status);
    buf.extend_from_slice(&generation.to_be_bytes());
    put_payload(&mut buf, payload);

    writer.write_all(&buf).await?;
    writer.flush().await
}

/// Read a response frame
pub async fn read_response<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Response> {
    let magic = reader.read_u32().await?;
    if magic != RESPONSE_MAGIC {
        return Err(invalid(format!("bad response magic: {magic:#x}")));
    }
    let status = reader.read_u8().await?;
    let generation = reader.read_u64().await?;
    let payload = read_payload(reader).await?;

    match status {
        STATUS_OK => Ok(Response::Ok {
            generation,
            data: payload,
        }),
        STATUS_STALE => Ok(Response::Stale { generation }),
        STATUS_ERROR => Ok(Response::Error {
            message: String::from_utf8_lossy(&payload).into_owned(),
        }),
        _ => Err(invalid(format!("unknown status {status}"))),
    }
}
