//! Binary RPC transport.
//!
//! ## Wire format
//!
//! Each frame is a big-endian `u32` length followed by that many bytes of a
//! `bitcode`-encoded value. A client writes one [`RpcCall`] and reads one
//! [`RpcReply`]; a connection may carry any number of call/reply pairs.
//! Frames above [`MAX_FRAME_LEN`] are refused on both sides.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::{LogSink, LogTransport, TransportError, TransportKind};
use crate::message::EventMessage;

/// Method name of the log-writing procedure.
pub const LOG_INFO_METHOD: &str = "LogService.LogInfo";

/// Largest accepted frame body.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Arguments of a log call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcPayload {
    pub name: String,
    pub data: String,
}

impl From<&EventMessage> for RpcPayload {
    fn from(msg: &EventMessage) -> Self {
        Self {
            name: msg.name().to_string(),
            data: msg.data().to_string(),
        }
    }
}

/// A request frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcCall {
    pub method: String,
    pub payload: RpcPayload,
}

/// A reply frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcReply {
    Ok(String),
    Err(String),
}

/// Write one length-prefixed frame.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = bitcode::serialize(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds limit", bytes.len()),
        ));
    }
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await
}

/// Read one length-prefixed frame. `Ok(None)` on a clean end of stream.
pub async fn read_frame<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    bitcode::deserialize(&buf)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

/// Client half: one TCP connection per call.
#[derive(Clone, Debug)]
pub struct RpcLogTransport {
    addr: String,
    timeout: Duration,
}

impl RpcLogTransport {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    async fn call(&self, call: &RpcCall) -> Result<RpcReply, TransportError> {
        let mut stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;

        write_frame(&mut stream, call)
            .await
            .map_err(|e| TransportError::Encode(e.to_string()))?;

        read_frame::<_, RpcReply>(&mut stream)
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))?
            .ok_or_else(|| TransportError::Decode("connection closed before reply".into()))
    }
}

#[async_trait]
impl LogTransport for RpcLogTransport {
    async fn send(&self, message: &EventMessage) -> Result<String, TransportError> {
        let call = RpcCall {
            method: LOG_INFO_METHOD.to_string(),
            payload: RpcPayload::from(message),
        };

        let reply = tokio::time::timeout(self.timeout, self.call(&call))
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))??;

        match reply {
            RpcReply::Ok(text) => Ok(text),
            RpcReply::Err(msg) => Err(TransportError::Remote(msg)),
        }
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Rpc
    }
}

/// Server half: accept connections forever, one task per connection.
pub async fn serve_rpc(listener: TcpListener, sink: Arc<dyn LogSink>) -> io::Result<()> {
    info!(addr = ?listener.local_addr().ok(), "RPC server listening");
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "RPC accept failed");
                continue;
            }
        };
        let sink = Arc::clone(&sink);
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, sink).await {
                debug!(%peer, error = %e, "RPC connection closed with error");
            }
        });
    }
}

async fn serve_connection(mut stream: TcpStream, sink: Arc<dyn LogSink>) -> io::Result<()> {
    while let Some(call) = read_frame::<_, RpcCall>(&mut stream).await? {
        let reply = handle_call(call, sink.as_ref()).await;
        write_frame(&mut stream, &reply).await?;
    }
    Ok(())
}

async fn handle_call(call: RpcCall, sink: &dyn LogSink) -> RpcReply {
    if call.method != LOG_INFO_METHOD {
        return RpcReply::Err(format!("unknown method: {}", call.method));
    }

    let name = call.payload.name.clone();
    match sink
        .insert(EventMessage::new(call.payload.name, call.payload.data))
        .await
    {
        Ok(()) => RpcReply::Ok(format!("Processed payload via RPC: {}", name)),
        Err(e) => {
            warn!(error = %e, "error writing log entry");
            RpcReply::Err("failed to write log entry".into())
        }
    }
}
