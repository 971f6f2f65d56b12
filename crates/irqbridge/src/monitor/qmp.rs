//! QEMU Machine Protocol client.
//!
//! QMP is newline-delimited JSON over a stream socket. After the server
//! greeting the client must negotiate capabilities before any other command.
//! Replies carry the request `id`; asynchronous `event` messages may be
//! interleaved and are skipped.

use std::io;
use std::marker::PhantomData;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite, LinesCodec, LinesCodecError};

use super::{Monitor, MonitorError};

const MAX_LINE_LENGTH: usize = 1 << 20;

/// Codec that frames messages as lines and serializes them with JSON.
///
/// Wraps LinesCodec and adds serde_json serialization.
pub struct JsonLinesCodec<T> {
    inner: LinesCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonLinesCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLinesCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
            _phantom: PhantomData,
        }
    }
}

fn lines_error(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

impl<T: DeserializeOwned> Decoder for JsonLinesCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.inner.decode(src).map_err(lines_error)? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => {
                    let item = serde_json::from_str(&line)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    return Ok(Some(item));
                }
                None => return Ok(None),
            }
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonLinesCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_string(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding QMP line");
        self.inner.encode(json, dst).map_err(lines_error)
    }
}

/// Command sent to the server.
#[derive(Debug, Clone, Serialize)]
pub struct QmpCommand {
    pub execute: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
    pub id: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QmpErrorBody {
    pub class: String,
    pub desc: String,
}

/// Anything the server may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum QmpReply {
    Greeting {
        #[serde(rename = "QMP")]
        qmp: serde_json::Value,
    },
    Return {
        #[serde(rename = "return")]
        value: serde_json::Value,
        #[serde(default)]
        id: Option<serde_json::Value>,
    },
    Error {
        error: QmpErrorBody,
        #[serde(default)]
        id: Option<serde_json::Value>,
    },
    Event {
        event: String,
        #[serde(default)]
        data: serde_json::Value,
    },
}

/// Replies without an id are accepted as answers to the command in flight.
fn id_matches(id: &Option<serde_json::Value>, expected: u64) -> bool {
    match id {
        Some(value) => value.as_u64() == Some(expected),
        None => true,
    }
}

type BoxedStream = Box<dyn AsyncStream>;

trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for S {}

struct QmpConnection {
    reader: FramedRead<ReadHalf<BoxedStream>, JsonLinesCodec<QmpReply>>,
    writer: FramedWrite<WriteHalf<BoxedStream>, JsonLinesCodec<QmpCommand>>,
    next_id: u64,
}

impl QmpConnection {
    async fn execute(
        &mut self,
        command: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, MonitorError> {
        let id = self.next_id;
        self.next_id += 1;

        tracing::debug!(command, id, "Sending QMP command");
        self.writer
            .send(QmpCommand {
                execute: command.to_string(),
                arguments,
                id,
            })
            .await?;

        loop {
            match self.reader.next().await {
                Some(Ok(QmpReply::Return { value, id: reply_id })) if id_matches(&reply_id, id) => {
                    return Ok(value);
                }
                Some(Ok(QmpReply::Error { error, id: reply_id })) if id_matches(&reply_id, id) => {
                    return Err(MonitorError::Command {
                        class: error.class,
                        desc: error.desc,
                    });
                }
                Some(Ok(QmpReply::Event { event, .. })) => {
                    tracing::trace!(%event, "Skipping QMP event");
                }
                Some(Ok(other)) => {
                    tracing::warn!(?other, command, "Unexpected QMP message");
                }
                Some(Err(e)) => {
                    return Err(MonitorError::Protocol(format!("QMP stream error: {}", e)));
                }
                None => return Err(MonitorError::Closed),
            }
        }
    }
}

/// [`Monitor`] backed by a QMP socket.
///
/// Commands are serialized; each call waits for its own reply.
pub struct QmpMonitor {
    conn: Mutex<QmpConnection>,
}

impl QmpMonitor {
    /// Connect to `unix:/path`, `tcp:host:port` or plain `host:port`.
    pub async fn connect(address: &str) -> Result<Self, MonitorError> {
        if let Some(path) = address.strip_prefix("unix:") {
            return Self::connect_unix(path).await;
        }
        let addr = address.strip_prefix("tcp:").unwrap_or(address);
        Self::connect_tcp(addr).await
    }

    pub async fn connect_tcp(addr: &str) -> Result<Self, MonitorError> {
        tracing::debug!(%addr, "Connecting to QMP monitor");
        let stream = tokio::net::TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Self::handshake(stream).await
    }

    #[cfg(unix)]
    pub async fn connect_unix(path: impl AsRef<std::path::Path>) -> Result<Self, MonitorError> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "Connecting to QMP monitor");
        let stream = tokio::net::UnixStream::connect(path).await?;
        Self::handshake(stream).await
    }

    #[cfg(not(unix))]
    pub async fn connect_unix(_path: impl AsRef<std::path::Path>) -> Result<Self, MonitorError> {
        Err(MonitorError::Protocol(
            "unix sockets are not supported on this platform".to_string(),
        ))
    }

    /// Consume the greeting and negotiate capabilities on an established stream.
    pub async fn handshake<S>(stream: S) -> Result<Self, MonitorError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let boxed: BoxedStream = Box::new(stream);
        let (read_half, write_half) = tokio::io::split(boxed);
        let mut conn = QmpConnection {
            reader: FramedRead::new(read_half, JsonLinesCodec::new()),
            writer: FramedWrite::new(write_half, JsonLinesCodec::new()),
            next_id: 0,
        };

        match conn.reader.next().await {
            Some(Ok(QmpReply::Greeting { qmp })) => {
                tracing::debug!(version = %qmp["version"]["qemu"], "QMP greeting received");
            }
            Some(Ok(other)) => {
                return Err(MonitorError::Protocol(format!(
                    "expected QMP greeting, got {:?}",
                    other
                )));
            }
            Some(Err(e)) => {
                return Err(MonitorError::Protocol(format!("QMP stream error: {}", e)));
            }
            None => return Err(MonitorError::Closed),
        }

        conn.execute("qmp_capabilities", None).await?;
        tracing::info!("QMP monitor ready");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl Monitor for QmpMonitor {
    async fn execute_command(
        &self,
        command: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, MonitorError> {
        let arguments = match arguments {
            serde_json::Value::Null => None,
            other => Some(other),
        };
        self.conn.lock().await.execute(command, arguments).await
    }
}
