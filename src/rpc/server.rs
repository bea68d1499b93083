//! RPC server - accept loop and per-connection dispatch.
//!
//! Each connection runs one reader loop. Decoded requests are handed to
//! their own task, so responses may leave in any order; all writes on a
//! connection go through one mutex so frames never interleave. When the
//! reader loop ends, the connection waits for its handlers before closing.

use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::rpc::codec::{CodecReader, CodecType, CodecWriter, Header};
use crate::rpc::handshake;
use crate::rpc::registry::{Argv, MethodType, Registry};
use crate::types::{Error, Result, ServerConfig};

/// Body sent alongside an error header.
const INVALID_REQUEST: () = ();

/// RPC server sharing one registry across all connections.
#[derive(Debug)]
pub struct Server {
    registry: Arc<Registry>,
    config: ServerConfig,
    cancel: CancellationToken,
    conn_semaphore: Arc<Semaphore>,
}

impl Server {
    pub fn new(registry: Registry, config: ServerConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Bind `listen_addr` and serve until shut down.
    pub async fn serve(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        self.accept(listener).await
    }

    /// Serve connections from `listener` until shut down or accept fails.
    pub async fn accept(&self, listener: TcpListener) -> Result<()> {
        tracing::info!(
            "rpc server listening on {} (max_connections={})",
            listener.local_addr()?,
            self.config.max_connections,
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("rpc server shutting down");
                    break;
                }
                accept = listener.accept() => {
                    let (stream, peer) = match accept {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::error!("rpc server: accept error: {}", e);
                            return Err(e.into());
                        }
                    };

                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            tracing::warn!(
                                "Connection from {} rejected: at max_connections ({})",
                                peer,
                                self.config.max_connections,
                            );
                            drop(stream);
                            continue;
                        }
                    };

                    tracing::debug!("rpc connection from {} (active={})",
                        peer,
                        self.config.max_connections - self.conn_semaphore.available_permits(),
                    );
                    let conn = self.connection();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, conn).await {
                            tracing::warn!("rpc server: connection from {} error: {}", peer, e);
                        }
                        drop(permit);
                    });
                }
            }
        }
        Ok(())
    }

    /// Serve one already established stream on the current task.
    pub async fn serve_conn<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if let Err(e) = handle_connection(stream, self.connection()).await {
            tracing::warn!("rpc server: connection error: {}", e);
        }
    }

    /// Stop accepting and drain every open connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn connection(&self) -> Connection {
        Connection {
            registry: self.registry.clone(),
            cancel: self.cancel.child_token(),
            max_frame_bytes: self.config.max_frame_bytes,
        }
    }
}

/// Per-connection context.
#[derive(Debug)]
struct Connection {
    registry: Arc<Registry>,
    /// Cancelled on server shutdown or after a failed write.
    cancel: CancellationToken,
    max_frame_bytes: u32,
}

/// Handshake, then serve frames.
async fn handle_connection<S>(stream: S, conn: Connection) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let options = handshake::read_options(&mut reader, conn.max_frame_bytes).await?;
    tracing::debug!("rpc server: negotiated codec {}", options.codec_type);

    let reader = CodecReader::new(reader, options.codec_type, conn.max_frame_bytes);
    let writer = CodecWriter::new(writer, options.codec_type);
    serve_codec(reader, writer, conn).await
}

struct Request {
    header: Header,
    method: Arc<MethodType>,
    argv: Argv,
}

enum Incoming {
    Request(Request),
    /// Fully consumed request that cannot be dispatched.
    Invalid(Header, Error),
    Eof,
}

/// Serialized write path shared by a connection's handlers.
struct Responder<W: AsyncWrite> {
    sending: Mutex<CodecWriter<W>>,
    cancel: CancellationToken,
}

impl<W: AsyncWrite + Unpin> Responder<W> {
    /// Write one response. `None` sends the invalid-request sentinel.
    async fn send(&self, header: &Header, body: Option<&[u8]>) {
        let mut writer = self.sending.lock().await;
        let result = match body {
            Some(body) => writer.write_encoded(header, body).await,
            None => writer.write(header, &INVALID_REQUEST).await,
        };
        if let Err(e) = result {
            tracing::error!("rpc server: write response error: {}", e);
            // The stream is closed; stop reading new requests.
            self.cancel.cancel();
        }
    }

    /// Stop reading new requests and shut the stream down.
    async fn abort(&self) {
        self.cancel.cancel();
        let mut writer = self.sending.lock().await;
        if let Err(e) = writer.close().await {
            tracing::debug!("rpc server: close after failed encode: {}", e);
        }
    }
}

async fn serve_codec<S>(
    mut reader: CodecReader<ReadHalf<S>>,
    writer: CodecWriter<WriteHalf<S>>,
    conn: Connection,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let codec = reader.codec_type();
    let responder = Arc::new(Responder {
        sending: Mutex::new(writer),
        cancel: conn.cancel.clone(),
    });
    let handlers = TaskTracker::new();

    loop {
        let incoming = tokio::select! {
            _ = conn.cancel.cancelled() => break,
            incoming = read_request(&mut reader, &conn.registry) => incoming,
        };
        match incoming {
            Ok(Incoming::Request(request)) => {
                handlers.spawn(handle_request(request, codec, responder.clone()));
            }
            Ok(Incoming::Invalid(mut header, err)) => {
                header.error = err.to_string();
                responder.send(&header, None).await;
            }
            Ok(Incoming::Eof) => break,
            Err(e) => {
                tracing::warn!("rpc server: read header error: {}", e);
                break;
            }
        }
    }

    handlers.close();
    handlers.wait().await;
    tracing::debug!("rpc server: connection drained");
    let mut writer = responder.sending.lock().await;
    writer.close().await?;
    Ok(())
}

async fn read_request<R: AsyncRead + Unpin>(
    reader: &mut CodecReader<R>,
    registry: &Registry,
) -> Result<Incoming> {
    let header = match reader.read_header().await? {
        Some(header) => header,
        None => return Ok(Incoming::Eof),
    };
    let body = reader.read_body_raw().await?;

    let method = match registry.find(&header.service_method) {
        Ok(method) => method,
        Err(e) => return Ok(Incoming::Invalid(header, e)),
    };
    match method.new_argv(reader.codec_type(), &body) {
        Ok(argv) => Ok(Incoming::Request(Request {
            header,
            method,
            argv,
        })),
        Err(e) => {
            tracing::warn!("rpc server: read argv err: {}", e);
            Ok(Incoming::Invalid(header, e))
        }
    }
}

async fn handle_request<W>(request: Request, codec: CodecType, responder: Arc<Responder<W>>)
where
    W: AsyncWrite + Unpin + Send,
{
    let Request {
        mut header,
        method,
        argv,
    } = request;
    tracing::debug!("rpc server: {} seq={}", header.service_method, header.seq);

    // Methods are plain blocking functions.
    match tokio::task::spawn_blocking(move || method.call(argv, codec)).await {
        Ok(Ok(reply)) => responder.send(&header, Some(&reply)).await,
        Ok(Err(e @ Error::Encode(_))) => {
            tracing::error!(
                "rpc server: {} seq={} reply not encodable, closing connection: {}",
                header.service_method,
                header.seq,
                e
            );
            responder.abort().await;
        }
        Ok(Err(e)) => {
            header.error = e.to_string();
            responder.send(&header, None).await;
        }
        Err(e) => {
            tracing::error!("rpc server: {} panicked: {}", header.service_method, e);
            header.error = format!("rpc server: {} panicked", header.service_method);
            responder.send(&header, None).await;
        }
    }
}
