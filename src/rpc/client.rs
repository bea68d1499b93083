//! RPC client - many outstanding calls multiplexed over one connection.
//!
//! Every call gets the next sequence number and sits in the pending table
//! until a background receive loop reads the response carrying that number.
//!
//! Lock order: the send lock (async, guards the writer) is always taken
//! before the state lock (sync, guards the pending table). `go`, `close` and
//! the termination path all follow it. The state lock is never held across
//! an `.await`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::rpc::codec::{CodecReader, CodecType, CodecWriter, Header};
use crate::rpc::handshake::{self, Options};
use crate::types::{ClientConfig, Error, Result};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One RPC, handed back on its done queue once it completes.
#[derive(Debug)]
pub struct Call<A, R> {
    /// 0 if the call was never registered.
    pub seq: u64,
    pub service_method: String,
    pub args: A,
    pub reply: Option<R>,
    pub error: Option<Error>,
}

impl<A, R> Call<A, R> {
    pub fn into_result(self) -> Result<R> {
        match (self.error, self.reply) {
            (Some(err), _) => Err(err),
            (None, Some(reply)) => Ok(reply),
            (None, None) => Err(Error::decode("call completed without a reply")),
        }
    }
}

/// Create a done queue for [`Client::go`].
///
/// Panics if `capacity` is zero: an unbuffered queue would block the receive
/// loop and stall every other pending call.
pub fn done_channel<A, R>(capacity: usize) -> (mpsc::Sender<Call<A, R>>, mpsc::Receiver<Call<A, R>>) {
    assert!(capacity > 0, "rpc client: done channel is unbuffered");
    mpsc::channel(capacity)
}

enum Outcome {
    Reply(Bytes),
    Failed(Error),
}

/// Type-erased entry of the pending table.
#[async_trait]
trait PendingCall: Send {
    fn set_seq(&mut self, seq: u64);

    /// Fill in the reply or error and signal the done queue. Runs once.
    async fn complete(self: Box<Self>, codec: CodecType, outcome: Outcome);
}

struct CallSlot<A, R> {
    call: Call<A, R>,
    done: mpsc::Sender<Call<A, R>>,
}

#[async_trait]
impl<A, R> PendingCall for CallSlot<A, R>
where
    A: Send + 'static,
    R: DeserializeOwned + Send + 'static,
{
    fn set_seq(&mut self, seq: u64) {
        self.call.seq = seq;
    }

    async fn complete(self: Box<Self>, codec: CodecType, outcome: Outcome) {
        let CallSlot { mut call, done } = *self;
        match outcome {
            Outcome::Reply(body) => match codec.decode::<R>(&body) {
                Ok(reply) => call.reply = Some(reply),
                Err(e) => call.error = Some(e),
            },
            Outcome::Failed(e) => call.error = Some(e),
        }
        if done.send(call).await.is_err() {
            tracing::debug!("rpc client: done queue dropped before completion");
        }
    }
}

struct ClientState {
    /// Next sequence number; 0 is reserved for "never registered".
    seq: u64,
    pending: HashMap<u64, Box<dyn PendingCall>>,
    /// Set by `close`.
    closing: bool,
    /// Set once the receive loop has stopped.
    shutdown: bool,
    /// Set after a failed request write; the writer is closed.
    broken: bool,
}

impl fmt::Debug for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientState")
            .field("seq", &self.seq)
            .field("pending", &self.pending.len())
            .field("closing", &self.closing)
            .field("shutdown", &self.shutdown)
            .field("broken", &self.broken)
            .finish()
    }
}

#[derive(Debug)]
struct ClientInner {
    codec: CodecType,
    sending: tokio::sync::Mutex<CodecWriter<BoxedWriter>>,
    state: Mutex<ClientState>,
    cancel: CancellationToken,
}

impl ClientInner {
    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Assign the next seq and insert. Hands the call back when shutting down.
    fn register_call(
        &self,
        mut call: Box<dyn PendingCall>,
    ) -> std::result::Result<u64, Box<dyn PendingCall>> {
        let mut state = self.state();
        if state.closing || state.shutdown || state.broken {
            return Err(call);
        }
        let seq = state.seq;
        call.set_seq(seq);
        state.pending.insert(seq, call);
        state.seq += 1;
        Ok(seq)
    }

    /// Remove a pending call. Whoever gets `Some` completes it.
    fn remove_call(&self, seq: u64) -> Option<Box<dyn PendingCall>> {
        self.state().pending.remove(&seq)
    }

    /// Fail every pending call with `err` and refuse new ones.
    async fn terminate_calls(&self, err: Error) {
        let _sending = self.sending.lock().await;
        let pending: Vec<_> = {
            let mut state = self.state();
            state.shutdown = true;
            state.pending.drain().map(|(_, call)| call).collect()
        };
        if !pending.is_empty() {
            tracing::warn!(
                "rpc client: terminating {} pending calls: {}",
                pending.len(),
                err
            );
        }
        for call in pending {
            call.complete(self.codec, Outcome::Failed(err.clone())).await;
        }
    }
}

/// Background loop matching responses to pending calls.
async fn receive<R: AsyncRead + Unpin>(inner: Arc<ClientInner>, mut reader: CodecReader<R>) {
    let codec = inner.codec;
    let err = loop {
        let header = tokio::select! {
            _ = inner.cancel.cancelled() => break Error::Shutdown,
            header = reader.read_header() => header,
        };
        let header = match header {
            Ok(Some(header)) => header,
            Ok(None) => break Error::Shutdown,
            Err(e) => break e,
        };

        match inner.remove_call(header.seq) {
            None => {
                // Usually a call whose write failed and was already resolved.
                tracing::debug!("rpc client: no pending call for seq {}", header.seq);
                if let Err(e) = reader.discard_body().await {
                    break e;
                }
            }
            Some(call) if !header.error.is_empty() => {
                let discarded = reader.discard_body().await;
                call.complete(codec, Outcome::Failed(Error::Invocation(header.error)))
                    .await;
                if let Err(e) = discarded {
                    break e;
                }
            }
            Some(call) => match reader.read_body_raw().await {
                Ok(body) => call.complete(codec, Outcome::Reply(body)).await,
                Err(e) => {
                    call.complete(codec, Outcome::Failed(e.clone())).await;
                    break e;
                }
            },
        }
    };

    tracing::debug!("rpc client: receive loop stopped: {}", err);
    inner.terminate_calls(err).await;
}

/// RPC client bound to one connection.
#[derive(Debug)]
pub struct Client {
    inner: Arc<ClientInner>,
    config: ClientConfig,
}

impl Client {
    /// Send the handshake over `stream` and start the receive loop.
    pub async fn new<S>(stream: S, config: ClientConfig) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let codec = config.codec_type;
        let (reader, mut writer) = tokio::io::split(stream);
        if let Err(e) = handshake::write_options(&mut writer, &Options::new(codec)).await {
            tracing::error!("rpc client: options error: {}", e);
            return Err(e);
        }

        let writer: BoxedWriter = Box::new(writer);
        let inner = Arc::new(ClientInner {
            codec,
            sending: tokio::sync::Mutex::new(CodecWriter::new(writer, codec)),
            state: Mutex::new(ClientState {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
                broken: false,
            }),
            cancel: CancellationToken::new(),
        });
        let reader = CodecReader::new(reader, codec, config.max_frame_bytes);
        tokio::spawn(receive(inner.clone(), reader));

        Ok(Self { inner, config })
    }

    /// Connect over TCP.
    pub async fn dial<T: ToSocketAddrs>(addr: T, config: ClientConfig) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Self::new(stream, config).await
    }

    pub fn codec_type(&self) -> CodecType {
        self.inner.codec
    }

    /// False once the client is closing or its connection has failed.
    pub fn is_available(&self) -> bool {
        let state = self.inner.state();
        !state.shutdown && !state.closing && !state.broken
    }

    /// Start a call; the completed [`Call`] is sent on `done`.
    ///
    /// Returns the sequence number assigned, or 0 if the call failed before
    /// registration (it is still delivered on `done` with its error).
    pub async fn go<A, R>(&self, service_method: &str, args: A, done: mpsc::Sender<Call<A, R>>) -> u64
    where
        A: Serialize + Send + 'static,
        R: DeserializeOwned + Send + 'static,
    {
        let codec = self.inner.codec;
        let body = codec.encode(&args);
        let call: Box<dyn PendingCall> = Box::new(CallSlot {
            call: Call {
                seq: 0,
                service_method: service_method.to_string(),
                args,
                reply: None,
                error: None,
            },
            done,
        });
        let body = match body {
            Ok(body) => body,
            Err(e) => {
                call.complete(codec, Outcome::Failed(e)).await;
                return 0;
            }
        };

        let mut writer = self.inner.sending.lock().await;
        let seq = match self.inner.register_call(call) {
            Ok(seq) => seq,
            Err(call) => {
                drop(writer);
                call.complete(codec, Outcome::Failed(Error::Shutdown)).await;
                return 0;
            }
        };

        let header = Header {
            service_method: service_method.to_string(),
            seq,
            error: String::new(),
        };
        if let Err(e) = writer.write_encoded(&header, &body).await {
            self.inner.state().broken = true;
            drop(writer);
            if let Some(call) = self.inner.remove_call(seq) {
                call.complete(codec, Outcome::Failed(e)).await;
            }
        }
        seq
    }

    /// Like [`Client::go`] with a fresh done queue of the configured capacity.
    pub async fn go_default<A, R>(&self, service_method: &str, args: A) -> mpsc::Receiver<Call<A, R>>
    where
        A: Serialize + Send + 'static,
        R: DeserializeOwned + Send + 'static,
    {
        let (done, receiver) = done_channel(self.config.done_capacity);
        self.go(service_method, args, done).await;
        receiver
    }

    /// Invoke `service_method` and wait for the reply.
    pub async fn call<A, R>(&self, service_method: &str, args: A) -> Result<R>
    where
        A: Serialize + Send + 'static,
        R: DeserializeOwned + Send + 'static,
    {
        let (done, mut receiver) = done_channel(1);
        self.go(service_method, args, done).await;
        receiver.recv().await.ok_or(Error::Shutdown)?.into_result()
    }

    /// Close the connection. Pending calls fail with [`Error::Shutdown`].
    pub async fn close(&self) -> Result<()> {
        let mut writer = self.inner.sending.lock().await;
        {
            let mut state = self.inner.state();
            if state.closing {
                return Err(Error::Shutdown);
            }
            state.closing = true;
        }
        self.inner.cancel.cancel();
        writer.close().await?;
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}
