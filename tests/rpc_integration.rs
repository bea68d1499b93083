//! RPC integration tests - handshake → dispatch → registry → response over TCP.

use minirpc::rpc::codec::{read_frame, write_frame, FRAME_OPTIONS};
use minirpc::rpc::handshake::{write_options, Options};
use minirpc::rpc::done_channel;
use minirpc::{Client, ClientConfig, CodecType, Error, Registry, Server, ServerConfig, Service};
use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Args {
    a: i64,
    b: i64,
}

struct Foo;

impl Foo {
    fn sum(&self, args: Args, reply: &mut i64) -> Result<(), String> {
        *reply = args.a + args.b;
        Ok(())
    }

    fn sleep(&self, ms: u64, reply: &mut u64) -> Result<(), String> {
        std::thread::sleep(Duration::from_millis(ms));
        *reply = ms;
        Ok(())
    }

    fn fail(&self, reason: String, _reply: &mut ()) -> Result<(), String> {
        Err(reason)
    }

    fn tally(&self, words: Vec<String>, reply: &mut HashMap<String, u32>) -> Result<(), String> {
        for word in words {
            *reply.entry(word).or_default() += 1;
        }
        Ok(())
    }
}

fn foo_registry() -> Registry {
    let foo = Service::builder(Foo)
        .method("Sum", Foo::sum)
        .method("Sleep", Foo::sleep)
        .method("Fail", Foo::fail)
        .method("Tally", Foo::tally)
        .build()
        .unwrap();
    let mut registry = Registry::new();
    registry.register(foo).unwrap();
    registry
}

/// Helper: serve `foo_registry()` on a random local port.
async fn start_test_server() -> (SocketAddr, Arc<Server>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(Server::new(foo_registry(), ServerConfig::default()));

    let accepting = server.clone();
    tokio::spawn(async move {
        let _ = accepting.accept(listener).await;
    });

    (addr, server)
}

async fn dial(addr: SocketAddr, codec: CodecType) -> Client {
    Client::dial(addr, ClientConfig::with_codec(codec)).await.unwrap()
}

#[tokio::test]
async fn test_sum_round_trip() {
    let (addr, server) = start_test_server().await;
    for codec in CodecType::ALL {
        let client = dial(addr, codec).await;
        let reply: i64 = client.call("Foo.Sum", Args { a: 1, b: 2 }).await.unwrap();
        assert_eq!(reply, 3);
        client.close().await.unwrap();
    }
    assert_eq!(server.registry().find("Foo.Sum").unwrap().num_calls(), 2);
}

#[tokio::test]
async fn test_five_async_calls_complete() {
    let (addr, _server) = start_test_server().await;
    let client = dial(addr, CodecType::MsgPack).await;

    let (done, mut completed) = done_channel(10);
    let mut seqs = Vec::new();
    for i in 0..5 {
        // Earlier calls sleep longer, so responses arrive in reverse.
        seqs.push(client.go("Foo.Sleep", (5 - i) * 20, done.clone()).await);
    }
    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);

    let mut finished = Vec::new();
    for _ in 0..5 {
        let call: minirpc::Call<u64, u64> = completed.recv().await.unwrap();
        assert!(call.error.is_none());
        assert_eq!(call.reply, Some(call.args));
        finished.push(call.seq);
    }
    finished.sort_unstable();
    assert_eq!(finished, seqs);
}

#[tokio::test]
async fn test_concurrent_calls_complete_exactly_once() {
    let (addr, _server) = start_test_server().await;
    let client = Arc::new(dial(addr, CodecType::Json).await);

    const CALLS: i64 = 64;
    let (done, mut completed) = done_channel::<Args, i64>(CALLS as usize);
    let mut tasks = Vec::new();
    for i in 0..CALLS {
        let client = client.clone();
        let done = done.clone();
        tasks.push(tokio::spawn(async move {
            client.go("Foo.Sum", Args { a: i, b: i }, done).await
        }));
    }
    drop(done);

    let mut issued = HashSet::new();
    for task in tasks {
        assert!(issued.insert(task.await.unwrap()));
    }
    assert_eq!(issued, (1..=CALLS as u64).collect::<HashSet<_>>());

    let mut seen = HashSet::new();
    while let Some(call) = completed.recv().await {
        assert!(seen.insert(call.seq), "seq {} completed twice", call.seq);
        assert_eq!(call.reply, Some(call.args.a * 2));
    }
    assert_eq!(seen, issued);
}

#[tokio::test]
async fn test_unknown_service_keeps_connection_usable() {
    let (addr, _server) = start_test_server().await;
    let client = dial(addr, CodecType::MsgPack).await;

    let err = client.call::<_, i64>("Bar.Sum", Args { a: 1, b: 1 }).await.unwrap_err();
    assert_eq!(err.to_string(), "rpc server: can't find service Bar");

    let err = client.call::<_, i64>("Foo.Product", Args { a: 1, b: 1 }).await.unwrap_err();
    assert_eq!(err.to_string(), "rpc server: can't find method Product");

    let err = client.call::<_, i64>("nonsense", ()).await.unwrap_err();
    assert!(err.to_string().contains("ill-formed"));

    let reply: i64 = client.call("Foo.Sum", Args { a: 20, b: 22 }).await.unwrap();
    assert_eq!(reply, 42);
    assert!(client.is_available());
}

#[tokio::test]
async fn test_method_error_and_bad_args_are_call_scoped() {
    let (addr, server) = start_test_server().await;
    let client = dial(addr, CodecType::Json).await;

    let err = client.call::<_, ()>("Foo.Fail", "disk on fire").await.unwrap_err();
    assert!(matches!(err, Error::Invocation(ref msg) if msg == "disk on fire"));

    let err = client.call::<_, i64>("Foo.Sum", "one plus two").await.unwrap_err();
    assert!(matches!(err, Error::Invocation(ref msg) if msg.starts_with("decode error")));

    let reply: i64 = client.call("Foo.Sum", Args { a: -1, b: 1 }).await.unwrap();
    assert_eq!(reply, 0);

    let registry = server.registry();
    assert_eq!(registry.find("Foo.Fail").unwrap().num_calls(), 1);
    // Undecodable arguments never reach the method.
    assert_eq!(registry.find("Foo.Sum").unwrap().num_calls(), 1);
}

#[tokio::test]
async fn test_map_reply() {
    let (addr, _server) = start_test_server().await;
    let client = dial(addr, CodecType::MsgPack).await;

    let empty: HashMap<String, u32> = client.call("Foo.Tally", Vec::<String>::new()).await.unwrap();
    assert!(empty.is_empty());

    let words = vec!["a".to_string(), "b".to_string(), "a".to_string()];
    let tally: HashMap<String, u32> = client.call("Foo.Tally", words).await.unwrap();
    assert_eq!(tally.get("a"), Some(&2));
    assert_eq!(tally.get("b"), Some(&1));
}

#[tokio::test]
async fn test_closed_client_fails_fast() {
    let (addr, _server) = start_test_server().await;
    let client = dial(addr, CodecType::Json).await;

    let mut pending = client.go_default::<_, u64>("Foo.Sleep", 200u64).await;
    client.close().await.unwrap();

    let call = pending.recv().await.unwrap();
    assert!(call.error.unwrap().is_shutdown());
    assert!(!client.is_available());

    let err = client.call::<_, i64>("Foo.Sum", Args { a: 1, b: 2 }).await.unwrap_err();
    assert!(err.is_shutdown());
}

#[tokio::test]
async fn test_bad_magic_closes_connection() {
    let (addr, _server) = start_test_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let options = Options {
        magic_number: 0xdead,
        codec_type: CodecType::Json,
    };
    write_options(&mut stream, &options).await.unwrap();

    let mut buf = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read, 0);
}

#[tokio::test]
async fn test_unknown_codec_closes_connection() {
    let (addr, _server) = start_test_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let payload = br#"{"MagicNumber":3927900,"CodecType":"application/gob"}"#;
    write_frame(&mut stream, FRAME_OPTIONS, payload).await.unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(5), read_frame(&mut stream, 1024))
        .await
        .unwrap()
        .unwrap();
    assert!(frame.is_none());
}

#[tokio::test]
async fn test_server_shutdown_fails_pending_calls() {
    let (addr, server) = start_test_server().await;
    let client = dial(addr, CodecType::MsgPack).await;
    assert_eq!(client.call::<_, i64>("Foo.Sum", Args { a: 2, b: 2 }).await.unwrap(), 4);

    server.shutdown();

    // The connection drains and closes; once the client sees EOF every
    // call fails with a shutdown error.
    let err = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match client.call::<_, i64>("Foo.Sum", Args { a: 1, b: 1 }).await {
                Err(err) if err.is_shutdown() => break err,
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
    })
    .await
    .unwrap();
    assert!(err.is_shutdown());
}
