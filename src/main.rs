//! minirpc demo - serves `Foo.Sum` and calls it concurrently over TCP.
//!
//! ```text
//! minirpc-demo --codec application/json --calls 10
//! minirpc-demo --addr 0.0.0.0:9999 --serve
//! ```

use clap::Parser;
use futures::future::join_all;
use minirpc::observability::init_tracing;
use minirpc::{Client, ClientConfig, CodecType, Config, Registry, Server, Service};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Debug, Parser)]
#[command(name = "minirpc-demo", about = "Multiplexed RPC demo")]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "MINIRPC_ADDR", default_value = "127.0.0.1:0")]
    addr: String,

    /// Body codec used by the demo client.
    #[arg(long, default_value = "application/msgpack")]
    codec: CodecType,

    /// Number of concurrent calls.
    #[arg(long, default_value_t = 5)]
    calls: i32,

    /// Keep serving until Ctrl-C instead of running the client.
    #[arg(long)]
    serve: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Args {
    a: i32,
    b: i32,
}

#[derive(Debug)]
struct Foo;

impl Foo {
    fn sum(&self, args: Args, reply: &mut i32) -> Result<(), String> {
        *reply = args.a.checked_add(args.b).ok_or("overflow")?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = Config::default();
    init_tracing(&config.observability);

    let mut registry = Registry::new();
    registry.register(Service::builder(Foo).method("Sum", Foo::sum).build()?)?;

    let listener = TcpListener::bind(&cli.addr).await?;
    let addr = listener.local_addr()?;
    let server = Arc::new(Server::new(registry, config.server));
    let accepting = server.clone();
    let accept_task = tokio::spawn(async move { accepting.accept(listener).await });
    tracing::info!("minirpc demo serving on {}", addr);

    if cli.serve {
        tokio::signal::ctrl_c().await?;
        tracing::info!("interrupted, shutting down");
        server.shutdown();
        accept_task.await??;
        return Ok(());
    }

    let client = Client::dial(addr, ClientConfig::with_codec(cli.codec)).await?;
    let calls = (0..cli.calls).map(|i| {
        let client = &client;
        async move {
            let args = Args { a: i, b: i * i };
            let reply: minirpc::Result<i32> = client.call("Foo.Sum", args).await;
            (i, reply)
        }
    });
    for (i, reply) in join_all(calls).await {
        match reply {
            Ok(sum) => tracing::info!("{} + {}^2 = {}", i, i, sum),
            Err(e) => tracing::error!("call {} failed: {}", i, e),
        }
    }

    client.close().await?;
    server.shutdown();
    accept_task.await??;
    Ok(())
}
