//! The replikv replica process.
//!
//! Everything outside the consensus core lives here: argument parsing,
//! logging setup, the datagram socket, and the event loop. All peer and
//! client traffic flows through one UDP socket connected to a local router;
//! each datagram is one JSON envelope.
//!
//! The loop is single-threaded and event-driven: it blocks on the socket no
//! longer than the replica's nearest deadline (election timeout, or the
//! heartbeat cadence while leader), so timers fire on time even when the
//! network is silent.

use std::net::Ipv4Addr;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use replikv_raft::{Envelope, Replica, ReplicaConfig};
use tokio::net::UdpSocket;
use tokio::time::{sleep_until, Instant as TokioInstant};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Run a single replica of the replicated key-value store.
#[derive(Parser, Debug)]
#[command(author, version, about = "replikv replica")]
struct Args {
    /// UDP port of the local router carrying all peer and client traffic
    port: u16,

    /// Id of this replica
    id: String,

    /// Ids of the other replicas in the cluster
    peers: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    run(args).await
}

async fn run(args: Args) -> Result<()> {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .context("failed to bind datagram socket")?;
    socket
        .connect((Ipv4Addr::LOCALHOST, args.port))
        .await
        .with_context(|| format!("failed to connect to router on port {}", args.port))?;

    let config = ReplicaConfig::new(args.id.clone(), args.peers);
    let mut replica = Replica::new(config, Instant::now())?;
    info!(id = %args.id, port = args.port, "replica starting");

    send(&socket, &replica.hello()).await;

    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let now = Instant::now();
        for env in replica.tick(now) {
            send(&socket, &env).await;
        }

        let wake = TokioInstant::from_std(replica.next_wake());
        tokio::select! {
            received = socket.recv(&mut buf) => {
                let len = match received {
                    Ok(len) => len,
                    Err(err) => {
                        warn!(%err, "receive failed");
                        continue;
                    }
                };
                let msg = match Envelope::from_bytes(&buf[..len]) {
                    Ok(msg) => msg,
                    Err(err) => {
                        warn!(%err, "dropping malformed datagram");
                        continue;
                    }
                };
                debug!(src = %msg.src, "received message");
                match replica.handle(Instant::now(), msg) {
                    Ok(out) => {
                        for env in out {
                            send(&socket, &env).await;
                        }
                    }
                    Err(err) => warn!(%err, "failed to process message"),
                }
            }
            _ = sleep_until(wake) => {}
        }
    }
}

async fn send(socket: &UdpSocket, env: &Envelope) {
    match env.to_bytes() {
        Ok(bytes) => {
            if let Err(err) = socket.send(&bytes).await {
                warn!(%err, dst = %env.dst, "send failed");
            }
        }
        Err(err) => warn!(%err, "failed to encode outgoing message"),
    }
}
