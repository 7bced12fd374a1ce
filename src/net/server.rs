// Pool-side RPC listener.
//
// One task per miner connection; each connection carries any number of
// request/response exchanges. The peer address of the TCP stream is the
// miner's observed IP: recorded at registration, immune to whatever the
// miner claims in `reported_ip`.
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use colored::*;
use tokio::net::{TcpListener, TcpStream};

use crate::config::POOL_BIND_ADDRESS;
use crate::net::protocol::{FramedStream, Request, Response};
use crate::pool::MiningPool;

pub async fn start_pool_server(
    pool: Arc<MiningPool>,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = format!("{POOL_BIND_ADDRESS}:{port}").parse::<SocketAddr>()?;
    let listener = TcpListener::bind(addr).await?;
    println!(
        "{} miner RPC listening on {}",
        "[pool]".bright_green().bold(),
        addr
    );
    serve(pool, listener).await
}

/// Accept loop over an already-bound listener (tests bind port 0).
pub async fn serve(
    pool: Arc<MiningPool>,
    listener: TcpListener,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let pool = pool.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer_addr, pool).await {
                eprintln!(
                    "{} {peer_addr} disconnected: {e}",
                    "[pool]".bright_green().bold()
                );
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    pool: Arc<MiningPool>,
) -> io::Result<()> {
    let mut framed = FramedStream::new(stream);
    while let Some(req) = framed.recv_request().await? {
        let resp = dispatch(&pool, req, peer_addr);
        framed.send_response(&resp).await?;
    }
    Ok(())
}

fn dispatch(pool: &MiningPool, req: Request, peer_addr: SocketAddr) -> Response {
    match req {
        Request::Register {
            miner_id,
            reported_ip,
            hostname,
            ..
        } => {
            let observed_ip = peer_addr.ip().to_string();
            match pool.register_miner(&miner_id, &reported_ip, &hostname, &observed_ip) {
                Ok(()) => {
                    println!(
                        "{} registered {} ({} observed {})",
                        "[pool]".bright_green().bold(),
                        miner_id.bright_white(),
                        hostname,
                        observed_ip
                    );
                    Response::Register {
                        success: true,
                        message: "registered".to_string(),
                    }
                }
                Err(e) => Response::Register {
                    success: false,
                    message: e.to_string(),
                },
            }
        }

        Request::GetWork { .. } => Response::Work(pool.get_work()),

        Request::Submit(sub) => {
            let out = pool.submit(&sub);
            if out.accepted {
                println!(
                    "{} block {} accepted from {}",
                    "[pool]".bright_green().bold(),
                    sub.block_index,
                    sub.miner_id.bright_white()
                );
            }
            Response::Submit {
                accepted: out.accepted,
                reward: out.reward,
                message: out.message,
            }
        }

        Request::Heartbeat(status) => {
            let d = pool.heartbeat(&status);
            Response::Heartbeat {
                active: d.active,
                should_mine: d.should_mine,
                cpu_throttle_pct: d.cpu_throttle_pct,
                message: d.message,
            }
        }

        Request::Stop { miner_id, .. } => match pool.stop_miner(&miner_id) {
            Some(blocks) => {
                println!(
                    "{} {} stopped ({} blocks mined)",
                    "[pool]".bright_green().bold(),
                    miner_id.bright_white(),
                    blocks
                );
                Response::Stop {
                    total_blocks_mined: blocks,
                    message: "goodbye".to_string(),
                }
            }
            None => Response::Stop {
                total_blocks_mined: 0,
                message: "unknown miner".to_string(),
            },
        },
    }
}
