// Miner-side RPC client.
//
// Holds one framed connection to the pool and reconnects lazily: any
// transport error drops the stream so the next call dials again. Startup
// uses a bounded retry window; after registration the control loop decides
// what a failed call means.
use std::io;
use std::time::Duration;

use colored::*;
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep};

use crate::config::{MAX_RETRY_SECS, RETRY_INTERVAL_SECS};
use crate::net::protocol::{FramedStream, Request, Response};
use crate::pool::HeartbeatDirective;
use crate::primitives::{MinerStatus, Submission, WorkTemplate, unix_now};

pub struct PoolClient {
    addr: String,
    stream: Option<FramedStream>,
}

impl PoolClient {
    pub fn new(addr: impl Into<String>) -> Self {
        PoolClient {
            addr: addr.into(),
            stream: None,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// The IP of our side of the pool connection: what the miner reports
    /// about itself.
    pub fn local_ip(&self) -> String {
        self.stream
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    async fn ensure_connected(&mut self) -> io::Result<()> {
        if self.stream.is_none() {
            let stream = TcpStream::connect(&self.addr).await?;
            self.stream = Some(FramedStream::new(stream));
        }
        Ok(())
    }

    /// Dial until connected, every RETRY_INTERVAL_SECS for up to
    /// MAX_RETRY_SECS, then give up with the last error.
    pub async fn connect_with_retry(&mut self) -> io::Result<()> {
        let deadline = Instant::now() + Duration::from_secs(MAX_RETRY_SECS);
        loop {
            match self.ensure_connected().await {
                Ok(()) => return Ok(()),
                Err(e) if Instant::now() >= deadline => {
                    return Err(io::Error::new(
                        e.kind(),
                        format!(
                            "connection lost after {} minutes: {e}",
                            MAX_RETRY_SECS / 60
                        ),
                    ));
                }
                Err(e) => {
                    eprintln!(
                        "{} cannot reach pool at {} ({e}); retrying in {}s",
                        "[miner]".bright_cyan().bold(),
                        self.addr,
                        RETRY_INTERVAL_SECS
                    );
                    sleep(Duration::from_secs(RETRY_INTERVAL_SECS)).await;
                }
            }
        }
    }

    /// One request/response exchange. Any failure tears the stream down so
    /// the next call reconnects from scratch.
    async fn call(&mut self, req: &Request) -> io::Result<Response> {
        self.ensure_connected().await?;
        let framed = self.stream.as_mut().expect("stream just ensured");
        let result = async {
            framed.send_request(req).await?;
            framed.recv_response().await
        }
        .await;
        if result.is_err() {
            self.stream = None;
        }
        result
    }

    pub async fn register(&mut self, miner_id: &str, hostname: &str) -> io::Result<(bool, String)> {
        self.ensure_connected().await?;
        let req = Request::Register {
            miner_id: miner_id.to_string(),
            reported_ip: self.local_ip(),
            hostname: hostname.to_string(),
            timestamp: unix_now(),
        };
        match self.call(&req).await? {
            Response::Register { success, message } => Ok((success, message)),
            _ => Err(unexpected_response()),
        }
    }

    pub async fn get_work(&mut self, miner_id: &str) -> io::Result<WorkTemplate> {
        let req = Request::GetWork {
            miner_id: miner_id.to_string(),
        };
        match self.call(&req).await? {
            Response::Work(tpl) => Ok(tpl),
            _ => Err(unexpected_response()),
        }
    }

    pub async fn submit_work(&mut self, sub: Submission) -> io::Result<(bool, u64, String)> {
        match self.call(&Request::Submit(sub)).await? {
            Response::Submit {
                accepted,
                reward,
                message,
            } => Ok((accepted, reward, message)),
            _ => Err(unexpected_response()),
        }
    }

    pub async fn heartbeat(&mut self, status: MinerStatus) -> io::Result<HeartbeatDirective> {
        match self.call(&Request::Heartbeat(status)).await? {
            Response::Heartbeat {
                active,
                should_mine,
                cpu_throttle_pct,
                message,
            } => Ok(HeartbeatDirective {
                active,
                should_mine,
                cpu_throttle_pct,
                message,
            }),
            _ => Err(unexpected_response()),
        }
    }

    pub async fn stop_mining(&mut self, miner_id: &str, hostname: &str) -> io::Result<(u64, String)> {
        self.ensure_connected().await?;
        let req = Request::Stop {
            miner_id: miner_id.to_string(),
            reported_ip: self.local_ip(),
            hostname: hostname.to_string(),
            timestamp: unix_now(),
        };
        match self.call(&req).await? {
            Response::Stop {
                total_blocks_mined,
                message,
            } => Ok((total_blocks_mined, message)),
            _ => Err(unexpected_response()),
        }
    }
}

fn unexpected_response() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "unexpected response type")
}
