// Wire protocol: all messages are length-prefixed frames:
//   [4 bytes MAGIC][4 bytes LE payload length][payload]
// where the payload is a type byte followed by the fields in declaration
// order. Integers are little-endian, strings are u32-length-prefixed UTF-8,
// floats travel as their IEEE-754 bit pattern.
//
// Five request/response operations; the server answers each request with
// exactly one response on the same stream.

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::primitives::{GpuDevice, GpuKind, MinerStatus, Submission, WorkTemplate};

const MAGIC: [u8; 4] = [0x48, 0x46, 0x52, 0x47]; // "HFRG"
// Requests are small; heartbeats dominate and carry at most a handful of
// GPU device entries. 64 KiB keeps a misbehaving peer from forcing large
// allocations.
const MAX_FRAME: usize = 64 * 1024;
const MAX_STR: usize = 1024;
const MAX_GPU_DEVICES: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Register {
        miner_id: String,
        reported_ip: String,
        hostname: String,
        timestamp: i64,
    },
    GetWork {
        miner_id: String,
    },
    Submit(Submission),
    Heartbeat(MinerStatus),
    Stop {
        miner_id: String,
        reported_ip: String,
        hostname: String,
        timestamp: i64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Register {
        success: bool,
        message: String,
    },
    Work(WorkTemplate),
    Submit {
        accepted: bool,
        reward: u64,
        message: String,
    },
    Heartbeat {
        active: bool,
        should_mine: bool,
        cpu_throttle_pct: u8,
        message: String,
    },
    Stop {
        total_blocks_mined: u64,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum MsgType {
    RegisterReq = 0x01,
    GetWorkReq = 0x02,
    SubmitReq = 0x03,
    HeartbeatReq = 0x04,
    StopReq = 0x05,
    RegisterResp = 0x81,
    WorkResp = 0x82,
    SubmitResp = 0x83,
    HeartbeatResp = 0x84,
    StopResp = 0x85,
}

impl MsgType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::RegisterReq),
            0x02 => Some(Self::GetWorkReq),
            0x03 => Some(Self::SubmitReq),
            0x04 => Some(Self::HeartbeatReq),
            0x05 => Some(Self::StopReq),
            0x81 => Some(Self::RegisterResp),
            0x82 => Some(Self::WorkResp),
            0x83 => Some(Self::SubmitResp),
            0x84 => Some(Self::HeartbeatResp),
            0x85 => Some(Self::StopResp),
            _ => None,
        }
    }
}

fn write_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

fn write_bool(buf: &mut Vec<u8>, v: bool) {
    buf.push(v as u8);
}

fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn write_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn write_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn write_f32(buf: &mut Vec<u8>, v: f32) {
    buf.extend_from_slice(&v.to_bits().to_le_bytes());
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    write_u32(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}

fn read_u8(d: &[u8], off: &mut usize) -> Option<u8> {
    let v = *d.get(*off)?;
    *off += 1;
    Some(v)
}

fn read_bool(d: &[u8], off: &mut usize) -> Option<bool> {
    match read_u8(d, off)? {
        0 => Some(false),
        1 => Some(true),
        _ => None,
    }
}

fn read_u32(d: &[u8], off: &mut usize) -> Option<u32> {
    if d.len() < *off + 4 {
        return None;
    }
    let v = u32::from_le_bytes(d[*off..*off + 4].try_into().unwrap());
    *off += 4;
    Some(v)
}

fn read_u64(d: &[u8], off: &mut usize) -> Option<u64> {
    if d.len() < *off + 8 {
        return None;
    }
    let v = u64::from_le_bytes(d[*off..*off + 8].try_into().unwrap());
    *off += 8;
    Some(v)
}

fn read_i64(d: &[u8], off: &mut usize) -> Option<i64> {
    if d.len() < *off + 8 {
        return None;
    }
    let v = i64::from_le_bytes(d[*off..*off + 8].try_into().unwrap());
    *off += 8;
    Some(v)
}

fn read_f32(d: &[u8], off: &mut usize) -> Option<f32> {
    Some(f32::from_bits(read_u32(d, off)?))
}

fn read_str(d: &[u8], off: &mut usize) -> Option<String> {
    let len = read_u32(d, off)? as usize;
    if len > MAX_STR || d.len() < *off + len {
        return None;
    }
    let s = std::str::from_utf8(&d[*off..*off + len]).ok()?.to_string();
    *off += len;
    Some(s)
}

fn write_gpu_devices(buf: &mut Vec<u8>, devices: &[GpuDevice]) {
    write_u8(buf, devices.len().min(MAX_GPU_DEVICES) as u8);
    for dev in devices.iter().take(MAX_GPU_DEVICES) {
        write_u32(buf, dev.id as u32);
        write_str(buf, &dev.name);
        write_u8(buf, matches!(dev.kind, GpuKind::OpenCl) as u8);
        write_u64(buf, dev.memory_bytes);
        write_u32(buf, dev.compute_units as u32);
        write_bool(buf, dev.available);
    }
}

fn read_gpu_devices(d: &[u8], off: &mut usize) -> Option<Vec<GpuDevice>> {
    let count = read_u8(d, off)? as usize;
    if count > MAX_GPU_DEVICES {
        return None;
    }
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let id = read_u32(d, off)? as i32;
        let name = read_str(d, off)?;
        let kind = match read_u8(d, off)? {
            0 => GpuKind::Cuda,
            1 => GpuKind::OpenCl,
            _ => return None,
        };
        let memory_bytes = read_u64(d, off)?;
        let compute_units = read_u32(d, off)? as i32;
        let available = read_bool(d, off)?;
        out.push(GpuDevice {
            id,
            name,
            kind,
            memory_bytes,
            compute_units,
            available,
        });
    }
    Some(out)
}

fn frame(payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    out
}

fn unframe(data: &[u8]) -> Option<&[u8]> {
    if data.len() < 9 || data[..4] != MAGIC {
        return None;
    }
    let payload_len = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
    if data.len() < 8 + payload_len {
        return None;
    }
    Some(&data[8..8 + payload_len])
}

impl Request {
    pub fn encode(&self) -> Vec<u8> {
        let mut p = Vec::new();
        match self {
            Request::Register {
                miner_id,
                reported_ip,
                hostname,
                timestamp,
            } => {
                p.push(MsgType::RegisterReq as u8);
                write_str(&mut p, miner_id);
                write_str(&mut p, reported_ip);
                write_str(&mut p, hostname);
                write_i64(&mut p, *timestamp);
            }
            Request::GetWork { miner_id } => {
                p.push(MsgType::GetWorkReq as u8);
                write_str(&mut p, miner_id);
            }
            Request::Submit(sub) => {
                p.push(MsgType::SubmitReq as u8);
                write_str(&mut p, &sub.miner_id);
                write_u64(&mut p, sub.block_index);
                write_i64(&mut p, sub.nonce);
                write_str(&mut p, &sub.hash);
            }
            Request::Heartbeat(st) => {
                p.push(MsgType::HeartbeatReq as u8);
                write_str(&mut p, &st.miner_id);
                write_u64(&mut p, st.hash_rate);
                write_u64(&mut p, st.blocks_mined);
                write_f32(&mut p, st.cpu_usage_pct);
                write_u64(&mut p, st.total_hashes);
                write_u64(&mut p, st.mining_time_seconds);
                write_gpu_devices(&mut p, &st.gpu_devices);
                write_u64(&mut p, st.gpu_hash_rate);
                write_bool(&mut p, st.gpu_enabled);
                write_bool(&mut p, st.hybrid_mode);
            }
            Request::Stop {
                miner_id,
                reported_ip,
                hostname,
                timestamp,
            } => {
                p.push(MsgType::StopReq as u8);
                write_str(&mut p, miner_id);
                write_str(&mut p, reported_ip);
                write_str(&mut p, hostname);
                write_i64(&mut p, *timestamp);
            }
        }
        frame(p)
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        let payload = unframe(data)?;
        let body = payload.get(1..)?;
        let mut off = 0usize;
        match MsgType::from_u8(payload[0])? {
            MsgType::RegisterReq => Some(Request::Register {
                miner_id: read_str(body, &mut off)?,
                reported_ip: read_str(body, &mut off)?,
                hostname: read_str(body, &mut off)?,
                timestamp: read_i64(body, &mut off)?,
            }),
            MsgType::GetWorkReq => Some(Request::GetWork {
                miner_id: read_str(body, &mut off)?,
            }),
            MsgType::SubmitReq => Some(Request::Submit(Submission {
                miner_id: read_str(body, &mut off)?,
                block_index: read_u64(body, &mut off)?,
                nonce: read_i64(body, &mut off)?,
                hash: read_str(body, &mut off)?,
            })),
            MsgType::HeartbeatReq => Some(Request::Heartbeat(MinerStatus {
                miner_id: read_str(body, &mut off)?,
                hash_rate: read_u64(body, &mut off)?,
                blocks_mined: read_u64(body, &mut off)?,
                cpu_usage_pct: read_f32(body, &mut off)?,
                total_hashes: read_u64(body, &mut off)?,
                mining_time_seconds: read_u64(body, &mut off)?,
                gpu_devices: read_gpu_devices(body, &mut off)?,
                gpu_hash_rate: read_u64(body, &mut off)?,
                gpu_enabled: read_bool(body, &mut off)?,
                hybrid_mode: read_bool(body, &mut off)?,
            })),
            MsgType::StopReq => Some(Request::Stop {
                miner_id: read_str(body, &mut off)?,
                reported_ip: read_str(body, &mut off)?,
                hostname: read_str(body, &mut off)?,
                timestamp: read_i64(body, &mut off)?,
            }),
            _ => None,
        }
    }
}

impl Response {
    pub fn encode(&self) -> Vec<u8> {
        let mut p = Vec::new();
        match self {
            Response::Register { success, message } => {
                p.push(MsgType::RegisterResp as u8);
                write_bool(&mut p, *success);
                write_str(&mut p, message);
            }
            Response::Work(tpl) => {
                p.push(MsgType::WorkResp as u8);
                write_u64(&mut p, tpl.block_index);
                write_i64(&mut p, tpl.timestamp);
                write_str(&mut p, &tpl.data);
                write_str(&mut p, &tpl.previous_hash);
                write_u8(&mut p, tpl.difficulty);
            }
            Response::Submit {
                accepted,
                reward,
                message,
            } => {
                p.push(MsgType::SubmitResp as u8);
                write_bool(&mut p, *accepted);
                write_u64(&mut p, *reward);
                write_str(&mut p, message);
            }
            Response::Heartbeat {
                active,
                should_mine,
                cpu_throttle_pct,
                message,
            } => {
                p.push(MsgType::HeartbeatResp as u8);
                write_bool(&mut p, *active);
                write_bool(&mut p, *should_mine);
                write_u8(&mut p, *cpu_throttle_pct);
                write_str(&mut p, message);
            }
            Response::Stop {
                total_blocks_mined,
                message,
            } => {
                p.push(MsgType::StopResp as u8);
                write_u64(&mut p, *total_blocks_mined);
                write_str(&mut p, message);
            }
        }
        frame(p)
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        let payload = unframe(data)?;
        let body = payload.get(1..)?;
        let mut off = 0usize;
        match MsgType::from_u8(payload[0])? {
            MsgType::RegisterResp => Some(Response::Register {
                success: read_bool(body, &mut off)?,
                message: read_str(body, &mut off)?,
            }),
            MsgType::WorkResp => Some(Response::Work(WorkTemplate {
                block_index: read_u64(body, &mut off)?,
                timestamp: read_i64(body, &mut off)?,
                data: read_str(body, &mut off)?,
                previous_hash: read_str(body, &mut off)?,
                difficulty: read_u8(body, &mut off)?,
            })),
            MsgType::SubmitResp => Some(Response::Submit {
                accepted: read_bool(body, &mut off)?,
                reward: read_u64(body, &mut off)?,
                message: read_str(body, &mut off)?,
            }),
            MsgType::HeartbeatResp => Some(Response::Heartbeat {
                active: read_bool(body, &mut off)?,
                should_mine: read_bool(body, &mut off)?,
                cpu_throttle_pct: read_u8(body, &mut off)?,
                message: read_str(body, &mut off)?,
            }),
            MsgType::StopResp => Some(Response::Stop {
                total_blocks_mined: read_u64(body, &mut off)?,
                message: read_str(body, &mut off)?,
            }),
            _ => None,
        }
    }
}

pub struct FramedStream {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl FramedStream {
    pub fn new(stream: TcpStream) -> Self {
        FramedStream {
            stream,
            buf: Vec::new(),
        }
    }

    pub fn peer_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.stream.local_addr()
    }

    pub async fn send_request(&mut self, req: &Request) -> io::Result<()> {
        self.stream.write_all(&req.encode()).await
    }

    pub async fn send_response(&mut self, resp: &Response) -> io::Result<()> {
        self.stream.write_all(&resp.encode()).await
    }

    /// None means the peer closed the stream cleanly between frames.
    pub async fn recv_request(&mut self) -> io::Result<Option<Request>> {
        match self.recv_frame().await? {
            Some(frame) => Request::decode(&frame)
                .map(Some)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed request")),
            None => Ok(None),
        }
    }

    pub async fn recv_response(&mut self) -> io::Result<Response> {
        match self.recv_frame().await? {
            Some(frame) => Response::decode(&frame)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed response")),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-exchange",
            )),
        }
    }

    async fn recv_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            // Do we have a full frame already buffered?
            if self.buf.len() >= 8 {
                if self.buf[..4] != MAGIC {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "bad magic"));
                }
                let payload_len = u32::from_le_bytes(self.buf[4..8].try_into().unwrap()) as usize;
                if payload_len > MAX_FRAME {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
                }
                let frame_len = 8 + payload_len;
                if self.buf.len() >= frame_len {
                    let frame = self.buf[..frame_len].to_vec();
                    self.buf.drain(..frame_len);
                    return Ok(Some(frame));
                }
            }

            // Need more data
            let mut tmp = vec![0u8; 4096];
            let n = self.stream.read(&mut tmp).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated frame",
                ));
            }
            self.buf.extend_from_slice(&tmp[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_req(req: Request) -> Request {
        Request::decode(&req.encode()).expect("decode failed")
    }

    fn roundtrip_resp(resp: Response) -> Response {
        Response::decode(&resp.encode()).expect("decode failed")
    }

    #[test]
    fn test_register_roundtrip() {
        let req = Request::Register {
            miner_id: "miner-7".to_string(),
            reported_ip: "10.1.2.3".to_string(),
            hostname: "rig01".to_string(),
            timestamp: 1700000000,
        };
        assert_eq!(roundtrip_req(req.clone()), req);
    }

    #[test]
    fn test_heartbeat_roundtrip_with_gpus() {
        let st = MinerStatus {
            miner_id: "miner-7".to_string(),
            hash_rate: 123456,
            blocks_mined: 3,
            cpu_usage_pct: 87.5,
            total_hashes: 9999999,
            mining_time_seconds: 3600,
            gpu_devices: vec![GpuDevice {
                id: 0,
                name: "Test GPU".to_string(),
                kind: GpuKind::OpenCl,
                memory_bytes: 8 << 30,
                compute_units: 64,
                available: true,
            }],
            gpu_hash_rate: 100000,
            gpu_enabled: true,
            hybrid_mode: true,
        };
        let back = roundtrip_req(Request::Heartbeat(st.clone()));
        if let Request::Heartbeat(b) = back {
            assert_eq!(b.miner_id, st.miner_id);
            assert_eq!(b.cpu_usage_pct, st.cpu_usage_pct);
            assert_eq!(b.gpu_devices, st.gpu_devices);
            assert!(b.hybrid_mode);
        } else {
            panic!("wrong type");
        }
    }

    #[test]
    fn test_work_response_roundtrip() {
        let resp = Response::Work(WorkTemplate {
            block_index: 42,
            timestamp: 1700000000,
            data: "Block 42".to_string(),
            previous_hash: "0".repeat(64),
            difficulty: 4,
        });
        assert_eq!(roundtrip_resp(resp.clone()), resp);
    }

    #[test]
    fn test_submit_negative_nonce() {
        let req = Request::Submit(Submission {
            miner_id: "m".to_string(),
            block_index: 1,
            nonce: -12345,
            hash: "ab".repeat(32),
        });
        assert_eq!(roundtrip_req(req.clone()), req);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut enc = Request::GetWork {
            miner_id: "m".to_string(),
        }
        .encode();
        enc[0] = 0xFF;
        assert!(Request::decode(&enc).is_none());
    }

    #[test]
    fn test_oversized_string_rejected() {
        // Hand-build a GetWork whose string length field lies.
        let mut p = vec![MsgType::GetWorkReq as u8];
        write_u32(&mut p, (MAX_STR + 1) as u32);
        let data = frame(p);
        assert!(Request::decode(&data).is_none());
    }
}
