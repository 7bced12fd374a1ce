/// Standard Protocol Ports
pub const POOL_PORT: u16 = 50051;
pub const HTTP_PORT: u16 = 8080;

/// Consensus defaults: difficulty is the number of leading hex-zero
/// nibbles required in a block hash.
pub const DEFAULT_DIFFICULTY: u8 = 4;
pub const BLOCK_REWARD: u64 = 50;

/// Heartbeat cadence. A miner is counted as active while its last
/// heartbeat is within LIVENESS_FACTOR * HEARTBEAT_INTERVAL_SECS.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const LIVENESS_FACTOR: u64 = 2;

/// Client-side reconnection policy at startup.
pub const RETRY_INTERVAL_SECS: u64 = 10;
pub const MAX_RETRY_SECS: u64 = 300;

/// Work template refresh: a cached template older than TEMPLATE_MAX_AGE_SECS
/// is dropped by the background tick so timestamps never go indefinitely
/// stale.
pub const TEMPLATE_MAX_AGE_SECS: i64 = 60;
pub const TEMPLATE_REFRESH_TICK_SECS: u64 = 30;

/// How often a racing miner re-polls GetWork to spot a tip advance.
pub const WORK_POLL_SECS: u64 = 5;

/// Hybrid nonce partition: GPU back-ends own [0, GPU_NONCE_START), scanned
/// in GPU_BATCH chunks; CPU workers stride upward from GPU_NONCE_START.
pub const GPU_NONCE_START: i64 = 5_000_000_000;
pub const GPU_BATCH: u64 = 500_000_000;

/// CPU workers re-check cancellation and throttle every this many hashes.
pub const THROTTLE_CHECK_HASHES: u64 = 1000;

/// Bind address for the miner RPC listener.
pub const POOL_BIND_ADDRESS: &str = "0.0.0.0";

/// Bind address for admin HTTP: 127.0.0.1 for local-only access (Security)
pub const HTTP_BIND_ADDRESS: &str = "127.0.0.1";

/// Default pool address a miner connects to.
pub const DEFAULT_SERVER_ADDR: &str = "localhost:50051";

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| {
            let v = v.trim().to_ascii_lowercase();
            v == "1" || v == "true" || v == "yes" || v == "on"
        })
        .unwrap_or(false)
}

pub fn pool_port() -> u16 {
    env_u16("HASHFORGE_POOL_PORT", POOL_PORT)
}

pub fn http_port() -> u16 {
    env_u16("HASHFORGE_HTTP_PORT", HTTP_PORT)
}

pub fn difficulty() -> u8 {
    std::env::var("HASHFORGE_DIFFICULTY")
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(DEFAULT_DIFFICULTY)
}

pub fn block_reward() -> u64 {
    std::env::var("HASHFORGE_REWARD")
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(BLOCK_REWARD)
}

/// Admin bearer token, if pinned through the environment. Absent means the
/// daemon generates a fresh 64-hex token at startup.
pub fn admin_token() -> Option<String> {
    std::env::var("HASHFORGE_ADMIN_TOKEN")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn server_addr() -> String {
    std::env::var("HASHFORGE_SERVER")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_SERVER_ADDR.to_string())
}

pub fn gpu_enabled() -> bool {
    env_flag("HASHFORGE_GPU")
}

pub fn hybrid_enabled() -> bool {
    env_flag("HASHFORGE_HYBRID")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_constants() {
        assert_eq!(LIVENESS_FACTOR * HEARTBEAT_INTERVAL_SECS, 60);
        assert!(GPU_NONCE_START > 0);
        assert!((GPU_BATCH as i64) < GPU_NONCE_START);
    }
}
