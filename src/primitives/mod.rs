pub mod block;

pub use block::{Block, GpuDevice, GpuKind, MinerStatus, Submission, WorkTemplate, unix_now};
