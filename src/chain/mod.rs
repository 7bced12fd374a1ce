pub mod blockchain;

pub use blockchain::{AppendError, Blockchain, ValidationError};
