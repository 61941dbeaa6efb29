pub mod env;
pub mod envelope;
pub mod memory;
pub mod redis;
pub mod retries;
pub mod telemetry;
pub mod time;
