pub mod address;
pub mod cache;
pub mod chunk;
pub mod metrics;
pub mod poller;
pub mod runtime;
pub mod source;
pub mod stream;
