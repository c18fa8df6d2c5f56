pub mod client;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod framer;
pub mod generator;
pub mod handle;
pub mod model;
pub mod normalizer;
pub mod reassembly;
pub mod server;
pub mod stream;
pub mod telemetry;
#[cfg(test)]
pub mod test_util;
