//! imagec: filesystem-backed I/O for `imagec-pipeline`.
//!
//! Provides an [`ImageIo`](imagec_pipeline::ImageIo) over image files, a
//! newline-delimited JSON [`ResultsSink`](imagec_pipeline::ResultsSink),
//! and configuration loading for the `imagec` binary.

pub mod config;
pub mod file_io;
pub mod jsonl;

pub use config::load_config;
pub use file_io::FileImageIo;
pub use jsonl::JsonLinesSink;
