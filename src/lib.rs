//! Purpose: Self-rotating, compressed append-only log sink for long-running processes.
//! Exports: `core` (allocation, codecs, ring, errors) plus the top-level `Ring` API.
//! Role: Library backing the `logring` binary; usable directly as an `io::Write` sink.
//! Invariants: Total on-disk footprint is bounded by the configured file count and size.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod core;

pub use crate::core::allocate::{RotationEntry, next_file_name};
pub use crate::core::codec::{Codec, PlainCodec, ZstdCodec};
pub use crate::core::error::{Error, ErrorKind, to_exit_code};
pub use crate::core::ring::{Ring, RingOptions, RingStats};
