//! usmkit - muxer and demuxer for the CRI USM video container
//!
//! A USM file is a sequence of big-endian framed chunks: a `CRID` info
//! chunk describing the streams, `@SFV`/`@SFA` header and seek-table
//! chunks holding `@UTF` tables, then the lightly encrypted stream chunks.
//!
//! ## Mux pipeline
//!
//! ```text
//! Probe → Validate → DeriveKeys → PackStream → BuildMetadata → Assemble
//! ```
//!
//! - **Probe**: ffprobe reports packet offsets, keyframes and stream properties
//! - **Validate**: VP9 must come in IVF, H264 as raw Annex-B (remuxed if not)
//! - **DeriveKeys**: a 64-bit seed expands into the video and audio keys
//! - **PackStream**: each frame becomes one encrypted stream chunk
//! - **BuildMetadata**: header and seek tables, with self-referential offsets
//! - **Assemble**: info chunk, tables, then the packed stream
//!
//! ## Example
//!
//! ```no_run
//! use usmkit::cli::{create_container, extract_container, CreateOptions, ExtractOptions};
//! use std::path::Path;
//!
//! let usm = create_container(Path::new("movie.ivf"), &CreateOptions::default()).unwrap();
//!
//! let summary = extract_container(&usm, Path::new("out"), &ExtractOptions::default()).unwrap();
//! println!("{} video stream(s)", summary.videos.len());
//! ```

pub mod chunk;
pub mod cli;
pub mod config;
pub mod error;
pub mod mux;
pub mod pipeline;
pub mod probe;
pub mod table;

pub use chunk::{Chunk, ChunkReader, PayloadType};
pub use error::{Result, Stage, UsmError};
pub use pipeline::keys::{derive_keys, parse_key, CipherKeys, DEFAULT_KEY};
pub use probe::{FfmpegTool, MediaTool, ProbeInfo};
pub use table::{pack_pages, Page, Value};
