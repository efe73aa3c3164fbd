#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
// Allow acronyms like DRM
#![allow(clippy::upper_case_acronyms)]

//! # kmspool: zero-copy video buffers for Wayland compositors
//!
//! This crate allocates DRM/dma-buf backed memory for decoded video frames and hands it to a remote
//! Wayland compositor without copying pixel data. It focuses on the hard, stateful part of a video
//! sink: acquiring native memory per plane, wrapping it into a compositor-side buffer through an
//! asynchronous protocol handshake, tracking which frames are on loan to the compositor and reclaiming
//! every native resource exactly once.
//!
//! ## Structure of the crate
//!
//! Everything lives in the [`backend`] module:
//!
//! - [`backend::allocator`] obtains plane memory, either from dumb buffer objects of a DRM device
//!   or from dma-bufs that already exist.
//! - [`backend::remote`] describes the compositor protocol as a small [`Transport`](backend::remote::Transport)
//!   trait and implements the blocking buffer construction handshake on top of it.
//! - [`backend::pool`] is the fixed capacity buffer pool tying both together. It is the home of
//!   [`LocalBuffer`](backend::pool::LocalBuffer), the per-frame object handed to the pipeline, and of
//!   the registry resolving release notifications.
//! - `backend::wayland` (feature `backend_wayland`) implements the transport over `zwp_linux_dmabuf_v1`.
//!
//! ## Threads
//!
//! Two threads matter: the pipeline thread allocating, filling and committing buffers, and the
//! protocol dispatch thread reading the compositor connection and delivering events. The buffer
//! construction handshake blocks the pipeline thread for at most [`HANDSHAKE_TIMEOUT`](backend::remote::HANDSHAKE_TIMEOUT)
//! until the dispatch thread has delivered the outcome. Tearing down a buffer performs a blocking
//! roundtrip and must therefore not happen on the dispatch thread; the Wayland transport degrades
//! to a plain flush in that case.
//!
//! ### Logging
//!
//! kmspool makes extensive use of [`tracing`] for its internal logging.
//!
//! For release builds it is recommended to limit the log level during compile time.
//! This can be done by adding a dependency to [`tracing`] and enabling the corresponding features.
//! For example to enable `trace` messages for debug builds, but limit release builds to `debug` add
//! the following in your binary crate `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! tracing = { version = "0.1", features = ["max_level_trace", "release_max_level_debug"] }
//! ```

pub mod backend;
pub mod utils;
