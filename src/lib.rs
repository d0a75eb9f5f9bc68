//! # sidecall
//!
//! Call functions inside a companion runtime process as if they were local
//! methods.
//!
//! A [`Bridge`] spawns a companion process (say, a JavaScript engine) with
//! its three standard streams piped, registers a set of named remote
//! operations, and invokes them one at a time over a newline-delimited
//! JSON protocol. The hard part is not the calls - it is making sure the
//! companion can never outlive the host's intent:
//!
//! - **Lazy start**: the companion is spawned on the first invocation (or
//!   an explicit [`Bridge::start`]), exactly once per bridge.
//! - **Deterministic teardown**: [`Bridge::close`] and the drop safety net
//!   both use kill-then-wait ordering, so teardown is bounded even when
//!   the companion ignores the closure of its input stream.
//! - **Fork-safety**: the cleanup record captures the owning process id at
//!   spawn time; a forked descendant dropping its copy of a bridge never
//!   signals the owner's companion.
//!
//! ## Architecture
//!
//! ```text
//! caller ──► Bridge ──► Companion runner ──► child stdin  (requests)
//!                 ▲                    ┌──── child stdout (responses)
//!                 └── dispatcher task ─┤
//!                                      └──── child stderr (diagnostics)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use sidecall::Bridge;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> sidecall::Result<()> {
//!     let bridge = Bridge::builder("node")
//!         .entry("scripts/api.js")
//!         .operation("greet", "module.exports.greet")
//!         .build();
//!
//!     let reply = bridge.invoke("greet", &[json!("world")]).await?;
//!     println!("companion says: {reply}");
//!
//!     bridge.close().await;
//!     Ok(())
//! }
//! ```
//!
//! The companion side of the wire format is documented in [`codec`]; the
//! `loopback` binary shipped with this crate is its reference
//! implementation.

pub mod codec;
pub mod error;

mod bridge;
mod dispatcher;
mod guard;
mod runner;

pub use bridge::{Bridge, BridgeBuilder, DEFAULT_CALL_TIMEOUT, DEFAULT_TEARDOWN_GRACE};
pub use error::{BridgeError, Result};
