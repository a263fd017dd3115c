//! Host-side bridge for a re-entrant WASI shell reactor.
//!
//! The guest module exports a small C-style API (`dash_init`, `dash_eval`,
//! variable accessors, `dash_destroy`) and keeps its shell state in linear
//! memory between calls. This crate drives that API from the host: it
//! marshals strings through the guest's own allocator, and it provides the
//! `__setjmp`/`__longjmp` host imports the guest's compiled error recovery
//! depends on, built on an engine execution-snapshot primitive plus a shadow
//! copy of the guest's C stack.
//!
//! The execution engine itself is a collaborator, not part of this crate:
//! see [`engine`] for the contract and [`engine::emulated`] for the
//! in-process implementation used by the test suite and the CLI.

pub mod abi;
pub mod checkpoint;
pub mod engine;
pub mod marshal;

mod error;
mod session;

pub use error::BridgeError;
pub use session::ReactorSession;
