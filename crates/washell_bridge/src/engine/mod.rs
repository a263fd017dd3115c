//! Contract between the bridge and the WASM execution engine.
//!
//! The bridge does not embed an engine. It requires one that provides module
//! instantiation, exported-function invocation, linear-memory and mutable
//! global access, and an execution-snapshot capability: capture the state of
//! an in-flight host-import call, and later resume execution as if that call
//! had returned a given value. These capabilities are expressed as the
//! traits below; [`emulated`] is the in-process implementation used by the
//! test suite and the CLI.

mod config;
pub mod emulated;

pub use config::WasiConfig;

use thiserror::Error;

/// Wasm page size (64KB).
pub const WASM_PAGE_SIZE: usize = 65536;

/// Failures reported by an engine implementation.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to instantiate guest module")]
    Instantiation(#[source] anyhow::Error),
    #[error("unknown export `{0}`")]
    UnknownExport(String),
    #[error("guest call trapped")]
    Trap(#[source] anyhow::Error),
    #[error("unknown global `{0}`")]
    UnknownGlobal(String),
    #[error("global `{0}` is not mutable")]
    ImmutableGlobal(String),
}

/// Bounds-checked access to guest linear memory. Failed accesses report
/// `false`/`None` rather than trapping; the address space is untyped and the
/// caller decides whether an out-of-range access is an error.
pub trait Memory {
    /// Current memory size in bytes.
    fn size(&self) -> u32;

    /// Reads `buf.len()` bytes starting at `addr`. False if out of range.
    fn read(&self, addr: u32, buf: &mut [u8]) -> bool;

    /// Writes `data` starting at `addr`. False if out of range.
    fn write(&mut self, addr: u32, data: &[u8]) -> bool;

    fn read_byte(&self, addr: u32) -> Option<u8> {
        let mut buf = [0u8; 1];
        self.read(addr, &mut buf).then(|| buf[0])
    }

    fn read_u32_le(&self, addr: u32) -> Option<u32> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf).then(|| u32::from_le_bytes(buf))
    }

    fn read_u64_le(&self, addr: u32) -> Option<u64> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf).then(|| u64::from_le_bytes(buf))
    }

    fn write_u32_le(&mut self, addr: u32, value: u32) -> bool {
        self.write(addr, &value.to_le_bytes())
    }

    fn write_u64_le(&mut self, addr: u32, value: u64) -> bool {
        self.write(addr, &value.to_le_bytes())
    }
}

/// A captured execution state: the engine's call and operand stack at the
/// moment a host import was entered. Opaque and engine-owned.
pub trait Snapshot {
    /// Resumes execution as if the snapshotted import call had returned
    /// `value`. Control transfers back into the guest at the capture site;
    /// this call never returns to its caller. May be invoked more than once
    /// for the same snapshot.
    fn restore(&self, value: i32) -> !;
}

/// The view a host import function gets of the live instance mid-call.
pub trait HostScope {
    /// Captures the engine execution state of the current import call.
    fn snapshot(&mut self) -> Box<dyn Snapshot>;

    /// Guest linear memory.
    fn memory(&mut self) -> &mut dyn Memory;

    /// Reads a named module global.
    fn global_get(&self, name: &str) -> Result<u64, EngineError>;

    /// Writes a named mutable module global.
    fn global_set(&mut self, name: &str, value: u64) -> Result<(), EngineError>;
}

/// Host function installed as the guest's setjmp-equivalent import
/// ([`crate::abi::IMPORT_SETJMP`]). An `Err` traps the guest call.
pub type SetjmpFn = Box<dyn FnMut(&mut dyn HostScope, u32) -> anyhow::Result<i32>>;

/// Host function installed as the guest's longjmp-equivalent import
/// ([`crate::abi::IMPORT_LONGJMP`]). Diverges through [`Snapshot::restore`]
/// on success; an `Err` traps the guest call.
pub type LongjmpFn = Box<dyn FnMut(&mut dyn HostScope, u32, i32) -> anyhow::Result<()>>;

/// Host imports installed in the [`crate::abi::IMPORT_MODULE`] namespace
/// before instantiation. WASI-style OS shims are the engine's own concern,
/// configured through [`WasiConfig`].
pub struct ImportTable {
    pub setjmp: SetjmpFn,
    pub longjmp: LongjmpFn,
}

/// An instantiated guest module.
pub trait Instance {
    /// Invokes an exported function. Results are raw 64-bit values with
    /// i32 results zero-extended.
    fn invoke(&mut self, export: &str, args: &[u64]) -> Result<Vec<u64>, EngineError>;

    /// Whether the module exports `name` as a function.
    fn has_export(&self, name: &str) -> bool;

    /// Guest linear memory, for marshaling outside of import calls.
    fn memory(&mut self) -> &mut dyn Memory;

    /// Releases the instance. Tolerates being called more than once.
    fn close(&mut self);
}

/// Module instantiation. One engine may instantiate many independent guests.
pub trait Engine {
    fn instantiate(
        &mut self,
        image: &[u8],
        wasi: &WasiConfig,
        imports: ImportTable,
    ) -> Result<Box<dyn Instance>, EngineError>;
}
