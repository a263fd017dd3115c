//! Host/guest memory marshaling.
//!
//! Every string or buffer crossing the boundary is allocated in guest
//! linear memory through the guest's own allocator export, and every
//! successful allocation is owned by the host call that made it until
//! explicitly freed. [`with_allocs`] is the acquisition scope that
//! guarantees the matching frees on every exit path.

use crate::abi;
use crate::engine::Instance;
use crate::error::BridgeError;

/// Allocates a null-terminated copy of `s` in guest memory and returns its
/// address. On a rejected write the allocation is released before the error
/// is reported.
pub fn alloc_string(instance: &mut dyn Instance, s: &str) -> Result<u32, BridgeError> {
    let len = s.len() + 1;
    let ret = instance.invoke(abi::EXPORT_MALLOC, &[len as u64])?;
    let ptr = ret.first().copied().unwrap_or(0) as u32;
    if ptr == 0 {
        return Err(BridgeError::AllocFailed { requested: len });
    }
    let mut bytes = Vec::with_capacity(len);
    bytes.extend_from_slice(s.as_bytes());
    bytes.push(0);
    if !instance.memory().write(ptr, &bytes) {
        free_ptr(instance, ptr);
        return Err(BridgeError::WriteFailed { addr: ptr, len });
    }
    Ok(ptr)
}

/// Frees a guest allocation. No-op on null; guest-side errors are swallowed
/// since frees run on cleanup paths where a second error would mask the
/// primary one.
pub fn free_ptr(instance: &mut dyn Instance, addr: u32) {
    if addr == 0 {
        return;
    }
    if let Err(err) = instance.invoke(abi::EXPORT_FREE, &[u64::from(addr)]) {
        tracing::warn!("guest free of {addr:#x} failed: {err}");
    }
}

/// Reads a null-terminated string from guest memory. A null address yields
/// an empty string; the scan also stops at the first unreadable address.
pub fn read_cstring(instance: &mut dyn Instance, addr: u32) -> String {
    if addr == 0 {
        return String::new();
    }
    let memory = instance.memory();
    let mut bytes = Vec::new();
    let mut at = addr;
    loop {
        match memory.read_byte(at) {
            Some(0) | None => break,
            Some(b) => bytes.push(b),
        }
        at = match at.checked_add(1) {
            Some(next) => next,
            None => break,
        };
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Allocates and fills an argv-style array of little-endian 32-bit guest
/// pointers. Returns the array address.
pub fn write_pointer_array(instance: &mut dyn Instance, addrs: &[u32]) -> Result<u32, BridgeError> {
    let len = addrs.len() * abi::PTR_BYTES as usize;
    let ret = instance.invoke(abi::EXPORT_MALLOC, &[len as u64])?;
    let base = ret.first().copied().unwrap_or(0) as u32;
    if base == 0 {
        return Err(BridgeError::AllocFailed { requested: len });
    }
    let mut bytes = Vec::with_capacity(len);
    for addr in addrs {
        bytes.extend_from_slice(&addr.to_le_bytes());
    }
    if !instance.memory().write(base, &bytes) {
        free_ptr(instance, base);
        return Err(BridgeError::WriteFailed { addr: base, len });
    }
    Ok(base)
}

/// Collects the guest allocations made during one call scope.
#[derive(Default)]
pub struct AllocScope {
    ptrs: Vec<u32>,
}

impl AllocScope {
    /// Registers an allocation for release when the scope ends.
    pub fn track(&mut self, ptr: u32) -> u32 {
        self.ptrs.push(ptr);
        ptr
    }
}

/// Runs `f` with an allocation scope and frees every tracked allocation
/// afterwards, whether `f` succeeded or not.
pub fn with_allocs<T>(
    instance: &mut dyn Instance,
    f: impl FnOnce(&mut dyn Instance, &mut AllocScope) -> Result<T, BridgeError>,
) -> Result<T, BridgeError> {
    let mut scope = AllocScope::default();
    let out = f(instance, &mut scope);
    for ptr in scope.ptrs {
        free_ptr(instance, ptr);
    }
    out
}
