//! setjmp/longjmp emulation over engine execution snapshots.
//!
//! The engine snapshot restores its own call and operand stack, but the
//! guest's compiled C runtime also spills locals into linear memory between
//! the stack-pointer global and the heap base. A checkpoint therefore pairs
//! the engine snapshot with a byte-for-byte shadow copy of that region, and
//! a restore puts both back before resuming the capture site.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::bail;
use thiserror::Error;

use crate::abi;
use crate::engine::{HostScope, ImportTable, Snapshot};

/// Saved execution state for one setjmp call. Immutable once captured;
/// referenced by its index in the store, never copied.
pub struct Checkpoint {
    snapshot: Box<dyn Snapshot>,
    stack_pointer: u32,
    shadow_stack: Vec<u8>,
}

/// Ordered checkpoint table for one session. Insertion order defines the
/// stable index written into guest jump buffers. The table only grows for
/// the lifetime of the session; the guest never signals when a jump buffer
/// goes out of scope, so nothing can be reclaimed safely.
#[derive(Default)]
pub struct CheckpointStore {
    checkpoints: Vec<Checkpoint>,
}

impl CheckpointStore {
    pub fn capture(&mut self, checkpoint: Checkpoint) -> u64 {
        let index = self.checkpoints.len() as u64;
        self.checkpoints.push(checkpoint);
        index
    }

    pub fn get(&self, index: u64) -> Option<&Checkpoint> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.checkpoints.get(i))
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}

/// A longjmp named a checkpoint this session never captured. Fatal: the
/// engine-level snapshot handle cannot be validated before use.
#[derive(Debug, Error)]
#[error("longjmp referenced checkpoint {index}, but the session holds {len}")]
pub struct InvalidCheckpoint {
    pub index: u64,
    pub len: usize,
}

/// Builds the `__setjmp`/`__longjmp` host imports over a session-scoped
/// checkpoint store. The store handle is cloned into the closures so that
/// independent sessions never share jump-buffer indices.
pub fn jump_imports(store: Rc<RefCell<CheckpointStore>>) -> ImportTable {
    let capture_store = Rc::clone(&store);

    let setjmp = Box::new(
        move |scope: &mut dyn HostScope, buf_ptr: u32| -> anyhow::Result<i32> {
            let snapshot = scope.snapshot();
            let sp = scope.global_get(abi::GLOBAL_STACK_POINTER)? as u32;
            let heap_base = scope.global_get(abi::GLOBAL_HEAP_BASE)? as u32;

            let mut shadow_stack = Vec::new();
            if sp < heap_base {
                let mut region = vec![0u8; (heap_base - sp) as usize];
                if scope.memory().read(sp, &mut region) {
                    shadow_stack = region;
                }
            }

            let index = capture_store.borrow_mut().capture(Checkpoint {
                snapshot,
                stack_pointer: sp,
                shadow_stack,
            });
            if !scope.memory().write_u64_le(buf_ptr, index) {
                bail!("jump buffer at {buf_ptr:#x} is outside guest memory");
            }
            tracing::trace!(index, sp, "captured setjmp checkpoint");
            Ok(0)
        },
    );

    let longjmp = Box::new(
        move |scope: &mut dyn HostScope, buf_ptr: u32, value: i32| -> anyhow::Result<()> {
            let Some(index) = scope.memory().read_u64_le(buf_ptr) else {
                bail!("jump buffer at {buf_ptr:#x} is outside guest memory");
            };
            // longjmp(buf, 0) must make the paired setjmp observe 1
            let value = if value == 0 { 1 } else { value };

            let store = store.borrow();
            let Some(checkpoint) = store.get(index) else {
                return Err(InvalidCheckpoint {
                    index,
                    len: store.len(),
                }
                .into());
            };

            scope.global_set(abi::GLOBAL_STACK_POINTER, u64::from(checkpoint.stack_pointer))?;
            if !checkpoint.shadow_stack.is_empty()
                && !scope
                    .memory()
                    .write(checkpoint.stack_pointer, &checkpoint.shadow_stack)
            {
                bail!(
                    "failed to restore shadow stack at {:#x}",
                    checkpoint.stack_pointer
                );
            }

            tracing::trace!(index, value, "restoring setjmp checkpoint");
            checkpoint.snapshot.restore(value)
        },
    );

    ImportTable { setjmp, longjmp }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    use super::*;
    use crate::engine::{EngineError, Memory};

    const SP: u64 = 0x100;
    const HEAP: u64 = 0x200;
    const BUF: u32 = 0x10;

    struct VecMemory(Vec<u8>);

    impl Memory for VecMemory {
        fn size(&self) -> u32 {
            self.0.len() as u32
        }

        fn read(&self, addr: u32, buf: &mut [u8]) -> bool {
            let start = addr as usize;
            match self.0.get(start..start + buf.len()) {
                Some(src) => {
                    buf.copy_from_slice(src);
                    true
                }
                None => false,
            }
        }

        fn write(&mut self, addr: u32, data: &[u8]) -> bool {
            let start = addr as usize;
            match self.0.get_mut(start..start + data.len()) {
                Some(dst) => {
                    dst.copy_from_slice(data);
                    true
                }
                None => false,
            }
        }
    }

    struct StubScope {
        memory: VecMemory,
        stack_pointer: u64,
        restored: Rc<Cell<Option<i32>>>,
    }

    impl StubScope {
        fn new() -> Self {
            let mut memory = VecMemory(vec![0; 0x400]);
            for addr in SP..HEAP {
                memory.0[addr as usize] = (addr & 0xff) as u8;
            }
            Self {
                memory,
                stack_pointer: SP,
                restored: Rc::new(Cell::new(None)),
            }
        }
    }

    struct StubSnapshot {
        restored: Rc<Cell<Option<i32>>>,
    }

    impl Snapshot for StubSnapshot {
        fn restore(&self, value: i32) -> ! {
            self.restored.set(Some(value));
            panic!("stub restore");
        }
    }

    impl HostScope for StubScope {
        fn snapshot(&mut self) -> Box<dyn Snapshot> {
            Box::new(StubSnapshot {
                restored: Rc::clone(&self.restored),
            })
        }

        fn memory(&mut self) -> &mut dyn Memory {
            &mut self.memory
        }

        fn global_get(&self, name: &str) -> Result<u64, EngineError> {
            match name {
                abi::GLOBAL_STACK_POINTER => Ok(self.stack_pointer),
                abi::GLOBAL_HEAP_BASE => Ok(HEAP),
                other => Err(EngineError::UnknownGlobal(other.to_string())),
            }
        }

        fn global_set(&mut self, name: &str, value: u64) -> Result<(), EngineError> {
            match name {
                abi::GLOBAL_STACK_POINTER => {
                    self.stack_pointer = value;
                    Ok(())
                }
                abi::GLOBAL_HEAP_BASE => Err(EngineError::ImmutableGlobal(name.to_string())),
                other => Err(EngineError::UnknownGlobal(other.to_string())),
            }
        }
    }

    fn run_longjmp(
        imports: &mut ImportTable,
        scope: &mut StubScope,
        value: i32,
    ) -> Result<anyhow::Result<()>, ()> {
        catch_unwind(AssertUnwindSafe(|| (imports.longjmp)(scope, BUF, value))).map_err(|_| ())
    }

    #[test]
    fn capture_writes_index_and_returns_zero() {
        let store = Rc::new(RefCell::new(CheckpointStore::default()));
        let mut imports = jump_imports(Rc::clone(&store));
        let mut scope = StubScope::new();

        assert_eq!((imports.setjmp)(&mut scope, BUF).unwrap(), 0);
        assert_eq!(scope.memory.read_u64_le(BUF), Some(0));
        assert_eq!((imports.setjmp)(&mut scope, BUF).unwrap(), 0);
        assert_eq!(scope.memory.read_u64_le(BUF), Some(1));
        assert_eq!(store.borrow().len(), 2);

        let table = store.borrow();
        let checkpoint = table.get(0).unwrap();
        assert_eq!(checkpoint.stack_pointer, SP as u32);
        assert_eq!(checkpoint.shadow_stack.len(), (HEAP - SP) as usize);
    }

    #[test]
    fn restore_resets_stack_and_shadow_bytes() {
        let store = Rc::new(RefCell::new(CheckpointStore::default()));
        let mut imports = jump_imports(store);
        let mut scope = StubScope::new();
        (imports.setjmp)(&mut scope, BUF).unwrap();
        let saved: Vec<u8> = scope.memory.0[SP as usize..HEAP as usize].to_vec();

        // deeper frames and clobbered locals at jump time
        scope.stack_pointer = SP - 0x40;
        for b in &mut scope.memory.0[SP as usize..HEAP as usize] {
            *b = 0xff;
        }

        let unwound = run_longjmp(&mut imports, &mut scope, 5);
        assert!(unwound.is_err(), "restore must not return");
        assert_eq!(scope.restored.get(), Some(5));
        assert_eq!(scope.stack_pointer, SP);
        assert_eq!(&scope.memory.0[SP as usize..HEAP as usize], &saved[..]);
    }

    #[test]
    fn restore_value_zero_is_normalized_to_one() {
        let store = Rc::new(RefCell::new(CheckpointStore::default()));
        let mut imports = jump_imports(store);
        let mut scope = StubScope::new();
        (imports.setjmp)(&mut scope, BUF).unwrap();

        let unwound = run_longjmp(&mut imports, &mut scope, 0);
        assert!(unwound.is_err());
        assert_eq!(scope.restored.get(), Some(1));
    }

    #[test]
    fn invalid_checkpoint_index_is_fatal() {
        let store = Rc::new(RefCell::new(CheckpointStore::default()));
        let mut imports = jump_imports(store);
        let mut scope = StubScope::new();
        scope.memory.write_u64_le(BUF, 7);

        let err = run_longjmp(&mut imports, &mut scope, 1)
            .expect("no unwind without a checkpoint")
            .unwrap_err();
        let invalid = err.downcast_ref::<InvalidCheckpoint>().unwrap();
        assert_eq!(invalid.index, 7);
        assert_eq!(invalid.len, 0);
        assert_eq!(scope.restored.get(), None);
    }
}
