use std::cell::RefCell;
use std::rc::Rc;

use crate::abi;
use crate::checkpoint::{jump_imports, CheckpointStore};
use crate::engine::{Engine, Instance, WasiConfig};
use crate::error::BridgeError;
use crate::marshal;

/// One guest shell instance and the state needed to call it.
///
/// Construction installs the non-local-jump imports, instantiates the guest,
/// runs the reactor startup export, and verifies the required exports. After
/// that the session is driven through [`init`](Self::init) (exactly once)
/// and the call operations, and torn down with [`close`](Self::close).
///
/// The guest keeps shared mutable state with no internal locking, so calls
/// against one session must be externally serialized; independent sessions
/// are fully isolated from each other.
pub struct ReactorSession {
    instance: Box<dyn Instance>,
    checkpoints: Rc<RefCell<CheckpointStore>>,
    initialized: bool,
    closed: bool,
}

impl ReactorSession {
    pub fn new(
        engine: &mut dyn Engine,
        image: &[u8],
        wasi: &WasiConfig,
    ) -> Result<Self, BridgeError> {
        let checkpoints = Rc::new(RefCell::new(CheckpointStore::default()));
        let imports = jump_imports(Rc::clone(&checkpoints));
        let mut instance = engine
            .instantiate(image, wasi, imports)
            .map_err(BridgeError::Construction)?;

        // Reactor startup runs once, before anything else touches the guest.
        if instance.has_export(abi::EXPORT_INITIALIZE) {
            if let Err(err) = instance.invoke(abi::EXPORT_INITIALIZE, &[]) {
                instance.close();
                return Err(BridgeError::Startup(err));
            }
        }

        for name in abi::REQUIRED_EXPORTS {
            if !instance.has_export(name) {
                instance.close();
                return Err(BridgeError::MissingExport(name));
            }
        }

        tracing::debug!("reactor session constructed");
        Ok(Self {
            instance,
            checkpoints,
            initialized: false,
            closed: false,
        })
    }

    /// Initializes the guest shell runtime. Rejected once initialized. An
    /// empty `args` defaults to the conventional single-element program
    /// name. Every marshaled argument is freed whatever the outcome.
    pub fn init(&mut self, args: &[&str]) -> Result<(), BridgeError> {
        if self.initialized {
            return Err(BridgeError::AlreadyInitialized);
        }
        let args: Vec<&str> = if args.is_empty() {
            vec![abi::DEFAULT_ARGV0]
        } else {
            args.to_vec()
        };

        let code = marshal::with_allocs(self.instance.as_mut(), |instance, scope| {
            let mut ptrs = Vec::with_capacity(args.len());
            for arg in &args {
                ptrs.push(scope.track(marshal::alloc_string(instance, arg)?));
            }
            let argv = scope.track(marshal::write_pointer_array(instance, &ptrs)?);
            let ret = instance.invoke(abi::EXPORT_INIT, &[args.len() as u64, u64::from(argv)])?;
            Ok(as_i32(&ret))
        })?;

        if code != 0 {
            return Err(BridgeError::InitFailed(code));
        }
        self.initialized = true;
        tracing::debug!(argc = args.len(), "guest shell initialized");
        Ok(())
    }

    /// Evaluates a command string and returns the exit status of the last
    /// command. A negative guest return is a bridge-level evaluation
    /// failure, distinct from a nonzero shell exit status.
    pub fn eval(&mut self, command: &str) -> Result<i32, BridgeError> {
        self.ensure_initialized()?;
        let status = marshal::with_allocs(self.instance.as_mut(), |instance, scope| {
            let ptr = scope.track(marshal::alloc_string(instance, command)?);
            let ret = instance.invoke(abi::EXPORT_EVAL, &[u64::from(ptr), command.len() as u64])?;
            Ok(as_i32(&ret))
        })?;
        if status < 0 {
            return Err(BridgeError::EvalFailed(status));
        }
        Ok(status)
    }

    /// Returns the value of a shell variable, or an empty string when the
    /// guest reports it unset (null return address).
    pub fn get_var(&mut self, name: &str) -> Result<String, BridgeError> {
        self.ensure_initialized()?;
        self.ensure_export(abi::EXPORT_GETVAR)?;
        marshal::with_allocs(self.instance.as_mut(), |instance, scope| {
            let ptr = scope.track(marshal::alloc_string(instance, name)?);
            let ret = instance.invoke(abi::EXPORT_GETVAR, &[u64::from(ptr)])?;
            let value_ptr = ret.first().copied().unwrap_or(0) as u32;
            // null means unset; the value string itself is guest-owned
            Ok(marshal::read_cstring(instance, value_ptr))
        })
    }

    /// Sets a shell variable.
    pub fn set_var(&mut self, name: &str, value: &str) -> Result<(), BridgeError> {
        self.ensure_initialized()?;
        self.ensure_export(abi::EXPORT_SETVAR)?;
        let code = marshal::with_allocs(self.instance.as_mut(), |instance, scope| {
            let name_ptr = scope.track(marshal::alloc_string(instance, name)?);
            let value_ptr = scope.track(marshal::alloc_string(instance, value)?);
            let ret = instance.invoke(
                abi::EXPORT_SETVAR,
                &[u64::from(name_ptr), u64::from(value_ptr)],
            )?;
            Ok(as_i32(&ret))
        })?;
        if code != 0 {
            return Err(BridgeError::SetVarFailed(code));
        }
        Ok(())
    }

    /// Exit status of the last evaluated command.
    pub fn get_exit_status(&mut self) -> Result<i32, BridgeError> {
        self.ensure_initialized()?;
        self.ensure_export(abi::EXPORT_GET_EXITSTATUS)?;
        let ret = self.instance.invoke(abi::EXPORT_GET_EXITSTATUS, &[])?;
        Ok(as_i32(&ret))
    }

    /// Tears down the guest runtime (best effort) and releases the
    /// instance. Safe to call more than once; also runs on drop.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        if self.initialized {
            if let Err(err) = self.instance.invoke(abi::EXPORT_DESTROY, &[]) {
                tracing::warn!("guest destroy failed: {err}");
            }
            self.initialized = false;
        }
        self.instance.close();
        self.closed = true;
        tracing::debug!("reactor session closed");
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Number of checkpoints captured so far. The table only grows for the
    /// lifetime of the session; embedders running very long sessions can
    /// watch this to decide when to recycle the instance.
    pub fn checkpoint_count(&self) -> usize {
        self.checkpoints.borrow().len()
    }

    fn ensure_initialized(&self) -> Result<(), BridgeError> {
        if self.initialized {
            Ok(())
        } else {
            Err(BridgeError::NotInitialized)
        }
    }

    fn ensure_export(&self, name: &'static str) -> Result<(), BridgeError> {
        if self.instance.has_export(name) {
            Ok(())
        } else {
            Err(BridgeError::ExportUnavailable(name))
        }
    }
}

impl Drop for ReactorSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn as_i32(ret: &[u64]) -> i32 {
    ret.first().copied().unwrap_or(0) as u32 as i32
}
