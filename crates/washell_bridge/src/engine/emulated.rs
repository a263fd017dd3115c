//! In-process emulation of a snapshot-capable engine hosting a minimal
//! shell guest.
//!
//! The full bridge (marshaling, checkpoint capture, restore, session
//! lifecycle) can be exercised end to end against this engine without a
//! production runtime. The emulated guest honors the complete export
//! contract in [`crate::abi`], including its own use of the
//! `__setjmp`/`__longjmp` imports for error recovery and a descending
//! C stack shadowed between `__stack_pointer` and `__heap_base`.
//!
//! Snapshot restore is implemented as an unwind to the engine's dispatch
//! loop, which then re-enters the captured call at its setjmp site with the
//! restored return value. Guest entry points are written so a resumed call
//! lands at the capture site without repeating earlier effects, which is
//! exactly what an engine-level snapshot provides.
//!
//! File-system access is not emulated; `preopened_dir` is accepted for
//! engine parity and ignored.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write as _;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Once;

use anyhow::anyhow;

use super::{
    Engine, EngineError, HostScope, ImportTable, Instance, Memory, Snapshot, WasiConfig,
    WASM_PAGE_SIZE,
};
use crate::abi;

const MEMORY_PAGES: usize = 32;

/// Bottom of the guest heap; the C stack grows down from here.
const HEAP_BASE: u32 = 0x1_0000;

/// Static jmp_buf slot in the guest data segment.
const JUMP_BUF_ADDR: u32 = 0x80;

const EVAL_FRAME_SIZE: u32 = 64;
const FRAME_SENTINEL: u64 = 0xA5C3_96E1_5A3C_69D2;
const ALLOC_ALIGN: u32 = 8;

/// In-process engine hosting the emulated shell guest. The image bytes
/// passed to [`Engine::instantiate`] are accepted and ignored; the guest
/// behavior is built in.
#[derive(Default)]
pub struct EmulatedEngine {
    instances: Vec<Rc<RefCell<EmuCore>>>,
}

impl EmulatedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probe into the most recently instantiated guest.
    pub fn probe(&self) -> Option<GuestProbe> {
        self.instances
            .last()
            .map(|core| GuestProbe { core: Rc::clone(core) })
    }
}

impl Engine for EmulatedEngine {
    fn instantiate(
        &mut self,
        _image: &[u8],
        wasi: &WasiConfig,
        imports: ImportTable,
    ) -> Result<Box<dyn Instance>, EngineError> {
        silence_restore_panics();
        let core = Rc::new(RefCell::new(EmuCore::new(wasi, imports)));
        self.instances.push(Rc::clone(&core));
        Ok(Box::new(EmulatedInstance { core }))
    }
}

/// What the host observed about the most recent longjmp landing.
#[derive(Debug, Clone, Copy)]
pub struct JumpLanding {
    /// Value the setjmp site observed.
    pub value: i32,
    /// Whether the eval frame bytes came back intact from the shadow copy.
    pub sentinel_intact: bool,
    /// Stack pointer at the landing site.
    pub stack_pointer: u32,
}

/// Read-only view into a live emulated guest, for tests and diagnostics.
pub struct GuestProbe {
    core: Rc<RefCell<EmuCore>>,
}

impl GuestProbe {
    /// Allocations made through the `malloc` export and not yet freed.
    pub fn outstanding_host_allocations(&self) -> usize {
        self.core.borrow().machine.live_allocs.len()
    }

    /// Frees of pointers the allocator never handed out or has already
    /// reclaimed.
    pub fn stray_frees(&self) -> u32 {
        self.core.borrow().machine.stray_frees
    }

    pub fn stack_pointer(&self) -> u32 {
        self.core.borrow().machine.stack_pointer as u32
    }

    pub fn var(&self, name: &str) -> Option<String> {
        self.core.borrow().shell.vars.get(name).cloned()
    }

    pub fn argv(&self) -> Vec<String> {
        self.core.borrow().shell.argv.clone()
    }

    pub fn destroy_calls(&self) -> u32 {
        self.core.borrow().shell.destroy_calls
    }

    pub fn last_landing(&self) -> Option<JumpLanding> {
        self.core.borrow().jumps.last_landing
    }
}

struct EmulatedInstance {
    core: Rc<RefCell<EmuCore>>,
}

impl Instance for EmulatedInstance {
    fn invoke(&mut self, export: &str, args: &[u64]) -> Result<Vec<u64>, EngineError> {
        if !self.has_export(export) {
            return Err(EngineError::UnknownExport(export.to_string()));
        }
        if self.core.borrow().closed {
            return Err(EngineError::Trap(anyhow!("instance is closed")));
        }

        let core = Rc::clone(&self.core);
        core.borrow_mut().machine.resume = None;
        let mut call = (export.to_string(), args.to_vec());
        loop {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                let mut core = core.borrow_mut();
                core.machine.current_call = Some(call.clone());
                let result = dispatch(&mut core, &call.0, &call.1);
                core.machine.current_call = None;
                result
            }));
            match outcome {
                Ok(result) => return result,
                // A restore unwound the guest; re-enter the captured call.
                Err(payload) => match payload.downcast::<RestoreSignal>() {
                    Ok(signal) => {
                        let mut core = core.borrow_mut();
                        let Some(site) = core.machine.snapshot_sites.get(&signal.token).cloned()
                        else {
                            return Err(EngineError::Trap(anyhow!(
                                "restore of unknown snapshot {}",
                                signal.token
                            )));
                        };
                        core.machine.resume = Some(signal.value);
                        call = site;
                    }
                    Err(other) => panic::resume_unwind(other),
                },
            }
        }
    }

    fn has_export(&self, name: &str) -> bool {
        matches!(
            name,
            abi::EXPORT_INITIALIZE
                | abi::EXPORT_MALLOC
                | abi::EXPORT_FREE
                | abi::EXPORT_INIT
                | abi::EXPORT_EVAL
                | abi::EXPORT_GET_EXITSTATUS
                | abi::EXPORT_GETVAR
                | abi::EXPORT_SETVAR
                | abi::EXPORT_DESTROY
        )
    }

    fn memory(&mut self) -> &mut dyn Memory {
        self
    }

    fn close(&mut self) {
        let mut core = self.core.borrow_mut();
        if !core.closed {
            core.closed = true;
            tracing::trace!("emulated instance released");
        }
    }
}

impl Memory for EmulatedInstance {
    fn size(&self) -> u32 {
        self.core.borrow().machine.memory.size()
    }

    fn read(&self, addr: u32, buf: &mut [u8]) -> bool {
        self.core.borrow().machine.memory.read(addr, buf)
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> bool {
        self.core.borrow_mut().machine.memory.write(addr, data)
    }
}

struct EmuCore {
    machine: Machine,
    shell: ShellState,
    imports: ImportTable,
    env: Vec<(String, String)>,
    sinks: Sinks,
    jumps: JumpObservations,
    closed: bool,
}

impl EmuCore {
    fn new(wasi: &WasiConfig, imports: ImportTable) -> Self {
        Self {
            machine: Machine {
                memory: EmulatedMemory {
                    bytes: vec![0; MEMORY_PAGES * WASM_PAGE_SIZE],
                },
                stack_pointer: u64::from(HEAP_BASE),
                heap_base: u64::from(HEAP_BASE),
                brk: HEAP_BASE,
                live_allocs: HashMap::new(),
                stray_frees: 0,
                next_snapshot: 0,
                snapshot_sites: HashMap::new(),
                current_call: None,
                resume: None,
            },
            shell: ShellState::default(),
            imports,
            env: wasi.env.clone(),
            sinks: Sinks {
                stdout: wasi.stdout.clone(),
                stderr: wasi.stderr.clone(),
            },
            jumps: JumpObservations::default(),
            closed: false,
        }
    }
}

struct Machine {
    memory: EmulatedMemory,
    stack_pointer: u64,
    heap_base: u64,
    /// Bump pointer; frees only settle the ledger, memory is never reused.
    brk: u32,
    live_allocs: HashMap<u32, u32>,
    stray_frees: u32,
    next_snapshot: u64,
    /// Which guest call each snapshot was captured in.
    snapshot_sites: HashMap<u64, (String, Vec<u64>)>,
    current_call: Option<(String, Vec<u64>)>,
    /// Set between a restore unwind and the re-entry that consumes it.
    resume: Option<i32>,
}

#[derive(Default)]
struct ShellState {
    started: bool,
    initialized: bool,
    argv: Vec<String>,
    vars: HashMap<String, String>,
    exit_status: i32,
    destroy_calls: u32,
}

struct Sinks {
    stdout: Option<std::sync::Arc<std::sync::RwLock<Vec<u8>>>>,
    stderr: Option<std::sync::Arc<std::sync::RwLock<Vec<u8>>>>,
}

#[derive(Default)]
struct JumpObservations {
    last_landing: Option<JumpLanding>,
}

struct EmulatedMemory {
    bytes: Vec<u8>,
}

impl Memory for EmulatedMemory {
    fn size(&self) -> u32 {
        self.bytes.len() as u32
    }

    fn read(&self, addr: u32, buf: &mut [u8]) -> bool {
        let start = addr as usize;
        match start
            .checked_add(buf.len())
            .and_then(|end| self.bytes.get(start..end))
        {
            Some(src) => {
                buf.copy_from_slice(src);
                true
            }
            None => false,
        }
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> bool {
        let start = addr as usize;
        match start
            .checked_add(data.len())
            .and_then(|end| self.bytes.get_mut(start..end))
        {
            Some(dst) => {
                dst.copy_from_slice(data);
                true
            }
            None => false,
        }
    }
}

struct EmulatedSnapshot {
    token: u64,
}

impl Snapshot for EmulatedSnapshot {
    fn restore(&self, value: i32) -> ! {
        panic::panic_any(RestoreSignal {
            token: self.token,
            value,
        })
    }
}

struct RestoreSignal {
    token: u64,
    value: i32,
}

static SILENCE_RESTORE_PANICS: Once = Once::new();

fn silence_restore_panics() {
    SILENCE_RESTORE_PANICS.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            // restore unwinds are engine control flow, not failures
            if info.payload().downcast_ref::<RestoreSignal>().is_none() {
                previous(info);
            }
        }));
    });
}

struct EmuScope<'a> {
    machine: &'a mut Machine,
}

impl HostScope for EmuScope<'_> {
    fn snapshot(&mut self) -> Box<dyn Snapshot> {
        let token = self.machine.next_snapshot;
        self.machine.next_snapshot += 1;
        let site = self
            .machine
            .current_call
            .clone()
            .expect("snapshot captured outside a guest call");
        self.machine.snapshot_sites.insert(token, site);
        Box::new(EmulatedSnapshot { token })
    }

    fn memory(&mut self) -> &mut dyn Memory {
        &mut self.machine.memory
    }

    fn global_get(&self, name: &str) -> Result<u64, EngineError> {
        match name {
            abi::GLOBAL_STACK_POINTER => Ok(self.machine.stack_pointer),
            abi::GLOBAL_HEAP_BASE => Ok(self.machine.heap_base),
            other => Err(EngineError::UnknownGlobal(other.to_string())),
        }
    }

    fn global_set(&mut self, name: &str, value: u64) -> Result<(), EngineError> {
        match name {
            abi::GLOBAL_STACK_POINTER => {
                self.machine.stack_pointer = value;
                Ok(())
            }
            abi::GLOBAL_HEAP_BASE => Err(EngineError::ImmutableGlobal(name.to_string())),
            other => Err(EngineError::UnknownGlobal(other.to_string())),
        }
    }
}

fn dispatch(core: &mut EmuCore, func: &str, args: &[u64]) -> Result<Vec<u64>, EngineError> {
    tracing::trace!(func, "guest call");
    match func {
        abi::EXPORT_INITIALIZE => {
            core.shell.started = true;
            Ok(Vec::new())
        }
        abi::EXPORT_MALLOC => {
            let [size] = args else { return Err(arity(func)) };
            let ptr = host_malloc(&mut core.machine, *size as u32);
            Ok(vec![u64::from(ptr)])
        }
        abi::EXPORT_FREE => {
            let [ptr] = args else { return Err(arity(func)) };
            host_free(&mut core.machine, *ptr as u32);
            Ok(Vec::new())
        }
        abi::EXPORT_INIT => {
            let [argc, argv] = args else { return Err(arity(func)) };
            Ok(ret_i32(dash_init(core, *argc as u32 as i32, *argv as u32)))
        }
        abi::EXPORT_EVAL => {
            let [ptr, len] = args else { return Err(arity(func)) };
            dash_eval(core, *ptr as u32, *len as u32 as i32).map(ret_i32)
        }
        abi::EXPORT_GET_EXITSTATUS => Ok(ret_i32(core.shell.exit_status)),
        abi::EXPORT_GETVAR => {
            let [name] = args else { return Err(arity(func)) };
            Ok(vec![u64::from(dash_getvar(core, *name as u32))])
        }
        abi::EXPORT_SETVAR => {
            let [name, value] = args else { return Err(arity(func)) };
            Ok(ret_i32(dash_setvar(core, *name as u32, *value as u32)))
        }
        abi::EXPORT_DESTROY => {
            dash_destroy(core);
            Ok(Vec::new())
        }
        other => Err(EngineError::UnknownExport(other.to_string())),
    }
}

fn arity(func: &str) -> EngineError {
    EngineError::Trap(anyhow!("wrong argument count for `{func}`"))
}

fn ret_i32(value: i32) -> Vec<u64> {
    vec![u64::from(value as u32)]
}

fn host_malloc(machine: &mut Machine, size: u32) -> u32 {
    let ptr = guest_alloc(machine, size);
    if ptr != 0 {
        machine.live_allocs.insert(ptr, size);
    }
    ptr
}

fn host_free(machine: &mut Machine, ptr: u32) {
    if ptr == 0 {
        return;
    }
    if machine.live_allocs.remove(&ptr).is_none() {
        machine.stray_frees += 1;
    }
}

fn guest_alloc(machine: &mut Machine, size: u32) -> u32 {
    let aligned = size.max(1).next_multiple_of(ALLOC_ALIGN);
    let ptr = machine.brk;
    match ptr.checked_add(aligned) {
        Some(end) if end <= machine.memory.size() => {
            machine.brk = end;
            ptr
        }
        _ => 0,
    }
}

fn read_guest_cstr(memory: &EmulatedMemory, addr: u32) -> String {
    if addr == 0 {
        return String::new();
    }
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

fn dash_init(core: &mut EmuCore, argc: i32, argv: u32) -> i32 {
    if !core.shell.started || core.shell.initialized {
        return -1;
    }
    let mut args = Vec::new();
    for i in 0..argc.max(0) as u32 {
        let slot = match argv.checked_add(i * abi::PTR_BYTES) {
            Some(addr) => addr,
            None => return -1,
        };
        let Some(ptr) = core.machine.memory.read_u32_le(slot) else {
            return -1;
        };
        args.push(read_guest_cstr(&core.machine.memory, ptr));
    }
    core.shell.argv = args;
    for (key, value) in &core.env {
        core.shell.vars.insert(key.clone(), value.clone());
    }
    core.shell.exit_status = 0;
    core.shell.initialized = true;
    0
}

fn dash_eval(core: &mut EmuCore, cmd_ptr: u32, len: i32) -> Result<i32, EngineError> {
    if !core.shell.initialized || len < 0 {
        return Ok(-1);
    }
    let mut buf = vec![0u8; len as usize];
    if !core.machine.memory.read(cmd_ptr, &mut buf) {
        return Ok(-1);
    }
    let command = String::from_utf8_lossy(&buf).into_owned();

    let landed = match core.machine.resume.take() {
        // Re-entered after a restore: the setjmp below observes this value.
        Some(value) => value,
        None => {
            let sp = (core.machine.stack_pointer as u32)
                .checked_sub(EVAL_FRAME_SIZE)
                .ok_or_else(|| EngineError::Trap(anyhow!("guest stack overflow")))?;
            core.machine.stack_pointer = u64::from(sp);
            core.machine.memory.write_u64_le(sp, FRAME_SENTINEL);
            call_setjmp(core, JUMP_BUF_ADDR)?
        }
    };

    if landed != 0 {
        // longjmp landing; the bridge restored the stack pointer and the
        // frame bytes before resuming us
        let sp = core.machine.stack_pointer as u32;
        let intact = core.machine.memory.read_u64_le(sp) == Some(FRAME_SENTINEL);
        core.jumps.last_landing = Some(JumpLanding {
            value: landed,
            sentinel_intact: intact,
            stack_pointer: sp,
        });
        core.shell.exit_status = landed;
        core.machine.stack_pointer = u64::from(sp) + u64::from(EVAL_FRAME_SIZE);
        return Ok(landed);
    }

    let status = run_commands(core, &command)?;
    core.machine.stack_pointer += u64::from(EVAL_FRAME_SIZE);
    Ok(status)
}

fn call_setjmp(core: &mut EmuCore, buf: u32) -> Result<i32, EngineError> {
    let EmuCore {
        machine, imports, ..
    } = core;
    let mut scope = EmuScope { machine };
    (imports.setjmp)(&mut scope, buf).map_err(EngineError::Trap)
}

/// Invokes the longjmp import. Only returns when the jump failed, in which
/// case the failure is the guest trap to surface.
fn shell_raise(core: &mut EmuCore, status: i32) -> EngineError {
    let EmuCore {
        machine, imports, ..
    } = core;
    let mut scope = EmuScope { machine };
    match (imports.longjmp)(&mut scope, JUMP_BUF_ADDR, status) {
        Ok(()) => EngineError::Trap(anyhow!("longjmp import returned to its caller")),
        Err(err) => EngineError::Trap(err),
    }
}

fn run_commands(core: &mut EmuCore, input: &str) -> Result<i32, EngineError> {
    let mut status = core.shell.exit_status;
    for raw in input.split(|c| c == ';' || c == '\n') {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        status = run_one(core, line)?;
        core.shell.exit_status = status;
    }
    Ok(status)
}

fn run_one(core: &mut EmuCore, line: &str) -> Result<i32, EngineError> {
    if has_unterminated_quote(line) {
        write_stderr(core, b"washell: syntax error: unterminated quoted string\n");
        return Err(shell_raise(core, 2));
    }

    let words = split_words(&core.shell.vars, line);
    let mut words = words.as_slice();
    let mut assigned = false;
    while let Some(word) = words.first() {
        let Some((name, value)) = parse_assignment(word) else {
            break;
        };
        core.shell.vars.insert(name, value);
        words = &words[1..];
        assigned = true;
    }

    let Some(command) = words.first() else {
        return Ok(if assigned { 0 } else { core.shell.exit_status });
    };

    match command.as_str() {
        "echo" => {
            let mut out = words[1..].join(" ");
            out.push('\n');
            write_stdout(core, out.as_bytes());
            Ok(0)
        }
        "true" => Ok(0),
        "false" => Ok(1),
        "unset" => {
            for name in &words[1..] {
                core.shell.vars.remove(name);
            }
            Ok(0)
        }
        "raise" => {
            let status = words.get(1).and_then(|w| w.parse().ok()).unwrap_or(1);
            // clobber the eval frame and sink the stack pointer before
            // jumping; the restore path must undo both
            let sp = core.machine.stack_pointer as u32;
            core.machine.memory.write_u64_le(sp, !FRAME_SENTINEL);
            core.machine.stack_pointer = u64::from(sp.saturating_sub(128));
            Err(shell_raise(core, status))
        }
        other => {
            write_stderr(core, format!("washell: {other}: not found\n").as_bytes());
            Ok(127)
        }
    }
}

fn dash_getvar(core: &mut EmuCore, name_ptr: u32) -> u32 {
    if !core.shell.initialized {
        return 0;
    }
    let name = read_guest_cstr(&core.machine.memory, name_ptr);
    let Some(value) = core.shell.vars.get(&name).cloned() else {
        return 0;
    };
    // the returned string lives in guest-owned storage; the host reads it
    // but never frees it
    let ptr = guest_alloc(&mut core.machine, value.len() as u32 + 1);
    if ptr == 0 {
        return 0;
    }
    let mut bytes = value.into_bytes();
    bytes.push(0);
    core.machine.memory.write(ptr, &bytes);
    ptr
}

fn dash_setvar(core: &mut EmuCore, name_ptr: u32, value_ptr: u32) -> i32 {
    if !core.shell.initialized {
        return -1;
    }
    let name = read_guest_cstr(&core.machine.memory, name_ptr);
    let value = read_guest_cstr(&core.machine.memory, value_ptr);
    if !is_valid_name(&name) {
        return -1;
    }
    core.shell.vars.insert(name, value);
    0
}

fn dash_destroy(core: &mut EmuCore) {
    core.shell.vars.clear();
    core.shell.initialized = false;
    core.shell.destroy_calls += 1;
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn has_unterminated_quote(line: &str) -> bool {
    let mut in_single = false;
    let mut in_double = false;
    for c in line.chars() {
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            _ => {}
        }
    }
    in_single || in_double
}

/// Splits a command line into words, honoring quotes and expanding `$NAME`
/// outside single quotes.
fn split_words(vars: &HashMap<String, String>, line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut started = false;
    let mut in_single = false;
    let mut in_double = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' if !in_double => {
                in_single = !in_single;
                started = true;
            }
            '"' if !in_single => {
                in_double = !in_double;
                started = true;
            }
            '$' if !in_single => {
                let mut name = String::new();
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        name.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if name.is_empty() {
                    current.push('$');
                } else {
                    current.push_str(vars.get(&name).map(String::as_str).unwrap_or(""));
                }
                started = true;
            }
            c if c.is_whitespace() && !in_single && !in_double => {
                if started {
                    words.push(std::mem::take(&mut current));
                    started = false;
                }
            }
            c => {
                current.push(c);
                started = true;
            }
        }
    }
    if started {
        words.push(current);
    }
    words
}

fn parse_assignment(word: &str) -> Option<(String, String)> {
    let (name, value) = word.split_once('=')?;
    if !is_valid_name(name) {
        return None;
    }
    Some((name.to_string(), value.to_string()))
}

fn write_stdout(core: &EmuCore, bytes: &[u8]) {
    match &core.sinks.stdout {
        Some(buf) => {
            if let Ok(mut sink) = buf.write() {
                sink.extend_from_slice(bytes);
            }
        }
        None => {
            let _ = std::io::stdout().write_all(bytes);
        }
    }
}

fn write_stderr(core: &EmuCore, bytes: &[u8]) {
    match &core.sinks.stderr {
        Some(buf) => {
            if let Ok(mut sink) = buf.write() {
                sink.extend_from_slice(bytes);
            }
        }
        None => {
            let _ = std::io::stderr().write_all(bytes);
        }
    }
}
