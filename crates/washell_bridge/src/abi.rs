//! Names and layout constants of the guest module contract.
//!
//! The guest is a reactor-model WASM build of a POSIX shell: the host calls
//! the init export once, then the eval export repeatedly, and shell state
//! (variables, functions, exit status) persists in linear memory between
//! calls. Pointers are 32-bit little-endian.

/// Import namespace the guest resolves host functions from.
pub const IMPORT_MODULE: &str = "env";

/// setjmp-equivalent host import, `(buf: u32) -> i32`.
pub const IMPORT_SETJMP: &str = "__setjmp";

/// longjmp-equivalent host import, `(buf: u32, val: i32)`. Never returns.
pub const IMPORT_LONGJMP: &str = "__longjmp";

/// Reactor startup export, invoked once right after instantiation.
pub const EXPORT_INITIALIZE: &str = "_initialize";

/// Allocates memory in guest linear memory. Returns 0 on failure.
pub const EXPORT_MALLOC: &str = "malloc";

/// Frees memory in guest linear memory. No-op on null.
pub const EXPORT_FREE: &str = "free";

/// Initializes the shell runtime. `(argc: i32, argv: ptr) -> i32`,
/// 0 on success, negative on failure.
pub const EXPORT_INIT: &str = "dash_init";

/// Evaluates a command string. `(cmd: ptr, len: i32) -> i32`, returns the
/// exit status of the last command, or -1 on a bridge-level error.
pub const EXPORT_EVAL: &str = "dash_eval";

/// Exit status of the last evaluated command. `() -> i32`.
pub const EXPORT_GET_EXITSTATUS: &str = "dash_get_exitstatus";

/// Shell variable lookup. `(name: ptr) -> ptr`, null if unset.
pub const EXPORT_GETVAR: &str = "dash_getvar";

/// Shell variable assignment. `(name: ptr, value: ptr) -> i32`,
/// 0 on success, negative on failure.
pub const EXPORT_SETVAR: &str = "dash_setvar";

/// Tears down the shell runtime. `() -> void`.
pub const EXPORT_DESTROY: &str = "dash_destroy";

/// Mutable global holding the guest C-stack pointer.
pub const GLOBAL_STACK_POINTER: &str = "__stack_pointer";

/// Immutable global marking the bottom of the guest heap. The byte range
/// `[__stack_pointer, __heap_base)` is the in-use C stack.
pub const GLOBAL_HEAP_BASE: &str = "__heap_base";

/// Exports every usable guest must provide; verified at session construction.
pub const REQUIRED_EXPORTS: [&str; 5] = [
    EXPORT_MALLOC,
    EXPORT_FREE,
    EXPORT_INIT,
    EXPORT_EVAL,
    EXPORT_DESTROY,
];

/// Width of a jump buffer: an 8-byte little-endian checkpoint index.
pub const JUMP_BUF_BYTES: u32 = 8;

/// Width of a guest pointer (wasm32).
pub const PTR_BYTES: u32 = 4;

/// argv[0] used when `init` is called with no arguments.
pub const DEFAULT_ARGV0: &str = "dash";
