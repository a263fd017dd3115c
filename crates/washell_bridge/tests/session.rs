use std::sync::{Arc, RwLock};

use washell_bridge::engine::emulated::EmulatedEngine;
use washell_bridge::engine::WasiConfig;
use washell_bridge::{BridgeError, ReactorSession};

struct Harness {
    engine: EmulatedEngine,
    session: ReactorSession,
    stdout: Arc<RwLock<Vec<u8>>>,
    stderr: Arc<RwLock<Vec<u8>>>,
}

fn harness_with_env(env: &[(&str, &str)]) -> Harness {
    let stdout = Arc::new(RwLock::new(Vec::new()));
    let stderr = Arc::new(RwLock::new(Vec::new()));
    let wasi = WasiConfig {
        env: env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        preopened_dir: None,
        stdout: Some(stdout.clone()),
        stderr: Some(stderr.clone()),
    };
    let mut engine = EmulatedEngine::new();
    let session = ReactorSession::new(&mut engine, b"", &wasi).expect("session construction");
    Harness {
        engine,
        session,
        stdout,
        stderr,
    }
}

fn harness() -> Harness {
    harness_with_env(&[])
}

impl Harness {
    fn stdout_string(&self) -> String {
        String::from_utf8(self.stdout.read().unwrap().clone()).unwrap()
    }

    fn stderr_string(&self) -> String {
        String::from_utf8(self.stderr.read().unwrap().clone()).unwrap()
    }
}

#[test]
fn init_then_eval_persists_state() -> anyhow::Result<()> {
    let mut h = harness();
    h.session.init(&[])?;

    let status = h.session.eval("echo hello")?;
    assert_eq!(status, 0);
    assert_eq!(h.stdout_string(), "hello\n");

    h.session.eval("FOO=bar")?;
    assert_eq!(h.session.get_var("FOO")?, "bar");

    // variable state persists strictly across eval calls
    h.session.eval("X=1")?;
    assert_eq!(h.session.get_var("X")?, "1");
    Ok(())
}

#[test]
fn exit_status_is_reported_and_sticky() -> anyhow::Result<()> {
    let mut h = harness();
    h.session.init(&[])?;

    assert_eq!(h.session.eval("false")?, 1);
    assert_eq!(h.session.get_exit_status()?, 1);
    assert_eq!(h.session.eval("true")?, 0);
    assert_eq!(h.session.get_exit_status()?, 0);
    Ok(())
}

#[test]
fn host_set_variable_propagates_into_eval() -> anyhow::Result<()> {
    let mut h = harness();
    h.session.init(&[])?;

    h.session.set_var("HOST_VAR", "from_host")?;
    h.session.eval("echo $HOST_VAR")?;
    assert_eq!(h.stdout_string(), "from_host\n");
    Ok(())
}

#[test]
fn unset_variable_reads_as_empty() -> anyhow::Result<()> {
    let mut h = harness();
    h.session.init(&[])?;
    assert_eq!(h.session.get_var("NEVER_SET")?, "");
    Ok(())
}

#[test]
fn unknown_command_reports_127() -> anyhow::Result<()> {
    let mut h = harness();
    h.session.init(&[])?;
    assert_eq!(h.session.eval("no-such-command")?, 127);
    assert!(h.stderr_string().contains("no-such-command: not found"));
    Ok(())
}

#[test]
fn operations_before_init_fail_with_not_initialized() {
    let mut h = harness();
    assert!(matches!(
        h.session.eval("true"),
        Err(BridgeError::NotInitialized)
    ));
    assert!(matches!(
        h.session.get_var("X"),
        Err(BridgeError::NotInitialized)
    ));
    assert!(matches!(
        h.session.set_var("X", "1"),
        Err(BridgeError::NotInitialized)
    ));
    assert!(matches!(
        h.session.get_exit_status(),
        Err(BridgeError::NotInitialized)
    ));
}

#[test]
fn second_init_fails_without_altering_state() -> anyhow::Result<()> {
    let mut h = harness();
    h.session.init(&[])?;
    h.session.set_var("KEEP", "me")?;

    assert!(matches!(
        h.session.init(&["dash", "-i"]),
        Err(BridgeError::AlreadyInitialized)
    ));
    assert!(h.session.is_initialized());
    assert_eq!(h.session.get_var("KEEP")?, "me");
    Ok(())
}

#[test]
fn init_defaults_to_program_name_argv() -> anyhow::Result<()> {
    let mut h = harness();
    h.session.init(&[])?;
    let probe = h.engine.probe().unwrap();
    assert_eq!(probe.argv(), vec!["dash".to_string()]);
    Ok(())
}

#[test]
fn init_marshals_custom_argv() -> anyhow::Result<()> {
    let mut h = harness();
    h.session.init(&["dash", "-i", "-e"])?;
    let probe = h.engine.probe().unwrap();
    assert_eq!(
        probe.argv(),
        vec!["dash".to_string(), "-i".to_string(), "-e".to_string()]
    );
    Ok(())
}

#[test]
fn environment_seeds_shell_variables() -> anyhow::Result<()> {
    let mut h = harness_with_env(&[("PATH", "/bin:/usr/bin"), ("HOME", "/root")]);
    h.session.init(&[])?;
    assert_eq!(h.session.get_var("PATH")?, "/bin:/usr/bin");
    assert_eq!(h.session.get_var("HOME")?, "/root");
    Ok(())
}

#[test]
fn close_is_idempotent() -> anyhow::Result<()> {
    let mut h = harness();
    h.session.init(&[])?;
    h.session.eval("X=1")?;

    h.session.close();
    let probe = h.engine.probe().unwrap();
    assert_eq!(probe.destroy_calls(), 1);

    h.session.close();
    assert_eq!(probe.destroy_calls(), 1);

    // a closed session is back to the uninitialized protocol state
    assert!(matches!(
        h.session.eval("true"),
        Err(BridgeError::NotInitialized)
    ));
    Ok(())
}

#[test]
fn drop_tears_the_session_down() -> anyhow::Result<()> {
    let h = {
        let mut h = harness();
        h.session.init(&[])?;
        h
    };
    let probe = h.engine.probe().unwrap();
    drop(h.session);
    assert_eq!(probe.destroy_calls(), 1);
    Ok(())
}

#[test]
fn no_guest_allocations_leak() -> anyhow::Result<()> {
    let mut h = harness();
    let probe = h.engine.probe().unwrap();

    h.session.init(&["dash", "-i"])?;
    h.session.eval("A=1; echo $A; false")?;
    h.session.set_var("B", "2")?;
    h.session.get_var("A")?;
    h.session.get_var("MISSING")?;
    h.session.get_exit_status()?;

    assert_eq!(probe.outstanding_host_allocations(), 0);
    assert_eq!(probe.stray_frees(), 0);
    Ok(())
}

#[test]
fn failed_allocation_frees_partial_argv() {
    let mut h = harness();
    // second argument exceeds guest memory, so its allocation fails after
    // the first argument was already marshaled
    let huge = "x".repeat(4 * 1024 * 1024);
    let err = h.session.init(&["dash", huge.as_str()]).unwrap_err();
    assert!(matches!(err, BridgeError::AllocFailed { .. }));
    assert!(!h.session.is_initialized());

    let probe = h.engine.probe().unwrap();
    assert_eq!(probe.outstanding_host_allocations(), 0);
    assert_eq!(probe.stray_frees(), 0);
}
