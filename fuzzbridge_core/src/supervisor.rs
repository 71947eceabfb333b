//! Runs a fuzzing process as a child and classifies how it ended.
//!
//! Everything that may crash or call `exit` (a whole engine session, a trace
//! run) is observed from the outside: the parent keeps running, reads the
//! exit status and, optionally, the captured output.

use crate::status::ExitStatus;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

#[cfg(target_os = "macos")]
pub const PRELOAD_VAR: &str = "DYLD_INSERT_LIBRARIES";
#[cfg(not(target_os = "macos"))]
pub const PRELOAD_VAR: &str = "LD_PRELOAD";

/// Sanitizer options applied to preloaded children unless the caller sets
/// `ASAN_OPTIONS` itself. The host interpreter is not instrumented, so leak
/// reports would only be noise.
pub const DEFAULT_ASAN_OPTIONS: &str = "allocator_may_return_null=1:detect_leaks=0:use_sigaltstack=0";

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Failed to spawn {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
    #[error("Error waiting for child: {0}")]
    Wait(std::io::Error),
    #[error("Failed to kill timed-out child: {0}")]
    Kill(std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ChildCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Shared object to load ahead of everything else in the child.
    pub preload: Option<PathBuf>,
    /// Outer wall-clock bound. The engine has its own timeout; this one only
    /// guards the parent against a child that never ends.
    pub timeout: Option<Duration>,
    pub working_dir: Option<PathBuf>,
    pub capture_output: bool,
}

impl ChildCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            preload: None,
            timeout: None,
            working_dir: None,
            capture_output: true,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn preload(mut self, object: impl Into<PathBuf>) -> Self {
        self.preload = Some(object.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn inherit_output(mut self) -> Self {
        self.capture_output = false;
        self
    }

    fn sets_env(&self, key: &str) -> bool {
        self.env.iter().any(|(k, _)| k == key)
    }

    fn build(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.stdin(Stdio::null());
        if let Some(cwd) = &self.working_dir {
            cmd.current_dir(cwd);
        }
        if let Some(object) = &self.preload {
            cmd.env(PRELOAD_VAR, preload_value(object, std::env::var(PRELOAD_VAR).ok()));
            if !self.sets_env("ASAN_OPTIONS") && std::env::var_os("ASAN_OPTIONS").is_none() {
                cmd.env("ASAN_OPTIONS", DEFAULT_ASAN_OPTIONS);
            }
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if self.capture_output {
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
        }
        cmd
    }
}

/// Our object goes first: sanitizer runtimes insist on being the first DSO.
fn preload_value(object: &Path, existing: Option<String>) -> String {
    match existing.filter(|s| !s.is_empty()) {
        Some(rest) => format!("{}:{rest}", object.display()),
        None => object.display().to_string(),
    }
}

#[derive(Debug, Default, Clone)]
pub struct ChildReport {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub timed_out: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ChildReport {
    pub fn status(&self) -> ExitStatus {
        if self.timed_out {
            return ExitStatus::Timeout;
        }
        self.exit_code.map_or(ExitStatus::Crash, ExitStatus::from_code)
    }

    /// Stdout followed by stderr, lossily decoded.
    pub fn output(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&self.stderr));
        text
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn join(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

fn wait_with_timeout(
    child: &mut Child,
    timeout: Option<Duration>,
) -> Result<Option<std::process::ExitStatus>, SupervisorError> {
    let Some(timeout) = timeout else {
        return child.wait().map(Some).map_err(SupervisorError::Wait);
    };
    let start_time = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(Some(status)),
            Ok(None) => {
                if start_time.elapsed() > timeout {
                    warn!(?timeout, "child timed out, killing");
                    child.kill().map_err(SupervisorError::Kill)?;
                    let _ = child.wait();
                    return Ok(None);
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(e) => return Err(SupervisorError::Wait(e)),
        }
    }
}

/// Spawns `command`, waits for it and reports how it ended.
pub fn run_isolated(command: &ChildCommand) -> Result<ChildReport, SupervisorError> {
    debug!(program = ?command.program, args = ?command.args, preload = ?command.preload, "spawning isolated child");
    let mut child = command
        .build()
        .spawn()
        .map_err(|source| SupervisorError::Spawn {
            program: command.program.clone(),
            source,
        })?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let waited = wait_with_timeout(&mut child, command.timeout)?;

    let mut report = ChildReport {
        stdout: join(stdout),
        stderr: join(stderr),
        ..Default::default()
    };
    match waited {
        Some(status) => {
            report.exit_code = status.code();
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                report.signal = status.signal();
            }
        }
        None => report.timed_out = true,
    }
    debug!(status = %report.status(), signal = ?report.signal, "child finished");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> ChildCommand {
        ChildCommand::new("/bin/sh").arg("-c").arg(script)
    }

    #[test]
    fn clean_exit_is_clean() {
        let report = run_isolated(&sh("echo hello")).unwrap();
        assert_eq!(report.status(), ExitStatus::Clean);
        assert_eq!(report.stdout, b"hello\n");
    }

    #[test]
    fn engine_codes_are_classified() {
        for (code, expected) in [
            (1, ExitStatus::Crash),
            (70, ExitStatus::Timeout),
            (77, ExitStatus::ContractError),
        ] {
            let report = run_isolated(&sh(&format!("exit {code}"))).unwrap();
            assert_eq!(report.exit_code, Some(code));
            assert_eq!(report.status(), expected);
        }
    }

    #[test]
    fn signal_death_is_a_crash() {
        let report = run_isolated(&sh("kill -SEGV $$")).unwrap();
        assert_eq!(report.exit_code, None);
        assert_eq!(report.signal, Some(11));
        assert_eq!(report.status(), ExitStatus::Crash);
    }

    #[test]
    fn stderr_is_captured_separately() {
        let report = run_isolated(&sh("echo out; echo err 1>&2; exit 77")).unwrap();
        assert_eq!(report.stdout, b"out\n");
        assert_eq!(report.stderr, b"err\n");
        assert_eq!(report.output(), "out\nerr\n");
    }

    #[test]
    fn outer_timeout_kills_the_child() {
        let command = sh("exec sleep 5").timeout(Duration::from_millis(100));
        let started = Instant::now();
        let report = run_isolated(&command).unwrap();
        assert!(report.timed_out);
        assert_eq!(report.status(), ExitStatus::Timeout);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn env_and_preload_reach_the_child() {
        let command = sh("printf '%s|%s' \"$FUZZBRIDGE_PROBE\" \"$ASAN_OPTIONS\"")
            .env("FUZZBRIDGE_PROBE", "yes")
            .env("ASAN_OPTIONS", "detect_leaks=0");
        let report = run_isolated(&command).unwrap();
        assert_eq!(report.output(), "yes|detect_leaks=0");
    }

    #[test]
    fn preload_goes_first() {
        assert_eq!(preload_value(Path::new("/x/asan.so"), None), "/x/asan.so");
        assert_eq!(
            preload_value(Path::new("/x/asan.so"), Some("/y/other.so".into())),
            "/x/asan.so:/y/other.so"
        );
        assert_eq!(
            preload_value(Path::new("/x/asan.so"), Some(String::new())),
            "/x/asan.so"
        );
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let command = ChildCommand::new("./this_command_does_not_exist_ever_12345.sh");
        match run_isolated(&command) {
            Err(SupervisorError::Spawn { program, .. }) => {
                assert!(program.ends_with("this_command_does_not_exist_ever_12345.sh"));
            }
            other => panic!("Expected Spawn error, got {other:?}"),
        }
    }
}
