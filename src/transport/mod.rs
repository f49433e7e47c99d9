//! Script transports: local bash and SSH, both with deadlines.

pub mod local;
pub mod ssh;

use crate::core::error::{ApplyError, InspectionError};
use crate::core::types::Target;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Output from executing a script on a target.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Transport failures (the script never produced an exit status).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to spawn {program}: {message}")]
    Spawn { program: String, message: String },

    #[error("pipe error: {0}")]
    Pipe(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl From<TransportError> for InspectionError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout(d) => Self::Timeout(d),
            other => Self::Transport(other.to_string()),
        }
    }
}

impl From<TransportError> for ApplyError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout(d) => Self::Timeout(d),
            other => Self::Transport(other.to_string()),
        }
    }
}

/// Something that can run a purified shell script.
pub trait Transport: Send + Sync {
    fn exec(&self, script: &str, timeout: Duration) -> Result<ExecOutput, TransportError>;
}

impl Target {
    /// Whether scripts for this target run on this machine.
    pub fn is_local(&self) -> bool {
        is_local_addr(&self.addr)
    }
}

/// Dispatches to local bash or SSH based on the target address.
impl Transport for Target {
    fn exec(&self, script: &str, timeout: Duration) -> Result<ExecOutput, TransportError> {
        if self.is_local() {
            local::exec_local(script, timeout)
        } else {
            ssh::exec_ssh(self, script, timeout)
        }
    }
}

/// Single-quote a string for POSIX shells.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Check if an address is this machine.
fn is_local_addr(addr: &str) -> bool {
    if addr == "127.0.0.1" || addr == "localhost" || addr == "::1" {
        return true;
    }
    if let Ok(hostname) = std::fs::read_to_string("/etc/hostname") {
        if addr == hostname.trim() {
            return true;
        }
    }
    false
}

/// Spawn `cmd`, pipe `script` to its stdin and wait until it exits or the
/// deadline passes. On expiry the child is killed.
fn run_with_deadline(
    mut cmd: Command,
    program: &str,
    script: &str,
    timeout: Duration,
) -> Result<ExecOutput, TransportError> {
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| TransportError::Spawn {
            program: program.to_string(),
            message: e.to_string(),
        })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_reader = thread::spawn(move || drain(stdout));
    let err_reader = thread::spawn(move || drain(stderr));

    // Dropping stdin after the write closes it so the shell sees EOF.
    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(script.as_bytes()) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(TransportError::Pipe(format!("stdin write error: {}", e)));
        }
    }

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(TransportError::Timeout(timeout));
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => return Err(TransportError::Pipe(format!("wait error: {}", e))),
        }
    };

    Ok(ExecOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout: out_reader.join().unwrap_or_default(),
        stderr: err_reader.join().unwrap_or_default(),
    })
}

fn drain<R: Read>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf);
    }
    String::from_utf8_lossy(&buf).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_local_detection() {
        assert!(is_local_addr("127.0.0.1"));
        assert!(is_local_addr("localhost"));
        assert!(is_local_addr("::1"));
        assert!(!is_local_addr("192.168.1.100"));
        assert!(!is_local_addr("10.0.0.1"));
        assert!(Target::default().is_local());
        let remote = Target {
            addr: "10.0.0.1".into(),
            ..Target::default()
        };
        assert!(!remote.is_local());
    }

    #[test]
    fn test_target_exec_local() {
        let target = Target::default();
        let out = target.exec("echo ok", Duration::from_secs(10)).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "ok");
    }

    #[test]
    fn test_exec_output_success() {
        let ok = ExecOutput { exit_code: 0, stdout: "ok".into(), stderr: "".into() };
        assert!(ok.success());
        let fail = ExecOutput { exit_code: 1, stdout: "".into(), stderr: "err".into() };
        assert!(!fail.success());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("httpd"), "'httpd'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote("lib; rm -rf /"), "'lib; rm -rf /'");
    }

    #[test]
    fn test_shell_quote_roundtrips_through_bash() {
        let target = Target::default();
        let tricky = "a'b\"c $HOME";
        let out = target
            .exec(&format!("printf %s {}", shell_quote(tricky)), Duration::from_secs(10))
            .unwrap();
        assert_eq!(out.stdout, tricky);
    }
}
