//! Local execution transport.

use super::{run_with_deadline, ExecOutput, TransportError};
use std::process::Command;
use std::time::Duration;

/// Execute a shell script locally via `bash`.
/// Uses bash (not sh/dash) because generated scripts use `set -o pipefail`.
pub fn exec_local(script: &str, timeout: Duration) -> Result<ExecOutput, TransportError> {
    run_with_deadline(Command::new("bash"), "bash", script, timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_secs(10);

    #[test]
    fn test_local_echo() {
        let out = exec_local("echo hello", T).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn test_local_failure() {
        let out = exec_local("exit 42", T).unwrap();
        assert!(!out.success());
        assert_eq!(out.exit_code, 42);
    }

    #[test]
    fn test_local_multiline() {
        let out = exec_local("echo line1\necho line2", T).unwrap();
        let lines: Vec<_> = out.stdout.lines().collect();
        assert_eq!(lines, vec!["line1", "line2"]);
    }

    #[test]
    fn test_local_stderr() {
        let out = exec_local("echo err >&2", T).unwrap();
        assert!(out.success());
        assert!(out.stderr.contains("err"));
    }

    #[test]
    fn test_local_signal_killed() {
        let out = exec_local("kill -9 $$", T).unwrap();
        assert_eq!(out.exit_code, -1);
    }

    #[test]
    fn test_local_pipefail() {
        let out = exec_local("set -euo pipefail\nfalse | true", T).unwrap();
        assert!(!out.success(), "pipefail should catch false in pipeline");
    }

    #[test]
    fn test_local_timeout_kills() {
        let started = std::time::Instant::now();
        let err = exec_local("exec sleep 5", Duration::from_millis(100)).unwrap_err();
        assert_eq!(err, TransportError::Timeout(Duration::from_millis(100)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
