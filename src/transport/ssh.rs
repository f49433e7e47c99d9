//! SSH execution transport.
//!
//! Uses the `ssh` binary directly. The script is piped to stdin rather
//! than passed as an argument.

use super::{run_with_deadline, ExecOutput, TransportError};
use crate::core::types::Target;
use std::process::Command;
use std::time::Duration;

/// Execute a shell script on a remote host via SSH.
pub fn exec_ssh(
    target: &Target,
    script: &str,
    timeout: Duration,
) -> Result<ExecOutput, TransportError> {
    run_with_deadline(ssh_command(target, timeout), "ssh", script, timeout)
}

fn ssh_command(target: &Target, timeout: Duration) -> Command {
    let connect_timeout = timeout.as_secs().clamp(1, 30);
    let mut cmd = Command::new("ssh");
    cmd.args(["-o", "BatchMode=yes"])
        .args(["-o", &format!("ConnectTimeout={}", connect_timeout)])
        .args(["-o", "StrictHostKeyChecking=accept-new"]);

    if let Some(ref key) = target.ssh_key {
        cmd.args(["-i", &expand_home(key)]);
    }

    cmd.arg(format!("{}@{}", target.user, target.addr)).arg("bash");
    cmd
}

fn expand_home(key: &str) -> String {
    match (key.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home, rest),
        _ => key.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_key_expansion() {
        let expanded = expand_home("~/.ssh/id_ed25519");
        assert!(expanded.contains(".ssh/id_ed25519"));
        if std::env::var("HOME").is_ok() {
            assert!(!expanded.starts_with('~'));
        }
        assert_eq!(expand_home("/etc/key"), "/etc/key");
    }

    #[test]
    fn test_ssh_command_args() {
        let target = Target {
            addr: "10.0.0.7".into(),
            user: "ec2-user".into(),
            ssh_key: Some("/keys/web.pem".into()),
        };
        let cmd = ssh_command(&target, Duration::from_secs(300));
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ConnectTimeout=30".to_string()));
        assert!(args.contains(&"/keys/web.pem".to_string()));
        assert!(args.contains(&"ec2-user@10.0.0.7".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("bash"));
    }
}
