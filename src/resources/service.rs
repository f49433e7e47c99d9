//! Systemd service resource.

use crate::transport::shell_quote;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static UNIT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9@._:-]+$").expect("static regex"));

/// Desired run state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Running,
    Stopped,
}

/// Service attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSpec {
    #[serde(default)]
    pub state: RunState,

    /// Enable on boot; unset leaves boot enablement alone
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl ServiceSpec {
    pub fn validate(&self, name: &str) -> Result<(), String> {
        if !UNIT_NAME.is_match(name) {
            return Err(format!("invalid service name '{}'", name));
        }
        Ok(())
    }

    pub fn wants_active(&self) -> bool {
        self.state == RunState::Running
    }
}

/// Shell that prints `active=<state>` and `enabled=<state>`.
pub fn query_script(name: &str) -> String {
    let q = shell_quote(name);
    format!(
        "echo \"active=$(systemctl is-active {q} 2>/dev/null || true)\"\n\
         echo \"enabled=$(systemctl is-enabled {q} 2>/dev/null || true)\""
    )
}

/// Parse the output of [`query_script`] into `(active, enabled)`.
pub fn parse_query_output(stdout: &str) -> (bool, bool) {
    let mut active = false;
    let mut enabled = false;
    for line in stdout.lines() {
        if let Some(v) = line.trim().strip_prefix("active=") {
            active = v == "active";
        } else if let Some(v) = line.trim().strip_prefix("enabled=") {
            enabled = v == "enabled";
        }
    }
    (active, enabled)
}

/// Shell running one `systemctl` verb per line, failing on the first error.
pub fn systemctl_script(name: &str, verbs: &[&str]) -> String {
    let q = shell_quote(name);
    let mut lines = vec!["set -euo pipefail".to_string()];
    lines.extend(verbs.iter().map(|verb| format!("systemctl {} {}", verb, q)));
    lines.join("\n")
}
