//! Package resource (dnf + apt).

use crate::transport::shell_quote;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static PACKAGE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._+:-]*$").expect("static regex"));

/// Desired package state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageState {
    #[default]
    Installed,
    Absent,
}

/// Package manager used on the target host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageManager {
    #[default]
    Dnf,
    Apt,
}

/// Package attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageSpec {
    #[serde(default)]
    pub state: PackageState,

    /// Exact version to pin; any installed version satisfies when unset
    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub manager: PackageManager,
}

impl PackageSpec {
    pub fn validate(&self, name: &str) -> Result<(), String> {
        if !PACKAGE_NAME.is_match(name) {
            return Err(format!("invalid package name '{}'", name));
        }
        if self.state == PackageState::Absent && self.version.is_some() {
            return Err("version cannot be pinned on an absent package".to_string());
        }
        Ok(())
    }

    /// Whether an observed installed version satisfies this spec.
    pub fn satisfied_by(&self, installed: Option<&str>) -> bool {
        match (self.state, installed) {
            (PackageState::Absent, installed) => installed.is_none(),
            (PackageState::Installed, None) => false,
            (PackageState::Installed, Some(v)) => match self.version {
                Some(ref want) => version_matches(want, v),
                None => true,
            },
        }
    }
}

/// `2.4.6` matches an installed `2.4.6-99.el9` (release suffix ignored).
fn version_matches(want: &str, installed: &str) -> bool {
    installed == want
        || installed
            .strip_prefix(want)
            .is_some_and(|rest| rest.starts_with('-'))
}

/// Shell that prints the installed version, or `MISSING`.
pub fn query_script(name: &str, manager: PackageManager) -> String {
    let q = shell_quote(name);
    match manager {
        PackageManager::Dnf => format!(
            "rpm -q --queryformat '%{{VERSION}}-%{{RELEASE}}\\n' {q} 2>/dev/null || echo 'MISSING'"
        ),
        PackageManager::Apt => format!(
            "dpkg-query -W -f '${{db:Status-Abbrev}} ${{Version}}\\n' {q} 2>/dev/null \
             | awk '$1 == \"ii\" {{ print $2; found=1 }} END {{ if (!found) print \"MISSING\" }}'"
        ),
    }
}

/// Parse the output of [`query_script`].
pub fn parse_query_output(stdout: &str) -> Option<String> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    if line == "MISSING" {
        None
    } else {
        Some(line.to_string())
    }
}

/// Shell that installs (or pins) a package.
pub fn install_script(name: &str, version: Option<&str>, manager: PackageManager) -> String {
    match manager {
        PackageManager::Dnf => {
            let pkg = match version {
                Some(v) => shell_quote(&format!("{}-{}", name, v)),
                None => shell_quote(name),
            };
            format!("set -euo pipefail\ndnf install -y -q {pkg}\nrpm -q {}", shell_quote(name))
        }
        PackageManager::Apt => {
            let pkg = match version {
                Some(v) => shell_quote(&format!("{}={}", name, v)),
                None => shell_quote(name),
            };
            format!(
                "set -euo pipefail\n\
                 apt-get update -qq\n\
                 DEBIAN_FRONTEND=noninteractive apt-get install -y -qq {pkg}\n\
                 # Postcondition: package installed\n\
                 dpkg -s {} >/dev/null",
                shell_quote(name)
            )
        }
    }
}

/// Shell that removes a package.
pub fn remove_script(name: &str, manager: PackageManager) -> String {
    let q = shell_quote(name);
    match manager {
        PackageManager::Dnf => format!("set -euo pipefail\ndnf remove -y -q {q}"),
        PackageManager::Apt => {
            format!("set -euo pipefail\nDEBIAN_FRONTEND=noninteractive apt-get remove -y -qq {q}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        let spec = PackageSpec::default();
        assert!(spec.validate("httpd").is_ok());
        assert!(spec.validate("python3.11-pip").is_ok());
        assert!(spec.validate("lib; rm -rf /").is_err());
        assert!(spec.validate("").is_err());
    }

    #[test]
    fn test_absent_with_version_rejected() {
        let spec = PackageSpec {
            state: PackageState::Absent,
            version: Some("1.0".into()),
            ..Default::default()
        };
        assert!(spec.validate("httpd").is_err());
    }

    #[test]
    fn test_satisfied_by() {
        let any = PackageSpec::default();
        assert!(!any.satisfied_by(None));
        assert!(any.satisfied_by(Some("2.4.57-5.el9")));

        let pinned = PackageSpec {
            version: Some("2.4.57".into()),
            ..Default::default()
        };
        assert!(pinned.satisfied_by(Some("2.4.57-5.el9")));
        assert!(pinned.satisfied_by(Some("2.4.57")));
        assert!(!pinned.satisfied_by(Some("2.4.571")));
        assert!(!pinned.satisfied_by(Some("2.4.6-1")));

        let absent = PackageSpec {
            state: PackageState::Absent,
            ..Default::default()
        };
        assert!(absent.satisfied_by(None));
        assert!(!absent.satisfied_by(Some("1")));
    }

    #[test]
    fn test_query_script_dnf() {
        let script = query_script("httpd", PackageManager::Dnf);
        assert!(script.contains("rpm -q"));
        assert!(script.contains("'httpd'"));
        assert!(script.contains("%{VERSION}"));
    }

    #[test]
    fn test_query_script_apt() {
        let script = query_script("curl", PackageManager::Apt);
        assert!(script.contains("dpkg-query"));
        assert!(script.contains("${Version}"));
    }

    #[test]
    fn test_parse_query_output() {
        assert_eq!(parse_query_output("MISSING\n"), None);
        assert_eq!(parse_query_output(""), None);
        assert_eq!(
            parse_query_output("2.4.57-5.el9\n"),
            Some("2.4.57-5.el9".to_string())
        );
    }

    #[test]
    fn test_install_script_pins_version() {
        let dnf = install_script("httpd", Some("2.4.57"), PackageManager::Dnf);
        assert!(dnf.contains("dnf install -y -q 'httpd-2.4.57'"));
        let apt = install_script("curl", Some("7.81"), PackageManager::Apt);
        assert!(apt.contains("'curl=7.81'"));
        assert!(apt.contains("DEBIAN_FRONTEND=noninteractive"));
    }

    #[test]
    fn test_remove_script() {
        assert!(remove_script("httpd", PackageManager::Dnf).contains("dnf remove -y -q 'httpd'"));
        assert!(remove_script("curl", PackageManager::Apt).contains("apt-get remove"));
    }
}
