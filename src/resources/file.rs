//! File resource: inline content or a rendered template.

use crate::transport::shell_quote;
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static MODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^0?[0-7]{3,4}$").expect("static regex"));

/// Desired file state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    #[default]
    Present,
    Absent,
}

/// Template reference handed to the renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateRef {
    /// Template name, resolved by the renderer
    pub source: String,

    /// Variables exposed to the template
    #[serde(default)]
    pub variables: IndexMap<String, serde_yaml_ng::Value>,
}

/// File attributes. The resource name is the absolute path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileSpec {
    #[serde(default)]
    pub state: FileState,

    /// Inline content
    #[serde(default)]
    pub content: Option<String>,

    /// Rendered content
    #[serde(default)]
    pub template: Option<TemplateRef>,

    #[serde(default)]
    pub owner: Option<String>,

    #[serde(default)]
    pub group: Option<String>,

    /// Octal mode, e.g. "0644"
    #[serde(default)]
    pub mode: Option<String>,

    /// Template output, filled in by the file provider before inspection
    #[serde(skip)]
    pub rendered: Option<Vec<u8>>,
}

impl FileSpec {
    pub fn validate(&self, path: &str) -> Result<(), String> {
        if !path.starts_with('/') {
            return Err(format!("file path '{}' must be absolute", path));
        }
        if self.content.is_some() && self.template.is_some() {
            return Err("content and template are mutually exclusive".to_string());
        }
        if self.state == FileState::Absent && (self.content.is_some() || self.template.is_some()) {
            return Err("an absent file cannot carry content".to_string());
        }
        if let Some(ref mode) = self.mode {
            if !MODE.is_match(mode) {
                return Err(format!("invalid mode '{}'", mode));
            }
        }
        Ok(())
    }

    /// Numeric mode bits.
    pub fn mode_bits(&self) -> Option<u32> {
        self.mode
            .as_deref()
            .and_then(|m| u32::from_str_radix(m, 8).ok())
    }

    /// Bytes the file must contain, if content is managed.
    pub fn desired_bytes(&self) -> Option<&[u8]> {
        match (&self.content, &self.rendered) {
            (Some(content), _) => Some(content.as_bytes()),
            (None, Some(rendered)) => Some(rendered.as_slice()),
            (None, None) => None,
        }
    }

    pub fn manages_ownership(&self) -> bool {
        self.owner.is_some() || self.group.is_some()
    }
}

/// Shell that prints `owner:group` of a path.
pub fn ownership_query_script(path: &str) -> String {
    format!("stat -c '%U:%G' {}", shell_quote(path))
}

/// Parse the output of [`ownership_query_script`].
pub fn parse_ownership(stdout: &str) -> Option<(String, String)> {
    let (owner, group) = stdout.trim().split_once(':')?;
    Some((owner.to_string(), group.to_string()))
}

/// Shell that sets owner and/or group.
pub fn chown_script(path: &str, owner: Option<&str>, group: Option<&str>) -> String {
    let target = shell_quote(path);
    match (owner, group) {
        (Some(o), Some(g)) => format!("chown {} {}", shell_quote(&format!("{}:{}", o, g)), target),
        (Some(o), None) => format!("chown {} {}", shell_quote(o), target),
        (None, Some(g)) => format!("chgrp {} {}", shell_quote(g), target),
        (None, None) => "true".to_string(),
    }
}

/// Shell that reports a path as `missing`, `not-a-file`, or a
/// `file <mode> <owner> <group>` header line followed by the content.
pub fn inspect_script(path: &str) -> String {
    let q = shell_quote(path);
    format!(
        "if [ ! -e {q} ]; then echo missing; exit 0; fi\n\
         if [ ! -f {q} ]; then echo not-a-file; exit 0; fi\n\
         stat -c 'file %a %U %G' {q}\n\
         cat {q}"
    )
}

/// A regular file as reported by [`inspect_script`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedFile<'a> {
    pub mode: Option<u32>,
    pub owner: String,
    pub group: String,
    pub content: &'a str,
}

/// Parse the output of [`inspect_script`]. `Ok(None)` means the path does
/// not exist.
pub fn parse_inspect_output(stdout: &str) -> Result<Option<ScriptedFile<'_>>, String> {
    let (header, content) = stdout.split_once('\n').unwrap_or((stdout, ""));
    let mut fields = header.trim().split_whitespace();
    match fields.next() {
        Some("missing") => Ok(None),
        Some("not-a-file") => Err("exists but is not a regular file".to_string()),
        Some("file") => {
            let mode = fields.next().and_then(|m| u32::from_str_radix(m, 8).ok());
            match (fields.next(), fields.next()) {
                (Some(owner), Some(group)) => Ok(Some(ScriptedFile {
                    mode,
                    owner: owner.to_string(),
                    group: group.to_string(),
                    content,
                })),
                _ => Err(format!("malformed file header '{}'", header)),
            }
        }
        _ => Err(format!("unexpected inspection output '{}'", header)),
    }
}

/// Shell that writes `content` through a sibling temp file and a rename.
pub fn write_script(path: &str, content: &str) -> String {
    let p = std::path::Path::new(path);
    let tmp = match p.file_name() {
        Some(name) => p.with_file_name(format!(".{}.cairn-tmp", name.to_string_lossy())),
        None => p.with_extension("cairn-tmp"),
    };
    let tmp = shell_quote(&tmp.to_string_lossy());
    let mut lines = Vec::new();
    if let Some(parent) = p.parent().filter(|d| *d != std::path::Path::new("/")) {
        lines.push(format!("mkdir -p {}", shell_quote(&parent.to_string_lossy())));
    }
    lines.push(format!("printf '%s' {} > {}", shell_quote(content), tmp));
    lines.push(format!("mv -f {} {}", tmp, shell_quote(path)));
    lines.join("\n")
}

pub fn chmod_script(path: &str, mode: u32) -> String {
    format!("chmod {:04o} {}", mode, shell_quote(path))
}

pub fn remove_script(path: &str) -> String {
    format!("rm -f {}", shell_quote(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(yaml: &str) -> FileSpec {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    #[test]
    fn test_validate_absolute_path() {
        assert!(FileSpec::default().validate("/etc/motd").is_ok());
        assert!(FileSpec::default().validate("etc/motd").is_err());
    }

    #[test]
    fn test_content_and_template_exclusive() {
        let s = spec("content: hi\ntemplate: { source: index.html.tmpl }");
        assert!(s.validate("/var/www/html/index.html").is_err());
    }

    #[test]
    fn test_absent_with_content_rejected() {
        let s = spec("state: absent\ncontent: hi");
        assert!(s.validate("/tmp/x").is_err());
    }

    #[test]
    fn test_mode() {
        let s = spec("mode: \"0644\"");
        assert!(s.validate("/tmp/x").is_ok());
        assert_eq!(s.mode_bits(), Some(0o644));
        let bad = spec("mode: \"0999\"");
        assert!(bad.validate("/tmp/x").is_err());
    }

    #[test]
    fn test_desired_bytes_prefers_inline_content() {
        let mut s = spec("content: inline");
        assert_eq!(s.desired_bytes(), Some(&b"inline"[..]));
        s.content = None;
        assert_eq!(s.desired_bytes(), None);
        s.rendered = Some(b"rendered".to_vec());
        assert_eq!(s.desired_bytes(), Some(&b"rendered"[..]));
    }

    #[test]
    fn test_template_variables_parse() {
        let s = spec(
            r#"
template:
  source: index.html.tmpl
  variables:
    machines: [webserver-1, webserver-2]
"#,
        );
        let t = s.template.unwrap();
        assert_eq!(t.source, "index.html.tmpl");
        assert!(t.variables.contains_key("machines"));
    }

    #[test]
    fn test_chown_script() {
        assert_eq!(
            chown_script("/srv/a", Some("apache"), Some("apache")),
            "chown 'apache:apache' '/srv/a'"
        );
        assert_eq!(chown_script("/srv/a", Some("root"), None), "chown 'root' '/srv/a'");
        assert_eq!(chown_script("/srv/a", None, Some("wheel")), "chgrp 'wheel' '/srv/a'");
    }

    #[test]
    fn test_parse_ownership() {
        assert_eq!(
            parse_ownership("apache:apache\n"),
            Some(("apache".to_string(), "apache".to_string()))
        );
        assert_eq!(parse_ownership("garbage"), None);
    }

    #[test]
    fn test_parse_inspect_output() {
        assert_eq!(parse_inspect_output("missing\n"), Ok(None));
        assert!(parse_inspect_output("not-a-file\n").is_err());
        assert!(parse_inspect_output("file 644\n").is_err());

        let found = parse_inspect_output("file 644 apache apache\n<h1>hi</h1>\n")
            .unwrap()
            .unwrap();
        assert_eq!(found.mode, Some(0o644));
        assert_eq!(found.owner, "apache");
        assert_eq!(found.content, "<h1>hi</h1>\n");

        let empty = parse_inspect_output("file 600 root root\n").unwrap().unwrap();
        assert_eq!(empty.content, "");
    }

    #[test]
    fn test_write_script_quotes_content() {
        let script = write_script("/var/www/html/index.html", "it's <b>\n");
        assert_eq!(
            script,
            "mkdir -p '/var/www/html'\n\
             printf '%s' 'it'\\''s <b>\n' > '/var/www/html/.index.html.cairn-tmp'\n\
             mv -f '/var/www/html/.index.html.cairn-tmp' '/var/www/html/index.html'"
        );
        assert_eq!(chmod_script("/etc/motd", 0o644), "chmod 0644 '/etc/motd'");
        assert_eq!(remove_script("/etc/motd"), "rm -f '/etc/motd'");
    }
}
