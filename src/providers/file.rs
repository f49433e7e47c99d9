//! File provider: content, mode and ownership of files on the target.
//!
//! On the local host content and mode are managed natively and ownership
//! goes through the script transport (`stat`/`chown`), the same privilege
//! path as packages and services. For a remote target everything goes
//! through the transport.

use super::{
    kind_mismatch, query_checked, run_checked, CallContext, Change, ChangeSet, FileObservation,
    Provider, ResolvedResource, ResourceState,
};
use crate::core::error::{ApplyError, InspectionError};
use crate::core::types::{yaml_value_to_string, Outputs};
use crate::resources::file::{self, FileState};
use crate::resources::{Desired, FileSpec};
use crate::transport::Transport;
use crate::tripwire::hasher;
use indexmap::IndexMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Renders a named template with variables into file content.
pub trait Renderer: Send + Sync {
    fn render(
        &self,
        template: &str,
        variables: &IndexMap<String, serde_yaml_ng::Value>,
    ) -> Result<Vec<u8>, String>;
}

/// Reads templates from a directory and substitutes `{{ var }}`.
#[derive(Debug, Clone)]
pub struct DirRenderer {
    root: PathBuf,
}

impl DirRenderer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Renderer for DirRenderer {
    fn render(
        &self,
        template: &str,
        variables: &IndexMap<String, serde_yaml_ng::Value>,
    ) -> Result<Vec<u8>, String> {
        let relative = Path::new(template);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(format!("template '{}' must be a relative path inside the template directory", template));
        }
        let path = self.root.join(relative);
        let source = fs::read_to_string(&path)
            .map_err(|e| format!("cannot read template {}: {}", path.display(), e))?;
        render_str(&source, variables).map(String::into_bytes)
    }
}

/// Substitute `{{ name }}` placeholders. Unknown names are an error.
pub fn render_str(
    source: &str,
    variables: &IndexMap<String, serde_yaml_ng::Value>,
) -> Result<String, String> {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after
            .find("}}")
            .ok_or_else(|| format!("unclosed placeholder at byte {}", source.len() - rest.len() + open))?;
        let name = after[..close].trim();
        let value = variables
            .get(name)
            .ok_or_else(|| format!("template variable '{}' is not defined", name))?;
        out.push_str(&yaml_value_to_string(value));
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Where content and mode are read and written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Native,
    Scripted,
}

pub struct FileProvider {
    renderer: Arc<dyn Renderer>,
    transport: Arc<dyn Transport>,
    access: Access,
}

impl FileProvider {
    /// Files on the local host.
    pub fn new(renderer: Arc<dyn Renderer>, transport: Arc<dyn Transport>) -> Self {
        Self {
            renderer,
            transport,
            access: Access::Native,
        }
    }

    /// Files on whatever host `transport` reaches.
    pub fn over_transport(renderer: Arc<dyn Renderer>, transport: Arc<dyn Transport>) -> Self {
        Self {
            renderer,
            transport,
            access: Access::Scripted,
        }
    }

    fn spec<'r>(&self, resource: &'r ResolvedResource) -> Result<&'r FileSpec, InspectionError> {
        match resource.desired {
            Desired::File(ref spec) => Ok(spec),
            _ => Err(kind_mismatch(self.name(), resource)),
        }
    }
}

impl Provider for FileProvider {
    fn name(&self) -> &'static str {
        "file"
    }

    fn prepare(&self, resource: &mut ResolvedResource, _ctx: &CallContext) -> Result<(), InspectionError> {
        let Desired::File(ref mut spec) = resource.desired else {
            return Err(kind_mismatch(self.name(), resource));
        };
        if let Some(ref template) = spec.template {
            let rendered = self
                .renderer
                .render(&template.source, &template.variables)
                .map_err(InspectionError::Render)?;
            spec.rendered = Some(rendered);
        }
        Ok(())
    }

    fn inspect(
        &self,
        resource: &ResolvedResource,
        ctx: &CallContext,
    ) -> Result<ResourceState, InspectionError> {
        let spec = self.spec(resource)?;
        if self.access == Access::Scripted {
            return self.inspect_scripted(resource, ctx);
        }
        let path = Path::new(&resource.name);

        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(ResourceState::File(FileObservation::default()));
            }
            Err(e) => {
                return Err(InspectionError::Other(format!("{}: {}", resource.name, e)));
            }
        };
        if !meta.is_file() {
            return Err(InspectionError::Other(format!(
                "{} exists but is not a regular file",
                resource.name
            )));
        }

        let content_hash = hasher::hash_file(path)
            .map_err(|e| InspectionError::Other(format!("{}: {}", resource.name, e)))?;

        let (owner, group) = if spec.manages_ownership() {
            let out = query_checked(
                self.transport.as_ref(),
                &file::ownership_query_script(&resource.name),
                ctx.timeout,
            )?;
            match file::parse_ownership(&out.stdout) {
                Some((o, g)) => (Some(o), Some(g)),
                None => (None, None),
            }
        } else {
            (None, None)
        };

        Ok(ResourceState::File(FileObservation {
            exists: true,
            content_hash: Some(content_hash),
            mode: file_mode(&meta),
            owner,
            group,
        }))
    }

    fn converge(&self, resource: &ResolvedResource, observed: &ResourceState) -> ChangeSet {
        let (Desired::File(spec), ResourceState::File(obs)) = (&resource.desired, observed) else {
            return ChangeSet::new();
        };
        let path = resource.name.clone();
        let mut changes = ChangeSet::new();

        if spec.state == FileState::Absent {
            if obs.exists {
                changes.push(Change::RemoveFile { path });
            }
            return changes;
        }

        match (spec.desired_bytes(), obs.exists) {
            (_, false) => changes.push(Change::WriteContent {
                path: path.clone(),
                create: true,
            }),
            (Some(bytes), true) => {
                if obs.content_hash.as_deref() != Some(hasher::hash_bytes(bytes).as_str()) {
                    changes.push(Change::WriteContent {
                        path: path.clone(),
                        create: false,
                    });
                }
            }
            (None, true) => {}
        }

        if let Some(mode) = spec.mode_bits() {
            if !obs.exists || obs.mode.is_some_and(|m| m != mode) {
                changes.push(Change::SetMode {
                    path: path.clone(),
                    mode,
                });
            }
        }

        if spec.manages_ownership() {
            let owner_differs = spec.owner.is_some() && spec.owner != obs.owner;
            let group_differs = spec.group.is_some() && spec.group != obs.group;
            if !obs.exists || owner_differs || group_differs {
                changes.push(Change::SetOwnership {
                    path,
                    owner: spec.owner.clone(),
                    group: spec.group.clone(),
                });
            }
        }

        changes
    }

    fn apply(
        &self,
        resource: &ResolvedResource,
        changes: &ChangeSet,
        ctx: &CallContext,
    ) -> Result<Outputs, ApplyError> {
        let spec = self
            .spec(resource)
            .map_err(|e| ApplyError::Other(e.to_string()))?;
        let io_err = |e: io::Error| ApplyError::Io {
            path: resource.name.clone(),
            message: e.to_string(),
        };

        if self.access == Access::Scripted {
            let script = apply_script(spec, changes)?;
            run_checked(self.transport.as_ref(), &script, ctx.timeout)?;
            return Ok(file_outputs(resource, spec));
        }

        for change in changes {
            match change {
                Change::WriteContent { path, .. } => {
                    write_atomic(Path::new(path), spec.desired_bytes().unwrap_or_default())
                        .map_err(io_err)?;
                }
                Change::SetMode { path, mode } => set_mode(Path::new(path), *mode).map_err(io_err)?,
                Change::SetOwnership { path, owner, group } => {
                    let script = file::chown_script(path, owner.as_deref(), group.as_deref());
                    run_checked(self.transport.as_ref(), &script, ctx.timeout)?;
                }
                Change::RemoveFile { path } => fs::remove_file(path).map_err(io_err)?,
                other => {
                    return Err(ApplyError::Other(format!(
                        "file provider cannot apply '{}'",
                        other
                    )))
                }
            }
        }

        Ok(file_outputs(resource, spec))
    }
}

impl FileProvider {
    fn inspect_scripted(
        &self,
        resource: &ResolvedResource,
        ctx: &CallContext,
    ) -> Result<ResourceState, InspectionError> {
        let out = query_checked(
            self.transport.as_ref(),
            &file::inspect_script(&resource.name),
            ctx.timeout,
        )?;
        let found = file::parse_inspect_output(&out.stdout)
            .map_err(|e| InspectionError::Other(format!("{}: {}", resource.name, e)))?;
        Ok(ResourceState::File(match found {
            None => FileObservation::default(),
            Some(f) => FileObservation {
                exists: true,
                content_hash: Some(hasher::hash_bytes(f.content.as_bytes())),
                mode: f.mode,
                owner: Some(f.owner),
                group: Some(f.group),
            },
        }))
    }
}

/// One script for a whole change set, stopping at the first failure.
fn apply_script(spec: &FileSpec, changes: &ChangeSet) -> Result<String, ApplyError> {
    let mut lines = vec!["set -euo pipefail".to_string()];
    for change in changes {
        lines.push(match change {
            Change::WriteContent { path, .. } => {
                let bytes = spec.desired_bytes().unwrap_or_default();
                file::write_script(path, &String::from_utf8_lossy(bytes))
            }
            Change::SetMode { path, mode } => file::chmod_script(path, *mode),
            Change::SetOwnership { path, owner, group } => {
                file::chown_script(path, owner.as_deref(), group.as_deref())
            }
            Change::RemoveFile { path } => file::remove_script(path),
            other => {
                return Err(ApplyError::Other(format!(
                    "file provider cannot apply '{}'",
                    other
                )))
            }
        });
    }
    Ok(lines.join("\n"))
}

fn file_outputs(resource: &ResolvedResource, spec: &FileSpec) -> Outputs {
    let mut outputs = Outputs::new();
    outputs.insert("path".into(), resource.name.clone());
    if spec.state == FileState::Present {
        let bytes = spec.desired_bytes().unwrap_or_default();
        outputs.insert("content_hash".into(), hasher::hash_bytes(bytes));
    }
    outputs
}

/// Write via a sibling temp file and rename, so readers never see a
/// partially written file.
fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp = path.with_file_name(format!(".{}.cairn-tmp", file_name.to_string_lossy()));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn file_mode(_meta: &fs::Metadata) -> Option<u32> {
    None
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Attributes, ResourceKind};
    use crate::providers::testing::ScriptedTransport;
    use crate::resources::parse_desired;
    use std::time::Duration;

    const CTX: CallContext = CallContext {
        timeout: Duration::from_secs(5),
    };

    fn resource(path: &Path, yaml: &str) -> ResolvedResource {
        let name = path.to_string_lossy().to_string();
        let attrs: Attributes = serde_yaml_ng::from_str(yaml).unwrap();
        ResolvedResource {
            reference: format!("file[{}]", name),
            kind: ResourceKind::File,
            desired: parse_desired(ResourceKind::File, &name, &attrs).unwrap(),
            name,
        }
    }

    fn provider(templates: &Path) -> FileProvider {
        FileProvider::new(
            Arc::new(DirRenderer::new(templates)),
            Arc::new(ScriptedTransport::default()),
        )
    }

    fn converge_once(p: &FileProvider, r: &mut ResolvedResource) -> ChangeSet {
        p.prepare(r, &CTX).unwrap();
        let observed = p.inspect(r, &CTX).unwrap();
        let changes = p.converge(r, &observed);
        if !changes.is_empty() {
            p.apply(r, &changes, &CTX).unwrap();
        }
        changes
    }

    #[test]
    fn test_render_str() {
        let mut vars = IndexMap::new();
        vars.insert("title".to_string(), serde_yaml_ng::Value::String("Hi".into()));
        assert_eq!(render_str("<h1>{{ title }}</h1>", &vars).unwrap(), "<h1>Hi</h1>");
        assert!(render_str("{{ missing }}", &vars).is_err());
        assert!(render_str("{{ title", &vars).is_err());
    }

    #[test]
    fn test_dir_renderer_rejects_escape() {
        let renderer = DirRenderer::new("/tmp");
        assert!(renderer.render("../etc/passwd", &IndexMap::new()).is_err());
        assert!(renderer.render("/etc/passwd", &IndexMap::new()).is_err());
    }

    #[test]
    fn test_create_then_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("www/index.html");
        let p = provider(dir.path());
        let mut r = resource(&path, "{ content: hello, mode: '0640' }");

        let first = converge_once(&p, &mut r);
        assert_eq!(first.action(), crate::core::types::PlanAction::Create);
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello");

        let second = converge_once(&p, &mut r);
        assert!(second.is_empty(), "{:?}", second);
    }

    #[test]
    fn test_content_drift_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("motd");
        fs::write(&path, "old").unwrap();
        let p = provider(dir.path());
        let mut r = resource(&path, "content: new");
        let changes = converge_once(&p, &mut r);
        assert_eq!(changes.descriptions(), vec![format!("rewrite {}", path.display())]);
        assert_eq!(fs::read_to_string(&path).unwrap(), "new");
    }

    #[cfg(unix)]
    #[test]
    fn test_mode_drift_corrected() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf");
        fs::write(&path, "x").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();
        let p = provider(dir.path());
        let mut r = resource(&path, "{ content: x, mode: '0644' }");
        let changes = converge_once(&p, &mut r);
        assert_eq!(changes.len(), 1);
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o644);
    }

    #[test]
    fn test_template_rendered() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html.tmpl"), "<p>{{ greeting }}</p>").unwrap();
        let path = dir.path().join("out/index.html");
        let p = provider(dir.path());
        let mut r = resource(
            &path,
            "template: { source: index.html.tmpl, variables: { greeting: hello } }",
        );
        converge_once(&p, &mut r);
        assert_eq!(fs::read_to_string(&path).unwrap(), "<p>hello</p>");
        assert!(converge_once(&p, &mut r).is_empty());
    }

    #[test]
    fn test_absent_removes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale");
        fs::write(&path, "x").unwrap();
        let p = provider(dir.path());
        let mut r = resource(&path, "state: absent");
        let changes = converge_once(&p, &mut r);
        assert_eq!(changes.action(), crate::core::types::PlanAction::Destroy);
        assert!(!path.exists());
        assert!(converge_once(&p, &mut r).is_empty());
    }

    #[test]
    fn test_ownership_checked_through_transport() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("owned");
        fs::write(&path, "x").unwrap();
        let transport = Arc::new(ScriptedTransport::default().reply(0, "root:root\n"));
        let p = FileProvider::new(Arc::new(DirRenderer::new(dir.path())), transport.clone());
        let r = resource(&path, "{ content: x, owner: apache, group: apache }");
        let observed = p.inspect(&r, &CTX).unwrap();
        let changes = p.converge(&r, &observed);
        assert_eq!(
            changes.descriptions(),
            vec![format!("chown apache:apache {}", path.display())]
        );
        assert!(transport.scripts()[0].starts_with("stat -c"));
    }

    fn scripted(transport: &Arc<ScriptedTransport>) -> FileProvider {
        let t: Arc<dyn Transport> = transport.clone();
        FileProvider::over_transport(Arc::new(DirRenderer::new("/nonexistent")), t)
    }

    #[test]
    fn test_remote_missing_file_written_through_transport() {
        let transport = Arc::new(ScriptedTransport::default().reply(0, "missing\n"));
        let p = scripted(&transport);
        let path = Path::new("/var/www/html/index.html");
        let r = resource(path, "{ content: '<h1>hello</h1>', mode: '0644', owner: apache }");

        let observed = p.inspect(&r, &CTX).unwrap();
        let changes = p.converge(&r, &observed);
        assert_eq!(changes.len(), 3);
        let outputs = p.apply(&r, &changes, &CTX).unwrap();
        assert_eq!(outputs["path"], "/var/www/html/index.html");

        let scripts = transport.scripts();
        assert_eq!(scripts.len(), 2);
        assert!(scripts[0].contains("stat -c 'file %a %U %G' '/var/www/html/index.html'"));
        let apply = &scripts[1];
        assert!(apply.starts_with("set -euo pipefail"));
        assert!(apply.contains("printf '%s' '<h1>hello</h1>' > '/var/www/html/.index.html.cairn-tmp'"));
        assert!(apply.contains("chmod 0644 '/var/www/html/index.html'"));
        assert!(apply.contains("chown 'apache' '/var/www/html/index.html'"));
        assert!(!path.exists());
    }

    #[test]
    fn test_remote_in_sync_file_untouched() {
        let transport = Arc::new(
            ScriptedTransport::default().reply(0, "file 644 apache apache\n<h1>hello</h1>"),
        );
        let p = scripted(&transport);
        let r = resource(
            Path::new("/var/www/html/index.html"),
            "{ content: '<h1>hello</h1>', mode: '0644', owner: apache }",
        );
        let observed = p.inspect(&r, &CTX).unwrap();
        assert!(p.converge(&r, &observed).is_empty());
        assert_eq!(transport.scripts().len(), 1);
    }

    #[test]
    fn test_remote_removal_and_query_failure() {
        let transport = Arc::new(
            ScriptedTransport::default()
                .reply(0, "file 600 root root\nstale")
                .reply(0, "")
                .reply(1, ""),
        );
        let p = scripted(&transport);
        let r = resource(Path::new("/etc/stale.conf"), "state: absent");
        let observed = p.inspect(&r, &CTX).unwrap();
        let changes = p.converge(&r, &observed);
        p.apply(&r, &changes, &CTX).unwrap();
        assert!(transport.scripts()[1].contains("rm -f '/etc/stale.conf'"));

        assert!(matches!(
            p.inspect(&r, &CTX),
            Err(InspectionError::Query { exit_code: 1, .. })
        ));
    }

    #[test]
    fn test_inspect_directory_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider(dir.path());
        let r = resource(dir.path(), "{}");
        assert!(p.inspect(&r, &CTX).is_err());
    }
}
