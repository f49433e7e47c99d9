//! YAML parsing, validation and expansion into declarations.
//!
//! Parses cairn.yaml and validates structural constraints:
//! - Version must be "1.0"
//! - Kinds (in resources and defaults) must be known
//! - `count` must be positive and the name must carry `{{index}}`
//! - Policy workers and timeout must be positive
//!
//! [`load_declarations`] then merges per-kind defaults, expands `count`,
//! resolves `{{params.*}}` and declares every resource.

use super::declare::Declarations;
use super::error::{Error, Result};
use super::resolver::{self, TemplateContext};
use super::types::{Attributes, CairnConfig, Constraints, Declaration, ResourceKind};
use std::path::Path;

/// Validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

fn invalid(errors: &mut Vec<ValidationError>, message: String) {
    errors.push(ValidationError { message });
}

/// Parse a cairn.yaml file from disk.
pub fn parse_config_file(path: &Path) -> Result<CairnConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
    parse_config(&content)
}

/// Parse a cairn.yaml from a string.
pub fn parse_config(yaml: &str) -> Result<CairnConfig> {
    serde_yaml_ng::from_str(yaml).map_err(|e| Error::config(format!("YAML parse error: {}", e)))
}

/// Validate a parsed config. Returns a list of errors (empty = valid).
pub fn validate_config(config: &CairnConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        invalid(
            &mut errors,
            format!("version must be \"1.0\", got \"{}\"", config.version),
        );
    }
    if config.name.is_empty() {
        invalid(&mut errors, "name must not be empty".to_string());
    }

    for kind in config.defaults.keys() {
        if kind.parse::<ResourceKind>().is_err() {
            invalid(&mut errors, format!("defaults for unknown kind '{}'", kind));
        }
    }

    for (i, decl) in config.resources.iter().enumerate() {
        let label = if decl.name.is_empty() {
            format!("resources[{}]", i)
        } else {
            format!("{}[{}]", decl.kind, decl.name)
        };
        if decl.kind.parse::<ResourceKind>().is_err() {
            invalid(&mut errors, format!("{}: unknown kind '{}'", label, decl.kind));
        }
        if decl.name.is_empty() {
            invalid(&mut errors, format!("{}: name must not be empty", label));
        }
        match decl.count {
            Some(0) => invalid(&mut errors, format!("{}: count must be at least 1", label)),
            Some(_) if !resolver::uses_index(&decl.name) => invalid(
                &mut errors,
                format!("{}: counted resources need '{{{{index}}}}' in the name", label),
            ),
            _ => {}
        }
    }

    if config.policy.workers == 0 {
        invalid(&mut errors, "policy.workers must be at least 1".to_string());
    }
    if config.policy.timeout_secs == 0 {
        invalid(&mut errors, "policy.timeout_secs must be at least 1".to_string());
    }

    errors
}

/// Parse, then fail on the first batch of validation errors.
pub fn parse_and_validate(path: &Path) -> Result<CairnConfig> {
    let config = parse_config_file(path)?;
    let errors = validate_config(&config);
    if errors.is_empty() {
        Ok(config)
    } else {
        let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
        Err(Error::config(messages.join("; ")))
    }
}

/// Expand and declare every resource of `config`, in file order.
pub fn load_declarations(config: &CairnConfig) -> Result<Declarations> {
    let mut defaults: Vec<(ResourceKind, &Attributes)> = Vec::new();
    for (kind, attrs) in &config.defaults {
        defaults.push((kind.parse()?, attrs));
    }

    let mut decls = Declarations::new();
    for decl in &config.resources {
        let kind: ResourceKind = decl.kind.parse()?;
        let mut attributes: Attributes = defaults
            .iter()
            .filter(|(k, _)| *k == kind)
            .flat_map(|(_, a)| a.iter().map(|(k, v)| (k.clone(), v.clone())))
            .collect();
        for (k, v) in &decl.attributes {
            attributes.insert(k.clone(), v.clone());
        }

        match decl.count {
            None => declare_one(&mut decls, config, decl, kind, &attributes, None)?,
            Some(n) => {
                for index in 1..=n {
                    declare_one(&mut decls, config, decl, kind, &attributes, Some(index))?;
                }
            }
        }
    }
    Ok(decls)
}

fn declare_one(
    decls: &mut Declarations,
    config: &CairnConfig,
    decl: &Declaration,
    kind: ResourceKind,
    attributes: &Attributes,
    index: Option<u32>,
) -> Result<()> {
    let ctx = TemplateContext::load(&config.params, index);
    let text = |s: &str| resolver::resolve_template(s, &ctx);

    let name = text(&decl.name)?;
    let id = decl.id.as_deref().map(text).transpose()?;
    let constraints = Constraints {
        after: decl.after.iter().map(|r| text(r)).collect::<std::result::Result<_, _>>()?,
        before: decl.before.iter().map(|r| text(r)).collect::<std::result::Result<_, _>>()?,
    };
    let attributes = resolver::resolve_attributes(attributes, &ctx)?;

    decls.declare_with_id(kind, name, id, attributes, constraints)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::build_graph;

    const HTTPD: &str = r#"
version: "1.0"
name: httpd
params:
  docroot: /var/www/html
resources:
  - kind: service
    name: httpd
    id: httpd-service
    attributes:
      state: running
      enabled: true
    after: [httpd-package, "file[{{params.docroot}}/index.html]"]
  - kind: package
    name: httpd
    id: httpd-package
  - kind: file
    name: "{{params.docroot}}/index.html"
    attributes:
      content: "<h1>hello</h1>"
      mode: "0644"
    after: [httpd-package]
"#;

    #[test]
    fn test_parse_and_load_httpd() {
        let config = parse_config(HTTPD).unwrap();
        assert!(validate_config(&config).is_empty());
        let decls = load_declarations(&config).unwrap();
        assert_eq!(decls.len(), 3);
        assert!(decls.lookup("file[/var/www/html/index.html]").is_some());

        let graph = build_graph(&decls).unwrap();
        assert_eq!(
            graph.order(),
            vec![
                "package[httpd]",
                "file[/var/www/html/index.html]",
                "service[httpd]"
            ]
        );
    }

    #[test]
    fn test_validate_reports_all_errors() {
        let yaml = r#"
version: "2.0"
name: ""
defaults:
  mount: {}
resources:
  - kind: widget
    name: w
  - kind: compute_instance
    name: web
    count: 2
policy:
  workers: 0
"#;
        let config = parse_config(yaml).unwrap();
        let errors = validate_config(&config);
        let text: Vec<String> = errors.iter().map(ToString::to_string).collect();
        assert_eq!(errors.len(), 6, "{:?}", text);
        assert!(text.iter().any(|e| e.contains("version")));
        assert!(text.iter().any(|e| e.contains("unknown kind 'widget'")));
        assert!(text.iter().any(|e| e.contains("{{index}}")));
        assert!(text.iter().any(|e| e.contains("workers")));
    }

    #[test]
    fn test_defaults_merge_declaration_wins() {
        let yaml = r#"
version: "1.0"
name: web
defaults:
  compute_instance:
    instance_type: t1.micro
    image_id: ami-b6bdde86
resources:
  - kind: compute_instance
    name: big
    attributes:
      instance_type: m5.large
"#;
        let config = parse_config(yaml).unwrap();
        let decls = load_declarations(&config).unwrap();
        let big = decls.lookup("compute_instance[big]").unwrap();
        assert_eq!(big.attributes()["instance_type"], serde_yaml_ng::Value::from("m5.large"));
        assert_eq!(big.attributes()["image_id"], serde_yaml_ng::Value::from("ami-b6bdde86"));
    }

    #[test]
    fn test_count_expansion() {
        let yaml = r#"
version: "1.0"
name: web
resources:
  - kind: compute_instance
    name: "webserver-{{index}}"
    id: "web-{{index}}"
    count: 2
    attributes:
      instance_type: t1.micro
      image_id: ami-b6bdde86
      tags: ["web-{{index}}"]
  - kind: load_balancer
    name: web-lb
    attributes:
      listeners: [{ port: 80, instance_port: 80 }]
      machines: ["{{output.web-1.id}}", "{{output.web-2.id}}"]
"#;
        let config = parse_config(yaml).unwrap();
        assert!(validate_config(&config).is_empty());
        let decls = load_declarations(&config).unwrap();
        assert_eq!(decls.len(), 3);
        let second = decls.lookup("web-2").unwrap();
        assert_eq!(second.name(), "webserver-2");
        assert_eq!(
            second.attributes()["tags"][0],
            serde_yaml_ng::Value::from("web-2")
        );
        let graph = build_graph(&decls).unwrap();
        assert_eq!(graph.order().last(), Some(&"load_balancer[web-lb]"));
    }

    #[test]
    fn test_count_accepts_spaced_index() {
        let yaml = r#"
version: "1.0"
name: web
resources:
  - kind: compute_instance
    name: "webserver-{{ index }}"
    count: 2
    attributes:
      instance_type: t1.micro
      image_id: ami-b6bdde86
"#;
        let config = parse_config(yaml).unwrap();
        assert!(validate_config(&config).is_empty());
        let decls = load_declarations(&config).unwrap();
        assert!(decls.lookup("compute_instance[webserver-2]").is_some());
    }

    #[test]
    fn test_unknown_param_fails_load() {
        let yaml = r#"
version: "1.0"
name: web
resources:
  - kind: package
    name: "{{params.pkg}}"
"#;
        let config = parse_config(yaml).unwrap();
        assert!(matches!(load_declarations(&config), Err(Error::Template(_))));
    }

    #[test]
    fn test_duplicate_detected_at_load() {
        let yaml = r#"
version: "1.0"
name: web
resources:
  - kind: package
    name: httpd
  - kind: package
    name: httpd
"#;
        let config = parse_config(yaml).unwrap();
        assert!(matches!(
            load_declarations(&config),
            Err(Error::DuplicateResource(_))
        ));
    }

    #[test]
    fn test_parse_error_is_config_error() {
        assert!(matches!(parse_config("{{{"), Err(Error::Config(_))));
    }

    #[test]
    fn test_parse_config_file_missing() {
        let err = parse_config_file(Path::new("/nonexistent/cairn.yaml")).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }
}
