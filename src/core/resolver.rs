//! Template resolution.
//!
//! Resolves `{{params.key}}`, `{{index}}` and deferred
//! `{{output.<reference>.<key>}}` placeholders in attribute values. Each
//! family is only resolved when the context carries it; otherwise the
//! placeholder is left verbatim for a later phase. Output placeholders are
//! resolved by the engine while the owning resource converges, never earlier.

use super::error::TemplateError;
use super::types::{yaml_value_to_string, Attributes, Outputs};
use serde_yaml_ng::Value;
use std::collections::HashMap;

/// What a resolution pass may substitute.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateContext<'a> {
    pub params: Option<&'a HashMap<String, Value>>,
    pub outputs: Option<&'a HashMap<String, Outputs>>,
    pub index: Option<u32>,
}

impl<'a> TemplateContext<'a> {
    /// Load-time pass: params and count index.
    pub fn load(params: &'a HashMap<String, Value>, index: Option<u32>) -> Self {
        Self {
            params: Some(params),
            outputs: None,
            index,
        }
    }

    /// Convergence-time pass: outputs of upstream resources.
    pub fn outputs(outputs: &'a HashMap<String, Outputs>) -> Self {
        Self {
            params: None,
            outputs: Some(outputs),
            index: None,
        }
    }
}

/// A parsed `{{ ... }}` placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Placeholder<'t> {
    Param(&'t str),
    Output { resource: &'t str, key: &'t str },
    Index,
}

fn parse_placeholder(key: &str) -> Result<Placeholder<'_>, TemplateError> {
    if key == "index" {
        Ok(Placeholder::Index)
    } else if let Some(param) = key.strip_prefix("params.") {
        Ok(Placeholder::Param(param))
    } else if let Some(rest) = key.strip_prefix("output.") {
        match rest.rsplit_once('.') {
            Some((resource, key)) if !resource.is_empty() && !key.is_empty() => {
                Ok(Placeholder::Output { resource, key })
            }
            _ => Err(TemplateError::InvalidOutputRef(key.to_string())),
        }
    } else {
        Err(TemplateError::UnknownVariable(key.to_string()))
    }
}

/// Iterate `(open, close, inner)` spans of every placeholder in `template`.
fn spans(template: &str) -> Result<Vec<(usize, usize, &str)>, TemplateError> {
    let mut found = Vec::new();
    let mut start = 0;
    while let Some(open) = template[start..].find("{{") {
        let open = start + open;
        let close = template[open..]
            .find("}}")
            .ok_or(TemplateError::Unclosed(open))?;
        let close = open + close + 2;
        found.push((open, close, template[open + 2..close - 2].trim()));
        start = close;
    }
    Ok(found)
}

/// Whether `template` carries an `{{index}}` placeholder, spacing aside.
pub fn uses_index(template: &str) -> bool {
    spans(template).is_ok_and(|found| found.iter().any(|&(_, _, inner)| inner == "index"))
}

/// Resolve all placeholders in a string that `ctx` can resolve.
pub fn resolve_template(template: &str, ctx: &TemplateContext) -> Result<String, TemplateError> {
    let mut result = String::with_capacity(template.len());
    let mut last = 0;

    for (open, close, inner) in spans(template)? {
        let value = match parse_placeholder(inner)? {
            Placeholder::Index => ctx.index.map(|i| i.to_string()),
            Placeholder::Param(key) => match ctx.params {
                Some(params) => Some(
                    params
                        .get(key)
                        .map(yaml_value_to_string)
                        .ok_or_else(|| TemplateError::UnknownParam(key.to_string()))?,
                ),
                None => None,
            },
            Placeholder::Output { resource, key } => match ctx.outputs {
                Some(outputs) => Some(
                    outputs
                        .get(resource)
                        .and_then(|o| o.get(key))
                        .cloned()
                        .ok_or_else(|| TemplateError::UnresolvedOutput {
                            resource: resource.to_string(),
                            key: key.to_string(),
                        })?,
                ),
                None => None,
            },
        };

        result.push_str(&template[last..open]);
        match value {
            Some(v) => result.push_str(&v),
            None => result.push_str(&template[open..close]),
        }
        last = close;
    }

    result.push_str(&template[last..]);
    Ok(result)
}

/// Resolve placeholders inside a YAML value, recursively.
pub fn resolve_value(value: &Value, ctx: &TemplateContext) -> Result<Value, TemplateError> {
    Ok(match value {
        Value::String(s) => Value::String(resolve_template(s, ctx)?),
        Value::Sequence(items) => Value::Sequence(
            items
                .iter()
                .map(|v| resolve_value(v, ctx))
                .collect::<Result<_, _>>()?,
        ),
        Value::Mapping(map) => {
            let mut resolved = serde_yaml_ng::Mapping::new();
            for (k, v) in map {
                resolved.insert(k.clone(), resolve_value(v, ctx)?);
            }
            Value::Mapping(resolved)
        }
        other => other.clone(),
    })
}

/// Resolve placeholders in every attribute value.
pub fn resolve_attributes(
    attributes: &Attributes,
    ctx: &TemplateContext,
) -> Result<Attributes, TemplateError> {
    attributes
        .iter()
        .map(|(k, v)| Ok((k.clone(), resolve_value(v, ctx)?)))
        .collect()
}

/// References named by `{{output.<reference>.<key>}}` placeholders, in order
/// of first appearance.
pub fn output_refs(attributes: &Attributes) -> Result<Vec<String>, TemplateError> {
    fn walk(value: &Value, refs: &mut Vec<String>) -> Result<(), TemplateError> {
        match value {
            Value::String(s) => {
                for (_, _, inner) in spans(s)? {
                    if let Placeholder::Output { resource, .. } = parse_placeholder(inner)? {
                        if !refs.iter().any(|r| r == resource) {
                            refs.push(resource.to_string());
                        }
                    }
                }
            }
            Value::Sequence(items) => {
                for item in items {
                    walk(item, refs)?;
                }
            }
            Value::Mapping(map) => {
                for v in map.values() {
                    walk(v, refs)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    let mut refs = Vec::new();
    for value in attributes.values() {
        walk(value, &mut refs)?;
    }
    Ok(refs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> HashMap<String, Value> {
        let mut p = HashMap::new();
        p.insert("greeting".to_string(), Value::String("hello".to_string()));
        p.insert("port".to_string(), serde_yaml_ng::from_str("8080").unwrap());
        p
    }

    fn outputs() -> HashMap<String, Outputs> {
        let mut o = HashMap::new();
        o.insert(
            "compute_instance[webserver-1]".to_string(),
            Outputs::from([("id".to_string(), "i-00000001".to_string())]),
        );
        o
    }

    #[test]
    fn test_resolve_params() {
        let p = params();
        let ctx = TemplateContext::load(&p, None);
        assert_eq!(
            resolve_template("{{params.greeting}} on {{ params.port }}", &ctx).unwrap(),
            "hello on 8080"
        );
    }

    #[test]
    fn test_resolve_unknown_param() {
        let p = params();
        let ctx = TemplateContext::load(&p, None);
        assert_eq!(
            resolve_template("{{params.missing}}", &ctx),
            Err(TemplateError::UnknownParam("missing".into()))
        );
    }

    #[test]
    fn test_output_left_verbatim_at_load() {
        let p = params();
        let ctx = TemplateContext::load(&p, Some(2));
        let s = "web-{{index}} -> {{output.compute_instance[webserver-1].id}}";
        assert_eq!(
            resolve_template(s, &ctx).unwrap(),
            "web-2 -> {{output.compute_instance[webserver-1].id}}"
        );
    }

    #[test]
    fn test_resolve_output() {
        let o = outputs();
        let ctx = TemplateContext::outputs(&o);
        assert_eq!(
            resolve_template("{{output.compute_instance[webserver-1].id}}", &ctx).unwrap(),
            "i-00000001"
        );
    }

    #[test]
    fn test_unresolved_output() {
        let o = outputs();
        let ctx = TemplateContext::outputs(&o);
        let err = resolve_template("{{output.compute_instance[webserver-1].dns}}", &ctx).unwrap_err();
        assert_eq!(
            err,
            TemplateError::UnresolvedOutput {
                resource: "compute_instance[webserver-1]".into(),
                key: "dns".into()
            }
        );
    }

    #[test]
    fn test_unclosed_and_unknown() {
        let ctx = TemplateContext::default();
        assert_eq!(resolve_template("a {{oops", &ctx), Err(TemplateError::Unclosed(2)));
        assert!(matches!(
            resolve_template("{{ machines }}", &ctx),
            Err(TemplateError::UnknownVariable(_))
        ));
        assert!(matches!(
            resolve_template("{{output.noKey}}", &ctx),
            Err(TemplateError::InvalidOutputRef(_))
        ));
    }

    #[test]
    fn test_uses_index() {
        assert!(uses_index("web-{{index}}"));
        assert!(uses_index("web-{{ index }}"));
        assert!(!uses_index("web-index"));
        assert!(!uses_index("web-{{params.index}}"));
        assert!(!uses_index("web-{{index"));
    }

    #[test]
    fn test_resolve_value_nested() {
        let p = params();
        let ctx = TemplateContext::load(&p, None);
        let v: Value = serde_yaml_ng::from_str(
            "{ source: index.html.tmpl, variables: { title: '{{params.greeting}}', list: ['{{params.port}}'] } }",
        )
        .unwrap();
        let resolved = resolve_value(&v, &ctx).unwrap();
        assert_eq!(resolved["variables"]["title"], Value::String("hello".into()));
        assert_eq!(resolved["variables"]["list"][0], Value::String("8080".into()));
    }

    #[test]
    fn test_output_refs_collects_unique() {
        let attrs: Attributes = serde_yaml_ng::from_str(
            r#"
machines:
  - "{{output.compute_instance[webserver-1].id}}"
  - "{{output.compute_instance[webserver-2].id}}"
security_groups: ["{{output.web-sg.id}}", "{{output.compute_instance[webserver-1].id}}"]
"#,
        )
        .unwrap();
        assert_eq!(
            output_refs(&attrs).unwrap(),
            vec![
                "compute_instance[webserver-1]",
                "compute_instance[webserver-2]",
                "web-sg"
            ]
        );
    }
}
