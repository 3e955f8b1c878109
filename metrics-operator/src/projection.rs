//! Extraction of dimension values from arbitrary Kubernetes objects.
//!
//! Field paths use the Kubernetes JSONPath dialect (`{.metadata.name}`, braces and
//! leading dot optional) and are translated to RFC 9535 JSONPath before they are
//! evaluated by [`serde_json_path`].
use metrics_operator_apis::ProjectionType;
use serde_json::Value;
use serde_json_path::JsonPath;

#[derive(thiserror::Error, Debug)]
pub(crate) enum ProjectionError {
    #[error("invalid field path {path:?}: {message}")]
    Parse { path: String, message: String },
    #[error("field path {path:?}: {message}")]
    Type { path: String, message: String },
    #[error("field path {path:?}: {source}")]
    Marshal {
        path: String,
        source: serde_json::Error,
    },
}

impl ProjectionError {
    /// Whether the field path matched before the error occurred.
    pub(crate) fn found(&self) -> bool {
        match self {
            ProjectionError::Parse { .. } => false,
            _ => true,
        }
    }

    fn type_mismatch(path: &str, message: String) -> Self {
        ProjectionError::Type {
            path: path.to_string(),
            message,
        }
    }
}

enum Selector {
    /// The whole object (`.`).
    Root,
    Path(JsonPath),
}

/// Resolve `field_path` against `obj` and coerce the result to `tpe`.
///
/// Returns `Ok(None)` if nothing matched and no default is given.
pub(crate) fn project(
    obj: &Value,
    field_path: &str,
    tpe: ProjectionType,
    default: Option<&str>,
) -> Result<Option<String>, ProjectionError> {
    let nodes: Vec<&Value> = match parse(field_path)? {
        Selector::Root => {
            if tpe != ProjectionType::Map {
                return Err(ProjectionError::type_mismatch(
                    field_path,
                    format!("the whole object can only be projected as map, not {:?}", tpe),
                ));
            }
            vec![obj]
        }
        Selector::Path(path) => path.query(obj).all(),
    };
    if nodes.is_empty() {
        return match default {
            Some(default) => coerce_default(field_path, tpe, default).map(Some),
            None => Ok(None),
        };
    }
    match tpe {
        ProjectionType::Primitive => match nodes.as_slice() {
            [value] => primitive(field_path, value).map(Some),
            _ => Err(ProjectionError::type_mismatch(
                field_path,
                format!("expected a single primitive value, found {} values", nodes.len()),
            )),
        },
        ProjectionType::Slice => {
            let serialized = match nodes.as_slice() {
                [array @ Value::Array(_)] => to_json(field_path, array)?,
                [single] => to_json(field_path, &[single])?,
                _ => to_json(field_path, &nodes)?,
            };
            Ok(Some(serialized))
        }
        ProjectionType::Map => match nodes.as_slice() {
            [value @ Value::Object(_)] => to_json(field_path, value).map(Some),
            [value] => Err(ProjectionError::type_mismatch(
                field_path,
                format!("expected a map, found {}", type_name(value)),
            )),
            _ => Err(ProjectionError::type_mismatch(
                field_path,
                format!("expected a single map, found {} values", nodes.len()),
            )),
        },
    }
}

fn coerce_default(
    field_path: &str,
    tpe: ProjectionType,
    default: &str,
) -> Result<String, ProjectionError> {
    match tpe {
        ProjectionType::Primitive => Ok(default.to_string()),
        ProjectionType::Slice => Ok("[]".to_string()),
        ProjectionType::Map => {
            let value: Value =
                serde_json::from_str(default).map_err(|source| ProjectionError::Marshal {
                    path: field_path.to_string(),
                    source,
                })?;
            match value {
                Value::Object(_) => to_json(field_path, &value),
                other => Err(ProjectionError::type_mismatch(
                    field_path,
                    format!("default must be a map, found {}", type_name(&other)),
                )),
            }
        }
    }
}

fn primitive(field_path: &str, value: &Value) -> Result<String, ProjectionError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Null => Ok("null".to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(ProjectionError::type_mismatch(
            field_path,
            format!("expected a primitive value, found {}", type_name(other)),
        )),
    }
}

fn to_json<T: serde::Serialize + ?Sized>(
    field_path: &str,
    value: &T,
) -> Result<String, ProjectionError> {
    serde_json::to_string(value).map_err(|source| ProjectionError::Marshal {
        path: field_path.to_string(),
        source,
    })
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "slice",
        Value::Object(_) => "map",
    }
}

fn parse(field_path: &str) -> Result<Selector, ProjectionError> {
    let trimmed = field_path.trim();
    let inner = trimmed
        .strip_prefix('{')
        .and_then(|v| v.strip_suffix('}'))
        .unwrap_or(trimmed)
        .trim();
    if inner == "." || inner == "$" {
        return Ok(Selector::Root);
    }
    let expression = to_json_path(inner).map_err(|message| ProjectionError::Parse {
        path: field_path.to_string(),
        message,
    })?;
    JsonPath::parse(expression.as_str())
        .map(Selector::Path)
        .map_err(|e| ProjectionError::Parse {
            path: field_path.to_string(),
            message: e.to_string(),
        })
}

/// Translate a Kubernetes style field path into an RFC 9535 JSONPath
/// expression. Dotted names which are no valid shorthand (e.g. label keys
/// with `-` or `/`) become bracketed names; `\.` escapes a dot within a name.
fn to_json_path(field_path: &str) -> Result<String, String> {
    let path = field_path.strip_prefix('$').unwrap_or(field_path);
    let path = path.strip_prefix('.').unwrap_or(path);
    if path.is_empty() {
        return Err("field path must not be empty".to_string());
    }
    let mut out = String::from("$");
    let mut name = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut chars = path.chars();
    while let Some(c) = chars.next() {
        if depth > 0 {
            out.push(c);
            match (quote, c) {
                (Some(q), c) if c == q => quote = None,
                (Some(_), '\\') => {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                }
                (Some(_), _) => (),
                (None, '\'' | '"') => quote = Some(c),
                (None, '[') => depth += 1,
                (None, ']') => depth -= 1,
                (None, _) => (),
            }
            continue;
        }
        match c {
            '\\' => match chars.next() {
                Some(escaped) => name.push(escaped),
                None => return Err("dangling escape character".to_string()),
            },
            '.' => push_name(&mut out, &mut name),
            '[' => {
                push_name(&mut out, &mut name);
                out.push('[');
                depth = 1;
            }
            _ => name.push(c),
        }
    }
    if depth > 0 {
        return Err("unterminated bracket".to_string());
    }
    push_name(&mut out, &mut name);
    Ok(out)
}

fn push_name(out: &mut String, name: &mut String) {
    if name.is_empty() {
        return;
    }
    let shorthand = name == "*"
        || (name.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_')
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    if shorthand {
        out.push('.');
        out.push_str(name);
    } else {
        out.push_str("['");
        out.push_str(name.replace('\\', "\\\\").replace('\'', "\\'").as_str());
        out.push_str("']");
    }
    name.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod() -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "web-0",
                "namespace": "default",
                "labels": {
                    "app.kubernetes.io/name": "web",
                    "tier": "frontend"
                }
            },
            "spec": {
                "priority": 10,
                "hostNetwork": false,
                "containers": [
                    {"name": "nginx", "image": "nginx:1.27"},
                    {"name": "sidecar", "image": "envoy:1.30"}
                ]
            },
            "status": {
                "nominatedNodeName": null,
                "conditions": [
                    {"type": "Ready", "status": "True"},
                    {"type": "Synced", "status": "False"}
                ]
            }
        })
    }

    fn primitive(path: &str) -> Result<Option<String>, ProjectionError> {
        project(&pod(), path, ProjectionType::Primitive, None)
    }

    #[test]
    fn primitive_values() {
        assert_eq!(Some("default".to_string()), primitive("metadata.namespace").unwrap());
        assert_eq!(Some("default".to_string()), primitive("{.metadata.namespace}").unwrap());
        assert_eq!(Some("default".to_string()), primitive(".metadata.namespace").unwrap());
        assert_eq!(Some("10".to_string()), primitive("spec.priority").unwrap());
        assert_eq!(Some("false".to_string()), primitive("spec.hostNetwork").unwrap());
        assert_eq!(Some("null".to_string()), primitive("status.nominatedNodeName").unwrap());
        assert_eq!(
            Some("envoy:1.30".to_string()),
            primitive("spec.containers[1].image").unwrap()
        );
    }

    #[test]
    fn filters() {
        assert_eq!(
            Some("False".to_string()),
            primitive("status.conditions[?(@.type=='Synced')].status").unwrap()
        );
        assert_eq!(
            Some("True".to_string()),
            primitive(r#"{.status.conditions[?(@.type=="Ready")].status}"#).unwrap()
        );
        assert_eq!(
            None,
            primitive("status.conditions[?(@.type=='Healthy')].status").unwrap()
        );
    }

    #[test]
    fn label_keys_with_special_characters() {
        assert_eq!(
            Some("web".to_string()),
            primitive(r"metadata.labels.app\.kubernetes\.io/name").unwrap()
        );
        assert_eq!(
            Some("web".to_string()),
            primitive("metadata.labels['app.kubernetes.io/name']").unwrap()
        );
    }

    #[test]
    fn missing_values() {
        assert_eq!(None, primitive("metadata.uid").unwrap());
        assert_eq!(
            Some("unknown".to_string()),
            project(&pod(), "metadata.uid", ProjectionType::Primitive, Some("unknown")).unwrap()
        );
    }

    #[test]
    fn primitive_type_errors() {
        let e = primitive("metadata.labels").unwrap_err();
        assert!(matches!(e, ProjectionError::Type { .. }));
        assert!(e.found());
        let e = primitive("spec.containers[*].name").unwrap_err();
        assert!(matches!(e, ProjectionError::Type { .. }));
        assert!(primitive("spec.containers").is_err());
    }

    #[test]
    fn parse_errors() {
        for path in ["spec.containers[", "spec.containers[?(@.name=='x']", "", "{}"] {
            let e = primitive(path).unwrap_err();
            assert!(matches!(e, ProjectionError::Parse { .. }), "{}", path);
            assert!(!e.found());
        }
    }

    fn parsed(projected: Option<String>) -> Value {
        serde_json::from_str(projected.unwrap().as_str()).unwrap()
    }

    #[test]
    fn slices() {
        let slice = |path: &str, default: Option<&str>| {
            project(&pod(), path, ProjectionType::Slice, default).unwrap()
        };
        assert_eq!(
            Some(r#"["nginx","sidecar"]"#.to_string()),
            slice("spec.containers[*].name", None)
        );
        assert_eq!(
            Some(r#"["nginx"]"#.to_string()),
            slice("spec.containers[0].name", None)
        );
        assert_eq!(
            json!([{"name": "nginx", "image": "nginx:1.27"}]),
            parsed(slice("spec.containers[0:1]", None))
        );
        assert_eq!(
            pod()["status"]["conditions"],
            parsed(slice("status.conditions", None))
        );
        assert_eq!(None, slice("spec.volumes", None));
        assert_eq!(Some("[]".to_string()), slice("spec.volumes", Some("ignored")));
    }

    #[test]
    fn maps() {
        let map = |path: &str, default: Option<&str>| {
            project(&pod(), path, ProjectionType::Map, default)
        };
        assert_eq!(
            pod()["metadata"]["labels"],
            parsed(map("metadata.labels", None).unwrap())
        );
        assert_eq!(
            json!({"a": "b"}),
            parsed(map("metadata.annotations", Some(r#"{"a":"b"}"#)).unwrap())
        );
        assert!(matches!(
            map("metadata.annotations", Some("not json")),
            Err(ProjectionError::Marshal { .. })
        ));
        assert!(matches!(
            map("metadata.annotations", Some("[]")),
            Err(ProjectionError::Type { .. })
        ));
        assert!(matches!(
            map("spec.containers[*]", None),
            Err(ProjectionError::Type { .. })
        ));
        assert!(matches!(
            map("metadata.name", None),
            Err(ProjectionError::Type { .. })
        ));
    }

    #[test]
    fn whole_object_round_trip() {
        for path in [".", "{.}", " . "] {
            let projected = project(&pod(), path, ProjectionType::Map, None)
                .unwrap()
                .unwrap();
            assert_eq!(pod(), serde_json::from_str::<Value>(&projected).unwrap());
        }
        assert!(matches!(
            project(&pod(), ".", ProjectionType::Primitive, None),
            Err(ProjectionError::Type { .. })
        ));
    }

    #[test]
    fn json_path_translation() {
        assert_eq!(Ok("$.metadata.name".to_string()), to_json_path("metadata.name"));
        assert_eq!(
            Ok("$.metadata.labels['app.kubernetes.io/name']".to_string()),
            to_json_path(r"metadata.labels.app\.kubernetes\.io/name")
        );
        assert_eq!(
            Ok("$.items[*].metadata['owner-ref']".to_string()),
            to_json_path(".items[*].metadata.owner-ref")
        );
        assert_eq!(
            Ok("$.status.conditions[?(@.type=='Synced')].status".to_string()),
            to_json_path("status.conditions[?(@.type=='Synced')].status")
        );
        assert!(to_json_path("a[").is_err());
    }
}
