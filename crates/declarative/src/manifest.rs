//! Parsing of rendered manifest text.

use crate::error::{DeclarativeError, Result};
use kube::core::DynamicObject;
use serde::Deserialize;

/// Parses multi-document YAML into objects, in document order.
///
/// Empty documents are skipped and `*List` documents are flattened into their
/// items.
pub fn parse_manifests(text: &str) -> Result<Vec<DynamicObject>> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(text) {
        let value = serde_yaml::Value::deserialize(document)
            .map_err(|e| DeclarativeError::Parse(e.to_string()))?;
        if value.is_null() {
            continue;
        }

        let is_list = value
            .get("kind")
            .and_then(serde_yaml::Value::as_str)
            .is_some_and(|kind| kind.ends_with("List"));
        match value.get("items").and_then(serde_yaml::Value::as_sequence) {
            Some(items) if is_list => {
                for item in items {
                    objects.push(to_object(item.clone())?);
                }
            }
            _ => objects.push(to_object(value)?),
        }
    }
    Ok(objects)
}

fn to_object(value: serde_yaml::Value) -> Result<DynamicObject> {
    serde_yaml::from_value(value).map_err(|e| DeclarativeError::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_documents_in_order() {
        let text = "---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: one\n---\n\n---\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: two\n";
        let objects = parse_manifests(text).unwrap();
        let names: Vec<_> = objects.iter().map(|o| o.metadata.name.clone().unwrap()).collect();
        assert_eq!(names, vec!["one", "two"]);
        assert_eq!(objects[1].types.as_ref().unwrap().kind, "Deployment");
    }

    #[test]
    fn test_flattens_lists() {
        let text = "apiVersion: v1\nkind: List\nitems:\n- apiVersion: v1\n  kind: Secret\n  metadata:\n    name: a\n- apiVersion: v1\n  kind: Secret\n  metadata:\n    name: b\n";
        assert_eq!(parse_manifests(text).unwrap().len(), 2);
    }

    #[test]
    fn test_empty_text_yields_nothing() {
        assert!(parse_manifests("").unwrap().is_empty());
        assert!(parse_manifests("---\n---\n").unwrap().is_empty());
    }

    #[test]
    fn test_malformed_yaml_is_parse_error() {
        assert!(matches!(
            parse_manifests("kind: [unclosed"),
            Err(DeclarativeError::Parse(_))
        ));
    }
}
