//! Request and response bodies of the classification service.

use std::collections::BTreeMap;

use enricher_shared::{ResultMap, Subject, SubjectKind};
use serde::Serialize;
use serde_json::Value;

use crate::TransportError;

#[derive(Debug, Serialize)]
pub(crate) struct ClassifyRequest<'a> {
    pub subject: &'a str,
    pub kind: SubjectKind,
    #[serde(skip_serializing_if = "no_params")]
    pub params: &'a BTreeMap<String, String>,
}

impl<'a> From<&'a Subject> for ClassifyRequest<'a> {
    fn from(subject: &'a Subject) -> Self {
        Self {
            subject: &subject.key,
            kind: subject.kind,
            params: &subject.params,
        }
    }
}

fn no_params(params: &&BTreeMap<String, String>) -> bool {
    params.is_empty()
}

/// Decode `{"results": {category: value}}`.
///
/// A category value may be a string, number, boolean, `null`, an object
/// with a `name`, or an array of those. Anything else inside an array is
/// ignored; a missing or non-object `results` is malformed.
pub(crate) fn decode_results(body: &Value) -> Result<ResultMap, TransportError> {
    let results = body
        .get("results")
        .and_then(Value::as_object)
        .ok_or_else(|| TransportError::Malformed("missing \"results\" object".into()))?;

    let mut map = ResultMap::new();
    for (category, value) in results {
        let values = match value {
            Value::Array(items) => items.iter().filter_map(scalar).collect(),
            Value::Null => Vec::new(),
            other => match scalar(other) {
                Some(v) => vec![v],
                None => {
                    return Err(TransportError::Malformed(format!(
                        "unsupported value for category '{category}'"
                    )));
                }
            },
        };
        map.insert(category.clone(), values);
    }
    Ok(map)
}

/// Decode `{"remaining": n}`.
pub(crate) fn decode_remaining(body: &Value) -> Result<u64, TransportError> {
    body.get("remaining")
        .and_then(Value::as_u64)
        .ok_or_else(|| TransportError::Malformed("missing numeric \"remaining\"".into()))
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Object(obj) => obj.get("name").and_then(Value::as_str).map(String::from),
        Value::Null | Value::Array(_) => None,
    }
}
