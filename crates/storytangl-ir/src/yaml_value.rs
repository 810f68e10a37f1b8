// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots/echo>
//! Conversion between raw `serde_yaml::Value` and the engine's closed
//! [`Value`](storytangl_core::Value) type.
//!
//! Author-facing YAML is unrestricted; anything that lands in a node's
//! `locals` or a template's seed data has to be narrowed to the engine's
//! namespace-frame value set first. Anything YAML can express that `Value`
//! cannot (tagged enums, null map keys) is rejected rather than silently
//! coerced.

use std::collections::BTreeMap;

use storytangl_core::Value;

use crate::error::{IrError, IrResult};

/// Converts a parsed YAML node into an engine [`Value`], recursively.
///
/// # Errors
/// [`IrError::MalformedField`] if the YAML contains a non-string mapping
/// key, which `Value::Map` cannot represent.
pub fn yaml_to_value(yaml: &serde_yaml::Value, context: &str) -> IrResult<Value> {
    match yaml {
        serde_yaml::Value::Null => Ok(Value::None),
        serde_yaml::Value::Bool(b) => Ok(Value::Bool(*b)),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Value::Float(f))
            } else {
                Ok(Value::None)
            }
        }
        serde_yaml::Value::String(s) => Ok(Value::Str(s.clone())),
        serde_yaml::Value::Sequence(items) => {
            let values = items
                .iter()
                .map(|item| yaml_to_value(item, context))
                .collect::<IrResult<Vec<_>>>()?;
            Ok(Value::List(values))
        }
        serde_yaml::Value::Mapping(map) => {
            let mut out = BTreeMap::new();
            for (k, v) in map {
                let key = k.as_str().ok_or_else(|| IrError::MalformedField {
                    field: "<map key>".to_owned(),
                    context: context.to_owned(),
                    reason: "only string keys are supported".to_owned(),
                })?;
                out.insert(key.to_owned(), yaml_to_value(v, context)?);
            }
            Ok(Value::Map(out))
        }
        serde_yaml::Value::Tagged(tagged) => yaml_to_value(&tagged.value, context),
    }
}

/// Converts a string-keyed YAML mapping into a `BTreeMap<String, Value>`,
/// the shape used by `locals`/template seed data. A `None`/absent `yaml`
/// yields an empty map.
///
/// # Errors
/// Propagates [`IrError::MalformedField`] if `yaml` isn't a mapping, or
/// from [`yaml_to_value`].
pub fn yaml_to_locals(yaml: Option<&serde_yaml::Value>, context: &str) -> IrResult<BTreeMap<String, Value>> {
    let Some(yaml) = yaml else {
        return Ok(BTreeMap::new());
    };
    if matches!(yaml, serde_yaml::Value::Null) {
        return Ok(BTreeMap::new());
    }
    let serde_yaml::Value::Mapping(map) = yaml else {
        return Err(IrError::MalformedField {
            field: "locals".to_owned(),
            context: context.to_owned(),
            reason: "expected a mapping".to_owned(),
        });
    };
    let mut out = BTreeMap::new();
    for (k, v) in map {
        let key = k.as_str().ok_or_else(|| IrError::MalformedField {
            field: "locals".to_owned(),
            context: context.to_owned(),
            reason: "only string keys are supported".to_owned(),
        })?;
        out.insert(key.to_owned(), yaml_to_value(v, context)?);
    }
    Ok(out)
}

/// Reads a plain string field out of a mapping, if present.
pub fn get_str<'a>(map: &'a serde_yaml::Mapping, key: &str) -> Option<&'a str> {
    map.get(serde_yaml::Value::String(key.to_owned()))
        .and_then(serde_yaml::Value::as_str)
}

/// Reads a string-list field (`Vec<String>`) out of a mapping; an absent
/// key yields an empty vector.
///
/// # Errors
/// [`IrError::MalformedField`] if the field is present but not a sequence
/// of strings.
pub fn get_str_list(map: &serde_yaml::Mapping, key: &str, context: &str) -> IrResult<Vec<String>> {
    let Some(value) = map.get(serde_yaml::Value::String(key.to_owned())) else {
        return Ok(Vec::new());
    };
    if matches!(value, serde_yaml::Value::Null) {
        return Ok(Vec::new());
    }
    let serde_yaml::Value::Sequence(items) = value else {
        return Err(IrError::MalformedField {
            field: key.to_owned(),
            context: context.to_owned(),
            reason: "expected a list of strings".to_owned(),
        });
    };
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_owned)
                .ok_or_else(|| IrError::MalformedField {
                    field: key.to_owned(),
                    context: context.to_owned(),
                    reason: "expected a list of strings".to_owned(),
                })
        })
        .collect()
}

/// Reads a field that may be authored as a bare string or a list of
/// strings, normalizing either form to a `Vec<String>` — the `scripts:
/// story.yaml` vs `scripts: [a.yaml, b.yaml]` shorthand world manifests use.
///
/// # Errors
/// [`IrError::MalformedField`] if the field is present but neither a
/// string nor a sequence of strings.
pub fn get_str_or_list(map: &serde_yaml::Mapping, key: &str, context: &str) -> IrResult<Vec<String>> {
    let Some(value) = map.get(serde_yaml::Value::String(key.to_owned())) else {
        return Ok(Vec::new());
    };
    match value {
        serde_yaml::Value::Null => Ok(Vec::new()),
        serde_yaml::Value::String(s) => Ok(vec![s.clone()]),
        serde_yaml::Value::Sequence(_) => get_str_list(map, key, context),
        other => Err(IrError::MalformedField {
            field: key.to_owned(),
            context: context.to_owned(),
            reason: format!("expected a string or list of strings, got {other:?}"),
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn scalars_convert_to_matching_value_variants() {
        let yaml: serde_yaml::Value = serde_yaml::from_str("42").unwrap();
        assert_eq!(yaml_to_value(&yaml, "test").unwrap(), Value::Int(42));
    }

    #[test]
    fn non_string_map_keys_are_rejected() {
        let yaml: serde_yaml::Value = serde_yaml::from_str("1: a").unwrap();
        assert!(yaml_to_value(&yaml, "test").is_err());
    }

    #[test]
    fn str_or_list_normalizes_a_bare_scalar_to_a_single_element_list() {
        let yaml: serde_yaml::Value = serde_yaml::from_str("scripts: story.yaml").unwrap();
        let map = yaml.as_mapping().unwrap();
        assert_eq!(get_str_or_list(map, "scripts", "test").unwrap(), vec!["story.yaml".to_owned()]);
    }

    #[test]
    fn nested_sequences_and_mappings_round_trip_shape() {
        let yaml: serde_yaml::Value = serde_yaml::from_str("items:\n  - 1\n  - 2\nname: a").unwrap();
        let value = yaml_to_value(&yaml, "test").unwrap();
        match value {
            Value::Map(map) => {
                assert_eq!(map.get("name"), Some(&Value::Str("a".into())));
                assert_eq!(map.get("items"), Some(&Value::List(vec![Value::Int(1), Value::Int(2)])));
            }
            other => panic!("expected Map, got {other:?}"),
        }
    }
}
