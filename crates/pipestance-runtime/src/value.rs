use crate::callgraph::Param;
use crate::errors::{ArgumentProblem, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A dynamically typed argument or output value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<ArgValue>),
    Map(BTreeMap<String, ArgValue>),
}

impl ArgValue {
    pub fn kind(&self) -> &'static str {
        match self {
            ArgValue::Null => "null",
            ArgValue::Bool(_) => "bool",
            ArgValue::Int(_) => "int",
            ArgValue::Float(_) => "float",
            ArgValue::String(_) => "string",
            ArgValue::List(_) => "list",
            ArgValue::Map(_) => "map",
        }
    }

    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Null => ArgValue::Null,
            Value::Bool(b) => ArgValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => ArgValue::Int(i),
                None => ArgValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => ArgValue::String(s),
            Value::Array(items) => ArgValue::List(items.into_iter().map(Self::from_json).collect()),
            Value::Object(map) => ArgValue::Map(
                map.into_iter()
                    .map(|(key, value)| (key, Self::from_json(value)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            ArgValue::Null => Value::Null,
            ArgValue::Bool(b) => Value::Bool(*b),
            ArgValue::Int(i) => Value::from(*i),
            ArgValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ArgValue::String(s) => Value::String(s.clone()),
            ArgValue::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            ArgValue::Map(map) => Value::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
        }
    }

    /// Whether the value fits `type_name` nested `array_dim` lists deep.
    /// Null fits every type, ints widen to float, and file types are paths.
    fn conforms(&self, type_name: &str, is_file: bool, array_dim: u32) -> bool {
        if matches!(self, ArgValue::Null) {
            return true;
        }
        if array_dim > 0 {
            return match self {
                ArgValue::List(items) => items
                    .iter()
                    .all(|item| item.conforms(type_name, is_file, array_dim - 1)),
                _ => false,
            };
        }
        if is_file {
            return matches!(self, ArgValue::String(_));
        }
        match type_name {
            "int" => matches!(self, ArgValue::Int(_)),
            "float" => matches!(self, ArgValue::Int(_) | ArgValue::Float(_)),
            "bool" => matches!(self, ArgValue::Bool(_)),
            "string" | "path" => matches!(self, ArgValue::String(_)),
            "map" => matches!(self, ArgValue::Map(_)),
            _ => true,
        }
    }
}

/// Parameter name to value, as written to `_args` and read from `_outs`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArgumentMap(pub BTreeMap<String, ArgValue>);

impl ArgumentMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(value: Value) -> Result<Self, ValidationError> {
        match ArgValue::from_json(value) {
            ArgValue::Map(map) => Ok(Self(map)),
            other => Err(ValidationError::new(vec![ArgumentProblem::NotAMap {
                found: other.kind().to_string(),
            }])),
        }
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .map(|(key, value)| (key.clone(), value.to_json()))
                .collect(),
        )
    }

    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.0.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ArgValue) {
        self.0.insert(name.into(), value);
    }

    /// Overlays `other` on top of this map.
    pub fn merge(&mut self, other: &ArgumentMap) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Checks presence and type of every declared parameter. Keys not in
    /// `params` are reported unless `allow_extra` is set.
    pub fn validate(&self, params: &[Param], allow_extra: bool) -> Result<(), ValidationError> {
        let mut problems = Vec::new();
        for param in params {
            match self.0.get(&param.name) {
                None => problems.push(ArgumentProblem::Missing {
                    name: param.name.clone(),
                }),
                Some(value) => {
                    if !value.conforms(&param.type_name, param.is_file, param.array_dim) {
                        problems.push(ArgumentProblem::TypeMismatch {
                            name: param.name.clone(),
                            expected: param.describe(),
                            found: value.kind().to_string(),
                        });
                    }
                }
            }
        }
        if !allow_extra {
            for key in self.0.keys() {
                if !params.iter().any(|param| &param.name == key) {
                    problems.push(ArgumentProblem::Unexpected { name: key.clone() });
                }
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::new(problems))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn param(name: &str, type_name: &str, array_dim: u32) -> Param {
        Param {
            name: name.to_string(),
            type_name: type_name.to_string(),
            array_dim,
            is_file: false,
        }
    }

    #[test]
    fn from_json_keeps_int_and_float_distinct() {
        let args = ArgumentMap::from_json(json!({"n": 3, "x": 1.5, "s": "a", "z": null}))
            .expect("object should convert");
        assert_eq!(args.get("n"), Some(&ArgValue::Int(3)));
        assert_eq!(args.get("x"), Some(&ArgValue::Float(1.5)));
        assert_eq!(args.get("z"), Some(&ArgValue::Null));
        assert_eq!(args.to_json(), json!({"n": 3, "x": 1.5, "s": "a", "z": null}));
    }

    #[test]
    fn from_json_rejects_non_object() {
        let err = ArgumentMap::from_json(json!([1, 2])).expect_err("array is not an argument map");
        assert_eq!(
            err.problems,
            vec![ArgumentProblem::NotAMap {
                found: "list".to_string()
            }]
        );
    }

    #[test]
    fn validate_reports_missing_unexpected_and_mismatched() {
        let args = ArgumentMap::from_json(json!({"n": "three", "extra": 1}))
            .expect("object should convert");
        let err = args
            .validate(&[param("n", "int", 0), param("m", "float", 0)], false)
            .expect_err("args should not validate");
        assert_eq!(err.problems.len(), 3);
        assert!(err.has_type_mismatch());
        assert!(err.to_string().contains("missing parameter 'm'"));
        assert!(err.to_string().contains("unexpected parameter 'extra'"));
    }

    #[test]
    fn validate_accepts_null_widening_and_nested_arrays() {
        let args = ArgumentMap::from_json(json!({
            "x": 2,
            "grid": [[1, 2], [3]],
            "maybe": null,
            "extra": true
        }))
        .expect("object should convert");
        args.validate(
            &[
                param("x", "float", 0),
                param("grid", "int", 2),
                param("maybe", "string", 0),
            ],
            true,
        )
        .expect("args should validate");

        let flat = ArgumentMap::from_json(json!({"grid": [1, 2]})).expect("object should convert");
        assert!(flat.validate(&[param("grid", "int", 2)], false).is_err());
    }

    #[test]
    fn validate_treats_file_types_as_paths() {
        let file = Param {
            name: "bam".to_string(),
            type_name: "bam".to_string(),
            array_dim: 0,
            is_file: true,
        };
        let good = ArgumentMap::from_json(json!({"bam": "/data/x.bam"})).expect("convert");
        good.validate(std::slice::from_ref(&file), false)
            .expect("path string should satisfy a file type");
        let bad = ArgumentMap::from_json(json!({"bam": 7})).expect("convert");
        assert!(bad.validate(&[file], false).is_err());
    }
}
