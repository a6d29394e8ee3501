//! `((var))` interpolation of resource configuration.
//!
//! Sources, params and custom resource type sources may reference
//! credentials as `((name))` or `((name.field))`. A [`Variables`] provider is
//! created per (team, pipeline) by a [`VariablesFactory`]; values are
//! substituted before the configuration reaches a worker.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::Value;

use crate::error::CredsError;
use crate::resource::{Params, Source, VersionedResourceType, VersionedResourceTypes};

/// A credential lookup backend.
pub trait Variables: Send + Sync {
    /// Look up a variable by name. `Ok(None)` means undefined.
    fn get(&self, name: &str) -> Result<Option<Value>, CredsError>;
}

/// Creates the variables visible to one pipeline of one team.
pub trait VariablesFactory: Send + Sync {
    fn new_variables(&self, team_name: &str, pipeline_name: &str) -> Arc<dyn Variables>;
}

/// Fixed in-memory variables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StaticVariables(HashMap<String, Value>);

impl StaticVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }
}

impl FromIterator<(String, Value)> for StaticVariables {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Variables for StaticVariables {
    fn get(&self, name: &str) -> Result<Option<Value>, CredsError> {
        Ok(self.0.get(name).cloned())
    }
}

/// Hands out the same [`StaticVariables`] to every pipeline.
#[derive(Debug, Clone, Default)]
pub struct StaticVariablesFactory {
    variables: Arc<StaticVariables>,
}

impl StaticVariablesFactory {
    pub fn new(variables: StaticVariables) -> Self {
        Self {
            variables: Arc::new(variables),
        }
    }
}

impl VariablesFactory for StaticVariablesFactory {
    fn new_variables(&self, _team_name: &str, _pipeline_name: &str) -> Arc<dyn Variables> {
        self.variables.clone()
    }
}

/// Interpolate every placeholder inside `value`.
///
/// All undefined names are collected and reported together.
pub fn interpolate(variables: &dyn Variables, value: &Value) -> Result<Value, CredsError> {
    let mut missing = BTreeSet::new();
    let out = interpolate_value(variables, value, &mut missing)?;
    if missing.is_empty() {
        Ok(out)
    } else {
        Err(CredsError::UndefinedVariables(missing.into_iter().collect()))
    }
}

/// Interpolate a source configuration.
pub fn evaluate_source(variables: &dyn Variables, source: &Source) -> Result<Source, CredsError> {
    evaluate_map(variables, source)
}

/// Interpolate step params.
pub fn evaluate_params(variables: &dyn Variables, params: &Params) -> Result<Params, CredsError> {
    evaluate_map(variables, params)
}

impl VersionedResourceTypes {
    /// Interpolate the source of every custom resource type.
    pub fn evaluate(&self, variables: &dyn Variables) -> Result<Self, CredsError> {
        self.iter()
            .map(|t| {
                let mut evaluated: VersionedResourceType = t.clone();
                evaluated.resource_type.source = evaluate_map(variables, &t.resource_type.source)?;
                evaluated.resource_type.params = evaluate_map(variables, &t.resource_type.params)?;
                Ok(evaluated)
            })
            .collect()
    }
}

fn evaluate_map(
    variables: &dyn Variables,
    map: &std::collections::BTreeMap<String, Value>,
) -> Result<std::collections::BTreeMap<String, Value>, CredsError> {
    let mut missing = BTreeSet::new();
    let mut out = std::collections::BTreeMap::new();
    for (k, v) in map {
        out.insert(k.clone(), interpolate_value(variables, v, &mut missing)?);
    }
    if missing.is_empty() {
        Ok(out)
    } else {
        Err(CredsError::UndefinedVariables(missing.into_iter().collect()))
    }
}

fn interpolate_value(
    variables: &dyn Variables,
    value: &Value,
    missing: &mut BTreeSet<String>,
) -> Result<Value, CredsError> {
    match value {
        Value::String(s) => interpolate_str(variables, s, missing),
        Value::Array(items) => items
            .iter()
            .map(|v| interpolate_value(variables, v, missing))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), interpolate_value(variables, v, missing)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn interpolate_str(
    variables: &dyn Variables,
    s: &str,
    missing: &mut BTreeSet<String>,
) -> Result<Value, CredsError> {
    let placeholders = find_placeholders(s);
    if placeholders.is_empty() {
        return Ok(Value::String(s.to_string()));
    }

    // A lone placeholder keeps the variable's JSON type.
    if let [(start, end, name)] = placeholders.as_slice() {
        if *start == 0 && *end == s.len() {
            return Ok(match resolve(variables, name)? {
                Some(v) => v,
                None => {
                    missing.insert(root_name(name).to_string());
                    Value::String(s.to_string())
                }
            });
        }
    }

    let mut out = String::with_capacity(s.len());
    let mut cursor = 0;
    for (start, end, name) in &placeholders {
        out.push_str(&s[cursor..*start]);
        match resolve(variables, name)? {
            Some(Value::String(v)) => out.push_str(&v),
            Some(v) => out.push_str(&v.to_string()),
            None => {
                missing.insert(root_name(name).to_string());
                out.push_str(&s[*start..*end]);
            }
        }
        cursor = *end;
    }
    out.push_str(&s[cursor..]);
    Ok(Value::String(out))
}

/// Byte ranges and trimmed names of every `((name))` in `s`.
fn find_placeholders(s: &str) -> Vec<(usize, usize, String)> {
    let mut found = Vec::new();
    let mut offset = 0;
    while let Some(open) = s[offset..].find("((") {
        let start = offset + open;
        let Some(close) = s[start + 2..].find("))") else {
            break;
        };
        let end = start + 2 + close + 2;
        let name = s[start + 2..end - 2].trim();
        if !name.is_empty() && !name.contains('(') {
            found.push((start, end, name.to_string()));
        }
        offset = end;
    }
    found
}

fn root_name(path: &str) -> &str {
    path.split('.').next().unwrap_or(path)
}

fn resolve(variables: &dyn Variables, path: &str) -> Result<Option<Value>, CredsError> {
    let mut segments = path.split('.');
    let name = segments.next().unwrap_or(path);
    let Some(mut value) = variables.get(name)? else {
        return Ok(None);
    };
    for field in segments {
        value = match value {
            Value::Object(mut map) => map.remove(field).ok_or_else(|| CredsError::MissingField {
                name: name.to_string(),
                field: field.to_string(),
            })?,
            _ => {
                return Err(CredsError::MissingField {
                    name: name.to_string(),
                    field: field.to_string(),
                })
            }
        };
    }
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> StaticVariables {
        StaticVariables::new()
            .with("source-param", "super-secret-source")
            .with("port", 8080)
            .with("aws", json!({"key": "AKIA", "secret": "shh"}))
    }

    #[test]
    fn lone_placeholder_is_replaced_by_value() {
        let out = interpolate(&vars(), &json!("((source-param))")).unwrap();
        assert_eq!(out, json!("super-secret-source"));
    }

    #[test]
    fn lone_placeholder_keeps_json_type() {
        let out = interpolate(&vars(), &json!("((port))")).unwrap();
        assert_eq!(out, json!(8080));
    }

    #[test]
    fn embedded_placeholder_is_stringified() {
        let out = interpolate(&vars(), &json!("http://host:((port))/x")).unwrap();
        assert_eq!(out, json!("http://host:8080/x"));
    }

    #[test]
    fn dotted_placeholder_reads_field() {
        let out = interpolate(&vars(), &json!({"k": "(( aws.key ))"})).unwrap();
        assert_eq!(out, json!({"k": "AKIA"}));
    }

    #[test]
    fn missing_field_is_an_error() {
        let err = interpolate(&vars(), &json!("((aws.token))")).unwrap_err();
        assert_eq!(
            err,
            CredsError::MissingField {
                name: "aws".into(),
                field: "token".into()
            }
        );
    }

    #[test]
    fn undefined_variables_are_collected() {
        let err = interpolate(&vars(), &json!(["((b))", {"x": "((a)) and ((b))"}])).unwrap_err();
        assert_eq!(
            err,
            CredsError::UndefinedVariables(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn nested_structures_are_walked() {
        let source = Source::from([(
            "some".to_string(),
            json!({"list": ["((source-param))", 1, null]}),
        )]);
        let out = evaluate_source(&vars(), &source).unwrap();
        assert_eq!(out["some"], json!({"list": ["super-secret-source", 1, null]}));
    }

    #[test]
    fn text_without_placeholders_is_untouched() {
        let out = interpolate(&vars(), &json!("plain (text) here")).unwrap();
        assert_eq!(out, json!("plain (text) here"));
    }

    #[test]
    fn resource_types_sources_are_evaluated() {
        let types = VersionedResourceTypes::new(vec![VersionedResourceType {
            resource_type: crate::resource::ResourceType {
                name: "custom".into(),
                type_: "registry-image".into(),
                source: Source::from([("password".to_string(), json!("((aws.secret))"))]),
                ..Default::default()
            },
            version: Default::default(),
        }]);

        let evaluated = types.evaluate(&vars()).unwrap();
        assert_eq!(
            evaluated.lookup("custom").unwrap().resource_type.source["password"],
            json!("shh")
        );
    }

    #[test]
    fn static_factory_ignores_team_and_pipeline() {
        let factory = StaticVariablesFactory::new(vars());
        let v = factory.new_variables("main", "p");
        assert_eq!(v.get("port").unwrap(), Some(json!(8080)));
    }
}
