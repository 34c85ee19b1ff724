// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use serde_json::{Map, Number, Value};

use crate::{AuthError, AuthenticationMetadata};

/// Turns a JSON view of a credential (JWT claims, certificate fields, peer
/// credentials) into authentication metadata by evaluating a JMESPath
/// expression over it.
///
/// The expression must yield an object; its optional `public`, `private` and
/// `tracing` members populate the corresponding metadata layers. `tracing`
/// is an object whose values are stringified.
#[derive(Debug)]
pub struct MetadataExtractor {
    // `jmespath::Expression` holds `Rc` internals, so the compiled form
    // cannot live in a `Send + Sync` authenticator; the expression is
    // validated at construction and recompiled per evaluation.
    expression: String,
}

impl MetadataExtractor {
    pub fn new(expression: impl Into<String>) -> Result<Self, String> {
        let expression = expression.into();
        jmespath::compile(&expression)
            .map_err(|err| format!("Invalid JMESPath expression {expression:?}: {err}"))?;
        Ok(MetadataExtractor { expression })
    }

    /// Evaluate the expression, returning its raw JSON result.
    pub fn evaluate(&self, view: &Value) -> Result<Value, AuthError> {
        let expression = jmespath::compile(&self.expression)
            .map_err(|err| AuthError::Internal(format!("JMESPath compile failed: {err}")))?;
        let data = jmespath::Variable::from_json(&view.to_string())
            .map_err(|err| AuthError::Internal(format!("JMESPath input invalid: {err}")))?;
        let result = expression
            .search(data)
            .map_err(|err| AuthError::Internal(format!("JMESPath evaluation failed: {err}")))?;
        Ok(variable_to_json(&result))
    }

    /// Evaluate the expression as a boolean policy check.
    pub fn evaluate_predicate(&self, view: &Value) -> Result<bool, AuthError> {
        Ok(self.evaluate(view)? == Value::Bool(true))
    }

    /// Evaluate the expression and convert the result into metadata layers.
    pub fn extract(&self, view: &Value) -> Result<AuthenticationMetadata, AuthError> {
        let result = self.evaluate(view)?;
        let object = match result {
            Value::Object(object) => object,
            Value::Null => Map::new(),
            other => {
                return Err(AuthError::Internal(format!(
                    "Metadata expression yielded {other}, expected an object"
                )))
            }
        };

        let mut metadata = AuthenticationMetadata::default();
        if let Some(Value::Object(public)) = object.get("public") {
            metadata.public = public.clone();
        }
        if let Some(Value::Object(private)) = object.get("private") {
            metadata.private = private.clone();
        }
        if let Some(Value::Object(tracing)) = object.get("tracing") {
            for (key, value) in tracing {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                metadata.tracing_attributes.push((key.clone(), value));
            }
        }
        Ok(metadata)
    }
}

fn variable_to_json(variable: &jmespath::Variable) -> Value {
    if variable.is_null() {
        return Value::Null;
    }
    if let Some(b) = variable.as_boolean() {
        return Value::Bool(b);
    }
    if let Some(n) = variable.as_number() {
        return Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null);
    }
    if let Some(s) = variable.as_string() {
        return Value::String(s.clone());
    }
    if let Some(array) = variable.as_array() {
        return Value::Array(array.iter().map(|v| variable_to_json(v)).collect());
    }
    if let Some(object) = variable.as_object() {
        return Value::Object(
            object
                .iter()
                .map(|(k, v)| (k.clone(), variable_to_json(v)))
                .collect(),
        );
    }
    Value::Null
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::MetadataExtractor;

    #[test]
    fn rejects_invalid_expressions() {
        MetadataExtractor::new("][").unwrap_err();
    }

    #[test]
    fn extracts_layers() {
        let extractor = MetadataExtractor::new(
            "{public: {user: sub, instance: instance}, private: {groups: groups}, \
             tracing: {user: sub}}",
        )
        .unwrap();

        let claims = json!({
            "sub": "jane",
            "instance": "acme/ci",
            "groups": ["dev", "release"],
        });
        let metadata = extractor.extract(&claims).unwrap();
        assert_eq!(metadata.public["user"], json!("jane"));
        assert_eq!(metadata.public["instance"], json!("acme/ci"));
        assert_eq!(metadata.private["groups"], json!(["dev", "release"]));
        assert_eq!(
            metadata.tracing_attributes,
            vec![("user".to_owned(), "jane".to_owned())]
        );
    }

    #[test]
    fn predicates() {
        let extractor = MetadataExtractor::new("contains(dnsNames, 'worker.example.com')").unwrap();
        assert!(extractor
            .evaluate_predicate(&json!({"dnsNames": ["worker.example.com"]}))
            .unwrap());
        assert!(!extractor
            .evaluate_predicate(&json!({"dnsNames": ["other.example.com"]}))
            .unwrap());
    }

    #[test]
    fn null_results_yield_empty_metadata() {
        let extractor = MetadataExtractor::new("nonexistent").unwrap();
        let metadata = extractor.extract(&json!({"sub": "jane"})).unwrap();
        assert!(metadata.public.is_empty());
        assert!(metadata.private.is_empty());
        assert!(metadata.tracing_attributes.is_empty());
    }
}
