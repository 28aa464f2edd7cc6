//! JSON schema rewriting for vendors that accept only a subset of JSON schema.

use serde_json::{Map, Value};

use crate::error::{TransformError, TransformResult};

/// Subschemas nested deeper than this are left as they are.
const MAX_SCHEMA_DEPTH: usize = 5;

/// String formats Gemini accepts.
const GEMINI_STRING_FORMATS: [&str; 2] = ["enum", "date-time"];

/// Visits every schema node of a JSON schema.
pub(super) trait SchemaVisitor {
    fn visit(&mut self, node: &mut Map<String, Value>) -> TransformResult<()>;
}

/// Walks `schema` depth first, calling the visitor on each schema object before
/// descending into its subschemas. Nodes below `max_depth` are not visited.
pub(super) fn walk(schema: &mut Value, visitor: &mut impl SchemaVisitor, max_depth: usize) -> TransformResult<()> {
    walk_node(schema, visitor, 0, max_depth)
}

fn walk_node(schema: &mut Value, visitor: &mut impl SchemaVisitor, depth: usize, max_depth: usize) -> TransformResult<()> {
    if depth >= max_depth {
        return Ok(());
    }

    let Value::Object(node) = schema else {
        // `true` and `false` are valid schemas with nothing to clean
        return match schema {
            Value::Bool(_) => Ok(()),
            other => Err(TransformError::SchemaCleaningFailure(format!(
                "expected a schema object at depth {depth}, found {}",
                kind(other)
            ))),
        };
    };

    visitor.visit(node)?;

    for (key, child) in node.iter_mut() {
        match key.as_str() {
            "properties" | "$defs" | "definitions" | "patternProperties" => {
                let Value::Object(children) = child else {
                    return Err(TransformError::SchemaCleaningFailure(format!(
                        "`{key}` must be an object, found {}",
                        kind(child)
                    )));
                };

                for grandchild in children.values_mut() {
                    walk_node(grandchild, visitor, depth + 1, max_depth)?;
                }
            }
            "items" | "additionalProperties" | "not" => match child {
                Value::Array(items) => {
                    for item in items {
                        walk_node(item, visitor, depth + 1, max_depth)?;
                    }
                }
                other => walk_node(other, visitor, depth + 1, max_depth)?,
            },
            "allOf" | "anyOf" | "oneOf" | "prefixItems" => {
                let Value::Array(variants) = child else {
                    return Err(TransformError::SchemaCleaningFailure(format!(
                        "`{key}` must be an array, found {}",
                        kind(child)
                    )));
                };

                for variant in variants {
                    walk_node(variant, visitor, depth + 1, max_depth)?;
                }
            }
            _ => (),
        }
    }

    Ok(())
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Whether the node declares `kind` as its type, alone or in a type list.
fn has_type(node: &Map<String, Value>, kind: &str) -> bool {
    match node.get("type") {
        Some(Value::String(declared)) => declared == kind,
        Some(Value::Array(declared)) => declared.iter().any(|declared| declared.as_str() == Some(kind)),
        _ => false,
    }
}

/// Drops the keywords Gemini rejects.
struct GeminiSchemaCleaner;

impl SchemaVisitor for GeminiSchemaCleaner {
    fn visit(&mut self, node: &mut Map<String, Value>) -> TransformResult<()> {
        node.remove("$schema");

        if has_type(node, "object") {
            node.remove("additionalProperties");
        }

        if has_type(node, "string") {
            let supported = node
                .get("format")
                .and_then(Value::as_str)
                .is_none_or(|format| GEMINI_STRING_FORMATS.contains(&format));

            if !supported {
                node.remove("format");
            }
        }

        Ok(())
    }
}

/// Cleans a tool parameter schema for Gemini. A schema that cannot be walked is
/// returned unmodified.
pub(super) fn clean_for_gemini(schema: &Value) -> Value {
    let mut cleaned = schema.clone();

    match walk(&mut cleaned, &mut GeminiSchemaCleaner, MAX_SCHEMA_DEPTH) {
        Ok(()) => cleaned,
        Err(error) => {
            log::warn!("{error}, sending the tool schema unmodified");
            schema.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn strips_unsupported_keywords() {
        let schema = json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "url": { "type": "string", "format": "uri" },
                "when": { "type": "string", "format": "date-time" },
                "tags": {
                    "type": "array",
                    "items": { "type": ["object", "null"], "additionalProperties": true, "properties": {} }
                },
                "choice": {
                    "anyOf": [
                        { "type": "string", "format": "email" },
                        { "type": "integer", "format": "int32" }
                    ]
                }
            }
        });

        let cleaned = clean_for_gemini(&schema);

        assert_eq!(
            cleaned,
            json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string" },
                    "when": { "type": "string", "format": "date-time" },
                    "tags": {
                        "type": "array",
                        "items": { "type": ["object", "null"], "properties": {} }
                    },
                    "choice": {
                        "anyOf": [
                            { "type": "string" },
                            { "type": "integer", "format": "int32" }
                        ]
                    }
                }
            })
        );
    }

    #[test]
    fn deep_nesting_is_left_alone() {
        let mut schema = json!({ "type": "object", "additionalProperties": false });

        for _ in 0..8 {
            schema = json!({
                "type": "object",
                "additionalProperties": false,
                "properties": { "child": schema }
            });
        }

        let cleaned = clean_for_gemini(&schema);

        let mut node = &cleaned;
        let mut depth = 0;

        while let Some(child) = node.pointer("/properties/child") {
            let stripped = node.get("additionalProperties").is_none();
            assert_eq!(stripped, depth < MAX_SCHEMA_DEPTH, "depth {depth}");

            node = child;
            depth += 1;
        }

        assert_eq!(depth, 8);
    }

    #[test]
    fn unwalkable_schema_is_returned_unmodified() {
        let schema = json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "properties": ["not", "a", "map"]
        });

        assert_eq!(clean_for_gemini(&schema), schema);
    }

    #[test]
    fn walker_reports_the_offending_keyword() {
        let mut schema = json!({ "type": "object", "anyOf": { "type": "string" } });
        let error = walk(&mut schema, &mut GeminiSchemaCleaner, MAX_SCHEMA_DEPTH).unwrap_err();

        insta::assert_snapshot!(error, @"failed to clean tool schema: `anyOf` must be an array, found an object");
    }
}
