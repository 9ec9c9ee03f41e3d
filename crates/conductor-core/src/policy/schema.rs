//! JSON Schema validation for routing policy documents.
//!
//! Documents are validated against `schema/policy.schema.json` before they
//! are deserialized, so structural mistakes are reported with their path.

use std::sync::OnceLock;

/// Embedded policy schema (loaded at compile time).
const POLICY_SCHEMA_JSON: &str = include_str!("../../schema/policy.schema.json");

/// Compiled validator (initialized once, reused).
static COMPILED_SCHEMA: OnceLock<Result<jsonschema::Validator, String>> = OnceLock::new();

fn get_validator() -> Result<&'static jsonschema::Validator, String> {
    let result = COMPILED_SCHEMA.get_or_init(|| {
        let schema_value: serde_json::Value = serde_json::from_str(POLICY_SCHEMA_JSON)
            .map_err(|e| format!("Invalid schema JSON: {}", e))?;

        jsonschema::options()
            .build(&schema_value)
            .map_err(|e| format!("Failed to compile schema: {}", e))
    });

    result.as_ref().map_err(Clone::clone)
}

/// Validate a policy document against the schema.
///
/// Returns every violation as `"<message> at <instance path>"`.
pub fn validate_policy_schema(document: &serde_json::Value) -> Result<(), Vec<String>> {
    let validator = get_validator().map_err(|e| vec![e])?;

    let errors: Vec<String> = validator
        .iter_errors(document)
        .map(|e| format!("{} at {}", e, e.instance_path))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
