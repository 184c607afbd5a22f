//! Request parameter normalization.

use crate::schema::{FieldKind, ParamSchema};
use quarry_core::params::{CanonicalParams, CanonicalValue};
use quarry_core::{Error, Result};
use serde_json::Value;
use std::collections::BTreeSet;

/// Canonicalize a raw parameter bag against an application's schema.
///
/// The result is order-independent and type-stable: list fields are sorted
/// and de-duplicated, categorical strings are trimmed and lower-cased,
/// numbers are coerced to one representation, and fields equal to their
/// documented default are dropped so an explicit default and an omitted
/// field normalize the same.
pub fn normalize(schema: &ParamSchema, bag: &Value) -> Result<CanonicalParams> {
    let Some(object) = bag.as_object() else {
        return Err(Error::InvalidValue {
            field: "<root>".to_string(),
            reason: "parameters must be a JSON object".to_string(),
        });
    };

    let mut canonical = CanonicalParams::new();
    for (name, raw) in object {
        let Some(spec) = schema.get(name) else {
            return Err(Error::UnknownField(name.clone()));
        };
        // An explicit null is the same as omitting the field.
        if raw.is_null() {
            continue;
        }

        let value = normalize_value(name, &spec.kind, raw)?;
        if spec.default.as_ref() == Some(&value) {
            continue;
        }
        canonical.insert(name.clone(), value);
    }

    Ok(canonical)
}

fn normalize_value(field: &str, kind: &FieldKind, raw: &Value) -> Result<CanonicalValue> {
    match kind {
        FieldKind::Categorical { allowed } => {
            let s = as_categorical(field, raw)?;
            check_allowed(field, &s, allowed.as_ref())?;
            Ok(CanonicalValue::Str(s))
        }
        FieldKind::Number => as_number(field, raw),
        FieldKind::Flag => match raw {
            Value::Bool(b) => Ok(CanonicalValue::Bool(*b)),
            other => Err(invalid(field, format!("expected boolean, got {other}"))),
        },
        FieldKind::StringList { allowed } => {
            // A bare scalar is accepted as a one-element list.
            let items = as_list(raw);
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                let s = as_categorical(field, item)?;
                check_allowed(field, &s, allowed.as_ref())?;
                values.push(s);
            }
            values.sort();
            values.dedup();
            Ok(CanonicalValue::StrList(values))
        }
        FieldKind::IntegerList => {
            let items = as_list(raw);
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                match as_number(field, item)? {
                    CanonicalValue::Int(n) => values.push(n),
                    _ => {
                        return Err(invalid(field, "list elements must be integers".to_string()));
                    }
                }
            }
            values.sort_unstable();
            values.dedup();
            Ok(CanonicalValue::IntList(values))
        }
    }
}

fn as_list(raw: &Value) -> Vec<&Value> {
    match raw {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

fn as_categorical(field: &str, raw: &Value) -> Result<String> {
    match raw {
        Value::String(s) => Ok(s.trim().to_lowercase()),
        other => Err(invalid(field, format!("expected string, got {other}"))),
    }
}

fn check_allowed(field: &str, value: &str, allowed: Option<&BTreeSet<String>>) -> Result<()> {
    match allowed {
        Some(set) if !set.contains(value) => Err(invalid(
            field,
            format!("'{value}' is not one of the recognized values"),
        )),
        _ => Ok(()),
    }
}

fn as_number(field: &str, raw: &Value) -> Result<CanonicalValue> {
    match raw {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(CanonicalValue::Int(i))
            } else if let Some(f) = n.as_f64() {
                canonical_float(field, f)
            } else {
                Err(invalid(field, format!("unrepresentable number {n}")))
            }
        }
        // "2024" and 2024 must normalize identically.
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                Ok(CanonicalValue::Int(i))
            } else if let Ok(f) = trimmed.parse::<f64>() {
                canonical_float(field, f)
            } else {
                Err(invalid(field, format!("'{s}' is not numeric")))
            }
        }
        other => Err(invalid(field, format!("expected number, got {other}"))),
    }
}

// NaN and the infinities serialize to null in JSON, and NaN is unequal to
// itself. Neither can participate in a canonical form.
fn canonical_float(field: &str, f: f64) -> Result<CanonicalValue> {
    if !f.is_finite() {
        return Err(invalid(field, format!("non-finite number {f}")));
    }
    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Ok(CanonicalValue::Int(f as i64))
    } else {
        Ok(CanonicalValue::Float(f))
    }
}

fn invalid(field: &str, reason: String) -> Error {
    Error::InvalidValue {
        field: field.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldKind, FieldSpec, ParamSchema};
    use serde_json::json;

    fn schema() -> ParamSchema {
        ParamSchema::new()
            .enumerated("state", ["ca", "ny", "tx"])
            .number("year")
            .string_list("loan_purpose")
            .integer_list("tracts")
            .field(
                "include_denied",
                FieldSpec::new(FieldKind::Flag).with_default(CanonicalValue::Bool(false)),
            )
    }

    #[test]
    fn test_list_order_and_case_are_irrelevant() {
        let a = normalize(&schema(), &json!({"loan_purpose": ["refi", "purchase"]})).unwrap();
        let b = normalize(&schema(), &json!({"loan_purpose": ["Purchase", "Refi"]})).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_numeric_string_coerces() {
        let a = normalize(&schema(), &json!({"year": "2024"})).unwrap();
        let b = normalize(&schema(), &json!({"year": 2024})).unwrap();
        let c = normalize(&schema(), &json!({"year": 2024.0})).unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn test_nonfinite_numeric_strings_are_rejected() {
        for bad in ["NaN", "nan", "inf", "-inf", "Infinity", "-Infinity"] {
            let err = normalize(&schema(), &json!({"year": bad})).unwrap_err();
            assert!(
                matches!(err, Error::InvalidValue { ref field, .. } if field == "year"),
                "'{bad}' normalized instead of being rejected"
            );
        }
    }

    #[test]
    fn test_explicit_default_equals_omitted() {
        let explicit = normalize(&schema(), &json!({"include_denied": false})).unwrap();
        let omitted = normalize(&schema(), &json!({})).unwrap();
        assert_eq!(explicit, omitted);
        assert!(explicit.is_empty());
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let err = normalize(&schema(), &json!({"loan_porpoise": ["refi"]})).unwrap_err();
        assert!(matches!(err, Error::UnknownField(ref f) if f == "loan_porpoise"));
    }

    #[test]
    fn test_out_of_enumeration_value_is_rejected() {
        let err = normalize(&schema(), &json!({"state": "zz"})).unwrap_err();
        assert!(matches!(err, Error::InvalidValue { ref field, .. } if field == "state"));
    }

    #[test]
    fn test_lists_dedup_and_accept_scalars() {
        let a = normalize(&schema(), &json!({"tracts": [3, 1, 2, 1]})).unwrap();
        assert_eq!(
            a.get("tracts"),
            Some(&CanonicalValue::IntList(vec![1, 2, 3]))
        );

        let scalar = normalize(&schema(), &json!({"loan_purpose": "Refi"})).unwrap();
        assert_eq!(
            scalar.get("loan_purpose"),
            Some(&CanonicalValue::StrList(vec!["refi".to_string()]))
        );
    }

    #[test]
    fn test_null_is_omitted() {
        let value = normalize(&schema(), &json!({"year": null})).unwrap();
        assert!(value.is_empty());
    }
}
