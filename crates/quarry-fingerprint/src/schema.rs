//! Per-application parameter schemas.
//!
//! Each report application declares the exact set of fields it recognizes,
//! their types, and their documented defaults. Unknown fields are a hard
//! validation error; silent drops would make two intuitively different
//! requests collide on one cache key.

use quarry_core::params::CanonicalValue;
use std::collections::BTreeMap;
use std::collections::BTreeSet;

/// Declared type of one recognized field.
#[derive(Debug, Clone)]
pub enum FieldKind {
    /// Trimmed, lower-cased string, optionally restricted to an enumeration.
    Categorical { allowed: Option<BTreeSet<String>> },
    /// Accepts i64, f64, or a numeric string; coerced to one canonical form.
    Number,
    Flag,
    /// Sorted, de-duplicated list of categorical strings.
    StringList { allowed: Option<BTreeSet<String>> },
    /// Sorted, de-duplicated list of integers.
    IntegerList,
}

/// One recognized field with its optional documented default.
///
/// A request whose normalized value equals the default is treated the same
/// as one that omitted the field.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub kind: FieldKind,
    pub default: Option<CanonicalValue>,
}

impl FieldSpec {
    pub fn new(kind: FieldKind) -> Self {
        Self {
            kind,
            default: None,
        }
    }

    pub fn with_default(mut self, default: CanonicalValue) -> Self {
        self.default = Some(default);
        self
    }
}

/// The full recognized filter set for one report application.
#[derive(Debug, Clone, Default)]
pub struct ParamSchema {
    fields: BTreeMap<String, FieldSpec>,
}

impl ParamSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.get(name)
    }

    pub fn categorical(self, name: impl Into<String>) -> Self {
        self.field(name, FieldSpec::new(FieldKind::Categorical { allowed: None }))
    }

    pub fn enumerated<I, S>(self, name: impl Into<String>, allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let allowed = allowed.into_iter().map(Into::into).collect();
        self.field(
            name,
            FieldSpec::new(FieldKind::Categorical {
                allowed: Some(allowed),
            }),
        )
    }

    pub fn number(self, name: impl Into<String>) -> Self {
        self.field(name, FieldSpec::new(FieldKind::Number))
    }

    pub fn string_list(self, name: impl Into<String>) -> Self {
        self.field(name, FieldSpec::new(FieldKind::StringList { allowed: None }))
    }

    pub fn integer_list(self, name: impl Into<String>) -> Self {
        self.field(name, FieldSpec::new(FieldKind::IntegerList))
    }
}
