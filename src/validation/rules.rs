//! # Structural Validation Rules Module
//!
//! Composable rules over JSON payloads. Each rule is a small value with a
//! `check` operation; composition operators are themselves rules holding
//! other rules as data, so arbitrary rule trees can be assembled without a
//! class hierarchy.
//!
//! ## Composition Operators
//!
//! - [`AllOf`]: conjunction — every rule must pass
//! - [`AnyOf`]: disjunction — at least one rule must pass
//! - [`Union`]: first-match — the first rule whose shape applies decides
//!
//! ## Structural Rules
//!
//! - [`StructRule`]: objects with required keys and per-field rules
//! - [`SliceRule`]: arrays with length bounds and an element rule
//! - [`MapRule`]: homogeneous objects with size bounds and a value rule
//! - [`RecursiveRule`]: applies a rule to every node of a value tree with
//!   cycle detection and a depth bound
//!
//! [`PayloadRuleValidator`] adapts a rule tree into a pipeline
//! [`Validator`] by parsing the event payload as JSON first.

use crate::error::{ValidationError, ValidationErrorKind};
use crate::event::Event;
use crate::validation::{ValidationResult, Validator};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

/// Default recursion bound for [`RecursiveRule`]
pub const DEFAULT_MAX_DEPTH: usize = 100;

/// A single structural check over a JSON value
pub trait ValidationRule: Send + Sync {
    /// Name reported in failures produced by this rule
    fn name(&self) -> &str;

    /// Whether this rule applies to the value's shape
    ///
    /// Only consulted by first-match composition ([`Union`]); other
    /// operators run every rule unconditionally.
    fn applies(&self, _value: &Value) -> bool {
        true
    }

    /// Check the value, returning every failure found
    fn check(&self, value: &Value) -> Vec<ValidationError>;
}

/// Conjunction: every rule must pass
pub struct AllOf {
    name: String,
    rules: Vec<Arc<dyn ValidationRule>>,
}

impl AllOf {
    pub fn new(name: impl Into<String>, rules: Vec<Arc<dyn ValidationRule>>) -> Self {
        Self {
            name: name.into(),
            rules,
        }
    }
}

impl ValidationRule for AllOf {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, value: &Value) -> Vec<ValidationError> {
        self.rules
            .iter()
            .flat_map(|rule| rule.check(value))
            .collect()
    }
}

/// Disjunction: at least one rule must pass
pub struct AnyOf {
    name: String,
    rules: Vec<Arc<dyn ValidationRule>>,
}

impl AnyOf {
    pub fn new(name: impl Into<String>, rules: Vec<Arc<dyn ValidationRule>>) -> Self {
        Self {
            name: name.into(),
            rules,
        }
    }
}

impl ValidationRule for AnyOf {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, value: &Value) -> Vec<ValidationError> {
        if self.rules.is_empty() {
            return Vec::new();
        }
        for rule in &self.rules {
            if rule.check(value).is_empty() {
                return Vec::new();
            }
        }
        vec![ValidationError::new(
            self.name.clone(),
            ValidationErrorKind::FieldValidationFailed,
            format!("none of the {} alternatives matched", self.rules.len()),
        )]
    }
}

/// First-match: the first rule whose shape applies decides the outcome
///
/// Rules are consulted in order through [`ValidationRule::applies`]; the
/// first applicable rule's result is the union's result. A value no rule
/// applies to fails.
pub struct Union {
    name: String,
    rules: Vec<Arc<dyn ValidationRule>>,
}

impl Union {
    pub fn new(name: impl Into<String>, rules: Vec<Arc<dyn ValidationRule>>) -> Self {
        Self {
            name: name.into(),
            rules,
        }
    }
}

impl ValidationRule for Union {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, value: &Value) -> Vec<ValidationError> {
        for rule in &self.rules {
            if rule.applies(value) {
                return rule.check(value);
            }
        }
        vec![ValidationError::new(
            self.name.clone(),
            ValidationErrorKind::InvalidDataFormat,
            "no variant applies to this value",
        )]
    }
}

/// Object rule with required keys and per-field rules
pub struct StructRule {
    name: String,
    required_keys: Vec<String>,
    field_rules: Vec<(String, Arc<dyn ValidationRule>)>,
    deny_unknown: bool,
}

impl StructRule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required_keys: Vec::new(),
            field_rules: Vec::new(),
            deny_unknown: false,
        }
    }

    /// Require a key to be present
    pub fn require(mut self, key: impl Into<String>) -> Self {
        self.required_keys.push(key.into());
        self
    }

    /// Attach a rule to a field; the rule runs only when the field exists
    pub fn field(mut self, key: impl Into<String>, rule: Arc<dyn ValidationRule>) -> Self {
        self.field_rules.push((key.into(), rule));
        self
    }

    /// Reject keys that are neither required nor ruled
    pub fn deny_unknown(mut self) -> Self {
        self.deny_unknown = true;
        self
    }
}

impl ValidationRule for StructRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn applies(&self, value: &Value) -> bool {
        value.is_object()
    }

    fn check(&self, value: &Value) -> Vec<ValidationError> {
        let object = match value.as_object() {
            Some(object) => object,
            None => {
                return vec![ValidationError::new(
                    self.name.clone(),
                    ValidationErrorKind::InvalidDataFormat,
                    "expected an object",
                )]
            }
        };

        let mut errors = Vec::new();
        for key in &self.required_keys {
            if !object.contains_key(key) {
                errors.push(
                    ValidationError::new(
                        self.name.clone(),
                        ValidationErrorKind::MissingRequiredField,
                        format!("required key {:?} is missing", key),
                    )
                    .with_field(key.clone()),
                );
            }
        }
        for (key, rule) in &self.field_rules {
            if let Some(field_value) = object.get(key) {
                for error in rule.check(field_value) {
                    errors.push(error.with_field(key.clone()));
                }
            }
        }
        if self.deny_unknown {
            let known: HashSet<&str> = self
                .required_keys
                .iter()
                .map(String::as_str)
                .chain(self.field_rules.iter().map(|(k, _)| k.as_str()))
                .collect();
            for key in object.keys() {
                if !known.contains(key.as_str()) {
                    errors.push(
                        ValidationError::new(
                            self.name.clone(),
                            ValidationErrorKind::FieldValidationFailed,
                            format!("unknown key {:?}", key),
                        )
                        .with_field(key.clone()),
                    );
                }
            }
        }
        errors
    }
}

/// Array rule with length bounds and an element rule
pub struct SliceRule {
    name: String,
    min_len: usize,
    max_len: Option<usize>,
    element_rule: Option<Arc<dyn ValidationRule>>,
}

impl SliceRule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            min_len: 0,
            max_len: None,
            element_rule: None,
        }
    }

    pub fn min_len(mut self, min_len: usize) -> Self {
        self.min_len = min_len;
        self
    }

    pub fn max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    /// Apply a rule to every element
    pub fn elements(mut self, rule: Arc<dyn ValidationRule>) -> Self {
        self.element_rule = Some(rule);
        self
    }
}

impl ValidationRule for SliceRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn applies(&self, value: &Value) -> bool {
        value.is_array()
    }

    fn check(&self, value: &Value) -> Vec<ValidationError> {
        let items = match value.as_array() {
            Some(items) => items,
            None => {
                return vec![ValidationError::new(
                    self.name.clone(),
                    ValidationErrorKind::InvalidDataFormat,
                    "expected an array",
                )]
            }
        };

        let mut errors = Vec::new();
        if items.len() < self.min_len {
            errors.push(ValidationError::new(
                self.name.clone(),
                ValidationErrorKind::InvalidSize,
                format!("length {} is below minimum {}", items.len(), self.min_len),
            ));
        }
        if let Some(max_len) = self.max_len {
            if items.len() > max_len {
                errors.push(ValidationError::new(
                    self.name.clone(),
                    ValidationErrorKind::InvalidSize,
                    format!("length {} exceeds maximum {}", items.len(), max_len),
                ));
            }
        }
        if let Some(rule) = &self.element_rule {
            for (index, item) in items.iter().enumerate() {
                for error in rule.check(item) {
                    errors.push(error.with_field(format!("[{}]", index)));
                }
            }
        }
        errors
    }
}

/// Homogeneous-object rule with size bounds and a value rule
pub struct MapRule {
    name: String,
    required_keys: Vec<String>,
    min_size: usize,
    max_size: Option<usize>,
    value_rule: Option<Arc<dyn ValidationRule>>,
}

impl MapRule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required_keys: Vec::new(),
            min_size: 0,
            max_size: None,
            value_rule: None,
        }
    }

    pub fn require(mut self, key: impl Into<String>) -> Self {
        self.required_keys.push(key.into());
        self
    }

    pub fn min_size(mut self, min_size: usize) -> Self {
        self.min_size = min_size;
        self
    }

    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }

    /// Apply a rule to every value
    pub fn values(mut self, rule: Arc<dyn ValidationRule>) -> Self {
        self.value_rule = Some(rule);
        self
    }
}

impl ValidationRule for MapRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn applies(&self, value: &Value) -> bool {
        value.is_object()
    }

    fn check(&self, value: &Value) -> Vec<ValidationError> {
        let object = match value.as_object() {
            Some(object) => object,
            None => {
                return vec![ValidationError::new(
                    self.name.clone(),
                    ValidationErrorKind::InvalidDataFormat,
                    "expected a map",
                )]
            }
        };

        let mut errors = Vec::new();
        if object.len() < self.min_size {
            errors.push(ValidationError::new(
                self.name.clone(),
                ValidationErrorKind::InvalidSize,
                format!("map size {} is below minimum {}", object.len(), self.min_size),
            ));
        }
        if let Some(max_size) = self.max_size {
            if object.len() > max_size {
                errors.push(ValidationError::new(
                    self.name.clone(),
                    ValidationErrorKind::InvalidSize,
                    format!("map size {} exceeds maximum {}", object.len(), max_size),
                ));
            }
        }
        for key in &self.required_keys {
            if !object.contains_key(key) {
                errors.push(
                    ValidationError::new(
                        self.name.clone(),
                        ValidationErrorKind::MissingRequiredField,
                        format!("required key {:?} is missing", key),
                    )
                    .with_field(key.clone()),
                );
            }
        }
        if let Some(rule) = &self.value_rule {
            for (key, entry) in object {
                for error in rule.check(entry) {
                    errors.push(error.with_field(key.clone()));
                }
            }
        }
        errors
    }
}

/// Applies a rule to every node of a value tree
///
/// Traversal is depth-first with two guards: a depth bound (default
/// [`DEFAULT_MAX_DEPTH`]) and an identity set of visited container nodes.
/// Owned JSON trees cannot alias, but rules may feed the traversal values
/// obtained elsewhere; the identity check turns any aliasing loop into a
/// clean failure instead of a stack overflow.
pub struct RecursiveRule {
    name: String,
    node_rule: Arc<dyn ValidationRule>,
    max_depth: usize,
}

impl RecursiveRule {
    pub fn new(name: impl Into<String>, node_rule: Arc<dyn ValidationRule>) -> Self {
        Self {
            name: name.into(),
            node_rule,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    fn visit(
        &self,
        value: &Value,
        depth: usize,
        seen: &mut HashSet<*const Value>,
        errors: &mut Vec<ValidationError>,
    ) {
        if depth > self.max_depth {
            errors.push(ValidationError::new(
                self.name.clone(),
                ValidationErrorKind::InvalidDataFormat,
                format!("value nesting exceeds maximum depth {}", self.max_depth),
            ));
            return;
        }

        if value.is_object() || value.is_array() {
            if !seen.insert(value as *const Value) {
                errors.push(ValidationError::new(
                    self.name.clone(),
                    ValidationErrorKind::InvalidDataFormat,
                    "cycle detected in value tree",
                ));
                return;
            }
        }

        errors.extend(self.node_rule.check(value));

        match value {
            Value::Object(object) => {
                for entry in object.values() {
                    self.visit(entry, depth + 1, seen, errors);
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.visit(item, depth + 1, seen, errors);
                }
            }
            _ => {}
        }
    }
}

impl ValidationRule for RecursiveRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, value: &Value) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();
        self.visit(value, 0, &mut seen, &mut errors);
        errors
    }
}

/// Adapts a rule tree into a pipeline [`Validator`]
///
/// Parses the event payload as JSON and runs the rule against the parsed
/// value. Events whose payload is not JSON fail with
/// `invalid-data-format`.
pub struct PayloadRuleValidator {
    rule: Arc<dyn ValidationRule>,
    fail_fast: bool,
}

impl PayloadRuleValidator {
    pub fn new(rule: Arc<dyn ValidationRule>) -> Self {
        Self {
            rule,
            fail_fast: false,
        }
    }

    /// Keep only the first failure of the rule tree
    pub fn fail_fast(mut self) -> Self {
        self.fail_fast = true;
        self
    }
}

impl Validator for PayloadRuleValidator {
    fn validate(&self, event: &Event) -> ValidationResult {
        let value = match event.payload_json() {
            Ok(value) => value,
            Err(err) => {
                return ValidationResult::fail(ValidationError::new(
                    self.rule.name().to_string(),
                    ValidationErrorKind::InvalidDataFormat,
                    format!("payload is not valid JSON: {}", err),
                ));
            }
        };

        let mut failures = self.rule.check(&value);
        if self.fail_fast {
            failures.truncate(1);
        }

        let mut result = ValidationResult::ok();
        for failure in failures {
            result.push(failure);
        }
        result
    }

    fn name(&self) -> &str {
        "payload-rules"
    }
}

/// Leaf rule checking the JSON type of a value
pub struct TypeRule {
    name: String,
    expected: &'static str,
}

impl TypeRule {
    pub fn string() -> Self {
        Self {
            name: "type:string".to_string(),
            expected: "string",
        }
    }

    pub fn number() -> Self {
        Self {
            name: "type:number".to_string(),
            expected: "number",
        }
    }

    pub fn boolean() -> Self {
        Self {
            name: "type:boolean".to_string(),
            expected: "boolean",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self.expected {
            "string" => value.is_string(),
            "number" => value.is_number(),
            "boolean" => value.is_boolean(),
            _ => false,
        }
    }
}

impl ValidationRule for TypeRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn applies(&self, value: &Value) -> bool {
        self.matches(value)
    }

    fn check(&self, value: &Value) -> Vec<ValidationError> {
        if self.matches(value) {
            Vec::new()
        } else {
            vec![ValidationError::new(
                self.name.clone(),
                ValidationErrorKind::FieldValidationFailed,
                format!("expected a {}", self.expected),
            )]
        }
    }
}
