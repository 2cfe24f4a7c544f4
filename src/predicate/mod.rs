//! Boolean selector expressions.
//!
//! Storage selection only needs `parse` + `evaluate`, so the language sits
//! behind [`PredicateParser`] and [`Predicate`]. The built-in [`ExprParser`]
//! understands a small, CEL-flavoured subset:
//!
//! ```text
//! storageType == "lvmthin" && availableSpace > 100u * 1024u * 1024u * 1024u
//! name.startsWith("nvme") || name in ["fast", "faster"]
//! ```
//!
//! Expressions are type checked against a [`Schema`] when parsed and must
//! produce a bool.

mod eval;
mod lexer;
mod parser;

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PredicateError {
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    #[error("undeclared reference to {0:?}")]
    UnknownVariable(String),

    #[error("unknown function {0:?}")]
    UnknownFunction(String),

    #[error("type error: {0}")]
    Type(String),

    #[error("no value bound for {0:?}")]
    Unbound(String),

    #[error("integer overflow")]
    Overflow,

    #[error("division by zero")]
    DivisionByZero,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    String,
    Uint,
    Bool,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::String => write!(f, "string"),
            ValueType::Uint => write!(f, "uint"),
            ValueType::Bool => write!(f, "bool"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Uint(u64),
    Bool(bool),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::String(_) => ValueType::String,
            Value::Uint(_) => ValueType::Uint,
            Value::Bool(_) => ValueType::Bool,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::Uint(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

/// Declared variables and their types.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    variables: Vec<(String, ValueType)>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn variable(mut self, name: impl Into<String>, value_type: ValueType) -> Self {
        self.variables.push((name.into(), value_type));
        self
    }

    pub fn get(&self, name: &str) -> Option<ValueType> {
        self.variables
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| *t)
    }
}

pub type Bindings = HashMap<String, Value>;

pub trait Predicate: Send + Sync + fmt::Debug {
    fn evaluate(&self, bindings: &Bindings) -> Result<bool, PredicateError>;
}

pub trait PredicateParser: Send + Sync {
    fn parse(&self, text: &str, schema: &Schema) -> Result<Box<dyn Predicate>, PredicateError>;
}

/// The embedded expression language.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExprParser;

impl PredicateParser for ExprParser {
    fn parse(&self, text: &str, schema: &Schema) -> Result<Box<dyn Predicate>, PredicateError> {
        let expr = parser::parse(text)?;

        match expr.check(schema)? {
            ValueType::Bool => Ok(Box::new(CompiledExpr { expr })),
            other => Err(PredicateError::Type(format!(
                "expression must evaluate to bool, found {other}"
            ))),
        }
    }
}

#[derive(Debug)]
struct CompiledExpr {
    expr: parser::Expr,
}

impl Predicate for CompiledExpr {
    fn evaluate(&self, bindings: &Bindings) -> Result<bool, PredicateError> {
        match eval::eval(&self.expr, bindings)? {
            Value::Bool(b) => Ok(b),
            other => Err(PredicateError::Type(format!(
                "expression produced {}, not bool",
                other.value_type()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage_schema() -> Schema {
        Schema::new()
            .variable("name", ValueType::String)
            .variable("node", ValueType::String)
            .variable("storageType", ValueType::String)
            .variable("availableSpace", ValueType::Uint)
    }

    fn bindings(name: &str, storage_type: &str, avail: u64) -> Bindings {
        let mut b = Bindings::new();
        b.insert("name".into(), name.into());
        b.insert("node".into(), "pve1".into());
        b.insert("storageType".into(), storage_type.into());
        b.insert("availableSpace".into(), avail.into());
        b
    }

    fn eval(text: &str, b: &Bindings) -> Result<bool, PredicateError> {
        ExprParser.parse(text, &storage_schema())?.evaluate(b)
    }

    #[test]
    fn test_equality_and_comparison() {
        let b = bindings("local-lvm", "lvmthin", 500);
        assert_eq!(eval(r#"storageType == "lvmthin""#, &b), Ok(true));
        assert_eq!(eval(r#"name != "local-lvm""#, &b), Ok(false));
        assert_eq!(eval("availableSpace > 499u", &b), Ok(true));
        assert_eq!(eval("availableSpace >= 501", &b), Ok(false));
        assert_eq!(eval(r#"name < "m""#, &b), Ok(true));
    }

    #[test]
    fn test_boolean_combinators() {
        let b = bindings("fast", "zfspool", 10);
        assert_eq!(
            eval(r#"storageType == "zfspool" && (availableSpace > 100u || name == "fast")"#, &b),
            Ok(true)
        );
        assert_eq!(eval(r#"!(name == "fast")"#, &b), Ok(false));
        assert_eq!(eval("true || false && false", &b), Ok(true));
    }

    #[test]
    fn test_arithmetic_in_thresholds() {
        let gib = 1024u64 * 1024 * 1024;
        let b = bindings("big", "dir", 200 * gib);
        assert_eq!(eval("availableSpace > 100u * 1024u * 1024u * 1024u", &b), Ok(true));
        assert_eq!(eval("availableSpace / 1024u / 1024u / 1024u == 200u", &b), Ok(true));
    }

    #[test]
    fn test_string_methods_and_membership() {
        let b = bindings("nvme-pool", "lvmthin", 1);
        assert_eq!(eval(r#"name.startsWith("nvme")"#, &b), Ok(true));
        assert_eq!(eval(r#"name.endsWith("pool")"#, &b), Ok(true));
        assert_eq!(eval(r#"name.contains("-")"#, &b), Ok(true));
        assert_eq!(eval(r#"storageType in ["zfspool", "lvmthin"]"#, &b), Ok(true));
        assert_eq!(eval(r#"storageType in []"#, &b), Ok(false));
        assert_eq!(eval(r#"size(name) == 9u"#, &b), Ok(true));
    }

    #[test]
    fn test_type_errors_are_caught_at_parse_time() {
        let schema = storage_schema();
        assert!(matches!(
            ExprParser.parse(r#"availableSpace == "big""#, &schema),
            Err(PredicateError::Type(_))
        ));
        assert!(matches!(
            ExprParser.parse("availableSpace + 1u", &schema),
            Err(PredicateError::Type(_))
        ));
        assert!(matches!(
            ExprParser.parse(r#"name && true"#, &schema),
            Err(PredicateError::Type(_))
        ));
        assert_eq!(
            ExprParser.parse("pool == 'x'", &schema).unwrap_err(),
            PredicateError::UnknownVariable("pool".into())
        );
    }

    #[test]
    fn test_evaluation_errors() {
        let b = bindings("x", "dir", u64::MAX);
        assert_eq!(eval("availableSpace + 1u > 0u", &b), Err(PredicateError::Overflow));
        assert_eq!(eval("availableSpace / 0u > 0u", &b), Err(PredicateError::DivisionByZero));

        let mut missing = bindings("x", "dir", 1);
        missing.remove("storageType");
        assert_eq!(
            eval(r#"storageType == "dir""#, &missing),
            Err(PredicateError::Unbound("storageType".into()))
        );
    }

    #[test]
    fn test_short_circuit_skips_failing_branch() {
        let b = bindings("x", "dir", 1);
        assert_eq!(eval("false && availableSpace / 0u > 0u", &b), Ok(false));
        assert_eq!(eval("true || availableSpace / 0u > 0u", &b), Ok(true));
    }
}
