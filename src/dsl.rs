//! Filter-tree DSL and its fragment compiler.
//!
//! A rule's leaf logic is a nested boolean tree of typed conditions. The
//! compiler resolves each field against the tenant's schema snapshot and
//! emits dialect fragments. Operators and logic keywords only ever come
//! from the closed enums below, never from user input.

use crate::{
    error::{Result, ServiceError},
    fields,
    schema::{self, SchemaEntry},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Logic {
    And,
    Or,
}

impl Logic {
    fn keyword(self) -> &'static str {
        match self {
            Logic::And => " AND ",
            Logic::Or => " OR ",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Neq,
    In,
    Contains,
    Prefix,
    Regex,
    Cidr,
    Lt,
    Lte,
    Gt,
    Gte,
    Range,
    Exists,
    NotExists,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ScalarValue {
    /// Renders a typed literal: numerics bare, booleans lowercased bare,
    /// strings single-quoted with embedded quotes doubled.
    pub fn render(&self) -> String {
        match self {
            ScalarValue::Bool(value) => value.to_string(),
            ScalarValue::Int(value) => value.to_string(),
            ScalarValue::Float(value) => {
                if value.fract() == 0.0 && value.is_finite() {
                    format!("{}", *value as i64)
                } else {
                    value.to_string()
                }
            }
            ScalarValue::Str(value) => format!("'{}'", value.replace('\'', "''")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum ConditionValue {
    #[default]
    None,
    Scalar(ScalarValue),
    List(Vec<ScalarValue>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterNode {
    Group {
        logic: Logic,
        children: Vec<FilterNode>,
    },
    Condition {
        field: String,
        op: Operator,
        #[serde(default)]
        value: ConditionValue,
        #[serde(default)]
        negate: bool,
    },
}

impl FilterNode {
    pub fn condition(field: impl Into<String>, op: Operator, value: ConditionValue) -> Self {
        FilterNode::Condition {
            field: field.into(),
            op,
            value,
            negate: false,
        }
    }

    /// Shape validation that runs before any schema resolution is attempted.
    pub fn validate(&self) -> Result<()> {
        match self {
            FilterNode::Group { children, .. } => {
                for child in children {
                    child.validate()?;
                }
                Ok(())
            }
            FilterNode::Condition {
                field, op, value, ..
            } => validate_condition(field, *op, value),
        }
    }
}

fn validate_condition(field: &str, op: Operator, value: &ConditionValue) -> Result<()> {
    let malformed = |expected: &str| {
        Err(ServiceError::MalformedCondition(format!(
            "operator '{op:?}' on field '{field}' requires {expected}"
        )))
    };

    match op {
        Operator::In => match value {
            ConditionValue::List(items) if !items.is_empty() => Ok(()),
            _ => malformed("a non-empty list value"),
        },
        Operator::Range => match value {
            ConditionValue::List(items) if items.len() == 2 => Ok(()),
            _ => malformed("exactly two bounds"),
        },
        Operator::Exists | Operator::NotExists => match value {
            ConditionValue::None => Ok(()),
            _ => malformed("no value"),
        },
        _ => match value {
            ConditionValue::Scalar(_) => Ok(()),
            _ => malformed("a scalar value"),
        },
    }
}

/// The universal-match fragment an empty group compiles to.
pub const UNIVERSAL_MATCH: &str = "TRUE";

/// Qualifies a rule field as a physical column or an embedded-payload
/// accessor, depending on where it lives in this tenant's schema.
pub fn qualify_field(field: &str, entry: &SchemaEntry) -> Result<String> {
    if fields::is_canonical(field) {
        if let Some(column) = schema::try_resolve(field, &entry.columns) {
            return Ok(column.to_string());
        }
    } else if entry.has_column(field) {
        return Ok(field.to_string());
    }

    // Not a plain column anywhere; probe the structured payload column.
    if let Some(extra) = schema::try_resolve("extra", &entry.columns) {
        return Ok(format!("{extra}['{field}']"));
    }

    Err(ServiceError::UnknownField(field.to_string()))
}

/// Compiles a filter tree to a fragment against one schema snapshot.
pub fn compile_filter(node: &FilterNode, entry: &SchemaEntry) -> Result<String> {
    node.validate()?;
    compile_node(node, entry)
}

fn compile_node(node: &FilterNode, entry: &SchemaEntry) -> Result<String> {
    match node {
        FilterNode::Group { logic, children } => {
            if children.is_empty() {
                return Ok(UNIVERSAL_MATCH.to_string());
            }
            // A single child needs no wrapping parentheses.
            if let [single] = children.as_slice() {
                return compile_node(single, entry);
            }
            let parts = children
                .iter()
                .map(|child| compile_node(child, entry))
                .collect::<Result<Vec<_>>>()?;
            Ok(format!("({})", parts.join(logic.keyword())))
        }
        FilterNode::Condition {
            field,
            op,
            value,
            negate,
        } => {
            let column = qualify_field(field, entry)?;
            let fragment = compile_condition(&column, *op, value);
            if *negate {
                Ok(format!("NOT ({fragment})"))
            } else {
                Ok(fragment)
            }
        }
    }
}

fn compile_condition(column: &str, op: Operator, value: &ConditionValue) -> String {
    let scalar = |value: &ConditionValue| match value {
        ConditionValue::Scalar(scalar) => scalar.render(),
        // validate() has already rejected the other shapes
        _ => String::new(),
    };

    match op {
        Operator::Eq => format!("{column} = {}", scalar(value)),
        Operator::Neq => format!("{column} != {}", scalar(value)),
        Operator::In => match value {
            ConditionValue::List(items) => {
                let rendered = items
                    .iter()
                    .map(ScalarValue::render)
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{column} IN ({rendered})")
            }
            _ => String::new(),
        },
        Operator::Contains => format!("contains({column}, {})", scalar(value)),
        Operator::Prefix => format!("startswith({column}, {})", scalar(value)),
        Operator::Regex => format!("match({column}, {})", scalar(value)),
        Operator::Cidr => format!("cidr_match({column}, {})", scalar(value)),
        Operator::Lt => format!("{column} < {}", scalar(value)),
        Operator::Lte => format!("{column} <= {}", scalar(value)),
        Operator::Gt => format!("{column} > {}", scalar(value)),
        Operator::Gte => format!("{column} >= {}", scalar(value)),
        Operator::Range => match value {
            ConditionValue::List(bounds) => format!(
                "{column} BETWEEN {} AND {}",
                bounds[0].render(),
                bounds[1].render()
            ),
            _ => String::new(),
        },
        Operator::Exists => format!("{column} IS NOT NULL"),
        Operator::NotExists => format!("{column} IS NULL"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ScopeKey, SchemaEntry};
    use pretty_assertions::assert_eq;

    fn entry(columns: &[&str]) -> SchemaEntry {
        let types = columns
            .iter()
            .map(|name| (name.to_string(), "text".to_string()))
            .collect();
        SchemaEntry::new(ScopeKey::new("acme", "auth_logs"), types)
    }

    fn eq_str(field: &str, value: &str) -> FilterNode {
        FilterNode::condition(
            field,
            Operator::Eq,
            ConditionValue::Scalar(ScalarValue::Str(value.to_string())),
        )
    }

    #[test]
    fn empty_group_is_universal_match_for_any_logic() {
        let schema = entry(&["user"]);
        for logic in [Logic::And, Logic::Or] {
            let node = FilterNode::Group {
                logic,
                children: vec![],
            };
            assert_eq!(compile_filter(&node, &schema).unwrap(), UNIVERSAL_MATCH);
        }
    }

    #[test]
    fn compiles_nested_groups_with_parentheses() {
        let schema = entry(&["username", "client_ip", "status"]);
        let node = FilterNode::Group {
            logic: Logic::And,
            children: vec![
                eq_str("user", "root"),
                FilterNode::Group {
                    logic: Logic::Or,
                    children: vec![eq_str("status", "denied"), eq_str("status", "failed")],
                },
            ],
        };

        assert_eq!(
            compile_filter(&node, &schema).unwrap(),
            "(username = 'root' AND (status = 'denied' OR status = 'failed'))"
        );
    }

    #[test]
    fn compilation_is_deterministic() {
        let schema = entry(&["username", "client_ip"]);
        let node = FilterNode::Group {
            logic: Logic::Or,
            children: vec![eq_str("user", "a"), eq_str("src_ip", "10.0.0.1")],
        };

        let first = compile_filter(&node, &schema).unwrap();
        let second = compile_filter(&node, &schema).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn renders_operator_specific_fragments() {
        let schema = entry(&["client_ip", "bytes", "username"]);
        let cases = [
            (
                FilterNode::condition(
                    "src_ip",
                    Operator::Cidr,
                    ConditionValue::Scalar(ScalarValue::Str("10.0.0.0/8".into())),
                ),
                "cidr_match(client_ip, '10.0.0.0/8')",
            ),
            (
                FilterNode::condition(
                    "bytes",
                    Operator::Range,
                    ConditionValue::List(vec![ScalarValue::Int(100), ScalarValue::Int(200)]),
                ),
                "bytes BETWEEN 100 AND 200",
            ),
            (
                FilterNode::condition(
                    "user",
                    Operator::In,
                    ConditionValue::List(vec![
                        ScalarValue::Str("root".into()),
                        ScalarValue::Str("admin".into()),
                    ]),
                ),
                "username IN ('root', 'admin')",
            ),
            (
                FilterNode::condition(
                    "user",
                    Operator::Prefix,
                    ConditionValue::Scalar(ScalarValue::Str("svc_".into())),
                ),
                "startswith(username, 'svc_')",
            ),
            (
                FilterNode::condition("user", Operator::Exists, ConditionValue::None),
                "username IS NOT NULL",
            ),
        ];

        for (node, expected) in cases {
            assert_eq!(compile_filter(&node, &schema).unwrap(), expected);
        }
    }

    #[test]
    fn negation_wraps_the_fragment() {
        let schema = entry(&["username"]);
        let node = FilterNode::Condition {
            field: "user".into(),
            op: Operator::Eq,
            value: ConditionValue::Scalar(ScalarValue::Str("root".into())),
            negate: true,
        };
        assert_eq!(
            compile_filter(&node, &schema).unwrap(),
            "NOT (username = 'root')"
        );
    }

    #[test]
    fn string_literals_escape_quotes() {
        let schema = entry(&["message"]);
        let node = eq_str("message", "it's fine");
        assert_eq!(
            compile_filter(&node, &schema).unwrap(),
            "message = 'it''s fine'"
        );
    }

    #[test]
    fn unresolved_field_falls_back_to_payload_column() {
        let schema = entry(&["metadata", "username"]);
        let node = eq_str("process_name", "sshd");
        assert_eq!(
            compile_filter(&node, &schema).unwrap(),
            "metadata['process_name'] = 'sshd'"
        );
    }

    #[test]
    fn unresolvable_field_is_an_unknown_field_error() {
        let schema = entry(&["username"]);
        let node = eq_str("process_name", "sshd");
        let err = compile_filter(&node, &schema).unwrap_err();
        assert!(matches!(err, ServiceError::UnknownField(_)));
    }

    #[test]
    fn malformed_shapes_fail_before_resolution() {
        // Field does not resolve either, but the shape error must win.
        let schema = entry(&[]);
        let scalar_in = FilterNode::condition(
            "user",
            Operator::In,
            ConditionValue::Scalar(ScalarValue::Str("root".into())),
        );
        assert!(matches!(
            compile_filter(&scalar_in, &schema).unwrap_err(),
            ServiceError::MalformedCondition(_)
        ));

        let bad_range = FilterNode::condition(
            "bytes",
            Operator::Range,
            ConditionValue::List(vec![ScalarValue::Int(1)]),
        );
        assert!(matches!(
            compile_filter(&bad_range, &schema).unwrap_err(),
            ServiceError::MalformedCondition(_)
        ));
    }
}
