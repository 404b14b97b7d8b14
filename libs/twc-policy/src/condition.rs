//! Condition evaluation
//!
//! A rule's `match`/`condition`/`value` vectors are zipped into [`Check`]s.
//! The top level is an AND. A triple whose three members are themselves
//! lists becomes a nested group that flips the mode, so the second level is
//! an OR, the third an AND again, and so on.

use serde_json::Value as JsonValue;
use std::cmp::Ordering;

use crate::error::{PolicyError, Result};
use crate::value::{PolicyContext, PolicyValue, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Always true
    None,
    /// Never true
    False,
}

impl Condition {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "eq" => Self::Eq,
            "ne" => Self::Ne,
            "gt" => Self::Gt,
            "gte" => Self::Gte,
            "lt" => Self::Lt,
            "lte" => Self::Lte,
            "none" => Self::None,
            "false" => Self::False,
            _ => return None,
        })
    }

    pub fn holds(self, lhs: &Value, rhs: &Value) -> bool {
        let ord = lhs.compare(rhs);
        match self {
            Self::Eq => lhs.loosely_equals(rhs),
            Self::Ne => !lhs.loosely_equals(rhs),
            Self::Gt => ord == Some(Ordering::Greater),
            Self::Gte => matches!(ord, Some(Ordering::Greater | Ordering::Equal)),
            Self::Lt => ord == Some(Ordering::Less),
            Self::Lte => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
            Self::None => true,
            Self::False => false,
        }
    }
}

/// One compiled match/condition/value triple
#[derive(Debug, Clone, PartialEq)]
pub enum Check {
    Compare {
        lhs: PolicyValue,
        condition: Condition,
        rhs: PolicyValue,
    },
    /// Nested triple of lists, evaluated in the opposite mode
    Group(Vec<Check>),
}

impl Check {
    /// Compile parallel vectors from configuration
    pub fn compile(
        policy: &str,
        matches: &[JsonValue],
        conditions: &[JsonValue],
        values: &[JsonValue],
    ) -> Result<Vec<Check>> {
        if matches.len() != conditions.len() || matches.len() != values.len() {
            return Err(PolicyError::Malformed {
                policy: policy.to_string(),
                reason: format!(
                    "match/condition/value lengths differ ({}/{}/{})",
                    matches.len(),
                    conditions.len(),
                    values.len()
                ),
            });
        }

        matches
            .iter()
            .zip(conditions)
            .zip(values)
            .map(|((m, c), v)| match (m, c, v) {
                (JsonValue::Array(m), JsonValue::Array(c), JsonValue::Array(v)) => {
                    Ok(Check::Group(Check::compile(policy, m, c, v)?))
                },
                (m, JsonValue::String(c), v) => {
                    let condition = Condition::parse(c).ok_or_else(|| PolicyError::UnknownCondition {
                        policy: policy.to_string(),
                        condition: c.clone(),
                    })?;
                    Ok(Check::Compare {
                        lhs: PolicyValue::parse(m),
                        condition,
                        rhs: PolicyValue::parse(v),
                    })
                },
                (_, c, _) => Err(PolicyError::UnknownCondition {
                    policy: policy.to_string(),
                    condition: c.to_string(),
                }),
            })
            .collect()
    }

    fn holds<C: PolicyContext + ?Sized>(&self, ctx: &C, exit_on: bool) -> bool {
        match self {
            Check::Compare {
                lhs,
                condition,
                rhs,
            } => {
                let l = lhs.resolve(ctx);
                let r = rhs.resolve(ctx);
                let result = condition.holds(&l, &r);
                tracing::trace!(
                    "Evaluating policy match {:?} [{}], condition {:?}, value {}: {}",
                    lhs,
                    l,
                    condition,
                    r,
                    result
                );
                result
            },
            Check::Group(checks) => check_conditions(checks, ctx, !exit_on),
        }
    }
}

/// Evaluate checks in AND mode (`exit_on = false`) or OR mode (`true`)
pub fn check_conditions<C: PolicyContext + ?Sized>(checks: &[Check], ctx: &C, exit_on: bool) -> bool {
    for check in checks {
        if check.holds(ctx, exit_on) == exit_on {
            return exit_on;
        }
    }
    !exit_on
}
