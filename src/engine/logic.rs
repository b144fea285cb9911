// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/fleetsim

//! Ordered condition/action rules

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;
use tracing::{debug, warn};

use super::expr::{Expr, ExprError};
use crate::model::{LogicRule, SampleValue};

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rule has an empty condition or action")]
    Empty,
    #[error("action '{0}' is not an assignment")]
    NotAssignment(String),
    #[error("'{0}' is not a valid assignment target")]
    InvalidTarget(String),
    #[error(transparent)]
    Expr(#[from] ExprError),
}

pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => chars.all(|c| c.is_alphanumeric() || c == '_'),
        _ => false,
    }
}

/// Evaluates rules against a working namespace; later rules see earlier writes
pub struct LogicEngine;

impl LogicEngine {
    /// Returns every write made by a satisfied rule, last write wins.
    /// Rules that fail to parse or evaluate are logged and skipped.
    pub fn evaluate(context: &HashMap<String, SampleValue>, rules: &[LogicRule]) -> BTreeMap<String, SampleValue> {
        let mut namespace = context.clone();
        let mut updates = BTreeMap::new();

        for (index, rule) in rules.iter().enumerate() {
            match Self::apply(rule, &namespace) {
                Ok(Some((target, value))) => {
                    debug!("rule {} fired: {} = {}", index, target, value);
                    namespace.insert(target.clone(), value.clone());
                    updates.insert(target, value);
                }
                Ok(None) => {}
                Err(e) => warn!("Skipping rule {} ('{}' => '{}'): {}", index, rule.condition, rule.action, e),
            }
        }

        updates
    }

    fn apply(rule: &LogicRule, namespace: &HashMap<String, SampleValue>) -> Result<Option<(String, SampleValue)>, RuleError> {
        let condition = rule.condition.trim();
        let action = rule.action.trim();
        if condition.is_empty() || action.is_empty() {
            return Err(RuleError::Empty);
        }

        let (target, expression) = action
            .split_once('=')
            .ok_or_else(|| RuleError::NotAssignment(action.to_string()))?;
        let target = target.trim();
        if !is_identifier(target) {
            return Err(RuleError::InvalidTarget(target.to_string()));
        }
        let expression = Expr::parse(expression)?;

        if !Expr::parse(condition)?.eval(namespace)?.truthy() {
            return Ok(None);
        }

        let value = expression.eval(namespace)?;
        Ok(Some((target.to_string(), value)))
    }
}
