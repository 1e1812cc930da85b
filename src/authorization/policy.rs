//! Policy documents and their compiled, match-ready form.
//!
//! Subjects, resources and actions are patterns: plain text matches exactly,
//! `*` matches any run of characters and `<...>` embeds a regular expression,
//! e.g. `resources:articles:<[0-9]+>`.

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::AccessRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
}

impl Effect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Effect::Allow => "allow",
            Effect::Deny => "deny",
        }
    }
}

/// Access-control rule as served by the management plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub subjects: Vec<String>,
    pub resources: Vec<String>,
    pub actions: Vec<String>,
    pub effect: Effect,
    #[serde(default)]
    pub conditions: HashMap<String, Condition>,
}

/// Predicate over one `AccessRequest::context` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "options")]
pub enum Condition {
    #[serde(rename = "StringEqualCondition")]
    StringEqual { equals: String },
    #[serde(rename = "StringMatchCondition")]
    StringMatch { matches: String },
    #[serde(rename = "EqualsSubjectCondition")]
    EqualsSubject {},
    #[serde(rename = "BooleanCondition")]
    Boolean { value: bool },
    #[serde(rename = "StringPairsEqualCondition")]
    StringPairsEqual {},
}

#[derive(Debug, Clone)]
enum Pattern {
    Exact(String),
    Regex(Regex),
}

impl Pattern {
    fn compile(raw: &str) -> Result<Self> {
        if !raw.contains('<') && !raw.contains('*') {
            return Ok(Pattern::Exact(raw.to_string()));
        }

        let mut expr = String::with_capacity(raw.len() + 8);
        expr.push('^');
        let mut literal = String::new();
        let mut inner = String::new();
        let mut depth = 0usize;
        for c in raw.chars() {
            match (c, depth) {
                ('<', 0) => {
                    expr.push_str(&regex::escape(&literal));
                    literal.clear();
                    depth = 1;
                }
                ('<', _) => {
                    depth += 1;
                    inner.push(c);
                }
                ('>', 1) => {
                    expr.push_str("(?:");
                    expr.push_str(&inner);
                    expr.push(')');
                    inner.clear();
                    depth = 0;
                }
                ('>', _) if depth > 1 => {
                    depth -= 1;
                    inner.push(c);
                }
                ('*', 0) => {
                    expr.push_str(&regex::escape(&literal));
                    literal.clear();
                    expr.push_str(".*");
                }
                (_, 0) => literal.push(c),
                _ => inner.push(c),
            }
        }
        if depth != 0 {
            return Err(anyhow!("unbalanced delimiters in pattern {raw:?}"));
        }
        expr.push_str(&regex::escape(&literal));
        expr.push('$');

        let re = Regex::new(&expr).with_context(|| format!("compiling pattern {raw:?}"))?;
        Ok(Pattern::Regex(re))
    }

    fn is_match(&self, value: &str) -> bool {
        match self {
            Pattern::Exact(s) => s == value,
            Pattern::Regex(re) => re.is_match(value),
        }
    }
}

fn compile_all(raw: &[String]) -> Result<Vec<Pattern>> {
    raw.iter().map(|p| Pattern::compile(p)).collect()
}

fn any_match(patterns: &[Pattern], value: &str) -> bool {
    patterns.iter().any(|p| p.is_match(value))
}

#[derive(Debug, Clone)]
enum CompiledCondition {
    StringEqual(String),
    StringMatch(Regex),
    EqualsSubject,
    Boolean(bool),
    StringPairsEqual,
}

impl CompiledCondition {
    fn compile(cond: &Condition) -> Result<Self> {
        Ok(match cond {
            Condition::StringEqual { equals } => CompiledCondition::StringEqual(equals.clone()),
            Condition::StringMatch { matches } => {
                let re = Regex::new(&format!("^(?:{matches})$"))
                    .with_context(|| format!("compiling condition regex {matches:?}"))?;
                CompiledCondition::StringMatch(re)
            }
            Condition::EqualsSubject {} => CompiledCondition::EqualsSubject,
            Condition::Boolean { value } => CompiledCondition::Boolean(*value),
            Condition::StringPairsEqual {} => CompiledCondition::StringPairsEqual,
        })
    }

    fn fulfills(&self, value: &Value, request: &AccessRequest) -> bool {
        match self {
            CompiledCondition::StringEqual(expected) => value.as_str() == Some(expected.as_str()),
            CompiledCondition::StringMatch(re) => value.as_str().is_some_and(|s| re.is_match(s)),
            CompiledCondition::EqualsSubject => value.as_str() == Some(request.subject.as_str()),
            CompiledCondition::Boolean(expected) => value.as_bool() == Some(*expected),
            CompiledCondition::StringPairsEqual => value.as_array().is_some_and(|pairs| {
                pairs.iter().all(|pair| match pair.as_array().map(Vec::as_slice) {
                    Some([a, b]) => a.is_string() && a == b,
                    _ => false,
                })
            }),
        }
    }
}

/// A policy with its patterns and condition regexes compiled.
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    pub policy: Policy,
    subjects: Vec<Pattern>,
    resources: Vec<Pattern>,
    actions: Vec<Pattern>,
    conditions: Vec<(String, CompiledCondition)>,
}

impl CompiledPolicy {
    pub fn compile(policy: Policy) -> Result<Self> {
        let subjects = compile_all(&policy.subjects)?;
        let resources = compile_all(&policy.resources)?;
        let actions = compile_all(&policy.actions)?;
        let conditions = policy
            .conditions
            .iter()
            .map(|(key, cond)| Ok((key.clone(), CompiledCondition::compile(cond)?)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            policy,
            subjects,
            resources,
            actions,
            conditions,
        })
    }

    pub fn id(&self) -> &str {
        &self.policy.id
    }

    pub fn effect(&self) -> Effect {
        self.policy.effect
    }

    /// Literal (non-pattern) subjects, used to index the policy.
    pub fn literal_subjects(&self) -> impl Iterator<Item = &str> {
        self.subjects.iter().filter_map(|p| match p {
            Pattern::Exact(s) => Some(s.as_str()),
            Pattern::Regex(_) => None,
        })
    }

    pub fn has_pattern_subject(&self) -> bool {
        self.subjects.iter().any(|p| matches!(p, Pattern::Regex(_)))
    }

    pub fn matches(&self, request: &AccessRequest) -> bool {
        any_match(&self.subjects, &request.subject)
            && any_match(&self.resources, &request.resource)
            && any_match(&self.actions, &request.action)
            && self.conditions.iter().all(|(key, cond)| {
                request
                    .context
                    .get(key)
                    .is_some_and(|value| cond.fulfills(value, request))
            })
    }
}
