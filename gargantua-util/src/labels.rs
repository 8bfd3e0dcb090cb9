// Copyright 2025 The Gargantua Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Label selectors in the `k=v,k!=v,k in (a,b),!k` syntax.

use core::fmt;
use core::str::FromStr;
use std::collections::{BTreeMap, BTreeSet};

use gargantua_error::{Error, ResultExt, make_input_err};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, BTreeSet<String>),
    NotIn(String, BTreeSet<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Self::Equals(key, value) => labels.get(key) == Some(value),
            Self::NotEquals(key, value) => labels.get(key) != Some(value),
            Self::In(key, values) => labels.get(key).is_some_and(|v| values.contains(v)),
            Self::NotIn(key, values) => labels.get(key).is_none_or(|v| !values.contains(v)),
            Self::Exists(key) => labels.contains_key(key),
            Self::DoesNotExist(key) => !labels.contains_key(key),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |values: &BTreeSet<String>| values.iter().cloned().collect::<Vec<_>>().join(",");
        match self {
            Self::Equals(key, value) => write!(f, "{key}={value}"),
            Self::NotEquals(key, value) => write!(f, "{key}!={value}"),
            Self::In(key, values) => write!(f, "{key} in ({})", join(values)),
            Self::NotIn(key, values) => write!(f, "{key} notin ({})", join(values)),
            Self::Exists(key) => write!(f, "{key}"),
            Self::DoesNotExist(key) => write!(f, "!{key}"),
        }
    }
}

/// Conjunction of requirements. The empty selector matches everything.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub const fn everything() -> Self {
        Self {
            requirements: Vec::new(),
        }
    }

    /// Equality selector matching every `k=v` pair of `labels`.
    pub fn from_map<K, V, I>(labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            requirements: labels
                .into_iter()
                .map(|(k, v)| Requirement::Equals(k.into(), v.into()))
                .collect(),
        }
    }

    #[must_use]
    pub fn with(mut self, requirement: Requirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    #[must_use]
    pub fn eq(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.with(Requirement::Equals(key.into(), value.into()))
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.requirements.iter().map(ToString::to_string).collect();
        f.write_str(&parts.join(","))
    }
}

/// Splits on commas that are not inside a parenthesized value list.
fn split_top_level(input: &str) -> Result<Vec<&str>, Error> {
    let mut parts = Vec::new();
    let mut depth = 0_i32;
    let mut start = 0;
    for (idx, ch) in input.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(make_input_err!("unbalanced ')' in selector {input:?}"));
                }
            }
            ',' if depth == 0 => {
                parts.push(&input[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(make_input_err!("unbalanced '(' in selector {input:?}"));
    }
    parts.push(&input[start..]);
    Ok(parts)
}

fn parse_set(key: &str, rest: &str) -> Result<BTreeSet<String>, Error> {
    let rest = rest.trim();
    let inner = rest
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .err_tip_with_code(|_| {
            (
                gargantua_error::Code::InvalidArgument,
                format!("expected a parenthesized value list for {key:?}, got {rest:?}"),
            )
        })?;
    Ok(inner
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
        .collect())
}

fn validate_key(key: &str, clause: &str) -> Result<String, Error> {
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return Err(make_input_err!("invalid label key in {clause:?}"));
    }
    Ok(key.to_string())
}

fn parse_requirement(clause: &str) -> Result<Requirement, Error> {
    let clause = clause.trim();
    if let Some(key) = clause.strip_prefix('!') {
        return Ok(Requirement::DoesNotExist(validate_key(key, clause)?));
    }
    if let Some((key, value)) = clause.split_once("!=") {
        return Ok(Requirement::NotEquals(
            validate_key(key, clause)?,
            value.trim().to_string(),
        ));
    }
    if let Some((key, value)) = clause.split_once("==") {
        return Ok(Requirement::Equals(
            validate_key(key, clause)?,
            value.trim().to_string(),
        ));
    }
    if let Some((key, value)) = clause.split_once('=') {
        return Ok(Requirement::Equals(
            validate_key(key, clause)?,
            value.trim().to_string(),
        ));
    }
    if let Some((key, rest)) = clause.split_once(" notin ") {
        let key = validate_key(key, clause)?;
        let values = parse_set(&key, rest)?;
        return Ok(Requirement::NotIn(key, values));
    }
    if let Some((key, rest)) = clause.split_once(" in ") {
        let key = validate_key(key, clause)?;
        let values = parse_set(&key, rest)?;
        return Ok(Requirement::In(key, values));
    }
    Ok(Requirement::Exists(validate_key(clause, clause)?))
}

impl FromStr for LabelSelector {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if input.trim().is_empty() {
            return Ok(Self::everything());
        }
        let requirements = split_top_level(input)?
            .into_iter()
            .map(parse_requirement)
            .collect::<Result<Vec<_>, _>>()
            .err_tip(|| format!("parsing label selector {input:?}"))?;
        Ok(Self { requirements })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;

    use super::{LabelSelector, Requirement};

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn parses_every_operator() {
        let selector: LabelSelector = "a=1, b==2,c!=3,d in (x, y),e notin (z),f,!g"
            .parse()
            .unwrap();
        assert_eq!(selector.requirements().len(), 7);
        assert_eq!(
            selector.requirements()[3],
            Requirement::In("d".into(), ["x".to_string(), "y".to_string()].into())
        );
        assert_eq!(
            selector.to_string(),
            "a=1,b=2,c!=3,d in (x,y),e notin (z),f,!g"
        );
    }

    #[test]
    fn matches_conjunction() {
        let selector: LabelSelector = "bound=false,template=vmt1,!hobbyfarm.io/provisioner"
            .parse()
            .unwrap();
        assert!(selector.matches(&labels(&[("bound", "false"), ("template", "vmt1")])));
        assert!(!selector.matches(&labels(&[("bound", "true"), ("template", "vmt1")])));
        assert!(!selector.matches(&labels(&[
            ("bound", "false"),
            ("template", "vmt1"),
            ("hobbyfarm.io/provisioner", "external"),
        ])));
    }

    #[test]
    fn not_in_matches_missing_key() {
        let selector: LabelSelector = "env notin (a)".parse().unwrap();
        assert!(selector.matches(&labels(&[])));
        assert!(!selector.matches(&labels(&[("env", "a")])));
    }

    #[test]
    fn empty_selector_matches_everything() {
        let selector: LabelSelector = "".parse().unwrap();
        assert!(selector.is_empty());
        assert!(selector.matches(&labels(&[("any", "thing")])));
    }

    #[test]
    fn rejects_unbalanced_parentheses() {
        let error = "a in (x".parse::<LabelSelector>().unwrap_err();
        assert_eq!(error.code, gargantua_error::Code::InvalidArgument);
    }
}
