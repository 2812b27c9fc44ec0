//! Label selectors, as used to decide which secrets are allowed to trigger a gateway reconciliation.
//!
//! A `LabelSelector` can be deserialized from the usual Kubernetes json shape (`matchLabels` and
//! `matchExpressions`), or parsed from the textual form that's accepted by `kubectl -l`:
//!
//! ```rust
//! use gateway_operator::label_selector::LabelSelector;
//! use std::collections::BTreeMap;
//!
//! let selector = LabelSelector::parse("app=gateway,tier in (edge, internal),!legacy").unwrap();
//!
//! let mut labels = BTreeMap::new();
//! labels.insert("app".to_owned(), "gateway".to_owned());
//! labels.insert("tier".to_owned(), "edge".to_owned());
//! assert!(selector.matches(&labels));
//!
//! labels.insert("legacy".to_owned(), "true".to_owned());
//! assert!(!selector.matches(&labels));
//! ```
//!
//! Evaluating a selector never has side effects, so it's safe to call from any watch event.
use crate::resource::JsonObject;

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Display};

lazy_static! {
    static ref KEY_REGEX: Regex =
        Regex::new(r"^([A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?/)?[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$").unwrap();
    static ref VALUE_REGEX: Regex =
        Regex::new(r"^([A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?)?$").unwrap();
}

/// Anything that labels can be looked up in
pub trait Labels {
    fn get_label(&self, key: &str) -> Option<&str>;
}

impl Labels for BTreeMap<String, String> {
    fn get_label(&self, key: &str) -> Option<&str> {
        self.get(key).map(String::as_str)
    }
}

impl Labels for HashMap<String, String> {
    fn get_label(&self, key: &str) -> Option<&str> {
        self.get(key).map(String::as_str)
    }
}

impl Labels for JsonObject {
    fn get_label(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl LabelSelectorRequirement {
    fn matches<L: Labels + ?Sized>(&self, labels: &L) -> bool {
        let value = labels.get_label(self.key.as_str());
        match self.operator {
            SelectorOperator::In => value
                .map(|v| self.values.iter().any(|allowed| allowed == v))
                .unwrap_or(false),
            SelectorOperator::NotIn => value
                .map(|v| self.values.iter().all(|excluded| excluded != v))
                .unwrap_or(true),
            SelectorOperator::Exists => value.is_some(),
            SelectorOperator::DoesNotExist => value.is_none(),
        }
    }
}

impl Display for LabelSelectorRequirement {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.operator {
            SelectorOperator::In => write!(f, "{} in ({})", self.key, self.values.join(",")),
            SelectorOperator::NotIn => write!(f, "{} notin ({})", self.key, self.values.join(",")),
            SelectorOperator::Exists => f.write_str(self.key.as_str()),
            SelectorOperator::DoesNotExist => write!(f, "!{}", self.key),
        }
    }
}

/// A label selector. All of the `match_labels` and `match_expressions` must match for the selector
/// to match. An empty selector matches everything.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectorParseError {
    pub input: String,
    pub message: &'static str,
}

impl Display for SelectorParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Invalid label selector requirement '{}': {}",
            self.input, self.message
        )
    }
}

impl std::error::Error for SelectorParseError {}

impl LabelSelector {
    pub fn new() -> LabelSelector {
        LabelSelector::default()
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.match_labels.insert(key.into(), value.into());
        self
    }

    pub fn with_expression(mut self, requirement: LabelSelectorRequirement) -> Self {
        self.match_expressions.push(requirement);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }

    pub fn matches<L: Labels + ?Sized>(&self, labels: &L) -> bool {
        let labels_match = self
            .match_labels
            .iter()
            .all(|(key, value)| labels.get_label(key.as_str()) == Some(value.as_str()));
        labels_match
            && self
                .match_expressions
                .iter()
                .all(|requirement| requirement.matches(labels))
    }

    /// Convenience for matching against the `metadata.labels` of a raw resource. A resource
    /// without any labels is treated as having an empty label set.
    pub fn matches_resource(&self, resource: &Value) -> bool {
        match resource
            .pointer("/metadata/labels")
            .and_then(Value::as_object)
        {
            Some(labels) => self.matches(labels),
            None => self.matches(&JsonObject::new()),
        }
    }

    /// Parses the textual selector syntax, e.g. `a=b,c!=d,e in (x,y),!f,g`.
    pub fn parse(input: &str) -> Result<LabelSelector, SelectorParseError> {
        let mut selector = LabelSelector::new();
        for requirement in split_requirements(input) {
            let requirement = requirement.trim();
            if requirement.is_empty() {
                continue;
            }
            parse_requirement(requirement, &mut selector)?;
        }
        Ok(selector)
    }
}

impl Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for (key, value) in self.match_labels.iter() {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{}={}", key, value)?;
        }
        for requirement in self.match_expressions.iter() {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            Display::fmt(requirement, f)?;
        }
        Ok(())
    }
}

/// splits on commas, except for the ones inside of a parenthesized value set
fn split_requirements(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

fn parse_requirement(input: &str, selector: &mut LabelSelector) -> Result<(), SelectorParseError> {
    let err = |message: &'static str| SelectorParseError {
        input: input.to_owned(),
        message,
    };

    if let Some(key) = input.strip_prefix('!') {
        let key = validate_key(key.trim()).ok_or_else(|| err("invalid label key"))?;
        selector.match_expressions.push(LabelSelectorRequirement {
            key,
            operator: SelectorOperator::DoesNotExist,
            values: Vec::new(),
        });
        return Ok(());
    }

    if let Some(open) = input.find('(') {
        let close = input
            .rfind(')')
            .filter(|close| *close > open)
            .ok_or_else(|| err("missing closing parenthesis"))?;
        if !input[close + 1..].trim().is_empty() {
            return Err(err("unexpected characters after value set"));
        }
        let mut words = input[..open].split_whitespace();
        let key = words.next().ok_or_else(|| err("missing label key"))?;
        let operator = match words.next() {
            Some("in") => SelectorOperator::In,
            Some("notin") => SelectorOperator::NotIn,
            _ => return Err(err("expected 'in' or 'notin'")),
        };
        if words.next().is_some() {
            return Err(err("unexpected characters before value set"));
        }
        let key = validate_key(key).ok_or_else(|| err("invalid label key"))?;
        let values = input[open + 1..close]
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| validate_value(v).ok_or_else(|| err("invalid label value")))
            .collect::<Result<Vec<_>, _>>()?;
        selector.match_expressions.push(LabelSelectorRequirement {
            key,
            operator,
            values,
        });
        return Ok(());
    }

    if let Some(idx) = input.find("!=") {
        let key = validate_key(input[..idx].trim()).ok_or_else(|| err("invalid label key"))?;
        let value =
            validate_value(input[idx + 2..].trim()).ok_or_else(|| err("invalid label value"))?;
        selector.match_expressions.push(LabelSelectorRequirement {
            key,
            operator: SelectorOperator::NotIn,
            values: vec![value],
        });
        return Ok(());
    }

    if let Some(idx) = input.find('=') {
        let value_start = if input[idx + 1..].starts_with('=') {
            idx + 2
        } else {
            idx + 1
        };
        let key = validate_key(input[..idx].trim()).ok_or_else(|| err("invalid label key"))?;
        let value = validate_value(input[value_start..].trim())
            .ok_or_else(|| err("invalid label value"))?;
        selector.match_labels.insert(key, value);
        return Ok(());
    }

    let key = validate_key(input).ok_or_else(|| err("invalid label key"))?;
    selector.match_expressions.push(LabelSelectorRequirement {
        key,
        operator: SelectorOperator::Exists,
        values: Vec::new(),
    });
    Ok(())
}

fn validate_key(key: &str) -> Option<String> {
    if KEY_REGEX.is_match(key) {
        Some(key.to_owned())
    } else {
        None
    }
}

fn validate_value(value: &str) -> Option<String> {
    if VALUE_REGEX.is_match(value) {
        Some(value.to_owned())
    } else {
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_selector_matches_everything() {
        let selector = LabelSelector::new();
        assert!(selector.is_empty());
        assert!(selector.matches(&labels(&[])));
        assert!(selector.matches(&labels(&[("a", "b")])));
    }

    #[test]
    fn match_labels_require_equal_values() {
        let selector = LabelSelector::new().with_label("gateway.apps/watched-by", "gateway");
        assert!(selector.matches(&labels(&[("gateway.apps/watched-by", "gateway")])));
        assert!(!selector.matches(&labels(&[("gateway.apps/watched-by", "other")])));
        assert!(!selector.matches(&labels(&[])));
    }

    #[test]
    fn parses_all_requirement_kinds() {
        let selector =
            LabelSelector::parse("app=gateway, env==prod,tier!=db,zone in (a, b),region notin (c),owned,!legacy")
                .expect("failed to parse");
        assert_eq!(Some(&"gateway".to_owned()), selector.match_labels.get("app"));
        assert_eq!(Some(&"prod".to_owned()), selector.match_labels.get("env"));
        assert_eq!(5, selector.match_expressions.len());
        assert_eq!(
            LabelSelectorRequirement {
                key: "zone".to_owned(),
                operator: SelectorOperator::In,
                values: vec!["a".to_owned(), "b".to_owned()],
            },
            selector.match_expressions[1]
        );

        let matching = labels(&[
            ("app", "gateway"),
            ("env", "prod"),
            ("tier", "web"),
            ("zone", "b"),
            ("region", "d"),
            ("owned", ""),
        ]);
        assert!(selector.matches(&matching));

        let mut with_legacy = matching.clone();
        with_legacy.insert("legacy".to_owned(), "true".to_owned());
        assert!(!selector.matches(&with_legacy));

        let mut wrong_zone = matching.clone();
        wrong_zone.insert("zone".to_owned(), "c".to_owned());
        assert!(!selector.matches(&wrong_zone));

        let mut missing_owned = matching;
        missing_owned.remove("owned");
        assert!(!selector.matches(&missing_owned));
    }

    #[test]
    fn not_in_matches_when_label_is_absent() {
        let selector = LabelSelector::parse("tier!=db").unwrap();
        assert!(selector.matches(&labels(&[])));
        assert!(!selector.matches(&labels(&[("tier", "db")])));
    }

    #[test]
    fn rejects_invalid_requirements() {
        assert!(LabelSelector::parse("zone in (a,b").is_err());
        assert!(LabelSelector::parse("zone within (a)").is_err());
        assert!(LabelSelector::parse("-bad=key").is_err());
        assert!(LabelSelector::parse("key=bad value").is_err());
    }

    #[test]
    fn display_round_trips_through_parse() {
        let selector = LabelSelector::parse("app=gateway,zone in (a,b),!legacy").unwrap();
        let reparsed = LabelSelector::parse(&selector.to_string()).unwrap();
        assert_eq!(selector, reparsed);
    }

    #[test]
    fn matches_resource_labels_and_deserializes_k8s_shape() {
        let selector: LabelSelector = serde_json::from_value(json!({
            "matchLabels": {"app": "gateway"},
            "matchExpressions": [
                {"key": "tier", "operator": "In", "values": ["edge"]}
            ]
        }))
        .unwrap();
        let secret = json!({
            "metadata": {
                "name": "config",
                "labels": {"app": "gateway", "tier": "edge"}
            }
        });
        let unlabeled = json!({"metadata": {"name": "config"}});
        assert!(selector.matches_resource(&secret));
        assert!(!selector.matches_resource(&unlabeled));
    }
}
