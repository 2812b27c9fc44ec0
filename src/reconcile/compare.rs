//! Decides whether a live child object needs to be replaced. The api server fills in lots of
//! defaulted fields, so a live object is considered converged as long as it's a _superset_ of
//! the desired one: every value in the desired json must be present and equal in the live json,
//! but the live json may have extra fields.
//!
//! Arrays of objects that all have a string `name` field (containers, ports, env vars, volumes)
//! are compared as associative arrays, matching items by name rather than by position, since
//! the order of those lists is not meaningful.
use serde_json::Value;

use std::fmt::{self, Display, Write};

use crate::resource::JsonObject;

/// One value that differs between the live and desired objects
#[derive(Debug, PartialEq)]
pub struct Diff<'a> {
    pub path: String,
    pub live: &'a Value,
    pub desired: &'a Value,
}

impl<'a> Display for Diff<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: live={} desired={}", self.path, self.live, self.desired)
    }
}

#[derive(Debug, Default)]
pub struct Diffs<'a>(Vec<Diff<'a>>);

impl<'a> Diffs<'a> {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diff<'a>> {
        self.0.iter()
    }
}

impl<'a> Display for Diffs<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<no differences>");
        }
        write!(f, "{} difference(s): ", self.0.len())?;
        for (i, diff) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            Display::fmt(diff, f)?;
        }
        Ok(())
    }
}

static NULL: Value = Value::Null;

enum PathSegment<'a> {
    Key(&'a str),
    Index(usize),
}

struct Comparison<'a> {
    path: Vec<PathSegment<'a>>,
    diffs: Vec<Diff<'a>>,
}

/// Returns every value in `desired` that is missing from, or different in, `live`
pub fn compare_values<'a>(live: &'a Value, desired: &'a Value) -> Diffs<'a> {
    let mut comparison = Comparison {
        path: Vec::with_capacity(8),
        diffs: Vec::new(),
    };
    comparison.value(live, desired);
    Diffs(comparison.diffs)
}

/// Shorthand for `compare_values(live, desired).is_empty()`
pub fn is_superset(live: &Value, desired: &Value) -> bool {
    compare_values(live, desired).is_empty()
}

impl<'a> Comparison<'a> {
    fn value(&mut self, live: &'a Value, desired: &'a Value) {
        match (live, desired) {
            (Value::Object(live_obj), Value::Object(desired_obj)) => {
                self.object(live_obj, desired_obj)
            }
            (Value::Array(live_arr), Value::Array(desired_arr)) => {
                if is_named_list(desired_arr) {
                    self.named_list(live_arr, desired_arr)
                } else {
                    self.list(live_arr, desired_arr)
                }
            }
            (l, d) if l != d => self.record(l, d),
            _ => {}
        }
    }

    fn object(&mut self, live: &'a JsonObject, desired: &'a JsonObject) {
        for (key, desired_value) in desired {
            self.path.push(PathSegment::Key(key.as_str()));
            match live.get(key) {
                Some(live_value) => self.value(live_value, desired_value),
                None => self.record(&NULL, desired_value),
            }
            self.path.pop();
        }
    }

    fn list(&mut self, live: &'a [Value], desired: &'a [Value]) {
        for (i, desired_item) in desired.iter().enumerate() {
            self.path.push(PathSegment::Index(i));
            match live.get(i) {
                Some(live_item) => self.value(live_item, desired_item),
                None => self.record(&NULL, desired_item),
            }
            self.path.pop();
        }
    }

    fn named_list(&mut self, live: &'a [Value], desired: &'a [Value]) {
        for (i, desired_item) in desired.iter().enumerate() {
            self.path.push(PathSegment::Index(i));
            let matching = item_name(desired_item)
                .and_then(|name| live.iter().find(|l| item_name(l) == Some(name)));
            match matching {
                Some(live_item) => self.value(live_item, desired_item),
                None => self.record(&NULL, desired_item),
            }
            self.path.pop();
        }
    }

    fn record(&mut self, live: &'a Value, desired: &'a Value) {
        let mut path = String::with_capacity(32);
        for segment in self.path.iter() {
            match segment {
                PathSegment::Key(key) => {
                    path.push('.');
                    path.push_str(key);
                }
                PathSegment::Index(i) => {
                    let _ = write!(path, "[{}]", i);
                }
            }
        }
        self.diffs.push(Diff {
            path,
            live,
            desired,
        });
    }
}

fn item_name(item: &Value) -> Option<&str> {
    item.get("name").and_then(Value::as_str)
}

fn is_named_list(desired: &[Value]) -> bool {
    !desired.is_empty() && desired.iter().all(|item| item_name(item).is_some())
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn paths(diffs: &Diffs) -> Vec<String> {
        diffs.iter().map(|d| d.path.clone()).collect()
    }

    #[test]
    fn extra_live_fields_are_not_differences() {
        let live = json!({
            "metadata": {"name": "gateway-foo", "resourceVersion": "4", "uid": "x"},
            "spec": {"replicas": 1, "progressDeadlineSeconds": 600},
        });
        let desired = json!({
            "metadata": {"name": "gateway-foo"},
            "spec": {"replicas": 1},
        });
        assert!(is_superset(&live, &desired));
    }

    #[test]
    fn changed_and_missing_values_are_reported() {
        let live = json!({
            "spec": {"replicas": 1, "selector": {"app": "gateway"}},
        });
        let desired = json!({
            "spec": {"replicas": 2, "selector": {"app": "gateway"}, "paused": false},
        });
        let diffs = compare_values(&live, &desired);
        assert_eq!(vec![".spec.paused", ".spec.replicas"], {
            let mut p = paths(&diffs);
            p.sort();
            p
        });
        let replicas = diffs
            .iter()
            .find(|d| d.path == ".spec.replicas")
            .unwrap();
        assert_eq!(&json!(1), replicas.live);
        assert_eq!(&json!(2), replicas.desired);
    }

    #[test]
    fn named_lists_are_matched_by_name() {
        let live = json!({
            "containers": [
                {"name": "sidecar", "image": "proxy:1"},
                {"name": "gateway", "image": "gateway:1", "imagePullPolicy": "IfNotPresent"},
            ]
        });
        let same = json!({"containers": [{"name": "gateway", "image": "gateway:1"}]});
        assert!(is_superset(&live, &same));

        let changed = json!({"containers": [{"name": "gateway", "image": "gateway:2"}]});
        assert_eq!(vec![".containers[0].image"], paths(&compare_values(&live, &changed)));

        let added = json!({"containers": [{"name": "other", "image": "x"}]});
        assert_eq!(vec![".containers[0]"], paths(&compare_values(&live, &added)));
    }

    #[test]
    fn plain_lists_are_compared_in_order() {
        let live = json!({"args": ["--a", "--b"]});
        assert!(is_superset(&live, &json!({"args": ["--a", "--b"]})));
        let desired = json!({"args": ["--b", "--a", "--c"]});
        let diffs = compare_values(&live, &desired);
        assert_eq!(
            vec![".args[0]", ".args[1]", ".args[2]"],
            paths(&diffs)
        );
        assert!(diffs.to_string().starts_with("3 difference(s)"));
    }
}
