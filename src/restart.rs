//! Settings diffing: which proposed changes need a restart, and which need
//! the Kubernetes state wiped first.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use k3s_dist::K3sVersion;
use serde::Serialize;
use serde_json::Value;

/// Remediation a changed setting requires.  `Reset` is worse than `Restart`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Restart,
    Reset,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestartReason {
    pub current: Value,
    pub desired: Value,
    pub severity: Severity,
}

/// Dotted setting path (`kubernetes.version`) to the reason it needs action.
pub type RestartReasons = BTreeMap<String, RestartReason>;

/// Decides the severity of a change from `current` to `desired`.  `None`
/// means the change takes effect without a restart.
pub type Checker = fn(current: &Value, desired: &Value) -> Option<Severity>;

/// Per-path checkers; paths without one default to [`Severity::Restart`].
#[derive(Debug, Clone, Default)]
pub struct FieldOverrides {
    checkers: BTreeMap<String, Checker>,
}

impl FieldOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, path: impl Into<String>, checker: Checker) -> Self {
        self.checkers.insert(path.into(), checker);
        self
    }

    /// Extend with another set; entries in `other` win.
    pub fn merge(mut self, other: FieldOverrides) -> Self {
        self.checkers.extend(other.checkers);
        self
    }

    fn check(&self, path: &str, current: &Value, desired: &Value) -> Option<Severity> {
        match self.checkers.get(path) {
            Some(checker) => checker(current, desired),
            None => Some(Severity::Restart),
        }
    }
}

/// A checker for settings that never need a restart.
pub fn cosmetic(_: &Value, _: &Value) -> Option<Severity> {
    None
}

/// Kubernetes version change: going backwards destroys cluster state.
pub fn version_checker(current: &Value, desired: &Value) -> Option<Severity> {
    let parse = |v: &Value| -> Option<K3sVersion> {
        match v.as_str() {
            Some("") | None => K3sVersion::parse("0.0.0").ok(),
            Some(s) => K3sVersion::parse(s).ok(),
        }
    };
    match (parse(current), parse(desired)) {
        (Some(cur), Some(want)) => match cur.precedence(&want) {
            Ordering::Greater => Some(Severity::Reset),
            // Spelled differently (`v` prefix, build suffix) but the same release.
            Ordering::Equal => None,
            Ordering::Less => Some(Severity::Restart),
        },
        _ => Some(Severity::Restart),
    }
}

/// Checkers every backend uses.
pub fn default_overrides() -> FieldOverrides {
    FieldOverrides::new()
        .with("kubernetes.version", version_checker)
        .with("application.debug", cosmetic)
}

/// Compare the leaves of `desired` (a possibly partial settings tree) with
/// `current`.  `extra` replaces the current value at a path with one taken
/// from the live machine (e.g. its actual memory size); an extra whose path
/// is absent from `desired` is ignored.  Arrays compare as leaves.
pub fn requires_restart_reasons(
    current: &Value,
    desired: &Value,
    overrides: &FieldOverrides,
    extra: &BTreeMap<String, Value>,
) -> RestartReasons {
    let mut reasons = RestartReasons::new();
    let mut leaves = Vec::new();
    collect_leaves(desired, String::new(), &mut leaves);

    for (path, want) in leaves {
        let have = extra
            .get(&path)
            .cloned()
            .unwrap_or_else(|| lookup(current, &path).cloned().unwrap_or(Value::Null));
        if same_value(&have, want) {
            continue;
        }
        if let Some(severity) = overrides.check(&path, &have, want) {
            reasons.insert(
                path,
                RestartReason {
                    current: have,
                    desired: want.clone(),
                    severity,
                },
            );
        }
    }
    reasons
}

/// The worst severity present, if any.
pub fn overall_severity(reasons: &RestartReasons) -> Option<Severity> {
    reasons.values().map(|r| r.severity).max()
}

fn collect_leaves<'a>(value: &'a Value, prefix: String, out: &mut Vec<(String, &'a Value)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                collect_leaves(child, path, out);
            }
        }
        // A partial tree leaves unchanged fields out entirely.
        Value::Null => {}
        leaf => out.push((prefix, leaf)),
    }
}

fn lookup<'a>(tree: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(tree, |node, key| node.get(key))
}

/// Numbers compare by value so `4` equals `4.0`.
fn same_value(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}
