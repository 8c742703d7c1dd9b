//! Role rules and the materialized access sets derived from them.
//!
//! A rule grants verbs over the cartesian product of its API groups and resources. An
//! [`AccessSet`] flattens every rule bound to a subject into a set of string keys of the form
//! `/{namespace}/{apiGroup}/{resource}/{verb}` so that a permission check is a handful of hash
//! lookups rather than a scan over every binding and rule.

use crate::authz::ResourceAttributes;
use ahash::AHashSet as HashSet;

/// Matches any value.
pub const WILDCARD: &str = "*";

/// A single role rule. Every list is matched with [`matches`], so `*` matches all values.
///
/// `resources` holds entries as written in the role: `machines`, `machines/status`, `*` or
/// `*/status`. A subresource entry grants only that subresource of that resource.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rule {
    pub api_groups: Vec<String>,
    pub resources: Vec<String>,
    pub resource_names: Vec<String>,
    pub verbs: Vec<String>,
    pub paths: Vec<String>,
}

/// The permissions granted to a single subject.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessSet {
    subject: String,
    access: HashSet<String>,
}

/// Returns true if `value` is allowed by any of the `allowed` patterns.
///
/// A pattern matches when it is equal to the value, when it is exactly `*`, or when it ends with
/// `*` and the value starts with the pattern's prefix.
pub fn matches(value: &str, allowed: &[String]) -> bool {
    allowed.iter().any(|pattern| {
        if pattern == value || pattern == WILDCARD {
            return true;
        }
        match pattern.strip_suffix('*') {
            Some(prefix) => value.starts_with(prefix),
            None => false,
        }
    })
}

/// Formats an access-set key.
pub fn access_key(namespace: &str, api_group: &str, resource: &str, verb: &str) -> String {
    format!("/{namespace}/{api_group}/{resource}/{verb}")
}

// === impl Rule ===

impl Rule {
    /// Returns true if this rule permits the given resource request, ignoring namespace (which is
    /// determined by the binding that grants the rule).
    pub fn matches_resource(&self, attrs: &ResourceAttributes, verb: &str) -> bool {
        let subresource = attrs.subresource.as_deref().filter(|s| !s.is_empty());
        if !self
            .resources
            .iter()
            .any(|entry| resource_matches(entry, &attrs.resource, subresource))
        {
            return false;
        }

        if !self.resource_names.is_empty() {
            match attrs.name.as_deref() {
                Some(name) if matches(name, &self.resource_names) => {}
                _ => return false,
            }
        }

        matches(verb, &self.verbs) && matches(&attrs.api_group, &self.api_groups)
    }

    /// Returns true if this rule permits the given non-resource path.
    pub fn matches_path(&self, path: &str) -> bool {
        matches(path, &self.paths)
    }

    /// Enumerates the access keys granted by this rule in the given namespace. Subresource
    /// entries grant nothing on the resource itself and are skipped.
    pub fn access_keys<'r>(&'r self, namespace: &'r str) -> impl Iterator<Item = String> + 'r {
        self.api_groups.iter().flat_map(move |group| {
            self.resources
                .iter()
                .filter(|resource| !resource.contains('/'))
                .flat_map(move |resource| {
                    self.verbs
                        .iter()
                        .map(move |verb| access_key(namespace, group, resource, verb))
                })
        })
    }
}

// === impl AccessSet ===

impl AccessSet {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            access: HashSet::default(),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Adds every key granted by `rule` within `namespace`. An empty namespace denotes a
    /// cluster-wide grant.
    pub fn add_rule(&mut self, namespace: &str, rule: &Rule) {
        let namespace = if namespace.is_empty() {
            WILDCARD
        } else {
            namespace
        };
        self.access.extend(rule.access_keys(namespace));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.access.contains(key)
    }

    pub fn len(&self) -> usize {
        self.access.len()
    }

    pub fn is_empty(&self) -> bool {
        self.access.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.access.iter().map(String::as_str)
    }

    /// Returns true if the literal permission, or any variant of it with `*` substituted for the
    /// API group, resource, or verb, is present. Cluster-wide grants are stored under the `*`
    /// namespace, so each variant is probed for both the requested and the wildcard namespace.
    pub fn grants(&self, namespace: &str, api_group: &str, resource: &str, verb: &str) -> bool {
        let namespaces = variants(namespace);
        let groups = variants(api_group);
        let resources = variants(resource);
        let verbs = variants(verb);
        for ns in namespaces.iter().flatten() {
            for group in groups.iter().flatten() {
                for res in resources.iter().flatten() {
                    for v in verbs.iter().flatten() {
                        if self.access.contains(&access_key(ns, group, res, v)) {
                            return true;
                        }
                    }
                }
            }
        }
        false
    }
}

/// Matches one rule resource entry against a requested resource and optional subresource.
fn resource_matches(entry: &str, resource: &str, subresource: Option<&str>) -> bool {
    if entry == WILDCARD {
        return true;
    }
    match subresource {
        None => entry == resource,
        Some(sub) => match entry.split_once('/') {
            Some((res, s)) => (res == resource || res == WILDCARD) && s == sub,
            None => false,
        },
    }
}

/// The literal value and its wildcard, without probing `*` twice.
fn variants(value: &str) -> [Option<&str>; 2] {
    if value == WILDCARD {
        [Some(WILDCARD), None]
    } else {
        [Some(value), Some(WILDCARD)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn rule(groups: &[&str], resources: &[&str], verbs: &[&str]) -> Rule {
        Rule {
            api_groups: strings(groups),
            resources: strings(resources),
            verbs: strings(verbs),
            ..Default::default()
        }
    }

    #[test]
    fn test_matches() {
        for (value, allowed, expected, msg) in [
            ("list", vec!["list"], true, "literal"),
            ("list", vec!["*"], true, "wildcard"),
            ("/api/v1/users", vec!["/api/*"], true, "prefix wildcard"),
            ("/apis", vec!["/api/*"], false, "prefix mismatch"),
            ("create", vec!["get", "list"], false, "no match"),
            ("create", vec![], false, "empty"),
        ] {
            assert_eq!(matches(value, &strings(&allowed)), expected, "{msg}");
        }
    }

    #[test]
    fn expands_cartesian_product() {
        let r = rule(&["hobbyfarm.io", ""], &["scenarios"], &["get", "list"]);
        let mut keys = r.access_keys("hf").collect::<Vec<_>>();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "/hf//scenarios/get",
                "/hf//scenarios/list",
                "/hf/hobbyfarm.io/scenarios/get",
                "/hf/hobbyfarm.io/scenarios/list",
            ]
        );
    }

    #[test]
    fn grants_literal_and_wildcards() {
        let mut set = AccessSet::new("alice@example.com");
        set.add_rule("hf", &rule(&["hobbyfarm.io"], &["scenarios"], &["list"]));
        assert!(set.grants("hf", "hobbyfarm.io", "scenarios", "list"));
        assert!(!set.grants("hf", "hobbyfarm.io", "scenarios", "create"));
        assert!(!set.grants("other", "hobbyfarm.io", "scenarios", "list"));

        let mut set = AccessSet::new("bob");
        set.add_rule("hf", &rule(&["hobbyfarm.io"], &["*"], &["get"]));
        assert!(set.grants("hf", "hobbyfarm.io", "courses", "get"));
        assert!(!set.grants("hf", "hobbyfarm.io", "courses", "delete"));
    }

    #[test]
    fn cluster_grants_apply_to_all_namespaces() {
        let mut set = AccessSet::new("admins");
        set.add_rule("", &rule(&["*"], &["*"], &["*"]));
        assert!(set.contains("/*/*/*/*"));
        assert!(set.grants("any", "hobbyfarm.io", "machines", "delete"));
        assert!(set.grants("*", "*", "*", "*"));
    }

    #[test]
    fn subresources_require_explicit_grant() {
        let attrs = ResourceAttributes {
            namespace: "hf".into(),
            api_group: "hobbyfarm.io".into(),
            resource: "machines".into(),
            subresource: Some("status".into()),
            name: Some("m-1".into()),
        };

        let plain = rule(&["hobbyfarm.io"], &["machines"], &["update"]);
        assert!(!plain.matches_resource(&attrs, "update"));

        let wildcard = rule(&["hobbyfarm.io"], &["*"], &["update"]);
        assert!(wildcard.matches_resource(&attrs, "update"));

        let status = rule(&["hobbyfarm.io"], &["machines/status"], &["update"]);
        assert!(status.matches_resource(&attrs, "update"));

        let any_status = rule(&["hobbyfarm.io"], &["*/status"], &["update"]);
        assert!(any_status.matches_resource(&attrs, "update"));

        let named = Rule {
            resource_names: strings(&["m-2"]),
            ..status
        };
        assert!(!named.matches_resource(&attrs, "update"));
    }

    #[test]
    fn subresource_entries_are_scoped_to_their_resource() {
        let machine = ResourceAttributes {
            namespace: "hf".into(),
            api_group: "hobbyfarm.io".into(),
            resource: "machines".into(),
            subresource: None,
            name: Some("m-1".into()),
        };
        let machine_status = ResourceAttributes {
            subresource: Some("status".into()),
            ..machine.clone()
        };

        let status = rule(&["hobbyfarm.io"], &["machines/status"], &["update"]);
        assert!(!status.matches_resource(&machine, "update"));
        assert!(status.matches_resource(&machine_status, "update"));

        let mixed = rule(&["hobbyfarm.io"], &["sessions/status", "machines"], &["update"]);
        assert!(mixed.matches_resource(&machine, "update"));
        assert!(!mixed.matches_resource(&machine_status, "update"));

        assert_eq!(status.access_keys("hf").count(), 0);
        assert_eq!(
            mixed.access_keys("hf").collect::<Vec<_>>(),
            vec!["/hf/hobbyfarm.io/machines/update"]
        );
    }
}
