use crate::metrics::SizedIndex;
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use gargantua_core::{authz::Attributes, AccessSet, Rule};
use gargantua_k8s_api::{
    labels, ClusterRole, ClusterRoleBinding, Group, PolicyRule, ResourceExt, ResourceId, Role,
    RoleBinding, RoleRef, Subject,
};
use kubert::index::{ClusterRemoved, IndexClusterResource, IndexNamespacedResource, NamespacedRemoved};
use parking_lot::RwLock;
use std::{hash::Hash, sync::Arc};
use tokio::sync::watch;

pub type SharedIndex = Arc<RwLock<Index>>;

/// The kind of subject a binding names.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SubjectKind {
    User,
    Group,
}

/// Holds all RBAC indexing state. Owned and updated by the watch tasks; read by the authorizer
/// and the access-code controllers.
#[derive(Debug)]
pub struct Index {
    roles: HashMap<ResourceId, Arc<[Rule]>>,
    cluster_roles: HashMap<String, Arc<[Rule]>>,
    role_bindings: HashMap<ResourceId, RoleBinding>,
    cluster_role_bindings: HashMap<String, ClusterRoleBinding>,

    rb_by_subject: HashMap<SubjectKey, HashSet<ResourceId>>,
    crb_by_subject: HashMap<SubjectKey, HashSet<String>>,
    rb_by_code: HashMap<String, HashSet<ResourceId>>,
    rb_by_user: HashMap<String, HashSet<ResourceId>>,

    group_members: HashMap<ResourceId, Vec<String>>,
    groups_by_member: HashMap<String, HashSet<ResourceId>>,

    synced: Synced,
}

type SubjectKey = (SubjectKind, String);

/// Tracks which watched kinds have completed their initial list.
#[derive(Debug)]
struct Synced {
    pending: HashSet<&'static str>,
    tx: watch::Sender<bool>,
}

const WATCHED_KINDS: [&str; 5] = [
    "Role",
    "ClusterRole",
    "RoleBinding",
    "ClusterRoleBinding",
    "Group",
];

// === impl Index ===

impl Index {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            roles: HashMap::default(),
            cluster_roles: HashMap::default(),
            role_bindings: HashMap::default(),
            cluster_role_bindings: HashMap::default(),
            rb_by_subject: HashMap::default(),
            crb_by_subject: HashMap::default(),
            rb_by_code: HashMap::default(),
            rb_by_user: HashMap::default(),
            group_members: HashMap::default(),
            groups_by_member: HashMap::default(),
            synced: Synced {
                pending: WATCHED_KINDS.into_iter().collect(),
                tx,
            },
        }
    }

    pub fn shared() -> SharedIndex {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Becomes true once every watched kind has been listed.
    pub fn synced(&self) -> watch::Receiver<bool> {
        self.synced.tx.subscribe()
    }

    /// Resolves a binding's role reference. Bindings to missing roles grant nothing.
    pub fn resolve(&self, role_ref: &RoleRef, namespace: &str) -> Option<Arc<[Rule]>> {
        match role_ref.kind.as_str() {
            "ClusterRole" => self.cluster_roles.get(&role_ref.name).cloned(),
            "Role" => self
                .roles
                .get(&ResourceId::new(namespace, &role_ref.name))
                .cloned(),
            _ => None,
        }
    }

    /// Role bindings naming the subject, ordered by namespace and name.
    pub fn role_bindings_for(&self, kind: SubjectKind, subject: &str) -> Vec<RoleBinding> {
        sorted(self.rb_by_subject.get(&(kind, subject.to_string())))
            .into_iter()
            .filter_map(|id| self.role_bindings.get(&id).cloned())
            .collect()
    }

    /// Cluster role bindings naming the subject, ordered by name.
    pub fn cluster_role_bindings_for(
        &self,
        kind: SubjectKind,
        subject: &str,
    ) -> Vec<ClusterRoleBinding> {
        sorted(self.crb_by_subject.get(&(kind, subject.to_string())))
            .into_iter()
            .filter_map(|name| self.cluster_role_bindings.get(&name).cloned())
            .collect()
    }

    /// Role bindings synthesized for an access code.
    pub fn bindings_for_code(&self, code: &str) -> Vec<RoleBinding> {
        sorted(self.rb_by_code.get(code))
            .into_iter()
            .filter_map(|id| self.role_bindings.get(&id).cloned())
            .collect()
    }

    /// Role bindings that list the user as a subject.
    pub fn bindings_for_user(&self, user: &str) -> Vec<RoleBinding> {
        sorted(self.rb_by_user.get(user))
            .into_iter()
            .filter_map(|id| self.role_bindings.get(&id).cloned())
            .collect()
    }

    /// The names of the HobbyFarm groups listing `member` as a user or provider member.
    pub fn groups_for(&self, member: &str) -> Vec<String> {
        let mut names = sorted(self.groups_by_member.get(member))
            .into_iter()
            .map(|id| id.name)
            .collect::<Vec<_>>();
        names.dedup();
        names
    }

    /// Materializes every access key granted to a subject.
    pub fn access_set(&self, subject: &str, kind: SubjectKind) -> AccessSet {
        let mut access = AccessSet::new(subject);
        let key = (kind, subject.to_string());

        for id in self.rb_by_subject.get(&key).into_iter().flatten() {
            let Some(rb) = self.role_bindings.get(id) else {
                continue;
            };
            if let Some(rules) = self.resolve(&rb.role_ref, &id.namespace) {
                for rule in rules.iter() {
                    access.add_rule(&id.namespace, rule);
                }
            }
        }

        for name in self.crb_by_subject.get(&key).into_iter().flatten() {
            let Some(crb) = self.cluster_role_bindings.get(name) else {
                continue;
            };
            if let Some(rules) = self.resolve(&crb.role_ref, "") {
                for rule in rules.iter() {
                    access.add_rule("", rule);
                }
            }
        }

        access
    }

    /// Finds the first binding whose role has a rule permitting the request for any of the
    /// subjects, returning a description of the grant.
    pub(crate) fn find_grant(&self, subjects: &[SubjectKey], attrs: &Attributes) -> Option<String> {
        for key in subjects {
            for id in sorted(self.rb_by_subject.get(key)) {
                let Some(rb) = self.role_bindings.get(&id) else {
                    continue;
                };
                let Some(rules) = self.resolve(&rb.role_ref, &id.namespace) else {
                    continue;
                };
                if rules.iter().any(|r| rule_permits(r, Some(id.namespace.as_str()), attrs)) {
                    return Some(format!(
                        "RoleBinding {id} grants {} {}",
                        rb.role_ref.kind, rb.role_ref.name
                    ));
                }
            }

            for name in sorted(self.crb_by_subject.get(key)) {
                let Some(crb) = self.cluster_role_bindings.get(&name) else {
                    continue;
                };
                let Some(rules) = self.resolve(&crb.role_ref, "") else {
                    continue;
                };
                if rules.iter().any(|r| rule_permits(r, None, attrs)) {
                    return Some(format!(
                        "ClusterRoleBinding {name} grants ClusterRole {}",
                        crb.role_ref.name
                    ));
                }
            }
        }
        None
    }

    fn apply_role_binding(&mut self, rb: RoleBinding) {
        let Some(id) = ResourceId::of(&rb) else {
            return;
        };
        self.delete_role_binding(&id);

        for key in subject_keys(rb.subjects.as_deref()) {
            self.rb_by_subject.entry(key).or_default().insert(id.clone());
        }
        for user in users(rb.subjects.as_deref()) {
            self.rb_by_user.entry(user).or_default().insert(id.clone());
        }
        if let Some(code) = labels::get(&rb.metadata, labels::CODE_ROLEBINDING) {
            self.rb_by_code
                .entry(code.to_string())
                .or_default()
                .insert(id.clone());
        }
        self.role_bindings.insert(id, rb);
    }

    fn delete_role_binding(&mut self, id: &ResourceId) {
        let Some(rb) = self.role_bindings.remove(id) else {
            return;
        };
        for key in subject_keys(rb.subjects.as_deref()) {
            remove_from(&mut self.rb_by_subject, &key, id);
        }
        for user in users(rb.subjects.as_deref()) {
            remove_from(&mut self.rb_by_user, &user, id);
        }
        if let Some(code) = labels::get(&rb.metadata, labels::CODE_ROLEBINDING) {
            remove_from(&mut self.rb_by_code, &code.to_string(), id);
        }
    }

    fn apply_cluster_role_binding(&mut self, crb: ClusterRoleBinding) {
        let name = crb.name_unchecked();
        self.delete_cluster_role_binding(&name);
        for key in subject_keys(crb.subjects.as_deref()) {
            self.crb_by_subject
                .entry(key)
                .or_default()
                .insert(name.clone());
        }
        self.cluster_role_bindings.insert(name, crb);
    }

    fn delete_cluster_role_binding(&mut self, name: &str) {
        let Some(crb) = self.cluster_role_bindings.remove(name) else {
            return;
        };
        for key in subject_keys(crb.subjects.as_deref()) {
            remove_from(&mut self.crb_by_subject, &key, &name.to_string());
        }
    }

    fn apply_group(&mut self, group: Group) {
        let Some(id) = ResourceId::of(&group) else {
            return;
        };
        self.delete_group(&id);

        let mut members = group.spec.user_members;
        members.extend(group.spec.provider_members.into_values().flatten());
        members.sort();
        members.dedup();
        for member in &members {
            self.groups_by_member
                .entry(member.clone())
                .or_default()
                .insert(id.clone());
        }
        self.group_members.insert(id, members);
    }

    fn delete_group(&mut self, id: &ResourceId) {
        for member in self.group_members.remove(id).into_iter().flatten() {
            remove_from(&mut self.groups_by_member, &member, id);
        }
    }
}

impl Default for Index {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexNamespacedResource<Role> for Index {
    fn apply(&mut self, role: Role) {
        if let Some(id) = ResourceId::of(&role) {
            self.roles.insert(id, convert_rules(role.rules.as_deref()));
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.roles.remove(&ResourceId::new(namespace, name));
    }

    fn reset(&mut self, roles: Vec<Role>, removed: NamespacedRemoved) {
        for (namespace, names) in removed {
            for name in names {
                self.roles.remove(&ResourceId::new(namespace.clone(), name));
            }
        }
        for role in roles {
            <Self as IndexNamespacedResource<Role>>::apply(self, role);
        }
        self.synced.mark("Role");
    }
}

impl IndexClusterResource<ClusterRole> for Index {
    fn apply(&mut self, role: ClusterRole) {
        let name = role.name_unchecked();
        self.cluster_roles
            .insert(name, convert_rules(role.rules.as_deref()));
    }

    fn delete(&mut self, name: String) {
        self.cluster_roles.remove(&name);
    }

    fn reset(&mut self, roles: Vec<ClusterRole>, removed: ClusterRemoved) {
        for name in removed {
            self.cluster_roles.remove(&name);
        }
        for role in roles {
            <Self as IndexClusterResource<ClusterRole>>::apply(self, role);
        }
        self.synced.mark("ClusterRole");
    }
}

impl IndexNamespacedResource<RoleBinding> for Index {
    fn apply(&mut self, rb: RoleBinding) {
        self.apply_role_binding(rb);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_role_binding(&ResourceId::new(namespace, name));
    }

    fn reset(&mut self, bindings: Vec<RoleBinding>, removed: NamespacedRemoved) {
        for (namespace, names) in removed {
            for name in names {
                self.delete_role_binding(&ResourceId::new(namespace.clone(), name));
            }
        }
        for rb in bindings {
            self.apply_role_binding(rb);
        }
        self.synced.mark("RoleBinding");
    }
}

impl IndexClusterResource<ClusterRoleBinding> for Index {
    fn apply(&mut self, crb: ClusterRoleBinding) {
        self.apply_cluster_role_binding(crb);
    }

    fn delete(&mut self, name: String) {
        self.delete_cluster_role_binding(&name);
    }

    fn reset(&mut self, bindings: Vec<ClusterRoleBinding>, removed: ClusterRemoved) {
        for name in removed {
            self.delete_cluster_role_binding(&name);
        }
        for crb in bindings {
            self.apply_cluster_role_binding(crb);
        }
        self.synced.mark("ClusterRoleBinding");
    }
}

impl IndexNamespacedResource<Group> for Index {
    fn apply(&mut self, group: Group) {
        self.apply_group(group);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_group(&ResourceId::new(namespace, name));
    }

    fn reset(&mut self, groups: Vec<Group>, removed: NamespacedRemoved) {
        for (namespace, names) in removed {
            for name in names {
                self.delete_group(&ResourceId::new(namespace.clone(), name));
            }
        }
        for group in groups {
            self.apply_group(group);
        }
        self.synced.mark("Group");
    }
}

impl SizedIndex<Role> for Index {
    fn size(&self, namespace: &str) -> usize {
        self.roles.keys().filter(|id| id.namespace == namespace).count()
    }
}

impl SizedIndex<ClusterRole> for Index {
    fn size(&self, _: &str) -> usize {
        self.cluster_roles.len()
    }
}

impl SizedIndex<RoleBinding> for Index {
    fn size(&self, namespace: &str) -> usize {
        self.role_bindings
            .keys()
            .filter(|id| id.namespace == namespace)
            .count()
    }
}

impl SizedIndex<ClusterRoleBinding> for Index {
    fn size(&self, _: &str) -> usize {
        self.cluster_role_bindings.len()
    }
}

impl SizedIndex<Group> for Index {
    fn size(&self, namespace: &str) -> usize {
        self.group_members
            .keys()
            .filter(|id| id.namespace == namespace)
            .count()
    }
}

// === impl Synced ===

impl Synced {
    fn mark(&mut self, kind: &'static str) {
        if self.pending.remove(kind) && self.pending.is_empty() {
            tracing::debug!("RBAC index synced");
            self.tx.send_replace(true);
        }
    }
}

fn rule_permits(rule: &Rule, namespace: Option<&str>, attrs: &Attributes) -> bool {
    match attrs.resource.as_ref() {
        Some(resource) => {
            namespace.map_or(true, |ns| ns == resource.namespace)
                && rule.matches_resource(resource, &attrs.verb)
        }
        None => rule.matches_path(&attrs.path),
    }
}

/// Converts RBAC policy rules. `resource/subresource` entries are kept whole so that a
/// subresource grant stays scoped to its resource.
fn convert_rules(rules: Option<&[PolicyRule]>) -> Arc<[Rule]> {
    rules
        .unwrap_or_default()
        .iter()
        .map(|rule| {
            let mut resources = Vec::new();
            for resource in rule.resources.iter().flatten() {
                if !resources.contains(resource) {
                    resources.push(resource.clone());
                }
            }
            Rule {
                api_groups: rule.api_groups.clone().unwrap_or_default(),
                resources,
                resource_names: rule.resource_names.clone().unwrap_or_default(),
                verbs: rule.verbs.clone(),
                paths: rule.non_resource_urls.clone().unwrap_or_default(),
            }
        })
        .collect()
}

/// The index keys of a binding's subjects. Service accounts are indexed as users named
/// `serviceaccount:{namespace}:{name}`.
fn subject_keys(subjects: Option<&[Subject]>) -> Vec<SubjectKey> {
    subjects
        .unwrap_or_default()
        .iter()
        .filter_map(|s| match s.kind.as_str() {
            "User" => Some((SubjectKind::User, s.name.clone())),
            "Group" => Some((SubjectKind::Group, s.name.clone())),
            "ServiceAccount" => s
                .namespace
                .as_deref()
                .filter(|ns| !ns.is_empty())
                .map(|ns| (SubjectKind::User, format!("serviceaccount:{ns}:{}", s.name))),
            _ => None,
        })
        .collect()
}

fn users(subjects: Option<&[Subject]>) -> Vec<String> {
    subjects
        .unwrap_or_default()
        .iter()
        .filter(|s| s.kind == "User")
        .map(|s| s.name.clone())
        .collect()
}

fn remove_from<K, V>(map: &mut HashMap<K, HashSet<V>>, key: &K, value: &V)
where
    K: Hash + Eq,
    V: Hash + Eq,
{
    if let Some(values) = map.get_mut(key) {
        values.remove(value);
        if values.is_empty() {
            map.remove(key);
        }
    }
}

fn sorted<T: Clone + Ord>(values: Option<&HashSet<T>>) -> Vec<T> {
    let mut values = values
        .into_iter()
        .flatten()
        .cloned()
        .collect::<Vec<_>>();
    values.sort();
    values
}
