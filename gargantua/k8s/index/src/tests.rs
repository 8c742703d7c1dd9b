use crate::{Authorizer, Index, SharedIndex, SubjectKind};
use gargantua_core::{Attributes, ResourceAttributes, UserInfo};
use gargantua_k8s_api::{
    labels, ClusterRole, ClusterRoleBinding, Group, GroupSpec, ObjectMeta, PolicyRule, Role,
    RoleBinding, RoleRef, Subject, RBAC_API_GROUP,
};
use kubert::index::{IndexClusterResource, IndexNamespacedResource};
use maplit::btreemap;
use pretty_assertions::assert_eq;
use regex::Regex;

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn meta(ns: Option<&str>, name: &str) -> ObjectMeta {
    ObjectMeta {
        namespace: ns.map(Into::into),
        name: Some(name.to_string()),
        ..Default::default()
    }
}

fn policy_rule(groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(strings(groups)),
        resources: Some(strings(resources)),
        verbs: strings(verbs),
        ..Default::default()
    }
}

fn mk_role(ns: &str, name: &str, rules: Vec<PolicyRule>) -> Role {
    Role {
        metadata: meta(Some(ns), name),
        rules: Some(rules),
    }
}

fn mk_cluster_role(name: &str, rules: Vec<PolicyRule>) -> ClusterRole {
    ClusterRole {
        metadata: meta(None, name),
        rules: Some(rules),
        ..Default::default()
    }
}

fn subject(kind: &str, name: &str) -> Subject {
    Subject {
        api_group: Some(RBAC_API_GROUP.to_string()),
        kind: kind.to_string(),
        name: name.to_string(),
        namespace: None,
    }
}

fn role_ref(kind: &str, name: &str) -> RoleRef {
    RoleRef {
        api_group: RBAC_API_GROUP.to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

fn mk_binding(ns: &str, name: &str, role: RoleRef, subjects: Vec<Subject>) -> RoleBinding {
    RoleBinding {
        metadata: meta(Some(ns), name),
        role_ref: role,
        subjects: Some(subjects),
    }
}

fn mk_cluster_binding(name: &str, role: RoleRef, subjects: Vec<Subject>) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: meta(None, name),
        role_ref: role,
        subjects: Some(subjects),
    }
}

fn user(name: &str, groups: &[&str]) -> UserInfo {
    UserInfo {
        name: name.to_string(),
        uid: format!("uid-{name}"),
        groups: strings(groups),
    }
}

fn request(user: UserInfo, ns: &str, resource: &str, verb: &str) -> Attributes {
    Attributes::resource(
        user,
        verb,
        ResourceAttributes {
            namespace: ns.to_string(),
            api_group: "hobbyfarm.io".to_string(),
            resource: resource.to_string(),
            ..Default::default()
        },
    )
}

fn apply<R>(index: &SharedIndex, resource: R)
where
    Index: IndexNamespacedResource<R>,
{
    IndexNamespacedResource::apply(&mut *index.write(), resource);
}

fn apply_cluster<R>(index: &SharedIndex, resource: R)
where
    Index: IndexClusterResource<R>,
{
    IndexClusterResource::apply(&mut *index.write(), resource);
}

fn authorizer(index: &SharedIndex) -> Authorizer {
    Authorizer::new(
        index.clone(),
        vec![Regex::new("^/healthz$").unwrap()],
        "system:masters",
    )
}

#[test]
fn simple_grant() {
    let index = Index::shared();
    {
        apply(
            &index,
            mk_role(
                "hf",
                "R1",
                vec![policy_rule(&["hobbyfarm.io"], &["scenarios"], &["list"])],
            ),
        );
        apply(&index, mk_binding(
            "hf",
            "B1",
            role_ref("Role", "R1"),
            vec![subject("User", "alice@example.com")],
        ));
    }

    let authz = authorizer(&index);
    let alice = user("alice@example.com", &[]);
    assert!(authz
        .authorize(&request(alice.clone(), "hf", "scenarios", "list"))
        .is_allowed());
    assert!(!authz
        .authorize(&request(alice.clone(), "hf", "scenarios", "create"))
        .is_allowed());
    assert!(!authz
        .authorize(&request(alice.clone(), "other", "scenarios", "list"))
        .is_allowed());
    assert!(!authz
        .authorize(&request(user("bob", &[]), "hf", "scenarios", "list"))
        .is_allowed());

    let access = index
        .read()
        .access_set("alice@example.com", SubjectKind::User);
    assert!(access.grants("hf", "hobbyfarm.io", "scenarios", "list"));
    assert!(!access.grants("hf", "hobbyfarm.io", "scenarios", "create"));
}

#[test]
fn wildcard_cluster_grant() {
    let index = Index::shared();
    {
        apply_cluster(
            &index,
            mk_cluster_role("admin", vec![policy_rule(&["*"], &["*"], &["*"])]),
        );
        apply_cluster(&index, mk_cluster_binding(
            "admins",
            role_ref("ClusterRole", "admin"),
            vec![subject("Group", "admins")],
        ));
    }

    let authz = authorizer(&index);
    let carol = user("carol", &["admins"]);
    for (ns, resource, verb) in [
        ("hf", "machines", "delete"),
        ("other", "scheduledevents", "create"),
        ("hf", "users", "get"),
    ] {
        assert!(
            authz.authorize(&request(carol.clone(), ns, resource, verb)).is_allowed(),
            "{ns} {resource} {verb}"
        );
    }
    assert!(!authz
        .authorize(&request(user("dave", &["users"]), "hf", "machines", "get"))
        .is_allowed());

    let access = index.read().access_set("admins", SubjectKind::Group);
    assert!(access.contains("/*/*/*/*"));
    assert_eq!(access.len(), 1);
}

#[test]
fn access_set_is_exact_expansion() {
    let index = Index::shared();
    {
        apply(
            &index,
            mk_role(
                "hf",
                "viewer",
                vec![
                    policy_rule(&["hobbyfarm.io"], &["scenarios", "courses"], &["get", "list"]),
                    policy_rule(&[""], &["configmaps"], &["get"]),
                ],
            ),
        );
        apply_cluster(
            &index,
            mk_cluster_role(
                "events",
                vec![policy_rule(&["hobbyfarm.io"], &["events"], &["watch"])],
            ),
        );
        apply(&index, mk_binding(
            "hf",
            "viewers",
            role_ref("Role", "viewer"),
            vec![subject("User", "alice")],
        ));
        apply(&index, mk_binding(
            "hf",
            "event-watchers",
            role_ref("ClusterRole", "events"),
            vec![subject("User", "alice")],
        ));
        apply_cluster(&index, mk_cluster_binding(
            "global-events",
            role_ref("ClusterRole", "events"),
            vec![subject("User", "alice")],
        ));
        // Bindings to missing roles are ignored.
        apply(&index, mk_binding(
            "hf",
            "dangling",
            role_ref("Role", "missing"),
            vec![subject("User", "alice")],
        ));
    }

    let access = index.read().access_set("alice", SubjectKind::User);
    let mut keys = access.keys().map(str::to_string).collect::<Vec<_>>();
    keys.sort();
    assert_eq!(
        keys,
        vec![
            "/*/hobbyfarm.io/events/watch",
            "/hf//configmaps/get",
            "/hf/hobbyfarm.io/courses/get",
            "/hf/hobbyfarm.io/courses/list",
            "/hf/hobbyfarm.io/events/watch",
            "/hf/hobbyfarm.io/scenarios/get",
            "/hf/hobbyfarm.io/scenarios/list",
        ]
    );
}

#[test]
fn deleted_bindings_no_longer_grant() {
    let index = Index::shared();
    {
        apply(
            &index,
            mk_role(
                "hf",
                "R1",
                vec![policy_rule(&["hobbyfarm.io"], &["scenarios"], &["list"])],
            ),
        );
        apply(&index, mk_binding(
            "hf",
            "B1",
            role_ref("Role", "R1"),
            vec![subject("User", "alice")],
        ));
    }
    let authz = authorizer(&index);
    let req = request(user("alice", &[]), "hf", "scenarios", "list");
    assert!(authz.authorize(&req).is_allowed());

    IndexNamespacedResource::<RoleBinding>::delete(
        &mut *index.write(),
        "hf".to_string(),
        "B1".to_string(),
    );
    assert!(!authz.authorize(&req).is_allowed());
    assert!(index.read().bindings_for_user("alice").is_empty());
}

#[test]
fn unprotected_paths_and_superusers_bypass_rbac() {
    let index = Index::shared();
    let authz = authorizer(&index);

    let anonymous = user("system:anonymous", &[]);
    assert!(authz
        .authorize(&Attributes::non_resource(anonymous.clone(), "get", "/healthz"))
        .is_allowed());
    assert!(!authz
        .authorize(&Attributes::non_resource(anonymous, "get", "/metrics"))
        .is_allowed());

    let root = user("root", &["system:masters"]);
    assert!(authz
        .authorize(&request(root, "hf", "machines", "delete"))
        .is_allowed());
}

#[test]
fn non_resource_paths() {
    let index = Index::shared();
    {
        apply_cluster(
            &index,
            mk_cluster_role(
                "api-reader",
                vec![PolicyRule {
                    non_resource_urls: Some(strings(&["/api/*"])),
                    verbs: strings(&["get"]),
                    ..Default::default()
                }],
            ),
        );
        apply_cluster(&index, mk_cluster_binding(
            "api-readers",
            role_ref("ClusterRole", "api-reader"),
            vec![subject("User", "alice")],
        ));
    }
    let authz = authorizer(&index);
    assert!(authz
        .authorize(&Attributes::non_resource(user("alice", &[]), "get", "/api/v1/users"))
        .is_allowed());
    assert!(!authz
        .authorize(&Attributes::non_resource(user("alice", &[]), "get", "/apis"))
        .is_allowed());
}

#[test]
fn hobbyfarm_groups_expand_membership() {
    let index = Index::shared();
    {
        apply(
            &index,
            mk_role(
                "hf",
                "instructor",
                vec![policy_rule(&["hobbyfarm.io"], &["sessions"], &["get"])],
            ),
        );
        apply(&index, mk_binding(
            "hf",
            "instructors",
            role_ref("Role", "instructor"),
            vec![subject("Group", "instructors")],
        ));
        apply(&index, Group {
            metadata: meta(Some("hf"), "instructors"),
            spec: GroupSpec {
                display_name: "Instructors".to_string(),
                user_members: strings(&["u-alice"]),
                provider_members: btreemap! {
                    "ldap".to_string() => strings(&["uid=bob,dc=example,dc=org"]),
                },
            },
        });
    }

    let authz = authorizer(&index);
    assert!(authz
        .authorize(&request(user("u-alice", &[]), "hf", "sessions", "get"))
        .is_allowed());
    assert!(authz
        .authorize(&request(
            user("uid=bob,dc=example,dc=org", &[]),
            "hf",
            "sessions",
            "get"
        ))
        .is_allowed());
    assert!(!authz
        .authorize(&request(user("u-carol", &[]), "hf", "sessions", "get"))
        .is_allowed());

    IndexNamespacedResource::<Group>::delete(
        &mut *index.write(),
        "hf".to_string(),
        "instructors".to_string(),
    );
    assert!(index.read().groups_for("u-alice").is_empty());
}

#[test]
fn indexes_code_bindings_and_service_accounts() {
    let index = Index::shared();
    let mut code_binding = mk_binding(
        "hf",
        "code-abcde",
        role_ref("Role", "coderole-abcde"),
        vec![subject("User", "alice"), subject("User", "bob")],
    );
    code_binding.metadata.labels = Some(btreemap! {
        labels::CODE_ROLEBINDING.to_string() => "ac-x".to_string(),
    });
    let sa_binding = mk_binding(
        "hf",
        "controllers",
        role_ref("Role", "controller"),
        vec![Subject {
            api_group: None,
            kind: "ServiceAccount".to_string(),
            name: "gargantua".to_string(),
            namespace: Some("hf".to_string()),
        }],
    );
    {
        apply(&index, code_binding.clone());
        apply(&index, sa_binding.clone());
    }

    let idx = index.read();
    assert_eq!(idx.bindings_for_code("ac-x"), vec![code_binding.clone()]);
    assert!(idx.bindings_for_code("ac-y").is_empty());
    assert_eq!(idx.bindings_for_user("bob"), vec![code_binding]);
    assert_eq!(
        idx.role_bindings_for(SubjectKind::User, "serviceaccount:hf:gargantua"),
        vec![sa_binding]
    );
    assert!(idx.bindings_for_user("serviceaccount:hf:gargantua").is_empty());
}

#[test]
fn updates_replace_subjects() {
    let index = Index::shared();
    let mut binding = mk_binding(
        "hf",
        "B1",
        role_ref("Role", "R1"),
        vec![subject("User", "alice")],
    );
    apply(&index, binding.clone());
    binding.subjects = Some(vec![subject("User", "bob")]);
    apply(&index, binding.clone());

    let idx = index.read();
    assert!(idx.bindings_for_user("alice").is_empty());
    assert_eq!(idx.bindings_for_user("bob"), vec![binding]);
}

#[test]
fn synced_after_every_kind_resets() {
    let index = Index::shared();
    let synced = index.read().synced();
    {
        let mut idx = index.write();
        IndexNamespacedResource::<Role>::reset(&mut *idx, vec![], Default::default());
        IndexNamespacedResource::<RoleBinding>::reset(&mut *idx, vec![], Default::default());
        IndexClusterResource::<ClusterRole>::reset(&mut *idx, vec![], Default::default());
        IndexNamespacedResource::<Group>::reset(&mut *idx, vec![], Default::default());
    }
    assert!(!*synced.borrow());

    IndexClusterResource::<ClusterRoleBinding>::reset(
        &mut *index.write(),
        vec![mk_cluster_binding(
            "admins",
            role_ref("ClusterRole", "admin"),
            vec![subject("Group", "admins")],
        )],
        Default::default(),
    );
    assert!(*synced.borrow());
    assert_eq!(
        index
            .read()
            .cluster_role_bindings_for(SubjectKind::Group, "admins")
            .len(),
        1
    );
}

fn subresource_request(
    user: UserInfo,
    ns: &str,
    resource: &str,
    sub: &str,
    verb: &str,
) -> Attributes {
    Attributes::resource(
        user,
        verb,
        ResourceAttributes {
            namespace: ns.to_string(),
            api_group: "hobbyfarm.io".to_string(),
            resource: resource.to_string(),
            subresource: Some(sub.to_string()),
            ..Default::default()
        },
    )
}

#[test]
fn subresource_grants_stay_scoped_to_their_resource() {
    let index = Index::shared();
    apply(
        &index,
        mk_role(
            "hf",
            "status-writer",
            vec![policy_rule(&["hobbyfarm.io"], &["machines/status"], &["update"])],
        ),
    );
    apply(
        &index,
        mk_role(
            "hf",
            "mixed",
            vec![policy_rule(
                &["hobbyfarm.io"],
                &["sessions/status", "machines"],
                &["update"],
            )],
        ),
    );
    apply(
        &index,
        mk_binding(
            "hf",
            "alice-status",
            role_ref("Role", "status-writer"),
            vec![subject("User", "alice")],
        ),
    );
    apply(
        &index,
        mk_binding(
            "hf",
            "bob-mixed",
            role_ref("Role", "mixed"),
            vec![subject("User", "bob")],
        ),
    );

    let authz = authorizer(&index);
    let alice = user("alice", &[]);
    assert!(!authz
        .authorize(&request(alice.clone(), "hf", "machines", "update"))
        .is_allowed());
    assert!(authz
        .authorize(&subresource_request(
            alice.clone(),
            "hf",
            "machines",
            "status",
            "update"
        ))
        .is_allowed());

    let bob = user("bob", &[]);
    assert!(authz
        .authorize(&request(bob.clone(), "hf", "machines", "update"))
        .is_allowed());
    assert!(!authz
        .authorize(&subresource_request(
            bob.clone(),
            "hf",
            "machines",
            "status",
            "update"
        ))
        .is_allowed());
    assert!(authz
        .authorize(&subresource_request(bob, "hf", "sessions", "status", "update"))
        .is_allowed());

    let access = index.read().access_set("alice", SubjectKind::User);
    assert!(!access.grants("hf", "hobbyfarm.io", "machines", "update"));
}
