//! Synthesizes the role and binding through which an access code grants access.
//!
//! Every access code owns exactly one `Role`, labeled `code-role={code}`, granting read access
//! to the resources the code names, and one `RoleBinding`, labeled `code-rolebinding={code}`,
//! binding the role to the users who redeemed the code while it is active. Both are owned by the
//! code, so deleting the code deletes them.

use crate::{
    events::reasons, labeled, name_of, owner_reference, retry::retry_on_conflict, until, Action,
    Context, Error, Reconcile, Result,
};
use gargantua_core::API_GROUP;
use gargantua_k8s_api::{
    labels, store::Object, AccessGrants, CodePhase, EventType, GrantsAccess, ListParams,
    ObjectMeta, PolicyRule, ResourceId, Role, RoleBinding, RoleRef, Store, Subject, User,
    RBAC_API_GROUP,
};
use std::marker::PhantomData;
use tracing::{debug, info};

const VERBS: [&str; 3] = ["get", "list", "watch"];

pub struct CodeRoleReconciler<S, C> {
    ctx: Context<S>,
    name: String,
    _kind: PhantomData<fn() -> C>,
}

/// The rules granting read access to each category of resource a code names. Categories the
/// code names nothing in are omitted, since a rule without resource names matches every name.
pub fn rules(grants: &AccessGrants) -> Vec<PolicyRule> {
    [
        ("scenarios", &grants.scenarios),
        ("courses", &grants.courses),
        ("scheduledevents", &grants.scheduled_events),
        ("machinesets", &grants.machine_sets),
    ]
    .into_iter()
    .filter(|(_, names)| !names.is_empty())
    .map(|(resource, names)| PolicyRule {
        api_groups: Some(vec![API_GROUP.to_string()]),
        resources: Some(vec![resource.to_string()]),
        resource_names: Some(names.clone()),
        verbs: VERBS.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    })
    .collect()
}

/// Binds a HobbyFarm user.
pub fn user_subject(user: &str) -> Subject {
    Subject {
        api_group: Some(RBAC_API_GROUP.to_string()),
        kind: "User".to_string(),
        name: user.to_string(),
        namespace: None,
    }
}

pub(crate) fn has_user(binding: &RoleBinding, user: &str) -> bool {
    binding
        .subjects
        .iter()
        .flatten()
        .any(|s| s.kind == "User" && s.name == user)
}

// === impl CodeRoleReconciler ===

impl<S, C> CodeRoleReconciler<S, C>
where
    S: Store,
    C: Object + GrantsAccess,
{
    pub fn new(ctx: Context<S>) -> Self {
        Self {
            ctx,
            name: format!("{}-role-controller", C::kind(&()).to_lowercase()),
            _kind: PhantomData,
        }
    }

    async fn sync_role(&self, code: &C, roles: Vec<Role>) -> Result<Role> {
        let store = &self.ctx.store;
        let namespace = code.meta().namespace.as_deref().unwrap_or_default();
        let desired = rules(code.grants());

        let Some(role) = roles.into_iter().next() else {
            let role = Role {
                metadata: ObjectMeta {
                    generate_name: Some("coderole-".to_string()),
                    namespace: Some(namespace.to_string()),
                    labels: Some(labels::Map::from([(
                        labels::CODE_ROLE.to_string(),
                        name_of(code).to_string(),
                    )])),
                    owner_references: Some(vec![owner_reference(code)?]),
                    ..Default::default()
                },
                rules: Some(desired),
            };
            let role = store.create(namespace, &role).await?;
            info!(code = %name_of(code), role = %name_of(&role), "Created role");
            return Ok(role);
        };

        if role.rules.as_deref().unwrap_or_default() == desired.as_slice() {
            return Ok(role);
        }
        let role_name = name_of(&role);
        let desired = &desired;
        let role = retry_on_conflict(|| async move {
            let mut role = store.get::<Role>(namespace, role_name).await?;
            role.rules = Some(desired.clone());
            store.replace(&role).await
        })
        .await?;
        debug!(role = %name_of(&role), "Updated rules");
        Ok(role)
    }

    /// The users whose redemption of the code is currently in effect.
    async fn members(&self, code: &C, active: bool) -> Result<Vec<String>> {
        if !active {
            return Ok(Vec::new());
        }
        let namespace = code.meta().namespace.as_deref().unwrap_or_default();
        let users = self
            .ctx
            .store
            .list::<User>(namespace, &ListParams::default())
            .await?;
        let mut members = users
            .iter()
            .filter(|u| u.spec.access_codes.iter().any(|c| c == name_of(code)))
            .map(|u| name_of(u).to_string())
            .collect::<Vec<_>>();
        members.sort();
        Ok(members)
    }

    async fn sync_binding(
        &self,
        code: &C,
        role: &Role,
        bindings: Vec<RoleBinding>,
        members: &[String],
    ) -> Result<()> {
        let store = &self.ctx.store;
        let namespace = code.meta().namespace.as_deref().unwrap_or_default();
        let role_ref = RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "Role".to_string(),
            name: name_of(role).to_string(),
        };

        let existing = bindings.into_iter().next();
        if let Some(binding) = existing.as_ref() {
            // A binding's role reference cannot change; replace the binding instead.
            if binding.role_ref != role_ref {
                match store.delete::<RoleBinding>(namespace, name_of(binding)).await {
                    Err(error) if !error.is_not_found() => return Err(error.into()),
                    _ => {}
                }
            }
        }

        let Some(binding) = existing.filter(|b| b.role_ref == role_ref) else {
            let binding = RoleBinding {
                metadata: ObjectMeta {
                    generate_name: Some("code-".to_string()),
                    namespace: Some(namespace.to_string()),
                    labels: Some(labels::Map::from([(
                        labels::CODE_ROLEBINDING.to_string(),
                        name_of(code).to_string(),
                    )])),
                    owner_references: Some(vec![owner_reference(code)?]),
                    ..Default::default()
                },
                role_ref,
                subjects: Some(members.iter().map(|u| user_subject(u)).collect()),
            };
            let binding = store.create(namespace, &binding).await?;
            info!(code = %name_of(code), binding = %name_of(&binding), "Created binding");
            return Ok(());
        };

        let binding_name = name_of(&binding);
        retry_on_conflict(|| async move {
            let mut binding = store.get::<RoleBinding>(namespace, binding_name).await?;
            let subjects = binding.subjects.get_or_insert_with(Vec::new);
            let before = subjects.len();
            // Users are bound exactly once, and only while they hold the active code.
            let mut seen = Vec::new();
            subjects.retain(|s| {
                if s.kind != "User" {
                    return true;
                }
                let keep = members.contains(&s.name) && !seen.contains(&s.name);
                seen.push(s.name.clone());
                keep
            });
            let mut changed = subjects.len() != before;
            for user in members {
                if !subjects.iter().any(|s| s.kind == "User" && s.name == *user) {
                    subjects.push(user_subject(user));
                    changed = true;
                }
            }
            if changed {
                store.replace(&binding).await?;
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn set_phase(&self, id: &ResourceId, phase: CodePhase) -> Result<()> {
        let store = &self.ctx.store;
        retry_on_conflict(|| async move {
            let Some(mut code) = store.get_opt::<C>(&id.namespace, &id.name).await? else {
                return Ok(());
            };
            if code.phase() == Some(phase) {
                return Ok(());
            }
            code.set_phase(phase);
            store.replace_status(&code).await?;
            Ok(())
        })
        .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl<S, C> Reconcile for CodeRoleReconciler<S, C>
where
    S: Store,
    C: Object + GrantsAccess,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn reconcile(&self, id: &ResourceId) -> Result<Action> {
        let store = &self.ctx.store;
        let Some(code) = store.get_opt::<C>(&id.namespace, &id.name).await? else {
            return Ok(Action::Done);
        };
        if code.meta().deletion_timestamp.is_some() {
            return Ok(Action::Done);
        }

        let roles = store
            .list::<Role>(&id.namespace, &labeled(labels::CODE_ROLE, &id.name))
            .await?;
        let bindings = store
            .list::<RoleBinding>(&id.namespace, &labeled(labels::CODE_ROLEBINDING, &id.name))
            .await?;
        if roles.len() > 1 || bindings.len() > 1 {
            let message = format!(
                "found {} roles and {} bindings for code {}",
                roles.len(),
                bindings.len(),
                id.name
            );
            self.ctx
                .events
                .publish(
                    &self.name,
                    &code,
                    EventType::Warning,
                    reasons::DUPLICATE_ROLES,
                    message.as_str(),
                )
                .await;
            return Err(Error::invariant(message));
        }
        let created = roles.is_empty();

        let now = self.ctx.clock.now();
        let phase = code.validity().phase(now);
        let role = self.sync_role(&code, roles).await?;
        let members = self.members(&code, phase == CodePhase::Active).await?;
        self.sync_binding(&code, &role, bindings, &members).await?;
        self.set_phase(id, phase).await?;

        if created {
            self.ctx
                .events
                .publish(
                    &self.name,
                    &code,
                    EventType::Info,
                    reasons::ROLE_SYNTHESIZED,
                    name_of(&role),
                )
                .await;
        }

        Ok(match code.validity().next_transition(now) {
            Some(at) => Action::RequeueAfter(until(at - now)),
            None => Action::Done,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rules_cover_named_categories() {
        let grants = AccessGrants {
            scenarios: vec!["s1".to_string(), "s2".to_string()],
            machine_sets: vec!["ms1".to_string()],
            ..Default::default()
        };
        let rules = rules(&grants);
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].resources, Some(vec!["scenarios".to_string()]));
        assert_eq!(
            rules[0].resource_names,
            Some(vec!["s1".to_string(), "s2".to_string()])
        );
        assert_eq!(rules[0].api_groups, Some(vec!["hobbyfarm.io".to_string()]));
        assert_eq!(rules[0].verbs, vec!["get", "list", "watch"]);
        assert_eq!(rules[1].resources, Some(vec!["machinesets".to_string()]));
    }

    #[test]
    fn empty_categories_grant_nothing() {
        assert!(rules(&AccessGrants::default()).is_empty());

        let grants = AccessGrants {
            courses: vec!["c1".to_string()],
            ..Default::default()
        };
        let rules = rules(&grants);
        assert_eq!(rules.len(), 1);
        assert!(rules
            .iter()
            .all(|r| r.resource_names.as_ref().is_some_and(|n| !n.is_empty())));
    }
}
