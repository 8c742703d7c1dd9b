//! Projects each user's active access codes into the codes' role bindings.
//!
//! A user is bound exactly once by the binding of every code they hold that is currently valid,
//! and is absent from every other code binding. Codes outside their validity window stay on the
//! user, so a code that becomes valid again restores access.

use crate::{
    code_roles::{has_user, user_subject},
    labeled, name_of,
    retry::retry_on_conflict,
    until, Action, Context, Reconcile, Result,
};
use chrono::{DateTime, Utc};
use gargantua_k8s_api::{
    labels, AccessCode, OneTimeAccessCode, ResourceId, RoleBinding, Store, User, Validity,
};
use gargantua_k8s_index::SharedIndex;
use std::{collections::BTreeSet, time::Duration};
use tracing::debug;

pub const NAME: &str = "user-binding-controller";

/// How soon to look again when a code's binding has not been synthesized yet.
const BINDING_RETRY: Duration = Duration::from_secs(5);

pub struct UserBindingReconciler<S> {
    ctx: Context<S>,
    index: SharedIndex,
}

// === impl UserBindingReconciler ===

impl<S: Store> UserBindingReconciler<S> {
    pub fn new(ctx: Context<S>, index: SharedIndex) -> Self {
        Self { ctx, index }
    }

    async fn validity(&self, namespace: &str, code: &str) -> Result<Option<Validity>> {
        let store = &self.ctx.store;
        if let Some(code) = store.get_opt::<AccessCode>(namespace, code).await? {
            return Ok(Some(code.spec.validity));
        }
        let otac = store.get_opt::<OneTimeAccessCode>(namespace, code).await?;
        Ok(otac.map(|c| c.spec.validity))
    }

    async fn code_bindings(&self, namespace: &str, code: &str) -> Result<Vec<RoleBinding>> {
        let bindings = self
            .ctx
            .store
            .list::<RoleBinding>(namespace, &labeled(labels::CODE_ROLEBINDING, code))
            .await?;
        Ok(bindings)
    }

    async fn bind(&self, namespace: &str, binding: &str, user: &str) -> Result<()> {
        let store = &self.ctx.store;
        retry_on_conflict(|| async move {
            let Some(mut binding) = store.get_opt::<RoleBinding>(namespace, binding).await? else {
                return Ok(());
            };
            if has_user(&binding, user) {
                return Ok(());
            }
            binding
                .subjects
                .get_or_insert_with(Vec::new)
                .push(user_subject(user));
            store.replace(&binding).await?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn unbind(&self, namespace: &str, binding: &str, user: &str) -> Result<()> {
        let store = &self.ctx.store;
        retry_on_conflict(|| async move {
            let Some(mut binding) = store.get_opt::<RoleBinding>(namespace, binding).await? else {
                return Ok(());
            };
            if !has_user(&binding, user) {
                return Ok(());
            }
            if let Some(subjects) = binding.subjects.as_mut() {
                subjects.retain(|s| !(s.kind == "User" && s.name == user));
            }
            store.replace(&binding).await?;
            Ok(())
        })
        .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl<S: Store> Reconcile for UserBindingReconciler<S> {
    fn name(&self) -> &str {
        NAME
    }

    async fn reconcile(&self, id: &ResourceId) -> Result<Action> {
        let namespace = id.namespace.as_str();
        let user = self.ctx.store.get_opt::<User>(namespace, &id.name).await?;
        let codes = user.map(|u| u.spec.access_codes).unwrap_or_default();
        let now = self.ctx.clock.now();

        let mut active = BTreeSet::new();
        let mut inactive = BTreeSet::new();
        let mut next: Option<DateTime<Utc>> = None;
        for code in &codes {
            match self.validity(namespace, code).await? {
                Some(validity) => {
                    if validity.contains(now) {
                        active.insert(code.as_str());
                    } else {
                        inactive.insert(code.as_str());
                    }
                    if let Some(at) = validity.next_transition(now) {
                        next = Some(next.map_or(at, |n| n.min(at)));
                    }
                }
                None => debug!(user = %id, %code, "Access code not found"),
            }
        }

        let mut pending = false;
        for code in &active {
            let bindings = self.code_bindings(namespace, code).await?;
            let [binding] = bindings.as_slice() else {
                debug!(user = %id, %code, bindings = bindings.len(), "Waiting for a single binding");
                pending = true;
                continue;
            };
            self.bind(namespace, name_of(binding), &id.name).await?;
        }

        // Bindings listing the user, as indexed, plus those of codes the user holds but which
        // are not in effect.
        let mut stale = self
            .index
            .read()
            .bindings_for_user(&id.name)
            .into_iter()
            .filter(|b| b.metadata.namespace.as_deref() == Some(namespace))
            .collect::<Vec<_>>();
        for code in &inactive {
            stale.extend(self.code_bindings(namespace, code).await?);
        }
        let mut unbound = BTreeSet::new();
        for binding in &stale {
            let Some(code) = labels::get(&binding.metadata, labels::CODE_ROLEBINDING) else {
                continue;
            };
            if active.contains(code) || !unbound.insert(name_of(binding)) {
                continue;
            }
            self.unbind(namespace, name_of(binding), &id.name).await?;
        }

        let mut delay = next.map(|at| until(at - now));
        if pending {
            delay = Some(delay.map_or(BINDING_RETRY, |d| d.min(BINDING_RETRY)));
        }
        Ok(delay.map_or(Action::Done, Action::RequeueAfter))
    }
}
