//! Keeps a one-time access code set stocked with its requested number of codes.
//!
//! Surplus codes are deleted only if they have not been redeemed. When redeemed codes make the
//! surplus impossible to remove, the set reports `DesiredOTACAmount=False`.

use crate::{
    events::reasons, labeled, name_of, owner_reference, retry::retry_on_conflict, Action,
    Context, Reconcile, Result,
};
use gargantua_k8s_api::{
    labels, set_condition, EventType, ObjectMeta, OneTimeAccessCode, OneTimeAccessCodeSet,
    ResourceId, Store,
};
use tracing::{debug, info};

pub const NAME: &str = "otacset-controller";

/// The condition reporting whether a set holds its requested number of codes.
pub const DESIRED_OTAC_AMOUNT: &str = "DesiredOTACAmount";

pub struct OtacSetReconciler<S> {
    ctx: Context<S>,
}

fn is_redeemed(code: &OneTimeAccessCode) -> bool {
    match labels::get(&code.metadata, labels::OTAC_REDEEMED) {
        Some(redeemed) => redeemed != "false",
        None => !code.spec.user.is_empty(),
    }
}

// === impl OtacSetReconciler ===

impl<S: Store> OtacSetReconciler<S> {
    pub fn new(ctx: Context<S>) -> Self {
        Self { ctx }
    }

    fn code_for(set: &OneTimeAccessCodeSet) -> Result<OneTimeAccessCode> {
        let redeemed = if set.spec.template.user.is_empty() {
            "false"
        } else {
            "true"
        };
        Ok(OneTimeAccessCode {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-", name_of(set))),
                namespace: set.metadata.namespace.clone(),
                labels: Some(labels::Map::from([
                    (labels::OTAC_SET.to_string(), name_of(set).to_string()),
                    (labels::OTAC_REDEEMED.to_string(), redeemed.to_string()),
                ])),
                owner_references: Some(vec![owner_reference(set)?]),
                ..Default::default()
            },
            spec: set.spec.template.clone(),
            status: None,
        })
    }
}

#[async_trait::async_trait]
impl<S: Store> Reconcile for OtacSetReconciler<S> {
    fn name(&self) -> &str {
        NAME
    }

    async fn reconcile(&self, id: &ResourceId) -> Result<Action> {
        let store = &self.ctx.store;
        let selector = labeled(labels::OTAC_SET, &id.name);
        let Some(set) = store
            .get_opt::<OneTimeAccessCodeSet>(&id.namespace, &id.name)
            .await?
        else {
            let deleted = store
                .delete_collection::<OneTimeAccessCode>(&id.namespace, &selector)
                .await?;
            if deleted > 0 {
                info!(set = %id, deleted, "Deleted codes of removed set");
            }
            return Ok(Action::Done);
        };
        if set.metadata.deletion_timestamp.is_some() {
            return Ok(Action::Done);
        }

        let codes = store
            .list::<OneTimeAccessCode>(&id.namespace, &selector)
            .await?
            .into_iter()
            .filter(|c| c.metadata.deletion_timestamp.is_none())
            .collect::<Vec<_>>();
        let count = set.spec.count as usize;
        let mut created = codes.len();
        let mut shortfall = None;

        if created < count {
            let code = Self::code_for(&set)?;
            for _ in created..count {
                store.create(&id.namespace, &code).await?;
                created += 1;
            }
            debug!(set = %id, created, "Created codes");
        } else if created > count {
            let surplus = created - count;
            let mut unredeemed = codes
                .iter()
                .filter(|c| !is_redeemed(c))
                .map(|c| name_of(c))
                .collect::<Vec<_>>();
            unredeemed.sort();
            unredeemed.truncate(surplus);
            for name in &unredeemed {
                match store.delete::<OneTimeAccessCode>(&id.namespace, name).await {
                    Err(error) if !error.is_not_found() => return Err(error.into()),
                    _ => created -= 1,
                }
            }
            if unredeemed.len() < surplus {
                let message = format!(
                    "could not delete enough OTACs: {} of {surplus} surplus codes are redeemed",
                    surplus - unredeemed.len()
                );
                self.ctx
                    .events
                    .publish(
                        NAME,
                        &set,
                        EventType::Warning,
                        reasons::SURPLUS_REDEEMED,
                        message.as_str(),
                    )
                    .await;
                shortfall = Some(message);
            }
        }

        let now = self.ctx.clock.now();
        let created = created as u32;
        let shortfall = shortfall.as_deref();
        retry_on_conflict(|| async move {
            let Some(mut set) = store
                .get_opt::<OneTimeAccessCodeSet>(&id.namespace, &id.name)
                .await?
            else {
                return Ok(());
            };
            let status = set.status.get_or_insert_with(Default::default);
            let mut changed = status.created != created;
            status.created = created;
            changed |= match shortfall {
                Some(message) => set_condition(
                    &mut status.conditions,
                    DESIRED_OTAC_AMOUNT,
                    false,
                    reasons::SURPLUS_REDEEMED,
                    message,
                    now,
                ),
                None => set_condition(
                    &mut status.conditions,
                    DESIRED_OTAC_AMOUNT,
                    true,
                    "DesiredAmountReached",
                    "",
                    now,
                ),
            };
            if changed {
                store.replace_status(&set).await?;
            }
            Ok(())
        })
        .await?;
        Ok(Action::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gargantua_k8s_api::OneTimeAccessCodeSpec;

    #[test]
    fn redemption_follows_label_then_user() {
        let mut code = OneTimeAccessCode::new("c", OneTimeAccessCodeSpec::default());
        assert!(!is_redeemed(&code));

        code.spec.user = "alice".to_string();
        assert!(is_redeemed(&code));

        code.metadata.labels = Some(labels::Map::from([(
            labels::OTAC_REDEEMED.to_string(),
            "false".to_string(),
        )]));
        assert!(!is_redeemed(&code));
    }
}
