//! Machine-pool sizing and claim candidate ranking.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How a machine set decides how many machines to keep provisioned.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ProvisioningStrategy {
    /// Keep `minAvailable` unclaimed machines on top of the claimed ones.
    #[default]
    AutoScale,

    /// Provision only for claims; `minAvailable` is ignored.
    OnDemand,
}

/// How a claim selects among eligible machines.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum BindStrategy {
    #[default]
    Any,
    PreferMachineSets,
    RequireMachineSets,
}

/// Observed demand on a machine set.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Demand {
    /// Machines with an active binding.
    pub claimed: u32,

    /// Claims that are waiting for a machine this set could provide.
    pub pending: u32,
}

/// Computes the number of machines a set should have provisioned.
///
/// Auto-scaled sets keep `min_available` spare machines on top of the claimed ones. On-demand
/// sets provision only for claimed and pending machines.
pub fn target_count(
    strategy: ProvisioningStrategy,
    demand: Demand,
    min_available: u32,
    max_provisioned: u32,
) -> u32 {
    let wanted = match strategy {
        ProvisioningStrategy::AutoScale => demand.claimed.saturating_add(min_available),
        ProvisioningStrategy::OnDemand => demand.claimed.saturating_add(demand.pending),
    };
    wanted.min(max_provisioned)
}

/// Orders bind candidates by name, applying the claim's set preference.
///
/// `describe` returns a candidate's `(name, machine set)`. With `PreferMachineSets`, candidates
/// in the listed sets come first; with `RequireMachineSets`, all others are dropped.
pub fn rank_candidates<T, F>(
    strategy: BindStrategy,
    sets: &[String],
    mut candidates: Vec<T>,
    describe: F,
) -> Vec<T>
where
    F: for<'a> Fn(&'a T) -> (&'a str, &'a str),
{
    let listed = |c: &T| {
        let (_, set) = describe(c);
        sets.iter().any(|s| s == set)
    };

    match strategy {
        BindStrategy::Any => {
            candidates.sort_by(|a, b| describe(a).0.cmp(describe(b).0));
        }
        BindStrategy::PreferMachineSets => {
            candidates.sort_by(|a, b| {
                listed(b)
                    .cmp(&listed(a))
                    .then_with(|| describe(a).0.cmp(describe(b).0))
            });
        }
        BindStrategy::RequireMachineSets => {
            candidates.retain(|c| listed(c));
            candidates.sort_by(|a, b| describe(a).0.cmp(describe(b).0));
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_scale_keeps_spares() {
        let demand = Demand {
            claimed: 1,
            pending: 4,
        };
        assert_eq!(target_count(ProvisioningStrategy::AutoScale, demand, 3, 10), 4);
        assert_eq!(target_count(ProvisioningStrategy::AutoScale, demand, 3, 2), 2);
        assert_eq!(
            target_count(ProvisioningStrategy::AutoScale, Demand::default(), 3, 10),
            3
        );
    }

    #[test]
    fn on_demand_ignores_min_available() {
        let demand = Demand {
            claimed: 1,
            pending: 2,
        };
        assert_eq!(target_count(ProvisioningStrategy::OnDemand, demand, 5, 10), 3);
        assert_eq!(target_count(ProvisioningStrategy::OnDemand, demand, 5, 2), 2);
        assert_eq!(
            target_count(ProvisioningStrategy::OnDemand, Demand::default(), 5, 10),
            0
        );
    }

    fn candidates() -> Vec<(String, String)> {
        vec![
            ("m-c".to_string(), "set-b".to_string()),
            ("m-a".to_string(), "set-a".to_string()),
            ("m-b".to_string(), "set-b".to_string()),
        ]
    }

    fn names(ranked: Vec<(String, String)>) -> Vec<String> {
        ranked.into_iter().map(|(name, _)| name).collect()
    }

    fn describe(c: &(String, String)) -> (&str, &str) {
        (&c.0, &c.1)
    }

    #[test]
    fn ranks_by_strategy() {
        let sets = vec!["set-b".to_string()];

        assert_eq!(
            names(rank_candidates(BindStrategy::Any, &sets, candidates(), describe)),
            vec!["m-a", "m-b", "m-c"]
        );
        assert_eq!(
            names(rank_candidates(
                BindStrategy::PreferMachineSets,
                &sets,
                candidates(),
                describe
            )),
            vec!["m-b", "m-c", "m-a"]
        );
        assert_eq!(
            names(rank_candidates(
                BindStrategy::RequireMachineSets,
                &sets,
                candidates(),
                describe
            )),
            vec!["m-b", "m-c"]
        );
        assert!(rank_candidates(
            BindStrategy::RequireMachineSets,
            &["set-z".to_string()],
            candidates(),
            describe
        )
        .is_empty());
    }
}
