use crate::{index::SubjectKind, SharedIndex};
use gargantua_core::{Attributes, Decision};
use regex::Regex;

/// Evaluates requests against the RBAC index.
#[derive(Clone, Debug)]
pub struct Authorizer {
    index: SharedIndex,
    unprotected: Vec<Regex>,
    superuser_group: String,
}

// === impl Authorizer ===

impl Authorizer {
    pub fn new(
        index: SharedIndex,
        unprotected: Vec<Regex>,
        superuser_group: impl Into<String>,
    ) -> Self {
        Self {
            index,
            unprotected,
            superuser_group: superuser_group.into(),
        }
    }

    pub fn authorize(&self, attrs: &Attributes) -> Decision {
        if let Some(re) = self.unprotected.iter().find(|re| re.is_match(&attrs.path)) {
            return Decision::Allow(format!("path matches unprotected pattern {}", re.as_str()));
        }

        if attrs.user.groups.iter().any(|g| *g == self.superuser_group) {
            return Decision::Allow(format!("member of {}", self.superuser_group));
        }

        let index = self.index.read();
        let mut subjects = vec![(SubjectKind::User, attrs.user.name.clone())];
        subjects.extend(
            attrs
                .user
                .groups
                .iter()
                .cloned()
                .chain(index.groups_for(&attrs.user.name))
                .map(|g| (SubjectKind::Group, g)),
        );
        subjects.dedup();

        match index.find_grant(&subjects, attrs) {
            Some(reason) => Decision::Allow(reason),
            None => {
                tracing::debug!(user = %attrs.user.name, verb = %attrs.verb, path = %attrs.path, "Denied");
                Decision::Deny(format!(
                    "no rule permits {} {} for {}",
                    attrs.verb, attrs.path, attrs.user.name
                ))
            }
        }
    }
}
