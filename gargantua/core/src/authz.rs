/// An authenticated principal.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserInfo {
    pub name: String,
    pub uid: String,
    pub groups: Vec<String>,
}

/// Describes a request against an API resource.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceAttributes {
    pub namespace: String,
    pub api_group: String,
    pub resource: String,
    pub subresource: Option<String>,
    pub name: Option<String>,
}

/// Everything the authorizer needs to know about an inbound request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attributes {
    pub user: UserInfo,
    pub verb: String,
    pub path: String,

    /// Unset for non-resource requests.
    pub resource: Option<ResourceAttributes>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Allow(String),
    Deny(String),
}

// === impl Attributes ===

impl Attributes {
    pub fn resource(
        user: UserInfo,
        verb: impl Into<String>,
        resource: ResourceAttributes,
    ) -> Self {
        let path = match resource.api_group.as_str() {
            "" => format!("/api/v1/namespaces/{}/{}", resource.namespace, resource.resource),
            group => format!(
                "/apis/{group}/namespaces/{}/{}",
                resource.namespace, resource.resource
            ),
        };
        Self {
            user,
            verb: verb.into(),
            path,
            resource: Some(resource),
        }
    }

    pub fn non_resource(user: UserInfo, verb: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            user,
            verb: verb.into(),
            path: path.into(),
            resource: None,
        }
    }
}

// === impl Decision ===

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Allow(reason) | Self::Deny(reason) => reason,
        }
    }
}
