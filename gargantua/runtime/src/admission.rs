use super::validation;
use crate::{
    core::{Attributes, ResourceAttributes, UserInfo},
    index::Authorizer,
    k8s::{
        store::Store, AccessCode, AccessCodeSpec, Course, Environment, EnvironmentSpec, KubeStore,
        ListParams, MachineSet, MachineSetSpec, OneTimeAccessCode, OneTimeAccessCodeSet,
        OneTimeAccessCodeSetSpec, OneTimeAccessCodeSpec, Provider, ProviderSpec, Scenario,
        ScheduledEvent, ScheduledEventSpec,
    },
};
use anyhow::{anyhow, bail, Result};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use k8s_openapi::api::authorization::v1::{SubjectAccessReview, SubjectAccessReviewStatus};
use kube::{
    core::{admission::Operation, DynamicObject},
    Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Serves the validating webhook on `/` and the authorization webhook on `/authorize`.
#[derive(Clone)]
pub struct Admission<S = KubeStore> {
    store: S,
    authorizer: Authorizer,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type Review = kube::core::admission::AdmissionReview<DynamicObject>;
type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;

#[async_trait::async_trait]
trait Validate<T> {
    async fn validate(self, ns: &str, name: &str, spec: T) -> Result<()>;
}

type Body = http_body_util::Full<bytes::Bytes>;

// === impl Admission ===

impl<S: Store> tower::Service<Request<hyper::body::Incoming>> for Admission<S> {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        if req.method() != http::Method::POST {
            return Box::pin(future::ok(empty(http::StatusCode::NOT_FOUND)));
        }

        let admission = self.clone();
        match req.uri().path() {
            "/" => Box::pin(async move {
                let bytes = req.into_body().collect().await?.to_bytes();
                let review: Review = match serde_json::from_slice(&bytes) {
                    Ok(review) => review,
                    Err(error) => {
                        warn!(%error, "Failed to parse request body");
                        return json_response(&AdmissionResponse::invalid(error).into_review());
                    }
                };
                trace!(?review);

                let rsp = match review.try_into() {
                    Ok(req) => {
                        debug!(?req);
                        admission.admit(req).await
                    }
                    Err(error) => {
                        warn!(%error, "Invalid admission request");
                        AdmissionResponse::invalid(error)
                    }
                };
                debug!(?rsp);
                json_response(&rsp.into_review())
            }),

            "/authorize" => Box::pin(async move {
                let bytes = req.into_body().collect().await?.to_bytes();
                let review: SubjectAccessReview = match serde_json::from_slice(&bytes) {
                    Ok(review) => review,
                    Err(error) => {
                        warn!(%error, "Failed to parse subject access review");
                        return Ok(empty(http::StatusCode::BAD_REQUEST));
                    }
                };
                json_response(&admission.authorize(review))
            }),

            _ => Box::pin(future::ok(empty(http::StatusCode::NOT_FOUND))),
        }
    }
}

impl<S: Store> Admission<S> {
    pub fn new(store: S, authorizer: Authorizer) -> Self {
        Self { store, authorizer }
    }

    async fn admit(self, req: AdmissionRequest) -> AdmissionResponse {
        if req.operation == Operation::Delete {
            return self.admit_delete(req).await;
        }

        if is_kind::<AccessCode>(&req) {
            return self.admit_spec::<AccessCodeSpec>(req).await;
        }

        if is_kind::<OneTimeAccessCode>(&req) {
            return self.admit_spec::<OneTimeAccessCodeSpec>(req).await;
        }

        if is_kind::<OneTimeAccessCodeSet>(&req) {
            return self.admit_spec::<OneTimeAccessCodeSetSpec>(req).await;
        }

        if is_kind::<ScheduledEvent>(&req) {
            return self.admit_spec::<ScheduledEventSpec>(req).await;
        }

        if is_kind::<MachineSet>(&req) {
            return self.admit_spec::<MachineSetSpec>(req).await;
        }

        if is_kind::<Provider>(&req) {
            return self.admit_spec::<ProviderSpec>(req).await;
        }

        if is_kind::<Environment>(&req) {
            return self.admit_spec::<EnvironmentSpec>(req).await;
        }

        AdmissionResponse::invalid(format_args!(
            "unsupported resource type: {}.{}.{}",
            req.kind.group, req.kind.version, req.kind.kind
        ))
    }

    async fn admit_spec<T>(self, req: AdmissionRequest) -> AdmissionResponse
    where
        T: DeserializeOwned,
        Self: Validate<T>,
    {
        let rsp = AdmissionResponse::from(&req);

        let kind = req.kind.kind.clone();
        let (obj, spec) = match parse_spec::<T>(req) {
            Ok(spec) => spec,
            Err(error) => {
                info!(%error, "Failed to parse {} spec", kind);
                return rsp.deny(error);
            }
        };

        let ns = obj.namespace().unwrap_or_default();
        let name = obj.name_any();

        if let Err(error) = self.validate(&ns, &name, spec).await {
            info!(%error, %ns, %name, %kind, "Denied");
            return rsp.deny(error);
        }

        rsp
    }

    /// Scenarios and courses may not be deleted while other resources reference them.
    async fn admit_delete(self, req: AdmissionRequest) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(&req);
        let ns = req.namespace.clone().unwrap_or_default();
        let name = req.name.clone();

        let referrers = if is_kind::<Scenario>(&req) {
            self.scenario_referrers(&ns, &name).await
        } else if is_kind::<Course>(&req) {
            self.course_referrers(&ns, &name).await
        } else {
            return rsp;
        };

        match referrers {
            Ok(referrers) if referrers.is_empty() => rsp,
            Ok(referrers) => {
                let kind = req.kind.kind.to_lowercase();
                info!(%ns, %name, %kind, ?referrers, "Denied deletion");
                rsp.deny(format_args!(
                    "{kind} {name} is referenced by {}",
                    referrers.join(", ")
                ))
            }
            Err(error) => {
                warn!(%error, %ns, %name, "Failed to look up references");
                rsp.deny(error)
            }
        }
    }

    async fn scenario_referrers(&self, ns: &str, name: &str) -> Result<Vec<String>> {
        let params = ListParams::default();
        let mut referrers = self
            .store
            .list::<Course>(ns, &params)
            .await?
            .into_iter()
            .filter(|c| c.spec.scenarios.iter().any(|s| s == name))
            .map(|c| format!("Course/{}", c.name_any()))
            .collect::<Vec<_>>();
        referrers.extend(
            self.store
                .list::<ScheduledEvent>(ns, &params)
                .await?
                .into_iter()
                .filter(|e| e.spec.scenarios.iter().any(|s| s == name))
                .map(|e| format!("ScheduledEvent/{}", e.name_any())),
        );
        Ok(referrers)
    }

    async fn course_referrers(&self, ns: &str, name: &str) -> Result<Vec<String>> {
        let referrers = self
            .store
            .list::<ScheduledEvent>(ns, &ListParams::default())
            .await?
            .into_iter()
            .filter(|e| e.spec.courses.iter().any(|c| c == name))
            .map(|e| format!("ScheduledEvent/{}", e.name_any()))
            .collect();
        Ok(referrers)
    }

    /// Answers a `SubjectAccessReview` with the authorizer's decision.
    pub fn authorize(&self, mut review: SubjectAccessReview) -> SubjectAccessReview {
        let spec = &review.spec;
        let user = UserInfo {
            name: spec.user.clone().unwrap_or_default(),
            uid: spec.uid.clone().unwrap_or_default(),
            groups: spec.groups.clone().unwrap_or_default(),
        };

        let attrs = match (&spec.resource_attributes, &spec.non_resource_attributes) {
            (Some(resource), _) => Attributes::resource(
                user,
                resource.verb.clone().unwrap_or_default(),
                ResourceAttributes {
                    namespace: resource.namespace.clone().unwrap_or_default(),
                    api_group: resource.group.clone().unwrap_or_default(),
                    resource: resource.resource.clone().unwrap_or_default(),
                    subresource: resource.subresource.clone().filter(|s| !s.is_empty()),
                    name: resource.name.clone().filter(|n| !n.is_empty()),
                },
            ),
            (None, Some(non_resource)) => Attributes::non_resource(
                user,
                non_resource.verb.clone().unwrap_or_default(),
                non_resource.path.clone().unwrap_or_default(),
            ),
            (None, None) => {
                review.status = Some(SubjectAccessReviewStatus {
                    allowed: false,
                    denied: Some(true),
                    evaluation_error: Some(
                        "review must set resourceAttributes or nonResourceAttributes".to_string(),
                    ),
                    reason: None,
                });
                return review;
            }
        };

        let decision = self.authorizer.authorize(&attrs);
        debug!(user = %attrs.user.name, verb = %attrs.verb, path = %attrs.path, ?decision);
        review.status = Some(SubjectAccessReviewStatus {
            allowed: decision.is_allowed(),
            denied: Some(!decision.is_allowed()),
            evaluation_error: None,
            reason: Some(decision.reason().to_string()),
        });
        review
    }
}

fn is_kind<T>(req: &AdmissionRequest) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    req.kind.group.eq_ignore_ascii_case(&T::group(&dt))
        && req.kind.kind.eq_ignore_ascii_case(&T::kind(&dt))
}

fn empty(status: http::StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::default())
        .expect("empty response must be valid")
}

fn json_response<T: serde::Serialize>(rsp: &T) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(rsp)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("json response must be valid"))
}

fn parse_spec<T: DeserializeOwned>(req: AdmissionRequest) -> Result<(DynamicObject, T)> {
    let obj = req
        .object
        .ok_or_else(|| anyhow!("admission request missing 'object"))?;

    let spec = {
        let data = obj
            .data
            .get("spec")
            .cloned()
            .ok_or_else(|| anyhow!("admission request missing 'spec'"))?;
        serde_json::from_value(data)?
    };

    Ok((obj, spec))
}

#[async_trait::async_trait]
impl<S: Store> Validate<AccessCodeSpec> for Admission<S> {
    async fn validate(self, _ns: &str, _name: &str, spec: AccessCodeSpec) -> Result<()> {
        validation::access_code(&spec).into_result()?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl<S: Store> Validate<OneTimeAccessCodeSpec> for Admission<S> {
    async fn validate(self, _ns: &str, _name: &str, spec: OneTimeAccessCodeSpec) -> Result<()> {
        validation::otac(&spec).into_result()?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl<S: Store> Validate<OneTimeAccessCodeSetSpec> for Admission<S> {
    async fn validate(
        self,
        _ns: &str,
        _name: &str,
        spec: OneTimeAccessCodeSetSpec,
    ) -> Result<()> {
        validation::otac_set(&spec).into_result()?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl<S: Store> Validate<ScheduledEventSpec> for Admission<S> {
    async fn validate(self, _ns: &str, _name: &str, spec: ScheduledEventSpec) -> Result<()> {
        validation::scheduled_event(&spec).into_result()?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl<S: Store> Validate<MachineSetSpec> for Admission<S> {
    async fn validate(self, _ns: &str, _name: &str, spec: MachineSetSpec) -> Result<()> {
        validation::machine_set(&spec).into_result()?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl<S: Store> Validate<ProviderSpec> for Admission<S> {
    async fn validate(self, _ns: &str, _name: &str, spec: ProviderSpec) -> Result<()> {
        validation::provider(&spec).into_result()?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl<S: Store> Validate<EnvironmentSpec> for Admission<S> {
    async fn validate(self, ns: &str, _name: &str, spec: EnvironmentSpec) -> Result<()> {
        if spec.provider.is_empty() {
            bail!("spec.provider: required value is missing");
        }
        let provider = self.store.get_opt::<Provider>(ns, &spec.provider).await?;
        validation::environment(&spec, provider.as_ref().map(|p| &p.spec)).into_result()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::{
            property::{Property, PropertyDef, StringValidation},
            SystemClock,
        },
        index::Index,
        k8s::{
            CourseSpec, MemoryStore, ObjectMeta, PolicyRule, Role, RoleBinding, RoleRef,
            Subject, RBAC_API_GROUP,
        },
    };
    use k8s_openapi::api::authorization::v1::{
        NonResourceAttributes, ResourceAttributes as SarResourceAttributes,
        SubjectAccessReviewSpec,
    };
    use kubert::index::IndexNamespacedResource;
    use maplit::btreemap;
    use regex::Regex;
    use serde_json::json;
    use std::sync::Arc;

    fn admission() -> (Admission<MemoryStore>, MemoryStore, crate::index::SharedIndex) {
        let store = MemoryStore::new(Arc::new(SystemClock::default()));
        let index = Index::shared();
        let authorizer = Authorizer::new(
            index.clone(),
            vec![Regex::new("^/healthz$").unwrap()],
            "system:masters",
        );
        (Admission::new(store.clone(), authorizer), store, index)
    }

    fn request(operation: &str, kind: &str, name: &str, spec: serde_json::Value) -> AdmissionRequest {
        let object = json!({
            "apiVersion": "hobbyfarm.io/v1",
            "kind": kind,
            "metadata": { "name": name, "namespace": "hf" },
            "spec": spec,
        });
        let (object, old_object) = match operation {
            "DELETE" => (serde_json::Value::Null, object),
            _ => (object, serde_json::Value::Null),
        };
        let review: Review = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "4d2c1b4e-0000-0000-0000-000000000000",
                "kind": { "group": "hobbyfarm.io", "version": "v1", "kind": kind },
                "resource": {
                    "group": "hobbyfarm.io",
                    "version": "v1",
                    "resource": format!("{}s", kind.to_lowercase()),
                },
                "name": name,
                "namespace": "hf",
                "operation": operation,
                "userInfo": {},
                "object": object,
                "oldObject": old_object,
                "dryRun": false,
            },
        }))
        .expect("review must parse");
        review.try_into().expect("review must carry a request")
    }

    #[tokio::test]
    async fn rejects_inverted_access_code_windows() {
        let (admission, _, _) = admission();
        let rsp = admission
            .clone()
            .admit(request(
                "CREATE",
                "AccessCode",
                "ac",
                json!({
                    "notBefore": "2024-05-02T00:00:00Z",
                    "notAfter": "2024-05-01T00:00:00Z",
                }),
            ))
            .await;
        assert!(!rsp.allowed);
        assert!(rsp.result.message.contains("spec.notAfter"));

        let rsp = admission
            .admit(request(
                "CREATE",
                "AccessCode",
                "ac",
                json!({ "scenarios": ["s1"] }),
            ))
            .await;
        assert!(rsp.allowed);
    }

    #[tokio::test]
    async fn rejects_malformed_specs() {
        let (admission, _, _) = admission();
        let rsp = admission
            .admit(request(
                "CREATE",
                "MachineSet",
                "ms",
                json!({ "minAvailable": "many" }),
            ))
            .await;
        assert!(!rsp.allowed);
    }

    #[tokio::test]
    async fn environments_are_checked_against_their_provider() {
        let (admission, store, _) = admission();
        let string = Property::String(PropertyDef::<StringValidation>::default());
        store
            .create(
                "hf",
                &Provider {
                    metadata: ObjectMeta {
                        name: Some("aws".to_string()),
                        namespace: Some("hf".to_string()),
                        ..Default::default()
                    },
                    spec: ProviderSpec {
                        provider_configuration: btreemap! { "region".to_string() => string.clone() },
                        machine_information: btreemap! {
                            "primary_address".to_string() => string,
                        },
                    },
                },
            )
            .await
            .unwrap();

        let rsp = admission
            .clone()
            .admit(request(
                "CREATE",
                "Environment",
                "env1",
                json!({ "provider": "aws", "providerConfiguration": { "region": "us-east-1" } }),
            ))
            .await;
        assert!(rsp.allowed);

        let rsp = admission
            .clone()
            .admit(request(
                "CREATE",
                "Environment",
                "env1",
                json!({ "provider": "aws", "providerConfiguration": { "zone": "a" } }),
            ))
            .await;
        assert!(!rsp.allowed);
        assert!(rsp.result.message.contains("spec.providerConfiguration.zone"));

        let rsp = admission
            .admit(request(
                "CREATE",
                "Environment",
                "env2",
                json!({ "provider": "gcp" }),
            ))
            .await;
        assert!(!rsp.allowed);
    }

    #[tokio::test]
    async fn referenced_scenarios_cannot_be_deleted() {
        let (admission, store, _) = admission();
        store
            .create(
                "hf",
                &Course {
                    metadata: ObjectMeta {
                        name: Some("c1".to_string()),
                        namespace: Some("hf".to_string()),
                        ..Default::default()
                    },
                    spec: CourseSpec {
                        scenarios: vec!["s1".to_string()],
                        ..Default::default()
                    },
                },
            )
            .await
            .unwrap();

        let rsp = admission
            .clone()
            .admit(request("DELETE", "Scenario", "s1", json!({})))
            .await;
        assert!(!rsp.allowed);
        assert!(rsp.result.message.contains("Course/c1"));

        let rsp = admission
            .clone()
            .admit(request("DELETE", "Scenario", "s2", json!({})))
            .await;
        assert!(rsp.allowed);

        let rsp = admission
            .admit(request("DELETE", "Course", "c1", json!({})))
            .await;
        assert!(rsp.allowed);
    }

    fn review(user: &str, groups: &[&str]) -> SubjectAccessReview {
        SubjectAccessReview {
            metadata: Default::default(),
            spec: SubjectAccessReviewSpec {
                user: Some(user.to_string()),
                groups: Some(groups.iter().map(|g| g.to_string()).collect()),
                resource_attributes: Some(SarResourceAttributes {
                    namespace: Some("hf".to_string()),
                    group: Some("hobbyfarm.io".to_string()),
                    resource: Some("scenarios".to_string()),
                    verb: Some("get".to_string()),
                    name: Some("s1".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            status: None,
        }
    }

    #[test]
    fn authorizes_subject_access_reviews() {
        let (admission, _, index) = admission();

        let status = admission.authorize(review("alice", &[])).status.unwrap();
        assert!(!status.allowed);
        assert_eq!(status.denied, Some(true));

        let status = admission
            .authorize(review("root", &["system:masters"]))
            .status
            .unwrap();
        assert!(status.allowed);

        IndexNamespacedResource::<Role>::apply(
            &mut *index.write(),
            Role {
                metadata: ObjectMeta {
                    name: Some("reader".to_string()),
                    namespace: Some("hf".to_string()),
                    ..Default::default()
                },
                rules: Some(vec![PolicyRule {
                    api_groups: Some(vec!["hobbyfarm.io".to_string()]),
                    resources: Some(vec!["scenarios".to_string()]),
                    verbs: vec!["get".to_string()],
                    ..Default::default()
                }]),
            },
        );
        IndexNamespacedResource::<RoleBinding>::apply(
            &mut *index.write(),
            RoleBinding {
                metadata: ObjectMeta {
                    name: Some("alice-reader".to_string()),
                    namespace: Some("hf".to_string()),
                    ..Default::default()
                },
                role_ref: RoleRef {
                    api_group: RBAC_API_GROUP.to_string(),
                    kind: "Role".to_string(),
                    name: "reader".to_string(),
                },
                subjects: Some(vec![Subject {
                    api_group: Some(RBAC_API_GROUP.to_string()),
                    kind: "User".to_string(),
                    name: "alice".to_string(),
                    namespace: None,
                }]),
            },
        );
        let status = admission.authorize(review("alice", &[])).status.unwrap();
        assert!(status.allowed);
    }

    #[test]
    fn unprotected_paths_are_allowed() {
        let (admission, _, _) = admission();
        let mut sar = review("anonymous", &[]);
        sar.spec.resource_attributes = None;
        sar.spec.non_resource_attributes = Some(NonResourceAttributes {
            path: Some("/healthz".to_string()),
            verb: Some("get".to_string()),
        });
        assert!(admission.authorize(sar.clone()).status.unwrap().allowed);

        sar.spec.non_resource_attributes = None;
        let status = admission.authorize(sar).status.unwrap();
        assert!(!status.allowed);
        assert!(status.evaluation_error.is_some());
    }
}
