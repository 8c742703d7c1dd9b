use crate::{
    admission::Admission,
    controllers::{
        binder::ClaimBinder, code_roles::CodeRoleReconciler, enqueue::by_label,
        event_gc::EventCollector, otac::OtacSetReconciler, pool::PoolReconciler,
        scheduled_event::ScheduledEventReconciler, temporal::SessionReconciler,
        user_bindings::UserBindingReconciler, ClaimDemand, Config, Context, ControllerMetrics,
        Enqueue, Reconcile, Runner, WorkQueue,
    },
    core::{SharedClock, SystemClock},
    index::{Authorizer, Index, IndexMetrics},
    index_list::IndexList,
    k8s::{
        self, labels, AccessCode, CourseSession, Event, KubeStore, Machine, MachineClaim,
        MachineSet, OneTimeAccessCode, OneTimeAccessCodeSet, ResourceId, ScenarioSession,
        ScheduledEvent, Session, User,
    },
    lease,
};
use anyhow::{bail, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use regex::Regex;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "gargantua", about = "HobbyFarm resource controllers")]
pub struct Args {
    #[clap(long, default_value = "gargantua=info,warn", env = "GARGANTUA_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the admission and authorization webhook server.
    #[clap(long)]
    admission_controller_disabled: bool,

    /// The namespace HobbyFarm resources live in.
    #[clap(long, default_value = "hobbyfarm", env = "NAMESPACE")]
    namespace: String,

    #[clap(long, default_value = "60", env = "EVENT_RETENTION_MINUTES")]
    event_retention_minutes: u64,

    #[clap(long, default_value = "300", env = "CLAIM_TIMEOUT_SECONDS")]
    claim_timeout_seconds: u64,

    /// Consumed by the token issuer; accepted so that one environment configures both.
    #[clap(long, default_value = "43200", env = "USER_TOKEN_EXPIRATION_SECONDS")]
    user_token_expiration_seconds: u64,

    #[clap(long, default_value = "2", env = "CONTROLLER_WORKERS")]
    controller_workers: usize,

    /// Members of this group are granted every request.
    #[clap(long, default_value = "system:masters", env = "SUPERUSER_GROUP")]
    superuser_group: String,

    /// Request paths that are authorized without consulting RBAC.
    #[clap(
        long,
        default_value = "^/healthz$,^/readyz$,^/livez$,^/auth/.*",
        env = "UNPROTECTED_PATHS"
    )]
    unprotected_paths: Regexes,

    #[clap(long, default_value = "gargantua-controllers", env = "LEASE_NAME")]
    lease_name: String,

    /// Identifies this replica as a lease holder.
    #[clap(long, env = "HOSTNAME")]
    hostname: String,

    /// When set, the lease is owned by this deployment.
    #[clap(long, env = "DEPLOYMENT_NAME")]
    deployment_name: Option<String>,
}

#[derive(Clone, Debug)]
struct Regexes(Vec<Regex>);

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            admission_controller_disabled,
            namespace,
            event_retention_minutes,
            claim_timeout_seconds,
            user_token_expiration_seconds,
            controller_workers,
            superuser_group,
            unprotected_paths: Regexes(unprotected_paths),
            lease_name,
            hostname,
            deployment_name,
        } = self;

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };

        // The RBAC index backs the authorizer and the user binding controller.
        let index = Index::shared();

        let mut prom = <Registry>::default();
        let rbac_index = IndexMetrics::register(
            index.clone(),
            prom.sub_registry_with_prefix("rbac_index"),
        )
        .shared();
        let metrics = ControllerMetrics::register(prom.sub_registry_with_prefix("controller"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        info!(
            %namespace,
            event_retention_minutes,
            claim_timeout_seconds,
            user_token_expiration_seconds,
            controller_workers,
            "Starting"
        );

        let claims = lease::init(
            &runtime,
            &namespace,
            &lease_name,
            deployment_name.as_deref(),
            &hostname,
        )
        .await?;
        let leader = lease::leadership(claims, hostname.clone());

        let store = KubeStore::new(runtime.client());
        let clock: SharedClock = Arc::new(SystemClock);
        let ctx = Context::new(
            store.clone(),
            clock,
            Config {
                namespace: namespace.clone(),
                event_retention: Duration::from_secs(event_retention_minutes * 60),
                claim_timeout: Duration::from_secs(claim_timeout_seconds),
                workers: controller_workers,
                instance: hostname,
            },
        );

        // Spawn the RBAC watches.

        let roles = runtime.watch_namespaced::<k8s::Role>(namespace.clone(), watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(rbac_index.clone(), roles).instrument(info_span!("roles")),
        );

        let role_bindings =
            runtime.watch_namespaced::<k8s::RoleBinding>(namespace.clone(), watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(rbac_index.clone(), role_bindings)
                .instrument(info_span!("rolebindings")),
        );

        let cluster_roles = runtime.watch_all::<k8s::ClusterRole>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(rbac_index.clone(), cluster_roles)
                .instrument(info_span!("clusterroles")),
        );

        let cluster_role_bindings =
            runtime.watch_all::<k8s::ClusterRoleBinding>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(rbac_index.clone(), cluster_role_bindings)
                .instrument(info_span!("clusterrolebindings")),
        );

        let groups = runtime.watch_namespaced::<k8s::Group>(namespace.clone(), watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(rbac_index, groups).instrument(info_span!("groups")),
        );

        // Spawn the controller watches. Each watch feeds the queues of the controllers that
        // reconcile the kind or depend on it.

        let pool_queue = WorkQueue::new();
        let binder_queue = WorkQueue::new();
        let event_queue = WorkQueue::new();
        let demand = ClaimDemand::new(pool_queue.clone()).shared();

        let machines = runtime.watch_namespaced::<Machine>(namespace.clone(), watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(
                Enqueue::mapped(pool_queue.clone(), by_label::<Machine>(labels::MACHINE_SET))
                    .shared(),
                machines,
            )
            .instrument(info_span!("machines")),
        );

        let machine_sets = runtime.watch_namespaced::<MachineSet>(namespace.clone(), watcher::Config::default());
        let machine_sets_indexes =
            IndexList::new(Enqueue::<MachineSet>::new(pool_queue.clone()).shared())
                .push(
                    Enqueue::mapped(
                        event_queue.clone(),
                        by_label::<MachineSet>(labels::SCHEDULED_EVENT),
                    )
                    .shared(),
                )
                .push(demand.clone())
                .shared();
        tokio::spawn(
            kubert::index::namespaced(machine_sets_indexes, machine_sets)
                .instrument(info_span!("machinesets")),
        );

        let machine_claims = runtime.watch_namespaced::<MachineClaim>(namespace.clone(), watcher::Config::default());
        let machine_claims_indexes =
            IndexList::new(Enqueue::<MachineClaim>::new(binder_queue.clone()).shared())
                .push(demand)
                .shared();
        tokio::spawn(
            kubert::index::namespaced(machine_claims_indexes, machine_claims)
                .instrument(info_span!("machineclaims")),
        );

        let scheduled_events =
            runtime.watch_namespaced::<ScheduledEvent>(namespace.clone(), watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(
                Enqueue::<ScheduledEvent>::new(event_queue.clone()).shared(),
                scheduled_events,
            )
            .instrument(info_span!("scheduledevents")),
        );

        let session_queue = watch_queue::<Session, _>(&mut runtime, &namespace, "sessions");
        let course_session_queue =
            watch_queue::<CourseSession, _>(&mut runtime, &namespace, "coursesessions");
        let scenario_session_queue =
            watch_queue::<ScenarioSession, _>(&mut runtime, &namespace, "scenariosessions");
        let access_code_queue =
            watch_queue::<AccessCode, _>(&mut runtime, &namespace, "accesscodes");
        let user_queue = watch_queue::<User, _>(&mut runtime, &namespace, "users");
        let gc_queue = watch_queue::<Event, _>(&mut runtime, &namespace, "events");

        let otac_role_queue = WorkQueue::new();
        let otac_set_queue = WorkQueue::new();
        let otacs = runtime.watch_namespaced::<OneTimeAccessCode>(namespace.clone(), watcher::Config::default());
        let otacs_indexes =
            IndexList::new(Enqueue::<OneTimeAccessCode>::new(otac_role_queue.clone()).shared())
                .push(
                    Enqueue::mapped(
                        otac_set_queue.clone(),
                        by_label::<OneTimeAccessCode>(labels::OTAC_SET),
                    )
                    .shared(),
                )
                .shared();
        tokio::spawn(
            kubert::index::namespaced(otacs_indexes, otacs)
                .instrument(info_span!("onetimeaccesscodes")),
        );

        let otac_sets =
            runtime.watch_namespaced::<OneTimeAccessCodeSet>(namespace.clone(), watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(
                Enqueue::<OneTimeAccessCodeSet>::new(otac_set_queue.clone()).shared(),
                otac_sets,
            )
            .instrument(info_span!("onetimeaccesscodesets")),
        );

        // Spawn the controllers. Each processes its queue only while this replica leads.

        let drain = runtime.shutdown_handle();
        let controller = Controller {
            leader: &leader,
            metrics: &metrics,
            workers: controller_workers,
            drain: &drain,
        };
        controller.spawn(PoolReconciler::new(ctx.clone()), pool_queue);
        controller.spawn(ClaimBinder::new(ctx.clone()), binder_queue);
        controller.spawn(ScheduledEventReconciler::new(ctx.clone()), event_queue);
        controller.spawn(
            SessionReconciler::<_, Session>::new(ctx.clone()),
            session_queue,
        );
        controller.spawn(
            SessionReconciler::<_, CourseSession>::new(ctx.clone()),
            course_session_queue,
        );
        controller.spawn(
            SessionReconciler::<_, ScenarioSession>::new(ctx.clone()),
            scenario_session_queue,
        );
        controller.spawn(
            CodeRoleReconciler::<_, AccessCode>::new(ctx.clone()),
            access_code_queue,
        );
        controller.spawn(
            CodeRoleReconciler::<_, OneTimeAccessCode>::new(ctx.clone()),
            otac_role_queue,
        );
        controller.spawn(OtacSetReconciler::new(ctx.clone()), otac_set_queue);
        controller.spawn(EventCollector::new(ctx.clone()), gc_queue);

        // User bindings are computed from the RBAC index, so they wait for it to sync.
        let synced = index.read().synced();
        controller.spawn_when(
            UserBindingReconciler::new(ctx, index.clone()),
            user_queue,
            synced,
        );

        let authorizer = Authorizer::new(index, unprotected_paths, superuser_group);
        let admission = Admission::new(store, authorizer);
        let runtime = runtime.spawn_server(move || admission.clone());

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

/// Watches `K` in `namespace`, enqueueing each object by its own key.
fn watch_queue<K, S: 'static>(
    runtime: &mut kubert::Runtime<S>,
    namespace: &str,
    span: &'static str,
) -> WorkQueue<ResourceId>
where
    K: kube::Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + std::fmt::Debug
        + serde::de::DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    let queue = WorkQueue::new();
    let objects = runtime.watch_namespaced::<K>(namespace.to_string(), watcher::Config::default());
    tokio::spawn(
        kubert::index::namespaced(Enqueue::<K>::new(queue.clone()).shared(), objects)
            .instrument(info_span!("watch", kind = span)),
    );
    queue
}

/// Spawns leader-gated controllers that share metrics and a shutdown signal.
struct Controller<'a> {
    leader: &'a watch::Receiver<bool>,
    metrics: &'a ControllerMetrics,
    workers: usize,
    drain: &'a drain::Watch,
}

// === impl Controller ===

impl Controller<'_> {
    fn runner<R: Reconcile>(&self, reconciler: R, queue: WorkQueue<ResourceId>) -> Runner<R> {
        Runner::new(
            reconciler,
            queue,
            self.leader.clone(),
            self.metrics.clone(),
        )
        .with_workers(self.workers)
    }

    fn spawn<R: Reconcile>(&self, reconciler: R, queue: WorkQueue<ResourceId>) {
        let span = info_span!("controller", name = %reconciler.name());
        let runner = self.runner(reconciler, queue);
        tokio::spawn(runner.run(self.drain.clone()).instrument(span));
    }

    /// Spawns a controller that waits for `synced` before processing keys.
    fn spawn_when<R: Reconcile>(
        &self,
        reconciler: R,
        queue: WorkQueue<ResourceId>,
        synced: watch::Receiver<bool>,
    ) {
        let span = info_span!("controller", name = %reconciler.name());
        let runner = self.runner(reconciler, queue).wait_for(synced);
        tokio::spawn(runner.run(self.drain.clone()).instrument(span));
    }
}

// === impl Regexes ===

impl std::str::FromStr for Regexes {
    type Err = regex::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Regex::new)
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unprotected_paths() {
        let Regexes(paths) = "^/healthz$, ^/auth/.*,".parse().unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths[1].is_match("/auth/login"));
        assert!("^/(".parse::<Regexes>().is_err());
    }
}
