use crate::{metrics::ControllerMetrics, queue::WorkQueue, Result};
use futures::future;
use gargantua_k8s_api::ResourceId;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

/// Drives one resource kind toward its desired state.
#[async_trait::async_trait]
pub trait Reconcile: Send + Sync + 'static {
    /// Names the controller in logs, metrics and events.
    fn name(&self) -> &str;

    async fn reconcile(&self, id: &ResourceId) -> Result<Action>;
}

/// What to do with a key once it has been reconciled.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Done,
    RequeueAfter(Duration),
}

/// Runs a reconciler's workers against its queue.
///
/// Workers wait until every cache the reconciler reads has synced and only process keys while
/// this replica holds the leader lease. Keys added while another replica leads stay queued.
pub struct Runner<R> {
    reconciler: Arc<R>,
    queue: WorkQueue<ResourceId>,
    workers: usize,
    synced: Vec<watch::Receiver<bool>>,
    leader: watch::Receiver<bool>,
    metrics: ControllerMetrics,
}

// === impl Runner ===

impl<R: Reconcile> Runner<R> {
    pub fn new(
        reconciler: R,
        queue: WorkQueue<ResourceId>,
        leader: watch::Receiver<bool>,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
            queue,
            workers: 1,
            synced: Vec::new(),
            leader,
            metrics,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Delays processing until `synced` reports true.
    pub fn wait_for(mut self, synced: watch::Receiver<bool>) -> Self {
        self.synced.push(synced);
        self
    }

    /// Processes keys until `drain` is signaled, then finishes in-flight reconciliations.
    pub async fn run(self, drain: drain::Watch) {
        let Self {
            reconciler,
            queue,
            workers,
            synced,
            leader,
            metrics,
        } = self;

        let workers = future::join_all((0..workers).map(|i| {
            let worker = Worker {
                reconciler: reconciler.clone(),
                queue: queue.clone(),
                synced: synced.clone(),
                leader: leader.clone(),
                metrics: metrics.clone(),
            };
            worker.run().instrument(info_span!("worker", id = i))
        }));
        tokio::pin!(workers);

        tokio::select! {
            _ = &mut workers => {}
            handle = drain.signaled() => {
                debug!("Shutting down");
                queue.shut_down();
                handle.release_after(workers).await;
            }
        }
    }
}

struct Worker<R> {
    reconciler: Arc<R>,
    queue: WorkQueue<ResourceId>,
    synced: Vec<watch::Receiver<bool>>,
    leader: watch::Receiver<bool>,
    metrics: ControllerMetrics,
}

// === impl Worker ===

impl<R: Reconcile> Worker<R> {
    async fn run(mut self) {
        let synced = tokio::select! {
            synced = wait_all(&mut self.synced) => synced,
            _ = self.queue.closed() => return,
        };
        if !synced {
            warn!("Cache sync signal lost");
            return;
        }

        loop {
            let leading = tokio::select! {
                leading = wait_true(&mut self.leader) => leading,
                _ = self.queue.closed() => true,
            };
            if !leading {
                warn!("Leadership signal lost");
                return;
            }

            let Some(id) = self.queue.get().await else {
                return;
            };
            if !*self.leader.borrow() && !self.queue.is_shutting_down() {
                self.queue.done(&id);
                self.queue.add(id);
                continue;
            }

            self.process(&id).await;
            self.queue.done(&id);
        }
    }

    async fn process(&self, id: &ResourceId) {
        let name = self.reconciler.name();
        self.metrics.reconciled(name);

        let result = self
            .reconciler
            .reconcile(id)
            .instrument(info_span!("reconcile", %id))
            .await;
        match result {
            Ok(Action::Done) => {
                self.queue.forget(id);
            }
            Ok(Action::RequeueAfter(delay)) => {
                debug!(%id, ?delay, "Requeueing");
                self.metrics.requeued(name);
                self.queue.forget(id);
                self.queue.add_after(id.clone(), delay);
            }
            Err(error) if error.is_transient() => {
                warn!(%id, %error, "Reconcile failed; retrying");
                self.metrics.failed(name, true);
                self.queue.add_rate_limited(id.clone());
            }
            Err(error) => {
                info!(%id, %error, "Reconcile failed");
                self.metrics.failed(name, false);
                self.queue.forget(id);
            }
        }
    }
}

async fn wait_true(rx: &mut watch::Receiver<bool>) -> bool {
    rx.wait_for(|v| *v).await.is_ok()
}

async fn wait_all(rxs: &mut [watch::Receiver<bool>]) -> bool {
    for rx in rxs {
        if !wait_true(rx).await {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use gargantua_k8s_api::store;
    use parking_lot::Mutex;
    use tokio::{sync::mpsc, time};

    struct Scripted {
        results: Mutex<Vec<Result<Action>>>,
        seen: mpsc::UnboundedSender<ResourceId>,
    }

    #[async_trait::async_trait]
    impl Reconcile for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn reconcile(&self, id: &ResourceId) -> Result<Action> {
            let _ = self.seen.send(id.clone());
            let mut results = self.results.lock();
            if results.is_empty() {
                return Ok(Action::Done);
            }
            results.remove(0)
        }
    }

    fn runner(
        results: Vec<Result<Action>>,
        leader: watch::Receiver<bool>,
    ) -> (
        Runner<Scripted>,
        WorkQueue<ResourceId>,
        mpsc::UnboundedReceiver<ResourceId>,
        ControllerMetrics,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = WorkQueue::new();
        let metrics = ControllerMetrics::default();
        let reconciler = Scripted {
            results: Mutex::new(results),
            seen: tx,
        };
        let runner = Runner::new(reconciler, queue.clone(), leader, metrics.clone());
        (runner, queue, rx, metrics)
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_sync_and_leadership() {
        let (synced_tx, synced_rx) = watch::channel(false);
        let (leader_tx, leader_rx) = watch::channel(false);
        let (runner, queue, mut seen, metrics) = runner(vec![], leader_rx);
        let (signal, drain) = drain::channel();
        let task = tokio::spawn(runner.wait_for(synced_rx).with_workers(2).run(drain));

        let id = ResourceId::new("hf", "a");
        queue.add(id.clone());
        assert!(time::timeout(Duration::from_secs(1), seen.recv()).await.is_err());

        synced_tx.send_replace(true);
        assert!(time::timeout(Duration::from_secs(1), seen.recv()).await.is_err());

        leader_tx.send_replace(true);
        assert_eq!(seen.recv().await, Some(id));
        assert_eq!(metrics.reconcile_count("scripted"), 1);

        signal.drain().await;
        task.await.expect("runner must not panic");
    }

    #[tokio::test(start_paused = true)]
    async fn requeues_by_outcome() {
        let (_leader_tx, leader_rx) = watch::channel(true);
        let (runner, queue, mut seen, _) = runner(
            vec![
                Ok(Action::RequeueAfter(Duration::from_secs(10))),
                Err(Error::Store(store::Error::Conflict {
                    kind: "Machine".to_string(),
                    namespace: "hf".to_string(),
                    name: "a".to_string(),
                })),
                Err(Error::invariant("two bindings")),
            ],
            leader_rx,
        );
        let (signal, drain) = drain::channel();
        let task = tokio::spawn(runner.run(drain));

        let id = ResourceId::new("hf", "a");
        let start = time::Instant::now();
        queue.add(id.clone());
        assert_eq!(seen.recv().await, Some(id.clone()));

        // The requeue fires after its delay.
        assert_eq!(seen.recv().await, Some(id.clone()));
        assert!(start.elapsed() >= Duration::from_secs(10));

        // The transient failure is retried with backoff.
        assert_eq!(seen.recv().await, Some(id.clone()));

        // The invariant failure is not retried.
        assert!(time::timeout(Duration::from_secs(3600), seen.recv())
            .await
            .is_err());
        assert_eq!(queue.num_requeues(&id), 0);

        signal.drain().await;
        task.await.expect("runner must not panic");
    }
}
