use crate::{
    metrics::PassResult,
    reconciler::{Action, Reconciler, Request},
    store::Store,
};
use ahash::AHashSet as HashSet;
use std::{collections::VecDeque, sync::Arc};
use tokio::{
    sync::mpsc::UnboundedReceiver,
    task::JoinSet,
    time::{self, Duration},
};
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Copy, Clone, Debug)]
pub struct ControllerConfig {
    /// The most passes that may run at once.
    pub max_concurrent: usize,

    /// Bounds each pass. A pass that runs over is abandoned at its next store
    /// call and retried after `error_backoff`.
    pub reconcile_timeout: Duration,

    pub error_backoff: Duration,
}

/// Drains reconcile requests through a work queue.
///
/// A request is queued at most once. A request that arrives while the same
/// object is being reconciled is run once more after the current pass.
pub struct Controller<S> {
    reconciler: Arc<Reconciler<S>>,
    requests: UnboundedReceiver<Request>,
    config: ControllerConfig,

    queue: VecDeque<Request>,
    queued: HashSet<Request>,
    running: HashSet<Request>,
    dirty: HashSet<Request>,
}

// === impl ControllerConfig ===

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            reconcile_timeout: Duration::from_secs(30),
            error_backoff: Duration::from_secs(10),
        }
    }
}

// === impl Controller ===

impl<S> Controller<S>
where
    S: Store + 'static,
{
    pub fn new(
        reconciler: Reconciler<S>,
        requests: UnboundedReceiver<Request>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
            requests,
            config,
            queue: VecDeque::new(),
            queued: HashSet::new(),
            running: HashSet::new(),
            dirty: HashSet::new(),
        }
    }

    /// Runs until shutdown is signaled or every request sender is dropped.
    ///
    /// On shutdown, in-flight passes complete before the drain is released.
    /// Once the senders are gone, queued requests still run but delayed
    /// requeues are abandoned.
    pub async fn run(mut self, drain: drain::Watch) {
        let mut passes = JoinSet::<(Request, Action)>::new();
        let mut delayed = JoinSet::<Request>::new();
        let mut closed = false;

        let shutdown = drain.signaled();
        tokio::pin!(shutdown);

        loop {
            let limit = self.config.max_concurrent.max(1);
            while passes.len() < limit {
                let Some(request) = self.queue.pop_front() else {
                    break;
                };
                self.queued.remove(&request);
                self.running.insert(request.clone());
                passes.spawn(Self::pass(self.reconciler.clone(), request, self.config));
            }
            if closed && passes.is_empty() {
                debug!("Request channel closed");
                return;
            }

            tokio::select! {
                release = &mut shutdown => {
                    info!(running = passes.len(), "Shutting down");
                    release
                        .release_after(async move { while passes.join_next().await.is_some() {} })
                        .await;
                    return;
                }

                request = self.requests.recv(), if !closed => match request {
                    Some(request) => self.enqueue(request),
                    None => closed = true,
                },

                Some(done) = passes.join_next(), if !passes.is_empty() => match done {
                    Ok((request, action)) => self.complete(request, action, &mut delayed),
                    Err(error) => warn!(%error, "Reconcile task failed"),
                },

                Some(requeue) = delayed.join_next(), if !closed && !delayed.is_empty() => {
                    if let Ok(request) = requeue {
                        self.enqueue(request);
                    }
                }
            }
        }
    }

    fn enqueue(&mut self, request: Request) {
        if self.running.contains(&request) {
            self.dirty.insert(request);
            return;
        }
        if self.queued.insert(request.clone()) {
            self.queue.push_back(request);
        }
    }

    fn complete(&mut self, request: Request, action: Action, delayed: &mut JoinSet<Request>) {
        self.running.remove(&request);
        if self.dirty.remove(&request) {
            self.enqueue(request);
            return;
        }
        if let Action::RequeueAfter(delay) = action {
            delayed.spawn(async move {
                time::sleep(delay).await;
                request
            });
        }
    }

    async fn pass(
        reconciler: Arc<Reconciler<S>>,
        request: Request,
        config: ControllerConfig,
    ) -> (Request, Action) {
        let span = match &request {
            Request::ClusterFolder(name) => info_span!("clusterfolder", %name),
            Request::NamespacedFolder { namespace, name } => {
                info_span!("namespacedfolder", %namespace, %name)
            }
            Request::FolderIndex(name) => info_span!("folderindex", %name),
        };

        let started = time::Instant::now();
        let res = time::timeout(config.reconcile_timeout, reconciler.reconcile(&request))
            .instrument(span.clone())
            .await;

        let (result, action) = span.in_scope(|| match res {
            Ok(Ok(Action::Done)) => (PassResult::Done, Action::Done),
            Ok(Ok(action)) => (PassResult::Requeued, action),
            Ok(Err(error)) if error.is_conflict() => {
                info!(%error, "Conflicting write, retrying");
                (PassResult::Error, Action::RequeueAfter(config.error_backoff))
            }
            Ok(Err(error)) => {
                warn!(%error, "Reconcile failed");
                (PassResult::Error, Action::RequeueAfter(config.error_backoff))
            }
            Err(_) => {
                warn!(timeout = ?config.reconcile_timeout, "Reconcile timed out");
                (PassResult::Timeout, Action::RequeueAfter(config.error_backoff))
            }
        });
        reconciler.metrics().pass(&request, result, started);
        (request, action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metrics::ReconcileMetrics,
        reconciler::HierarchySource,
        store::ResourceId,
        tests::{cluster_folder, grant, namespace, MemStore},
    };
    use folder_controller_k8s_api::{Namespace, ResourceExt, RoleBinding};
    use tokio::sync::mpsc;

    fn reconciler(store: MemStore) -> Reconciler<MemStore> {
        Reconciler::new(
            store,
            HierarchySource::Live,
            "root",
            ReconcileMetrics::default(),
        )
    }

    fn controller(store: MemStore) -> (mpsc::UnboundedSender<Request>, Controller<MemStore>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let controller = Controller::new(reconciler(store), rx, ControllerConfig::default());
        (tx, controller)
    }

    #[tokio::test]
    async fn runs_queued_requests() {
        let store = MemStore::default();
        let mut folder = cluster_folder("team-a", &[], &["ns-1"]);
        folder.spec.folder_permissions = vec![grant("alice", "view")];
        store.insert(folder);
        store.insert(namespace("ns-1"));

        let (tx, controller) = controller(store.clone());
        let (_signal, watch) = drain::channel();
        for _ in 0..3 {
            tx.send(Request::ClusterFolder("team-a".to_string()))
                .expect("controller must be running");
        }
        tx.send(Request::ClusterFolder("missing".to_string()))
            .expect("controller must be running");
        drop(tx);

        tokio_test::assert_ok!(tokio::spawn(controller.run(watch)).await);

        let bindings = store.all::<RoleBinding>();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].namespace().as_deref(), Some("ns-1"));
    }

    #[test]
    fn dedupes_queued_and_running_requests() {
        let (_tx, mut controller) = controller(MemStore::default());
        let a = Request::ClusterFolder("a".to_string());
        let b = Request::namespaced_folder("ns", "b");

        controller.enqueue(a.clone());
        controller.enqueue(a.clone());
        controller.enqueue(b.clone());
        assert_eq!(controller.queue, VecDeque::from([a.clone(), b.clone()]));

        // A request for an object being reconciled runs again afterwards.
        controller.queue.clear();
        controller.queued.clear();
        controller.running.insert(a.clone());
        controller.enqueue(a.clone());
        assert!(controller.queue.is_empty());
        assert!(controller.dirty.contains(&a));
    }

    #[tokio::test]
    async fn dirty_request_is_requeued_on_completion() {
        let (_tx, mut controller) = controller(MemStore::default());
        let mut delayed = JoinSet::new();
        let a = Request::ClusterFolder("a".to_string());

        controller.running.insert(a.clone());
        controller.dirty.insert(a.clone());
        controller.complete(a.clone(), Action::Done, &mut delayed);
        assert_eq!(controller.queue, VecDeque::from([a.clone()]));
        assert!(delayed.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn requeues_after_delay() {
        let (_tx, mut controller) = controller(MemStore::default());
        let mut delayed = JoinSet::new();
        let a = Request::ClusterFolder("a".to_string());

        controller.running.insert(a.clone());
        controller.complete(
            a.clone(),
            Action::RequeueAfter(Duration::from_secs(5)),
            &mut delayed,
        );
        assert!(controller.queue.is_empty());

        let requeued = delayed.join_next().await.expect("a requeue must be pending");
        assert_eq!(requeued.expect("requeue task must not fail"), a);
    }

    #[tokio::test]
    async fn failed_pass_backs_off() {
        let store = MemStore::default();
        let mut folder = cluster_folder("team-a", &[], &["ns-1"]);
        folder.spec.folder_permissions = vec![grant("alice", "view")];
        store.insert(folder);
        store.insert(namespace("ns-1"));
        store.fail_next_write::<Namespace>(&ResourceId::cluster("ns-1"));

        let config = ControllerConfig {
            error_backoff: Duration::from_secs(7),
            ..Default::default()
        };
        let reconciler = Arc::new(reconciler(store.clone()));
        let request = Request::ClusterFolder("team-a".to_string());

        let (_, action) = Controller::pass(reconciler.clone(), request.clone(), config).await;
        assert_eq!(action, Action::RequeueAfter(Duration::from_secs(7)));
        assert!(store.all::<RoleBinding>().is_empty());

        let (_, action) = Controller::pass(reconciler, request, config).await;
        assert_eq!(action, Action::Done);
        assert_eq!(store.all::<RoleBinding>().len(), 1);
    }
}
