use crate::{
    admission::Admission,
    k8s::{self, watcher, Client, Resource},
    reconcile::{
        Controller, ControllerConfig, HierarchySource, Index, KubeStore, ReconcileMetrics,
        Reconciler,
    },
};
use anyhow::{bail, ensure, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use tokio::{sync::mpsc, time::Duration};
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "folder-controller",
    about = "Maintains RBAC objects for folder hierarchies"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "folder_controller=info,warn",
        env = "FOLDER_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the admission controller server.
    #[clap(long)]
    admission_controller_disabled: bool,

    /// Resolves folder contents by walking folders (`live`) or by looking
    /// them up in the validated FolderIndex (`index`).
    #[clap(long, default_value = "live")]
    hierarchy_source: HierarchySource,

    #[clap(long, default_value = "root")]
    folder_index_name: String,

    /// How often every known folder is reconciled regardless of events.
    #[clap(long, default_value = "60")]
    resync_period_secs: u64,

    #[clap(long, default_value = "30")]
    reconcile_timeout_secs: u64,

    #[clap(long, default_value = "10")]
    error_backoff_secs: u64,

    #[clap(long, default_value = "4")]
    max_concurrent_reconciles: usize,
}

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
            hierarchy_source,
            folder_index_name,
            resync_period_secs,
            reconcile_timeout_secs,
            error_backoff_secs,
            max_concurrent_reconciles,
        } = self;

        ensure!(
            resync_period_secs > 0,
            "--resync-period-secs must be greater than 0"
        );
        ensure!(
            max_concurrent_reconciles > 0,
            "--max-concurrent-reconciles must be greater than 0"
        );

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };

        let mut prom = <Registry>::default();
        let metrics = ReconcileMetrics::register(prom.sub_registry_with_prefix("folder_reconcile"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        // Watches only route events to reconcile requests; passes read the
        // API directly.
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let index = Index::shared(requests_tx, hierarchy_source, &folder_index_name);

        let cluster_folders = runtime.watch_all::<k8s::ClusterFolder>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(index.clone(), cluster_folders)
                .instrument(info_span!("clusterfolders")),
        );

        let namespaced_folders =
            runtime.watch_all::<k8s::NamespacedFolder>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), namespaced_folders)
                .instrument(info_span!("namespacedfolders")),
        );

        let namespaces = runtime.watch_all::<k8s::Namespace>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(index.clone(), namespaces).instrument(info_span!("namespaces")),
        );

        if api_resource_exists::<k8s::VirtualMachine>(&runtime.client()).await {
            let vms = runtime.watch_all::<k8s::VirtualMachine>(watcher::Config::default());
            tokio::spawn(
                kubert::index::namespaced(index.clone(), vms)
                    .instrument(info_span!("virtualmachines")),
            );
        } else {
            tracing::warn!(
                "virtualmachines.kubevirt.io resource kind not found, skipping watches"
            );
        }

        let folder_indexes = runtime.watch_all::<k8s::FolderIndex>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(index.clone(), folder_indexes)
                .instrument(info_span!("folderindexes")),
        );

        tokio::spawn(
            Index::run(index, Duration::from_secs(resync_period_secs))
                .instrument(info_span!("resync")),
        );

        let reconciler = Reconciler::new(
            KubeStore::new(runtime.client()),
            hierarchy_source,
            folder_index_name,
            metrics,
        );
        let config = ControllerConfig {
            max_concurrent: max_concurrent_reconciles,
            reconcile_timeout: Duration::from_secs(reconcile_timeout_secs),
            error_backoff: Duration::from_secs(error_backoff_secs),
        };
        info!(%hierarchy_source, ?config, "Starting folder controller");
        tokio::spawn(
            Controller::new(reconciler, requests_rx, config)
                .run(runtime.shutdown_handle())
                .instrument(info_span!("controller")),
        );

        let runtime = runtime.spawn_server(Admission::default);

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

async fn api_resource_exists<T>(client: &Client) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    client
        .list_api_group_resources(&T::api_version(&dt))
        .await
        .ok()
        .iter()
        .flat_map(|r| r.resources.iter())
        .any(|r| r.kind == T::kind(&dt))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_defaults() {
        let args = Args::try_parse_from(["folder-controller"]).expect("defaults must parse");
        assert_eq!(args.hierarchy_source, HierarchySource::Live);
        assert_eq!(args.folder_index_name, "root");
        assert_eq!(args.resync_period_secs, 60);
        assert_eq!(args.max_concurrent_reconciles, 4);
        assert!(!args.admission_controller_disabled);
    }

    #[test]
    fn parses_index_source() {
        let args = Args::try_parse_from([
            "folder-controller",
            "--hierarchy-source=index",
            "--folder-index-name=tree",
            "--admission-controller-disabled",
        ])
        .expect("flags must parse");
        assert_eq!(args.hierarchy_source, HierarchySource::Index);
        assert_eq!(args.folder_index_name, "tree");
        assert!(args.admission_controller_disabled);

        let invalid = Args::try_parse_from(["folder-controller", "--hierarchy-source=cache"]);
        assert!(invalid.is_err());
    }
}
