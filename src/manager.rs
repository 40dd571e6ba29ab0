//! Extension manager
//!
//! The [`Manager`] owns the handler registries and drives the whole
//! lifecycle: cluster connection, certificate bootstrap, webhook
//! registration, the admission server, reconcilers and the Pod watch.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use k8s_openapi::api::core::v1::Pod;
use kube::core::admission::{AdmissionRequest, AdmissionResponse};
use kube::core::DynamicObject;
use kube::ResourceExt;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::certificate::{ensure_certificate, CertificateGenerator, CertificateRequest, RcgenGenerator};
use crate::cluster::{bounded, ClusterClient, KubeCluster};
use crate::config::ManagerOptions;
use crate::error::{Error, Result};
use crate::extension::{Extension, PodEvent, Reconciler, Watcher};
use crate::watch::{dispatch_event, PodWatch, WatchTarget};
use crate::webhook::{self, build_configuration, generate_admission_webhooks, MutatingWebhook};

/// Lifecycle of a manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Created, nothing registered with the cluster yet
    Unconfigured,
    /// Certificate and webhook configuration are in place
    Configured,
    /// `start` is registering webhooks and reconcilers
    Starting,
    /// Serving admission traffic; registries are frozen
    Running,
    Stopped,
}

struct Connection {
    cluster: Arc<dyn ClusterClient>,
    client: Option<kube::Client>,
}

struct Inner {
    options: ManagerOptions,
    state: Mutex<ManagerState>,
    extensions: RwLock<Vec<Arc<dyn Extension>>>,
    watchers: RwLock<Vec<Arc<dyn Watcher>>>,
    reconcilers: RwLock<Vec<Arc<dyn Reconciler>>>,
    webhooks: RwLock<Vec<MutatingWebhook>>,
    connection: OnceCell<Connection>,
    generator: Arc<dyn CertificateGenerator>,
    shutdown: CancellationToken,
    /// Set by `stop` before `start` ran; guarded by the `state` lock
    stop_requested: AtomicBool,
    /// Token of the current or next watch loop
    watch_token: Mutex<CancellationToken>,
    watching: AtomicBool,
}

impl Inner {
    /// Replace a cancelled watch token so the next loop starts fresh
    fn rearm_watch(&self) {
        let mut token = lock(&self.watch_token);
        if token.is_cancelled() {
            *token = self.shutdown.child_token();
        }
    }
}

/// Handle to an extension manager
///
/// Cloning is cheap and every clone refers to the same manager.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("state", &self.state())
            .field("extensions", &read(&self.inner.extensions).len())
            .field("watchers", &read(&self.inner.watchers).len())
            .field("reconcilers", &read(&self.inner.reconcilers).len())
            .finish_non_exhaustive()
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Frees the single-watch slot when the watch loop exits
struct WatchGuard<'a>(&'a Inner);

impl Drop for WatchGuard<'_> {
    fn drop(&mut self) {
        self.0.rearm_watch();
        self.0.watching.store(false, Ordering::SeqCst);
    }
}

impl Manager {
    pub fn new(options: ManagerOptions) -> Self {
        let shutdown = CancellationToken::new();
        Self {
            inner: Arc::new(Inner {
                options,
                state: Mutex::new(ManagerState::Unconfigured),
                extensions: RwLock::default(),
                watchers: RwLock::default(),
                reconcilers: RwLock::default(),
                webhooks: RwLock::default(),
                connection: OnceCell::new(),
                generator: Arc::new(RcgenGenerator::default()),
                watch_token: Mutex::new(shutdown.child_token()),
                shutdown,
                stop_requested: AtomicBool::new(false),
                watching: AtomicBool::new(false),
            }),
        }
    }

    /// Use `cluster` instead of connecting with a kubeconfig
    ///
    /// Must be called before the first cluster access.
    pub fn with_cluster(self, cluster: Arc<dyn ClusterClient>) -> Self {
        let connection = Connection {
            cluster,
            client: None,
        };
        if self.inner.connection.set(connection).is_err() {
            warn!("Cluster connection already established, ignoring injected client");
        }
        self
    }

    /// Use a custom certificate generator
    ///
    /// Only valid on a fresh manager, before any clone was handed out.
    pub fn with_generator(mut self, generator: Arc<dyn CertificateGenerator>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.generator = generator,
            None => warn!("Manager is shared, ignoring custom certificate generator"),
        }
        self
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.inner.options
    }

    pub fn state(&self) -> ManagerState {
        *lock(&self.inner.state)
    }

    fn set_state(&self, state: ManagerState) {
        *lock(&self.inner.state) = state;
    }

    fn ensure_mutable(&self) -> Result<()> {
        match self.state() {
            ManagerState::Starting | ManagerState::Running | ManagerState::Stopped => {
                Err(Error::AlreadyRunning)
            }
            _ => Ok(()),
        }
    }

    // Registries

    pub fn add_extension(&self, extension: Arc<dyn Extension>) -> Result<()> {
        self.ensure_mutable()?;
        write(&self.inner.extensions).push(extension);
        Ok(())
    }

    pub fn add_watcher(&self, watcher: Arc<dyn Watcher>) -> Result<()> {
        self.ensure_mutable()?;
        write(&self.inner.watchers).push(watcher);
        Ok(())
    }

    pub fn add_reconciler(&self, reconciler: Arc<dyn Reconciler>) -> Result<()> {
        self.ensure_mutable()?;
        write(&self.inner.reconcilers).push(reconciler);
        Ok(())
    }

    /// Registered extensions, in registration order
    pub fn list_extensions(&self) -> Vec<Arc<dyn Extension>> {
        read(&self.inner.extensions).clone()
    }

    pub fn list_watchers(&self) -> Vec<Arc<dyn Watcher>> {
        read(&self.inner.watchers).clone()
    }

    pub fn list_reconcilers(&self) -> Vec<Arc<dyn Reconciler>> {
        read(&self.inner.reconcilers).clone()
    }

    /// Admission adapters built by the last [`register_extensions`](Self::register_extensions)
    pub fn webhooks(&self) -> Vec<MutatingWebhook> {
        read(&self.inner.webhooks).clone()
    }

    // Cluster access

    async fn connection(&self) -> Result<&Connection> {
        self.inner
            .connection
            .get_or_try_init(|| async {
                let cluster = KubeCluster::connect(self.inner.options.kubeconfig_path.as_deref()).await?;
                let client = cluster.client().clone();
                Ok::<_, Error>(Connection {
                    cluster: Arc::new(cluster),
                    client: Some(client),
                })
            })
            .await
    }

    /// The cluster client, connecting on first use
    pub async fn kube_connection(&self) -> Result<Arc<dyn ClusterClient>> {
        Ok(self.connection().await?.cluster.clone())
    }

    /// The underlying `kube::Client`, for reconcilers building their own controllers
    pub async fn kube_client(&self) -> Result<kube::Client> {
        self.connection().await?.client.clone().ok_or_else(|| {
            Error::ConfigError("no kube client available with a custom cluster client".to_string())
        })
    }

    /// Token cancelled when the manager stops
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    // Admission

    /// Admission response patching `original` into `mutated`
    pub fn patch_from_pod(
        &self,
        request: &AdmissionRequest<DynamicObject>,
        original: &Pod,
        mutated: &Pod,
    ) -> AdmissionResponse {
        webhook::patch_from_pod(request, original, mutated)
    }

    /// Prepare the cluster for admission traffic
    ///
    /// Bootstraps the certificate, labels the operator namespace and submits
    /// one webhook per registered extension. Nothing is submitted when the
    /// certificate cannot be obtained.
    #[instrument(skip(self))]
    pub async fn register_extensions(&self) -> Result<()> {
        let options = &self.inner.options;
        if options.register_webhooks {
            options.validate()?;
        }

        let cluster = self.kube_connection().await?;
        let request = CertificateRequest::from_options(options);
        let bundle =
            ensure_certificate(cluster.as_ref(), self.inner.generator.as_ref(), &request).await?;

        self.label_namespace(cluster.as_ref()).await?;

        let webhooks: Vec<MutatingWebhook> = self
            .list_extensions()
            .into_iter()
            .enumerate()
            .map(|(index, extension)| {
                MutatingWebhook::new(
                    index,
                    options.webhook_name(index),
                    options.filter_eirini_apps,
                    extension,
                )
            })
            .collect();

        if options.register_webhooks {
            let entries =
                generate_admission_webhooks(webhooks.len(), options, &bundle.ca_certificate)?;
            let configuration = build_configuration(options, entries);
            bounded(
                options.cluster_timeout(),
                "registering webhook configuration",
                cluster.apply_mutating_webhook_configuration(&configuration),
            )
            .await?;
            info!(
                "Registered {} webhook(s) in {}",
                webhooks.len(),
                configuration.name_any()
            );
        } else {
            debug!("Webhook registration disabled, skipping configuration");
        }

        *write(&self.inner.webhooks) = webhooks;
        if self.state() == ManagerState::Unconfigured {
            self.set_state(ManagerState::Configured);
        }
        Ok(())
    }

    /// Label the operator namespace so the webhook's namespace selector matches it
    async fn label_namespace(&self, cluster: &dyn ClusterClient) -> Result<()> {
        let options = &self.inner.options;
        if options.namespace.is_empty() {
            return Ok(());
        }

        let key = options.namespace_label_key();
        let timeout = options.cluster_timeout();
        let namespace = bounded(
            timeout,
            "reading operator namespace",
            cluster.get_namespace(&options.namespace),
        )
        .await?;

        if namespace.labels().get(&key) == Some(&options.namespace) {
            debug!("Namespace {} already labeled", options.namespace);
            return Ok(());
        }

        let labels = BTreeMap::from([(key, options.namespace.clone())]);
        bounded(
            timeout,
            "labeling operator namespace",
            cluster.patch_namespace_labels(&options.namespace, &labels),
        )
        .await?;
        info!("Labeled namespace {}", options.namespace);
        Ok(())
    }

    // Lifecycle

    /// Run the manager until [`stop`](Self::stop) or SIGINT/SIGTERM
    ///
    /// Registers the webhooks, starts reconcilers and the watch loop, then
    /// serves admission traffic. A stop requested before or during startup
    /// makes `start` return without serving.
    pub async fn start(&self) -> Result<()> {
        let previous = {
            let mut state = lock(&self.inner.state);
            let current = *state;
            match current {
                ManagerState::Starting | ManagerState::Running | ManagerState::Stopped => {
                    return Err(Error::AlreadyRunning);
                }
                ManagerState::Unconfigured | ManagerState::Configured => {
                    if self.inner.stop_requested.swap(false, Ordering::SeqCst) {
                        *state = ManagerState::Stopped;
                        drop(state);
                        self.inner.shutdown.cancel();
                        info!("Extension manager stopped before start");
                        return Ok(());
                    }
                    *state = ManagerState::Starting;
                    current
                }
            }
        };
        if !self.inner.watching.load(Ordering::SeqCst) {
            self.inner.rearm_watch();
        }

        let shutdown = self.inner.shutdown.clone();
        let registered = tokio::select! {
            _ = shutdown.cancelled() => None,
            result = self.register_extensions() => Some(result),
        };
        match registered {
            None => {
                self.abort_start();
                return Ok(());
            }
            Some(Err(e)) => {
                self.set_state(previous);
                return Err(e);
            }
            Some(Ok(())) => {}
        }

        for reconciler in self.list_reconcilers() {
            if let Err(e) = reconciler.register(self).await {
                self.abort_start();
                return Err(e);
            }
        }

        {
            let mut state = lock(&self.inner.state);
            if shutdown.is_cancelled() {
                drop(state);
                self.abort_start();
                return Ok(());
            }
            *state = ManagerState::Running;
        }

        let watch_task = if read(&self.inner.watchers).is_empty() {
            None
        } else {
            let manager = self.clone();
            Some(tokio::spawn(async move { manager.watch().await }))
        };

        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_signal() => {
                    info!("Shutdown signal received");
                    signal_token.cancel();
                }
                _ = signal_token.cancelled() => {}
            }
        });

        let options = &self.inner.options;
        let result = webhook::serve(
            self.clone(),
            self.webhooks(),
            options.listen_address(),
            &options.cert_dir(),
            shutdown.child_token(),
        )
        .await;

        shutdown.cancel();
        if let Some(task) = watch_task {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Pod watch ended with error: {}", e),
                Err(e) => warn!("Pod watch task failed: {}", e),
            }
        }

        self.set_state(ManagerState::Stopped);
        info!("Extension manager stopped");
        result
    }

    /// Leave a start that was cancelled before serving
    fn abort_start(&self) {
        self.inner.shutdown.cancel();
        self.set_state(ManagerState::Stopped);
        info!("Extension manager stopped before serving");
    }

    /// Stop serving and watching
    ///
    /// Before `start` runs, the request is kept and honoured by the next
    /// `start`.
    pub fn stop(&self) {
        {
            let state = lock(&self.inner.state);
            match *state {
                ManagerState::Starting | ManagerState::Running => {
                    info!("Stopping extension manager");
                    self.inner.shutdown.cancel();
                }
                ManagerState::Unconfigured | ManagerState::Configured => {
                    self.inner.stop_requested.store(true, Ordering::SeqCst);
                }
                ManagerState::Stopped => {}
            }
        }
        self.stop_watch();
    }

    // Watch

    /// Watch Pods and dispatch events to the watchers until [`stop_watch`](Self::stop_watch)
    ///
    /// Fails if the first watch request fails or if another watch loop is
    /// already running on this manager. Returns at once when
    /// [`stop_watch`](Self::stop_watch) was called since the last loop ended.
    pub async fn watch(&self) -> Result<()> {
        if self.inner.watching.swap(true, Ordering::SeqCst) {
            return Err(Error::WatchError(
                "a watch loop is already running for this manager".to_string(),
            ));
        }
        let _guard = WatchGuard(&self.inner);

        let token = lock(&self.inner.watch_token).clone();
        if token.is_cancelled() {
            debug!("Pod watch stopped before it started");
            return Ok(());
        }

        let cluster = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            cluster = self.kube_connection() => cluster?,
        };
        let target = WatchTarget::from_options(&self.inner.options);
        PodWatch::new(self, cluster.as_ref(), target, token)
            .run()
            .await
    }

    /// Cancel the running watch loop, or the next one if none runs yet
    pub fn stop_watch(&self) {
        lock(&self.inner.watch_token).cancel();
    }

    /// Deliver an event to every registered watcher
    pub async fn handle_event(&self, event: &PodEvent) {
        dispatch_event(self, &self.list_watchers(), event).await;
    }
}

/// Resolves on SIGINT, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl Extension for Noop {
        async fn handle(
            &self,
            _manager: &Manager,
            _pod: &Pod,
            request: &AdmissionRequest<DynamicObject>,
        ) -> AdmissionResponse {
            AdmissionResponse::from(request)
        }
    }

    #[async_trait]
    impl Watcher for Noop {
        async fn handle(&self, _manager: &Manager, _event: &PodEvent) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_registries_keep_order() {
        let manager = Manager::new(ManagerOptions::default());
        let first: Arc<dyn Extension> = Arc::new(Noop);
        let second: Arc<dyn Extension> = Arc::new(Noop);

        manager.add_extension(first.clone()).unwrap();
        manager.add_extension(second.clone()).unwrap();
        manager.add_watcher(Arc::new(Noop)).unwrap();

        let extensions = manager.list_extensions();
        assert_eq!(extensions.len(), 2);
        assert!(Arc::ptr_eq(&extensions[0], &first));
        assert!(Arc::ptr_eq(&extensions[1], &second));
        assert_eq!(manager.list_watchers().len(), 1);
        assert_eq!(manager.state(), ManagerState::Unconfigured);
    }

    #[test]
    fn test_clones_share_state() {
        let manager = Manager::new(ManagerOptions::default());
        let handle = manager.clone();

        handle.add_extension(Arc::new(Noop)).unwrap();
        assert_eq!(manager.list_extensions().len(), 1);
    }

    #[test]
    fn test_frozen_once_running() {
        let manager = Manager::new(ManagerOptions::default());
        manager.set_state(ManagerState::Running);

        assert!(matches!(
            manager.add_extension(Arc::new(Noop)),
            Err(Error::AlreadyRunning)
        ));
        assert!(matches!(
            manager.add_watcher(Arc::new(Noop)),
            Err(Error::AlreadyRunning)
        ));
    }

    #[tokio::test]
    async fn test_stop_before_start_is_honoured_by_start() {
        let manager = Manager::new(ManagerOptions::default());
        manager.stop();
        manager.stop();

        assert!(!manager.cancellation_token().is_cancelled());
        assert_eq!(manager.state(), ManagerState::Unconfigured);

        // Returns before touching the cluster
        manager.start().await.unwrap();
        assert_eq!(manager.state(), ManagerState::Stopped);
        assert!(manager.cancellation_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_stop_watch_before_watch_ends_next_loop() {
        let manager = Manager::new(ManagerOptions::default());
        manager.stop_watch();
        manager.stop_watch();

        manager.watch().await.unwrap();

        assert!(!lock(&manager.inner.watch_token).is_cancelled());
        assert!(!manager.inner.watching.load(Ordering::SeqCst));
        assert!(!manager.cancellation_token().is_cancelled());
    }

    #[test]
    fn test_options_are_exposed() {
        let manager = Manager::new(ManagerOptions::default().with_port(8443));
        assert_eq!(manager.options().port, 8443);
    }
}
