//! Controller: startup sequence and the single control loop

use std::future::Future;
use std::sync::Arc;

use crate::config::{self, resolve_runner_version, Settings};
use crate::credential::CredentialManager;
use crate::image::{ImageProvisioner, ImageReference};
use crate::pool::PoolReconciler;
use crate::runtime::{ContainerRuntime, EventStreams};
use crate::secret::SecretFile;
use crate::shutdown::{DrainPolicy, ShutdownCoordinator, TerminationSignal};
use crate::watcher::EventWatcher;
use crate::Result;

/// Owns every component and the credential state.
///
/// Reconciliation and drain both run on the task that drives [`Controller::run`];
/// nothing here is shared with another task.
pub struct Controller {
    runtime: Arc<dyn ContainerRuntime>,
    credentials: CredentialManager,
    reconciler: PoolReconciler,
    watcher: EventWatcher,
    shutdown: ShutdownCoordinator,
}

impl Controller {
    /// Acquire the credential and make sure the worker image exists.
    ///
    /// Every failure here is fatal: the loop never starts.
    pub async fn start(settings: Settings, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        let Settings {
            mut runner,
            pool,
            dockerfiles_dir,
            secret_file,
            drain_timeout,
            ..
        } = settings;

        let http = config::http_client()?;
        runner.version = resolve_runner_version(&http, &runner.version).await;

        tracing::info!(runner = %runner.target, app = runner.auth.is_app(), limit = pool.limit(), "Starting controller");
        let credentials = CredentialManager::for_auth(&runner.auth, &runner.api_domain).await?;

        ImageProvisioner::new(runtime.clone())
            .ensure(&runner, &dockerfiles_dir)
            .await?;

        let spec = Arc::new(runner);
        let secret = SecretFile::new(secret_file);
        let reconciler = PoolReconciler::new(runtime.clone(), spec, pool, secret.clone());
        let image = reconciler.image().clone();

        Ok(Self {
            watcher: EventWatcher::new(image.clone()),
            shutdown: ShutdownCoordinator::new(
                runtime.clone(),
                image,
                secret,
                DrainPolicy::with_timeout(drain_timeout),
            ),
            runtime,
            credentials,
            reconciler,
        })
    }

    pub fn image(&self) -> &ImageReference {
        self.reconciler.image()
    }

    /// Run until `shutdown` resolves, then drain the pool.
    ///
    /// `shutdown` must already be listening when this is called, so a
    /// signal that arrives during the initial pass is held until the loop
    /// starts and then drains the pool. The signal wins over queued events.
    ///
    /// Returns an error when a reconciliation pass fails, either the initial
    /// one or one triggered by an exit event. The caller is expected to exit
    /// and leave restarts to a supervisor.
    pub async fn run<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = TerminationSignal>,
    {
        // Subscribe first so an exit between the initial pass and the loop is not lost
        let EventStreams {
            mut events,
            mut errors,
        } = self.runtime.subscribe();

        let outcome = self.reconciler.reconcile(&mut self.credentials).await?;
        tracing::info!(image = %self.image(), running = outcome.observed, started = outcome.started.len(), "Initial reconciliation done");

        tokio::pin!(shutdown);
        let mut events_open = true;
        let mut errors_open = true;

        loop {
            tokio::select! {
                biased;

                signal = &mut shutdown => {
                    tracing::info!(signal = %signal, "Shutting down");
                    self.shutdown.drain(&mut self.credentials).await;
                    return Ok(());
                }

                event = events.recv(), if events_open => match event {
                    Some(event) if self.watcher.is_managed_exit(&event) => {
                        tracing::info!(container = %event.container_id, image = %self.image(), "Worker exited");
                        if let Err(e) = self.reconciler.reconcile(&mut self.credentials).await {
                            tracing::error!(error = %e, "Reconciliation failed");
                            return Err(e);
                        }
                    }
                    Some(_) => {}
                    None => {
                        tracing::warn!("Event stream closed, exits will no longer be observed");
                        events_open = false;
                    }
                },

                err = errors.recv(), if errors_open => match err {
                    Some(e) => tracing::error!(error = %e, "Event stream error"),
                    None => errors_open = false,
                },
            }
        }
    }
}
