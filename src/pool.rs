//! Pool reconciliation
//!
//! Keeps the number of running workers derived from the managed image at the
//! configured limit. The reconciler only ever adds containers: shrinking is
//! left to the runtime's auto-remove policy and to the shutdown drain.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::config::{AuthMode, PoolTarget, RunnerSpec};
use crate::credential::CredentialManager;
use crate::image::ImageReference;
use crate::runtime::{ContainerRuntime, CreateRequest};
use crate::secret::SecretFile;
use crate::Result;

/// Prefix of every generated worker container name
pub const NAME_PREFIX: &str = "local-runner";
/// In-container path of the bind-mounted PAT file
pub const PAT_MOUNT_PATH: &str = "/mnt/pat.txt";
/// In-container path of the bind-mounted App private key
pub const KEY_MOUNT_PATH: &str = "/mnt/private-key.pem";

/// Auth material as seen by a worker
#[derive(Debug, Clone, Copy)]
pub enum WorkerAuth<'a> {
    /// Absolute host path of the written PAT file
    PatFile(&'a Path),
    App {
        app_id: u64,
        installation_id: u64,
        key_path: &'a Path,
    },
}

/// Shared container configuration for every slot of one reconciliation pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerTemplate {
    pub image: String,
    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub binds: Vec<String>,
}

impl WorkerTemplate {
    /// Environment and mounts depend only on the runner settings and auth material
    pub fn new(spec: &RunnerSpec, image: &ImageReference, auth: WorkerAuth<'_>) -> Self {
        let mut env = vec![
            format!("GITHUB_API_DOMAIN={}", spec.api_domain),
            format!("GITHUB_DOMAIN={}", spec.web_domain),
            "RUNNER_ALLOW_RUNASROOT=1".to_string(),
            format!("GITHUB_REPOSITORY_OWNER={}", spec.target.owner()),
        ];
        let mut labels = BTreeMap::new();
        labels.insert("owner".to_string(), spec.target.owner().to_string());

        if let Some(repository) = spec.target.repository() {
            env.push(format!("GITHUB_REPOSITORY_NAME={}", repository));
            labels.insert("repository".to_string(), repository.to_string());
        }
        env.push(format!("LABELS={}", spec.labels.join(",")));

        let binds = match auth {
            WorkerAuth::PatFile(host_path) => {
                env.push(format!("PAT_FILE_PATH={}", PAT_MOUNT_PATH));
                vec![format!("{}:{}:ro", host_path.display(), PAT_MOUNT_PATH)]
            }
            WorkerAuth::App {
                app_id,
                installation_id,
                key_path,
            } => {
                env.push(format!("APP_ID={}", app_id));
                env.push(format!("INSTALL_ID={}", installation_id));
                env.push(format!("KEY_FILE_PATH={}", KEY_MOUNT_PATH));
                vec![format!("{}:{}:ro", key_path.display(), KEY_MOUNT_PATH)]
            }
        };

        Self {
            image: image.to_string(),
            env,
            labels,
            binds,
        }
    }

    /// Creation request for one slot; workers remove themselves on exit
    pub fn request(&self, name: impl Into<String>) -> CreateRequest {
        CreateRequest {
            name: name.into(),
            image: self.image.clone(),
            env: self.env.clone(),
            labels: self.labels.clone(),
            binds: self.binds.clone(),
            auto_remove: true,
        }
    }
}

/// Collision-resistant worker name
pub fn worker_name() -> String {
    format!("{}-{}", NAME_PREFIX, uuid::Uuid::new_v4().simple())
}

/// Result of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Matching containers occupying a slot when the pass started
    pub observed: usize,
    pub deficit: usize,
    /// Ids of containers created and started
    pub started: Vec<String>,
    /// Slots whose create or start failed
    pub failed: usize,
}

/// Converges observed running workers towards the pool limit
pub struct PoolReconciler {
    runtime: Arc<dyn ContainerRuntime>,
    spec: Arc<RunnerSpec>,
    image: ImageReference,
    target: PoolTarget,
    secret: SecretFile,
}

impl PoolReconciler {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        spec: Arc<RunnerSpec>,
        target: PoolTarget,
        secret: SecretFile,
    ) -> Self {
        let image = spec.image_reference();
        Self {
            runtime,
            spec,
            image,
            target,
            secret,
        }
    }

    pub fn image(&self) -> &ImageReference {
        &self.image
    }

    pub fn target(&self) -> PoolTarget {
        self.target
    }

    /// One reconciliation pass.
    ///
    /// Fails only when the pass cannot begin: listing containers, obtaining
    /// the credential or writing the secret file. Individual slot failures are
    /// logged and counted; the remaining slots are still attempted.
    pub async fn reconcile(&self, credentials: &mut CredentialManager) -> Result<ReconcileOutcome> {
        let containers = self.runtime.list_containers(self.image.as_str()).await?;
        let observed = containers
            .iter()
            .filter(|c| c.state.occupies_slot())
            .count();
        let deficit = self.target.deficit(observed);

        let mut outcome = ReconcileOutcome {
            observed,
            deficit,
            ..Default::default()
        };

        if deficit == 0 {
            if observed > self.target.limit() {
                tracing::warn!(image = %self.image, observed, limit = self.target.limit(), "Pool above limit, leaving as is");
            }
            return Ok(outcome);
        }

        tracing::info!(image = %self.image, observed, limit = self.target.limit(), deficit, "Filling pool");

        let credential = credentials.current_credential().await?;
        let template = match &self.spec.auth {
            AuthMode::Token(_) => {
                let host_path = self.secret.write(credential.token())?;
                WorkerTemplate::new(&self.spec, &self.image, WorkerAuth::PatFile(&host_path))
            }
            AuthMode::App {
                app_id,
                installation_id,
                key_path,
            } => WorkerTemplate::new(
                &self.spec,
                &self.image,
                WorkerAuth::App {
                    app_id: *app_id,
                    installation_id: *installation_id,
                    key_path,
                },
            ),
        };

        for slot in 0..deficit {
            match self.fill_slot(&template).await {
                Some(id) => outcome.started.push(id),
                None => {
                    outcome.failed += 1;
                    tracing::debug!(slot, remaining = deficit - slot - 1, "Continuing after failed slot");
                }
            }
        }

        Ok(outcome)
    }

    async fn fill_slot(&self, template: &WorkerTemplate) -> Option<String> {
        let name = worker_name();
        let id = match self.runtime.create_container(&template.request(&name)).await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(container = %name, error = %e, "Error creating container");
                return None;
            }
        };
        tracing::info!(container = %name, id = %id, "Container created");

        if let Err(e) = self.runtime.start_container(&id).await {
            tracing::error!(container = %name, id = %id, error = %e, "Error starting container");
            if let Err(e) = self.runtime.remove_container(&id).await {
                tracing::warn!(container = %name, id = %id, error = %e, "Can not remove unstarted container");
            }
            return None;
        }

        tracing::info!(container = %name, id = %id, "Container started");
        Some(id)
    }
}
