//! Worker image naming and provisioning

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::RunnerSpec;
use crate::runtime::{BuildProgress, BuildRequest, ContainerRuntime};
use crate::{Error, Result};

/// Fixed repository name of every worker image
pub const REPOSITORY_NAME: &str = "local-runner";

/// Image tag of the managed worker image.
///
/// Used both as the build tag and as the key that decides which containers
/// belong to the pool: `[registry-host/]local-runner:<base>-<version>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference(String);

impl ImageReference {
    pub fn new(host: Option<&str>, base_image: &str, version: &str) -> Self {
        match host.filter(|h| !h.is_empty()) {
            Some(host) => Self(format!("{}/{}:{}-{}", host, REPOSITORY_NAME, base_image, version)),
            None => Self(format!("{}:{}-{}", REPOSITORY_NAME, base_image, version)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for ImageReference {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

/// Host architecture in Docker platform naming
pub fn docker_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "arm",
        "x86" => "386",
        other => other,
    }
}

/// Build arguments passed to every worker image build
pub fn build_args(version: &str) -> HashMap<String, String> {
    let mut args = HashMap::new();
    args.insert("arch".to_string(), docker_arch().to_string());
    args.insert("os".to_string(), "linux".to_string());
    if !version.is_empty() {
        args.insert("version".to_string(), version.to_string());
    }
    args
}

/// Pack every file under `dir` into an uncompressed tar archive, paths relative to `dir`
pub fn create_build_context(dir: &Path) -> Result<Vec<u8>> {
    if !dir.is_dir() {
        return Err(Error::Build(format!(
            "build context {} is not a directory",
            dir.display()
        )));
    }

    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_dir_all(".", dir)
        .map_err(|e| Error::Build(format!("Error creating build context: {}", e)))?;
    builder
        .into_inner()
        .map_err(|e| Error::Build(format!("failed to finish build context: {}", e)))
}

/// Ensures the worker image exists, building it when absent
pub struct ImageProvisioner {
    runtime: Arc<dyn ContainerRuntime>,
}

impl ImageProvisioner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    pub async fn exists(&self, reference: &ImageReference) -> Result<bool> {
        self.runtime.image_exists(reference.as_str()).await
    }

    /// Package `source_dir`, submit the build and log its output
    pub async fn build(
        &self,
        source_dir: &Path,
        reference: &ImageReference,
        dockerfile: &str,
        build_args: HashMap<String, String>,
    ) -> Result<()> {
        for (key, value) in &build_args {
            tracing::info!(arg = %key, value = %value, "Build argument");
        }

        let dir: PathBuf = source_dir.to_path_buf();
        let context = tokio::task::spawn_blocking(move || create_build_context(&dir))
            .await
            .map_err(|e| Error::Build(format!("build context task failed: {}", e)))??;

        let request = BuildRequest {
            tag: reference.to_string(),
            dockerfile: dockerfile.to_string(),
            platform: format!("linux/{}", docker_arch()),
            build_args,
        };

        tracing::info!(image = %reference, dockerfile = %dockerfile, context_bytes = context.len(), "Building image");
        let mut progress = self.runtime.build_image(request, context);
        while let Some(item) = progress.recv().await {
            match item {
                Ok(BuildProgress::Output(line)) => tracing::info!(image = %reference, "{}", line),
                Ok(BuildProgress::Failed(message)) => return Err(Error::Build(message)),
                Err(e) => return Err(Error::Build(e.to_string())),
            }
        }

        tracing::info!(image = %reference, "Image built successfully");
        Ok(())
    }

    /// Startup-only guarantee: build once if the image is missing, never again
    pub async fn ensure(&self, spec: &RunnerSpec, dockerfiles_dir: &Path) -> Result<()> {
        let reference = spec.image_reference();
        if self.exists(&reference).await? {
            tracing::info!(image = %reference, "Image present");
            return Ok(());
        }

        tracing::info!(image = %reference, "Image missing, building");
        self.build(
            dockerfiles_dir,
            &reference,
            &spec.dockerfile_name(),
            build_args(&spec.version),
        )
        .await
    }
}
