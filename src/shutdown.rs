//! Graceful drain on termination
//!
//! Every managed worker gets the in-container stop script, which deregisters
//! the runner before the container exits. The drain walks workers one by one;
//! it never runs concurrently with a reconciliation pass.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::credential::CredentialManager;
use crate::image::ImageReference;
use crate::runtime::{ContainerRuntime, ManagedContainer};
use crate::secret::SecretFile;
use crate::Result;

/// In-container graceful stop command
pub const STOP_COMMAND: [&str; 3] = ["/bin/bash", "-c", "/actions-runner/stop.sh"];

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Which signal ended the control loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSignal {
    Interrupt,
    Terminate,
}

impl std::fmt::Display for TerminationSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationSignal::Interrupt => write!(f, "SIGINT"),
            TerminationSignal::Terminate => write!(f, "SIGTERM"),
        }
    }
}

/// Install the SIGINT and, on Unix, SIGTERM handlers now.
///
/// The returned future resolves on the first of them. Signals delivered
/// between installation and the first poll are not lost, and no longer take
/// the default action of killing the process.
#[cfg(unix)]
pub fn termination_signal() -> Result<impl Future<Output = TerminationSignal>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => {
                tracing::info!("Received Ctrl+C, draining pool");
                TerminationSignal::Interrupt
            }
            _ = terminate.recv() => {
                tracing::info!("Received terminate signal, draining pool");
                TerminationSignal::Terminate
            }
        }
    })
}

#[cfg(not(unix))]
pub fn termination_signal() -> Result<impl Future<Output = TerminationSignal>> {
    let mut ctrl_c = tokio::signal::windows::ctrl_c()?;

    Ok(async move {
        ctrl_c.recv().await;
        tracing::info!("Received Ctrl+C, draining pool");
        TerminationSignal::Interrupt
    })
}

/// How long to wait on each stop command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainPolicy {
    pub poll_interval: Duration,
    /// `None` polls until the stop command finishes, however long that takes
    pub timeout: Option<Duration>,
}

impl DrainPolicy {
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }
}

impl Default for DrainPolicy {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
        }
    }
}

/// Per-container result of a drain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped { exit_code: Option<i64> },
    /// Stop command outlived the timeout; the container was force-removed
    Forced,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub stopped: usize,
    pub forced: usize,
    pub failed: usize,
}

impl DrainReport {
    fn record(&mut self, outcome: StopOutcome) {
        match outcome {
            StopOutcome::Stopped { .. } => self.stopped += 1,
            StopOutcome::Forced => self.forced += 1,
            StopOutcome::Failed => self.failed += 1,
        }
    }
}

pub struct ShutdownCoordinator {
    runtime: Arc<dyn ContainerRuntime>,
    image: ImageReference,
    secret: SecretFile,
    policy: DrainPolicy,
}

impl ShutdownCoordinator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        image: ImageReference,
        secret: SecretFile,
        policy: DrainPolicy,
    ) -> Self {
        Self {
            runtime,
            image,
            secret,
            policy,
        }
    }

    /// Stop every managed worker, then remove the local secret file.
    ///
    /// Never fails: each problem is logged and the drain moves on so the
    /// process can exit.
    pub async fn drain(&self, credentials: &mut CredentialManager) -> DrainReport {
        let mut report = DrainReport::default();

        if let Err(e) = credentials.current_credential().await {
            tracing::warn!(error = %e, "Can not refresh credential before drain");
        }

        match self.runtime.list_containers(self.image.as_str()).await {
            Ok(containers) => {
                tracing::info!(image = %self.image, count = containers.len(), "Draining workers");
                for container in &containers {
                    let outcome = self.stop(container).await;
                    report.record(outcome);
                }
            }
            Err(e) => {
                tracing::error!(image = %self.image, error = %e, "Can not list containers for drain");
            }
        }

        if let Err(e) = self.secret.remove() {
            tracing::error!(error = %e, "Can not remove secret file");
        }

        tracing::info!(
            stopped = report.stopped,
            forced = report.forced,
            failed = report.failed,
            "Drain finished"
        );
        report
    }

    async fn stop(&self, container: &ManagedContainer) -> StopOutcome {
        let cmd: Vec<String> = STOP_COMMAND.iter().map(|s| s.to_string()).collect();
        let session = match self.runtime.exec(&container.id, &cmd).await {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(container = %container.name, error = %e, "Can not run stop command");
                return StopOutcome::Failed;
            }
        };

        let name = container.name.clone();
        let mut output = session.output;
        tokio::spawn(async move {
            while let Some(line) = output.recv().await {
                tracing::info!(container = %name, "{}", line.trim_end());
            }
        });

        let started = Instant::now();
        loop {
            match self.runtime.exec_status(&session.exec_id).await {
                Ok(status) if !status.running => {
                    tracing::info!(container = %container.name, exit_code = ?status.exit_code, "Stop command finished");
                    return StopOutcome::Stopped {
                        exit_code: status.exit_code,
                    };
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(container = %container.name, error = %e, "Error inspecting stop command");
                    return StopOutcome::Failed;
                }
            }

            if let Some(timeout) = self.policy.timeout {
                if started.elapsed() >= timeout {
                    tracing::warn!(container = %container.name, timeout = ?timeout, "Stop command timed out, removing container");
                    return match self.runtime.remove_container(&container.id).await {
                        Ok(()) => StopOutcome::Forced,
                        Err(e) => {
                            tracing::error!(container = %container.name, error = %e, "Can not remove container");
                            StopOutcome::Failed
                        }
                    };
                }
            }

            tokio::time::sleep(self.policy.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::MockTokenIssuer;
    use crate::runtime::{ContainerState, ExecSession, ExecStatus, MockContainerRuntime};
    use crate::Error;
    use chrono::{Duration as ChronoDuration, Utc};
    use secrecy::SecretString;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn image() -> ImageReference {
        ImageReference::new(None, "Jammy", "2.322.0")
    }

    fn worker(id: &str) -> ManagedContainer {
        ManagedContainer {
            id: id.to_string(),
            name: format!("local-runner-{}", id),
            image: image().to_string(),
            state: ContainerState::Running,
        }
    }

    fn session(exec_id: &str) -> ExecSession {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send("Removing runner from GitHub\n".to_string()).unwrap();
        ExecSession {
            exec_id: exec_id.to_string(),
            output: rx,
        }
    }

    fn coordinator(runtime: MockContainerRuntime, secret: SecretFile, timeout: Option<Duration>) -> ShutdownCoordinator {
        ShutdownCoordinator::new(Arc::new(runtime), image(), secret, DrainPolicy::with_timeout(timeout))
    }

    fn credentials() -> CredentialManager {
        CredentialManager::from_static(SecretString::from("ghp_x"))
    }

    #[test]
    fn test_default_policy() {
        let policy = DrainPolicy::default();
        assert_eq!(policy.poll_interval, Duration::from_millis(500));
        assert!(policy.timeout.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_runs_stop_command_and_removes_secret() {
        let temp = TempDir::new().unwrap();
        let secret = SecretFile::new(temp.path().join("pat.txt"));
        secret.write(&SecretString::from("ghp_x")).unwrap();

        let polls = Arc::new(AtomicUsize::new(0));
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_list_containers()
            .returning(|_| Ok(vec![worker("a"), worker("b")]));
        runtime
            .expect_exec()
            .withf(|_, cmd| cmd == ["/bin/bash", "-c", "/actions-runner/stop.sh"])
            .times(2)
            .returning(|id, _| Ok(session(&format!("exec-{}", id))));
        let counter = polls.clone();
        runtime.expect_exec_status().returning(move |_| {
            // running on the first poll of each exec, finished on the second
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Ok(ExecStatus {
                running: n % 2 == 0,
                exit_code: if n % 2 == 0 { None } else { Some(0) },
            })
        });
        runtime.expect_remove_container().never();

        let report = coordinator(runtime, secret.clone(), None)
            .drain(&mut credentials())
            .await;

        assert_eq!(report.stopped, 2);
        assert_eq!(polls.load(Ordering::SeqCst), 4);
        assert!(!secret.path().exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_forces_removal() {
        let temp = TempDir::new().unwrap();
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_list_containers().returning(|_| Ok(vec![worker("hung")]));
        runtime.expect_exec().returning(|_, _| Ok(session("exec-hung")));
        runtime.expect_exec_status().returning(|_| {
            Ok(ExecStatus {
                running: true,
                exit_code: None,
            })
        });
        runtime
            .expect_remove_container()
            .withf(|id| id == "hung")
            .times(1)
            .returning(|_| Ok(()));

        let report = coordinator(
            runtime,
            SecretFile::new(temp.path().join("pat.txt")),
            Some(Duration::from_secs(2)),
        )
        .drain(&mut credentials())
        .await;

        assert_eq!(report.forced, 1);
        assert_eq!(report.stopped, 0);
    }

    #[tokio::test]
    async fn test_exec_failure_moves_to_next_container() {
        let temp = TempDir::new().unwrap();
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_list_containers()
            .returning(|_| Ok(vec![worker("gone"), worker("ok")]));
        runtime.expect_exec().times(2).returning(|id, _| {
            if id == "gone" {
                Err(Error::Runtime("No such container".into()))
            } else {
                Ok(session("exec-ok"))
            }
        });
        runtime.expect_exec_status().returning(|_| {
            Ok(ExecStatus {
                running: false,
                exit_code: Some(0),
            })
        });

        let report = coordinator(runtime, SecretFile::new(temp.path().join("pat.txt")), None)
            .drain(&mut credentials())
            .await;

        assert_eq!(report.failed, 1);
        assert_eq!(report.stopped, 1);
    }

    #[tokio::test]
    async fn test_inspect_failure_is_logged_and_skipped() {
        let temp = TempDir::new().unwrap();
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_list_containers().returning(|_| Ok(vec![worker("a")]));
        runtime.expect_exec().returning(|_, _| Ok(session("exec-a")));
        runtime
            .expect_exec_status()
            .times(1)
            .returning(|_| Err(Error::Runtime("no such exec instance".into())));

        let report = coordinator(runtime, SecretFile::new(temp.path().join("pat.txt")), None)
            .drain(&mut credentials())
            .await;
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_list_failure_still_removes_secret() {
        let temp = TempDir::new().unwrap();
        let secret = SecretFile::new(temp.path().join("pat.txt"));
        secret.write(&SecretString::from("ghp_x")).unwrap();

        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_list_containers()
            .returning(|_| Err(Error::Runtime("daemon unavailable".into())));
        runtime.expect_exec().never();

        let report = coordinator(runtime, secret.clone(), None)
            .drain(&mut credentials())
            .await;

        assert_eq!(report, DrainReport::default());
        assert!(!secret.path().exists());
    }

    #[tokio::test]
    async fn test_missing_secret_file_is_tolerated() {
        let temp = TempDir::new().unwrap();
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_list_containers().returning(|_| Ok(Vec::new()));

        let report = coordinator(runtime, SecretFile::new(temp.path().join("never-written")), None)
            .drain(&mut credentials())
            .await;
        assert_eq!(report, DrainReport::default());
    }

    fn expired_installation() -> crate::credential::Credential {
        crate::credential::Credential::Installation {
            token: SecretString::from("ghs_expired"),
            expires_at: Utc::now() - ChronoDuration::minutes(1),
        }
    }

    #[tokio::test]
    async fn test_drain_refreshes_expired_credential_once() {
        let temp = TempDir::new().unwrap();
        let mut issuer = MockTokenIssuer::new();
        issuer.expect_name().return_const("mock");
        let mut calls = 0;
        // First issue is the initial acquisition, second is the drain refresh
        issuer.expect_issue().times(2).returning(move || {
            calls += 1;
            if calls == 1 {
                Ok(expired_installation())
            } else {
                Ok(crate::credential::Credential::Installation {
                    token: SecretString::from("ghs_fresh"),
                    expires_at: Utc::now() + ChronoDuration::hours(1),
                })
            }
        });
        let mut credentials = CredentialManager::acquire(Arc::new(issuer)).await.unwrap();
        assert!(credentials.needs_refresh(Utc::now()));

        let mut runtime = MockContainerRuntime::new();
        runtime.expect_list_containers().returning(|_| Ok(Vec::new()));

        coordinator(runtime, SecretFile::new(temp.path().join("pat.txt")), None)
            .drain(&mut credentials)
            .await;

        assert!(!credentials.needs_refresh(Utc::now()));
    }

    #[tokio::test]
    async fn test_refresh_failure_does_not_block_drain() {
        let temp = TempDir::new().unwrap();
        let secret = SecretFile::new(temp.path().join("pat.txt"));
        secret.write(&SecretString::from("ghp_x")).unwrap();

        let mut issuer = MockTokenIssuer::new();
        issuer.expect_name().return_const("mock");
        let mut calls = 0;
        issuer.expect_issue().times(2).returning(move || {
            calls += 1;
            if calls == 1 {
                Ok(expired_installation())
            } else {
                Err(Error::AuthExchange("HTTP 401".into()))
            }
        });
        let mut credentials = CredentialManager::acquire(Arc::new(issuer)).await.unwrap();

        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_list_containers()
            .returning(|_| Ok(vec![worker("a"), worker("b")]));
        runtime
            .expect_exec()
            .times(2)
            .returning(|id, _| Ok(session(&format!("exec-{}", id))));
        runtime.expect_exec_status().returning(|_| {
            Ok(ExecStatus {
                running: false,
                exit_code: Some(0),
            })
        });

        let report = coordinator(runtime, secret.clone(), None)
            .drain(&mut credentials)
            .await;

        assert_eq!(report.stopped, 2);
        assert!(!secret.path().exists());
    }

    #[tokio::test]
    async fn test_signal_handlers_install_without_firing() {
        let signal = termination_signal().unwrap();
        let waited = tokio::time::timeout(Duration::from_millis(20), signal).await;
        assert!(waited.is_err());
    }
}
