//! Supervision of a fixed catalogue of long-lived services.
//!
//! Services are registered out of band through configuration and backed
//! either by a pre-created container (driven through the container CLI)
//! or by a shell command the supervisor spawns and owns. Status is always
//! derived fresh from the backing runtime; the supervisor keeps no "last
//! known" state, since containers and processes change state outside its
//! control.

pub mod container;

use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use container::ContainerCli;

use crate::config::SupervisorConfig;
use crate::error::SandboxError;

/// What runs behind a service name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backing {
    /// Pre-created container, addressed by name or id.
    Container { id: String },
    /// Shell command spawned and owned by the supervisor.
    Process { command: String },
}

/// Static registration of one supervised unit. Immutable for the life of
/// the service; only its derived status changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub backing: Backing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Running,
    Stopped,
    NotFound,
    Error,
}

/// Point-in-time status of one service, derived on demand.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub status: ServiceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ServiceStatus {
    fn bare(name: &str, status: ServiceState) -> Self {
        Self {
            name: name.to_string(),
            status,
            uptime_secs: None,
            cpu_percent: None,
            memory_bytes: None,
            detail: None,
        }
    }
}

/// A process-backed service the supervisor spawned and owns.
struct ManagedChild {
    child: Child,
    started_at: Instant,
}

pub struct ServiceSupervisor {
    catalogue: Vec<ServiceDescriptor>,
    runtime: ContainerCli,
    shell: String,
    kill_grace: Duration,
    managed: Mutex<HashMap<String, ManagedChild>>,
}

impl ServiceSupervisor {
    pub fn new(config: &SupervisorConfig, shell: impl Into<String>, kill_grace: Duration) -> Self {
        Self {
            catalogue: config.services.clone(),
            runtime: ContainerCli::new(&config.runtime),
            shell: shell.into(),
            kill_grace,
            managed: Mutex::new(HashMap::new()),
        }
    }

    fn descriptor(&self, name: &str) -> Result<&ServiceDescriptor, SandboxError> {
        self.catalogue
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| SandboxError::ServiceNotFound {
                name: name.to_string(),
            })
    }

    /// Status of every catalogued service, in registration order.
    pub async fn status_all(&self) -> Vec<ServiceStatus> {
        let mut statuses = Vec::with_capacity(self.catalogue.len());
        for descriptor in &self.catalogue {
            statuses.push(self.status_of(descriptor).await);
        }
        statuses
    }

    async fn status_of(&self, descriptor: &ServiceDescriptor) -> ServiceStatus {
        match &descriptor.backing {
            Backing::Container { id } => self.container_status(&descriptor.name, id).await,
            Backing::Process { .. } => self.process_status(&descriptor.name).await,
        }
    }

    async fn container_status(&self, name: &str, id: &str) -> ServiceStatus {
        let state = match self.runtime.inspect(id).await {
            Ok(Some(state)) => state,
            Ok(None) => return ServiceStatus::bare(name, ServiceState::NotFound),
            Err(e) => {
                let mut status = ServiceStatus::bare(name, ServiceState::Error);
                status.detail = Some(e.to_string());
                return status;
            }
        };

        let mut status = if state.is_running() {
            ServiceStatus::bare(name, ServiceState::Running)
        } else {
            ServiceStatus::bare(name, ServiceState::Stopped)
        };
        status.uptime_secs = state.uptime_secs();

        if state.is_running() {
            match self.runtime.stats(id).await {
                Ok(stats) => {
                    status.cpu_percent = stats.cpu_percent;
                    status.memory_bytes = stats.memory_bytes;
                }
                Err(e) => debug!(name, error = %e, "container stats unavailable"),
            }
        }

        status
    }

    async fn process_status(&self, name: &str) -> ServiceStatus {
        let mut managed = self.managed.lock().await;
        match managed.get_mut(name) {
            None => ServiceStatus::bare(name, ServiceState::Stopped),
            Some(entry) => match entry.child.try_wait() {
                Ok(None) => {
                    let mut status = ServiceStatus::bare(name, ServiceState::Running);
                    status.uptime_secs = Some(entry.started_at.elapsed().as_secs());
                    status
                }
                // Exited outside supervisor control; drop the stale entry.
                Ok(Some(_)) | Err(_) => {
                    managed.remove(name);
                    ServiceStatus::bare(name, ServiceState::Stopped)
                }
            },
        }
    }

    pub async fn start(&self, name: &str) -> Result<(), SandboxError> {
        let descriptor = self.descriptor(name)?;
        match &descriptor.backing {
            Backing::Container { id } => {
                self.runtime
                    .start(id)
                    .await
                    .map_err(|e| SandboxError::ServiceFailure {
                        name: name.to_string(),
                        reason: e.to_string(),
                    })?;
            }
            Backing::Process { command } => {
                let mut managed = self.managed.lock().await;
                if let Some(entry) = managed.get_mut(name)
                    && matches!(entry.child.try_wait(), Ok(None))
                {
                    debug!(name, "service already running");
                    return Ok(());
                }

                let child = Command::new(&self.shell)
                    .arg("-c")
                    .arg(command)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .spawn()
                    .map_err(|e| SandboxError::ServiceFailure {
                        name: name.to_string(),
                        reason: format!("failed to spawn: {e}"),
                    })?;

                managed.insert(
                    name.to_string(),
                    ManagedChild {
                        child,
                        started_at: Instant::now(),
                    },
                );
            }
        }
        debug!(name, "service started");
        Ok(())
    }

    /// Stop a service. Stopping a service that is not running is a no-op,
    /// matching container runtime behavior.
    pub async fn stop(&self, name: &str) -> Result<(), SandboxError> {
        let descriptor = self.descriptor(name)?;
        match &descriptor.backing {
            Backing::Container { id } => {
                self.runtime
                    .stop(id)
                    .await
                    .map_err(|e| SandboxError::ServiceFailure {
                        name: name.to_string(),
                        reason: e.to_string(),
                    })?;
            }
            Backing::Process { .. } => {
                let entry = {
                    let mut managed = self.managed.lock().await;
                    managed.remove(name)
                };
                if let Some(entry) = entry {
                    self.stop_child(name, entry).await?;
                }
            }
        }
        debug!(name, "service stopped");
        Ok(())
    }

    /// Stop followed by start. There is no atomicity between the two: a
    /// crash after the stop leaves the service stopped.
    pub async fn restart(&self, name: &str) -> Result<(), SandboxError> {
        self.stop(name).await?;
        self.start(name).await
    }

    /// SIGTERM, bounded grace period, then SIGKILL.
    async fn stop_child(&self, name: &str, mut entry: ManagedChild) -> Result<(), SandboxError> {
        #[cfg(unix)]
        if let Some(pid) = entry.child.id() {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            if tokio::time::timeout(self.kill_grace, entry.child.wait())
                .await
                .is_ok()
            {
                return Ok(());
            }
            warn!(name, pid, "service ignored SIGTERM, escalating to SIGKILL");
        }

        let _ = entry.child.start_kill();
        match tokio::time::timeout(self.kill_grace, entry.child.wait()).await {
            Ok(_) => Ok(()),
            Err(_) => Err(SandboxError::TerminationFailure {
                id: name.to_string(),
                reason: "service did not exit after SIGKILL".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor(services: Vec<ServiceDescriptor>) -> ServiceSupervisor {
        let config = SupervisorConfig {
            runtime: "docker".to_string(),
            services,
        };
        ServiceSupervisor::new(&config, "/bin/bash", Duration::from_secs(2))
    }

    fn sleeper(name: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            name: name.to_string(),
            backing: Backing::Process {
                command: "sleep 30".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn empty_catalogue_yields_empty_status() {
        let supervisor = supervisor(vec![]);
        assert!(supervisor.status_all().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_service_is_rejected() {
        let supervisor = supervisor(vec![]);
        for result in [
            supervisor.start("ghost").await,
            supervisor.stop("ghost").await,
            supervisor.restart("ghost").await,
        ] {
            assert!(matches!(result, Err(SandboxError::ServiceNotFound { .. })));
        }
    }

    #[tokio::test]
    async fn process_service_lifecycle() {
        let supervisor = supervisor(vec![sleeper("sleeper")]);

        // Not yet started: stopped, no uptime.
        let statuses = supervisor.status_all().await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].status, ServiceState::Stopped);
        assert!(statuses[0].uptime_secs.is_none());

        supervisor.start("sleeper").await.unwrap();
        let statuses = supervisor.status_all().await;
        assert_eq!(statuses[0].status, ServiceState::Running);
        assert!(statuses[0].uptime_secs.is_some());

        supervisor.stop("sleeper").await.unwrap();
        let statuses = supervisor.status_all().await;
        assert_eq!(statuses[0].status, ServiceState::Stopped);
    }

    #[tokio::test]
    async fn starting_a_running_service_is_a_no_op() {
        let supervisor = supervisor(vec![sleeper("sleeper")]);
        supervisor.start("sleeper").await.unwrap();
        supervisor.start("sleeper").await.unwrap();

        let statuses = supervisor.status_all().await;
        assert_eq!(statuses[0].status, ServiceState::Running);

        supervisor.stop("sleeper").await.unwrap();
    }

    #[tokio::test]
    async fn stopping_a_stopped_service_is_a_no_op() {
        let supervisor = supervisor(vec![sleeper("sleeper")]);
        supervisor.stop("sleeper").await.unwrap();
    }

    #[tokio::test]
    async fn restart_replaces_the_child() {
        let supervisor = supervisor(vec![sleeper("sleeper")]);
        supervisor.start("sleeper").await.unwrap();

        let first_pid = {
            let managed = supervisor.managed.lock().await;
            managed.get("sleeper").unwrap().child.id()
        };

        supervisor.restart("sleeper").await.unwrap();

        let second_pid = {
            let managed = supervisor.managed.lock().await;
            managed.get("sleeper").unwrap().child.id()
        };
        assert_ne!(first_pid, second_pid);

        supervisor.stop("sleeper").await.unwrap();
    }

    #[tokio::test]
    async fn status_order_follows_the_catalogue() {
        let supervisor = supervisor(vec![sleeper("b"), sleeper("a"), sleeper("c")]);
        let names: Vec<String> = supervisor
            .status_all()
            .await
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }
}
