use super::ContainerRuntime;
use crate::types::{EventKind, LifecycleEvent};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::{ContainerInspectResponse, EventMessage, EventMessageTypeEnum};
use bollard::system::EventsOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::future;
use futures_util::stream::{BoxStream, StreamExt};
use log::{debug, info};
use std::collections::HashMap;

/// Seconds before a request to the Docker daemon times out.
const REQUEST_TIMEOUT: u64 = 120;

/// Event actions forwarded to the synchronizer.
const WATCHED_ACTIONS: [&str; 4] = ["start", "stop", "die", "destroy"];

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects to the Docker daemon listening on `socket`.
    pub fn connect(socket: &str) -> Result<Self> {
        let path = socket.trim_start_matches("unix://");
        let docker = Docker::connect_with_socket(path, REQUEST_TIMEOUT, API_DEFAULT_VERSION)
            .with_context(|| format!("Failed to connect to Docker at {}", path))?;
        info!("Connected to Docker at {}", path);
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_running(&self) -> Result<Vec<String>> {
        let opts = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(opts)).await?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInspectResponse> {
        self.docker
            .inspect_container(id, None)
            .await
            .with_context(|| format!("Failed to inspect container {}", id))
    }

    fn events(&self) -> BoxStream<'static, Result<LifecycleEvent>> {
        let opts = EventsOptions::<String> {
            filters: [
                ("type", ["container"].as_slice()),
                ("event", WATCHED_ACTIONS.as_slice()),
            ]
            .iter()
            .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
            .collect::<HashMap<_, _>>(),
            ..Default::default()
        };

        self.docker
            .events(Some(opts))
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(event) => lifecycle_event(event).map(Ok),
                    Err(e) => Some(Err(e.into())),
                })
            })
            .boxed()
    }
}

/// Converts a raw Docker event, dropping anything that is not a watched
/// container lifecycle transition.
fn lifecycle_event(event: EventMessage) -> Option<LifecycleEvent> {
    if event.typ != Some(EventMessageTypeEnum::CONTAINER) {
        return None;
    }
    let action = event.action.unwrap_or_default();
    let id = event.actor.and_then(|actor| actor.id).unwrap_or_default();
    debug!("Container event: {} for {}", action, id);

    let kind = EventKind::from_action(&action)?;
    if id.is_empty() {
        return None;
    }
    Some(LifecycleEvent::new(kind, id))
}
