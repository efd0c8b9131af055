use crate::types::LifecycleEvent;
use anyhow::Result;
use async_trait::async_trait;
use bollard::models::ContainerInspectResponse;
use futures_util::stream::BoxStream;

pub mod docker;
pub use docker::DockerRuntime;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Ids of the containers running right now.
    async fn list_running(&self) -> Result<Vec<String>>;

    /// Raw metadata for one container.
    async fn inspect(&self, id: &str) -> Result<ContainerInspectResponse>;

    /// Subscribes to container lifecycle events.  The stream runs until the
    /// connection drops; call again to resubscribe.
    fn events(&self) -> BoxStream<'static, Result<LifecycleEvent>>;
}
