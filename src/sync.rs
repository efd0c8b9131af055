//! Event loop keeping the hosts file in step with the container runtime.
//!
//! A single [`Synchronizer`] owns the registry.  Each lifecycle event is
//! handled to completion (registry mutation, render, atomic replace) before
//! the next one is read, so no locking is needed.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use anyhow::Result;
use futures_util::stream::StreamExt;
use log::{debug, error, info, warn};
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::sleep;

use crate::extract::{extract_record, ProxyRules};
use crate::error::HostsError;
use crate::hosts::{self, ApplySummary};
use crate::registry::ContainerRegistry;
use crate::runtime::ContainerRuntime;
use crate::types::{EventKind, LifecycleEvent};

/// Why watching the event stream stopped.
enum WatchEnd {
    Shutdown,
    Disconnected,
}

pub struct Synchronizer<R> {
    runtime: R,
    registry: ContainerRegistry,
    hosts_file: PathBuf,
    rules: ProxyRules,
    reconnect_delay: Duration,
}

impl<R: ContainerRuntime> Synchronizer<R> {
    pub fn new(
        runtime: R,
        hosts_file: impl Into<PathBuf>,
        rules: ProxyRules,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            runtime,
            registry: ContainerRegistry::new(),
            hosts_file: hosts_file.into(),
            rules,
            reconnect_delay,
        }
    }

    #[cfg(test)]
    pub fn registry(&self) -> &ContainerRegistry {
        &self.registry
    }

    /// Runs until `shutdown` resolves, then removes every managed entry.
    ///
    /// Returns an error only when the hosts file cannot be read or the
    /// initial container scan fails.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let started = tokio::select! {
            biased;
            _ = shutdown.as_mut() => None,
            started = self.bootstrap() => Some(started),
        };
        match started {
            Some(started) => started?,
            None => return self.shutdown(),
        }
        loop {
            if let WatchEnd::Shutdown = self.watch(&mut shutdown).await? {
                break;
            }

            // The stream cannot be resumed, so anything that happened while
            // it was down is picked up by a fresh scan.
            loop {
                warn!(
                    "Docker event stream lost. Rescanning in {:?}...",
                    self.reconnect_delay
                );
                tokio::select! {
                    biased;
                    _ = shutdown.as_mut() => return self.shutdown(),
                    _ = sleep(self.reconnect_delay) => {}
                }
                match self.rescan().await {
                    Ok(()) => break,
                    Err(e) => error!("Failed to rescan containers: {:#}", e),
                }
            }
            self.sync()?;
        }

        self.shutdown()
    }

    /// Builds the registry from the containers running now and writes the
    /// baseline hosts file.
    pub async fn bootstrap(&mut self) -> Result<()> {
        self.rescan().await?;
        self.sync()
    }

    /// Applies one lifecycle event.
    pub async fn handle_event(&mut self, event: LifecycleEvent) -> Result<()> {
        debug!("Handling {} for {}", event.kind.as_str(), event.id);
        match event.kind {
            EventKind::Start => {
                if self.track(&event.id).await {
                    info!("Container started: {}", event.id);
                    self.sync()?;
                }
            }
            EventKind::Stop | EventKind::Die | EventKind::Destroy => {
                // Docker sends die, stop and destroy for one container;
                // only the first one changes anything.
                if self.registry.remove(&event.id).is_some() {
                    info!("Container {}: {}", event.kind.as_str(), event.id);
                    self.sync()?;
                }
            }
        }
        Ok(())
    }

    async fn watch<F>(&mut self, shutdown: &mut Pin<&mut F>) -> Result<WatchEnd>
    where
        F: Future<Output = ()>,
    {
        let mut events = self.runtime.events();
        info!("Listening for Docker events...");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.as_mut() => return Ok(WatchEnd::Shutdown),
                next = events.next() => match next {
                    Some(Ok(event)) => self.handle_event(event).await?,
                    Some(Err(e)) => {
                        error!("Error in Docker event stream: {:#}", e);
                        return Ok(WatchEnd::Disconnected);
                    }
                    None => return Ok(WatchEnd::Disconnected),
                },
            }
        }
    }

    async fn rescan(&mut self) -> Result<()> {
        let ids = self.runtime.list_running().await?;
        self.registry.clear();
        for id in ids {
            self.track(&id).await;
        }
        info!("Scan found {} running containers", self.registry.len());
        Ok(())
    }

    /// Inspects `id` and stores its record.  A container that cannot be
    /// inspected (usually because it already exited) is skipped.
    async fn track(&mut self, id: &str) -> bool {
        match self.runtime.inspect(id).await {
            Ok(detail) => {
                let record = extract_record(id, &detail, &self.rules);
                for binding in &record.networks {
                    debug!(
                        "{} on {:?}: {} -> {:?}",
                        record.id, binding.name, binding.ip, binding.domains
                    );
                }
                self.registry.upsert(id, record);
                true
            }
            Err(e) => {
                warn!("Skipping container {}: {:#}", id, e);
                false
            }
        }
    }

    fn sync(&self) -> Result<()> {
        report(hosts::apply(&self.hosts_file, &self.registry))
    }

    fn shutdown(&mut self) -> Result<()> {
        info!("Removing all hosts before exit...");
        self.registry.clear();
        self.sync()
    }
}

/// Logs the outcome of an apply.  Only an unreadable hosts file stops the
/// loop; a failed write is retried on the next event.
fn report(outcome: Result<ApplySummary, HostsError>) -> Result<()> {
    match outcome {
        Ok(summary) => {
            debug!(
                "Managed region has {} lines (written: {})",
                summary.region_lines, summary.written
            );
            Ok(())
        }
        Err(e) if e.is_fatal() => Err(e.into()),
        Err(e) => {
            error!("{}", e);
            Ok(())
        }
    }
}

/// Registers SIGINT and SIGTERM handlers and returns a future resolving on
/// the first of them.  Both are installed before returning, so a signal that
/// arrives during the startup scan still takes the shutdown path.
pub fn shutdown_signal() -> std::io::Result<impl Future<Output = ()>> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => info!("Received SIGINT, shutting down..."),
            _ = terminate.recv() => info!("Received SIGTERM, shutting down..."),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosts::{END_MARKER, PROXY_MARKER, START_MARKER};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use bollard::models::{ContainerConfig, ContainerInspectResponse, NetworkSettings};
    use futures_util::future;
    use futures_util::stream::{self, BoxStream};
    use std::collections::{BTreeMap, HashMap, VecDeque};
    use std::fs;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    const PREFIX: &str = "127.0.0.1\tlocalhost\n";

    type Batch = Vec<Result<LifecycleEvent, &'static str>>;

    #[derive(Default)]
    struct MockState {
        running: BTreeMap<String, ContainerInspectResponse>,
        late: Vec<(String, ContainerInspectResponse)>,
        scan_delay: Duration,
        batches: VecDeque<Batch>,
        drained: Option<oneshot::Sender<()>>,
    }

    /// In-memory runtime.  Each `events()` call replays the next batch; the
    /// stream of the last batch signals `drained` and then stays open.
    /// Containers registered with `start_later` appear on first subscribe.
    #[derive(Clone, Default)]
    struct MockRuntime {
        state: Arc<Mutex<MockState>>,
    }

    impl MockRuntime {
        fn start(&self, id: &str, detail: ContainerInspectResponse) {
            self.state.lock().unwrap().running.insert(id.into(), detail);
        }

        fn start_later(&self, id: &str, detail: ContainerInspectResponse) {
            self.state.lock().unwrap().late.push((id.into(), detail));
        }

        fn slow_scan(&self, delay: Duration) {
            self.state.lock().unwrap().scan_delay = delay;
        }

        fn push_batch(&self, batch: Batch) {
            self.state.lock().unwrap().batches.push_back(batch);
        }

        fn on_drained(&self) -> oneshot::Receiver<()> {
            let (tx, rx) = oneshot::channel();
            self.state.lock().unwrap().drained = Some(tx);
            rx
        }
    }

    #[async_trait]
    impl ContainerRuntime for MockRuntime {
        async fn list_running(&self) -> Result<Vec<String>> {
            let (ids, delay) = {
                let state = self.state.lock().unwrap();
                let ids: Vec<String> = state.running.keys().cloned().collect();
                (ids, state.scan_delay)
            };
            if !delay.is_zero() {
                sleep(delay).await;
            }
            Ok(ids)
        }

        async fn inspect(&self, id: &str) -> Result<ContainerInspectResponse> {
            let detail = self.state.lock().unwrap().running.get(id).cloned();
            detail.ok_or_else(|| anyhow!("No such container: {}", id))
        }

        fn events(&self) -> BoxStream<'static, Result<LifecycleEvent>> {
            let mut state = self.state.lock().unwrap();
            let late = std::mem::take(&mut state.late);
            state.running.extend(late);
            let batch = state.batches.pop_front().unwrap_or_default();
            let items = stream::iter(batch.into_iter().map(|item| item.map_err(|e| anyhow!(e))));
            if !state.batches.is_empty() {
                return items.boxed();
            }
            let drained = state.drained.take();
            items
                .chain(stream::once(async move {
                    if let Some(tx) = drained {
                        let _ = tx.send(());
                    }
                    future::pending::<Result<LifecycleEvent>>().await
                }))
                .boxed()
        }
    }

    fn container(name: &str, ip: &str, image: &str, rule: Option<&str>) -> ContainerInspectResponse {
        let labels = rule
            .map(|rule| HashMap::from([("traefik.frontend.rule".to_string(), rule.to_string())]))
            .unwrap_or_default();
        ContainerInspectResponse {
            name: Some(format!("/{name}")),
            config: Some(ContainerConfig {
                hostname: Some(format!("{name}.local")),
                image: Some(image.to_string()),
                labels: Some(labels),
                ..Default::default()
            }),
            network_settings: Some(NetworkSettings {
                ip_address: Some(ip.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn setup() -> (TempDir, PathBuf, MockRuntime, Synchronizer<MockRuntime>) {
        let dir = TempDir::new().expect("create temp dir");
        let path = dir.path().join("hosts");
        fs::write(&path, PREFIX).expect("seed hosts file");
        let runtime = MockRuntime::default();
        let sync = Synchronizer::new(
            runtime.clone(),
            &path,
            ProxyRules::default(),
            Duration::ZERO,
        );
        (dir, path, runtime, sync)
    }

    fn read(path: &Path) -> String {
        fs::read_to_string(path).expect("read hosts file")
    }

    #[tokio::test]
    async fn bootstrap_writes_running_containers() {
        let (_dir, path, runtime, mut sync) = setup();
        runtime.start("c1", container("web1", "172.17.0.2", "nginx:1.25", None));
        runtime.start("c2", container("db", "172.17.0.3", "postgres:16", None));

        sync.bootstrap().await.expect("bootstrap");

        assert_eq!(sync.registry().len(), 2);
        assert_eq!(
            read(&path),
            format!(
                "{PREFIX}\n\n{START_MARKER}\n\
                 172.17.0.2    web1   web1.local\n\
                 172.17.0.3    db   db.local\n\
                 {END_MARKER}\n"
            )
        );
    }

    #[tokio::test]
    async fn start_and_stop_events_update_file() {
        let (_dir, path, runtime, mut sync) = setup();
        sync.bootstrap().await.expect("bootstrap");
        assert_eq!(read(&path), PREFIX);

        runtime.start("c1", container("web1", "172.17.0.2", "nginx:1.25", None));
        sync.handle_event(LifecycleEvent::new(EventKind::Start, "c1"))
            .await
            .expect("start");
        assert!(read(&path).contains("172.17.0.2    web1   web1.local"));

        sync.handle_event(LifecycleEvent::new(EventKind::Die, "c1"))
            .await
            .expect("die");
        assert_eq!(read(&path), PREFIX);
        assert!(sync.registry().is_empty());
    }

    #[tokio::test]
    async fn stop_for_unknown_container_does_not_touch_file() {
        let (_dir, path, _runtime, mut sync) = setup();
        sync.bootstrap().await.expect("bootstrap");

        // A re-render would now fail to read the file.
        fs::remove_file(&path).expect("remove hosts file");
        sync.handle_event(LifecycleEvent::new(EventKind::Destroy, "ghost"))
            .await
            .expect("unknown stop is a no-op");
    }

    #[tokio::test]
    async fn start_of_vanished_container_is_skipped() {
        let (_dir, path, _runtime, mut sync) = setup();
        sync.bootstrap().await.expect("bootstrap");

        sync.handle_event(LifecycleEvent::new(EventKind::Start, "gone"))
            .await
            .expect("inspect failure is not fatal");
        assert!(sync.registry().is_empty());
        assert_eq!(read(&path), PREFIX);
    }

    #[tokio::test]
    async fn unreadable_hosts_file_is_fatal() {
        let (_dir, path, _runtime, mut sync) = setup();
        fs::remove_file(&path).expect("remove hosts file");
        assert!(sync.bootstrap().await.is_err());
    }

    #[tokio::test]
    async fn proxy_claims_follow_events() {
        let (_dir, path, runtime, mut sync) = setup();
        runtime.start(
            "blog",
            container("blog", "172.17.0.4", "ghost:5", Some("Host:blog.example")),
        );
        runtime.start("proxy", container("traefik", "172.17.0.5", "traefik:1.7", None));
        sync.bootstrap().await.expect("bootstrap");

        let content = read(&path);
        assert!(content.contains("172.17.0.4    blog   blog.local\n"));
        assert!(content.contains(&format!("{PROXY_MARKER}\n172.17.0.5    blog.example\n")));

        sync.handle_event(LifecycleEvent::new(EventKind::Stop, "proxy"))
            .await
            .expect("stop proxy");
        let content = read(&path);
        assert!(!content.contains(PROXY_MARKER));
        assert!(!content.contains("blog.example"));
    }

    #[tokio::test]
    async fn run_cleans_up_on_shutdown() {
        let (_dir, path, runtime, mut sync) = setup();
        runtime.start("c1", container("web1", "172.17.0.2", "nginx:1.25", None));
        runtime.start("c2", container("web2", "172.17.0.3", "nginx:1.25", None));
        runtime.push_batch(vec![
            Ok(LifecycleEvent::new(EventKind::Stop, "c2")),
            Ok(LifecycleEvent::new(EventKind::Stop, "c2")),
        ]);
        let drained = runtime.on_drained();

        let seen = Arc::new(Mutex::new(String::new()));
        let snapshot = Arc::clone(&seen);
        let hosts = path.clone();
        let shutdown = async move {
            let _ = drained.await;
            *snapshot.lock().unwrap() = read(&hosts);
        };

        sync.run(shutdown).await.expect("run");

        let before_shutdown = seen.lock().unwrap().clone();
        assert!(before_shutdown.contains("172.17.0.2    web1"));
        assert!(!before_shutdown.contains("172.17.0.3"));
        assert!(sync.registry().is_empty());
        assert_eq!(read(&path), PREFIX);
    }

    #[tokio::test]
    async fn lost_stream_triggers_rescan() {
        let (_dir, path, runtime, mut sync) = setup();
        runtime.push_batch(vec![Err("connection reset")]);
        runtime.push_batch(Vec::new());
        let drained = runtime.on_drained();

        // Started after the initial scan; only a rescan can find it.
        runtime.start_later("c1", container("web1", "172.17.0.2", "nginx:1.25", None));

        let seen = Arc::new(Mutex::new(String::new()));
        let snapshot = Arc::clone(&seen);
        let hosts = path.clone();
        let shutdown = async move {
            let _ = drained.await;
            *snapshot.lock().unwrap() = read(&hosts);
        };

        sync.run(shutdown).await.expect("run");
        assert!(seen.lock().unwrap().contains("172.17.0.2    web1"));
        assert_eq!(read(&path), PREFIX);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn interrupt_during_startup_scan_cleans_up() {
        let (_dir, path, runtime, mut sync) = setup();
        let stale = format!("{PREFIX}\n\n{START_MARKER}\n10.9.9.9    gone\n{END_MARKER}\n");
        fs::write(&path, stale).expect("seed stale region");
        runtime.start("c1", container("web1", "172.17.0.2", "nginx:1.25", None));
        runtime.slow_scan(Duration::from_millis(500));

        let shutdown = shutdown_signal().expect("register signal handlers");
        let pid = std::process::id().to_string();
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            std::process::Command::new("kill")
                .args(["-INT", &pid])
                .status()
                .expect("send SIGINT");
        });

        sync.run(shutdown).await.expect("run");
        assert!(sync.registry().is_empty());
        assert_eq!(read(&path), PREFIX);
    }

    #[test]
    fn failed_write_keeps_loop_running() {
        let persist = HostsError::Persist {
            path: PathBuf::from("/etc/hosts"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert!(report(Err(persist)).is_ok());

        let write = HostsError::Write {
            path: PathBuf::from("/etc/hosts"),
            source: std::io::Error::from(std::io::ErrorKind::Other),
        };
        assert!(report(Err(write)).is_ok());

        let read = HostsError::Read {
            path: PathBuf::from("/etc/hosts"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(report(Err(read)).is_err());
    }
}
