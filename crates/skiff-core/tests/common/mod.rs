//! Recording in-memory container runtime shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use skiff_core::{PoolConfig, PoolConfigBuilder, SandboxPool};
use skiff_runtime::{
    ContainerFilter, ContainerRuntime, ContainerSpec, ContainerSummary, Result, RuntimeError,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One runtime call, in the order it was made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create { port: Option<u16>, idle: bool },
    Start(String),
    Pause(String),
    Unpause(String),
    Stop(String),
    Remove(String),
    List,
    Health(u16),
}

#[derive(Default)]
pub struct FakeRuntime {
    calls: Mutex<Vec<Call>>,
    next_id: AtomicUsize,
    orphans: Mutex<Vec<ContainerSummary>>,
    pub fail_create: AtomicBool,
    pub fail_pause: AtomicBool,
    pub fail_unpause: AtomicBool,
    pub fail_list: AtomicBool,
    /// Number of upcoming health checks that should time out.
    pub failing_health_checks: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| matches(c)).count()
    }

    pub fn creates(&self) -> usize {
        self.count(|c| matches!(c, Call::Create { .. }))
    }

    pub fn position(&self, call: &Call) -> Option<usize> {
        self.calls().iter().position(|c| c == call)
    }

    pub fn add_orphan(&self, id: &str) {
        let mut labels = BTreeMap::new();
        labels.insert(
            skiff_runtime::OWNER_LABEL_KEY.to_string(),
            skiff_runtime::OWNER_LABEL_VALUE.to_string(),
        );
        self.orphans.lock().unwrap().push(ContainerSummary {
            id: id.to_string(),
            names: vec![format!("/{id}")],
            image: "block-runner:test".to_string(),
            state: "exited".to_string(),
            labels,
        });
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn backend_name(&self) -> &'static str {
        "fake"
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.record(Call::Create {
            port: spec.port.map(|p| p.host_port),
            idle: spec.command.is_some(),
        });
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(RuntimeError::Api {
                status: 500,
                message: "image not found".into(),
            });
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("c{n}"))
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.record(Call::Start(id.to_string()));
        Ok(())
    }

    async fn pause_container(&self, id: &str) -> Result<()> {
        self.record(Call::Pause(id.to_string()));
        if self.fail_pause.load(Ordering::SeqCst) {
            return Err(RuntimeError::Api {
                status: 409,
                message: "container is not running".into(),
            });
        }
        Ok(())
    }

    async fn unpause_container(&self, id: &str) -> Result<()> {
        self.record(Call::Unpause(id.to_string()));
        if self.fail_unpause.load(Ordering::SeqCst) {
            return Err(RuntimeError::Api {
                status: 500,
                message: "cgroup thaw failed".into(),
            });
        }
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        self.record(Call::Stop(id.to_string()));
        Ok(())
    }

    async fn remove_container(&self, id: &str, _force: bool) -> Result<()> {
        self.record(Call::Remove(id.to_string()));
        Ok(())
    }

    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSummary>> {
        self.record(Call::List);
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(RuntimeError::Connection("daemon not reachable".into()));
        }
        Ok(self
            .orphans
            .lock()
            .unwrap()
            .iter()
            .filter(|c| filter.matches(&c.labels))
            .cloned()
            .collect())
    }

    async fn health_check(&self, port: u16, _interval: Duration, timeout: Duration) -> Result<()> {
        self.record(Call::Health(port));
        let failing = self.failing_health_checks.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_health_checks.store(failing - 1, Ordering::SeqCst);
            return Err(RuntimeError::HealthTimeout { port, timeout });
        }
        Ok(())
    }
}

/// Test config: small pool, fast health checks.
pub fn config() -> PoolConfigBuilder {
    PoolConfig::builder()
        .image("block-runner:test")
        .max_sandboxes(2)
        .health_check_interval(Duration::from_millis(10))
        .health_check_timeout(Duration::from_millis(100))
        .dormancy_timeout(Duration::from_secs(60))
        .ports(50000, 50009)
}

pub fn pool(config: PoolConfigBuilder) -> (SandboxPool, Arc<FakeRuntime>) {
    let runtime = FakeRuntime::new();
    let pool = SandboxPool::new(config.build().unwrap(), runtime.clone()).unwrap();
    (pool, runtime)
}
