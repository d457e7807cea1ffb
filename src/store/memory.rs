//! In-memory object store.
//!
//! Backs the `memory://` connection for local runs and doubles as the test
//! store: every operation is counted, every written body is recorded and
//! failures can be injected per operation.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ErrorCode, ObjectStore, Result, StoreError, StoreType};

/// Store operations, for call counting and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    ContainerExists,
    CreateContainer,
    Exists,
    Delete,
    Put,
    Get,
}

/// A failure to inject into an operation.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Service error with the given status and code.
    Status(u16, ErrorCode),
    /// Failure without a service response.
    Transport(String),
}

impl Fault {
    fn to_error(&self) -> StoreError {
        match self {
            Fault::Status(status, code) => {
                StoreError::service(*status, code.clone(), "injected fault")
            }
            Fault::Transport(message) => StoreError::Transport(message.clone()),
        }
    }
}

#[derive(Debug)]
struct FaultPlan {
    fault: Fault,
    /// Remaining failures; `None` fails forever.
    remaining: Option<usize>,
}

#[derive(Default)]
struct State {
    containers: HashSet<String>,
    objects: HashMap<(String, String), Vec<u8>>,
    calls: HashMap<StoreOp, usize>,
    puts: Vec<Vec<u8>>,
    faults: HashMap<StoreOp, FaultPlan>,
}

/// In-memory object store.
#[derive(Default)]
pub struct MemoryObjectStore {
    state: RwLock<State>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call to `op` with `fault`.
    pub async fn fail_always(&self, op: StoreOp, fault: Fault) {
        self.state.write().await.faults.insert(
            op,
            FaultPlan {
                fault,
                remaining: None,
            },
        );
    }

    /// Fail the next `times` calls to `op` with `fault`.
    pub async fn fail_times(&self, op: StoreOp, fault: Fault, times: usize) {
        if times == 0 {
            return;
        }
        self.state.write().await.faults.insert(
            op,
            FaultPlan {
                fault,
                remaining: Some(times),
            },
        );
    }

    pub async fn clear_faults(&self) {
        self.state.write().await.faults.clear();
    }

    /// Number of calls made to `op`, failed ones included.
    pub async fn calls(&self, op: StoreOp) -> usize {
        self.state
            .read()
            .await
            .calls
            .get(&op)
            .copied()
            .unwrap_or(0)
    }

    /// Total number of calls across all operations.
    pub async fn total_calls(&self) -> usize {
        self.state.read().await.calls.values().sum()
    }

    /// Bodies passed to `put`, in call order, failed ones included.
    pub async fn put_bodies(&self) -> Vec<Vec<u8>> {
        self.state.read().await.puts.clone()
    }

    pub async fn object_count(&self) -> usize {
        self.state.read().await.objects.len()
    }

    /// Count the call and return the injected fault, if any.
    fn enter(state: &mut State, op: StoreOp) -> Result<()> {
        *state.calls.entry(op).or_insert(0) += 1;

        let Some(plan) = state.faults.get_mut(&op) else {
            return Ok(());
        };
        let err = plan.fault.to_error();
        if let Some(n) = plan.remaining.as_mut() {
            *n = n.saturating_sub(1);
            if *n == 0 {
                state.faults.remove(&op);
            }
        }
        Err(err)
    }

    fn key(container: &str, name: &str) -> (String, String) {
        (container.to_string(), name.to_string())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn container_exists(&self, container: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        Self::enter(&mut state, StoreOp::ContainerExists)?;
        Ok(state.containers.contains(container))
    }

    async fn create_container(&self, container: &str) -> Result<()> {
        let mut state = self.state.write().await;
        Self::enter(&mut state, StoreOp::CreateContainer)?;
        if !state.containers.insert(container.to_string()) {
            return Err(StoreError::service(
                409,
                ErrorCode::ContainerAlreadyExists,
                format!("Container {} already exists", container),
            ));
        }
        Ok(())
    }

    async fn exists(&self, container: &str, name: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        Self::enter(&mut state, StoreOp::Exists)?;
        Ok(state.objects.contains_key(&Self::key(container, name)))
    }

    async fn delete(&self, container: &str, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        Self::enter(&mut state, StoreOp::Delete)?;
        state
            .objects
            .remove(&Self::key(container, name))
            .map(|_| ())
            .ok_or_else(|| StoreError::service(404, ErrorCode::ObjectNotFound, name))
    }

    async fn put(&self, container: &str, name: &str, body: &[u8]) -> Result<()> {
        let mut state = self.state.write().await;
        state.puts.push(body.to_vec());
        Self::enter(&mut state, StoreOp::Put)?;
        if !state.containers.contains(container) {
            return Err(StoreError::service(
                404,
                ErrorCode::ContainerNotFound,
                container,
            ));
        }
        state
            .objects
            .insert(Self::key(container, name), body.to_vec());
        Ok(())
    }

    async fn get(&self, container: &str, name: &str) -> Result<Vec<u8>> {
        let mut state = self.state.write().await;
        Self::enter(&mut state, StoreOp::Get)?;
        state
            .objects
            .get(&Self::key(container, name))
            .cloned()
            .ok_or_else(|| StoreError::service(404, ErrorCode::ObjectNotFound, name))
    }

    fn store_type(&self) -> StoreType {
        StoreType::Memory
    }
}
