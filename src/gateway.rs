use crate::error::{ConnectError, FetchError, TerminateError};
use crate::filter::FilterCriteria;
use crate::model::{OpId, Operation};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ServerFilter {
    pub namespace_prefix: Option<String>,
    pub include_system: bool,
    pub opid: Option<OpId>,
}

impl ServerFilter {
    pub fn listing(namespace_scope: Option<&str>, criteria: &FilterCriteria) -> Self {
        Self {
            namespace_prefix: namespace_scope
                .map(str::trim)
                .filter(|scope| !scope.is_empty())
                .map(str::to_string),
            include_system: criteria.show_system_ops(),
            opid: None,
        }
    }

    pub fn verification(id: &OpId) -> Self {
        Self {
            namespace_prefix: None,
            include_system: true,
            opid: Some(id.clone()),
        }
    }
}

#[async_trait]
pub trait OperationsGateway: Send + Sync {
    async fn connect(&self) -> Result<(), ConnectError>;

    async fn fetch_operations(&self, filter: &ServerFilter) -> Result<Vec<Operation>, FetchError>;

    async fn terminate(&self, id: &OpId) -> Result<(), TerminateError>;

    fn endpoint(&self) -> String;

    async fn close(&self);
}

pub struct SerializedGateway {
    inner: Arc<dyn OperationsGateway>,
    lock: Mutex<()>,
}

impl SerializedGateway {
    pub fn new(inner: Arc<dyn OperationsGateway>) -> Self {
        Self {
            inner,
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl OperationsGateway for SerializedGateway {
    async fn connect(&self) -> Result<(), ConnectError> {
        let _guard = self.lock.lock().await;
        self.inner.connect().await
    }

    async fn fetch_operations(&self, filter: &ServerFilter) -> Result<Vec<Operation>, FetchError> {
        let _guard = self.lock.lock().await;
        debug!("fetching operations with {:?}", filter);
        self.inner.fetch_operations(filter).await
    }

    async fn terminate(&self, id: &OpId) -> Result<(), TerminateError> {
        let _guard = self.lock.lock().await;
        debug!("terminating operation {}", id);
        self.inner.terminate(id).await
    }

    fn endpoint(&self) -> String {
        self.inner.endpoint()
    }

    async fn close(&self) {
        let _guard = self.lock.lock().await;
        self.inner.close().await;
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::{OperationsGateway, ServerFilter};
    use crate::error::{ConnectError, FetchError, TerminateError};
    use crate::model::{OpId, Operation};
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    pub struct FakeGateway {
        operations: Mutex<Vec<Operation>>,
        fetch_failures: Mutex<VecDeque<FetchError>>,
        terminate_failures: Mutex<HashMap<OpId, TerminateError>>,
        survivors: Mutex<HashSet<OpId>>,
        fetch_delay: Mutex<Option<Duration>>,
        connect_delay: Mutex<Option<Duration>>,
        pub connect_calls: AtomicUsize,
        pub fetch_calls: AtomicUsize,
        pub terminate_calls: AtomicUsize,
        active: AtomicUsize,
        pub max_active: AtomicUsize,
    }

    impl FakeGateway {
        pub fn with_operations(operations: Vec<Operation>) -> Self {
            Self {
                operations: Mutex::new(operations),
                ..Self::default()
            }
        }

        pub fn fail_next_fetch(&self, error: FetchError) {
            self.fetch_failures.lock().unwrap().push_back(error);
        }

        pub fn fail_terminate(&self, id: &str, error: TerminateError) {
            self.terminate_failures
                .lock()
                .unwrap()
                .insert(OpId::new(id), error);
        }

        pub fn ignore_kill(&self, id: &str) {
            self.survivors.lock().unwrap().insert(OpId::new(id));
        }

        pub fn set_fetch_delay(&self, delay: Duration) {
            *self.fetch_delay.lock().unwrap() = Some(delay);
        }

        pub fn set_connect_delay(&self, delay: Duration) {
            *self.connect_delay.lock().unwrap() = Some(delay);
        }

        pub fn contains(&self, id: &str) -> bool {
            let id = OpId::new(id);
            self.operations
                .lock()
                .unwrap()
                .iter()
                .any(|op| op.id == id)
        }

        fn admits(filter: &ServerFilter, op: &Operation) -> bool {
            if !filter.include_system && op.is_system {
                return false;
            }
            if let Some(id) = &filter.opid
                && &op.id != id
            {
                return false;
            }
            filter.namespace_prefix.as_deref().is_none_or(|prefix| {
                op.namespace
                    .to_ascii_lowercase()
                    .starts_with(&prefix.to_ascii_lowercase())
            })
        }

        fn enter(&self) {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
        }

        fn leave(&self) {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl OperationsGateway for FakeGateway {
        async fn connect(&self) -> Result<(), ConnectError> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.connect_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(())
        }

        async fn fetch_operations(
            &self,
            filter: &ServerFilter,
        ) -> Result<Vec<Operation>, FetchError> {
            self.enter();
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.fetch_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let failure = self.fetch_failures.lock().unwrap().pop_front();
            let result = match failure {
                Some(error) => Err(error),
                None => Ok(self
                    .operations
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|op| Self::admits(filter, op))
                    .cloned()
                    .collect()),
            };
            self.leave();
            result
        }

        async fn terminate(&self, id: &OpId) -> Result<(), TerminateError> {
            self.enter();
            self.terminate_calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            let result = if let Some(error) = self.terminate_failures.lock().unwrap().get(id) {
                Err(error.clone())
            } else if self.survivors.lock().unwrap().contains(id) {
                Ok(())
            } else {
                let mut operations = self.operations.lock().unwrap();
                let before = operations.len();
                operations.retain(|op| &op.id != id);
                if operations.len() == before {
                    Err(TerminateError::NotFound(id.to_string()))
                } else {
                    Ok(())
                }
            };
            self.leave();
            result
        }

        fn endpoint(&self) -> String {
            "fake:27017".to_string()
        }

        async fn close(&self) {}
    }
}
