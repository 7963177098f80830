//! In-memory provider for tests

use crate::provider::{
    Outputs, ProviderError, ProviderHandle, ProviderResult, ResolvedConfig, ResourceProvider,
};
use async_trait::async_trait;
use stackflow_core::{ResourceAddress, ResourceKind};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
struct MockState {
    next_id: u64,
    resources: BTreeMap<ProviderHandle, (ResourceAddress, ResourceKind, ResolvedConfig)>,
    revisions: BTreeMap<ProviderHandle, u32>,
    calls: Vec<String>,
    failures: BTreeMap<(String, &'static str), VecDeque<ProviderError>>,
    omitted_outputs: BTreeSet<(String, String)>,
    in_flight: usize,
    max_in_flight: usize,
}

/// Provider that keeps resources in memory and records every call
///
/// Calls are logged as `"<op> <stack.resource>"`, e.g. `"create app.net"`.
/// Outputs are `"<handle>:<attribute>"`, suffixed with `@<n>` after the
/// n-th update.
#[derive(Debug, Default)]
pub struct MockProvider {
    state: Mutex<MockState>,
    delay: Duration,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every mutating call take this long
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue errors returned by `op` on `address` before it starts succeeding
    pub fn fail(
        &self,
        address: &str,
        op: &'static str,
        errors: impl IntoIterator<Item = ProviderError>,
    ) {
        self.lock()
            .failures
            .entry((address.to_string(), op))
            .or_default()
            .extend(errors);
    }

    /// Leave an attribute out of `describe` for the given resource
    pub fn omit_output(&self, address: &str, attribute: &str) {
        self.lock()
            .omitted_outputs
            .insert((address.to_string(), attribute.to_string()));
    }

    /// Every call, in order
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Calls other than `describe`
    pub fn mutating_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !c.starts_with("describe "))
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.lock().max_in_flight
    }

    pub fn resource_count(&self) -> usize {
        self.lock().resources.len()
    }

    /// Current config of the resource created for `address`
    pub fn config_of(&self, address: &str) -> Option<ResolvedConfig> {
        self.lock()
            .resources
            .values()
            .find(|(a, _, _)| a.to_string() == address)
            .map(|(_, _, config)| config.clone())
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn address_of(&self, handle: &ProviderHandle) -> ProviderResult<ResourceAddress> {
        self.lock()
            .resources
            .get(handle)
            .map(|(address, _, _)| address.clone())
            .ok_or_else(|| ProviderError::not_found(format!("unknown handle {}", handle)))
    }

    /// Log the call and pop a queued failure, if any
    async fn enter(&self, op: &'static str, address: &ResourceAddress) -> ProviderResult<()> {
        let failure = {
            let mut state = self.lock();
            state.calls.push(format!("{} {}", op, address));
            state
                .failures
                .get_mut(&(address.to_string(), op))
                .and_then(|queue| queue.pop_front())
        };
        if let Some(err) = failure {
            return Err(err);
        }

        if op != "describe" && !self.delay.is_zero() {
            {
                let mut state = self.lock();
                state.in_flight += 1;
                state.max_in_flight = state.max_in_flight.max(state.in_flight);
            }
            tokio::time::sleep(self.delay).await;
            self.lock().in_flight -= 1;
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn create(
        &self,
        address: &ResourceAddress,
        kind: ResourceKind,
        config: &ResolvedConfig,
    ) -> ProviderResult<ProviderHandle> {
        self.enter("create", address).await?;
        let mut state = self.lock();
        state.next_id += 1;
        let handle = ProviderHandle::new(format!("mock-{}", state.next_id));
        state
            .resources
            .insert(handle.clone(), (address.clone(), kind, config.clone()));
        Ok(handle)
    }

    async fn update(
        &self,
        handle: &ProviderHandle,
        _kind: ResourceKind,
        delta: &ResolvedConfig,
    ) -> ProviderResult<()> {
        let address = self.address_of(handle)?;
        self.enter("update", &address).await?;
        let mut state = self.lock();
        *state.revisions.entry(handle.clone()).or_default() += 1;
        if let Some((_, _, config)) = state.resources.get_mut(handle) {
            for (key, value) in delta {
                if value.is_null() {
                    config.remove(key);
                } else {
                    config.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(())
    }

    async fn destroy(&self, handle: &ProviderHandle, _kind: ResourceKind) -> ProviderResult<()> {
        let address = self.address_of(handle)?;
        self.enter("destroy", &address).await?;
        let mut state = self.lock();
        state.resources.remove(handle);
        state.revisions.remove(handle);
        Ok(())
    }

    async fn describe(
        &self,
        handle: &ProviderHandle,
        kind: ResourceKind,
    ) -> ProviderResult<Outputs> {
        let address = self.address_of(handle)?;
        self.enter("describe", &address).await?;
        let state = self.lock();
        let revision = state.revisions.get(handle).copied().unwrap_or(0);
        Ok(kind
            .schema()
            .outputs
            .iter()
            .filter(|attr| {
                !state
                    .omitted_outputs
                    .contains(&(address.to_string(), attr.to_string()))
            })
            .map(|attr| {
                let value = match revision {
                    0 => format!("{}:{}", handle, attr),
                    n => format!("{}:{}@{}", handle, attr, n),
                };
                (attr.to_string(), value)
            })
            .collect())
    }
}
