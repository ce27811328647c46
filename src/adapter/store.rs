//! Registry of running adapters keyed by name

use super::AdapterService;
use crate::config::AdapterConfig;
use crate::registry::Registry;
use crate::scheduler::Scheduler;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub struct AdapterStore {
    registry: Arc<Registry>,
    scheduler: Scheduler,
    services: Mutex<HashMap<String, Arc<AdapterService>>>,
}

impl AdapterStore {
    pub fn new(registry: Arc<Registry>, scheduler: Scheduler) -> Self {
        Self {
            registry,
            scheduler,
            services: Mutex::new(HashMap::new()),
        }
    }

    /// Start every enabled adapter. An adapter that cannot be built is
    /// logged and skipped. Returns how many adapters were started.
    pub async fn start(&self, configs: &[AdapterConfig]) -> usize {
        let mut started = 0;
        for config in configs {
            if !config.enabled {
                debug!(adapter = %config.name, "Adapter disabled, skipping");
                continue;
            }
            debug!(adapter = %config.name, provider = %config.provider, "Starting an adapter");

            let service = match AdapterService::new(config, &self.registry, self.scheduler.clone())
            {
                Ok(service) => service,
                Err(e) => {
                    error!(adapter = %config.name, provider = %config.provider, error = %e, "Failed to create adapter");
                    continue;
                }
            };
            self.add(Arc::clone(&service)).await;
            service.start().await;
            started += 1;
        }
        info!(started, configured = configs.len(), "Adapters started");
        started
    }

    /// Register an adapter, stopping any previous one with the same name.
    /// The previous adapter shares the timer prefix, so it is stopped before
    /// the new one is started.
    pub async fn add(&self, service: Arc<AdapterService>) {
        let previous = self
            .services
            .lock()
            .await
            .insert(service.name().to_string(), service);
        if let Some(previous) = previous {
            warn!(adapter = %previous.name(), "Adapter name registered twice, stopping the older one");
            previous.stop().await;
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<AdapterService>> {
        self.services.lock().await.get(name).cloned()
    }

    /// Names of registered adapters, sorted
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.services.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.services.lock().await.is_empty()
    }

    /// Stop and remove every adapter
    pub async fn close_all(&self) {
        let services: Vec<Arc<AdapterService>> = {
            let mut services = self.services.lock().await;
            services.drain().map(|(_, service)| service).collect()
        };
        for service in services {
            service.stop().await;
        }
        info!("All adapters stopped");
    }
}
