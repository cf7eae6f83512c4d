//! HistoryService: the single entry point wiring the log, router, registry,
//! query engine and timeline reconstructor together.

use std::collections::BTreeMap;
use std::sync::Arc;

use arbor_events::{
    AppendEvent, AppendOptions, Appended, Category, EventLog, EventStorage, EventType,
    HistoryError, MemoryStorage, PartitionId, PgStorage, ReadOptions, Result, StoredEvent,
};
use serde_json::Value;
use tracing::{debug, info};

use crate::codec::{decode, encode, HistoryEntry, Signal};
use crate::config::{Backend, HistoryConfig};
use crate::filter::Filter;
use crate::query::{AgentActivity, QueryEngine};
use crate::registry::{PartitionInfo, PartitionRegistry};
use crate::router::route;
use crate::timeline::{CausalChain, Direction, Span, Timeline, TimelineReconstructor};

#[derive(Clone)]
pub struct HistoryService {
    log: EventLog,
    registry: Arc<PartitionRegistry>,
    queries: QueryEngine,
    timeline: TimelineReconstructor,
}

impl HistoryService {
    /// Open the configured backend and seed the registry from what it holds.
    pub async fn start(config: HistoryConfig) -> Result<Self> {
        config.log_redacted();
        let storage: Arc<dyn EventStorage> = match &config.backend {
            Backend::Memory => Arc::new(MemoryStorage::new()),
            Backend::Postgres { database_url } => {
                let pg = PgStorage::connect(database_url, config.pg_max_connections).await?;
                if config.run_migrations {
                    pg.migrate().await?;
                }
                Arc::new(pg)
            }
        };
        Self::with_storage(storage, &config).await
    }

    /// Start over caller-supplied storage.
    pub async fn with_storage(storage: Arc<dyn EventStorage>, config: &HistoryConfig) -> Result<Self> {
        let summaries = storage.partition_summaries().await?;
        let log = EventLog::open(storage).await?;

        let registry = Arc::new(PartitionRegistry::new());
        registry.seed(summaries);

        info!(
            partitions = registry.len(),
            causal_depth_limit = config.causal_depth_limit,
            "History service started"
        );

        Ok(Self {
            queries: QueryEngine::new(log.clone()),
            timeline: TimelineReconstructor::new(log.clone()).with_max_depth(config.causal_depth_limit),
            log,
            registry,
        })
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    // --- Write surface ---------------------------------------------------

    /// Encode, route and fan out one signal. Returns every copy, `global`
    /// first.
    pub async fn record_signal(&self, signal: &Signal) -> Result<Vec<StoredEvent>> {
        self.record(encode(signal)).await
    }

    /// Route and fan out an already-encoded event.
    pub async fn record(&self, event: AppendEvent) -> Result<Vec<StoredEvent>> {
        let partitions = route(&event);
        let appended = self.log.append_fanout_detailed(&partitions, event).await?;
        Ok(self.account(appended))
    }

    /// Append to one named partition (and `global`), bypassing the router.
    pub async fn append(
        &self,
        partition: &PartitionId,
        event_type: EventType,
        payload: Value,
        opts: AppendOptions,
    ) -> Result<StoredEvent> {
        let appended = self
            .log
            .append_detailed(partition, event_type, payload, opts)
            .await?;
        self.account(appended)
            .into_iter()
            .find(|e| &e.partition_id == partition)
            .ok_or_else(|| HistoryError::NotFound(format!("copy in {partition}")))
    }

    fn account(&self, appended: Appended) -> Vec<StoredEvent> {
        for copy in &appended.written {
            self.registry.record(copy);
        }
        appended.copies
    }

    // --- Query surface ---------------------------------------------------

    pub async fn read(&self, partition: &PartitionId, options: ReadOptions) -> Result<Vec<HistoryEntry>> {
        self.queries.read(partition, options).await
    }

    pub async fn query(&self, filter: &Filter) -> Result<Vec<HistoryEntry>> {
        self.queries.query(filter).await
    }

    pub async fn get_event(&self, event_id: &str) -> Result<HistoryEntry> {
        Ok(decode(&self.log.get_event(event_id).await?))
    }

    pub async fn span_query(&self, span: &Span) -> Result<Timeline> {
        self.timeline.reconstruct(span).await
    }

    pub async fn causal_chain(
        &self,
        event_id: &str,
        direction: Direction,
        max_depth: Option<usize>,
    ) -> Result<CausalChain> {
        self.timeline.causal_chain(event_id, direction, max_depth).await
    }

    pub fn list_partitions(&self) -> Vec<PartitionId> {
        self.registry.list_partitions()
    }

    pub fn partition_info(&self, partition: &PartitionId) -> Result<PartitionInfo> {
        self.registry.partition_info(partition)
    }

    pub async fn find_by_external_id(&self, signal_id: &str) -> Result<HistoryEntry> {
        self.queries.find_by_external_id(signal_id).await
    }

    pub async fn count_by_category(&self, filter: &Filter) -> Result<BTreeMap<Category, usize>> {
        self.queries.count_by_category(filter).await
    }

    pub async fn type_distribution(&self, filter: &Filter) -> Result<BTreeMap<String, usize>> {
        self.queries.type_distribution(filter).await
    }

    pub async fn agent_activity(&self, agent_id: &str, filter: &Filter) -> Result<AgentActivity> {
        self.queries.agent_activity(agent_id, filter).await
    }

    pub async fn error_count(&self, filter: &Filter) -> Result<usize> {
        self.queries.error_count(filter).await
    }

    /// Rows the storage skipped because they could not be decoded.
    pub fn decode_failures(&self) -> u64 {
        self.log.decode_failures()
    }

    // --- Lifecycle -------------------------------------------------------

    /// Drop every event and forget every partition.
    pub async fn reset(&self) -> Result<()> {
        self.log.reset().await?;
        self.registry.reset();
        debug!("History reset");
        Ok(())
    }

    pub async fn shutdown(self) {
        self.log.close().await;
        self.registry.reset();
        info!("History service stopped");
    }
}
