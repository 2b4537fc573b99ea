//! Construction of the ledger core: storage, managers, background workers.

use std::sync::Arc;

use uuid::Uuid;

use crate::account::manager::AccountManager;
use crate::chain::blocks::BlockStore;
use crate::chain::events::EventStore;
use crate::config::LedgerConfig;
use crate::error::Result;
use crate::outbox::webhook::WebhookPublisher;
use crate::outbox::{EventPublisher, OutboxProcessor};
use crate::ratelimit::{MemoryRateLimiter, RateLimiterBackend};
use crate::recon::Reconciler;
use crate::schema::{dictionary, migrator::Migrator};
use crate::store::{dialect, Store};
use crate::transaction::idempotency;
use crate::transaction::manager::TransactionManager;
use crate::worker::{WorkerDef, WorkerRuntime};

#[derive(Clone)]
pub struct LedgerCore {
    pub config: Arc<LedgerConfig>,
    pub store: Store,
    pub events: EventStore,
    pub blocks: BlockStore,
    pub accounts: AccountManager,
    pub transactions: TransactionManager,
    pub outbox: OutboxProcessor,
    pub recon: Reconciler,
    pub rate_limiter: Option<Arc<dyn RateLimiterBackend>>,
    pub default_ledger_id: Uuid,
}

/// Connect, migrate, and wire every manager. The webhook engine is the
/// default publisher; embedders pass their own to intercept delivery.
pub async fn new_ledger_core(
    config: LedgerConfig,
    publisher: Option<Arc<dyn EventPublisher>>,
) -> Result<LedgerCore> {
    let config = Arc::new(config);
    let store = Store::connect(&config.database_url, &config.schema).await?;

    Migrator::new(store.clone())
        .migrate("baseline", &dictionary())
        .await?;

    let default_ledger_id = ensure_default_ledger(&store).await?;

    let events = EventStore::new(store.clone());
    let blocks = BlockStore::new(store.clone());
    let accounts = AccountManager::new(store.clone(), events.clone(), config.clone());
    let transactions = TransactionManager::new(
        store.clone(),
        events.clone(),
        accounts.clone(),
        config.clone(),
    );
    let publisher =
        publisher.unwrap_or_else(|| Arc::new(WebhookPublisher::new(store.clone())) as Arc<dyn EventPublisher>);
    let outbox = OutboxProcessor::new(
        store.clone(),
        publisher,
        config.advanced.outbox_max_retries,
        config.advanced.outbox_batch_size,
    );
    let recon = Reconciler::new(store.clone(), blocks.clone());
    let rate_limiter: Option<Arc<dyn RateLimiterBackend>> = if config.rate_limit.enabled {
        Some(Arc::new(MemoryRateLimiter::new()))
    } else {
        None
    };

    Ok(LedgerCore {
        config,
        store,
        events,
        blocks,
        accounts,
        transactions,
        outbox,
        recon,
        rate_limiter,
        default_ledger_id,
    })
}

/// Requests without an X-Ledger-Id header fall back to this tenant.
async fn ensure_default_ledger(store: &Store) -> Result<Uuid> {
    let table = store.table("ledger");
    let existing: Option<Uuid> = sqlx::query_scalar(&format!(
        "SELECT id FROM {table} WHERE name = 'default' ORDER BY created_at ASC LIMIT 1"
    ))
    .fetch_optional(store.pool())
    .await?;
    match existing {
        Some(id) => Ok(id),
        None => {
            let id: Uuid = sqlx::query_scalar(&format!(
                "INSERT INTO {table} (name) VALUES ('default') {}",
                dialect::returning(&["id"])
            ))
            .fetch_one(store.pool())
            .await?;
            Ok(id)
        }
    }
}

/// Register the full background worker set and start it.
pub fn start_workers(core: &LedgerCore) -> Result<WorkerRuntime> {
    let mut runtime = WorkerRuntime::new(core.store.clone());

    let outbox = core.outbox.clone();
    runtime.register(WorkerDef::new("outbox-delivery", "5s", true, move || {
        let outbox = outbox.clone();
        async move { outbox.process_batch().await.map(|_| ()) }
    })?);

    let outbox = core.outbox.clone();
    let retention = core.config.advanced.processed_event_retention_hours;
    runtime.register(WorkerDef::new("outbox-cleanup", "1h", true, move || {
        let outbox = outbox.clone();
        async move { outbox.cleanup(retention).await.map(|_| ()) }
    })?);

    let transactions = core.transactions.clone();
    runtime.register(WorkerDef::new("hold-expiry", "1m", true, move || {
        let transactions = transactions.clone();
        async move { transactions.expire_due_holds(100).await.map(|_| ()) }
    })?);

    if !core.config.advanced.hot_accounts.is_empty() {
        let transactions = core.transactions.clone();
        runtime.register(WorkerDef::new("hot-account-coalescer", "5s", true, move || {
            let transactions = transactions.clone();
            async move { transactions.coalesce_hot_accounts().await.map(|_| ()) }
        })?);
    }

    let blocks = core.blocks.clone();
    runtime.register(WorkerDef::new("block-sealing", "1m", true, move || {
        let blocks = blocks.clone();
        async move { blocks.create_block_checkpoint().await.map(|_| ()) }
    })?);

    let recon = core.recon.clone();
    runtime.register(WorkerDef::new("reconciliation-fast", "1h", true, move || {
        let recon = recon.clone();
        async move { recon.run_fast().await.map(|_| ()) }
    })?);

    let recon = core.recon.clone();
    runtime.register(WorkerDef::new("reconciliation-daily", "1d", true, move || {
        let recon = recon.clone();
        async move { recon.run_daily().await.map(|_| ()) }
    })?);

    let store = core.store.clone();
    runtime.register(WorkerDef::new("idempotency-cleanup", "6h", true, move || {
        let store = store.clone();
        async move { idempotency::cleanup_expired(&store).await.map(|_| ()) }
    })?);

    runtime.start();
    Ok(runtime)
}
