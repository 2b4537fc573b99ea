//! Background worker runtime.
//!
//! Workers tick on a declared interval. A worker marked lease_required
//! coordinates across process instances through a row in worker_lease:
//! the upsert below succeeds for exactly one holder at a time, and a
//! crashed holder is stolen from once lease_until passes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::{LedgerError, Result};
use crate::store::{dialect, Store};

pub type WorkerFuture = BoxFuture<'static, Result<()>>;
pub type WorkerHandler = Arc<dyn Fn() -> WorkerFuture + Send + Sync>;

pub struct WorkerDef {
    pub id: &'static str,
    pub interval: Duration,
    pub lease_required: bool,
    pub handler: WorkerHandler,
}

impl WorkerDef {
    pub fn new<F, Fut>(
        id: &'static str,
        interval: &str,
        lease_required: bool,
        handler: F,
    ) -> Result<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Ok(Self {
            id,
            interval: parse_interval(interval)?,
            lease_required,
            handler: Arc::new(move || handler().boxed()),
        })
    }
}

/// Parse `"5s" | "1m" | "1h" | "6h" | "1d"` style interval strings.
pub fn parse_interval(spec: &str) -> Result<Duration> {
    let spec = spec.trim();
    if spec.is_empty() || !spec.is_ascii() {
        return Err(LedgerError::InvalidArgument(format!(
            "invalid interval: {spec}"
        )));
    }
    let (number, unit) = spec.split_at(spec.len() - 1);
    let value: u64 = number
        .parse()
        .map_err(|_| LedgerError::InvalidArgument(format!("invalid interval: {spec}")))?;
    if value == 0 {
        return Err(LedgerError::InvalidArgument(format!(
            "interval must be positive: {spec}"
        )));
    }
    let secs = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86_400,
        _ => {
            return Err(LedgerError::InvalidArgument(format!(
                "invalid interval unit: {spec}"
            )))
        }
    };
    Ok(Duration::from_secs(secs))
}

/// Identity of this process instance in lease rows.
fn lease_holder_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "summa".to_string());
    let suffix: u32 = rand::thread_rng().gen();
    format!("{host}-{suffix:08x}")
}

pub struct WorkerRuntime {
    store: Store,
    holder: String,
    workers: Vec<WorkerDef>,
    stop: Arc<Notify>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerRuntime {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            holder: lease_holder_id(),
            workers: Vec::new(),
            stop: Arc::new(Notify::new()),
            handles: Vec::new(),
        }
    }

    pub fn register(&mut self, worker: WorkerDef) {
        self.workers.push(worker);
    }

    /// Spawn one task per registered worker. Handler failures are logged
    /// and swallowed so the scheduler stays alive for the next tick.
    pub fn start(&mut self) {
        for worker in self.workers.drain(..) {
            let store = self.store.clone();
            let holder = self.holder.clone();
            let stop = self.stop.clone();
            let handle = tokio::spawn(async move {
                tracing::info!(worker = worker.id, interval = ?worker.interval, "worker started");
                let mut ticker = tokio::time::interval(worker.interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // The first tick of tokio's interval fires immediately;
                // consume it so workers start after one full period.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = stop.notified() => {
                            tracing::info!(worker = worker.id, "worker stopped");
                            return;
                        }
                        _ = ticker.tick() => {}
                    }

                    if worker.lease_required {
                        match acquire_lease(&store, worker.id, &holder, worker.interval).await {
                            Ok(true) => {}
                            Ok(false) => continue,
                            Err(err) => {
                                tracing::warn!(worker = worker.id, error = %err, "lease acquisition failed");
                                continue;
                            }
                        }
                    }

                    if let Err(err) = (worker.handler)().await {
                        tracing::error!(worker = worker.id, error = %err, "worker tick failed");
                    }
                }
            });
            self.handles.push(handle);
        }
    }

    /// Signal every worker task and wait for them to finish their tick.
    pub async fn stop(&mut self) {
        self.stop.notify_waiters();
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}

/// One-shot lease upsert: inserts a fresh lease, or steals an expired one.
/// No row back means another instance holds it; skip this tick.
pub async fn acquire_lease(
    store: &Store,
    worker_id: &str,
    holder: &str,
    interval: Duration,
) -> Result<bool> {
    let table = store.table("worker_lease");
    let lease_secs = (interval.as_secs_f64() * 1.5).ceil() as i64;
    let lease_until = format!("{} + {}", dialect::now(), dialect::interval_secs(lease_secs));
    let row: Option<(String,)> = sqlx::query_as(&format!(
        "INSERT INTO {table} (worker_id, lease_holder, lease_until) \
         VALUES ($1, $2, {lease_until}) \
         ON CONFLICT (worker_id) DO UPDATE \
           SET lease_holder = $2, lease_until = EXCLUDED.lease_until \
           WHERE {table}.lease_until < {} OR {table}.lease_holder = $2 \
         {}",
        dialect::now(),
        dialect::returning(&["lease_holder"])
    ))
    .bind(worker_id)
    .bind(holder)
    .fetch_optional(store.pool())
    .await?;
    Ok(row.is_some())
}

/// Long-running handlers call this mid-run to keep the lease from being
/// stolen.
pub async fn refresh_lease(
    store: &Store,
    worker_id: &str,
    holder: &str,
    interval: Duration,
) -> Result<bool> {
    let table = store.table("worker_lease");
    let lease_secs = (interval.as_secs_f64() * 1.5).ceil() as i64;
    let lease_until = format!("{} + {}", dialect::now(), dialect::interval_secs(lease_secs));
    let result = sqlx::query(&format!(
        "UPDATE {table} SET lease_until = {lease_until} \
         WHERE worker_id = $1 AND lease_holder = $2"
    ))
    .bind(worker_id)
    .bind(holder)
    .execute(store.pool())
    .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_strings_parse_to_seconds() {
        assert_eq!(parse_interval("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_interval("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_interval("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_interval("6h").unwrap(), Duration::from_secs(21_600));
        assert_eq!(parse_interval("1d").unwrap(), Duration::from_secs(86_400));
    }

    #[test]
    fn bad_intervals_are_rejected() {
        for bad in ["", "s", "5x", "-1m", "0s", "1.5h"] {
            assert!(parse_interval(bad).is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn lease_holder_ids_are_distinct_per_process() {
        assert_ne!(lease_holder_id(), lease_holder_id());
    }
}
