use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use clanwatch_shared::Account;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::client::RpcClient;
use crate::config;
use crate::version_store::VersionStore;

/// The tagged-sum an item processor returns (§9 redesign): replaces the original's
/// record-or-null-or-sentinel return value with an explicit outcome per id.
pub enum ProcessOutcome<T> {
    Saved(T),
    Drop,
    Retry,
}

/// Which endpoint family a queue run is hitting: inferred once from the shape of the seed
/// ids (§4.4 step 2), not threaded explicitly by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    Clan,
    Profile,
}

fn infer_mode(first_id: i64) -> QueryMode {
    if first_id > config::VIEWER_ID_THRESHOLD {
        QueryMode::Profile
    } else {
        QueryMode::Clan
    }
}

/// Runs a bounded pool of account workers against a deduplicated id list, buffering each
/// worker's output into batches and flushing them through an inserter.
///
/// `process` is called once per id with the worker's owned [`RpcClient`] and the inferred
/// [`QueryMode`]; `insert_batch` receives a drained buffer plus the one `collected_at`
/// stamped for this entire run.
pub struct WorkQueue<T> {
    ids: Vec<i64>,
    accounts: Vec<Account>,
    concurrency: usize,
    batch_size: usize,
    base_url: String,
    version_store: Arc<VersionStore>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Send + 'static> WorkQueue<T> {
    pub fn new(
        mut ids: Vec<i64>,
        accounts: Vec<Account>,
        base_url: impl Into<String>,
        version_store: Arc<VersionStore>,
    ) -> Self {
        ids.sort_unstable();
        ids.dedup();
        Self {
            ids,
            accounts,
            concurrency: config::sync_num(),
            batch_size: config::batch_size(),
            base_url: base_url.into(),
            version_store,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn seed_len(&self) -> usize {
        self.ids.len()
    }

    /// Drains the queue, returning `(processed_count, collected_at)`. `process` and
    /// `insert_batch` are plain async closures so pipelines stay free functions rather than
    /// trait objects.
    pub async fn run<P, Fut, I, InsFut>(self, process: P, insert_batch: I) -> (u64, DateTime<Utc>)
    where
        P: Fn(RpcClient, i64, QueryMode) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = (RpcClient, ProcessOutcome<T>)> + Send,
        I: Fn(Vec<T>, DateTime<Utc>) -> InsFut + Send + Sync + 'static,
        InsFut: std::future::Future<Output = ()> + Send,
    {
        let collected_at = Utc::now();
        if self.ids.is_empty() {
            return (0, collected_at);
        }
        let mode = infer_mode(self.ids[0]);
        let worker_count = self.concurrency.min(self.accounts.len()).max(1);

        let queue = Arc::new(Mutex::new(self.ids.clone().into_iter().collect::<std::collections::VecDeque<_>>()));
        let processed = Arc::new(AtomicU64::new(0));
        let total = self.ids.len() as u64;
        let process = Arc::new(process);
        let insert_batch = Arc::new(insert_batch);

        let monitor_processed = processed.clone();
        let monitor = tokio::spawn(async move {
            let started = Instant::now();
            loop {
                let done = monitor_processed.load(Ordering::Relaxed);
                render_progress(done, total, started.elapsed());
                if done >= total {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(config::MONITOR_TICK_MS)).await;
            }
            println!();
            info!(total, elapsed_secs = started.elapsed().as_secs_f64(), "pipeline run complete");
        });

        let mut handles = Vec::with_capacity(worker_count);
        for (i, account) in self.accounts.into_iter().take(worker_count).enumerate() {
            let queue = queue.clone();
            let processed = processed.clone();
            let process = process.clone();
            let insert_batch = insert_batch.clone();
            let base_url = self.base_url.clone();
            let version_store = self.version_store.clone();
            let batch_size = self.batch_size;

            handles.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(config::WORKER_STAGGER_MS * i as u64)).await;

                let Some(viewer_id) = account.viewer_id else {
                    warn!(uid = %account.uid, "account has no bound viewer_id, skipping worker");
                    return;
                };
                let mut client = RpcClient::new(base_url, viewer_id, version_store);
                if client.login(&account.uid, &account.access_key).await.is_err() {
                    warn!(uid = %account.uid, "login failed, removing this worker from the pool");
                    return;
                }

                let mut buffer = Vec::with_capacity(batch_size);
                loop {
                    let id = {
                        let mut guard = queue.lock().await;
                        guard.pop_front()
                    };
                    let Some(id) = id else { break };

                    let mut attempts = 0u32;
                    loop {
                        attempts += 1;
                        let (returned_client, outcome) = process(client, id, mode).await;
                        client = returned_client;
                        match outcome {
                            ProcessOutcome::Saved(record) => {
                                buffer.push(record);
                                break;
                            }
                            ProcessOutcome::Drop => break,
                            ProcessOutcome::Retry if attempts >= config::RETRY_ATTEMPTS => break,
                            ProcessOutcome::Retry => {
                                tokio::time::sleep(Duration::from_secs(config::RETRY_SLEEP_SECS)).await;
                                if client.login(&account.uid, &account.access_key).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    processed.fetch_add(1, Ordering::Relaxed);

                    if buffer.len() >= batch_size {
                        let flushed = std::mem::replace(&mut buffer, Vec::with_capacity(batch_size));
                        insert_batch(flushed, collected_at).await;
                    }
                }

                if !buffer.is_empty() {
                    insert_batch(buffer, collected_at).await;
                }
            }));
        }

        futures::future::join_all(handles).await;
        let _ = monitor.await;

        (processed.load(Ordering::Relaxed), collected_at)
    }
}

fn render_progress(done: u64, total: u64, elapsed: Duration) {
    let fraction = if total == 0 { 1.0 } else { done as f64 / total as f64 };
    let filled = ((fraction * config::PROGRESS_BAR_WIDTH as f64) as usize).min(config::PROGRESS_BAR_WIDTH);
    let bar: String = (0..config::PROGRESS_BAR_WIDTH)
        .map(|i| if i < filled { '#' } else { '-' })
        .collect();
    let rate = if elapsed.as_secs_f64() > 0.0 { done as f64 / elapsed.as_secs_f64() } else { 0.0 };
    let eta = if rate > 0.0 { (total.saturating_sub(done)) as f64 / rate } else { 0.0 };
    print!("\r[{bar}] {done}/{total} ({rate:.1}/s, eta {eta:.0}s)");
    use std::io::Write;
    let _ = std::io::stdout().flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_profile_mode_above_the_viewer_id_threshold() {
        assert_eq!(infer_mode(config::VIEWER_ID_THRESHOLD + 1), QueryMode::Profile);
        assert_eq!(infer_mode(500), QueryMode::Clan);
    }

    #[test]
    fn progress_bar_width_matches_the_configured_constant() {
        let mut captured = String::new();
        for i in 0..config::PROGRESS_BAR_WIDTH {
            captured.push(if i < 15 { '#' } else { '-' });
        }
        assert_eq!(captured.len(), config::PROGRESS_BAR_WIDTH);
    }
}
