//! Transaction lifecycle and the worker thread statements are executed
//! on.
//!
//! `TransactionState` tracks BEGIN/COMMIT/ROLLBACK against a
//! `CachePool`: opening a transaction suspends auto-commit (so neither
//! a db switch nor cache eviction flushes half-finished writes to
//! disk) and spawns a `Worker` that owns the only path statements take
//! until the transaction closes. COMMIT flushes everything and
//! restores auto-commit, ROLLBACK discards every branch's in-memory
//! state by reloading from the last commit; both stop the worker.
//!
//! `Worker` is the generic statement queue: one background thread pulls
//! requests off an `mpsc` channel and runs them strictly in order,
//! handing each reply back on its own one-shot channel. This gives the
//! engine a single serialization point without the caller blocking the
//! rest of the process on it.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use crate::action::ActionResult;
use crate::cache::CachePool;
use crate::config::Settings;
use crate::errors::{DbError, Result};

#[derive(Default)]
pub struct TransactionState {
    open: bool,
    worker: Option<Worker<String, Result<ActionResult>>>,
}

impl std::fmt::Debug for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionState")
            .field("open", &self.open)
            .field("worker", &self.worker.is_some())
            .finish()
    }
}

impl TransactionState {
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Suspends auto-commit and spawns the worker every subsequent
    /// statement is queued onto, until COMMIT or ROLLBACK.
    pub fn begin(&mut self, pool: &Arc<Mutex<CachePool>>, settings: &Settings) -> Result<()> {
        if self.open {
            return Err(DbError::Transaction("BEGIN".into()));
        }
        info!("transaction BEGIN: suspending auto-commit");
        pool.lock().expect("cache pool mutex poisoned").set_auto_commit(false);

        let pool = Arc::clone(pool);
        let settings = settings.clone();
        let mut failed = false;
        self.worker = Some(Worker::spawn(move |statement: String| -> Result<ActionResult> {
            if failed {
                return Err(DbError::Transaction(statement));
            }
            let result = crate::parser::parse_statement(&statement)
                .and_then(|action| {
                    let mut guard = pool.lock().expect("cache pool mutex poisoned");
                    crate::engine::execute_action(&mut guard, &settings, action)
                });
            if let Err(ref e) = result {
                warn!("transaction worker: statement failed, no longer consuming further statements: {}", e);
                failed = true;
            }
            result
        }));
        self.open = true;
        Ok(())
    }

    /// Enqueues one statement on the open transaction's worker. Returns
    /// the worker's reply, or `DbError::Transaction` if the worker is
    /// gone (it already stopped consuming after an earlier failure).
    pub fn execute(&self, statement: &str) -> Result<ActionResult> {
        let worker = self.worker.as_ref().ok_or_else(|| DbError::Transaction(statement.to_string()))?;
        worker
            .execute(statement.to_string())
            .unwrap_or_else(|| Err(DbError::Transaction(statement.to_string())))
    }

    /// COMMIT and END are equivalent terminal keywords for closing a
    /// transaction successfully.
    pub fn commit(&mut self, pool: &Arc<Mutex<CachePool>>) -> Result<()> {
        if !self.open {
            return Err(DbError::Transaction("COMMIT".into()));
        }
        info!("transaction COMMIT: flushing cache to disk");
        self.worker = None;
        let mut guard = pool.lock().expect("cache pool mutex poisoned");
        guard.flush_cache_to_disk()?;
        guard.set_auto_commit(true);
        self.open = false;
        Ok(())
    }

    pub fn rollback(&mut self, pool: &Arc<Mutex<CachePool>>) -> Result<()> {
        if !self.open {
            return Err(DbError::Transaction("ROLLBACK".into()));
        }
        warn!("transaction ROLLBACK: discarding in-memory state");
        self.worker = None;
        let mut guard = pool.lock().expect("cache pool mutex poisoned");
        guard.rollback_all()?;
        guard.set_auto_commit(true);
        self.open = false;
        Ok(())
    }
}

/// A single background worker that runs `Req -> Resp` strictly
/// sequentially, in submission order.
pub struct Worker<Req, Resp> {
    sender: Option<mpsc::Sender<(Req, mpsc::Sender<Resp>)>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl<Req, Resp> std::fmt::Debug for Worker<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker").finish_non_exhaustive()
    }
}

impl<Req, Resp> Worker<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn spawn<F>(mut handler: F) -> Self
    where
        F: FnMut(Req) -> Resp + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel::<(Req, mpsc::Sender<Resp>)>();
        let handle = thread::spawn(move || {
            while let Ok((request, reply)) = receiver.recv() {
                let response = handler(request);
                let _ = reply.send(response);
            }
        });
        Worker { sender: Some(sender), handle: Some(handle) }
    }

    /// Submits a request and blocks for its reply. `None` means the
    /// worker thread is gone (it panicked, or the queue was dropped).
    pub fn execute(&self, request: Req) -> Option<Resp> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.sender.as_ref()?.send((request, reply_tx)).ok()?;
        let response = reply_rx.recv().ok();
        if response.is_none() {
            error!("worker statement failed: worker thread is gone");
        }
        response
    }
}

impl<Req, Resp> Drop for Worker<Req, Resp> {
    fn drop(&mut self) {
        // Drop the sender explicitly first: the background thread's
        // `recv()` loop only returns once every sender is gone, and a
        // custom `Drop::drop` runs before its own fields are dropped, so
        // without this `handle.join()` below would block forever.
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::record::Record;
    use std::path::PathBuf;

    fn pool() -> Arc<Mutex<CachePool>> {
        Arc::new(Mutex::new(CachePool::new(PathBuf::from("/tmp/unused"))))
    }

    fn settings() -> Settings {
        Settings::default_at(PathBuf::from("/tmp/unused"))
    }

    #[test]
    fn begin_twice_errors() {
        let pool = pool();
        let settings = settings();
        let mut state = TransactionState::default();
        state.begin(&pool, &settings).unwrap();
        assert!(state.begin(&pool, &settings).is_err());
    }

    #[test]
    fn commit_without_begin_errors() {
        let pool = pool();
        let mut state = TransactionState::default();
        assert!(state.commit(&pool).is_err());
        assert!(state.rollback(&pool).is_err());
    }

    #[test]
    fn begin_suspends_auto_commit_until_terminal_keyword() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(Mutex::new(CachePool::new(dir.path().to_path_buf())));
        let db = Database::new(dir.path().to_path_buf(), "shop");
        let rec = Record::new(dir.path().join("shop.rcd"), "shop");
        pool.lock().unwrap().add_branch("shop", crate::cache::DbBranch::new(db, rec));

        let settings = Settings::default_at(dir.path().to_path_buf());
        let mut state = TransactionState::default();
        state.begin(&pool, &settings).unwrap();
        assert!(!pool.lock().unwrap().auto_commit());
        state.commit(&pool).unwrap();
        assert!(pool.lock().unwrap().auto_commit());
    }

    #[test]
    fn execute_without_open_transaction_errors() {
        let state = TransactionState::default();
        assert!(state.execute("SELECT 1").is_err());
    }

    #[test]
    fn worker_runs_requests_in_order() {
        let worker: Worker<i32, i32> = Worker::spawn(|req| req * 2);
        assert_eq!(worker.execute(3), Some(6));
        assert_eq!(worker.execute(5), Some(10));
    }

    #[test]
    fn worker_stops_consuming_after_first_failure() {
        let worker: Worker<i32, std::result::Result<i32, String>> = Worker::spawn(|req| {
            if req < 0 {
                Err(format!("negative: {}", req))
            } else {
                Ok(req)
            }
        });
        assert_eq!(worker.execute(1), Some(Ok(1)));
        assert_eq!(worker.execute(-1), Some(Err("negative: -1".to_string())));
        // The worker thread itself stays alive to receive and reject
        // further statements (consumption stops only via the `failed`
        // flag a real handler would capture, as `TransactionState` does).
        assert!(worker.execute(2).is_some());
    }
}
