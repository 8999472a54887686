use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::domain::errors::StoreError;
use crate::domain::models::{Job, Task};
use crate::domain::ports::{JobStore, StoredJob};

#[derive(Debug, Default)]
struct Tables {
    jobs: BTreeMap<String, Job>,
    tasks: BTreeMap<String, Task>,
}

/// Job store backed by maps, with switchable write failures and stalls.
#[derive(Debug)]
pub struct InMemoryJobStore {
    tables: Mutex<Tables>,
    fail_writes: AtomicBool,
    /// Jobs whose writes hang until resumed
    stalled: watch::Sender<BTreeSet<String>>,
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            fail_writes: AtomicBool::new(false),
            stalled: watch::Sender::new(BTreeSet::new()),
        }
    }

    /// Make every mutating call fail with `StoreError::Unavailable`.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every mutating call touching `job_id` hang until
    /// [`resume_writes`](Self::resume_writes).
    pub fn stall_writes(&self, job_id: &str) {
        self.stalled.send_modify(|jobs| {
            jobs.insert(job_id.to_string());
        });
    }

    pub fn resume_writes(&self, job_id: &str) {
        self.stalled.send_modify(|jobs| {
            jobs.remove(job_id);
        });
    }

    pub fn job(&self, job_id: &str) -> Option<Job> {
        self.tables().jobs.get(job_id).cloned()
    }

    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.tables().tasks.get(task_id).cloned()
    }

    pub fn tasks_of(&self, job_id: &str) -> Vec<Task> {
        self.tables()
            .tasks
            .values()
            .filter(|t| t.job_id == job_id)
            .cloned()
            .collect()
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn wait_until_resumed(&self, job_id: &str) {
        let mut stalled = self.stalled.subscribe();
        // The sender lives as long as the store, so this only returns on resume
        let _ = stalled.wait_for(|jobs| !jobs.contains(job_id)).await;
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn find_all(&self) -> Result<Vec<StoredJob>, StoreError> {
        let tables = self.tables();
        Ok(tables
            .jobs
            .values()
            .map(|job| StoredJob {
                job: job.clone(),
                tasks: tables.tasks.values().filter(|t| t.job_id == job.id).cloned().collect(),
            })
            .collect())
    }

    async fn write_job(&self, job: &Job) -> Result<(), StoreError> {
        self.wait_until_resumed(&job.id).await;
        self.check_writable()?;
        self.tables().jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn write_task(&self, task: &Task) -> Result<(), StoreError> {
        self.wait_until_resumed(&task.job_id).await;
        self.check_writable()?;
        self.tables().tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn delete_task(&self, task_id: &str) -> Result<(), StoreError> {
        if let Some(job_id) = self.task(task_id).map(|t| t.job_id) {
            self.wait_until_resumed(&job_id).await;
        }
        self.check_writable()?;
        self.tables().tasks.remove(task_id);
        Ok(())
    }

    async fn delete_job(&self, job_id: &str) -> Result<(), StoreError> {
        self.wait_until_resumed(job_id).await;
        self.check_writable()?;
        let mut tables = self.tables();
        tables.jobs.remove(job_id);
        tables.tasks.retain(|_, t| t.job_id != job_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Capacity, RetryPolicy};

    #[tokio::test]
    async fn test_find_all_groups_tasks_by_job() {
        let store = InMemoryJobStore::new();
        let a = Job::service("a", "app", Capacity::new(0, 1, 1), RetryPolicy::default(), 0);
        let b = Job::batch("b", "app", 1, RetryPolicy::default(), 0);
        store.write_job(&a).await.unwrap();
        store.write_job(&b).await.unwrap();
        store.write_task(&Task::new("a", None, 0)).await.unwrap();
        store.write_task(&Task::new("a", None, 0)).await.unwrap();
        store.write_task(&Task::new("b", Some(0), 0)).await.unwrap();

        let all = store.find_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].tasks.len(), 2);
        assert_eq!(all[1].tasks.len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_leave_data_untouched() {
        let store = InMemoryJobStore::new();
        let task = Task::new("a", None, 0);
        store.write_task(&task).await.unwrap();

        store.fail_writes(true);
        assert!(matches!(store.delete_task(&task.id).await, Err(StoreError::Unavailable(_))));
        assert!(store.task(&task.id).is_some());

        store.fail_writes(false);
        store.delete_task(&task.id).await.unwrap();
        store.delete_task(&task.id).await.unwrap();
        assert!(store.task(&task.id).is_none());
    }

    #[tokio::test]
    async fn test_stalled_job_writes_wait_for_resume() {
        let store = std::sync::Arc::new(InMemoryJobStore::new());
        let slow = Job::batch("slow", "app", 1, RetryPolicy::default(), 0);
        let fast = Job::batch("fast", "app", 1, RetryPolicy::default(), 0);
        store.stall_writes("slow");

        let pending = tokio::spawn({
            let store = store.clone();
            async move { store.write_job(&slow).await }
        });
        store.write_job(&fast).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!pending.is_finished());
        assert!(store.job("slow").is_none());

        store.resume_writes("slow");
        pending.await.unwrap().unwrap();
        assert!(store.job("slow").is_some());
    }
}
