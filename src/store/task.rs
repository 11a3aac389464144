//! Task records and task locks

use super::{decode, decode_all, Store};
use crate::error::{Error, Result};
use crate::kv::{encode, Compare, Op, Txn};
use crate::model::{ExportKey, Task, TaskKey};
use crate::schema::Schema;

impl Store {
    /// Acquire the task lock and create the task record.
    ///
    /// Returns `false` if the lock is held by another task.
    pub async fn create_task(&self, task: &Task) -> Result<bool> {
        let lock = Schema::task_lock(&task.key.export, &task.lock);
        let txn = Txn::new()
            .when(Compare::Missing(lock.clone()))
            .when(Compare::Missing(Schema::task(&task.key)))
            .then(Op::put(lock, task.worker_node.as_bytes().to_vec()))
            .then(Op::put(Schema::task(&task.key), encode(task)?));
        Ok(self.txn(txn).await?.succeeded)
    }

    /// Store the finished task and release its lock, if still owned by the worker.
    pub async fn finish_task(&self, task: &Task) -> Result<()> {
        let lock = Schema::task_lock(&task.key.export, &task.lock);
        let value = encode(task)?;
        let txn = Txn::new()
            .when(Compare::ValueEquals(lock.clone(), task.worker_node.as_bytes().to_vec()))
            .then(Op::put(Schema::task(&task.key), value.clone()))
            .then(Op::Delete(lock))
            .or_else(Op::put(Schema::task(&task.key), value));
        self.txn(txn).await?;
        Ok(())
    }

    pub async fn get_task(&self, key: &TaskKey) -> Result<Task> {
        let resp = self.txn(Txn::new().then(Op::Get(Schema::task(key)))).await?;
        match resp.first(0) {
            Some(kv) => decode(kv),
            None => Err(Error::NotFound {
                kind: "task",
                id: key.to_string(),
                parent: "export",
            }),
        }
    }

    pub async fn list_tasks(&self, export: &ExportKey) -> Result<Vec<Task>> {
        let resp = self
            .txn(Txn::new().then(Op::Range(Schema::tasks_in_export(export))))
            .await?;
        decode_all(resp.kvs(0))
    }

    /// Whether the lock, `<task type>/<object id>`, is currently held.
    pub async fn is_task_locked(&self, export: &ExportKey, lock: &str) -> Result<bool> {
        let resp = self
            .txn(Txn::new().then(Op::Get(Schema::task_lock(export, lock))))
            .await?;
        Ok(resp.first(0).is_some())
    }
}
