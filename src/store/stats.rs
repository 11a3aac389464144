//! Per-node received statistics
//!
//! Each API node writes the cumulative statistics of every slice it received
//! records for under `stats/slice/active/opened/writing/<slice>/<nodeID>`.
//! The key is owned by the node, so nodes never overwrite each other and a
//! repeated write is an idempotent upsert.

use super::{decode, Store};
use crate::error::{MultiError, Result};
use crate::kv::{encode, Compare, Op, Txn};
use crate::model::{FileKey, ObjectKey, SliceKey, SliceState, SliceStats, Stats, StatsCategory};
use crate::schema::Schema;
use futures::future::join_all;
use tracing::debug;

impl Store {
    /// Write per-node statistics of slices, in concurrent bounded transactions.
    ///
    /// Partial success is possible, writes of succeeded transactions are kept
    /// and the failures are returned together. Statistics of slices that are
    /// no longer open are dropped.
    pub async fn update_slice_received_stats(
        &self,
        node_id: &str,
        stats: Vec<SliceStats>,
    ) -> Result<()> {
        let chunks = stats.chunks(self.stats_per_txn).map(|chunk| self.update_chunk(node_id, chunk));
        let mut errs = MultiError::new();
        for result in join_all(chunks).await {
            if let Err(err) = result {
                errs.push(err);
            }
        }
        errs.into_result()
    }

    async fn update_chunk(&self, node_id: &str, chunk: &[SliceStats]) -> Result<()> {
        if self.txn(stats_txn(node_id, chunk)?).await?.succeeded {
            return Ok(());
        }

        // Some slices were closed in the meantime, keep only the open ones
        let mut check = Txn::new();
        for item in chunk {
            check = check
                .then(Op::Get(Schema::slice(SliceState::Writing, &item.slice_key)))
                .then(Op::Get(Schema::slice(SliceState::Closing, &item.slice_key)));
        }
        let resp = self.txn(check).await?;
        let open: Vec<SliceStats> = chunk
            .iter()
            .enumerate()
            .filter(|(i, item)| {
                let is_open = resp.first(2 * i).is_some() || resp.first(2 * i + 1).is_some();
                if !is_open {
                    debug!(slice = %item.slice_key, node = node_id, "dropping statistics of a closed slice");
                }
                is_open
            })
            .map(|(_, item)| item.clone())
            .collect();

        if open.is_empty() {
            return Ok(());
        }
        if !self.txn(stats_txn(node_id, &open)?).await?.succeeded {
            debug!(node = node_id, "slices closed during statistics update, dropping");
        }
        Ok(())
    }

    /// Sum of per-node statistics of an open slice.
    pub async fn get_received_stats_by_slice(&self, key: &SliceKey) -> Result<Stats> {
        self.sum_prefix(&Schema::stats_in_object(
            StatsCategory::Opened,
            &ObjectKey::Slice(key.clone()),
        ))
        .await
    }

    /// Sum of per-node statistics of all open slices of the file.
    pub async fn get_received_stats_by_file(&self, key: &FileKey) -> Result<Stats> {
        self.sum_prefix(&Schema::stats_in_object(
            StatsCategory::Opened,
            &ObjectKey::File(key.clone()),
        ))
        .await
    }

    async fn sum_prefix(&self, prefix: &str) -> Result<Stats> {
        let resp = self.txn(Txn::new().then(Op::Range(prefix.to_string()))).await?;
        let mut sum = Stats::default();
        for kv in resp.kvs(0) {
            sum += decode::<Stats>(kv)?;
        }
        Ok(sum)
    }
}

/// Upsert of per-node stats, guarded by the slices being open.
fn stats_txn(node_id: &str, items: &[SliceStats]) -> Result<Txn> {
    let mut txn = Txn::new();
    for item in items {
        txn = txn
            .when(Compare::AnyExists(vec![
                Schema::slice(SliceState::Writing, &item.slice_key),
                Schema::slice(SliceState::Closing, &item.slice_key),
            ]))
            .then(Op::put(
                Schema::slice_stats_per_node(StatsCategory::Opened, &item.slice_key, node_id),
                encode(&item.stats)?,
            ));
    }
    Ok(txn)
}
