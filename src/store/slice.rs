//! Slice state transitions

use super::{concurrent_modification, decode, decode_all, Store, MAX_ATTEMPTS};
use crate::clock::UtcTime;
use crate::error::{Error, Result};
use crate::kv::{encode, Compare, Op, Txn};
use crate::model::{
    check_transition, FileKey, IdRange, ObjectKey, Slice, SliceKey, SliceState, Stats,
    StatsCategory, UploadStats,
};
use crate::schema::Schema;
use tracing::debug;

impl Store {
    pub async fn get_slice(&self, state: SliceState, key: &SliceKey) -> Result<Slice> {
        let resp = self
            .txn(Txn::new().then(Op::Get(Schema::slice(state, key))))
            .await?;
        match resp.first(0) {
            Some(kv) => decode(kv),
            None => Err(Error::NotFound {
                kind: "slice",
                id: key.to_string(),
                parent: "export",
            }),
        }
    }

    /// Slices of the file in the state, ordered by opening time.
    pub async fn list_slices_in_file(
        &self,
        state: SliceState,
        key: &FileKey,
    ) -> Result<Vec<Slice>> {
        let resp = self
            .txn(Txn::new().then(Op::Range(Schema::slices_in_file(state, key))))
            .await?;
        decode_all(resp.kvs(0))
    }

    /// Writing → Closing, the slice stops accepting new records.
    pub async fn set_slice_closing(&self, slice: &Slice) -> Result<Slice> {
        self.set_slice_state(slice, SliceState::Closing, |_| {}).await
    }

    /// Closing → Uploading.
    ///
    /// Sums the per-node statistics into the slice, counts its records and
    /// assigns them an ID range from the export counter. The summary is
    /// written under the uploading category and the per-node keys are
    /// deleted in the same transaction.
    ///
    /// Fails with [`Error::Mismatch`] while an older slice of the export is
    /// still writing or closing, so ID ranges follow the slice order.
    pub async fn close_slice(&self, slice: &Slice) -> Result<Slice> {
        check_transition(slice.state, SliceState::Uploading)?;

        let export = slice.key.export_key();
        let object = ObjectKey::Slice(slice.key.clone());
        let per_node_prefix = Schema::stats_in_object(StatsCategory::Opened, &object);
        let records_prefix = Schema::records_in_slice(&slice.key);
        let counter_key = Schema::record_counter(export);
        let current_key = Schema::slice(slice.state, &slice.key);

        for attempt in 1..=MAX_ATTEMPTS {
            let read = self
                .txn(
                    Txn::new()
                        .then(Op::Get(current_key.clone()))
                        .then(Op::Range(per_node_prefix.clone()))
                        .then(Op::Count(records_prefix.clone()))
                        .then(Op::Get(counter_key.clone()))
                        .then(Op::Range(Schema::slices_in_export(SliceState::Writing, export)))
                        .then(Op::Range(Schema::slices_in_export(SliceState::Closing, export))),
                )
                .await?;

            if read.first(0).is_none() {
                return Err(Error::AlreadyInState {
                    kind: "slice",
                    key: slice.key.to_string(),
                    state: SliceState::Uploading.to_string(),
                });
            }
            for (index, state) in [(4, SliceState::Writing), (5, SliceState::Closing)] {
                let own_key = Schema::slice(state, &slice.key);
                let before = read.kvs(index).iter().filter(|kv| kv.key < own_key).count();
                if before > 0 {
                    return Err(Error::Mismatch(format!(
                        "no slice in the state \"{}\" expected before \"{}\", found {}",
                        state, slice.key, before
                    )));
                }
            }

            let mut sum = Stats::default();
            for kv in read.kvs(1) {
                sum += decode::<Stats>(kv)?;
            }
            // Counted records are authoritative, a flush may have been lost
            let records = read.count(2) as u64;
            if records > 0 {
                sum.records_count = records;
            }
            let counter_kv = read.first(3);
            let last_id: u64 = match counter_kv {
                Some(kv) => decode(kv)?,
                None => 0,
            };

            let now = self.clock.now();
            let mut updated = slice.clone();
            updated.set_state(SliceState::Uploading, now);
            updated.statistics = Some(sum);
            updated.is_empty = records == 0;
            updated.id_range = (records > 0).then_some(IdRange {
                start: last_id + 1,
                count: records,
            });

            let mut txn = self
                .slice_state_txn(slice, &updated)?
                .when(Compare::PrefixUnchangedSince(per_node_prefix.clone(), read.revision))
                .when(Compare::PrefixUnchangedSince(records_prefix.clone(), read.revision))
                .then(Op::DeletePrefix(per_node_prefix.clone()))
                .then(Op::put(
                    Schema::slice_stats_nodes_sum(StatsCategory::Uploading, &slice.key),
                    encode(&sum)?,
                ));
            txn = match counter_kv {
                Some(kv) => txn.when(Compare::ValueEquals(counter_key.clone(), kv.value.clone())),
                None => txn.when(Compare::Missing(counter_key.clone())),
            };
            if records > 0 {
                txn = txn.then(Op::put(counter_key.clone(), encode(&(last_id + records))?));
            }

            if self.txn(txn).await?.succeeded {
                return Ok(updated);
            }
            debug!(slice = %slice.key, attempt, "slice close conflict, retrying");
        }

        Err(concurrent_modification("slice", &slice.key))
    }

    /// Uploading → Uploaded, buffered records are no longer needed.
    pub async fn mark_slice_uploaded(&self, slice: &Slice, upload: UploadStats) -> Result<Slice> {
        let records = Schema::records_in_slice(&slice.key);
        let now = self.clock.now();
        let updated = self.transitioned(slice, SliceState::Uploaded, now, |s| {
            let mut stats = s.statistics.unwrap_or_default();
            stats.file_size = upload.file_size;
            stats.file_gzip_size = upload.file_gzip_size;
            s.statistics = Some(stats);
        })?;
        let txn = self
            .slice_state_txn(slice, &updated)?
            .then(Op::DeletePrefix(records));
        self.commit_slice(txn, slice, updated).await
    }

    /// Uploading → Failed.
    pub async fn mark_slice_upload_failed(&self, slice: &Slice, reason: &str) -> Result<Slice> {
        self.set_slice_state(slice, SliceState::Failed, |s| {
            s.last_error = Some(reason.to_string());
            s.retry_attempt += 1;
        })
        .await
    }

    /// Failed → Uploading.
    pub async fn schedule_slice_for_retry(&self, slice: &Slice) -> Result<Slice> {
        self.set_slice_state(slice, SliceState::Uploading, |_| {}).await
    }

    /// Close the slice and open its successor in the same file.
    ///
    /// Returns the closing slice and the new writing slice.
    pub async fn swap_slice(&self, old: &Slice) -> Result<(Slice, Slice)> {
        let now = self.clock.now();
        let new = Slice::new(
            SliceKey::new(old.key.file_key().clone(), now),
            old.mapping.clone(),
            old.storage_resource.clone(),
            old.number + 1,
        );
        if new.key == old.key {
            return Err(Error::AlreadyExists {
                kind: "slice",
                id: new.key.to_string(),
                parent: "file",
            });
        }

        let closing = self.transitioned(old, SliceState::Closing, now, |_| {})?;
        let new_key = Schema::slice(SliceState::Writing, &new.key);
        let txn = self
            .slice_state_txn(old, &closing)?
            .when(Compare::Missing(new_key.clone()))
            .then(Op::put(new_key, encode(&new)?))
            .or_else(Op::Get(Schema::slice(old.state, &old.key)));

        let resp = self.txn(txn).await?;
        if resp.succeeded {
            return Ok((closing, new));
        }
        if resp.first(0).is_none() {
            return Err(Error::AlreadyInState {
                kind: "slice",
                key: old.key.to_string(),
                state: SliceState::Closing.to_string(),
            });
        }
        Err(Error::AlreadyExists {
            kind: "slice",
            id: new.key.to_string(),
            parent: "file",
        })
    }

    async fn set_slice_state(
        &self,
        slice: &Slice,
        to: SliceState,
        modify: impl FnOnce(&mut Slice),
    ) -> Result<Slice> {
        let updated = self.transitioned(slice, to, self.clock.now(), modify)?;
        let txn = self.slice_state_txn(slice, &updated)?;
        self.commit_slice(txn, slice, updated).await
    }

    fn transitioned(
        &self,
        slice: &Slice,
        to: SliceState,
        now: UtcTime,
        modify: impl FnOnce(&mut Slice),
    ) -> Result<Slice> {
        check_transition(slice.state, to)?;
        let mut updated = slice.clone();
        updated.set_state(to, now);
        modify(&mut updated);
        Ok(updated)
    }

    async fn commit_slice(&self, txn: Txn, old: &Slice, updated: Slice) -> Result<Slice> {
        if self.txn(txn).await?.succeeded {
            Ok(updated)
        } else {
            Err(Error::AlreadyInState {
                kind: "slice",
                key: old.key.to_string(),
                state: updated.state.to_string(),
            })
        }
    }

    /// Move the slice from the key of its current state to the key of the new
    /// state. The stats summary of a closed slice moves with it.
    pub(super) fn slice_state_txn(&self, old: &Slice, updated: &Slice) -> Result<Txn> {
        check_transition(old.state, updated.state)?;
        let from_key = Schema::slice(old.state, &old.key);
        let to_key = Schema::slice(updated.state, &updated.key);

        let mut txn = Txn::new()
            .when(Compare::Exists(from_key.clone()))
            .when(Compare::Missing(to_key.clone()))
            .then(Op::Delete(from_key))
            .then(Op::put(to_key, encode(updated)?));

        let from_category = old.state.stats_category();
        let to_category = updated.state.stats_category();
        if from_category != to_category && from_category != StatsCategory::Opened {
            let summary = updated.statistics.unwrap_or_default();
            txn = txn
                .then(Op::Delete(Schema::slice_stats_nodes_sum(
                    from_category,
                    &old.key,
                )))
                .then(Op::put(
                    Schema::slice_stats_nodes_sum(to_category, &updated.key),
                    encode(&summary)?,
                ));
        }
        Ok(txn)
    }
}
