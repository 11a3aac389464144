//! File state transitions

use super::{concurrent_modification, decode, decode_all, Store, MAX_ATTEMPTS};
use crate::clock::UtcTime;
use crate::error::{Error, Result};
use crate::kv::{encode, Compare, Op, Txn};
use crate::model::{
    check_transition, File, FileKey, FileState, ObjectKey, Slice, SliceState, Stats,
    StatsCategory,
};
use crate::schema::Schema;
use tracing::debug;

/// Operations of the file state change
const FILE_MOVE_OPS: usize = 4;
/// Operations of one slice moved with its stats summary
const SLICE_MOVE_OPS: usize = 6;
/// Slice states which block the file close
const PENDING_SLICE_STATES: [SliceState; 4] = [
    SliceState::Writing,
    SliceState::Closing,
    SliceState::Uploading,
    SliceState::Failed,
];

impl Store {
    pub async fn get_file(&self, state: FileState, key: &FileKey) -> Result<File> {
        let resp = self
            .txn(Txn::new().then(Op::Get(Schema::file(state, key))))
            .await?;
        match resp.first(0) {
            Some(kv) => decode(kv),
            None => Err(Error::NotFound {
                kind: "file",
                id: key.to_string(),
                parent: "export",
            }),
        }
    }

    /// Opened → Closing.
    pub async fn set_file_closing(&self, file: &File) -> Result<File> {
        self.set_file_state(file, FileState::Closing, |_| {}).await
    }

    /// Closing → Importing.
    ///
    /// All slices of the file must be uploaded, their statistics are summed
    /// into the file.
    pub async fn close_file(&self, file: &File) -> Result<File> {
        check_transition(file.state, FileState::Importing)?;
        let current_key = Schema::file(file.state, &file.key);
        let uploaded_prefix = Schema::slices_in_file(SliceState::Uploaded, &file.key);
        let pending = PENDING_SLICE_STATES;

        for attempt in 1..=MAX_ATTEMPTS {
            let mut read = Txn::new()
                .then(Op::Get(current_key.clone()))
                .then(Op::Range(uploaded_prefix.clone()));
            for state in pending {
                read = read.then(Op::Count(Schema::slices_in_file(state, &file.key)));
            }
            let read = self.txn(read).await?;

            if read.first(0).is_none() {
                return Err(Error::AlreadyInState {
                    kind: "file",
                    key: file.key.to_string(),
                    state: FileState::Importing.to_string(),
                });
            }
            let not_uploaded: usize = (0..pending.len()).map(|i| read.count(2 + i)).sum();
            if not_uploaded > 0 {
                return Err(Error::Mismatch(format!(
                    "file \"{}\" has {} slices not uploaded",
                    file.key, not_uploaded
                )));
            }

            let slices: Vec<Slice> = decode_all(read.kvs(1))?;
            let sum: Stats = slices.iter().filter_map(|s| s.statistics).sum();

            let mut updated = file.clone();
            updated.set_state(FileState::Importing, self.clock.now());
            updated.statistics = Some(sum);
            updated.is_empty = sum.records_count == 0;

            let txn = self
                .file_state_txn(file, &updated)?
                .when(Compare::PrefixUnchangedSince(uploaded_prefix.clone(), read.revision));
            if self.txn(txn).await?.succeeded {
                return Ok(updated);
            }
            debug!(file = %file.key, attempt, "file close conflict, retrying");
        }

        Err(concurrent_modification("file", &file.key))
    }

    /// Number of slices of the file which are not uploaded yet.
    pub async fn pending_slices_in_file(&self, key: &FileKey) -> Result<usize> {
        let mut read = Txn::new();
        for state in PENDING_SLICE_STATES {
            read = read.then(Op::Count(Schema::slices_in_file(state, key)));
        }
        let read = self.txn(read).await?;
        Ok((0..PENDING_SLICE_STATES.len()).map(|i| read.count(i)).sum())
    }

    /// Importing → Imported, all uploaded slices of the file move with it.
    ///
    /// Slices which do not fit into the file transaction are moved ahead in
    /// separate transactions, each guarded by the importing file. A repeated
    /// call continues with the remaining uploaded slices.
    pub async fn mark_file_imported(&self, file: &File) -> Result<File> {
        let now = self.clock.now();
        let updated = self.file_transitioned(file, FileState::Imported, now, |_| {})?;
        let slices = self
            .list_slices_in_file(SliceState::Uploaded, &file.key)
            .await?;

        let per_txn = (self.config.max_ops_per_txn.saturating_sub(FILE_MOVE_OPS) / SLICE_MOVE_OPS).max(1);
        let mut chunks: Vec<&[Slice]> = slices.chunks(per_txn).collect();
        let last = chunks.pop().unwrap_or_default();

        let file_key = Schema::file(file.state, &file.key);
        for chunk in chunks {
            let mut txn = Txn::new().when(Compare::Exists(file_key.clone()));
            for slice in chunk {
                txn = txn.merge(self.slice_imported_txn(slice, now)?);
            }
            if !self.txn(txn).await?.succeeded {
                return Err(Error::AlreadyInState {
                    kind: "file",
                    key: file.key.to_string(),
                    state: FileState::Imported.to_string(),
                });
            }
            debug!(file = %file.key, slices = chunk.len(), "moved slices to imported");
        }

        let mut txn = self.file_state_txn(file, &updated)?;
        for slice in last {
            txn = txn.merge(self.slice_imported_txn(slice, now)?);
        }
        self.commit_file(txn, file, updated).await
    }

    fn slice_imported_txn(&self, slice: &Slice, now: UtcTime) -> Result<Txn> {
        let mut imported = slice.clone();
        imported.set_state(SliceState::Imported, now);
        self.slice_state_txn(slice, &imported)
    }

    /// Importing → Failed.
    pub async fn mark_file_import_failed(&self, file: &File, reason: &str) -> Result<File> {
        self.set_file_state(file, FileState::Failed, |f| {
            f.last_error = Some(reason.to_string());
            f.retry_attempt += 1;
        })
        .await
    }

    /// Failed → Importing.
    pub async fn schedule_file_for_retry(&self, file: &File) -> Result<File> {
        self.set_file_state(file, FileState::Importing, |_| {}).await
    }

    /// Close the opened file and its opened slice, create their successors.
    ///
    /// All four changes are one transaction. Returns the closing file and slice.
    pub async fn swap_file(
        &self,
        old_file: &File,
        old_slice: &Slice,
        new_file: &File,
        new_slice: &Slice,
    ) -> Result<(File, Slice)> {
        let now = self.clock.now();
        let closing_file = self.file_transitioned(old_file, FileState::Closing, now, |_| {})?;
        let mut closing_slice = old_slice.clone();
        check_transition(old_slice.state, SliceState::Closing)?;
        closing_slice.set_state(SliceState::Closing, now);

        let new_file_key = Schema::file(FileState::Opened, &new_file.key);
        let new_slice_key = Schema::slice(SliceState::Writing, &new_slice.key);
        let txn = self
            .file_state_txn(old_file, &closing_file)?
            .merge(self.slice_state_txn(old_slice, &closing_slice)?)
            .when(Compare::Missing(new_file_key.clone()))
            .when(Compare::Missing(new_slice_key.clone()))
            .then(Op::put(new_file_key, encode(new_file)?))
            .then(Op::put(new_slice_key, encode(new_slice)?))
            .or_else(Op::Get(Schema::file(old_file.state, &old_file.key)))
            .or_else(Op::Get(Schema::slice(old_slice.state, &old_slice.key)));

        let resp = self.txn(txn).await?;
        if resp.succeeded {
            return Ok((closing_file, closing_slice));
        }
        if resp.first(0).is_none() {
            return Err(Error::AlreadyInState {
                kind: "file",
                key: old_file.key.to_string(),
                state: FileState::Closing.to_string(),
            });
        }
        if resp.first(1).is_none() {
            return Err(Error::AlreadyInState {
                kind: "slice",
                key: old_slice.key.to_string(),
                state: SliceState::Closing.to_string(),
            });
        }
        Err(Error::AlreadyExists {
            kind: "file",
            id: new_file.key.to_string(),
            parent: "export",
        })
    }

    /// Delete the file with its slices, records and statistics.
    ///
    /// Statistics of imported slices are added to the export `_reduce_sum`,
    /// so the totals of the export and receiver do not decrease.
    pub async fn delete_file(&self, key: &FileKey) -> Result<()> {
        let object = ObjectKey::File(key.clone());
        let imported_prefix = Schema::stats_in_object(StatsCategory::Imported, &object);
        let reduce_key = Schema::export_stats_reduce_sum(StatsCategory::Imported, key.export_key());

        for attempt in 1..=MAX_ATTEMPTS {
            let read = self
                .txn(
                    Txn::new()
                        .then(Op::Range(imported_prefix.clone()))
                        .then(Op::Get(reduce_key.clone())),
                )
                .await?;

            let imported: Stats = read
                .kvs(0)
                .iter()
                .map(decode::<Stats>)
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .sum();
            let reduce_kv = read.first(1);
            let previous: Stats = match reduce_kv {
                Some(kv) => decode(kv)?,
                None => Stats::default(),
            };

            let mut txn = Txn::new()
                .when(Compare::PrefixUnchangedSince(imported_prefix.clone(), read.revision));
            txn = match reduce_kv {
                Some(kv) => txn.when(Compare::ValueEquals(reduce_key.clone(), kv.value.clone())),
                None => txn.when(Compare::Missing(reduce_key.clone())),
            };
            for state in FileState::ALL {
                txn = txn.then(Op::Delete(Schema::file(state, key)));
            }
            for state in SliceState::ALL {
                txn = txn.then(Op::DeletePrefix(Schema::slices_in_file(state, key)));
            }
            for category in StatsCategory::ALL {
                txn = txn.then(Op::DeletePrefix(Schema::stats_in_object(category, &object)));
            }
            txn = txn.then(Op::DeletePrefix(Schema::records_in_file(key)));
            if !imported.is_zero() {
                txn = txn.then(Op::put(reduce_key.clone(), encode(&(previous + imported))?));
            }

            if self.txn(txn).await?.succeeded {
                debug!(file = %key, "deleted file");
                return Ok(());
            }
            debug!(file = %key, attempt, "file delete conflict, retrying");
        }

        Err(concurrent_modification("file", key))
    }

    async fn set_file_state(
        &self,
        file: &File,
        to: FileState,
        modify: impl FnOnce(&mut File),
    ) -> Result<File> {
        let updated = self.file_transitioned(file, to, self.clock.now(), modify)?;
        let txn = self.file_state_txn(file, &updated)?;
        self.commit_file(txn, file, updated).await
    }

    fn file_transitioned(
        &self,
        file: &File,
        to: FileState,
        now: UtcTime,
        modify: impl FnOnce(&mut File),
    ) -> Result<File> {
        check_transition(file.state, to)?;
        let mut updated = file.clone();
        updated.set_state(to, now);
        modify(&mut updated);
        Ok(updated)
    }

    async fn commit_file(&self, txn: Txn, old: &File, updated: File) -> Result<File> {
        if self.txn(txn).await?.succeeded {
            Ok(updated)
        } else {
            Err(Error::AlreadyInState {
                kind: "file",
                key: old.key.to_string(),
                state: updated.state.to_string(),
            })
        }
    }

    fn file_state_txn(&self, old: &File, updated: &File) -> Result<Txn> {
        check_transition(old.state, updated.state)?;
        let from_key = Schema::file(old.state, &old.key);
        let to_key = Schema::file(updated.state, &updated.key);
        Ok(Txn::new()
            .when(Compare::Exists(from_key.clone()))
            .when(Compare::Missing(to_key.clone()))
            .then(Op::Delete(from_key))
            .then(Op::put(to_key, encode(updated)?)))
    }
}
