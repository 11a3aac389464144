//! Exports and receiver cleanup

use super::{decode, Store};
use crate::error::{Error, Result};
use crate::kv::{encode, Compare, Op, Txn};
use crate::model::{
    Export, ExportBase, ExportKey, File, FileState, ReceiverKey, Slice, SliceState,
};
use crate::schema::Schema;
use tracing::info;

impl Store {
    /// Create an export together with its first opened file and slice.
    pub async fn create_export(&self, base: &ExportBase, file: &File, slice: &Slice) -> Result<()> {
        if file.key.export_key() != &base.key || slice.key.file_key() != &file.key {
            return Err(Error::Mismatch(format!(
                "file and slice must belong to the export \"{}\"",
                base.key
            )));
        }

        let resp = self
            .txn(Txn::new().then(Op::Count(Schema::exports_in_receiver(
                base.key.receiver_key(),
            ))))
            .await?;
        let limit = self.config.max_exports_per_receiver;
        if resp.count(0) >= limit {
            return Err(Error::CountLimitReached {
                kind: "export",
                limit,
                parent: "receiver",
            });
        }

        let export_key = Schema::export(&base.key);
        let file_key = Schema::file(FileState::Opened, &file.key);
        let slice_key = Schema::slice(SliceState::Writing, &slice.key);
        let txn = Txn::new()
            .when(Compare::Missing(export_key.clone()))
            .when(Compare::Missing(file_key.clone()))
            .when(Compare::Missing(slice_key.clone()))
            .then(Op::put(export_key, encode(base)?))
            .then(Op::put(file_key, encode(file)?))
            .then(Op::put(slice_key, encode(slice)?));

        if self.txn(txn).await?.succeeded {
            Ok(())
        } else {
            Err(Error::AlreadyExists {
                kind: "export",
                id: base.key.to_string(),
                parent: "receiver",
            })
        }
    }

    /// Export with its opened file and the last writing slice of that file.
    pub async fn get_export(&self, key: &ExportKey) -> Result<Export> {
        let resp = self
            .txn(
                Txn::new()
                    .then(Op::Get(Schema::export(key)))
                    .then(Op::Range(Schema::files_in_export(FileState::Opened, key)))
                    .then(Op::Range(Schema::slices_in_export(SliceState::Writing, key))),
            )
            .await?;

        let base: ExportBase = match resp.first(0) {
            Some(kv) => decode(kv)?,
            None => {
                return Err(Error::NotFound {
                    kind: "export",
                    id: key.to_string(),
                    parent: "receiver",
                })
            }
        };

        let opened_file: File = match resp.kvs(1).last() {
            Some(kv) => decode(kv)?,
            None => {
                return Err(Error::NotFound {
                    kind: "opened file",
                    id: key.to_string(),
                    parent: "export",
                })
            }
        };

        let mut opened_slice = None;
        for kv in resp.kvs(2).iter().rev() {
            let slice: Slice = decode(kv)?;
            if slice.key.file_key() == &opened_file.key {
                opened_slice = Some(slice);
                break;
            }
        }
        let opened_slice = opened_slice.ok_or_else(|| Error::NotFound {
            kind: "opened slice",
            id: opened_file.key.to_string(),
            parent: "file",
        })?;

        Ok(Export {
            base,
            opened_file,
            opened_slice,
        })
    }

    /// Delete every key of the receiver in all key spaces.
    pub async fn delete_receiver(&self, key: &ReceiverKey) -> Result<()> {
        let txn = Schema::receiver_prefixes(key)
            .into_iter()
            .fold(Txn::new(), |txn, prefix| txn.then(Op::DeletePrefix(prefix)));
        self.txn(txn).await?;
        info!(receiver = %key, "deleted receiver");
        Ok(())
    }
}
