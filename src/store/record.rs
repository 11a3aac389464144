//! Buffered records

use super::Store;
use crate::error::{Error, Result};
use crate::kv::{Compare, Op, Txn};
use crate::model::{RecordKey, SliceKey};
use crate::schema::Schema;

impl Store {
    /// Store one row of a slice, the key must be unique.
    pub async fn create_record(&self, key: &RecordKey, row: &str) -> Result<()> {
        let store_key = Schema::record(key);
        let txn = Txn::new()
            .when(Compare::Missing(store_key.clone()))
            .then(Op::put(store_key, row.as_bytes().to_vec()));
        if self.txn(txn).await?.succeeded {
            Ok(())
        } else {
            Err(Error::AlreadyExists {
                kind: "record",
                id: key.to_string(),
                parent: "slice",
            })
        }
    }

    pub async fn count_records(&self, key: &SliceKey) -> Result<usize> {
        let resp = self
            .txn(Txn::new().then(Op::Count(Schema::records_in_slice(key))))
            .await?;
        Ok(resp.count(0))
    }
}
