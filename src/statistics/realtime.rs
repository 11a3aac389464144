//! Statistics read directly from the store

use crate::error::Result;
use crate::kv::{Op, SharedKv, Txn};
use crate::model::{ObjectKey, Stats, StatsByType, StatsCategory};
use crate::schema::Schema;

/// Sums the stats key-space of an object in one transaction, one range per category.
#[derive(Clone)]
pub struct RealtimeProvider {
    kv: SharedKv,
}

impl RealtimeProvider {
    pub fn new(kv: SharedKv) -> Self {
        RealtimeProvider { kv }
    }

    pub async fn object_stats(&self, key: &ObjectKey) -> Result<StatsByType> {
        let txn = StatsCategory::ALL.into_iter().fold(Txn::new(), |txn, category| {
            txn.then(Op::Range(Schema::stats_in_object(category, key)))
        });
        let resp = self.kv.txn(txn).await?;

        let mut out = StatsByType::default();
        for (i, category) in StatsCategory::ALL.into_iter().enumerate() {
            let mut sum = Stats::default();
            for kv in resp.kvs(i) {
                sum += kv.decode::<Stats>()?;
            }
            out.add(category, sum);
        }
        Ok(out)
    }
}
