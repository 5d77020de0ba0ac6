use crate::config::FailurePolicy;
use crate::runs::SqliteRunStore;
use crate::scores::ScoreAggregator;
use crate::storage::Pool;

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub aggregator: ScoreAggregator,
    pub runs: SqliteRunStore,
}

impl AppState {
    pub fn new(pool: Pool, policy: FailurePolicy) -> Self {
        Self {
            aggregator: ScoreAggregator::new(pool.clone(), policy),
            runs: SqliteRunStore::new(pool.clone()),
            pool,
        }
    }
}
