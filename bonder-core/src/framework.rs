use sqlx::PgPool;

/// Runs single-statement queries against the pool.
///
/// Every query is a plain struct with a `Processor<Query>` impl next to the
/// entity it reads or writes.
#[derive(Debug, Clone)]
pub struct DatabaseProcessor {
    pub pool: PgPool,
}

impl DatabaseProcessor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn begin(&self) -> Result<TransactionProcessor<'static>, sqlx::Error> {
        Ok(TransactionProcessor {
            tx: self.pool.begin().await?,
        })
    }
}

/// A unit of work spanning several statements; rows read with
/// `FOR UPDATE` stay locked until [`commit`](Self::commit).
pub struct TransactionProcessor<'b> {
    pub tx: sqlx::Transaction<'b, sqlx::Postgres>,
}

impl TransactionProcessor<'_> {
    pub fn conn(&mut self) -> &mut sqlx::PgConnection {
        &mut *self.tx
    }

    pub async fn commit(self) -> Result<(), sqlx::Error> {
        self.tx.commit().await
    }
}
