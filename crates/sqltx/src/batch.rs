//! Chunked execution of large operation lists.

use std::time::Instant;

use sqltx_types::QueryResult;
use tracing::Instrument;

use crate::config::TransactionOptions;
use crate::context::{TransactionId, TransactionStatus};
use crate::error::Error;
use crate::instrumentation::span_names;
use crate::manager::TransactionManager;
use crate::operation::DatabaseOperation;
use crate::result::{TransactionFailure, TransactionResult};

impl TransactionManager {
    /// Run `operations` in chunks of `batch_size`, one transaction per chunk.
    ///
    /// Each chunk is atomic; the batch is not. A failing chunk stops the
    /// batch, and the failure's `committed_chunks` says how many chunks
    /// before it were committed (see [`TransactionResult::is_partial`]).
    /// Chunks are separated by the configured `batch_delay`.
    pub async fn execute_batch(
        &self,
        operations: &[DatabaseOperation],
        batch_size: usize,
    ) -> TransactionResult<Vec<QueryResult>> {
        self.execute_batch_with(operations, batch_size, TransactionOptions::default())
            .await
    }

    /// [`execute_batch`](Self::execute_batch) with per-chunk overrides.
    pub async fn execute_batch_with(
        &self,
        operations: &[DatabaseOperation],
        batch_size: usize,
        options: TransactionOptions,
    ) -> TransactionResult<Vec<QueryResult>> {
        let batch_id = TransactionId::new();
        let started = Instant::now();
        let span = tracing::debug_span!(
            span_names::BATCH,
            batch_id = %batch_id,
            operations = operations.len(),
            batch_size,
        );

        async {
            if batch_size == 0 {
                return TransactionResult {
                    transaction_id: batch_id,
                    duration: started.elapsed(),
                    retry_count: 0,
                    status: TransactionStatus::Error,
                    outcome: Err(TransactionFailure::from(Error::InvalidInput(
                        "batch_size must be greater than zero".into(),
                    ))),
                };
            }

            let mut results = Vec::with_capacity(operations.len());
            let mut retry_count = 0;

            for (index, chunk) in operations.chunks(batch_size).enumerate() {
                if index > 0 && !self.inner.config.batch_delay.is_zero() {
                    tokio::time::sleep(self.inner.config.batch_delay).await;
                }

                let chunk_result = self.execute_transaction(chunk, options.clone()).await;
                retry_count += chunk_result.retry_count;

                match chunk_result.outcome {
                    Ok(chunk_results) => {
                        tracing::trace!(
                            chunk = index,
                            transaction_id = %chunk_result.transaction_id,
                            "batch chunk committed"
                        );
                        results.extend(chunk_results);
                    }
                    Err(mut failure) => {
                        failure.committed_chunks = index;
                        tracing::debug!(
                            chunk = index,
                            committed_chunks = index,
                            error = %failure,
                            "batch stopped"
                        );
                        return TransactionResult {
                            transaction_id: batch_id,
                            duration: started.elapsed(),
                            retry_count,
                            status: chunk_result.status,
                            outcome: Err(failure),
                        };
                    }
                }
            }

            TransactionResult {
                transaction_id: batch_id,
                duration: started.elapsed(),
                retry_count,
                status: TransactionStatus::Committed,
                outcome: Ok(results),
            }
        }
        .instrument(span)
        .await
    }
}
