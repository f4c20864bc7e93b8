/// Query iteration
///
/// [`QueryIter`] fetches result batches lazily and hands out one row per call.
/// It tracks the remaining offset and limit across batches, so a backend that
/// skips or returns rows in several pages looks like one result stream.

use crate::client::Client;
use keel_core::codec::{self, Record};
use keel_core::{
    Context, Cursor, Error, Key, MoreResults, PartitionId, Query, QueryResult, ReadOptions,
    Result, RunQueryRequest,
};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Lazy, forward-only query results
pub struct QueryIter {
    client: Client,
    ctx: Context,
    partition: PartitionId,
    query: Query,
    read: ReadOptions,
    /// Deferred validation error, reported by the first `next`
    err: Option<Error>,
    rows: VecDeque<QueryResult>,
    offset_remaining: i32,
    limit_remaining: i32,
    /// Where the next batch starts
    next_start: Option<Cursor>,
    /// Position after the last row handed out or skipped
    position: Option<Cursor>,
    /// End cursor of the latest batch
    end_cursor: Option<Cursor>,
    fetched: bool,
    exhausted: bool,
}

impl QueryIter {
    pub(crate) fn new(client: Client, ctx: Context, query: &Query) -> Self {
        let err = query.validate().err();
        let (partition, query) = client.resolve_query(query);
        let read = match &query.transaction {
            Some(txn) => ReadOptions::Transaction(txn.clone()),
            None => client.read_options(query.eventual),
        };
        Self {
            partition,
            read,
            err,
            rows: VecDeque::new(),
            offset_remaining: query.offset,
            limit_remaining: query.limit,
            next_start: query.start.clone(),
            position: query.start.clone(),
            end_cursor: None,
            fetched: false,
            exhausted: false,
            query,
            client,
            ctx,
        }
    }

    /// Load the next result into `dst` and return its key
    ///
    /// Returns `Ok(None)` once the results are exhausted. For keys-only
    /// queries `dst` is left untouched. On `Error::FieldMismatch` the row is
    /// consumed and `dst` holds the fields that did decode.
    pub fn next<R: Record>(&mut self, dst: &mut R) -> Result<Option<Key>> {
        match self.next_row()? {
            Some(row) => {
                if !self.query.keys_only {
                    codec::decode(&row.entity, dst)?;
                }
                Ok(Some(row.key))
            }
            None => Ok(None),
        }
    }

    /// Advance without decoding
    pub fn next_key(&mut self) -> Result<Option<Key>> {
        Ok(self.next_row()?.map(|row| row.key))
    }

    /// Position after the last result handed out
    ///
    /// Before any result this is the position after the skipped offset, or
    /// the query's start. A query started from this cursor resumes exactly
    /// after it.
    pub fn cursor(&mut self) -> Result<Cursor> {
        if let Some(err) = self.err.take() {
            self.exhausted = true;
            return Err(err);
        }
        if !self.fetched && !self.exhausted {
            self.fetch()?;
        }
        // the offset may take several batches to skip
        while self.offset_remaining > 0 && self.rows.is_empty() && !self.exhausted {
            self.fetch()?;
        }
        if self.exhausted && self.rows.is_empty() {
            if let Some(end) = &self.end_cursor {
                self.position = Some(end.clone());
            }
        }
        Ok(self.position.clone().unwrap_or_default())
    }

    pub(crate) fn next_row(&mut self) -> Result<Option<QueryResult>> {
        if let Some(err) = self.err.take() {
            self.exhausted = true;
            return Err(err);
        }
        loop {
            if let Some(row) = self.rows.pop_front() {
                self.position = Some(row.cursor.clone());
                return Ok(Some(row));
            }
            if self.exhausted {
                if let Some(end) = &self.end_cursor {
                    self.position = Some(end.clone());
                }
                return Ok(None);
            }
            self.fetch()?;
        }
    }

    fn fetch(&mut self) -> Result<()> {
        self.fetched = true;
        if self.limit_remaining == 0 {
            self.exhausted = true;
            return Ok(());
        }
        self.ctx.check()?;

        let mut query = self.query.clone();
        query.start = self.next_start.clone();
        query.offset = self.offset_remaining;
        query.limit = self.limit_remaining;
        let req = RunQueryRequest {
            partition: self.partition.clone(),
            query,
            page_size: self.client.config().query_batch_size,
            read: self.read.clone(),
        };
        let batch = self.client.transport().run_query(&self.ctx, req)?;
        debug!(
            kind = %self.query.kind,
            results = batch.results.len(),
            skipped = batch.skipped_results,
            more = ?batch.more_results,
            "fetched query batch"
        );

        self.offset_remaining = (self.offset_remaining - batch.skipped_results).max(0);
        if batch.skipped_results > 0 {
            if let Some(skipped) = &batch.skipped_cursor {
                self.position = Some(skipped.clone());
            }
        }
        if self.limit_remaining > 0 {
            self.limit_remaining = (self.limit_remaining - batch.results.len() as i32).max(0);
        }

        let progressed = !batch.results.is_empty() || batch.skipped_results > 0;
        self.exhausted = batch.more_results != MoreResults::NotFinished || self.limit_remaining == 0;
        if !self.exhausted && !progressed {
            warn!(kind = %self.query.kind, "query batch made no progress, stopping");
            self.exhausted = true;
        }

        self.next_start = Some(batch.end_cursor.clone());
        self.end_cursor = Some(batch.end_cursor);
        self.rows.extend(batch.results);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{ClientConfig, Entity};
    use keel_memory::MemoryDatastore;

    fn seeded(n: i64, page_size: usize) -> Client {
        let client = Client::new(
            MemoryDatastore::new().with_page_size(page_size),
            ClientConfig::new().with_project_id("test"),
        )
        .unwrap();
        let ctx = Context::background();
        let keys: Vec<Key> = (0..n).map(|_| Key::incomplete("Row", None)).collect();
        let rows: Vec<Entity> = (0..n).map(|i| Entity::new().set("I", i)).collect();
        client.put_multi(&ctx, &keys, &rows).unwrap();
        client
    }

    fn collect(client: &Client, q: &Query) -> Vec<i64> {
        let mut rows: Vec<Entity> = Vec::new();
        client.get_all(&Context::background(), q, &mut rows).unwrap();
        rows.iter().filter_map(|e| e.get("I").and_then(|v| v.as_int())).collect()
    }

    #[test]
    fn test_iterates_across_batches() {
        let client = seeded(25, 4);
        let got = collect(&client, &Query::new("Row").order("I"));
        assert_eq!(got, (0..25).collect::<Vec<_>>());
    }

    #[test]
    fn test_offset_and_limit_across_batches() {
        let client = seeded(25, 4);
        let got = collect(&client, &Query::new("Row").order("I").offset(9).limit(7));
        assert_eq!(got, (9..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_limit_zero_fetches_nothing() {
        let client = seeded(5, 4);
        let mut it = client.run(&Context::background(), &Query::new("Row").limit(0));
        assert_eq!(it.next_key().unwrap(), None);
    }

    #[test]
    fn test_validation_error_on_first_next() {
        let client = seeded(1, 4);
        let mut it = client.run(&Context::background(), &Query::kindless().filter("I =", 1));
        assert!(matches!(it.next_key(), Err(Error::InvalidQuery(_))));
    }

    #[test]
    fn test_cursor_resumes_after_last_row() {
        let client = seeded(10, 3);
        let ctx = Context::background();
        let q = Query::new("Row").order("I");
        let mut it = client.run(&ctx, &q);
        for _ in 0..4 {
            it.next_key().unwrap();
        }
        let cursor = it.cursor().unwrap();
        let rest = collect(&client, &q.start(cursor));
        assert_eq!(rest, (4..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_cursor_before_first_next_covers_offset() {
        let client = seeded(10, 3);
        let ctx = Context::background();
        let q = Query::new("Row").order("I");
        let mut it = client.run(&ctx, &q.offset(5).keys_only());
        let cursor = it.cursor().unwrap();
        assert_eq!(collect(&client, &q.start(cursor).limit(1)), vec![5]);
    }
}
