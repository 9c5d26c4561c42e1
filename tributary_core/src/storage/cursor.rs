//! Lazy, batched iteration over raw and record tables.
//!
//! Cursors page by key so they can be restarted by re-creating them, but a
//! single cursor is never rewound mid-iteration.

use crate::Result;
use crate::storage::traits::{RawRecord, Record, RecordFilter, RecordStore};
use std::collections::VecDeque;
use std::sync::Arc;

pub const DEFAULT_BATCH_SIZE: usize = 500;

pub struct RawCursor {
    store: Arc<dyn RecordStore>,
    table: String,
    params: String,
    batch_size: usize,
    last_id: u64,
    buf: VecDeque<RawRecord>,
    done: bool,
}

impl RawCursor {
    pub fn new(store: Arc<dyn RecordStore>, table: impl Into<String>, params: impl Into<String>) -> Self {
        Self {
            store,
            table: table.into(),
            params: params.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            last_id: 0,
            buf: VecDeque::new(),
            done: false,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub async fn next(&mut self) -> Result<Option<RawRecord>> {
        if self.buf.is_empty() && !self.done {
            let batch = self
                .store
                .fetch_raw(&self.table, &self.params, self.last_id, self.batch_size)
                .await?;
            if batch.len() < self.batch_size {
                self.done = true;
            }
            if let Some(last) = batch.last() {
                self.last_id = last.id;
            }
            self.buf.extend(batch);
        }
        Ok(self.buf.pop_front())
    }

    /// Release buffered rows; later `next` calls return `None`.
    pub fn close(&mut self) {
        self.buf.clear();
        self.done = true;
    }
}

pub struct RecordCursor {
    store: Arc<dyn RecordStore>,
    table: String,
    filter: RecordFilter,
    batch_size: usize,
    last_key: Option<String>,
    buf: VecDeque<Record>,
    done: bool,
}

impl RecordCursor {
    pub fn new(store: Arc<dyn RecordStore>, table: impl Into<String>, filter: RecordFilter) -> Self {
        Self {
            store,
            table: table.into(),
            filter,
            batch_size: DEFAULT_BATCH_SIZE,
            last_key: None,
            buf: VecDeque::new(),
            done: false,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub async fn next(&mut self) -> Result<Option<Record>> {
        if self.buf.is_empty() && !self.done {
            let batch = self
                .store
                .fetch_records(
                    &self.table,
                    &self.filter,
                    self.last_key.as_deref(),
                    self.batch_size,
                )
                .await?;
            if batch.len() < self.batch_size {
                self.done = true;
            }
            if let Some(last) = batch.last() {
                self.last_key = Some(last.key.clone());
            }
            self.buf.extend(batch);
        }
        Ok(self.buf.pop_front())
    }

    pub fn close(&mut self) {
        self.buf.clear();
        self.done = true;
    }
}
