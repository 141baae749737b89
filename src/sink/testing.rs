//! Recording sink for unit tests. Purely async, so it works under paused time.

use super::traits::{Sink, SinkError, SinkStatement, SinkTransaction};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Journal {
    prepared: Vec<String>,
    executed: usize,
    committed: Vec<Vec<String>>,
    commits: usize,
}

#[derive(Clone, Default)]
pub(crate) struct RecordingSink {
    journal: Arc<Mutex<Journal>>,
    fail_commit: Arc<AtomicBool>,
    fail_execute_at: Option<usize>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the execute call for the row at `index` within each transaction.
    pub fn failing_execute_at(index: usize) -> Self {
        Self {
            fail_execute_at: Some(index),
            ..Self::default()
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_commit.store(failing, Ordering::SeqCst);
    }

    pub fn prepared(&self) -> Vec<String> {
        self.journal.lock().unwrap().prepared.clone()
    }

    pub fn executed(&self) -> usize {
        self.journal.lock().unwrap().executed
    }

    pub fn committed(&self) -> Vec<Vec<String>> {
        self.journal.lock().unwrap().committed.clone()
    }

    pub fn commits(&self) -> usize {
        self.journal.lock().unwrap().commits
    }
}

struct RecordingTx {
    sink: RecordingSink,
    rows: Vec<Vec<String>>,
}

struct RecordingStatement<'a> {
    tx: &'a mut RecordingTx,
}

#[async_trait]
impl Sink for RecordingSink {
    async fn begin(&self) -> Result<Box<dyn SinkTransaction>, SinkError> {
        Ok(Box::new(RecordingTx {
            sink: self.clone(),
            rows: Vec::new(),
        }))
    }

    async fn ping(&self) -> Result<(), SinkError> {
        Ok(())
    }

    fn target(&self) -> String {
        "recording://".to_string()
    }
}

#[async_trait]
impl SinkTransaction for RecordingTx {
    async fn prepare<'a>(
        &'a mut self,
        sql: &str,
    ) -> Result<Box<dyn SinkStatement + 'a>, SinkError> {
        self.sink.journal.lock().unwrap().prepared.push(sql.to_string());
        Ok(Box::new(RecordingStatement { tx: self }))
    }

    async fn commit(self: Box<Self>) -> Result<(), SinkError> {
        let RecordingTx { sink, rows } = *self;
        if sink.fail_commit.load(Ordering::SeqCst) {
            return Err(SinkError::Aborted);
        }
        let mut journal = sink.journal.lock().unwrap();
        journal.committed.extend(rows);
        journal.commits += 1;
        Ok(())
    }
}

#[async_trait]
impl SinkStatement for RecordingStatement<'_> {
    async fn execute(&mut self, values: &[String]) -> Result<(), SinkError> {
        if self.tx.sink.fail_execute_at == Some(self.tx.rows.len()) {
            return Err(SinkError::Aborted);
        }
        self.tx.sink.journal.lock().unwrap().executed += 1;
        self.tx.rows.push(values.to_vec());
        Ok(())
    }
}
