use crate::traits::ReplySink;
use crate::types::{Message, UserKey};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Separator between fragments in the persisted aggregate reply.
pub const AGGREGATE_SEPARATOR: &str = "\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchRecord {
    pub index: u64,
    pub sent: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub sent: usize,
    pub failed: usize,
    /// Not forwarded because the execution was cancelled first.
    pub withheld: usize,
}

/// Sequences parsed fragments for one execution and forwards each sequence
/// index to the sink at most once.
pub struct MessageDispatcher {
    to: UserKey,
    sink: Arc<dyn ReplySink>,
    next_index: u64,
    records: BTreeMap<u64, DispatchRecord>,
    contents: Vec<String>,
}

impl MessageDispatcher {
    pub fn new(to: UserKey, sink: Arc<dyn ReplySink>) -> Self {
        Self {
            to,
            sink,
            next_index: 0,
            records: BTreeMap::new(),
            contents: Vec::new(),
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(user = %self.to, batch = messages.len()))]
    pub async fn dispatch(
        &mut self,
        messages: Vec<Message>,
        cancel: &CancellationToken,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        for message in messages {
            let index = self.next_index;
            self.next_index += 1;
            self.contents.push(message.content.clone());
            let mut record = DispatchRecord { index, sent: false };

            if cancel.is_cancelled() {
                report.withheld += 1;
                self.records.insert(index, record);
                continue;
            }

            match self.sink.send(&self.to, &message).await {
                Ok(()) => {
                    record.sent = true;
                    report.sent += 1;
                    tracing::debug!(index, kind = message.kind.as_str(), "reply fragment sent");
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        index,
                        kind = message.kind.as_str(),
                        error = %e,
                        "reply fragment send failed"
                    );
                }
            }
            self.records.insert(index, record);
        }
        report
    }

    /// Every fragment observed during the execution, sent or not, joined for
    /// persistence.
    pub fn finalize(&self) -> String {
        self.contents.join(AGGREGATE_SEPARATOR)
    }

    pub fn records(&self) -> impl Iterator<Item = &DispatchRecord> {
        self.records.values()
    }

    pub fn sent_count(&self) -> usize {
        self.records.values().filter(|r| r.sent).count()
    }

    pub fn observed_count(&self) -> usize {
        self.contents.len()
    }
}
