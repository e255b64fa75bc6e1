//! Append-only record of code/output events for one mission run.

use serde::Serialize;

/// Kind of a logged event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Code,
    Output,
}

/// One logged event. `payload` is `None` only for the seed output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transaction {
    pub kind: TransactionKind,
    pub payload: Option<String>,
}

/// Ordered transaction history owned by the orchestrator.
///
/// Entries can only be added through [`TransactionLog::seed_if_empty`] and
/// [`TransactionLog::record_round`], which keeps the sequence alternating
/// `Output, Code, Output, ...` once seeded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransactionLog {
    entries: Vec<Transaction>,
}

impl TransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push the placeholder output if nothing has been logged yet.
    ///
    /// Returns `true` when the seed was added.
    pub fn seed_if_empty(&mut self) -> bool {
        if !self.entries.is_empty() {
            return false;
        }
        self.entries.push(Transaction {
            kind: TransactionKind::Output,
            payload: None,
        });
        true
    }

    /// Append a code entry followed by its output.
    pub fn record_round(&mut self, code: impl Into<String>, output: impl Into<String>) {
        self.entries.push(Transaction {
            kind: TransactionKind::Code,
            payload: Some(code.into()),
        });
        self.entries.push(Transaction {
            kind: TransactionKind::Output,
            payload: Some(output.into()),
        });
    }

    pub fn entries(&self) -> &[Transaction] {
        &self.entries
    }

    pub fn last(&self) -> Option<&Transaction> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of completed rounds (code entries).
    pub fn rounds(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.kind == TransactionKind::Code)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_only_applies_to_empty_log() {
        let mut log = TransactionLog::new();
        assert!(log.seed_if_empty());
        assert!(!log.seed_if_empty());
        assert_eq!(log.len(), 1);
        assert_eq!(log.last().expect("seed").payload, None);
    }

    #[test]
    fn rounds_alternate_starting_and_ending_with_output() {
        let mut log = TransactionLog::new();
        log.seed_if_empty();
        for i in 0..3 {
            log.record_round(format!("code {i}"), format!("out {i}"));
        }

        assert_eq!(log.rounds(), 3);
        assert_eq!(log.len(), 7);
        for (idx, entry) in log.entries().iter().enumerate() {
            let expected = if idx % 2 == 0 {
                TransactionKind::Output
            } else {
                TransactionKind::Code
            };
            assert_eq!(entry.kind, expected, "entry {idx}");
        }
        assert_eq!(log.last().expect("last").kind, TransactionKind::Output);
    }
}
