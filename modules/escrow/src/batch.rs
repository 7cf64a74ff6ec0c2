//! Staged write-set for one ledger call

use surety_core::{StateChange, SuretyEvent, SuretyResult};
use surety_state::{LedgerMeta, Record, META_KEY};

/// Changes and events staged by one call, committed atomically
///
/// Nothing reaches the state store until the batch is committed, so a call
/// that fails halfway through leaves no trace.
#[derive(Debug)]
pub struct LedgerBatch {
    meta: LedgerMeta,
    meta_dirty: bool,
    changes: Vec<StateChange>,
    events: Vec<SuretyEvent>,
}

impl LedgerBatch {
    pub fn new(meta: LedgerMeta) -> Self {
        Self {
            meta,
            meta_dirty: false,
            changes: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Working copy of the ledger bookkeeping
    pub fn meta(&self) -> &LedgerMeta {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut LedgerMeta {
        self.meta_dirty = true;
        &mut self.meta
    }

    /// Stage a record, replacing any earlier change to the same key
    pub fn put<R: Record>(&mut self, key: Vec<u8>, record: &R) -> SuretyResult<()> {
        let change = record.to_change(key)?;
        self.push(change);
        Ok(())
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.push(StateChange::Delete { key });
    }

    pub fn emit(&mut self, event: SuretyEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[SuretyEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        !self.meta_dirty && self.changes.is_empty()
    }

    /// Final change list, with the bookkeeping record last
    pub fn into_parts(mut self) -> SuretyResult<(Vec<StateChange>, Vec<SuretyEvent>)> {
        if self.meta_dirty {
            let change = self.meta.to_change(META_KEY.to_vec())?;
            self.push(change);
        }
        Ok((self.changes, self.events))
    }

    fn push(&mut self, change: StateChange) {
        self.changes.retain(|existing| existing.key() != change.key());
        self.changes.push(change);
    }
}
