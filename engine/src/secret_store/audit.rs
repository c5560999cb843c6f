//! Bounded audit log — spec §4.6 "audit trail". Every secret operation,
//! successful or denied, is appended here; once `capacity` is reached the
//! oldest entry is dropped, the same drop-oldest policy the sandbox's log
//! buffer uses for captured console output.

use crate::types::AuditEntry;
use std::collections::VecDeque;
use std::sync::Mutex;

pub struct AuditLog {
    capacity: usize,
    entries: Mutex<VecDeque<AuditEntry>>,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    pub fn record(&self, entry: AuditEntry) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn snapshot(&self) -> Vec<AuditEntry> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }

    pub fn snapshot_for(&self, principal: &str) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.principal == principal)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AuditAction;
    use std::time::SystemTime;

    fn entry(principal: &str) -> AuditEntry {
        AuditEntry {
            at: SystemTime::now(),
            principal: principal.to_string(),
            secret_name: Some("k".to_string()),
            action: AuditAction::Read,
            success: true,
        }
    }

    #[test]
    fn drops_oldest_once_full() {
        let log = AuditLog::new(2);
        log.record(entry("a"));
        log.record(entry("b"));
        log.record(entry("c"));
        let snap = log.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].principal, "b");
        assert_eq!(snap[1].principal, "c");
    }

    #[test]
    fn filters_by_principal() {
        let log = AuditLog::new(10);
        log.record(entry("a"));
        log.record(entry("b"));
        log.record(entry("a"));
        assert_eq!(log.snapshot_for("a").len(), 2);
        assert_eq!(log.snapshot_for("b").len(), 1);
    }
}
