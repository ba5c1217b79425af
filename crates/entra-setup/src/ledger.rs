use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    User,
    Application,
    ServicePrincipal,
}

impl ResourceKind {
    /// Position in the teardown sequence: service principal, application, user.
    fn teardown_rank(self) -> u8 {
        match self {
            ResourceKind::ServicePrincipal => 0,
            ResourceKind::Application => 1,
            ResourceKind::User => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::User => "user",
            ResourceKind::Application => "application",
            ResourceKind::ServicePrincipal => "service_principal",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle on a directory object, addressed by the object id the service assigned.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DirectoryObjectRef {
    pub object_id: String,
    pub kind: ResourceKind,
}

impl DirectoryObjectRef {
    pub fn new(kind: ResourceKind, object_id: impl Into<String>) -> Self {
        Self {
            object_id: object_id.into(),
            kind,
        }
    }
}

impl fmt::Display for DirectoryObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.object_id)
    }
}

/// Objects created by this session, in creation order. Only objects the session
/// itself created are ever recorded; teardown deletes nothing else.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLedger {
    entries: Vec<DirectoryObjectRef>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: ResourceKind, object_id: impl Into<String>) -> DirectoryObjectRef {
        let entry = DirectoryObjectRef::new(kind, object_id);
        if !self.entries.contains(&entry) {
            self.entries.push(entry.clone());
        }
        entry
    }

    /// Drops an entry once its object is gone, so it is never deleted twice.
    pub fn remove(&mut self, entry: &DirectoryObjectRef) -> bool {
        let before = self.entries.len();
        self.entries.retain(|existing| existing != entry);
        before != self.entries.len()
    }

    /// Entries in deletion order; creation order is kept within a kind.
    pub fn teardown_order(&self) -> Vec<DirectoryObjectRef> {
        let mut ordered = self.entries.clone();
        ordered.sort_by_key(|entry| entry.kind.teardown_rank());
        ordered
    }

    pub fn entries(&self) -> &[DirectoryObjectRef] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn teardown_order_is_service_principal_application_user() {
        let mut ledger = ResourceLedger::new();
        ledger.record(ResourceKind::Application, "app");
        ledger.record(ResourceKind::ServicePrincipal, "sp");
        ledger.record(ResourceKind::User, "user");

        let kinds: Vec<_> = ledger.teardown_order().into_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ResourceKind::ServicePrincipal,
                ResourceKind::Application,
                ResourceKind::User
            ]
        );
    }

    #[test]
    fn recording_twice_keeps_one_entry() {
        let mut ledger = ResourceLedger::new();
        ledger.record(ResourceKind::User, "u1");
        ledger.record(ResourceKind::User, "u1");
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn removed_entries_leave_the_plan() {
        let mut ledger = ResourceLedger::new();
        let app = ledger.record(ResourceKind::Application, "app");
        let sp = ledger.record(ResourceKind::ServicePrincipal, "sp");
        assert!(ledger.remove(&sp));
        assert!(!ledger.remove(&sp));
        assert_eq!(ledger.teardown_order(), vec![app]);
    }
}
