use std::collections::HashMap;

use crate::callbacks::Handler;
use crate::error::OffloadError;
use crate::kind::OperationKind;

/// One optional handler per operation kind. Registration replaces; handlers
/// are never chained.
#[derive(Debug, Default, Clone)]
pub struct CallbackRegistry {
    slots: HashMap<OperationKind, Handler>,
}

impl CallbackRegistry {
    /// Bind `handler` to its kind, returning whatever it displaced.
    pub fn register(&mut self, handler: Handler) -> Option<Handler> {
        self.slots.insert(handler.kind(), handler)
    }

    pub fn lookup(&self, kind: OperationKind) -> Result<&Handler, OffloadError> {
        self.slots.get(&kind).ok_or(OffloadError::NotRegistered(kind))
    }

    pub fn unregister(&mut self, kind: OperationKind) -> Option<Handler> {
        self.slots.remove(&kind)
    }

    pub fn is_registered(&self, kind: OperationKind) -> bool {
        self.slots.contains_key(&kind)
    }

    /// Registered kinds in declaration order.
    pub fn kinds(&self) -> Vec<OperationKind> {
        let mut kinds: Vec<_> = self.slots.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}
