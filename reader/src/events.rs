//! Automation triggers.
//!
//! Handlers are kept in registration order and called in that order. The
//! reader only ever passes the canonical text form of a UID.

use std::fmt;

use serde::Serialize;
use tracing::trace;

use crate::config::Protocol;
use crate::uid::Uid;

/// Something worth surfacing that is not a tag transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// Failure threshold reached while automatic reset is off.
    FailureThreshold { consecutive_failures: u32, max_failed_checks: u8 },
    ResetStarted { attempt: u8 },
    ResetSucceeded { attempt: u8 },
    ResetFailed { attempt: u8, reason: String },
    /// Reset ceiling reached; no more automatic resets until a poll succeeds.
    RecoveryExhausted { attempts: u8 },
    /// A tag answered outside the configured protocol. The UID is known only
    /// when the chip completed selection.
    UnsupportedProtocol { uid: Option<Uid>, protocol: Protocol },
    ThermalThrottle { celsius: f32, power_level: u8 },
    ThermalRecovered { celsius: f32, power_level: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u32);

type TagHandler = Box<dyn FnMut(&str) + Send>;
type DiagnosticHandler = Box<dyn FnMut(&Diagnostic) + Send>;

#[derive(Default)]
pub struct Triggers {
    next_id: u32,
    on_tag: Vec<(HandlerId, TagHandler)>,
    on_tag_removed: Vec<(HandlerId, TagHandler)>,
    on_diagnostic: Vec<(HandlerId, DiagnosticHandler)>,
}

impl fmt::Debug for Triggers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Triggers")
            .field("on_tag", &self.on_tag.len())
            .field("on_tag_removed", &self.on_tag_removed.len())
            .field("on_diagnostic", &self.on_diagnostic.len())
            .finish()
    }
}

impl Triggers {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> HandlerId {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn add_on_tag(&mut self, handler: impl FnMut(&str) + Send + 'static) -> HandlerId {
        let id = self.next_id();
        self.on_tag.push((id, Box::new(handler)));
        id
    }

    pub fn add_on_tag_removed(&mut self, handler: impl FnMut(&str) + Send + 'static) -> HandlerId {
        let id = self.next_id();
        self.on_tag_removed.push((id, Box::new(handler)));
        id
    }

    pub fn add_on_diagnostic(
        &mut self,
        handler: impl FnMut(&Diagnostic) + Send + 'static,
    ) -> HandlerId {
        let id = self.next_id();
        self.on_diagnostic.push((id, Box::new(handler)));
        id
    }

    /// Unregister a handler. Returns false if the id was unknown.
    pub fn remove(&mut self, id: HandlerId) -> bool {
        let before = self.on_tag.len() + self.on_tag_removed.len() + self.on_diagnostic.len();
        self.on_tag.retain(|(h, _)| *h != id);
        self.on_tag_removed.retain(|(h, _)| *h != id);
        self.on_diagnostic.retain(|(h, _)| *h != id);
        before != self.on_tag.len() + self.on_tag_removed.len() + self.on_diagnostic.len()
    }

    pub(crate) fn tag(&mut self, uid: &Uid) {
        let text = uid.to_string();
        trace!(uid = %text, handlers = self.on_tag.len(), "on_tag");
        for (_, handler) in &mut self.on_tag {
            handler(&text);
        }
    }

    pub(crate) fn tag_removed(&mut self, uid: &Uid) {
        let text = uid.to_string();
        trace!(uid = %text, handlers = self.on_tag_removed.len(), "on_tag_removed");
        for (_, handler) in &mut self.on_tag_removed {
            handler(&text);
        }
    }

    pub(crate) fn diagnostic(&mut self, diagnostic: &Diagnostic) {
        for (_, handler) in &mut self.on_diagnostic {
            handler(diagnostic);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn handlers_run_in_registration_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut triggers = Triggers::new();
        for name in ["first", "second", "third"] {
            let calls = calls.clone();
            triggers.add_on_tag(move |uid| calls.lock().unwrap().push(format!("{name}:{uid}")));
        }

        triggers.tag(&crate::uid::parse("74:10:37:94").unwrap());

        assert_eq!(
            *calls.lock().unwrap(),
            vec!["first:74-10-37-94", "second:74-10-37-94", "third:74-10-37-94"]
        );
    }

    #[test]
    fn removed_handler_is_not_called() {
        let calls = Arc::new(Mutex::new(0));
        let mut triggers = Triggers::new();
        let counter = calls.clone();
        let id = triggers.add_on_tag_removed(move |_| *counter.lock().unwrap() += 1);

        assert!(triggers.remove(id));
        assert!(!triggers.remove(id));
        triggers.tag_removed(&crate::uid::parse("01").unwrap());

        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[test]
    fn diagnostics_serialize_with_kind_tag() {
        let json = serde_json::to_value(Diagnostic::ResetFailed {
            attempt: 2,
            reason: "ready timeout".into(),
        })
        .unwrap();
        assert_eq!(json["kind"], "reset_failed");
        assert_eq!(json["attempt"], 2);
    }
}
