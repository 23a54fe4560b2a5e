use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::mailbox::{
    MailError, MailFilter, Mailbox, Message, MessageType, NewMessage, Priority,
};
use crate::nudge::{NudgeMarker, NudgeReason, NudgeRegistry};

/// Structured payloads for protocol messages. The store keeps them opaque;
/// only the client parses and serializes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProtocolPayload {
    WorkerDone {
        branch: String,
        task_id: String,
        #[serde(default)]
        files_modified: Vec<String>,
    },
    MergeReady {
        branch: String,
        task_id: String,
    },
    Merged {
        branch: String,
        tier: String,
    },
    Escalation {
        branch: String,
        reason: String,
    },
}

impl ProtocolPayload {
    pub fn parse(msg: &Message) -> Option<Self> {
        let payload = msg.payload.as_ref()?;
        serde_json::from_value(payload.clone()).ok()
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Facade over the store and the nudge registry: the only send path agents
/// and the orchestrator use.
pub struct Mailer<'a> {
    store: &'a Mailbox,
    nudges: &'a NudgeRegistry,
}

impl<'a> Mailer<'a> {
    pub fn new(store: &'a Mailbox, nudges: &'a NudgeRegistry) -> Self {
        Self { store, nudges }
    }

    /// Which nudge, if any, a message earns. Urgency outranks the
    /// worker_done protocol reason.
    fn nudge_reason(msg_type: MessageType, priority: Priority) -> Option<NudgeReason> {
        match priority {
            Priority::Urgent => Some(NudgeReason::UrgentPriority),
            Priority::High => Some(NudgeReason::HighPriority),
            Priority::Normal if msg_type == MessageType::WorkerDone => {
                Some(NudgeReason::WorkerDone)
            }
            Priority::Normal => None,
        }
    }

    /// Write the message; queue a pending nudge for high/urgent priority or
    /// worker_done. No keystroke injection happens here; the nudge waits
    /// for the recipient's next prompt boundary.
    pub fn send(&self, msg: NewMessage) -> Result<i64, MailError> {
        if msg.to.trim().is_empty() {
            return Err(MailError::Validation("recipient must not be empty".into()));
        }
        if msg.from.trim().is_empty() {
            return Err(MailError::Validation("sender must not be empty".into()));
        }
        let id = self.store.send(&msg)?;
        if let Some(reason) = Self::nudge_reason(msg.msg_type, msg.priority) {
            self.nudges.set(&NudgeMarker {
                recipient: msg.to.clone(),
                sender: msg.from.clone(),
                subject: msg.subject.clone(),
                message_id: id,
                reason,
                created_at: Utc::now(),
            })?;
        }
        Ok(id)
    }

    pub fn list(&self, filter: &MailFilter) -> Result<Vec<Message>, MailError> {
        self.store.list(filter)
    }

    pub fn reply(&self, original_id: i64, from: &str, body: &str) -> Result<i64, MailError> {
        self.store.reply(original_id, from, body)
    }

    /// Build the text the pre-prompt hook prepends to the recipient's next
    /// prompt: the nudge banner first (draining the marker), then every
    /// unread message oldest-first. Messages stay unread; only an explicit
    /// `mail read` flips them.
    pub fn check_inject(&self, recipient: &str) -> Result<String, MailError> {
        let mut out = String::new();

        if let Some(marker) = self.nudges.get(recipient)? {
            out.push_str(&format!(
                "=== PENDING NUDGE: {} ===\n",
                marker.reason.as_str().to_uppercase()
            ));
            out.push_str(&format!(
                "From {}: \"{}\" (message #{})\n\n",
                marker.sender, marker.subject, marker.message_id
            ));
            self.nudges.clear(recipient)?;
        }

        let unread = self.store.unread_for(recipient)?;
        for msg in &unread {
            out.push_str(&format!("--- Message #{} ---\n", msg.id));
            out.push_str(&format!("From: {}\n", msg.from));
            out.push_str(&format!("Subject: {}\n", msg.subject));
            out.push_str(&format!(
                "Type: {}  Priority: {}\n",
                msg.msg_type.as_str(),
                msg.priority.as_str()
            ));
            out.push_str(&format!("Date: {}\n\n", msg.created_at.to_rfc3339()));
            out.push_str(&msg.body);
            out.push_str("\n\n");
        }

        Ok(out)
    }

    /// Summary for `mail check` without `--inject`: nothing is drained.
    pub fn check_summary(&self, recipient: &str) -> Result<String, MailError> {
        let unread = self.store.unread_for(recipient)?.len();
        let pending = self.nudges.get(recipient)?.is_some();
        Ok(format!(
            "{unread} unread, nudge pending: {}",
            if pending { "yes" } else { "no" }
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::Mailbox;

    struct Fixture {
        store: Mailbox,
        nudges: NudgeRegistry,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        Fixture {
            store: Mailbox::in_memory().unwrap(),
            nudges: NudgeRegistry::new(dir.path().join("pending-nudges")),
            _dir: dir,
        }
    }

    fn outgoing(to: &str, subject: &str, priority: Priority) -> NewMessage {
        NewMessage {
            from: "orchestrator".into(),
            to: to.into(),
            subject: subject.into(),
            body: "down".into(),
            msg_type: MessageType::Status,
            priority,
            payload: None,
        }
    }

    #[test]
    fn urgent_send_queues_nudge() {
        let f = fixture();
        let mailer = Mailer::new(&f.store, &f.nudges);
        let id = mailer
            .send(outgoing("builder-1", "Fix NOW", Priority::Urgent))
            .unwrap();

        let marker = f.nudges.get("builder-1").unwrap().unwrap();
        assert_eq!(marker.message_id, id);
        assert_eq!(marker.reason, NudgeReason::UrgentPriority);
    }

    #[test]
    fn normal_send_queues_nothing() {
        let f = fixture();
        let mailer = Mailer::new(&f.store, &f.nudges);
        mailer
            .send(outgoing("builder-1", "fyi", Priority::Normal))
            .unwrap();
        assert!(f.nudges.get("builder-1").unwrap().is_none());
    }

    #[test]
    fn worker_done_queues_nudge_at_normal_priority() {
        let f = fixture();
        let mailer = Mailer::new(&f.store, &f.nudges);
        let mut msg = outgoing("orchestrator", "done", Priority::Normal);
        msg.from = "builder-1".into();
        msg.msg_type = MessageType::WorkerDone;
        mailer.send(msg).unwrap();

        let marker = f.nudges.get("orchestrator").unwrap().unwrap();
        assert_eq!(marker.reason, NudgeReason::WorkerDone);
    }

    #[test]
    fn check_inject_drains_banner_once() {
        let f = fixture();
        let mailer = Mailer::new(&f.store, &f.nudges);
        mailer
            .send(outgoing("builder-1", "Fix NOW", Priority::Urgent))
            .unwrap();

        let first = mailer.check_inject("builder-1").unwrap();
        assert!(first.contains("URGENT PRIORITY"));
        assert!(first.contains("Fix NOW"));
        assert!(first.contains("down"));

        let second = mailer.check_inject("builder-1").unwrap();
        assert!(!second.contains("PRIORITY"));
        // Message was not marked read, so the headers remain
        assert!(second.contains("Fix NOW"));
    }

    #[test]
    fn check_inject_does_not_mark_read() {
        let f = fixture();
        let mailer = Mailer::new(&f.store, &f.nudges);
        let id = mailer
            .send(outgoing("builder-1", "s", Priority::Normal))
            .unwrap();
        mailer.check_inject("builder-1").unwrap();
        assert!(f.store.get(id).unwrap().is_unread());
    }

    #[test]
    fn empty_state_yields_empty_injection() {
        let f = fixture();
        let mailer = Mailer::new(&f.store, &f.nudges);
        assert_eq!(mailer.check_inject("builder-1").unwrap(), "");
    }

    #[test]
    fn injection_lists_unread_oldest_first_with_headers() {
        let f = fixture();
        let mailer = Mailer::new(&f.store, &f.nudges);
        mailer
            .send(outgoing("builder-1", "first", Priority::Normal))
            .unwrap();
        mailer
            .send(outgoing("builder-1", "second", Priority::Normal))
            .unwrap();

        let text = mailer.check_inject("builder-1").unwrap();
        let first = text.find("Subject: first").unwrap();
        let second = text.find("Subject: second").unwrap();
        assert!(first < second);
        assert!(text.contains("From: orchestrator"));
        assert!(text.contains("Type: status  Priority: normal"));
    }

    #[test]
    fn empty_recipient_rejected() {
        let f = fixture();
        let mailer = Mailer::new(&f.store, &f.nudges);
        let err = mailer.send(outgoing("", "s", Priority::Normal)).unwrap_err();
        assert!(matches!(err, MailError::Validation(_)));
    }

    #[test]
    fn protocol_payload_round_trip() {
        let payload = ProtocolPayload::WorkerDone {
            branch: "overstory/impl/T1".into(),
            task_id: "T1".into(),
            files_modified: vec!["src/a.ts".into()],
        };
        let f = fixture();
        let mailer = Mailer::new(&f.store, &f.nudges);
        let id = mailer
            .send(NewMessage {
                from: "impl".into(),
                to: "orchestrator".into(),
                subject: "done".into(),
                body: "T1 complete".into(),
                msg_type: MessageType::WorkerDone,
                priority: Priority::Normal,
                payload: Some(payload.to_value()),
            })
            .unwrap();

        let msg = f.store.get(id).unwrap();
        assert_eq!(ProtocolPayload::parse(&msg), Some(payload));
    }

    #[test]
    fn check_summary_leaves_state_alone() {
        let f = fixture();
        let mailer = Mailer::new(&f.store, &f.nudges);
        mailer
            .send(outgoing("builder-1", "Fix NOW", Priority::Urgent))
            .unwrap();

        assert_eq!(
            mailer.check_summary("builder-1").unwrap(),
            "1 unread, nudge pending: yes"
        );
        // Still pending afterwards
        assert!(f.nudges.get("builder-1").unwrap().is_some());
    }
}
