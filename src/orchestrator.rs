use crate::agent::AgentManager;
use crate::assistant::Assistant;
use crate::config::{ORCHESTRATOR, OverstoryConfig};
use crate::mail::{Mailer, ProtocolPayload};
use crate::mailbox::{MailError, Mailbox, MessageType, NewMessage, Priority};
use crate::merge::{MergeEntry, MergeOutcome, Resolver};
use crate::nudge::NudgeRegistry;
use std::path::Path;

/// A worker_done signal turned into a merge queue item.
#[derive(Debug, Clone)]
pub struct QueuedMerge {
    pub entry: MergeEntry,
    pub message_id: i64,
}

/// Unread worker_done mail addressed to the orchestrator, in strict merge
/// order: enqueue time first, branch name as the tie-break.
pub fn collect_ready(store: &Mailbox) -> Result<Vec<QueuedMerge>, MailError> {
    let mut queue = Vec::new();
    for msg in store.unread_for(ORCHESTRATOR)? {
        if msg.msg_type != MessageType::WorkerDone {
            continue;
        }
        let Some(ProtocolPayload::WorkerDone {
            branch,
            task_id,
            files_modified,
        }) = ProtocolPayload::parse(&msg)
        else {
            tracing::warn!(id = msg.id, from = %msg.from, "worker_done without payload, skipping");
            continue;
        };
        queue.push(QueuedMerge {
            entry: MergeEntry::new(branch, task_id, msg.from, files_modified, msg.created_at),
            message_id: msg.id,
        });
    }
    queue.sort_by(|a, b| {
        a.entry
            .enqueued_at
            .cmp(&b.entry.enqueued_at)
            .then_with(|| a.entry.branch_name.cmp(&b.entry.branch_name))
    });
    Ok(queue)
}

/// Drain the queue one branch at a time: resolve, report to the worker's
/// parent, mark the signal read, and retire merged workers.
pub fn drain_merge_queue(
    repo_root: &Path,
    config: &OverstoryConfig,
    store: &Mailbox,
    nudges: &NudgeRegistry,
) -> Result<Vec<MergeOutcome>, MailError> {
    let assistant = Assistant::from_config(&config.assistant);
    let resolver = Resolver::new(
        repo_root,
        &config.repo.canonical_branch,
        &config.merge,
        &assistant,
    );
    let mailer = Mailer::new(store, nudges);
    let manager = AgentManager::new(repo_root, config, store);

    let queue = collect_ready(store)?;
    let mut outcomes = Vec::with_capacity(queue.len());
    for item in queue {
        tracing::info!(branch = %item.entry.branch_name, "resolving merge");
        let outcome = resolver.resolve(item.entry.clone());

        // Report before teardown forgets who the parent was.
        report_outcome(&mailer, store, &item, &outcome)?;
        store.mark_read(item.message_id)?;

        if outcome.success {
            let report = manager.teardown(&item.entry.agent_name);
            if !report.is_clean() {
                tracing::warn!(
                    worker = %item.entry.agent_name,
                    "post-merge teardown issues: {:?}",
                    report.errors
                );
            }
        }
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

fn report_outcome(
    mailer: &Mailer,
    store: &Mailbox,
    item: &QueuedMerge,
    outcome: &MergeOutcome,
) -> Result<(), MailError> {
    let parent = store
        .get_agent(&item.entry.agent_name)?
        .map(|rec| rec.parent)
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| ORCHESTRATOR.to_string());

    let branch = item.entry.branch_name.clone();
    let msg = if outcome.success {
        let tier = outcome
            .tier
            .map(|t| t.as_str().to_string())
            .unwrap_or_default();
        NewMessage {
            from: ORCHESTRATOR.into(),
            to: parent,
            subject: format!("Merged {branch}"),
            body: format!("{branch} (task {}) landed via {tier}", item.entry.task_id),
            msg_type: MessageType::Merged,
            priority: Priority::Normal,
            payload: Some(ProtocolPayload::Merged { branch, tier }.to_value()),
        }
    } else {
        let reason = outcome
            .error_message
            .clone()
            .unwrap_or_else(|| "unknown merge failure".into());
        NewMessage {
            from: ORCHESTRATOR.into(),
            to: parent,
            subject: format!("Merge escalation: {branch}"),
            body: reason.clone(),
            msg_type: MessageType::Escalation,
            priority: Priority::High,
            payload: Some(ProtocolPayload::Escalation { branch, reason }.to_value()),
        }
    };
    mailer.send(msg)?;
    Ok(())
}
