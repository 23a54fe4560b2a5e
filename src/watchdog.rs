use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;

use crate::agent::AgentManager;
use crate::assistant::Assistant;
use crate::config::WatchdogSettings;
use crate::mailbox::{MailError, MailFilter, Mailbox};
use crate::session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Stale,
    Zombie,
}

/// What one scan saw for one agent.
#[derive(Debug, Clone)]
pub struct Observation {
    pub agent: String,
    pub session_alive: bool,
    pub last_activity: DateTime<Utc>,
    pub reported_done: bool,
}

/// The ladder: log, nudge, triage, terminate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscalationAction {
    LogWarning { agent: String, health: Health },
    Nudge { agent: String },
    Triage { agent: String },
    Terminate { agent: String },
}

/// AI triage verdict at escalation level 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriageVerdict {
    Retry,
    Terminate,
    Extend,
}

impl TriageVerdict {
    /// Lenient parse of a one-shot completion; unknown answers retry.
    pub fn parse(completion: &str) -> Self {
        let lower = completion.to_lowercase();
        if lower.contains("terminate") {
            Self::Terminate
        } else if lower.contains("extend") {
            Self::Extend
        } else {
            Self::Retry
        }
    }
}

/// Pure escalation planner: classifies each observation and tracks how
/// many consecutive scans an agent has been unhealthy. No side effects,
/// so tests drive it with a fake clock.
pub struct Watchdog {
    settings: WatchdogSettings,
    streaks: HashMap<String, u32>,
}

impl Watchdog {
    pub fn new(settings: WatchdogSettings) -> Self {
        Self {
            settings,
            streaks: HashMap::new(),
        }
    }

    pub fn classify(&self, obs: &Observation, now: DateTime<Utc>) -> Health {
        if !obs.session_alive {
            // Dead session without a worker_done is a zombie; with one the
            // agent simply finished and is awaiting merge.
            return if obs.reported_done {
                Health::Healthy
            } else {
                Health::Zombie
            };
        }
        let quiet = now.signed_duration_since(obs.last_activity);
        if quiet > ChronoDuration::milliseconds(self.settings.zombie_threshold_ms as i64) {
            Health::Zombie
        } else if quiet > ChronoDuration::milliseconds(self.settings.stale_threshold_ms as i64) {
            Health::Stale
        } else {
            Health::Healthy
        }
    }

    /// One scan: update streaks and emit the action each unhealthy agent
    /// has escalated to. Recovery resets the streak.
    pub fn plan(
        &mut self,
        observations: &[Observation],
        now: DateTime<Utc>,
    ) -> Vec<EscalationAction> {
        self.streaks
            .retain(|name, _| observations.iter().any(|o| &o.agent == name));

        let mut actions = Vec::new();
        for obs in observations {
            let health = self.classify(obs, now);
            if health == Health::Healthy {
                self.streaks.remove(&obs.agent);
                continue;
            }
            let streak = self.streaks.entry(obs.agent.clone()).or_insert(0);
            *streak += 1;
            let level = ((*streak - 1) / 2).min(3);
            actions.push(match level {
                0 => EscalationAction::LogWarning {
                    agent: obs.agent.clone(),
                    health,
                },
                1 => EscalationAction::Nudge {
                    agent: obs.agent.clone(),
                },
                2 => EscalationAction::Triage {
                    agent: obs.agent.clone(),
                },
                _ => EscalationAction::Terminate {
                    agent: obs.agent.clone(),
                },
            });
        }
        actions
    }

    pub fn reset(&mut self, agent: &str) {
        self.streaks.remove(agent);
    }

    #[cfg(test)]
    fn streak(&self, agent: &str) -> u32 {
        self.streaks.get(agent).copied().unwrap_or(0)
    }
}

/// The side-effecting half: observes live agents through the store and
/// tmux, then executes whatever the planner escalates to.
pub struct WatchdogDaemon<'a> {
    planner: Watchdog,
    store: &'a Mailbox,
    manager: &'a AgentManager<'a>,
    assistant: &'a Assistant,
    interval_ms: u64,
}

impl<'a> WatchdogDaemon<'a> {
    pub fn new(
        settings: WatchdogSettings,
        store: &'a Mailbox,
        manager: &'a AgentManager<'a>,
        assistant: &'a Assistant,
    ) -> Self {
        let interval_ms = settings.tier1_interval_ms;
        Self {
            planner: Watchdog::new(settings),
            store,
            manager,
            assistant,
            interval_ms,
        }
    }

    /// Liveness from tmux, staleness from the agent's latest mail (session
    /// start when it has never written).
    pub fn observe(&self) -> Result<Vec<Observation>, MailError> {
        self.store
            .list_agents()?
            .into_iter()
            .map(|rec| {
                let session_alive = session::is_alive(&rec.session_name());
                let last_activity = self
                    .store
                    .latest_activity(&rec.name)?
                    .unwrap_or(rec.created_at);
                let reported_done = self.store.has_reported_done(&rec.name)?;
                Ok(Observation {
                    agent: rec.name,
                    session_alive,
                    last_activity,
                    reported_done,
                })
            })
            .collect()
    }

    /// One full scan against an explicit clock; `run` feeds it wall time.
    pub fn scan_at(&mut self, now: DateTime<Utc>) -> Result<Vec<EscalationAction>, MailError> {
        let observations = self.observe()?;
        let actions = self.planner.plan(&observations, now);
        for action in &actions {
            self.execute(action);
        }
        Ok(actions)
    }

    fn execute(&mut self, action: &EscalationAction) {
        match action {
            EscalationAction::LogWarning { agent, health } => {
                tracing::warn!(%agent, "agent is {health:?}");
            }
            EscalationAction::Nudge { agent } => {
                let text = format!(
                    "overstory watchdog: no activity seen from you lately. \
                     Send a status mail: `overstory mail send --from {agent} \
                     --to orchestrator --subject status --body <update>`"
                );
                if let Err(e) = session::send_keys(&session::session_name(agent), &text) {
                    tracing::warn!(%agent, "nudge failed: {e}");
                }
            }
            EscalationAction::Triage { agent } => match self.triage(agent) {
                TriageVerdict::Terminate => {
                    tracing::warn!(%agent, "triage verdict: terminate");
                    let report = self.manager.teardown(agent);
                    if !report.is_clean() {
                        tracing::warn!(%agent, "teardown issues: {:?}", report.errors);
                    }
                    self.planner.reset(agent);
                }
                TriageVerdict::Extend => {
                    tracing::info!(%agent, "triage verdict: extend");
                    self.planner.reset(agent);
                }
                TriageVerdict::Retry => {
                    tracing::info!(%agent, "triage verdict: retry");
                    self.execute(&EscalationAction::Nudge {
                        agent: agent.clone(),
                    });
                }
            },
            EscalationAction::Terminate { agent } => {
                tracing::warn!(%agent, "escalation exhausted, terminating");
                let report = self.manager.teardown(agent);
                if !report.is_clean() {
                    tracing::warn!(%agent, "teardown issues: {:?}", report.errors);
                }
                self.planner.reset(agent);
            }
        }
    }

    /// Feed the agent's recent mail to the assistant and ask what to do.
    fn triage(&self, agent: &str) -> TriageVerdict {
        let recent = self
            .store
            .list(&MailFilter {
                from: Some(agent.to_string()),
                limit: Some(5),
                ..Default::default()
            })
            .unwrap_or_default();
        let mut context = String::new();
        for msg in &recent {
            context.push_str(&format!(
                "[{}] {}: {}\n",
                msg.created_at.to_rfc3339(),
                msg.subject,
                msg.body
            ));
        }
        let prompt = format!(
            "Agent '{agent}' in a coding swarm has gone quiet. Its recent messages:\n\
             {context}\n\
             Answer with exactly one word: retry (nudge it again), \
             terminate (kill it), or extend (give it more time)."
        );
        match self.assistant.complete(&prompt) {
            Ok(completion) => TriageVerdict::parse(&completion),
            Err(e) => {
                tracing::warn!(%agent, "triage assistant failed, defaulting to retry: {e}");
                TriageVerdict::Retry
            }
        }
    }

    /// Periodic scan until the process is interrupted.
    pub fn run(&mut self) {
        let interval = std::time::Duration::from_millis(self.interval_ms);
        loop {
            let started = std::time::Instant::now();
            match self.scan_at(Utc::now()) {
                Ok(actions) if !actions.is_empty() => {
                    tracing::info!("watchdog escalated {} agent(s)", actions.len());
                }
                Ok(_) => {}
                Err(e) => tracing::error!("watchdog scan failed: {e}"),
            }
            std::thread::sleep(interval.saturating_sub(started.elapsed()));
        }
    }
}
