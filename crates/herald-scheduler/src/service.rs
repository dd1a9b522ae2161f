use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument};

use crate::{
    dispatcher::deliver,
    error::{Result, SchedulerError},
    sender::MessageSender,
    store::MessageStore,
    types::{MessageFields, MessagePayload, MessageStatus, RunOutcome, ScheduledMessage},
};

/// Management API over the message store: CRUD plus "run now".
///
/// Validation lives here; state rules live in the store. Transports (HTTP,
/// CLI) stay thin and only translate to and from these calls.
pub struct ScheduleService {
    store: Arc<MessageStore>,
    sender: Arc<dyn MessageSender>,
    send_timeout: Duration,
}

impl ScheduleService {
    pub fn new(store: Arc<MessageStore>, sender: Arc<dyn MessageSender>, send_timeout: Duration) -> Self {
        Self {
            store,
            sender,
            send_timeout,
        }
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    /// List messages, optionally restricted to the given status names.
    pub fn list<S: AsRef<str>>(
        &self,
        statuses: &[S],
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<ScheduledMessage>> {
        let statuses = parse_statuses(statuses)?;
        self.store.list(&statuses, limit, offset)
    }

    pub fn get(&self, id: i64) -> Result<ScheduledMessage> {
        self.store.get_by_id(id)
    }

    #[instrument(skip(self, payload))]
    pub fn create(&self, payload: MessagePayload) -> Result<ScheduledMessage> {
        let fields = self.validate(payload)?;
        let job = self.store.create(&fields)?;
        info!(job_id = job.id, schedule_at = %job.schedule_at, "message scheduled");
        Ok(job)
    }

    /// Rewrite a `pending`/`failed` message and re-queue it with attempts reset.
    #[instrument(skip(self, payload))]
    pub fn update(&self, id: i64, payload: MessagePayload) -> Result<ScheduledMessage> {
        let fields = self.validate(payload)?;
        let job = self.store.update(id, &fields)?;
        info!(job_id = id, schedule_at = %job.schedule_at, "scheduled message updated");
        Ok(job)
    }

    #[instrument(skip(self))]
    pub fn delete(&self, id: i64) -> Result<()> {
        self.store.delete(id)?;
        info!(job_id = id, "scheduled message deleted");
        Ok(())
    }

    /// Claim and send a message right away, ignoring `schedule_at`.
    ///
    /// Uses the same claim as the dispatcher, so a message already picked
    /// up (or already sent/failed) comes back as `AlreadyProcessed` without
    /// a second send.
    ///
    /// Once claimed, delivery runs on its own task: dropping this future
    /// (e.g. the HTTP client hung up) still resolves the row.
    #[instrument(skip(self))]
    pub async fn run_now(&self, id: i64) -> Result<RunOutcome> {
        if !self.store.mark_processing(id)? {
            let current = self.store.get_by_id(id)?;
            info!(job_id = id, status = %current.status, "run now refused, already processed");
            return Ok(RunOutcome::AlreadyProcessed(current));
        }

        let job = self.store.get_by_id(id)?;
        let store = Arc::clone(&self.store);
        let sender = Arc::clone(&self.sender);
        let timeout = self.send_timeout;
        let task =
            tokio::spawn(async move { deliver(&store, sender.as_ref(), &job, timeout).await });
        let resolved = task
            .await
            .map_err(|e| SchedulerError::Task(e.to_string()))??;
        Ok(RunOutcome::Resolved(resolved))
    }

    fn validate(&self, payload: MessagePayload) -> Result<MessageFields> {
        let phone = payload.phone.trim();
        if phone.is_empty() {
            return Err(SchedulerError::Validation("phone is required".into()));
        }
        if payload.message.trim().is_empty() {
            return Err(SchedulerError::Validation("message is required".into()));
        }
        if payload.duration.is_some_and(|d| d < 0) {
            return Err(SchedulerError::Validation(
                "duration must not be negative".into(),
            ));
        }
        let reply_message_id = payload
            .reply_message_id
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());

        Ok(MessageFields {
            phone: phone.to_string(),
            message: payload.message,
            reply_message_id,
            is_forwarded: payload.is_forwarded,
            duration: payload.duration,
            schedule_at: payload.schedule_at.unwrap_or_else(|| self.store.now()),
        })
    }
}

/// Parse status names, rejecting anything outside the known set.
pub fn parse_statuses<S: AsRef<str>>(raw: &[S]) -> Result<Vec<MessageStatus>> {
    let mut out = Vec::with_capacity(raw.len());
    for s in raw {
        let s = s.as_ref().trim();
        if s.is_empty() {
            continue;
        }
        let status = s.parse().map_err(SchedulerError::Validation)?;
        if !out.contains(&status) {
            out.push(status);
        }
    }
    Ok(out)
}
