use std::sync::Arc;
use std::time::Duration;

use futures_util::{stream, StreamExt};
use herald_core::config::DispatcherConfig;
use tokio::{sync::watch, time::MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::{
    error::{Result, SendError},
    sender::MessageSender,
    store::MessageStore,
    types::{MessageStatus, OutboundMessage, ScheduledMessage},
};

/// Runtime knobs for the dispatcher loop.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Delay between polls of the due query.
    pub poll_interval: Duration,
    /// Max rows pulled per tick.
    pub batch_size: usize,
    /// Max sends in flight at once.
    pub workers: usize,
    /// Budget for a single send; exceeding it counts as a failure.
    pub send_timeout: Duration,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self::from(&DispatcherConfig::default())
    }
}

impl From<&DispatcherConfig> for DispatchOptions {
    fn from(cfg: &DispatcherConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(cfg.poll_interval_secs.max(1)),
            batch_size: cfg.batch_size.max(1),
            workers: cfg.workers.max(1),
            send_timeout: Duration::from_secs(cfg.send_timeout_secs.max(1)),
        }
    }
}

/// What a single tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Claims this dispatcher won.
    pub claimed: usize,
    /// Rows another worker claimed first.
    pub skipped: usize,
    pub sent: usize,
    pub failed: usize,
    /// Store errors while claiming or resolving individual rows.
    pub errors: usize,
}

enum JobOutcome {
    Skipped,
    Resolved(MessageStatus),
    Error,
}

/// Polls the store for due messages, claims them and hands them to the sender.
///
/// Holds no job state between ticks; every tick re-reads the store, so any
/// number of dispatchers (in-process or on other hosts) can share one database.
pub struct Dispatcher {
    store: Arc<MessageStore>,
    sender: Arc<dyn MessageSender>,
    opts: DispatchOptions,
}

impl Dispatcher {
    pub fn new(store: Arc<MessageStore>, sender: Arc<dyn MessageSender>, opts: DispatchOptions) -> Self {
        Self {
            store,
            sender,
            opts,
        }
    }

    /// Main loop. Ticks every `poll_interval` until `shutdown` broadcasts `true`.
    ///
    /// A failing tick is logged and retried on the next one; it never ends the loop.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            sender = %self.sender.name(),
            batch_size = self.opts.batch_size,
            workers = self.opts.workers,
            "dispatcher started"
        );

        let mut interval = tokio::time::interval(self.opts.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(report) if report.claimed > 0 || report.errors > 0 => {
                            info!(
                                claimed = report.claimed,
                                sent = report.sent,
                                failed = report.failed,
                                skipped = report.skipped,
                                errors = report.errors,
                                "dispatcher tick"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!("dispatcher tick error: {e}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("dispatcher shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Drain one batch of due messages.
    ///
    /// Fails only when the due query itself fails; per-row store errors are
    /// counted in the report and the row is left for the sweep.
    pub async fn tick(&self) -> Result<TickReport> {
        let due = self.store.fetch_pending(self.opts.batch_size)?;
        let mut report = TickReport::default();
        if due.is_empty() {
            return Ok(report);
        }

        let outcomes: Vec<JobOutcome> = stream::iter(due)
            .map(|job| self.process(job))
            .buffer_unordered(self.opts.workers)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                JobOutcome::Skipped => report.skipped += 1,
                JobOutcome::Resolved(status) => {
                    report.claimed += 1;
                    match status {
                        MessageStatus::Sent => report.sent += 1,
                        _ => report.failed += 1,
                    }
                }
                JobOutcome::Error => report.errors += 1,
            }
        }
        Ok(report)
    }

    async fn process(&self, job: ScheduledMessage) -> JobOutcome {
        match self.store.mark_processing(job.id) {
            Ok(true) => {}
            Ok(false) => {
                debug!(job_id = job.id, "claim lost, skipping");
                return JobOutcome::Skipped;
            }
            Err(e) => {
                error!(job_id = job.id, error = %e, "claim failed");
                return JobOutcome::Error;
            }
        }

        // Send what is stored now; the row may have been edited since the fetch.
        let job = match self.store.get_by_id(job.id) {
            Ok(fresh) => fresh,
            Err(e) => {
                error!(job_id = job.id, error = %e, "could not re-read claimed row");
                return JobOutcome::Error;
            }
        };

        match deliver(&self.store, self.sender.as_ref(), &job, self.opts.send_timeout).await {
            Ok(resolved) => JobOutcome::Resolved(resolved.status),
            Err(e) => {
                // The row stays in `sending`; the stuck sweep will pick it up.
                error!(job_id = job.id, error = %e, "could not record send result");
                JobOutcome::Error
            }
        }
    }
}

/// Send an already-claimed message and record the outcome.
///
/// Runs outside any transaction; the claim is what prevents a second send.
/// A send that outlives `timeout` is recorded as failed. Returns the row as
/// stored after resolution.
pub(crate) async fn deliver(
    store: &MessageStore,
    sender: &dyn MessageSender,
    job: &ScheduledMessage,
    timeout: Duration,
) -> Result<ScheduledMessage> {
    let msg = OutboundMessage::from(job);
    let result = match tokio::time::timeout(timeout, sender.send(&msg)).await {
        Ok(result) => result,
        Err(_) => Err(SendError::Timeout {
            ms: timeout.as_millis() as u64,
        }),
    };

    match result {
        Ok(provider_id) => {
            store.mark_sent(job.id, &provider_id, store.now())?;
            info!(job_id = job.id, message_id = %provider_id, "scheduled message sent");
        }
        Err(e) => {
            let detail = e.to_string();
            store.mark_failed(job.id, &detail)?;
            warn!(job_id = job.id, error = %detail, "scheduled message failed");
        }
    }
    store.get_by_id(job.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageFields;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records every message and answers with a sequential provider id.
    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<OutboundMessage>>,
    }

    impl RecordingSender {
        fn sent(&self) -> Vec<OutboundMessage> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageSender for RecordingSender {
        fn name(&self) -> &str {
            "recording"
        }
        async fn send(&self, msg: &OutboundMessage) -> std::result::Result<String, SendError> {
            // Give concurrent dispatchers a chance to interleave.
            tokio::task::yield_now().await;
            let mut sent = self.sent.lock().unwrap();
            sent.push(msg.clone());
            Ok(format!("wamid.{}", sent.len()))
        }
    }

    struct FailingSender;

    #[async_trait]
    impl MessageSender for FailingSender {
        fn name(&self) -> &str {
            "failing"
        }
        async fn send(&self, _msg: &OutboundMessage) -> std::result::Result<String, SendError> {
            Err(SendError::Failed("recipient not on whatsapp".into()))
        }
    }

    struct StalledSender;

    #[async_trait]
    impl MessageSender for StalledSender {
        fn name(&self) -> &str {
            "stalled"
        }
        async fn send(&self, _msg: &OutboundMessage) -> std::result::Result<String, SendError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok("too-late".into())
        }
    }

    /// Tracks the highest number of concurrent sends.
    #[derive(Default)]
    struct ProbeSender {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        total: AtomicUsize,
    }

    #[async_trait]
    impl MessageSender for ProbeSender {
        fn name(&self) -> &str {
            "probe"
        }
        async fn send(&self, _msg: &OutboundMessage) -> std::result::Result<String, SendError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let n = self.total.fetch_add(1, Ordering::SeqCst);
            Ok(format!("probe.{n}"))
        }
    }

    /// Edits another row while its own send is in flight.
    struct EditingSender {
        store: Arc<MessageStore>,
        edit: Mutex<Option<(i64, MessageFields)>>,
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageSender for EditingSender {
        fn name(&self) -> &str {
            "editing"
        }
        async fn send(&self, msg: &OutboundMessage) -> std::result::Result<String, SendError> {
            let edit = self.edit.lock().unwrap().take();
            if let Some((id, fields)) = edit {
                self.store.update(id, &fields).unwrap();
            }
            let mut sent = self.sent.lock().unwrap();
            sent.push(msg.message.clone());
            Ok(format!("wamid.{}", sent.len()))
        }
    }

    /// Removes the row it is sending, so recording the result fails.
    struct VanishingSender {
        store: Arc<MessageStore>,
    }

    #[async_trait]
    impl MessageSender for VanishingSender {
        fn name(&self) -> &str {
            "vanishing"
        }
        async fn send(&self, _msg: &OutboundMessage) -> std::result::Result<String, SendError> {
            self.store
                .conn_for_tests()
                .execute_batch("DELETE FROM scheduled_messages;")
                .unwrap();
            Ok("wamid.gone".into())
        }
    }

    fn opts() -> DispatchOptions {
        DispatchOptions {
            poll_interval: Duration::from_millis(10),
            batch_size: 10,
            workers: 4,
            send_timeout: Duration::from_secs(5),
        }
    }

    fn due(phone: &str) -> MessageFields {
        MessageFields {
            phone: phone.to_string(),
            message: format!("hello {phone}"),
            reply_message_id: None,
            is_forwarded: false,
            duration: None,
            schedule_at: Utc::now() - chrono::Duration::seconds(1),
        }
    }

    #[tokio::test]
    async fn tick_sends_due_messages_once() {
        let store = Arc::new(MessageStore::open_in_memory().unwrap());
        let sender = Arc::new(RecordingSender::default());
        let mut fields = due("+1555");
        fields.reply_message_id = Some("wamid.quoted".into());
        fields.is_forwarded = true;
        fields.duration = Some(86_400);
        let job = store.create(&fields).unwrap();

        let dispatcher = Dispatcher::new(store.clone(), sender.clone(), opts());
        let report = dispatcher.tick().await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.sent, 1);

        let sent = sender.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].reply_message_id.as_deref(), Some("wamid.quoted"));
        assert!(sent[0].is_forwarded);
        assert_eq!(sent[0].duration, Some(86_400));

        let stored = store.get_by_id(job.id).unwrap();
        assert_eq!(stored.status, MessageStatus::Sent);
        assert_eq!(stored.message_id.as_deref(), Some("wamid.1"));
        assert!(stored.sent_at.is_some());

        // Nothing left to do on the next tick.
        assert_eq!(dispatcher.tick().await.unwrap(), TickReport::default());
        assert_eq!(sender.sent().len(), 1);
    }

    #[tokio::test]
    async fn future_messages_wait() {
        let store = Arc::new(MessageStore::open_in_memory().unwrap());
        let sender = Arc::new(RecordingSender::default());
        let mut fields = due("+1555");
        fields.schedule_at = Utc::now() + chrono::Duration::hours(1);
        store.create(&fields).unwrap();

        let dispatcher = Dispatcher::new(store, sender.clone(), opts());
        assert_eq!(dispatcher.tick().await.unwrap().claimed, 0);
        assert!(sender.sent().is_empty());
    }

    #[tokio::test]
    async fn send_failure_is_recorded_and_not_retried() {
        let store = Arc::new(MessageStore::open_in_memory().unwrap());
        let job = store.create(&due("+1555")).unwrap();

        let dispatcher = Dispatcher::new(store.clone(), Arc::new(FailingSender), opts());
        let report = dispatcher.tick().await.unwrap();
        assert_eq!(report.failed, 1);

        let stored = store.get_by_id(job.id).unwrap();
        assert_eq!(stored.status, MessageStatus::Failed);
        assert_eq!(stored.attempts, 1);
        assert_eq!(
            stored.error.as_deref(),
            Some("send failed: recipient not on whatsapp")
        );
        assert_eq!(stored.message_id, None);

        assert_eq!(dispatcher.tick().await.unwrap().claimed, 0);
    }

    #[tokio::test]
    async fn send_timeout_counts_as_failure() {
        let store = Arc::new(MessageStore::open_in_memory().unwrap());
        let job = store.create(&due("+1555")).unwrap();

        let mut opts = opts();
        opts.send_timeout = Duration::from_millis(50);
        let dispatcher = Dispatcher::new(store.clone(), Arc::new(StalledSender), opts);
        dispatcher.tick().await.unwrap();

        let stored = store.get_by_id(job.id).unwrap();
        assert_eq!(stored.status, MessageStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("send timed out after 50ms"));
    }

    #[tokio::test]
    async fn rows_claimed_elsewhere_are_skipped() {
        let store = Arc::new(MessageStore::open_in_memory().unwrap());
        let sender = Arc::new(RecordingSender::default());
        let job = store.create(&due("+1555")).unwrap();

        let dispatcher = Dispatcher::new(store.clone(), sender.clone(), opts());
        // Fetch then lose the race, as a concurrent worker would cause.
        let fetched = store.fetch_pending(10).unwrap().remove(0);
        assert!(store.mark_processing(job.id).unwrap());
        assert!(matches!(dispatcher.process(fetched).await, JobOutcome::Skipped));
        assert!(sender.sent().is_empty());
    }

    #[tokio::test]
    async fn edits_made_before_the_claim_are_what_gets_sent() {
        let store = Arc::new(MessageStore::open_in_memory().unwrap());
        let mut first = due("+1555");
        first.message = "one".into();
        store.create(&first).unwrap();
        let mut second = due("+1666");
        second.schedule_at = first.schedule_at;
        second.message = "ORIGINAL".into();
        let job2 = store.create(&second).unwrap();

        let mut edited = second.clone();
        edited.message = "EDITED".into();
        let sender = Arc::new(EditingSender {
            store: store.clone(),
            edit: Mutex::new(Some((job2.id, edited))),
            sent: Mutex::new(Vec::new()),
        });
        let mut opts = opts();
        opts.workers = 1;

        let report = Dispatcher::new(store.clone(), sender.clone(), opts)
            .tick()
            .await
            .unwrap();
        assert_eq!(report.sent, 2);

        let sent = sender.sent.lock().unwrap().clone();
        assert_eq!(sent, vec!["one".to_string(), "EDITED".to_string()]);
        let stored = store.get_by_id(job2.id).unwrap();
        assert_eq!(stored.status, MessageStatus::Sent);
        assert_eq!(stored.message, sent[1]);
    }

    #[tokio::test]
    async fn failing_to_record_a_result_is_counted_as_error() {
        let store = Arc::new(MessageStore::open_in_memory().unwrap());
        store.create(&due("+1555")).unwrap();
        let sender = Arc::new(VanishingSender {
            store: store.clone(),
        });

        let report = Dispatcher::new(store, sender, opts()).tick().await.unwrap();
        assert_eq!(report.errors, 1);
        assert_eq!(report.claimed, 0);
        assert_eq!(report.sent, 0);
    }

    #[tokio::test]
    async fn in_flight_sends_are_bounded_by_workers() {
        let store = Arc::new(MessageStore::open_in_memory().unwrap());
        for i in 0..6 {
            store.create(&due(&format!("+1555000{i}"))).unwrap();
        }
        let sender = Arc::new(ProbeSender::default());
        let mut opts = opts();
        opts.workers = 2;

        let report = Dispatcher::new(store, sender.clone(), opts).tick().await.unwrap();
        assert_eq!(report.sent, 6);
        assert_eq!(sender.total.load(Ordering::SeqCst), 6);
        assert!(sender.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn racing_dispatchers_never_double_send() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("race.db");
        let path = path.to_str().unwrap();

        let seed = MessageStore::new(crate::db::open(path).unwrap()).unwrap();
        for i in 0..20 {
            seed.create(&due(&format!("+1555{i:04}"))).unwrap();
        }

        let sender = Arc::new(RecordingSender::default());
        let a = Dispatcher::new(
            Arc::new(MessageStore::new(crate::db::open(path).unwrap()).unwrap()),
            sender.clone(),
            opts(),
        );
        let b = Dispatcher::new(
            Arc::new(MessageStore::new(crate::db::open(path).unwrap()).unwrap()),
            sender.clone(),
            opts(),
        );

        for _ in 0..3 {
            let (ra, rb) = tokio::join!(a.tick(), b.tick());
            ra.unwrap();
            rb.unwrap();
        }

        let mut phones: Vec<String> = sender.sent().into_iter().map(|m| m.phone).collect();
        assert_eq!(phones.len(), 20);
        phones.sort();
        phones.dedup();
        assert_eq!(phones.len(), 20);
        for job in seed.list(&[], None, None).unwrap() {
            assert_eq!(job.status, MessageStatus::Sent);
            assert_eq!(job.attempts, 1);
        }
    }

    #[tokio::test]
    async fn tick_surfaces_store_errors() {
        let store = Arc::new(MessageStore::open_in_memory().unwrap());
        store
            .conn_for_tests()
            .execute_batch("DROP TABLE scheduled_messages;")
            .unwrap();
        let dispatcher = Dispatcher::new(store, Arc::new(RecordingSender::default()), opts());
        assert!(dispatcher.tick().await.is_err());
    }

    #[tokio::test]
    async fn run_survives_store_errors_and_stops_on_shutdown() {
        let store = Arc::new(MessageStore::open_in_memory().unwrap());
        store
            .conn_for_tests()
            .execute_batch("DROP TABLE scheduled_messages;")
            .unwrap();
        let dispatcher = Dispatcher::new(store, Arc::new(RecordingSender::default()), opts());

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(dispatcher.run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("dispatcher did not stop")
            .unwrap();
    }
}
