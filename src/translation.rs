use crate::error::Result;
use crate::store::{EventRow, EventStore};
use crate::types::EventOrigin;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Failures of one translation call. Transport trouble pauses the whole
/// queue; a semantic failure only counts against the record's retry budget.
#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("translation transport failure: {0}")]
    Transport(String),
    #[error("translation returned empty or invalid output")]
    Empty,
}

#[async_trait::async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, text: &str) -> std::result::Result<String, TranslateError>;
}

/// HTTP translator against a LibreTranslate-style endpoint.
pub struct HttpTranslator {
    client: reqwest::Client,
    url: String,
}

impl HttpTranslator {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }
}

#[async_trait::async_trait]
impl Translator for HttpTranslator {
    async fn translate(&self, text: &str) -> std::result::Result<String, TranslateError> {
        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "q": text,
                "source": "auto",
                "target": "ru",
                "format": "text",
            }))
            .send()
            .await
            .map_err(|e| TranslateError::Transport(e.to_string()))?;

        let payload: Value = response
            .json()
            .await
            .map_err(|e| TranslateError::Transport(e.to_string()))?;

        match payload["translatedText"].as_str() {
            Some(translated) if !translated.trim().is_empty() => Ok(translated.to_string()),
            _ => Err(TranslateError::Empty),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum QueueState {
    Running,
    PausedUntil(Instant),
}

/// Counters for one backfill sweep.
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepStats {
    pub examined: usize,
    pub translated: usize,
    pub failed_records: usize,
    /// True when the sweep was skipped or aborted because of a queue pause.
    pub paused: bool,
}

#[derive(Debug, Clone)]
pub struct TranslationConfig {
    pub batch_size: usize,
    pub retry_ceiling: i64,
    pub user_cooldown: Duration,
    pub parser_cooldown: Duration,
    pub max_in_flight: usize,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            retry_ceiling: 3,
            user_cooldown: Duration::from_secs(30),
            parser_cooldown: Duration::from_secs(600),
            max_in_flight: 3,
        }
    }
}

/// Translation backfill over the event store: two independently paced queues
/// (user-originated rows are latency-sensitive, parser backfill is not)
/// sharing one process-wide concurrency ceiling toward the translation API.
pub struct TranslationEngine {
    store: Arc<EventStore>,
    translator: Arc<dyn Translator>,
    semaphore: Arc<Semaphore>,
    user_state: Mutex<QueueState>,
    parser_state: Mutex<QueueState>,
    config: TranslationConfig,
    sweep_in_flight: AtomicBool,
}

impl TranslationEngine {
    pub fn new(
        store: Arc<EventStore>,
        translator: Arc<dyn Translator>,
        config: TranslationConfig,
    ) -> Self {
        Self {
            store,
            translator,
            semaphore: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            user_state: Mutex::new(QueueState::Running),
            parser_state: Mutex::new(QueueState::Running),
            config,
            sweep_in_flight: AtomicBool::new(false),
        }
    }

    fn state_for(&self, queue: EventOrigin) -> &Mutex<QueueState> {
        match queue {
            EventOrigin::User => &self.user_state,
            EventOrigin::Parser => &self.parser_state,
        }
    }

    fn cooldown_for(&self, queue: EventOrigin) -> Duration {
        match queue {
            EventOrigin::User => self.config.user_cooldown,
            EventOrigin::Parser => self.config.parser_cooldown,
        }
    }

    /// True when the queue may run now; clears an elapsed pause.
    async fn queue_runnable(&self, queue: EventOrigin) -> bool {
        let mut state = self.state_for(queue).lock().await;
        match *state {
            QueueState::Running => true,
            QueueState::PausedUntil(deadline) => {
                if Instant::now() >= deadline {
                    *state = QueueState::Running;
                    true
                } else {
                    false
                }
            }
        }
    }

    async fn pause_queue(&self, queue: EventOrigin) {
        let deadline = Instant::now() + self.cooldown_for(queue);
        let mut state = self.state_for(queue).lock().await;
        *state = QueueState::PausedUntil(deadline);
        warn!(queue = queue.as_str(), cooldown_secs = self.cooldown_for(queue).as_secs(), "translation queue paused");
    }

    /// One sweep over a queue, batch by batch, until the backlog is drained,
    /// a batch makes zero forward progress, or a transport failure pauses the
    /// queue.
    pub async fn sweep(&self, queue: EventOrigin) -> Result<SweepStats> {
        self.sweep_with_batch_size(queue, self.config.batch_size)
            .await
    }

    /// Operator-triggered pass with an explicit batch size.
    pub async fn sweep_with_batch_size(
        &self,
        queue: EventOrigin,
        batch_size: usize,
    ) -> Result<SweepStats> {
        let mut stats = SweepStats::default();
        if !self.queue_runnable(queue).await {
            stats.paused = true;
            debug!(queue = queue.as_str(), "queue paused, skipping sweep");
            return Ok(stats);
        }

        loop {
            let batch = self.store.events_needing_translation(
                queue,
                batch_size.max(1),
                self.config.retry_ceiling,
            )?;
            if batch.is_empty() {
                break;
            }

            let mut progressed = 0usize;
            for row in &batch {
                stats.examined += 1;
                match self.translate_row(row).await {
                    Ok(true) => {
                        stats.translated += 1;
                        progressed += 1;
                    }
                    Ok(false) => {
                        stats.failed_records += 1;
                    }
                    Err(TranslateError::Transport(reason)) => {
                        warn!(queue = queue.as_str(), %reason, "transport failure during sweep");
                        self.pause_queue(queue).await;
                        stats.paused = true;
                        return Ok(stats);
                    }
                    Err(TranslateError::Empty) => {
                        // Handled inside translate_row; unreachable here.
                        stats.failed_records += 1;
                    }
                }
            }

            if progressed == 0 {
                // Zero forward progress: stop rather than spin against a
                // failing dependency.
                break;
            }
            if batch.len() < batch_size.max(1) {
                break;
            }
        }

        if stats.examined > 0 {
            info!(
                queue = queue.as_str(),
                examined = stats.examined,
                translated = stats.translated,
                failed = stats.failed_records,
                "translation sweep done"
            );
        }
        Ok(stats)
    }

    /// Translate one row's derived fields. Returns Ok(true) on success,
    /// Ok(false) on a counted semantic failure; transport failures bubble up
    /// so the sweep can pause the queue.
    async fn translate_row(&self, row: &EventRow) -> std::result::Result<bool, TranslateError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| TranslateError::Transport("translation semaphore closed".into()))?;

        let title_ru = match self.translator.translate(&row.title).await {
            Ok(translated) => translated,
            Err(TranslateError::Empty) => {
                let exhausted = self
                    .store
                    .bump_translation_attempts(row.id, self.config.retry_ceiling)
                    .unwrap_or(false);
                if exhausted {
                    warn!(event_id = row.id, "translation retry budget exhausted, marking failed");
                }
                return Ok(false);
            }
            Err(transport) => return Err(transport),
        };

        // Secondary fields are best effort; an empty result for them does not
        // count against the record once the title translated.
        let description_ru = match &row.description {
            Some(text) => match self.translator.translate(text).await {
                Ok(translated) => Some(translated),
                Err(TranslateError::Empty) => None,
                Err(transport) => return Err(transport),
            },
            None => None,
        };
        let location_name_ru = match &row.location_name {
            Some(text) => match self.translator.translate(text).await {
                Ok(translated) => Some(translated),
                Err(TranslateError::Empty) => None,
                Err(transport) => return Err(transport),
            },
            None => None,
        };

        self.store
            .store_translation(
                row.id,
                &title_ru,
                description_ru.as_deref(),
                location_name_ru.as_deref(),
            )
            .map_err(|e| TranslateError::Transport(format!("store write failed: {}", e)))?;
        Ok(true)
    }

    /// Periodic driver: one coalesced tick sweeps the user queue first, then
    /// the parser queue. Overlapping ticks are skipped, not queued.
    pub async fn run(self: Arc<Self>, period: Duration) {
        let mut timer = tokio::time::interval(period);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            timer.tick().await;
            if self
                .sweep_in_flight
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                debug!("translation sweep still running, skipping tick");
                continue;
            }
            for queue in [EventOrigin::User, EventOrigin::Parser] {
                if let Err(e) = self.sweep(queue).await {
                    warn!(queue = queue.as_str(), error = %e, "translation sweep failed");
                }
            }
            self.sweep_in_flight.store(false, Ordering::SeqCst);
        }
    }
}
