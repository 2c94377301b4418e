//! The persistent queue engine.
//!
//! A queue is a pair of state directories, `queued/` and `pulled/`, under
//! `<root_dir>/<queue_name>/`. A message lives in exactly one of them (or in
//! the dead-letter queue's `queued/`) at any instant, and every state
//! transition is an atomic same-filesystem rename. The filesystem is the only
//! shared state between producers, workers, and restarts.

use crate::codec;
use crate::config::QueueSettings;
use crate::directory;
use crate::error::{QueueError, QueueResult};
use crate::message::{self, Flag, Message};
use crate::metrics::QueueMetrics;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, error, info, warn};

const QUEUED_DIR: &str = "queued";
const PULLED_DIR: &str = "pulled";
const TMP_DIR: &str = "tmp";

/// Queue operations consumed by workers and producers.
///
/// `Queue` is the filesystem implementation; the trait seam exists so worker
/// logic can be exercised against stand-ins.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Durably enqueues an opaque payload.
    async fn push(&self, payload: &[u8]) -> QueueResult<()>;

    /// Transfers ownership of the oldest available message to the caller,
    /// or returns `None` when nothing is available.
    async fn pull(&self) -> QueueResult<Option<Message>>;

    /// Terminal success: the message is removed.
    async fn acknowledge(&self, message: Message) -> QueueResult<()>;

    /// Records a failed attempt and applies the retry / dead-letter policy.
    async fn fail(&self, message: Message, flag: Flag) -> QueueResult<()>;

    /// Snapshot count of messages waiting in `queued/`.
    async fn len(&self) -> QueueResult<usize>;
}

/// A durable, directory-backed message queue.
pub struct Queue {
    settings: QueueSettings,
    queued_dir: PathBuf,
    pulled_dir: PathBuf,
    tmp_dir: PathBuf,
    dead_letters: Option<Box<Queue>>,
}

impl Queue {
    /// Opens (or creates) the queue described by `settings`.
    ///
    /// Directories are created idempotently, the dead-letter queue is built
    /// first so terminal routing has somewhere to land, and messages
    /// orphaned in `pulled/` by a previous crash are requeued as timeouts
    /// before the queue accepts work.
    pub async fn open(settings: QueueSettings) -> QueueResult<Self> {
        settings.validate()?;

        let dead_letters = match settings.dead_letters.as_deref() {
            Some(sink) => Some(Box::new(open_dead_letters(sink.clone()).await?)),
            None => None,
        };

        let queue_root = settings.root_dir.join(&settings.queue_name);
        let queued_dir = directory::setup(&queue_root.join(QUEUED_DIR)).await?;
        let pulled_dir = directory::setup(&queue_root.join(PULLED_DIR)).await?;
        let tmp_dir = directory::setup(&settings.root_dir.join(TMP_DIR)).await?;

        let queue = Self {
            settings,
            queued_dir,
            pulled_dir,
            tmp_dir,
            dead_letters,
        };
        queue.requeue_unfinished().await?;

        info!(
            queue = %queue.name(),
            root = %queue.settings.root_dir.display(),
            dead_letters = queue.dead_letters.is_some(),
            "queue opened"
        );
        Ok(queue)
    }

    /// This queue's name.
    pub fn name(&self) -> &str {
        &self.settings.queue_name
    }

    /// The settings this queue was opened with.
    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// The dead-letter queue, when one is configured.
    pub fn dead_letters(&self) -> Option<&Queue> {
        self.dead_letters.as_deref()
    }

    /// Durably enqueues an opaque payload.
    ///
    /// The capacity check is advisory: racing producers may transiently
    /// overshoot by at most the number of concurrent pushes.
    pub async fn push(&self, payload: &[u8]) -> QueueResult<()> {
        let len = directory::file_count(&self.queued_dir).await?;
        QueueMetrics::queue_length(self.name(), len);

        let limit = self.settings.max_queued_messages;
        if limit > 0 && len >= limit {
            return Err(QueueError::QueueFull {
                queue: self.name().to_string(),
                len,
                limit,
            });
        }

        let staged =
            codec::write_to_tmp(payload, &self.tmp_dir, self.settings.max_message_bytes).await?;
        let file_name = message::encode_file_name(staged.timestamp_ms, &[]);
        directory::move_file(&staged.path, &self.queued_dir, Some(&file_name)).await?;

        QueueMetrics::message_pushed(self.name());
        debug!(
            queue = %self.name(),
            timestamp_ms = staged.timestamp_ms,
            bytes = payload.len(),
            "message pushed"
        );
        Ok(())
    }

    /// Pulls the oldest available message, transferring it into `pulled/`.
    ///
    /// Returns `None` when the queue is empty, when another worker wins the
    /// rename race, or when the head's payload cannot be read (the file is
    /// left in `pulled/` for the next recovery pass). Heads that outlived
    /// the TTL are routed as dead and the pull moves on to the next
    /// candidate.
    pub async fn pull(&self) -> QueueResult<Option<Message>> {
        loop {
            let head = match directory::first_file(&self.queued_dir).await? {
                Some(head) => head,
                None => return Ok(None),
            };

            let pulled_path = match directory::move_file(&head, &self.pulled_dir, None).await {
                Ok(path) => path,
                Err(e) => {
                    debug!(queue = %self.name(), error = %e, "lost pull race");
                    return Ok(None);
                }
            };

            let payload = match codec::read_payload(&pulled_path).await {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(
                        queue = %self.name(),
                        file = %pulled_path.display(),
                        error = %e,
                        "unreadable payload, leaving in pulled/ for recovery"
                    );
                    return Ok(None);
                }
            };

            let message = Message::from_path(pulled_path, payload)?;

            if let Some(ttl) = self.settings.message_ttl() {
                if message.age(message::now_ms()) > ttl {
                    warn!(
                        queue = %self.name(),
                        timestamp_ms = message.timestamp_ms,
                        "message outlived ttl, routing as dead"
                    );
                    self.fail(message, Flag::Dead).await?;
                    continue;
                }
            }

            QueueMetrics::message_pulled(self.name(), message.timestamp_ms);
            debug!(
                queue = %self.name(),
                timestamp_ms = message.timestamp_ms,
                attempts = message.attempts.len(),
                "message pulled"
            );
            return Ok(Some(message));
        }
    }

    /// Terminal success: removes the message file.
    pub async fn acknowledge(&self, message: Message) -> QueueResult<()> {
        fs::remove_file(&message.path).await?;
        debug!(
            queue = %self.name(),
            timestamp_ms = message.timestamp_ms,
            "message acknowledged"
        );
        Ok(())
    }

    /// Records a failed attempt.
    ///
    /// A `Dead` flag, or exhaustion of the retry cap, routes the message to
    /// the dead-letter queue (or deletes it when none is configured). Any
    /// other failure renames the message back into `queued/` with the flag
    /// appended to its attempt history.
    pub async fn fail(&self, message: Message, flag: Flag) -> QueueResult<()> {
        if flag == Flag::Dead || self.exhausted(&message) {
            return self.dead_route(message).await;
        }

        let new_name = message.file_name_with(&flag);
        directory::move_file(&message.path, &self.queued_dir, Some(&new_name)).await?;
        debug!(
            queue = %self.name(),
            timestamp_ms = message.timestamp_ms,
            flag = %flag,
            attempts = message.attempts.len() + 1,
            "message requeued after failure"
        );
        Ok(())
    }

    /// Snapshot count of messages waiting in `queued/`.
    pub async fn len(&self) -> QueueResult<usize> {
        directory::file_count(&self.queued_dir).await
    }

    /// Snapshot count of messages waiting in the dead-letter queue, or 0
    /// when none is configured.
    pub async fn dead_letter_len(&self) -> QueueResult<usize> {
        match &self.dead_letters {
            Some(sink) => sink.len().await,
            None => Ok(0),
        }
    }

    fn exhausted(&self, message: &Message) -> bool {
        match self.settings.max_retries {
            Some(max) => message.attempts.len() >= max as usize,
            None => false,
        }
    }

    async fn dead_route(&self, message: Message) -> QueueResult<()> {
        match &self.dead_letters {
            Some(sink) => {
                let new_name = message.file_name_with(&Flag::Dead);
                directory::move_file(&message.path, &sink.queued_dir, Some(&new_name)).await?;
                warn!(
                    queue = %self.name(),
                    dead_letters = %sink.name(),
                    timestamp_ms = message.timestamp_ms,
                    attempts = message.attempts.len(),
                    "message dead-lettered"
                );
            }
            None => {
                fs::remove_file(&message.path).await?;
                warn!(
                    queue = %self.name(),
                    timestamp_ms = message.timestamp_ms,
                    attempts = message.attempts.len(),
                    "message discarded, no dead letters configured"
                );
            }
        }
        Ok(())
    }

    /// One-shot crash-recovery sweep run during `open`.
    ///
    /// Every file found in `pulled/` belonged to a worker that no longer
    /// exists; each is failed as a timeout so it re-enters the normal retry
    /// flow. A file whose payload cannot be read is routed as dead without a
    /// payload (the file itself moves intact); a file whose name does not
    /// parse is left for the operator. Recovery never aborts on one bad
    /// file.
    async fn requeue_unfinished(&self) -> QueueResult<()> {
        let orphans = directory::all_files(&self.pulled_dir).await?;
        if orphans.is_empty() {
            return Ok(());
        }

        let mut requeued = 0usize;
        for path in orphans {
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => {
                    error!(queue = %self.name(), file = %path.display(), "non-utf8 file in pulled/, skipping");
                    continue;
                }
            };
            if message::parse_file_name(&name).is_err() {
                error!(
                    queue = %self.name(),
                    file = %name,
                    "unparseable file in pulled/, leaving for operator"
                );
                continue;
            }

            match codec::read_payload(&path).await {
                Ok(payload) => {
                    let message = Message::from_path(path, payload)?;
                    self.fail(message, Flag::Timeout).await?;
                    requeued += 1;
                }
                Err(e) => {
                    warn!(
                        queue = %self.name(),
                        file = %name,
                        error = %e,
                        "unreadable payload in pulled/, routing as dead"
                    );
                    let message = Message::from_path(path, Vec::new())?;
                    self.fail(message, Flag::Dead).await?;
                }
            }
        }

        if requeued > 0 {
            info!(queue = %self.name(), count = requeued, "requeued unfinished messages");
        }
        Ok(())
    }
}

/// Opening a dead-letter queue recurses into `Queue::open`; boxing through
/// an erased future keeps the parent future finitely sized.
fn open_dead_letters(settings: QueueSettings) -> BoxFuture<'static, QueueResult<Queue>> {
    Box::pin(Queue::open(settings))
}

#[async_trait]
impl QueueBackend for Queue {
    async fn push(&self, payload: &[u8]) -> QueueResult<()> {
        Queue::push(self, payload).await
    }

    async fn pull(&self) -> QueueResult<Option<Message>> {
        Queue::pull(self).await
    }

    async fn acknowledge(&self, message: Message) -> QueueResult<()> {
        Queue::acknowledge(self, message).await
    }

    async fn fail(&self, message: Message, flag: Flag) -> QueueResult<()> {
        Queue::fail(self, message, flag).await
    }

    async fn len(&self) -> QueueResult<usize> {
        Queue::len(self).await
    }
}
