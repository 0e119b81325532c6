//! Delayed removal of bot replies and user commands.

use std::{
    collections::HashMap,
    fmt::Display,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use teloxide::types::{ChatId, MessageId};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::{
    config::AutoDeleteConfig,
    database::{GroupSettings, UserRole},
    message::Outbox,
};

const DELETE_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Kind of a message, each with its own deletion timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Keyword,
    Broadcast,
    Ranking,
    Command,
    Default,
}

impl MessageKind {
    pub const ALL: [MessageKind; 5] = [
        MessageKind::Keyword,
        MessageKind::Broadcast,
        MessageKind::Ranking,
        MessageKind::Command,
        MessageKind::Default,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Keyword => "keyword",
            MessageKind::Broadcast => "broadcast",
            MessageKind::Ranking => "ranking",
            MessageKind::Command => "command",
            MessageKind::Default => "default",
        }
    }
}

impl Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Seconds before a message of `kind` is deleted in a group with `settings`.
pub fn resolve_timeout(config: &AutoDeleteConfig, settings: &GroupSettings, kind: MessageKind) -> u64 {
    let timeout = settings
        .timeout_override(kind)
        .or_else(|| (kind == MessageKind::Default).then_some(settings.auto_delete_timeout))
        .unwrap_or_else(|| config.timeouts.get(kind));
    timeout.max(config.min_timeout).min(config.max_timeout)
}

/// Clamp a user supplied timeout into the configured range.
pub fn validate_timeout(config: &AutoDeleteConfig, timeout: u64) -> u64 {
    timeout.max(config.min_timeout).min(config.max_timeout)
}

/// Commands from admins, or starting with an exempt prefix, are kept.
pub fn is_exempt(config: &AutoDeleteConfig, role: UserRole, text: &str) -> bool {
    if role.is_admin() {
        return true;
    }
    let command = text
        .split_whitespace()
        .next()
        .and_then(|word| word.split('@').next())
        .unwrap_or_default();
    config
        .exempt_command_prefixes
        .iter()
        .any(|prefix| command.starts_with(prefix.as_str()))
}

type TaskKey = (ChatId, MessageId);

#[derive(Clone)]
pub struct AutoDeleteService {
    outbox: Arc<dyn Outbox>,
    pub config: AutoDeleteConfig,
    tasks: Arc<Mutex<HashMap<TaskKey, (u64, JoinHandle<()>)>>>,
    generation: Arc<AtomicU64>,
}

impl AutoDeleteService {
    pub fn new(outbox: Arc<dyn Outbox>, config: AutoDeleteConfig) -> Self {
        Self {
            outbox,
            config,
            tasks: Default::default(),
            generation: Default::default(),
        }
    }

    pub fn enabled_for(&self, settings: &GroupSettings) -> bool {
        self.config.enabled && settings.auto_delete
    }

    pub fn timeout_for(&self, settings: &GroupSettings, kind: MessageKind) -> Duration {
        Duration::from_secs(resolve_timeout(&self.config, settings, kind))
    }

    /// Schedule deletion when the group has auto delete on. Returns whether it did.
    pub fn schedule_in_group(
        &self,
        settings: &GroupSettings,
        chat_id: ChatId,
        message_id: MessageId,
        kind: MessageKind,
    ) -> bool {
        if !self.enabled_for(settings) {
            return false;
        }
        self.schedule(chat_id, message_id, self.timeout_for(settings, kind));
        true
    }

    /// Delete the message after `delay`, replacing an earlier schedule of the same message.
    pub fn schedule(&self, chat_id: ChatId, message_id: MessageId, delay: Duration) {
        let key = (chat_id, message_id);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let outbox = self.outbox.clone();
        let tasks = self.tasks.clone();

        let mut guard = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            for attempt in 1..=DELETE_ATTEMPTS {
                match outbox.remove(chat_id, message_id).await {
                    Ok(()) => {
                        trace!("Deleted message {} in {}", message_id.0, chat_id.0);
                        break;
                    }
                    Err(err) if attempt < DELETE_ATTEMPTS => {
                        debug!("Deleting message {} failed, retrying: {err}", message_id.0);
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                    Err(err) => warn!(
                        "Giving up deleting message {} in {}: {err}",
                        message_id.0, chat_id.0
                    ),
                }
            }
            let mut tasks = tasks.lock().unwrap_or_else(PoisonError::into_inner);
            if matches!(tasks.get(&key), Some((g, _)) if *g == generation) {
                tasks.remove(&key);
            }
        });
        if let Some((_, previous)) = guard.insert(key, (generation, handle)) {
            previous.abort();
        }
    }

    pub fn cancel(&self, chat_id: ChatId, message_id: MessageId) -> bool {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        match tasks.remove(&(chat_id, message_id)) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Abort every pending deletion.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let count = tasks.len();
        for (_, (_, handle)) in tasks.drain() {
            handle.abort();
        }
        debug!("Aborted {count} pending deletions");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{message::Reply, Error};
    use async_trait::async_trait;

    /// Records every call instead of talking to Telegram.
    #[derive(Default)]
    pub struct RecordingOutbox {
        pub delivered: Mutex<Vec<(ChatId, Reply)>>,
        pub removed: Mutex<Vec<(ChatId, MessageId)>>,
        pub fail_removals: AtomicU64,
    }

    #[async_trait]
    impl Outbox for RecordingOutbox {
        async fn deliver(&self, chat_id: ChatId, reply: &Reply) -> Result<MessageId, Error> {
            let mut delivered = self.delivered.lock().unwrap();
            delivered.push((chat_id, reply.clone()));
            Ok(MessageId(delivered.len() as i32))
        }

        async fn remove(&self, chat_id: ChatId, message_id: MessageId) -> Result<(), Error> {
            if self.fail_removals.load(Ordering::SeqCst) > 0 {
                self.fail_removals.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::NotFound("消息"));
            }
            self.removed.lock().unwrap().push((chat_id, message_id));
            Ok(())
        }
    }

    fn settings(auto_delete: bool) -> GroupSettings {
        GroupSettings {
            auto_delete,
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_timeout() {
        let config = AutoDeleteConfig::default();
        let mut settings = settings(true);
        assert_eq!(resolve_timeout(&config, &settings, MessageKind::Keyword), 1800);
        assert_eq!(resolve_timeout(&config, &settings, MessageKind::Default), 300);

        settings.auto_delete_timeout = 600;
        assert_eq!(resolve_timeout(&config, &settings, MessageKind::Default), 600);
        assert_eq!(resolve_timeout(&config, &settings, MessageKind::Ranking), 7200);

        settings
            .auto_delete_timeouts
            .insert("ranking".to_string(), 5);
        assert_eq!(resolve_timeout(&config, &settings, MessageKind::Ranking), 10);
        settings
            .auto_delete_timeouts
            .insert("broadcast".to_string(), 999_999);
        assert_eq!(resolve_timeout(&config, &settings, MessageKind::Broadcast), 86400);
    }

    #[test]
    fn test_is_exempt() {
        let config = AutoDeleteConfig::default();
        assert!(is_exempt(&config, UserRole::Admin, "/anything"));
        assert!(is_exempt(&config, UserRole::User, "/tongji30@groupbot 2"));
        assert!(is_exempt(&config, UserRole::User, "/start"));
        assert!(!is_exempt(&config, UserRole::User, "/cancel"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_deletes_after_timeout() {
        let outbox = Arc::new(RecordingOutbox::default());
        let service = AutoDeleteService::new(outbox.clone(), AutoDeleteConfig::default());

        assert!(!service.schedule_in_group(&settings(false), ChatId(-1), MessageId(1), MessageKind::Keyword));
        assert!(service.schedule_in_group(&settings(true), ChatId(-1), MessageId(2), MessageKind::Command));
        assert_eq!(service.pending(), 1);

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert!(outbox.removed.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(*outbox.removed.lock().unwrap(), vec![(ChatId(-1), MessageId(2))]);
        assert_eq!(service.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_and_cancel() {
        let outbox = Arc::new(RecordingOutbox::default());
        let service = AutoDeleteService::new(outbox.clone(), AutoDeleteConfig::default());

        service.schedule(ChatId(-1), MessageId(1), Duration::from_secs(10));
        service.schedule(ChatId(-1), MessageId(1), Duration::from_secs(100));
        service.schedule(ChatId(-1), MessageId(2), Duration::from_secs(10));
        assert_eq!(service.pending(), 2);
        assert!(service.cancel(ChatId(-1), MessageId(2)));

        tokio::time::sleep(Duration::from_secs(50)).await;
        assert!(outbox.removed.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(outbox.removed.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_failed_deletion() {
        let outbox = Arc::new(RecordingOutbox::default());
        outbox.fail_removals.store(2, Ordering::SeqCst);
        let service = AutoDeleteService::new(outbox.clone(), AutoDeleteConfig::default());

        service.schedule(ChatId(-1), MessageId(7), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(*outbox.removed.lock().unwrap(), vec![(ChatId(-1), MessageId(7))]);
    }
}
