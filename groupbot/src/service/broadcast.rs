//! Scheduled group broadcasts.

use std::{
    collections::{HashMap, HashSet},
    fmt::Display,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, FixedOffset, Timelike, Utc};
use mongodb::bson::oid::ObjectId;
use teloxide::types::ChatId;
use tracing::{debug, error, info, warn};

use crate::{
    config::BroadcastConfig,
    database::{Broadcast, BroadcastCollection, Group, GroupCollection, GroupPermission, RepeatType},
    message::{Media, Outbox, UrlButton},
    service::auto_delete::{AutoDeleteService, MessageKind},
    utils, Error,
};

/// Failures in a row before a broadcast is paused.
const MAX_ERRORS: u32 = 5;
/// Pause after too many failures, in seconds.
const ERROR_BACKOFF_SECS: i64 = 60;
/// Two posts of a fixed time broadcast are at least this far apart, in seconds.
const RESEND_GUARD_SECS: i64 = 55;
/// Ticks further apart than this are reported, in seconds.
const DRIFT_WARNING_SECS: i64 = 120;

/// Whether `broadcast` should be posted at `now`.
pub fn should_send(broadcast: &Broadcast, now: DateTime<Utc>, offset: FixedOffset) -> bool {
    if now < broadcast.start_time {
        return false;
    }
    if broadcast.repeat_type == RepeatType::Once {
        return broadcast.last_broadcast.is_none();
    }
    if now > broadcast.end_time {
        return false;
    }
    if let Some(last) = broadcast.last_broadcast {
        if (now - last).num_seconds() < RESEND_GUARD_SECS {
            return false;
        }
    }

    match timing(broadcast) {
        Timing::Clock(clock) => {
            let local = now.with_timezone(&offset);
            local.second() < 30 && on_schedule(broadcast, clock, local.hour(), local.minute())
        }
        Timing::Unscheduled => false,
        Timing::Interval => match broadcast.last_broadcast {
            None => true,
            Some(last) => now - last >= Duration::minutes(interval_minutes(broadcast)),
        },
    }
}

fn interval_minutes(broadcast: &Broadcast) -> i64 {
    match broadcast.interval {
        i if i > 0 => i,
        _ => broadcast.repeat_type.default_interval().max(1),
    }
}

enum Timing {
    /// Counted from the previous post
    Interval,
    /// At a local wall clock `(hour, minute)`
    Clock((u32, u32)),
    /// Fixed time without a readable `schedule_time`, never posted
    Unscheduled,
}

fn timing(broadcast: &Broadcast) -> Timing {
    if !broadcast.use_fixed_time {
        return Timing::Interval;
    }
    match broadcast.schedule_time.as_deref().and_then(utils::parse_clock) {
        Some(clock) => Timing::Clock(clock),
        None => Timing::Unscheduled,
    }
}

fn on_schedule(broadcast: &Broadcast, (hour, minute): (u32, u32), at_hour: u32, at_minute: u32) -> bool {
    match broadcast.repeat_type {
        RepeatType::Once => false,
        RepeatType::Hourly => at_minute == minute,
        RepeatType::Daily => at_hour == hour && at_minute == minute,
        RepeatType::Custom => {
            let elapsed = i64::from(at_hour * 60 + at_minute) - i64::from(hour * 60 + minute);
            elapsed.rem_euclid(interval_minutes(broadcast)) == 0
        }
    }
}

/// Next time `broadcast` will be posted, if ever.
pub fn next_send_time(
    broadcast: &Broadcast,
    now: DateTime<Utc>,
    offset: FixedOffset,
) -> Option<DateTime<Utc>> {
    if broadcast.repeat_type == RepeatType::Once {
        return broadcast
            .last_broadcast
            .is_none()
            .then(|| broadcast.start_time.max(now));
    }

    let next = match timing(broadcast) {
        Timing::Unscheduled => return None,
        Timing::Clock(clock) => {
            let from = broadcast.start_time.max(now);
            let mut candidate = from.duration_trunc(Duration::minutes(1)).ok()? + Duration::minutes(1);
            let limit = interval_minutes(broadcast).max(1440);
            (0..=limit).find_map(|_| {
                let local = candidate.with_timezone(&offset);
                let hit = on_schedule(broadcast, clock, local.hour(), local.minute());
                let found = hit.then_some(candidate);
                candidate = candidate + Duration::minutes(1);
                found
            })?
        }
        Timing::Interval => match broadcast.last_broadcast {
            None => broadcast.start_time.max(now),
            Some(last) => (last + Duration::minutes(interval_minutes(broadcast))).max(now),
        },
    };
    (next <= broadcast.end_time).then_some(next)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastStatus {
    Pending,
    Running,
    Finished,
    Sent,
}

impl Display for BroadcastStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BroadcastStatus::Pending => "未开始",
            BroadcastStatus::Running => "进行中",
            BroadcastStatus::Finished => "已结束",
            BroadcastStatus::Sent => "已发送",
        })
    }
}

pub fn status(broadcast: &Broadcast, now: DateTime<Utc>) -> BroadcastStatus {
    if now < broadcast.start_time {
        BroadcastStatus::Pending
    } else if broadcast.repeat_type == RepeatType::Once {
        match broadcast.last_broadcast {
            Some(_) => BroadcastStatus::Sent,
            None => BroadcastStatus::Running,
        }
    } else if now > broadcast.end_time {
        BroadcastStatus::Finished
    } else {
        BroadcastStatus::Running
    }
}

/// A broadcast being composed in a private chat.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastDraft {
    pub group_id: i64,
    pub text: Option<String>,
    pub media: Option<Media>,
    pub buttons: Vec<UrlButton>,
    pub repeat_type: Option<RepeatType>,
    /// Minutes, only used by custom repeats
    pub interval: Option<i64>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub use_fixed_time: bool,
}

impl BroadcastDraft {
    pub fn new(group_id: i64) -> Self {
        Self {
            group_id,
            ..Default::default()
        }
    }

    pub fn has_content(&self) -> bool {
        self.text.as_deref().map_or(false, |t| !t.trim().is_empty())
            || self.media.is_some()
            || !self.buttons.is_empty()
    }

    /// Fill in defaults and check the draft, producing a broadcast ready to store.
    pub fn normalize(
        &self,
        config: &BroadcastConfig,
        now: DateTime<Utc>,
        offset: FixedOffset,
    ) -> Result<Broadcast, Error> {
        if !self.has_content() {
            return Err(Error::InvalidBroadcast("请至少提供文本、媒体或按钮".to_string()));
        }
        let repeat_type = self.repeat_type.unwrap_or_default();
        let start_time = self.start_time.unwrap_or(now);

        let interval = match repeat_type {
            RepeatType::Custom => {
                let interval = self.interval.unwrap_or_else(|| repeat_type.default_interval());
                if interval < config.min_interval || interval > config.max_interval {
                    return Err(Error::InvalidBroadcast(format!(
                        "间隔必须在 {} 到 {} 分钟之间",
                        config.min_interval, config.max_interval
                    )));
                }
                interval
            }
            other => other.default_interval(),
        };

        let end_time = match repeat_type {
            RepeatType::Once => start_time,
            _ => self.end_time.unwrap_or(start_time + Duration::days(30)),
        };
        if repeat_type != RepeatType::Once && end_time <= start_time {
            return Err(Error::InvalidBroadcast("结束时间必须晚于开始时间".to_string()));
        }

        let use_fixed_time = self.use_fixed_time && repeat_type != RepeatType::Once;
        let schedule_time = use_fixed_time
            .then(|| start_time.with_timezone(&offset).format("%H:%M").to_string());

        Ok(Broadcast {
            id: None,
            group_id: self.group_id,
            text: self.text.clone().filter(|t| !t.trim().is_empty()),
            media: self.media.clone(),
            buttons: self.buttons.clone(),
            repeat_type,
            interval,
            start_time,
            end_time,
            use_fixed_time,
            schedule_time,
            last_broadcast: None,
            created_at: Some(now),
            updated_at: Some(now),
        })
    }

    /// Apply the draft to the stored `existing` broadcast it was opened from.
    ///
    /// The previous post is kept unless the new start time is after it, so a
    /// rescheduled broadcast posts again from its new start.
    pub fn revise(
        &self,
        existing: &Broadcast,
        config: &BroadcastConfig,
        now: DateTime<Utc>,
        offset: FixedOffset,
    ) -> Result<Broadcast, Error> {
        let mut broadcast = self.normalize(config, now, offset)?;
        broadcast.id = existing.id;
        broadcast.created_at = existing.created_at;
        broadcast.last_broadcast = existing
            .last_broadcast
            .filter(|last| *last >= broadcast.start_time);
        Ok(broadcast)
    }
}

impl From<&Broadcast> for BroadcastDraft {
    fn from(broadcast: &Broadcast) -> Self {
        let repeating = broadcast.repeat_type != RepeatType::Once;
        Self {
            group_id: broadcast.group_id,
            text: broadcast.text.clone(),
            media: broadcast.media.clone(),
            buttons: broadcast.buttons.clone(),
            repeat_type: Some(broadcast.repeat_type),
            interval: (broadcast.repeat_type == RepeatType::Custom).then_some(broadcast.interval),
            start_time: Some(broadcast.start_time),
            end_time: repeating.then_some(broadcast.end_time),
            use_fixed_time: broadcast.use_fixed_time,
        }
    }
}

#[derive(Debug, Default)]
struct Failure {
    count: u32,
    paused_until: Option<DateTime<Utc>>,
}

/// Tracks broadcasts being posted and the ones that keep failing.
#[derive(Debug, Default)]
pub struct DeliveryTracker {
    failures: HashMap<ObjectId, Failure>,
    in_flight: HashSet<ObjectId>,
    /// Posts whose `last_broadcast` could not be stored
    unrecorded: HashMap<ObjectId, DateTime<Utc>>,
}

impl DeliveryTracker {
    /// Claim `id` for posting. Fails while it is in flight or paused.
    pub fn try_begin(&mut self, id: ObjectId, now: DateTime<Utc>) -> bool {
        if self.in_flight.contains(&id) {
            return false;
        }
        if let Some(failure) = self.failures.get(&id) {
            match failure.paused_until {
                Some(until) if until > now => return false,
                Some(_) => {
                    self.failures.remove(&id);
                }
                None => {}
            }
        }
        self.in_flight.insert(id)
    }

    /// Record a post made at `at`, `recorded` telling whether the database has it.
    pub fn succeed(&mut self, id: ObjectId, at: DateTime<Utc>, recorded: bool) {
        self.in_flight.remove(&id);
        self.failures.remove(&id);
        if recorded {
            self.unrecorded.remove(&id);
        } else {
            self.unrecorded.insert(id, at);
        }
    }

    /// Apply a post the database missed to a freshly loaded broadcast.
    pub fn recall(&self, broadcast: &mut Broadcast) {
        let Some(&at) = broadcast.id.and_then(|id| self.unrecorded.get(&id)) else {
            return;
        };
        if broadcast.last_broadcast.map_or(true, |last| last < at) {
            broadcast.last_broadcast = Some(at);
        }
    }

    /// Forget failures and unrecorded posts of broadcasts no longer active.
    pub fn retain(&mut self, active: &HashSet<ObjectId>) {
        self.failures.retain(|id, _| active.contains(id));
        self.unrecorded.retain(|id, _| active.contains(id));
    }

    /// Drop everything known about `id`, e.g. after it was edited.
    pub fn forget(&mut self, id: ObjectId) {
        self.failures.remove(&id);
        self.unrecorded.remove(&id);
    }

    /// Broadcasts with a failure count or an unrecorded post.
    pub fn tracked(&self) -> usize {
        self.failures.len() + self.unrecorded.len()
    }

    /// Record a failure. Returns whether the broadcast is now paused.
    pub fn fail(&mut self, id: ObjectId, now: DateTime<Utc>) -> bool {
        self.in_flight.remove(&id);
        let failure = self.failures.entry(id).or_default();
        failure.count += 1;
        if failure.count >= MAX_ERRORS {
            failure.count = 0;
            failure.paused_until = Some(now + Duration::seconds(ERROR_BACKOFF_SECS));
            true
        } else {
            false
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

fn lock(tracker: &Mutex<DeliveryTracker>) -> MutexGuard<'_, DeliveryTracker> {
    tracker.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Where posts are recorded so they are not repeated.
#[async_trait]
pub trait SentLog: Send + Sync {
    async fn mark_sent(&self, id: ObjectId, at: DateTime<Utc>) -> Result<(), Error>;
}

#[async_trait]
impl SentLog for BroadcastCollection {
    async fn mark_sent(&self, id: ObjectId, at: DateTime<Utc>) -> Result<(), Error> {
        Ok(BroadcastCollection::mark_sent(self, id, at).await?)
    }
}

/// Post a single broadcast, recording the outcome. Returns whether it was posted.
///
/// A post whose `last_broadcast` could not be stored still counts as sent; the
/// tracker remembers it so the next tick does not post it again.
async fn post(
    outbox: &dyn Outbox,
    log: &dyn SentLog,
    tracker: &Mutex<DeliveryTracker>,
    auto_delete: &AutoDeleteService,
    group: &Group,
    broadcast: &Broadcast,
    now: DateTime<Utc>,
) -> bool {
    let Some(id) = broadcast.id else {
        return false;
    };
    if !lock(tracker).try_begin(id, now) {
        debug!("Broadcast {id} is busy or paused");
        return false;
    }

    let chat_id = ChatId(broadcast.group_id);
    let message_id = match outbox.deliver(chat_id, &broadcast.reply()).await {
        Ok(message_id) => message_id,
        Err(err) => {
            if lock(tracker).fail(id, now) {
                error!("Broadcast {id} keeps failing, pausing it: {err}");
            } else {
                warn!("Failed to post broadcast {id}: {err}");
            }
            return false;
        }
    };
    auto_delete.schedule_in_group(&group.settings, chat_id, message_id, MessageKind::Broadcast);

    let recorded = match log.mark_sent(id, now).await {
        Ok(()) => true,
        Err(err) => {
            error!("Posted broadcast {id} but could not record it: {err}");
            false
        }
    };
    lock(tracker).succeed(id, now, recorded);
    info!("Posted broadcast {id} to group {}", broadcast.group_id);
    true
}

/// Remembers the previous tick to notice a stalled scheduler.
#[derive(Debug, Default)]
pub struct TickMonitor {
    last: Option<DateTime<Utc>>,
}

impl TickMonitor {
    /// Gap since the previous tick when it exceeds the warning threshold.
    pub fn observe(&mut self, now: DateTime<Utc>) -> Option<Duration> {
        let gap = self.last.replace(now).map(|last| now - last)?;
        (gap.num_seconds() > DRIFT_WARNING_SECS).then_some(gap)
    }
}

#[derive(Clone)]
pub struct BroadcastService {
    pub broadcasts: BroadcastCollection,
    groups: GroupCollection,
    outbox: Arc<dyn Outbox>,
    auto_delete: AutoDeleteService,
    pub config: BroadcastConfig,
    pub offset: FixedOffset,
    tracker: Arc<Mutex<DeliveryTracker>>,
    monitor: Arc<Mutex<TickMonitor>>,
}

impl BroadcastService {
    pub fn new(
        broadcasts: BroadcastCollection,
        groups: GroupCollection,
        outbox: Arc<dyn Outbox>,
        auto_delete: AutoDeleteService,
        config: BroadcastConfig,
        offset: FixedOffset,
    ) -> Self {
        Self {
            broadcasts,
            groups,
            outbox,
            auto_delete,
            config,
            offset,
            tracker: Default::default(),
            monitor: Default::default(),
        }
    }

    /// Store a new broadcast composed from `draft`.
    pub async fn create(&self, draft: &BroadcastDraft, now: DateTime<Utc>) -> Result<Broadcast, Error> {
        if self.broadcasts.count(draft.group_id).await? >= self.config.max_broadcasts {
            return Err(Error::InvalidBroadcast(format!(
                "每个群组最多 {} 条轮播消息",
                self.config.max_broadcasts
            )));
        }
        let mut broadcast = draft.normalize(&self.config, now, self.offset)?;
        broadcast.id = self.broadcasts.insert(&broadcast).await?;
        info!(
            "Created {} broadcast {:?} for group {}",
            broadcast.repeat_type.as_str(),
            broadcast.id,
            broadcast.group_id
        );
        Ok(broadcast)
    }

    /// Replace the stored broadcast `id` of the draft's group with `draft`.
    pub async fn update(
        &self,
        id: ObjectId,
        draft: &BroadcastDraft,
        now: DateTime<Utc>,
    ) -> Result<Broadcast, Error> {
        let existing = self
            .broadcasts
            .get(id)
            .await?
            .filter(|broadcast| broadcast.group_id == draft.group_id)
            .ok_or(Error::NotFound("轮播消息"))?;
        let broadcast = draft.revise(&existing, &self.config, now, self.offset)?;
        if !self.broadcasts.replace(&broadcast).await? {
            return Err(Error::NotFound("轮播消息"));
        }
        lock(&self.tracker).forget(id);
        info!("Updated broadcast {id} of group {}", broadcast.group_id);
        Ok(broadcast)
    }

    pub async fn remove(&self, group_id: i64, id: ObjectId) -> Result<bool, Error> {
        Ok(self.broadcasts.remove(group_id, id).await?)
    }

    pub async fn list(&self, group_id: i64) -> Result<Vec<Broadcast>, Error> {
        Ok(self.broadcasts.of_group(group_id).await?)
    }

    /// One scheduler tick: post every due broadcast. Returns how many were posted.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize, Error> {
        let gap = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observe(now);
        if let Some(gap) = gap {
            warn!("Broadcast tick is late, {}s since the previous one", gap.num_seconds());
        }

        let active = self.broadcasts.active(now).await?;
        let due: Vec<Broadcast> = {
            let mut tracker = lock(&self.tracker);
            tracker.retain(&active.iter().filter_map(|broadcast| broadcast.id).collect());
            active
                .into_iter()
                .map(|mut broadcast| {
                    tracker.recall(&mut broadcast);
                    broadcast
                })
                .filter(|broadcast| should_send(broadcast, now, self.offset))
                .collect()
        };
        if due.is_empty() {
            return Ok(0);
        }
        debug!("{} broadcasts are due", due.len());

        let mut groups: HashMap<i64, Option<Group>> = HashMap::new();
        let mut sent = 0;
        for broadcast in due {
            let group = match groups.get(&broadcast.group_id) {
                Some(group) => group.clone(),
                None => {
                    let group = self.groups.get(broadcast.group_id).await?;
                    groups.insert(broadcast.group_id, group.clone());
                    group
                }
            };
            let Some(group) = group.filter(|g| g.has_permission(GroupPermission::Broadcast)) else {
                debug!("Group {} does not allow broadcasts", broadcast.group_id);
                continue;
            };
            if self.send(&group, &broadcast, now).await {
                sent += 1;
            }
        }
        Ok(sent)
    }

    /// Post a single broadcast, recording the outcome. Returns whether it was posted.
    pub async fn send(&self, group: &Group, broadcast: &Broadcast, now: DateTime<Utc>) -> bool {
        post(
            self.outbox.as_ref(),
            &self.broadcasts,
            &self.tracker,
            &self.auto_delete,
            group,
            broadcast,
            now,
        )
        .await
    }

    /// Remove broadcasts that ended more than a day before `now`.
    pub async fn cleanup(&self, now: DateTime<Utc>) -> Result<u64, Error> {
        let deleted = self.broadcasts.delete_expired(now - Duration::days(1)).await?;
        info!("Removed {deleted} expired broadcasts");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::AutoDeleteConfig, service::auto_delete::tests::RecordingOutbox};
    use chrono::TimeZone;

    fn offset() -> FixedOffset {
        utils::offset_from_hours(8)
    }

    /// UTC time from a local (+8) wall clock.
    fn local(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        offset()
            .with_ymd_and_hms(2024, 3, 1, h, m, s)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn broadcast(repeat_type: RepeatType) -> Broadcast {
        BroadcastDraft {
            group_id: -100,
            text: Some("hello".to_string()),
            repeat_type: Some(repeat_type),
            start_time: Some(local(8, 0, 0)),
            ..Default::default()
        }
        .normalize(&BroadcastConfig::default(), local(7, 0, 0), offset())
        .unwrap()
    }

    #[test]
    fn test_once() {
        let mut once = broadcast(RepeatType::Once);
        assert_eq!(once.end_time, once.start_time);
        assert!(!should_send(&once, local(7, 59, 0), offset()));
        assert!(should_send(&once, local(8, 0, 0), offset()));
        // the end time does not stop an unsent one-off broadcast
        assert!(should_send(&once, local(9, 0, 0), offset()));
        assert_eq!(status(&once, local(9, 0, 0)), BroadcastStatus::Running);

        once.last_broadcast = Some(local(9, 0, 0));
        assert!(!should_send(&once, local(9, 5, 0), offset()));
        assert_eq!(status(&once, local(9, 5, 0)), BroadcastStatus::Sent);
        assert_eq!(status(&once, local(7, 0, 0)), BroadcastStatus::Pending);
    }

    #[test]
    fn test_interval() {
        let mut hourly = broadcast(RepeatType::Hourly);
        assert_eq!(hourly.interval, 60);
        assert!(should_send(&hourly, local(8, 0, 0), offset()));

        hourly.last_broadcast = Some(local(8, 0, 1));
        assert!(!should_send(&hourly, local(8, 30, 0), offset()));
        assert!(!should_send(&hourly, local(9, 0, 0), offset()));
        assert!(should_send(&hourly, local(9, 0, 1), offset()));
        assert_eq!(next_send_time(&hourly, local(8, 30, 0), offset()), Some(local(9, 0, 1)));

        let after_end = hourly.end_time + Duration::minutes(1);
        assert!(!should_send(&hourly, after_end, offset()));
        assert_eq!(status(&hourly, after_end), BroadcastStatus::Finished);
        assert_eq!(next_send_time(&hourly, after_end, offset()), None);
    }

    #[test]
    fn test_fixed_time() {
        let mut daily = BroadcastDraft {
            group_id: -100,
            text: Some("morning".to_string()),
            repeat_type: Some(RepeatType::Daily),
            start_time: Some(local(8, 15, 0)),
            use_fixed_time: true,
            ..Default::default()
        }
        .normalize(&BroadcastConfig::default(), local(7, 0, 0), offset())
        .unwrap();
        assert_eq!(daily.schedule_time.as_deref(), Some("08:15"));

        assert!(should_send(&daily, local(8, 15, 0), offset()));
        assert!(!should_send(&daily, local(8, 15, 40), offset()));
        assert!(!should_send(&daily, local(8, 16, 0), offset()));

        daily.last_broadcast = Some(local(8, 15, 0));
        assert!(!should_send(&daily, local(8, 15, 20), offset()));
        assert_eq!(
            next_send_time(&daily, local(8, 20, 0), offset()),
            Some(local(8, 15, 0) + Duration::days(1))
        );

        let mut custom = daily.clone();
        custom.repeat_type = RepeatType::Custom;
        custom.interval = 90;
        custom.last_broadcast = None;
        assert!(should_send(&custom, local(9, 45, 0), offset()));
        assert!(!should_send(&custom, local(9, 15, 0), offset()));
        assert!(should_send(&custom, local(11, 15, 0), offset()));
    }

    #[test]
    fn test_normalize_rejects() {
        let config = BroadcastConfig::default();
        let now = local(7, 0, 0);

        let empty = BroadcastDraft::new(-100);
        assert!(matches!(
            empty.normalize(&config, now, offset()),
            Err(Error::InvalidBroadcast(_))
        ));

        let mut draft = BroadcastDraft {
            text: Some("hi".to_string()),
            repeat_type: Some(RepeatType::Custom),
            interval: Some(2),
            ..BroadcastDraft::new(-100)
        };
        assert!(draft.normalize(&config, now, offset()).is_err());
        draft.interval = Some(15);
        let broadcast = draft.normalize(&config, now, offset()).unwrap();
        assert_eq!(broadcast.start_time, now);
        assert_eq!(broadcast.end_time, now + Duration::days(30));

        draft.end_time = Some(now - Duration::minutes(1));
        assert!(draft.normalize(&config, now, offset()).is_err());
    }

    #[test]
    fn test_revise_keeps_history() {
        let config = BroadcastConfig::default();
        let mut stored = broadcast(RepeatType::Daily);
        stored.id = Some(ObjectId::new());
        stored.last_broadcast = Some(local(8, 0, 0));

        let mut draft = BroadcastDraft::from(&stored);
        assert_eq!(draft.interval, None);
        assert_eq!(draft.end_time, Some(stored.end_time));
        draft.text = Some("edited".to_string());
        let revised = draft.revise(&stored, &config, local(9, 0, 0), offset()).unwrap();
        assert_eq!(revised.id, stored.id);
        assert_eq!(revised.created_at, stored.created_at);
        assert_eq!(revised.start_time, stored.start_time);
        assert_eq!(revised.end_time, stored.end_time);
        assert_eq!(revised.last_broadcast, stored.last_broadcast);
        assert_eq!(revised.text.as_deref(), Some("edited"));

        // moving the start past the last post schedules it afresh
        draft.start_time = Some(local(10, 0, 0));
        let revised = draft.revise(&stored, &config, local(9, 0, 0), offset()).unwrap();
        assert_eq!(revised.last_broadcast, None);
        assert_eq!(revised.schedule_time, None);

        draft.text = None;
        assert!(draft.revise(&stored, &config, local(9, 0, 0), offset()).is_err());
    }

    #[test]
    fn test_tracker_backoff() {
        let mut tracker = DeliveryTracker::default();
        let id = ObjectId::new();
        let now = local(8, 0, 0);

        assert!(tracker.try_begin(id, now));
        assert!(!tracker.try_begin(id, now));
        for _ in 0..MAX_ERRORS - 1 {
            assert!(!tracker.fail(id, now));
            assert!(tracker.try_begin(id, now));
        }
        assert!(tracker.fail(id, now));
        assert_eq!(tracker.in_flight(), 0);
        assert!(!tracker.try_begin(id, now + Duration::seconds(30)));
        assert!(tracker.try_begin(id, now + Duration::seconds(61)));
        tracker.succeed(id, now, true);
        assert!(tracker.try_begin(id, now));
    }

    #[test]
    fn test_tracker_forget() {
        let mut tracker = DeliveryTracker::default();
        let id = ObjectId::new();
        let now = local(8, 0, 0);
        assert!(tracker.try_begin(id, now));
        tracker.succeed(id, now, false);
        tracker.fail(id, now);
        assert_eq!(tracker.tracked(), 2);
        tracker.forget(id);
        assert_eq!(tracker.tracked(), 0);
    }

    #[test]
    fn test_fixed_time_needs_a_clock() {
        let mut daily = broadcast(RepeatType::Daily);
        daily.use_fixed_time = true;
        daily.schedule_time = None;
        assert!(!should_send(&daily, local(8, 0, 0), offset()));
        assert!(!should_send(&daily, local(12, 0, 0), offset()));
        assert_eq!(next_send_time(&daily, local(8, 0, 0), offset()), None);

        daily.schedule_time = Some("25:99".to_string());
        assert!(!should_send(&daily, local(9, 0, 0), offset()));

        daily.schedule_time = Some("09:00".to_string());
        assert!(should_send(&daily, local(9, 0, 0), offset()));
    }

    #[test]
    fn test_tracker_forgets_inactive_broadcasts() {
        let mut tracker = DeliveryTracker::default();
        let (gone, kept) = (ObjectId::new(), ObjectId::new());
        let now = local(8, 0, 0);

        assert!(tracker.try_begin(gone, now));
        tracker.fail(gone, now);
        assert!(tracker.try_begin(kept, now));
        tracker.succeed(kept, now, false);
        assert_eq!(tracker.tracked(), 2);

        tracker.retain(&HashSet::from([kept]));
        assert_eq!(tracker.tracked(), 1);
        tracker.retain(&HashSet::new());
        assert_eq!(tracker.tracked(), 0);
    }

    /// Storage that is down.
    struct UnavailableLog;

    #[async_trait]
    impl SentLog for UnavailableLog {
        async fn mark_sent(&self, _: ObjectId, _: DateTime<Utc>) -> Result<(), Error> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "database down").into())
        }
    }

    #[tokio::test]
    async fn test_post_survives_unrecorded_send() {
        let outbox = Arc::new(RecordingOutbox::default());
        let auto_delete = AutoDeleteService::new(outbox.clone(), AutoDeleteConfig::default());
        let tracker = Mutex::new(DeliveryTracker::default());
        let group = Group::new(-100, "g");
        let mut once = broadcast(RepeatType::Once);
        once.id = Some(ObjectId::new());
        let now = local(8, 0, 0);

        assert!(post(outbox.as_ref(), &UnavailableLog, &tracker, &auto_delete, &group, &once, now).await);
        assert_eq!(outbox.delivered.lock().unwrap().len(), 1);

        // the next tick loads it again without `last_broadcast`
        let mut reloaded = once.clone();
        lock(&tracker).recall(&mut reloaded);
        assert_eq!(reloaded.last_broadcast, Some(now));
        assert!(!should_send(&reloaded, local(8, 1, 0), offset()));

        let mut hourly = broadcast(RepeatType::Hourly);
        hourly.id = Some(ObjectId::new());
        for minute in 0..6 {
            let at = local(8, minute, 0);
            let mut loaded = hourly.clone();
            lock(&tracker).recall(&mut loaded);
            if should_send(&loaded, at, offset()) {
                post(outbox.as_ref(), &UnavailableLog, &tracker, &auto_delete, &group, &loaded, at).await;
            }
        }
        assert_eq!(outbox.delivered.lock().unwrap().len(), 2);
        assert!(lock(&tracker).try_begin(hourly.id.unwrap(), local(8, 10, 0)));
    }

    #[test]
    fn test_tick_monitor() {
        let mut monitor = TickMonitor::default();
        assert!(monitor.observe(local(8, 0, 0)).is_none());
        assert!(monitor.observe(local(8, 1, 0)).is_none());
        assert_eq!(
            monitor.observe(local(8, 5, 0)).map(|gap| gap.num_minutes()),
            Some(4)
        );
    }
}
