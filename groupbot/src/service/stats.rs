use std::collections::HashMap;

use chrono::{DateTime, Duration, FixedOffset, Utc};
use teloxide::{types::Message, utils::html};
use tracing::{debug, info};

use crate::{
    database::{Group, GroupSettings, MessageStat, RankEntry, StatSummary, StatsCollection, UserCollection},
    message::MediaKind,
    utils, Error,
};

/// Size and media type of a message, as counted by statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Measured {
    pub size: u64,
    pub media: Option<MediaKind>,
}

/// Text (or caption) bytes plus the size of an attached file.
pub fn measure(message: &Message) -> Measured {
    let text = message.text().or_else(|| message.caption()).unwrap_or_default();
    let (file_size, media) = if let Some(photos) = message.photo() {
        let size = photos.iter().map(|p| p.file.size).max().unwrap_or_default();
        (size, Some(MediaKind::Photo))
    } else if let Some(video) = message.video() {
        (video.file.size, Some(MediaKind::Video))
    } else if let Some(animation) = message.animation() {
        (animation.file.size, Some(MediaKind::Animation))
    } else if let Some(document) = message.document() {
        (document.file.size, Some(MediaKind::Document))
    } else {
        (0, None)
    };
    Measured {
        size: text.len() as u64 + u64::from(file_size),
        media,
    }
}

pub fn should_count(settings: &GroupSettings, measured: &Measured) -> bool {
    if measured.size < settings.min_bytes {
        return false;
    }
    measured.media.is_none() || settings.count_media
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankingPeriod {
    Daily,
    Monthly,
}

impl RankingPeriod {
    pub fn days(&self) -> i64 {
        match self {
            RankingPeriod::Daily => 1,
            RankingPeriod::Monthly => 30,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            RankingPeriod::Daily => "📊 今日发言排行",
            RankingPeriod::Monthly => "📊 近30天发言排行",
        }
    }

    pub fn page_size(&self, settings: &GroupSettings) -> u32 {
        match self {
            RankingPeriod::Daily => settings.daily_rank_size,
            RankingPeriod::Monthly => settings.monthly_rank_size,
        }
        .max(1)
    }
}

/// One page of a ranking. `first_rank` is the 1-based rank of the first entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankingPage {
    pub entries: Vec<RankEntry>,
    pub first_rank: usize,
    pub page: u32,
    pub total_pages: u32,
}

impl RankingPage {
    pub fn has_previous(&self) -> bool {
        self.page > 1
    }

    pub fn has_next(&self) -> bool {
        self.page < self.total_pages
    }
}

/// Cut `entries` into pages of `size`, clamping `page` into the valid range.
pub fn paginate(entries: Vec<RankEntry>, page: u32, size: u32) -> RankingPage {
    let size = size.max(1) as usize;
    let total_pages = ((entries.len() + size - 1) / size).max(1) as u32;
    let page = page.clamp(1, total_pages);
    let skip = (page as usize - 1) * size;
    RankingPage {
        entries: entries.into_iter().skip(skip).take(size).collect(),
        first_rank: skip + 1,
        page,
        total_pages,
    }
}

/// HTML text of a ranking page. Users without a name get a placeholder.
pub fn render_ranking(
    period: RankingPeriod,
    page: &RankingPage,
    names: &HashMap<i64, String>,
) -> String {
    if page.entries.is_empty() {
        return format!("{}\n\n暂无统计数据", period.title());
    }
    let mut text = format!("{}\n\n", period.title());
    for (index, entry) in page.entries.iter().enumerate() {
        let name = names
            .get(&entry.user_id)
            .cloned()
            .unwrap_or_else(|| format!("用户{}", entry.user_id));
        text.push_str(&format!(
            "{}. <a href=\"tg://user?id={}\">{}</a> - 消息数: {}\n",
            page.first_rank + index,
            entry.user_id,
            html::escape(&name),
            entry.total_messages
        ));
    }
    text.push_str(&format!("\n第 {}/{} 页", page.page, page.total_pages));
    text
}

#[derive(Clone)]
pub struct StatsService {
    pub stats: StatsCollection,
    pub users: UserCollection,
    pub offset: FixedOffset,
}

impl StatsService {
    pub fn new(stats: StatsCollection, users: UserCollection, offset: FixedOffset) -> Self {
        Self {
            stats,
            users,
            offset,
        }
    }

    /// Record a message if the group settings count it. Returns whether it was recorded.
    pub async fn record(
        &self,
        group: &Group,
        user: &teloxide::types::User,
        measured: Measured,
        now: DateTime<Utc>,
    ) -> Result<bool, Error> {
        let user_id = user.id.0 as i64;
        if !should_count(&group.settings, &measured) {
            debug!(
                "Not counting message of {user_id} in {}: {measured:?}",
                group.group_id
            );
            return Ok(false);
        }
        self.stats
            .insert(&MessageStat {
                group_id: group.group_id,
                user_id,
                date: utils::date_key(now, self.offset),
                total_messages: 1,
                total_size: measured.size as i64,
                media_type: measured.media,
                created_at: now,
            })
            .await?;
        self.users.count_message(user).await?;
        Ok(true)
    }

    pub async fn ranking(
        &self,
        group: &Group,
        period: RankingPeriod,
        page: u32,
        now: DateTime<Utc>,
    ) -> Result<RankingPage, Error> {
        let (start, end) = utils::date_range_keys(now, self.offset, period.days());
        let entries = self.stats.ranking(group.group_id, &start, &end).await?;
        Ok(paginate(entries, page, period.page_size(&group.settings)))
    }

    /// Display names of the users on a page, from stored profiles.
    pub async fn names(&self, page: &RankingPage) -> Result<HashMap<i64, String>, Error> {
        let mut names = HashMap::new();
        for entry in &page.entries {
            if let Some(user) = self.users.get(entry.user_id).await? {
                names.insert(entry.user_id, user.display_name());
            }
        }
        Ok(names)
    }

    pub async fn user_summary(
        &self,
        group_id: i64,
        user_id: i64,
        days: i64,
        now: DateTime<Utc>,
    ) -> Result<StatSummary, Error> {
        let (start, end) = utils::date_range_keys(now, self.offset, days);
        self.stats.user_summary(group_id, user_id, &start, &end).await
    }

    pub async fn group_summary(
        &self,
        group_id: i64,
        days: i64,
        now: DateTime<Utc>,
    ) -> Result<StatSummary, Error> {
        let (start, end) = utils::date_range_keys(now, self.offset, days);
        self.stats.group_summary(group_id, &start, &end).await
    }

    /// Remove statistics older than `days` days.
    pub async fn cleanup(&self, days: i64, now: DateTime<Utc>) -> Result<u64, Error> {
        let cutoff = utils::date_key(now - Duration::days(days), self.offset);
        let deleted = self.stats.delete_before(&cutoff).await?;
        info!("Removed {deleted} statistic records before {cutoff}");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(n: i64) -> Vec<RankEntry> {
        (0..n)
            .map(|i| RankEntry {
                user_id: i,
                total_messages: 100 - i,
                total_size: 0,
            })
            .collect()
    }

    #[test]
    fn test_should_count() {
        let mut settings = GroupSettings::default();
        let text = Measured { size: 3, media: None };
        let photo = Measured {
            size: 2000,
            media: Some(MediaKind::Photo),
        };
        assert!(should_count(&settings, &text));
        assert!(!should_count(&settings, &photo));

        settings.count_media = true;
        settings.min_bytes = 5;
        assert!(!should_count(&settings, &text));
        assert!(should_count(&settings, &photo));
    }

    #[test]
    fn test_paginate() {
        let page = paginate(entries(32), 2, 15);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.page, 2);
        assert_eq!(page.first_rank, 16);
        assert_eq!(page.entries.len(), 15);
        assert_eq!(page.entries[0].user_id, 15);
        assert!(page.has_previous() && page.has_next());

        let page = paginate(entries(32), 9, 15);
        assert_eq!(page.page, 3);
        assert_eq!(page.entries.len(), 2);
        assert!(!page.has_next());

        let page = paginate(Vec::new(), 0, 15);
        assert_eq!((page.page, page.total_pages), (1, 1));
        assert!(page.entries.is_empty());
    }

    #[test]
    fn test_render_ranking() {
        let page = paginate(entries(3), 1, 2);
        let names: HashMap<i64, String> = [(0, "<Alice>".to_string())].into_iter().collect();
        let text = render_ranking(RankingPeriod::Daily, &page, &names);
        assert!(text.starts_with("📊 今日发言排行"));
        assert!(text.contains("1. <a href=\"tg://user?id=0\">&lt;Alice&gt;</a> - 消息数: 100"));
        assert!(text.contains("2. <a href=\"tg://user?id=1\">用户1</a> - 消息数: 99"));
        assert!(text.ends_with("第 1/2 页"));

        let empty = render_ranking(RankingPeriod::Monthly, &paginate(Vec::new(), 1, 15), &names);
        assert_eq!(empty, "📊 近30天发言排行\n\n暂无统计数据");
    }
}
