//! Texts and inline keyboards of the settings menu.

use chrono::{DateTime, FixedOffset, Utc};
use teloxide::{
    types::{InlineKeyboardButton, InlineKeyboardMarkup},
    utils::html,
};

use super::action::{CallbackAction, FormAction, SettingField, AUTO_DELETE_PRESETS};
use crate::{
    config::AutoDeleteConfig,
    database::{Broadcast, Group, GroupPermission, Keyword, MatchType, RepeatType, StatSummary},
    service::{
        auto_delete::{resolve_timeout, MessageKind},
        broadcast::{next_send_time, status, BroadcastDraft},
        stats::{RankingPage, RankingPeriod},
    },
    utils,
};

/// Keywords listed per page.
pub const KEYWORDS_PER_PAGE: usize = 10;

type Menu = (String, InlineKeyboardMarkup);

fn button(text: impl Into<String>, action: CallbackAction) -> InlineKeyboardButton {
    InlineKeyboardButton::callback(text, action.to_string())
}

fn back(action: CallbackAction) -> Vec<InlineKeyboardButton> {
    vec![button("🔙 返回", action)]
}

fn on_off(on: bool) -> &'static str {
    if on {
        "✅ 开启"
    } else {
        "❌ 关闭"
    }
}

/// One button per group, each producing `action(group_id)`.
pub fn group_choice<F>(groups: &[Group], action: F) -> InlineKeyboardMarkup
where
    F: Fn(i64) -> CallbackAction,
{
    InlineKeyboardMarkup::new(
        groups
            .iter()
            .map(|group| vec![button(group.title(), action(group.group_id))]),
    )
}

pub fn group_menu(group: &Group, config: &AutoDeleteConfig) -> Menu {
    let g = group.group_id;
    let mut rows = Vec::new();
    if group.permissions.contains(&GroupPermission::Stats) {
        rows.push(vec![button("📊 统计设置", CallbackAction::Stats(g))]);
    }
    if group.permissions.contains(&GroupPermission::Broadcast) {
        rows.push(vec![button("📢 轮播消息", CallbackAction::BroadcastList(g))]);
    }
    if group.permissions.contains(&GroupPermission::Keywords) {
        rows.push(vec![button("🔑 关键词设置", CallbackAction::KeywordList(g, 1))]);
    }
    rows.push(vec![button("⚙️ 开关设置", CallbackAction::Features(g))]);
    rows.push(vec![button(
        format!("🗑️ 自动删除: {}", on_off(group.settings.auto_delete && config.enabled)),
        CallbackAction::AutoDelete(g),
    )]);
    rows.push(vec![button("🔙 返回群组列表", CallbackAction::Groups)]);

    let text = format!(
        "⚙️ {} 的设置\nID: <code>{g}</code>\n\n请选择要管理的功能：",
        html::escape(&group.title())
    );
    (text, InlineKeyboardMarkup::new(rows))
}

pub fn keyword_list(group: &Group, keywords: &[Keyword], page: u32) -> Menu {
    let g = group.group_id;
    let total_pages = ((keywords.len() + KEYWORDS_PER_PAGE - 1) / KEYWORDS_PER_PAGE).max(1) as u32;
    let page = page.clamp(1, total_pages);

    let mut rows: Vec<Vec<InlineKeyboardButton>> = keywords
        .iter()
        .skip((page as usize - 1) * KEYWORDS_PER_PAGE)
        .take(KEYWORDS_PER_PAGE)
        .filter_map(|keyword| {
            let id = keyword.id?;
            Some(vec![button(
                format!("🔑 {}", utils::truncate(&keyword.pattern, 20)),
                CallbackAction::KeywordDetail(g, id),
            )])
        })
        .collect();

    let mut pager = Vec::new();
    if page > 1 {
        pager.push(button("◀️ 上一页", CallbackAction::KeywordList(g, page - 1)));
    }
    if page < total_pages {
        pager.push(button("下一页 ▶️", CallbackAction::KeywordList(g, page + 1)));
    }
    if !pager.is_empty() {
        rows.push(pager);
    }
    rows.push(vec![button("➕ 添加关键词", CallbackAction::KeywordAdd(g))]);
    rows.push(back(CallbackAction::Group(g)));

    let mut text = format!("🔑 {} 的关键词（{} 个）", html::escape(&group.title()), keywords.len());
    if total_pages > 1 {
        text.push_str(&format!("\n第 {page}/{total_pages} 页"));
    }
    (text, InlineKeyboardMarkup::new(rows))
}

pub fn keyword_detail(keyword: &Keyword) -> Menu {
    let g = keyword.group_id;
    let mut text = format!(
        "🔑 关键词: <code>{}</code>\n匹配方式: {}\n",
        html::escape(&keyword.pattern),
        keyword.match_type
    );
    if let Some(command) = &keyword.command {
        text.push_str(&format!("执行命令: {}\n", html::escape(command)));
    } else if let Some(response) = &keyword.response {
        text.push_str(&format!("回复内容: {}\n", html::escape(&utils::truncate(response, 100))));
    }
    if let Some(media) = &keyword.media {
        text.push_str(&format!("媒体: {}\n", media.kind.label()));
    }
    if !keyword.buttons.is_empty() {
        text.push_str(&format!("按钮: {} 个\n", keyword.buttons.len()));
    }

    let mut rows = Vec::new();
    if let Some(id) = keyword.id {
        let mut row = Vec::new();
        if !keyword.is_command {
            row.push(button("✏️ 编辑", CallbackAction::KeywordEdit(g, id)));
        }
        row.push(button("❌ 删除", CallbackAction::KeywordDelete(g, id)));
        rows.push(row);
    }
    rows.push(back(CallbackAction::KeywordList(g, 1)));
    (text, InlineKeyboardMarkup::new(rows))
}

fn broadcast_preview(broadcast: &Broadcast) -> String {
    match (&broadcast.text, &broadcast.media) {
        (Some(text), _) if !text.trim().is_empty() => utils::truncate(text.trim(), 20),
        (_, Some(media)) => format!("[{}]", media.kind.label()),
        _ => "[按钮]".to_string(),
    }
}

pub fn broadcast_list(group: &Group, broadcasts: &[Broadcast], now: DateTime<Utc>) -> Menu {
    let g = group.group_id;
    let mut rows: Vec<Vec<InlineKeyboardButton>> = broadcasts
        .iter()
        .filter_map(|broadcast| {
            let id = broadcast.id?;
            Some(vec![button(
                format!("📢 {} ({})", broadcast_preview(broadcast), status(broadcast, now)),
                CallbackAction::BroadcastDetail(g, id),
            )])
        })
        .collect();
    rows.push(vec![button("➕ 添加轮播消息", CallbackAction::BroadcastAdd(g))]);
    rows.push(back(CallbackAction::Group(g)));

    let text = format!(
        "📢 {} 的轮播消息（{} 条）",
        html::escape(&group.title()),
        broadcasts.len()
    );
    (text, InlineKeyboardMarkup::new(rows))
}

fn repeat_summary(repeat_type: RepeatType, interval: i64) -> String {
    match repeat_type {
        RepeatType::Custom => format!("每 {} 重复", utils::format_duration(interval.max(0) as u64 * 60)),
        other => other.to_string(),
    }
}

pub fn broadcast_detail(broadcast: &Broadcast, now: DateTime<Utc>, offset: FixedOffset) -> Menu {
    let g = broadcast.group_id;
    let mut text = format!(
        "📢 轮播消息\n状态: {}\n重复: {}\n开始: {}\n",
        status(broadcast, now),
        repeat_summary(broadcast.repeat_type, broadcast.interval),
        utils::format_local(broadcast.start_time, offset),
    );
    if broadcast.repeat_type != RepeatType::Once {
        text.push_str(&format!("结束: {}\n", utils::format_local(broadcast.end_time, offset)));
    }
    if let Some(clock) = broadcast.schedule_time.as_deref().filter(|_| broadcast.use_fixed_time) {
        text.push_str(&format!("固定时间: {clock}\n"));
    }
    if let Some(last) = broadcast.last_broadcast {
        text.push_str(&format!("上次发送: {}\n", utils::format_local(last, offset)));
    }
    if let Some(next) = next_send_time(broadcast, now, offset) {
        text.push_str(&format!("下次发送: {}\n", utils::format_local(next, offset)));
    }
    if let Some(body) = &broadcast.text {
        text.push_str(&format!("\n{}", html::escape(&utils::truncate(body, 200))));
    }

    let mut rows = Vec::new();
    if let Some(id) = broadcast.id {
        rows.push(vec![
            button("✏️ 编辑", CallbackAction::BroadcastEdit(g, id)),
            button("❌ 删除", CallbackAction::BroadcastDelete(g, id)),
        ]);
    }
    rows.push(back(CallbackAction::BroadcastList(g)));
    (text, InlineKeyboardMarkup::new(rows))
}

pub fn stats_settings(group: &Group) -> Menu {
    let g = group.group_id;
    let settings = &group.settings;
    let rows = vec![
        vec![button(
            format!("最小统计字节数: {} 字节", settings.min_bytes),
            CallbackAction::Edit(g, SettingField::MinBytes),
        )],
        vec![button(
            format!("统计多媒体: {}", on_off(settings.count_media)),
            CallbackAction::ToggleCountMedia(g),
        )],
        vec![button(
            format!("日排行显示数量: {}", settings.daily_rank_size),
            CallbackAction::Edit(g, SettingField::DailyRankSize),
        )],
        vec![button(
            format!("月排行显示数量: {}", settings.monthly_rank_size),
            CallbackAction::Edit(g, SettingField::MonthlyRankSize),
        )],
        back(CallbackAction::Group(g)),
    ];
    (
        format!("📊 {} 的统计设置", html::escape(&group.title())),
        InlineKeyboardMarkup::new(rows),
    )
}

/// Totals of a statistic summary, e.g. for the last 30 days.
pub fn summary_text(period: &str, summary: &StatSummary) -> String {
    if summary.total_messages == 0 {
        return format!("{period}: 暂无统计数据");
    }
    format!(
        "{period}: {} 条消息，{} 位用户，活跃 {} 天，日均 {:.2} 条",
        summary.total_messages, summary.unique_users, summary.days_active, summary.avg_per_day
    )
}

pub fn feature_switches(group: &Group) -> Menu {
    let g = group.group_id;
    let mut rows: Vec<Vec<InlineKeyboardButton>> = GroupPermission::ALL
        .into_iter()
        .filter(|permission| group.permissions.contains(permission))
        .map(|permission| {
            vec![button(
                format!("{}: {}", permission, on_off(group.switch_on(permission))),
                CallbackAction::ToggleFeature(g, permission),
            )]
        })
        .collect();
    rows.push(back(CallbackAction::Group(g)));
    (
        format!("⚙️ {} 的功能开关", html::escape(&group.title())),
        InlineKeyboardMarkup::new(rows),
    )
}

pub fn auto_delete(group: &Group, config: &AutoDeleteConfig) -> Menu {
    let g = group.group_id;
    let settings = &group.settings;

    let mut text = format!(
        "🗑️ {} 的自动删除\n状态: {}\n默认超时: {}\n",
        html::escape(&group.title()),
        on_off(settings.auto_delete),
        utils::format_duration(settings.auto_delete_timeout)
    );
    if !config.enabled {
        text.push_str("⚠️ 自动删除已在全局配置中关闭\n");
    }
    text.push_str("\n各类消息超时:\n");
    for kind in MessageKind::ALL {
        text.push_str(&format!(
            "• {}: {}\n",
            kind_label(kind),
            utils::format_duration(resolve_timeout(config, settings, kind))
        ));
    }

    let mut rows = vec![vec![button(
        if settings.auto_delete { "关闭自动删除" } else { "开启自动删除" },
        CallbackAction::ToggleAutoDelete(g),
    )]];
    rows.extend(AUTO_DELETE_PRESETS.chunks(3).map(|chunk| {
        chunk
            .iter()
            .map(|&secs| {
                let marker = if settings.auto_delete_timeout == secs { "✓ " } else { "" };
                button(
                    format!("{marker}{}", utils::format_duration(secs)),
                    CallbackAction::AutoDeletePreset(g, secs),
                )
            })
            .collect()
    }));
    rows.push(vec![button(
        "⌨️ 自定义时间",
        CallbackAction::Edit(g, SettingField::AutoDeleteTimeout),
    )]);
    rows.push(back(CallbackAction::Group(g)));
    (text, InlineKeyboardMarkup::new(rows))
}

fn kind_label(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Keyword => "关键词回复",
        MessageKind::Broadcast => "轮播消息",
        MessageKind::Ranking => "排行榜",
        MessageKind::Command => "命令",
        MessageKind::Default => "其他",
    }
}

/// Previous and next buttons under a ranking, if there is more than one page.
pub fn ranking_keyboard(
    group_id: i64,
    period: RankingPeriod,
    page: &RankingPage,
) -> Option<InlineKeyboardMarkup> {
    let mut row = Vec::new();
    if page.has_previous() {
        row.push(button(
            "◀️ 上一页",
            CallbackAction::Ranking(group_id, period, page.page - 1),
        ));
    }
    if page.has_next() {
        row.push(button(
            "下一页 ▶️",
            CallbackAction::Ranking(group_id, period, page.page + 1),
        ));
    }
    (!row.is_empty()).then(|| InlineKeyboardMarkup::new(vec![row]))
}

fn form_button(text: impl Into<String>, action: FormAction) -> InlineKeyboardButton {
    button(text, CallbackAction::Form(action))
}

pub fn cancel_button() -> InlineKeyboardButton {
    form_button("❌ 取消", FormAction::Cancel)
}

pub fn cancel_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![cancel_button()]])
}

pub fn match_type_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![
            form_button("精确匹配", FormAction::MatchType(MatchType::Exact)),
            form_button("正则匹配", FormAction::MatchType(MatchType::Regex)),
        ],
        vec![cancel_button()],
    ])
}

pub fn keyword_review(keyword: &Keyword) -> Menu {
    let title = if keyword.id.is_some() { "编辑关键词" } else { "关键词预览" };
    let mut text = format!(
        "📝 {title}\n\n关键词: <code>{}</code>\n匹配方式: {}\n",
        html::escape(&keyword.pattern),
        keyword.match_type
    );
    match &keyword.response {
        Some(response) if !response.is_empty() => {
            text.push_str(&format!("回复内容: {}\n", html::escape(&utils::truncate(response, 100))))
        }
        _ => text.push_str("回复内容: 无\n"),
    }
    if let Some(media) = &keyword.media {
        text.push_str(&format!("媒体: {}\n", media.kind.label()));
    }
    text.push_str(&format!("按钮: {} 个", keyword.buttons.len()));

    let keyboard = InlineKeyboardMarkup::new(vec![
        vec![
            form_button("✏️ 修改关键词", FormAction::Pattern),
            form_button("📝 修改回复", FormAction::Content),
        ],
        vec![form_button("🔘 添加/修改按钮", FormAction::Buttons)],
        vec![
            form_button("👁️ 预览效果", FormAction::Preview),
            form_button("✅ 提交", FormAction::Submit),
        ],
        vec![cancel_button()],
    ]);
    (text, keyboard)
}

pub fn broadcast_review(draft: &BroadcastDraft, editing: bool, offset: FixedOffset) -> Menu {
    let repeat_type = draft.repeat_type.unwrap_or_default();
    let mut text = format!(
        "📝 {}\n\n",
        if editing { "编辑轮播消息" } else { "轮播消息预览" }
    );
    match &draft.text {
        Some(body) if !body.is_empty() => {
            text.push_str(&format!("文本: {}\n", html::escape(&utils::truncate(body, 100))))
        }
        _ => text.push_str("文本: 无\n"),
    }
    if let Some(media) = &draft.media {
        text.push_str(&format!("媒体: {}\n", media.kind.label()));
    }
    text.push_str(&format!("按钮: {} 个\n", draft.buttons.len()));
    text.push_str(&format!(
        "重复: {}\n",
        repeat_summary(
            repeat_type,
            draft.interval.unwrap_or_else(|| repeat_type.default_interval())
        )
    ));
    text.push_str(&format!(
        "开始: {}\n",
        draft
            .start_time
            .map_or_else(|| "立即".to_string(), |t| utils::format_local(t, offset))
    ));
    if repeat_type != RepeatType::Once {
        text.push_str(&format!(
            "结束: {}\n固定时间发送: {}\n",
            draft
                .end_time
                .map_or_else(|| "开始后30天".to_string(), |t| utils::format_local(t, offset)),
            on_off(draft.use_fixed_time)
        ));
    }

    let repeat_row = RepeatType::ALL
        .into_iter()
        .map(|r| {
            let marker = if r == repeat_type { "✓ " } else { "" };
            form_button(format!("{marker}{r}"), FormAction::Repeat(r))
        })
        .collect();

    let mut rows = vec![
        vec![
            form_button("📝 修改内容", FormAction::Content),
            form_button("🔘 添加/修改按钮", FormAction::Buttons),
        ],
        repeat_row,
    ];
    if repeat_type == RepeatType::Custom {
        rows.push(vec![form_button("⏱️ 设置间隔", FormAction::Interval)]);
    }
    let mut times = vec![form_button("⏰ 开始时间", FormAction::StartTime)];
    if repeat_type != RepeatType::Once {
        times.push(form_button("🏁 结束时间", FormAction::EndTime));
    }
    rows.push(times);
    if repeat_type != RepeatType::Once {
        rows.push(vec![form_button(
            format!("固定时间发送: {}", on_off(draft.use_fixed_time)),
            FormAction::ToggleFixedTime,
        )]);
    }
    rows.push(vec![
        form_button("👁️ 预览效果", FormAction::Preview),
        form_button("✅ 提交", FormAction::Submit),
    ]);
    rows.push(vec![cancel_button()]);
    (text, InlineKeyboardMarkup::new(rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::oid::ObjectId;
    use teloxide::types::InlineKeyboardButtonKind;

    fn callbacks(markup: &InlineKeyboardMarkup) -> Vec<String> {
        markup
            .inline_keyboard
            .iter()
            .flatten()
            .filter_map(|button| match &button.kind {
                InlineKeyboardButtonKind::CallbackData(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_group_menu_follows_permissions() {
        let mut group = Group::new(-100, "测试群");
        group.permissions = vec![GroupPermission::Stats];
        let (text, markup) = group_menu(&group, &AutoDeleteConfig::default());
        assert!(text.contains("测试群"));
        let data = callbacks(&markup);
        assert!(data.contains(&"ss:-100".to_string()));
        assert!(!data.contains(&"bl:-100".to_string()));
        assert!(!data.iter().any(|d| d.starts_with("kl:")));
        assert_eq!(data.last().map(String::as_str), Some("gs"));
    }

    #[test]
    fn test_keyword_list_pages() {
        let group = Group::new(-100, "g");
        let keywords: Vec<Keyword> = (0..23)
            .map(|i| Keyword {
                id: Some(ObjectId::new()),
                ..Keyword::new(-100, format!("k{i}"), MatchType::Exact)
            })
            .collect();

        let (text, markup) = keyword_list(&group, &keywords, 3);
        assert!(text.contains("第 3/3 页"));
        let data = callbacks(&markup);
        assert_eq!(data.iter().filter(|d| d.starts_with("kd:")).count(), 3);
        assert!(data.contains(&"kl:-100:2".to_string()));
        assert!(!data.contains(&"kl:-100:4".to_string()));
    }

    #[test]
    fn test_summary_text() {
        assert_eq!(summary_text("近30天", &StatSummary::default()), "近30天: 暂无统计数据");
        let summary = StatSummary {
            total_messages: 10,
            total_size: 300,
            days_active: 3,
            unique_users: 2,
            avg_per_day: 3.33,
        };
        assert_eq!(
            summary_text("近30天", &summary),
            "近30天: 10 条消息，2 位用户，活跃 3 天，日均 3.33 条"
        );
    }

    #[test]
    fn test_ranking_keyboard() {
        let page = RankingPage {
            entries: Vec::new(),
            first_rank: 1,
            page: 1,
            total_pages: 1,
        };
        assert!(ranking_keyboard(-100, RankingPeriod::Daily, &page).is_none());

        let page = RankingPage { page: 2, total_pages: 3, ..page };
        let markup = ranking_keyboard(-100, RankingPeriod::Daily, &page).unwrap();
        assert_eq!(callbacks(&markup), vec!["rk:-100:d:1", "rk:-100:d:3"]);
    }

    #[test]
    fn test_broadcast_review_buttons_follow_repeat() {
        let offset = utils::offset_from_hours(8);
        let mut draft = BroadcastDraft::new(-100);
        let (text, markup) = broadcast_review(&draft, false, offset);
        assert!(text.starts_with("📝 轮播消息预览"));
        let data = callbacks(&markup);
        assert!(data.contains(&"f:ct".to_string()));
        assert!(!data.contains(&"f:iv".to_string()));
        assert!(!data.contains(&"f:et".to_string()));

        draft.repeat_type = Some(RepeatType::Custom);
        let (text, markup) = broadcast_review(&draft, true, offset);
        assert!(text.starts_with("📝 编辑轮播消息"));
        assert!(text.contains("每 30分钟 重复"));
        let data = callbacks(&markup);
        assert!(data.contains(&"f:iv".to_string()));
        assert!(data.contains(&"f:fx".to_string()));
    }

    #[test]
    fn test_edit_buttons() {
        let id = ObjectId::new();
        let mut keyword = Keyword {
            id: Some(id),
            response: Some("hi".to_string()),
            ..Keyword::new(-100, "hello", MatchType::Exact)
        };
        let (_, markup) = keyword_detail(&keyword);
        assert_eq!(
            callbacks(&markup)[..2],
            [format!("ke:-100:{}", id.to_hex()), format!("kx:-100:{}", id.to_hex())]
        );
        let (text, markup) = keyword_review(&keyword);
        assert!(text.starts_with("📝 编辑关键词"));
        assert_eq!(callbacks(&markup)[..2], ["f:pt", "f:ct"]);

        keyword.is_command = true;
        let (_, markup) = keyword_detail(&keyword);
        assert!(!callbacks(&markup).iter().any(|d| d.starts_with("ke:")));

        let now = Utc::now();
        let broadcast = BroadcastDraft {
            text: Some("hello".to_string()),
            ..BroadcastDraft::new(-100)
        }
        .normalize(&Default::default(), now, utils::offset_from_hours(8))
        .unwrap();
        let broadcast = Broadcast {
            id: Some(id),
            ..broadcast
        };
        let (_, markup) = broadcast_detail(&broadcast, now, utils::offset_from_hours(8));
        assert!(callbacks(&markup).contains(&format!("be:-100:{}", id.to_hex())));
    }
}
