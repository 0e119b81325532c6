use chrono::Utc;
use teloxide::{
    payloads::SendMessageSetters,
    requests::Requester,
    types::{Message, ParseMode},
    Bot,
};
use tracing::{debug, trace, warn};

use super::{commands, Prompt};
use crate::{
    database::{Group, GroupPermission, Keyword},
    message::Outbox,
    service::{
        auto_delete::{is_exempt, MessageKind},
        stats::{measure, RankingPeriod},
        BotService,
    },
    Error,
};

/// Ranking shown for a command keyword such as `日排行`.
fn keyword_period(keyword: &Keyword) -> Option<RankingPeriod> {
    match keyword.command.as_deref()?.trim() {
        "/tongji" => Some(RankingPeriod::Daily),
        "/tongji30" => Some(RankingPeriod::Monthly),
        _ => None,
    }
}

/// Schedule the deletion of a command sent to an authorised group.
///
/// Always lets the update through.
pub async fn schedule_command_deletion(service: BotService, msg: Message) -> bool {
    if msg.chat.is_private() {
        return true;
    }
    let (Some(user), Some(text)) = (msg.from(), msg.text()) else {
        return true;
    };
    let group = match service.database.groups.get(msg.chat.id.0).await {
        Ok(Some(group)) => group,
        Ok(None) => return true,
        Err(err) => {
            warn!("Could not load group {}: {err}", msg.chat.id.0);
            return true;
        }
    };
    let role = service
        .role_of(user.id.0 as i64)
        .await
        .unwrap_or_default();
    if !is_exempt(&service.auto_delete.config, role, text) {
        service
            .auto_delete
            .schedule_in_group(&group.settings, msg.chat.id, msg.id, MessageKind::Command);
    }
    true
}

pub async fn group_message(bot: Bot, service: BotService, msg: Message) -> Result<(), Error> {
    let Some(group) = service.database.groups.get(msg.chat.id.0).await? else {
        trace!("Ignoring message from unauthorised chat {}", msg.chat.id.0);
        return Ok(());
    };
    let Some(user) = msg.from() else {
        return Ok(());
    };
    if user.is_bot {
        return Ok(());
    }

    if group.has_permission(GroupPermission::Keywords) {
        if let Some(text) = msg.text() {
            if let Err(err) = reply_keyword(&bot, &service, &group, &msg, text).await {
                warn!("Keyword reply in {} failed: {err}", group.group_id);
            }
        }
    }

    if group.has_permission(GroupPermission::Stats) {
        service
            .stats
            .record(&group, user, measure(&msg), Utc::now())
            .await?;
    }
    Ok(())
}

async fn reply_keyword(
    bot: &Bot,
    service: &BotService,
    group: &Group,
    msg: &Message,
    text: &str,
) -> Result<(), Error> {
    let Some(keyword) = service.keywords.match_message(group.group_id, text).await? else {
        return Ok(());
    };
    debug!("`{text}` matched keyword `{}` in {}", keyword.pattern, group.group_id);

    let (sent, kind) = if keyword.is_command {
        let Some(period) = keyword_period(&keyword) else {
            return Ok(());
        };
        let prompt = match commands::ranking(service, group, period, 1).await {
            Ok(prompt) => prompt,
            Err(err) if !err.is_internal() => Prompt::error(&err),
            Err(err) => return Err(err),
        };
        let request = bot
            .send_message(msg.chat.id, prompt.text)
            .parse_mode(ParseMode::Html)
            .reply_to_message_id(msg.id);
        let sent = match prompt.markup {
            Some(markup) => request.reply_markup(markup).await?,
            None => request.await?,
        };
        (sent.id, MessageKind::Ranking)
    } else {
        let reply = keyword.reply().reply_to(msg.id);
        (bot.deliver(msg.chat.id, &reply).await?, MessageKind::Keyword)
    };

    service
        .auto_delete
        .schedule_in_group(&group.settings, msg.chat.id, sent, kind);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MatchType;

    #[test]
    fn test_keyword_period() {
        assert_eq!(
            keyword_period(&Keyword::command(-1, "日排行", "/tongji")),
            Some(RankingPeriod::Daily)
        );
        assert_eq!(
            keyword_period(&Keyword::command(-1, "月排行", "/tongji30")),
            Some(RankingPeriod::Monthly)
        );
        assert_eq!(keyword_period(&Keyword::command(-1, "x", "/help")), None);
        assert_eq!(keyword_period(&Keyword::new(-1, "hi", MatchType::Exact)), None);
    }
}
