use chrono::Utc;
use teloxide::{
    payloads::{AnswerCallbackQuerySetters, EditMessageTextSetters},
    requests::Requester,
    types::{CallbackQuery, ChatId, InlineKeyboardMarkup, ParseMode},
    ApiError, Bot, RequestError,
};
use tracing::{debug, error};

use super::{action::CallbackAction, commands, form, menu, BotDialogue};
use crate::{
    database::{Group, GroupPermission},
    service::{auto_delete::validate_timeout, BotService},
    utils, Error,
};

/// Replace the menu message the button belongs to.
async fn edit(
    bot: &Bot,
    q: &CallbackQuery,
    text: String,
    markup: Option<InlineKeyboardMarkup>,
) -> Result<(), Error> {
    let Some(message) = &q.message else {
        return Ok(());
    };
    let request = bot
        .edit_message_text(message.chat.id, message.id, text)
        .parse_mode(ParseMode::Html)
        .disable_web_page_preview(true);
    let result = match markup {
        Some(markup) => request.reply_markup(markup).await,
        None => request.await,
    };
    match result {
        Ok(_) | Err(RequestError::Api(ApiError::MessageNotModified)) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn show(
    bot: &Bot,
    q: &CallbackQuery,
    (text, markup): (String, InlineKeyboardMarkup),
) -> Result<(), Error> {
    edit(bot, q, text, Some(markup)).await
}

/// Ranking buttons only turn pages in the chat they were posted to.
fn ranking_chat(chat_id: Option<ChatId>, group_id: i64) -> Result<(), Error> {
    match chat_id {
        Some(chat_id) if chat_id.0 == group_id => Ok(()),
        _ => Err(Error::PermissionDenied),
    }
}

fn require(group: &Group, permission: GroupPermission) -> Result<(), Error> {
    if group.permissions.contains(&permission) {
        Ok(())
    } else {
        Err(Error::PermissionDenied)
    }
}

pub async fn handle_callback(
    bot: Bot,
    dialogue: BotDialogue,
    service: BotService,
    q: CallbackQuery,
) -> Result<(), Error> {
    let result = match q.data.as_deref().unwrap_or_default().parse::<CallbackAction>() {
        Ok(action) => {
            debug!("Callback {action:?} from {}", q.from.id.0);
            run(&bot, &dialogue, &service, &q, action).await
        }
        Err(err) => Err(err),
    };

    let answer = bot.answer_callback_query(q.id.clone());
    match result {
        Ok(Some(notice)) => answer.text(notice).await?,
        Ok(None) => answer.await?,
        Err(err) => {
            if err.is_internal() {
                error!("Callback from {} failed: {err:?}", q.from.id.0);
            }
            answer.text(err.user_message()).show_alert(true).await?
        }
    };
    Ok(())
}

/// Perform `action`, returning a short notice for the button press.
async fn run(
    bot: &Bot,
    dialogue: &BotDialogue,
    service: &BotService,
    q: &CallbackQuery,
    action: CallbackAction,
) -> Result<Option<String>, Error> {
    let user_id = q.from.id.0 as i64;
    let chat_id = q.message.as_ref().map(|message| message.chat.id);

    // Ranking pages live in groups and may be turned by anyone there.
    if let CallbackAction::Ranking(group_id, period, page) = action {
        ranking_chat(chat_id, group_id)?;
        let group = service
            .database
            .groups
            .get(group_id)
            .await?
            .ok_or(Error::UnknownGroup(group_id))?;
        let prompt = commands::ranking(service, &group, period, page).await?;
        edit(bot, q, prompt.text, prompt.markup).await?;
        return Ok(None);
    }

    let Some(chat_id) = chat_id.filter(|chat| chat.0 == user_id) else {
        return Err(Error::InvalidInput("请在私聊中使用设置菜单".to_string()));
    };
    let config = &service.config;
    let now = Utc::now();

    let group_id = match action {
        CallbackAction::Groups => {
            service.require_admin(user_id).await?;
            let groups = service.database.manageable_groups(user_id).await?;
            edit(
                bot,
                q,
                "请选择要管理的群组：".to_string(),
                Some(menu::group_choice(&groups, CallbackAction::Group)),
            )
            .await?;
            return Ok(None);
        }
        CallbackAction::Form(action) => {
            form::handle_action(bot, dialogue, service, user_id, chat_id, action).await?;
            return Ok(None);
        }
        CallbackAction::Group(g)
        | CallbackAction::KeywordList(g, _)
        | CallbackAction::KeywordDetail(g, _)
        | CallbackAction::KeywordDelete(g, _)
        | CallbackAction::KeywordEdit(g, _)
        | CallbackAction::KeywordAdd(g)
        | CallbackAction::BroadcastList(g)
        | CallbackAction::BroadcastDetail(g, _)
        | CallbackAction::BroadcastDelete(g, _)
        | CallbackAction::BroadcastEdit(g, _)
        | CallbackAction::BroadcastAdd(g)
        | CallbackAction::Stats(g)
        | CallbackAction::ToggleCountMedia(g)
        | CallbackAction::Edit(g, _)
        | CallbackAction::Features(g)
        | CallbackAction::ToggleFeature(g, _)
        | CallbackAction::AutoDelete(g)
        | CallbackAction::ToggleAutoDelete(g)
        | CallbackAction::AutoDeletePreset(g, _)
        | CallbackAction::Ranking(g, _, _) => g,
    };
    let mut group = service.managed_group(user_id, group_id).await?;

    let notice = match action {
        CallbackAction::Group(_) => {
            show(bot, q, menu::group_menu(&group, &config.auto_delete)).await?;
            None
        }
        CallbackAction::KeywordList(_, page) => {
            require(&group, GroupPermission::Keywords)?;
            let keywords = service.keywords.list(group_id).await?;
            show(bot, q, menu::keyword_list(&group, &keywords, page)).await?;
            None
        }
        CallbackAction::KeywordDetail(_, id) => {
            require(&group, GroupPermission::Keywords)?;
            let keyword = service
                .keywords
                .keywords
                .find(group_id, &id.to_hex())
                .await?
                .ok_or(Error::NotFound("关键词"))?;
            show(bot, q, menu::keyword_detail(&keyword)).await?;
            None
        }
        CallbackAction::KeywordDelete(_, id) => {
            require(&group, GroupPermission::Keywords)?;
            if !service.keywords.remove(group_id, id).await? {
                return Err(Error::NotFound("关键词"));
            }
            let keywords = service.keywords.list(group_id).await?;
            show(bot, q, menu::keyword_list(&group, &keywords, 1)).await?;
            Some("✅ 关键词已删除".to_string())
        }
        CallbackAction::KeywordEdit(_, id) => {
            require(&group, GroupPermission::Keywords)?;
            let keyword = service
                .keywords
                .keywords
                .find(group_id, &id.to_hex())
                .await?
                .ok_or(Error::NotFound("关键词"))?;
            form::edit_keyword(bot, dialogue, service, keyword).await?;
            None
        }
        CallbackAction::KeywordAdd(_) => {
            form::start_keyword(bot, dialogue, service, user_id, Some(group_id)).await?;
            None
        }
        CallbackAction::BroadcastList(_) => {
            require(&group, GroupPermission::Broadcast)?;
            let broadcasts = service.broadcasts.list(group_id).await?;
            show(bot, q, menu::broadcast_list(&group, &broadcasts, now)).await?;
            None
        }
        CallbackAction::BroadcastDetail(_, id) => {
            require(&group, GroupPermission::Broadcast)?;
            let broadcast = service
                .broadcasts
                .broadcasts
                .get(id)
                .await?
                .filter(|broadcast| broadcast.group_id == group_id)
                .ok_or(Error::NotFound("轮播消息"))?;
            show(bot, q, menu::broadcast_detail(&broadcast, now, service.offset())).await?;
            None
        }
        CallbackAction::BroadcastDelete(_, id) => {
            require(&group, GroupPermission::Broadcast)?;
            if !service.broadcasts.remove(group_id, id).await? {
                return Err(Error::NotFound("轮播消息"));
            }
            let broadcasts = service.broadcasts.list(group_id).await?;
            show(bot, q, menu::broadcast_list(&group, &broadcasts, now)).await?;
            Some("✅ 轮播消息已删除".to_string())
        }
        CallbackAction::BroadcastEdit(_, id) => {
            require(&group, GroupPermission::Broadcast)?;
            let broadcast = service
                .broadcasts
                .broadcasts
                .get(id)
                .await?
                .filter(|broadcast| broadcast.group_id == group_id)
                .ok_or(Error::NotFound("轮播消息"))?;
            form::edit_broadcast(bot, dialogue, service, &broadcast).await?;
            None
        }
        CallbackAction::BroadcastAdd(_) => {
            form::start_broadcast(bot, dialogue, service, user_id, Some(group_id)).await?;
            None
        }
        CallbackAction::Stats(_) => {
            require(&group, GroupPermission::Stats)?;
            let summary = service.stats.group_summary(group_id, 30, now).await?;
            let (text, markup) = menu::stats_settings(&group);
            let text = format!("{text}\n\n{}", menu::summary_text("近30天", &summary));
            show(bot, q, (text, markup)).await?;
            None
        }
        CallbackAction::ToggleCountMedia(_) => {
            require(&group, GroupPermission::Stats)?;
            group.settings.count_media = !group.settings.count_media;
            service
                .database
                .groups
                .update_settings(group_id, &group.settings)
                .await?;
            show(bot, q, menu::stats_settings(&group)).await?;
            None
        }
        CallbackAction::Edit(_, field) => {
            form::start_setting(bot, dialogue, service, group_id, field).await?;
            None
        }
        CallbackAction::Features(_) => {
            show(bot, q, menu::feature_switches(&group)).await?;
            None
        }
        CallbackAction::ToggleFeature(_, permission) => {
            require(&group, permission)?;
            let on = !group.switch_on(permission);
            service
                .database
                .groups
                .set_feature_switch(group_id, permission, on)
                .await?;
            group
                .feature_switches
                .insert(permission.as_str().to_string(), on);
            show(bot, q, menu::feature_switches(&group)).await?;
            Some(format!("{permission}已{}", if on { "开启" } else { "关闭" }))
        }
        CallbackAction::AutoDelete(_) => {
            show(bot, q, menu::auto_delete(&group, &config.auto_delete)).await?;
            None
        }
        CallbackAction::ToggleAutoDelete(_) => {
            group.settings.auto_delete = !group.settings.auto_delete;
            service
                .database
                .groups
                .update_settings(group_id, &group.settings)
                .await?;
            show(bot, q, menu::auto_delete(&group, &config.auto_delete)).await?;
            None
        }
        CallbackAction::AutoDeletePreset(_, secs) => {
            let timeout = validate_timeout(&config.auto_delete, secs);
            group.settings.auto_delete_timeout = timeout;
            service
                .database
                .groups
                .update_settings(group_id, &group.settings)
                .await?;
            show(bot, q, menu::auto_delete(&group, &config.auto_delete)).await?;
            Some(format!(
                "✅ 自动删除超时时间已设置为 {}",
                utils::format_duration(timeout)
            ))
        }
        CallbackAction::Groups | CallbackAction::Form(_) | CallbackAction::Ranking(..) => None,
    };
    Ok(notice)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranking_chat() {
        assert!(ranking_chat(Some(ChatId(-100)), -100).is_ok());
        assert!(matches!(
            ranking_chat(Some(ChatId(-200)), -100),
            Err(Error::PermissionDenied)
        ));
        assert!(ranking_chat(None, -100).is_err());
    }
}
