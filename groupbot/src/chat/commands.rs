use std::fmt::Write;

use teloxide::{
    requests::Requester,
    types::{ChatId, Message, User},
    utils::html,
    Bot,
};
use tracing::{debug, error, info};

use super::{action::CallbackAction, form, menu, BotDialogue, Command, Prompt, State};
use crate::{
    built_info,
    config::BotConfig,
    database::{Group, GroupPermission, UserRole},
    service::{
        auto_delete::MessageKind,
        stats::{render_ranking, RankingPeriod},
        BotService,
    },
    utils, Error,
};

fn invalid(message: impl Into<String>) -> Error {
    Error::InvalidInput(message.into())
}

/// Page number argument of the ranking commands, `1` when absent.
pub fn parse_page(arg: &str) -> Result<u32, Error> {
    match arg.trim() {
        "" => Ok(1),
        page => page
            .parse::<u32>()
            .ok()
            .filter(|page| *page >= 1)
            .ok_or_else(|| invalid("无效的页码")),
    }
}

/// Parse a required numeric id, e.g. `/addadmin <用户ID>`.
fn parse_id(arg: &str, what: &str, usage: &str) -> Result<i64, Error> {
    let arg = arg.trim();
    if arg.is_empty() {
        return Err(invalid(format!("请使用正确的格式：{usage}")));
    }
    arg.parse().map_err(|_| invalid(format!("{what}必须是数字")))
}

fn parse_user_id(arg: &str, usage: &str) -> Result<i64, Error> {
    parse_id(arg, "用户ID", usage)
}

fn parse_group_id(arg: &str, usage: &str) -> Result<i64, Error> {
    parse_id(arg, "群组ID", usage)
}

pub fn help_text(first_name: &str, role: UserRole) -> String {
    let mut text = format!(
        "👋 你好 {}！\n\n\
         我是啤酒群管理机器人，主要功能包括：\n\
         • 关键词自动回复\n\
         • 消息统计与排行\n\
         • 轮播消息\n\n\
         📊 通用命令：\n\
         /tongji [页码] - 今日发言排行\n\
         /tongji30 [页码] - 近30天发言排行\n\
         /id - 查看会话与用户 ID\n\
         /cancel - 取消当前操作\n",
        html::escape(first_name)
    );
    if role.is_admin() {
        text.push_str(
            "\n⚙️ 管理员命令：\n\
             /settings - 群组设置\n\
             /admingroups - 查看可管理的群组\n\
             /easykeyword - 添加关键词\n\
             /easybroadcast - 添加轮播消息\n",
        );
    }
    if role == UserRole::SuperAdmin {
        text.push_str(
            "\n👑 超级管理员命令：\n\
             /addsuperadmin &lt;用户ID&gt; - 添加超级管理员\n\
             /delsuperadmin &lt;用户ID&gt; - 删除超级管理员\n\
             /addadmin &lt;用户ID&gt; [群组ID...] - 添加管理员\n\
             /deladmin &lt;用户ID&gt; [群组ID...] - 删除管理员或其群组\n\
             /authgroup &lt;群组ID&gt; [名称] - 授权群组\n\
             /deauthgroup &lt;群组ID&gt; - 解除群组授权\n\
             /adddefaultkeywords [群组ID] - 添加默认关键词\n\
             /checkconfig - 检查配置\n",
        );
    }
    text
}

/// Summary of the running configuration followed by its problems.
pub fn config_report(config: &BotConfig) -> String {
    let on_off = |on: bool| if on { "开启" } else { "关闭" };
    let mut text = String::from("🔧 当前配置信息：\n");
    let _ = writeln!(text, "版本: {}", built_info::PKG_VERSION);
    let _ = writeln!(text, "时区: UTC{:+}", config.timezone_offset);
    let _ = writeln!(
        text,
        "接收方式: {}",
        config
            .telegram
            .webhook_domain
            .as_deref()
            .map_or_else(|| "长轮询".to_string(), |domain| format!("Webhook ({})", html::escape(domain)))
    );
    let _ = writeln!(text, "数据库: {}", html::escape(&config.mongo.database));
    let _ = writeln!(text, "超级管理员: {} 个", config.superadmins.len());
    let _ = writeln!(text, "预授权群组: {} 个", config.groups.len());
    let _ = writeln!(text, "统计保留: {} 天", config.stats.cleanup_days);
    let _ = writeln!(
        text,
        "轮播间隔: {}-{} 分钟，每群最多 {} 条",
        config.broadcast.min_interval, config.broadcast.max_interval, config.broadcast.max_broadcasts
    );
    let _ = writeln!(text, "关键词: 每群最多 {} 个", config.keyword.max_keywords);
    let _ = writeln!(
        text,
        "自动删除: {}，默认 {}",
        on_off(config.auto_delete.enabled),
        utils::format_duration(config.auto_delete.default_timeout)
    );
    let _ = writeln!(
        text,
        "表单超时: {}",
        utils::format_duration(config.state_timeout_secs)
    );

    let problems = config.validate();
    if problems.is_empty() {
        text.push_str("\n✅ 配置检查通过");
    } else {
        text.push_str("\n⚠️ 配置问题：");
        for problem in problems {
            let _ = write!(text, "\n• {}", html::escape(&problem));
        }
    }
    text
}

/// Ranking text and page buttons for `group`.
pub async fn ranking(
    service: &BotService,
    group: &Group,
    period: RankingPeriod,
    page: u32,
) -> Result<Prompt, Error> {
    if !group.has_permission(GroupPermission::Stats) {
        return Err(invalid("此群组未启用统计功能"));
    }
    let page = service
        .stats
        .ranking(group, period, page, chrono::Utc::now())
        .await?;
    let names = service.stats.names(&page).await?;
    let text = render_ranking(period, &page, &names);
    Ok(match menu::ranking_keyboard(group.group_id, period, &page) {
        Some(markup) => Prompt::with(text, markup),
        None => Prompt::text(text),
    })
}

fn private_only(msg: &Message) -> Result<(), Error> {
    if msg.chat.is_private() {
        Ok(())
    } else {
        Err(invalid("请在私聊中使用此命令"))
    }
}

pub async fn handle_command(
    bot: Bot,
    dialogue: BotDialogue,
    service: BotService,
    msg: Message,
    command: Command,
) -> Result<(), Error> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let kind = match command {
        Command::Tongji(_) | Command::Tongji30(_) => MessageKind::Ranking,
        _ => MessageKind::Command,
    };

    let prompt = match run(&bot, &dialogue, &service, &msg, user, command).await {
        Ok(prompt) => prompt,
        Err(err) => {
            if err.is_internal() {
                error!("Command from {} in {} failed: {err:?}", user.id.0, msg.chat.id.0);
            } else {
                debug!("Rejected command from {}: {err}", user.id.0);
            }
            Some(Prompt::error(&err))
        }
    };
    let Some(prompt) = prompt else {
        return Ok(());
    };

    let sent = prompt.send(&bot, msg.chat.id).await?;
    if !msg.chat.is_private() {
        if let Some(group) = service.database.groups.get(msg.chat.id.0).await? {
            service
                .auto_delete
                .schedule_in_group(&group.settings, msg.chat.id, sent.id, kind);
        }
    }
    Ok(())
}

async fn run(
    bot: &Bot,
    dialogue: &BotDialogue,
    service: &BotService,
    msg: &Message,
    user: &User,
    command: Command,
) -> Result<Option<Prompt>, Error> {
    let user_id = user.id.0 as i64;
    service.database.users.upsert_profile(user).await?;

    let text = match command {
        Command::Start | Command::Help => {
            help_text(&user.first_name, service.role_of(user_id).await?)
        }
        Command::Tongji(_) | Command::Tongji30(_) if msg.chat.is_private() => {
            return Err(invalid("请在群组中使用此命令"));
        }
        Command::Tongji(page) => return group_ranking(service, msg, RankingPeriod::Daily, &page).await,
        Command::Tongji30(page) => {
            return group_ranking(service, msg, RankingPeriod::Monthly, &page).await
        }
        Command::Settings => {
            private_only(msg)?;
            service.require_admin(user_id).await?;
            let groups = service.database.manageable_groups(user_id).await?;
            if groups.is_empty() {
                return Err(invalid("你没有权限管理任何群组"));
            }
            return Ok(Some(Prompt::with(
                "请选择要管理的群组：",
                menu::group_choice(&groups, CallbackAction::Group),
            )));
        }
        Command::AdminGroups => {
            service.require_admin(user_id).await?;
            admin_groups(service, user_id).await?
        }
        Command::Cancel => match dialogue.get().await? {
            Some(state) if !matches!(state, State::Idle) => {
                dialogue.exit().await?;
                "✅ 已取消所有正在进行的设置操作".to_string()
            }
            _ => "❌ 当前没有正在进行的设置操作".to_string(),
        },
        Command::Id => {
            let mut text = format!(
                "🆔 会话 ID: <code>{}</code>\n👤 用户 ID: <code>{user_id}</code>",
                msg.chat.id.0
            );
            let group = if msg.chat.is_private() {
                None
            } else {
                service.database.groups.get(msg.chat.id.0).await?
            };
            if let Some(group) = group.filter(|g| g.has_permission(GroupPermission::Stats)) {
                let summary = service
                    .stats
                    .user_summary(group.group_id, user_id, 30, chrono::Utc::now())
                    .await?;
                let _ = write!(text, "\n\n{}", menu::summary_text("你近30天", &summary));
            }
            text
        }
        Command::AddSuperAdmin(arg) => {
            service.require_superadmin(user_id).await?;
            let target = parse_user_id(&arg, "/addsuperadmin <用户ID>")?;
            if service.role_of(target).await? == UserRole::SuperAdmin {
                return Err(invalid("该用户已经是超级管理员"));
            }
            service.database.users.set_role(target, UserRole::SuperAdmin).await?;
            info!("User {user_id} promoted {target} to superadmin");
            format!("✅ 已将用户 {target} 设置为超级管理员")
        }
        Command::DelSuperAdmin(arg) => {
            service.require_superadmin(user_id).await?;
            let target = parse_user_id(&arg, "/delsuperadmin <用户ID>")?;
            if target == user_id {
                return Err(invalid("不能删除自己的超级管理员权限"));
            }
            if service.role_of(target).await? != UserRole::SuperAdmin {
                return Err(invalid("该用户不是超级管理员"));
            }
            service.database.users.set_role(target, UserRole::User).await?;
            info!("User {user_id} demoted superadmin {target}");
            format!("✅ 已删除用户 {target} 的超级管理员权限")
        }
        Command::AddAdmin(args) => {
            service.require_superadmin(user_id).await?;
            add_admin(service, user_id, &args).await?
        }
        Command::DelAdmin(args) => {
            service.require_superadmin(user_id).await?;
            del_admin(service, user_id, &args).await?
        }
        Command::AuthGroup(args) => {
            service.require_superadmin(user_id).await?;
            let usage = "/authgroup <群组ID> [名称]";
            let (id, name) = args.trim().split_once(char::is_whitespace).unwrap_or((args.trim(), ""));
            let group_id = parse_group_id(id, usage)?;
            let name = match name.trim() {
                "" => chat_title(bot, group_id).await,
                name => name.to_string(),
            };
            service.authorize_group(group_id, &name).await?;
            format!(
                "✅ 已授权群组\n群组：{}\nID：<code>{group_id}</code>\n已启用全部功能",
                html::escape(&name)
            )
        }
        Command::DeauthGroup(arg) => {
            service.require_superadmin(user_id).await?;
            let group_id = parse_group_id(&arg, "/deauthgroup <群组ID>")?;
            if !service.deauthorize_group(group_id).await? {
                return Err(invalid("该群组未授权"));
            }
            format!("✅ 已解除群组 {group_id} 的所有授权")
        }
        Command::CheckConfig => {
            service.require_superadmin(user_id).await?;
            let mut text = config_report(&service.config);
            let superadmins = service.database.users.by_role(UserRole::SuperAdmin).await?;
            let admins = service.database.users.by_role(UserRole::Admin).await?;
            let _ = write!(
                text,
                "\n\n👥 数据库中有 {} 个超级管理员，{} 个管理员",
                superadmins.len(),
                admins.len()
            );
            text
        }
        Command::EasyKeyword => {
            private_only(msg)?;
            service.require_admin(user_id).await?;
            form::start_keyword(bot, dialogue, service, user_id, None).await?;
            return Ok(None);
        }
        Command::EasyBroadcast => {
            private_only(msg)?;
            service.require_admin(user_id).await?;
            form::start_broadcast(bot, dialogue, service, user_id, None).await?;
            return Ok(None);
        }
        Command::AddDefaultKeywords(arg) => {
            service.require_superadmin(user_id).await?;
            let groups = match arg.trim() {
                "" => service.database.groups.all().await?,
                id => {
                    let group_id = parse_group_id(id, "/adddefaultkeywords [群组ID]")?;
                    let group = service
                        .database
                        .groups
                        .get(group_id)
                        .await?
                        .ok_or(Error::UnknownGroup(group_id))?;
                    vec![group]
                }
            };
            let mut added = 0;
            for group in &groups {
                added += service.keywords.add_defaults(group.group_id).await?;
            }
            format!(
                "✅ 已为 {} 个群组添加默认关键词（新增 {added} 个）",
                groups.len()
            )
        }
    };
    Ok(Some(Prompt::text(text)))
}

async fn group_ranking(
    service: &BotService,
    msg: &Message,
    period: RankingPeriod,
    page: &str,
) -> Result<Option<Prompt>, Error> {
    let Some(group) = service.database.groups.get(msg.chat.id.0).await? else {
        return Ok(None);
    };
    let page = parse_page(page)?;
    Ok(Some(ranking(service, &group, period, page).await?))
}

async fn admin_groups(service: &BotService, user_id: i64) -> Result<String, Error> {
    let groups = service.database.manageable_groups(user_id).await?;
    if groups.is_empty() {
        return Ok("📝 你目前没有可管理的群组".to_string());
    }
    let mut text = String::from("📝 你可以管理的群组：\n");
    for group in groups {
        let permissions: Vec<String> = group
            .permissions
            .iter()
            .map(|permission| permission.to_string())
            .collect();
        let _ = write!(
            text,
            "\n• {} (<code>{}</code>)\n  权限: {}",
            html::escape(&group.title()),
            group.group_id,
            if permissions.is_empty() {
                "无".to_string()
            } else {
                permissions.join("、")
            }
        );
    }
    Ok(text)
}

/// `/addadmin <user_id> [group_id...]`
async fn add_admin(service: &BotService, user_id: i64, args: &str) -> Result<String, Error> {
    let usage = "/addadmin <用户ID> [群组ID...]";
    let mut words = args.split_whitespace();
    let target = parse_user_id(words.next().unwrap_or_default(), usage)?;
    let group_ids = words
        .map(|id| parse_group_id(id, usage))
        .collect::<Result<Vec<i64>, Error>>()?;

    match service.role_of(target).await? {
        UserRole::SuperAdmin => return Err(invalid("该用户是超级管理员")),
        UserRole::Admin if group_ids.is_empty() => return Err(invalid("该用户已经是管理员")),
        _ => {}
    }
    for &group_id in &group_ids {
        if service.database.groups.get(group_id).await?.is_none() {
            return Err(Error::UnknownGroup(group_id));
        }
    }

    service.database.users.set_role(target, UserRole::Admin).await?;
    for &group_id in &group_ids {
        service.database.admin_groups.add(target, group_id).await?;
    }
    info!("User {user_id} made {target} admin of {group_ids:?}");

    let mut text = format!("✅ 已将用户 {target} 设置为管理员");
    if !group_ids.is_empty() {
        let ids: Vec<String> = group_ids.iter().map(|id| id.to_string()).collect();
        let _ = write!(text, "\n可管理群组: {}", ids.join(", "));
    }
    Ok(text)
}

/// `/deladmin <user_id> [group_id...]`, removing only the listed groups when given.
async fn del_admin(service: &BotService, user_id: i64, args: &str) -> Result<String, Error> {
    let usage = "/deladmin <用户ID> [群组ID...]";
    let mut words = args.split_whitespace();
    let target = parse_user_id(words.next().unwrap_or_default(), usage)?;
    let group_ids = words
        .map(|id| parse_group_id(id, usage))
        .collect::<Result<Vec<i64>, Error>>()?;

    match service.role_of(target).await? {
        UserRole::SuperAdmin => return Err(invalid("不能删除超级管理员")),
        UserRole::User => return Err(invalid("该用户不是管理员")),
        UserRole::Admin => {}
    }

    if !group_ids.is_empty() {
        let mut removed = Vec::new();
        for group_id in group_ids {
            if service.database.admin_groups.remove(target, group_id).await? {
                removed.push(group_id.to_string());
            }
        }
        if removed.is_empty() {
            return Err(invalid("该管理员不能管理这些群组"));
        }
        info!("User {user_id} removed groups {removed:?} from admin {target}");
        return Ok(format!(
            "✅ 已取消用户 {target} 对群组 {} 的管理权限",
            removed.join(", ")
        ));
    }

    service.database.users.set_role(target, UserRole::User).await?;
    service.database.admin_groups.delete_by_admin(target).await?;
    info!("User {user_id} demoted admin {target}");
    Ok(format!("✅ 已删除用户 {target} 的管理员权限"))
}

async fn chat_title(bot: &Bot, group_id: i64) -> String {
    match bot.get_chat(ChatId(group_id)).await {
        Ok(chat) => chat
            .title()
            .map(str::to_string)
            .unwrap_or_else(|| format!("群组 {group_id}")),
        Err(err) => {
            info!("Could not fetch title of {group_id}: {err}");
            format!("群组 {group_id}")
        }
    }
}

/// Private messages outside of any form.
pub async fn private_fallback(bot: Bot, service: BotService, msg: Message) -> Result<(), Error> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let user_id = user.id.0 as i64;
    let text = if service.database.users.is_banned(user_id).await? {
        "您已被禁止使用此机器人"
    } else if service.role_of(user_id).await?.is_admin() {
        "请使用 /settings 或 /admingroups 管理您的群组"
    } else {
        "请使用 /start 命令获取帮助信息"
    };
    Prompt::text(text).send(&bot, msg.chat.id).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_page() {
        assert_eq!(parse_page("").unwrap(), 1);
        assert_eq!(parse_page(" 3 ").unwrap(), 3);
        assert_eq!(parse_page("0").unwrap_err().user_message(), "❌ 无效的页码");
        assert!(parse_page("-1").is_err());
        assert!(parse_page("two").is_err());
    }

    #[test]
    fn test_parse_ids() {
        assert_eq!(parse_user_id(" 42 ", "/addadmin <用户ID>").unwrap(), 42);
        let usage = parse_user_id("", "/addadmin <用户ID>").unwrap_err();
        assert_eq!(usage.user_message(), "❌ 请使用正确的格式：/addadmin <用户ID>");
        assert_eq!(
            Prompt::error(&usage).text,
            "❌ 请使用正确的格式：/addadmin &lt;用户ID&gt;"
        );
        assert_eq!(
            parse_user_id("abc", "/addadmin <用户ID>").unwrap_err().user_message(),
            "❌ 用户ID必须是数字"
        );
        assert_eq!(parse_group_id("-1001234", "").unwrap(), -1001234);
    }

    #[test]
    fn test_help_text_by_role() {
        let user = help_text("<Alice>", UserRole::User);
        assert!(user.contains("&lt;Alice&gt;"));
        assert!(!user.contains("/settings"));

        let admin = help_text("Bob", UserRole::Admin);
        assert!(admin.contains("/settings"));
        assert!(!admin.contains("/authgroup"));

        let superadmin = help_text("Carol", UserRole::SuperAdmin);
        assert!(superadmin.contains("/easybroadcast"));
        assert!(superadmin.contains("/authgroup"));
    }

    #[test]
    fn test_config_report() {
        let mut config = BotConfig::default();
        let report = config_report(&config);
        assert!(report.starts_with("🔧 当前配置信息："));
        assert!(report.contains("长轮询"));
        assert!(report.contains("TELEGRAM_TOKEN is not set"));

        config.telegram.token = "1:abc".to_string();
        config.superadmins = vec![1];
        config.telegram.webhook_domain = Some("bot.example.com".to_string());
        let report = config_report(&config);
        assert!(report.contains("Webhook (bot.example.com)"));
        assert!(report.ends_with("✅ 配置检查通过"));
    }
}
