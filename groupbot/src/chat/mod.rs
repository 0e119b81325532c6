//! Telegram side of the bot: commands, group messages, the settings menu and forms.

pub mod action;
mod callback;
mod commands;
pub mod form;
mod group;
pub mod menu;

use teloxide::{
    dispatching::{
        dialogue::{self, InMemStorage},
        DefaultKey, UpdateFilterExt, UpdateHandler,
    },
    payloads::SendMessageSetters,
    prelude::{Dialogue, Dispatcher},
    requests::Requester,
    types::{ChatId, InlineKeyboardMarkup, Message, ParseMode, Update},
    utils::{command::BotCommands, html},
    Bot,
};

use crate::{service::BotService, Error};

pub use form::State;

pub type BotDialogue = Dialogue<State, InMemStorage<State>>;

#[derive(Debug, BotCommands, Clone, PartialEq, Eq)]
#[command(rename_rule = "lowercase", description = "支持以下命令：")]
pub enum Command {
    #[command(description = "开始使用")]
    Start,
    #[command(description = "显示帮助")]
    Help,
    #[command(description = "今日发言排行")]
    Tongji(String),
    #[command(description = "近30天发言排行")]
    Tongji30(String),
    #[command(description = "群组设置")]
    Settings,
    #[command(description = "查看可管理的群组")]
    AdminGroups,
    #[command(description = "取消当前操作")]
    Cancel,
    #[command(description = "查看会话与用户 ID")]
    Id,
    #[command(description = "添加超级管理员")]
    AddSuperAdmin(String),
    #[command(description = "删除超级管理员")]
    DelSuperAdmin(String),
    #[command(description = "添加管理员")]
    AddAdmin(String),
    #[command(description = "删除管理员")]
    DelAdmin(String),
    #[command(description = "授权群组")]
    AuthGroup(String),
    #[command(description = "解除群组授权")]
    DeauthGroup(String),
    #[command(description = "检查配置")]
    CheckConfig,
    #[command(description = "添加关键词")]
    EasyKeyword,
    #[command(description = "添加轮播消息")]
    EasyBroadcast,
    #[command(description = "添加默认关键词")]
    AddDefaultKeywords(String),
}

/// An HTML message with an optional inline keyboard.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub text: String,
    pub markup: Option<InlineKeyboardMarkup>,
}

impl Prompt {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            markup: None,
        }
    }

    /// The user facing text of `err`, which may quote raw input.
    pub fn error(err: &Error) -> Self {
        Self::text(html::escape(&err.user_message()))
    }

    pub fn with(text: impl Into<String>, markup: InlineKeyboardMarkup) -> Self {
        Self {
            text: text.into(),
            markup: Some(markup),
        }
    }

    pub async fn send(self, bot: &Bot, chat_id: ChatId) -> Result<Message, Error> {
        let request = bot
            .send_message(chat_id, self.text)
            .parse_mode(ParseMode::Html)
            .disable_web_page_preview(true);
        let message = match self.markup {
            Some(markup) => request.reply_markup(markup).await?,
            None => request.await?,
        };
        Ok(message)
    }
}

impl From<(String, InlineKeyboardMarkup)> for Prompt {
    fn from((text, markup): (String, InlineKeyboardMarkup)) -> Self {
        Self::with(text, markup)
    }
}

pub fn dispatcher(service: &BotService) -> Dispatcher<Bot, Error, DefaultKey> {
    use dptree::deps;

    Dispatcher::builder(service.bot.clone(), schema())
        .dependencies(deps![service.clone(), InMemStorage::<State>::new()])
        .enable_ctrlc_handler()
        .build()
}

pub fn schema() -> UpdateHandler<Error> {
    use dptree::case;

    let command_handler = teloxide::filter_command::<Command, _>()
        .chain(dptree::filter_async(group::schedule_command_deletion))
        .endpoint(commands::handle_command);

    let private_handler = dptree::filter(|msg: Message| msg.chat.is_private())
        .branch(case![State::Keyword(form)].endpoint(form::keyword_input))
        .branch(case![State::Broadcast(form)].endpoint(form::broadcast_input))
        .branch(case![State::Setting(input)].endpoint(form::setting_input))
        .branch(dptree::endpoint(commands::private_fallback));

    let group_handler = dptree::filter(|msg: Message| msg.chat.is_group() || msg.chat.is_supergroup())
        .endpoint(group::group_message);

    let message_handler = Update::filter_message()
        .branch(command_handler)
        .branch(private_handler)
        .branch(group_handler);

    let callback_handler = Update::filter_callback_query().endpoint(callback::handle_callback);

    dialogue::enter::<Update, InMemStorage<State>, State, _>()
        .branch(message_handler)
        .branch(callback_handler)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        let parse = |text: &str| Command::parse(text, "groupbot").unwrap();
        assert_eq!(parse("/tongji"), Command::Tongji(String::new()));
        assert_eq!(parse("/tongji30 2"), Command::Tongji30("2".to_string()));
        assert_eq!(parse("/tongji@groupbot 3"), Command::Tongji("3".to_string()));
        assert_eq!(parse("/admingroups"), Command::AdminGroups);
        assert_eq!(
            parse("/addadmin 42 -1001 -1002"),
            Command::AddAdmin("42 -1001 -1002".to_string())
        );
        assert_eq!(parse("/easykeyword"), Command::EasyKeyword);
        assert!(Command::parse("/unknown", "groupbot").is_err());
        assert!(Command::parse("/tongji@otherbot", "groupbot").is_err());
    }

    #[test]
    fn test_error_prompt_is_html_safe() {
        let err = Error::InvalidInput("请使用正确的格式：/addadmin <用户ID>".to_string());
        assert_eq!(
            Prompt::error(&err).text,
            "❌ 请使用正确的格式：/addadmin &lt;用户ID&gt;"
        );
        let err = Error::InvalidKeyword("正则表达式无效: a<b & c".to_string());
        assert_eq!(Prompt::error(&err).text, "❌ 正则表达式无效: a&lt;b &amp; c");
    }

    #[test]
    fn test_schema_builds() {
        let _ = schema();
    }
}
