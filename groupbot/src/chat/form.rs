//! Keyword, broadcast and setting forms filled in a private chat.
//!
//! Each form is a [`State`] of the chat dialogue. Typed input moves a form
//! forward through `on_input`, buttons through [`handle_action`]. A form that
//! has not been touched for `state_timeout_secs` is dropped on the next input.

use chrono::{DateTime, Duration, FixedOffset, Utc};
use mongodb::bson::oid::ObjectId;
use teloxide::{
    types::{ChatId, Message},
    utils::html,
    Bot,
};
use tracing::debug;

use super::{
    action::{CallbackAction, FormAction, SettingField},
    menu, BotDialogue, Prompt,
};
use crate::{
    config::{AutoDeleteConfig, BroadcastConfig, KeywordConfig},
    database::{Broadcast, Group, GroupPermission, GroupSettings, Keyword, MatchType, RepeatType},
    message::{Media, Outbox, Reply, UrlButton},
    service::{
        broadcast::{next_send_time, BroadcastDraft},
        keyword::validate_pattern,
        BotService,
    },
    utils, Error,
};

const EXPIRED: &str = "⏰ 操作已超时，请重新开始";
const RANK_SIZE_RANGE: std::ops::RangeInclusive<i64> = 1..=50;

#[derive(Debug, Clone, Default)]
pub enum State {
    #[default]
    Idle,
    Keyword(KeywordForm),
    Broadcast(BroadcastForm),
    Setting(SettingInput),
}

impl State {
    fn touched(&self) -> Option<DateTime<Utc>> {
        match self {
            State::Idle => None,
            State::Keyword(form) => Some(form.touched),
            State::Broadcast(form) => Some(form.touched),
            State::Setting(input) => Some(input.touched),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>, timeout_secs: u64) -> bool {
        self.touched()
            .map_or(false, |touched| now - touched > Duration::seconds(timeout_secs as i64))
    }
}

/// Text and media of an incoming message.
#[derive(Debug, Default)]
pub struct Input<'a> {
    pub text: Option<&'a str>,
    pub media: Option<Media>,
}

impl<'a> Input<'a> {
    pub fn from_message(message: &'a Message) -> Self {
        Self {
            text: message.text().or_else(|| message.caption()),
            media: Media::from_message(message),
        }
    }

    pub fn text(text: &'a str) -> Self {
        Self {
            text: Some(text),
            media: None,
        }
    }

    fn trimmed(&self) -> Option<&'a str> {
        self.text.map(str::trim).filter(|text| !text.is_empty())
    }

    /// Text and media as message content, the text being a caption when media is present.
    fn content(self) -> Result<(Option<String>, Option<Media>), Error> {
        if self.trimmed().is_none() && self.media.is_none() {
            return Err(Error::InvalidInput("请发送文本或媒体".to_string()));
        }
        Ok((self.trimmed().map(str::to_string), self.media))
    }
}

fn invalid(message: &str) -> Error {
    Error::InvalidInput(message.to_string())
}

fn with_note(note: Option<String>, prompt: Prompt) -> Prompt {
    match note {
        Some(note) => Prompt {
            text: format!("{note}\n\n{}", prompt.text),
            ..prompt
        },
        None => prompt,
    }
}

const CONTENT_HINT: &str = "可以是文本，也可以是带说明文字的图片、视频、文件或动图";

fn buttons_help(max: usize) -> Prompt {
    Prompt::with(
        format!(
            "请发送按钮，每行一个：\n<code>按钮文字|https://example.com</code>\n\
             最多 {max} 个，发送 <code>无</code> 清除按钮"
        ),
        menu::cancel_keyboard(),
    )
}

/// Parse a button block. Returns the buttons and a note about ignored lines.
fn read_buttons(input: &Input, max: usize) -> Result<(Vec<UrlButton>, Option<String>), Error> {
    let text = input.trimmed().ok_or_else(|| invalid("请发送按钮文本"))?;
    if matches!(text, "无" | "none") {
        return Ok((Vec::new(), None));
    }
    let parsed = utils::parse_buttons(text, max);
    if parsed.buttons.is_empty() {
        return Err(invalid("按钮格式错误，请按 文字|链接 的格式发送"));
    }
    let note = (!parsed.invalid_lines.is_empty()).then(|| {
        let lines: Vec<String> = parsed.invalid_lines.iter().map(|l| l.to_string()).collect();
        format!("⚠️ 第 {} 行无法识别，已忽略", lines.join(", "))
    });
    Ok((parsed.buttons, note))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeywordStep {
    ChooseGroup,
    Pattern,
    MatchType,
    Response,
    Review,
    Buttons,
    /// Retyping the pattern of a reviewed keyword
    EditPattern,
}

#[derive(Debug, Clone)]
pub struct KeywordForm {
    pub step: KeywordStep,
    pub keyword: Keyword,
    pub touched: DateTime<Utc>,
}

impl KeywordForm {
    pub fn new(group_id: Option<i64>, now: DateTime<Utc>) -> Self {
        Self {
            step: match group_id {
                Some(_) => KeywordStep::Pattern,
                None => KeywordStep::ChooseGroup,
            },
            keyword: Keyword::new(group_id.unwrap_or_default(), "", MatchType::Exact),
            touched: now,
        }
    }

    /// Review a stored keyword. Submitting overwrites it.
    pub fn editing(keyword: Keyword, now: DateTime<Utc>) -> Self {
        Self {
            step: KeywordStep::Review,
            keyword,
            touched: now,
        }
    }

    pub fn prompt(&self, config: &KeywordConfig) -> Prompt {
        match self.step {
            KeywordStep::ChooseGroup => Prompt::with("请选择群组：", menu::cancel_keyboard()),
            KeywordStep::Pattern => Prompt::with("请发送关键词内容：", menu::cancel_keyboard()),
            KeywordStep::MatchType => Prompt::with("请选择匹配方式：", menu::match_type_keyboard()),
            KeywordStep::Response => Prompt::with(
                format!("请发送回复内容：\n{CONTENT_HINT}"),
                menu::cancel_keyboard(),
            ),
            KeywordStep::Buttons => buttons_help(config.max_buttons),
            KeywordStep::Review => menu::keyword_review(&self.keyword).into(),
            KeywordStep::EditPattern => Prompt::with(
                format!(
                    "当前关键词: <code>{}</code>\n请发送新的关键词内容：",
                    html::escape(&self.keyword.pattern)
                ),
                menu::cancel_keyboard(),
            ),
        }
    }

    pub fn on_input(&mut self, config: &KeywordConfig, input: Input) -> Result<Prompt, Error> {
        let mut note = None;
        match self.step {
            KeywordStep::ChooseGroup => return Err(invalid("请先点击按钮选择群组")),
            KeywordStep::Pattern => {
                let pattern = input.trimmed().ok_or_else(|| invalid("请发送文本关键词"))?;
                validate_pattern(config, pattern, MatchType::Exact)?;
                self.keyword.pattern = pattern.to_string();
                self.step = KeywordStep::MatchType;
            }
            KeywordStep::EditPattern => {
                let pattern = input.trimmed().ok_or_else(|| invalid("请发送文本关键词"))?;
                validate_pattern(config, pattern, self.keyword.match_type)?;
                self.keyword.pattern = pattern.to_string();
                self.step = KeywordStep::Review;
            }
            KeywordStep::MatchType => return Err(invalid("请点击按钮选择匹配方式")),
            KeywordStep::Response => {
                let (response, media) = input.content()?;
                self.keyword.response = response;
                self.keyword.media = media;
                self.step = KeywordStep::Review;
            }
            KeywordStep::Buttons => {
                let (buttons, ignored) = read_buttons(&input, config.max_buttons)?;
                self.keyword.buttons = buttons;
                note = ignored;
                self.step = KeywordStep::Review;
            }
            KeywordStep::Review => {
                note = Some("请使用下方按钮继续".to_string());
            }
        }
        Ok(with_note(note, self.prompt(config)))
    }

    pub fn select_match_type(
        &mut self,
        config: &KeywordConfig,
        match_type: MatchType,
    ) -> Result<Prompt, Error> {
        if self.step != KeywordStep::MatchType {
            return Err(stale());
        }
        validate_pattern(config, &self.keyword.pattern, match_type)?;
        self.keyword.match_type = match_type;
        self.step = KeywordStep::Response;
        Ok(self.prompt(config))
    }

    fn reviewing(&self) -> bool {
        match self.step {
            KeywordStep::Review | KeywordStep::Buttons | KeywordStep::EditPattern => true,
            KeywordStep::Response => self.keyword.has_content(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastStep {
    ChooseGroup,
    Content,
    Review,
    Buttons,
    Interval,
    StartTime,
    EndTime,
}

#[derive(Debug, Clone)]
pub struct BroadcastForm {
    pub step: BroadcastStep,
    pub draft: BroadcastDraft,
    /// Stored broadcast the draft replaces on submit
    pub editing: Option<ObjectId>,
    pub touched: DateTime<Utc>,
}

impl BroadcastForm {
    pub fn new(group_id: Option<i64>, now: DateTime<Utc>) -> Self {
        Self {
            step: match group_id {
                Some(_) => BroadcastStep::Content,
                None => BroadcastStep::ChooseGroup,
            },
            draft: BroadcastDraft::new(group_id.unwrap_or_default()),
            editing: None,
            touched: now,
        }
    }

    pub fn editing(broadcast: &Broadcast, now: DateTime<Utc>) -> Self {
        Self {
            step: BroadcastStep::Review,
            draft: BroadcastDraft::from(broadcast),
            editing: broadcast.id,
            touched: now,
        }
    }

    pub fn prompt(&self, config: &BroadcastConfig, max_buttons: usize, offset: FixedOffset) -> Prompt {
        let ask = |text: String| Prompt::with(text, menu::cancel_keyboard());
        match self.step {
            BroadcastStep::ChooseGroup => ask("请选择群组：".to_string()),
            BroadcastStep::Content => ask(format!("请发送轮播消息内容：\n{CONTENT_HINT}")),
            BroadcastStep::Buttons => buttons_help(max_buttons),
            BroadcastStep::Interval => ask(format!(
                "请发送重复间隔（分钟），范围 {} 到 {}：",
                config.min_interval, config.max_interval
            )),
            BroadcastStep::StartTime => ask(
                "请发送开始时间，格式 <code>YYYY-MM-DD HH:MM</code>，或发送 <code>now</code> 立即开始："
                    .to_string(),
            ),
            BroadcastStep::EndTime => {
                ask("请发送结束时间，格式 <code>YYYY-MM-DD HH:MM</code>：".to_string())
            }
            BroadcastStep::Review => {
                menu::broadcast_review(&self.draft, self.editing.is_some(), offset).into()
            }
        }
    }

    pub fn on_input(
        &mut self,
        config: &BroadcastConfig,
        max_buttons: usize,
        input: Input,
        now: DateTime<Utc>,
        offset: FixedOffset,
    ) -> Result<Prompt, Error> {
        let mut note = None;
        match self.step {
            BroadcastStep::ChooseGroup => return Err(invalid("请先点击按钮选择群组")),
            BroadcastStep::Content => {
                let (text, media) = input.content()?;
                self.draft.text = text;
                self.draft.media = media;
            }
            BroadcastStep::Buttons => {
                let (buttons, ignored) = read_buttons(&input, max_buttons)?;
                self.draft.buttons = buttons;
                note = ignored;
            }
            BroadcastStep::Interval => {
                let interval: i64 = input
                    .trimmed()
                    .and_then(|text| text.parse().ok())
                    .ok_or_else(|| invalid("请输入一个有效的数字"))?;
                if interval < config.min_interval || interval > config.max_interval {
                    return Err(Error::InvalidInput(format!(
                        "间隔必须在 {} 到 {} 分钟之间",
                        config.min_interval, config.max_interval
                    )));
                }
                self.draft.interval = Some(interval);
            }
            BroadcastStep::StartTime => {
                let text = input.trimmed().ok_or_else(|| invalid("请发送开始时间"))?;
                self.draft.start_time = Some(utils::parse_start_time(text, now, offset)?);
            }
            BroadcastStep::EndTime => {
                let text = input.trimmed().ok_or_else(|| invalid("请发送结束时间"))?;
                let end = utils::parse_local_datetime(text, offset)
                    .map_err(|_| invalid("时间格式错误，请使用 YYYY-MM-DD HH:MM"))?;
                if end <= self.draft.start_time.unwrap_or(now) {
                    return Err(invalid("结束时间必须晚于开始时间"));
                }
                self.draft.end_time = Some(end);
            }
            BroadcastStep::Review => {
                note = Some("请使用下方按钮继续".to_string());
            }
        }
        self.step = BroadcastStep::Review;
        Ok(with_note(note, self.prompt(config, max_buttons, offset)))
    }

    pub fn select_repeat(&mut self, repeat_type: RepeatType) {
        self.draft.repeat_type = Some(repeat_type);
        if repeat_type == RepeatType::Once {
            self.draft.end_time = None;
            self.draft.use_fixed_time = false;
        }
    }

    fn reviewing(&self) -> bool {
        match self.step {
            BroadcastStep::ChooseGroup => false,
            BroadcastStep::Content => self.draft.has_content(),
            _ => true,
        }
    }

    fn reply(&self) -> Reply {
        Reply {
            text: self.draft.text.clone(),
            media: self.draft.media.clone(),
            buttons: self.draft.buttons.clone(),
            ..Default::default()
        }
    }
}

/// Waiting for a number typed for a group setting.
#[derive(Debug, Clone)]
pub struct SettingInput {
    pub group_id: i64,
    pub field: SettingField,
    pub touched: DateTime<Utc>,
}

pub fn setting_prompt(field: SettingField, config: &AutoDeleteConfig) -> String {
    match field {
        SettingField::MinBytes => "请输入最小统计字节数：".to_string(),
        SettingField::DailyRankSize => "请输入日排行显示数量（1-50）：".to_string(),
        SettingField::MonthlyRankSize => "请输入月排行显示数量（1-50）：".to_string(),
        SettingField::AutoDeleteTimeout => format!(
            "请输入自动删除超时时间（秒），范围 {} 到 {}：",
            config.min_timeout, config.max_timeout
        ),
    }
}

/// Apply a typed value to `settings`, returning the confirmation text.
pub fn apply_setting(
    field: SettingField,
    input: &str,
    config: &AutoDeleteConfig,
    settings: &mut GroupSettings,
) -> Result<String, Error> {
    let value: i64 = input
        .trim()
        .parse()
        .map_err(|_| invalid("请输入一个有效的数字"))?;
    let rank_size = |value: i64| -> Result<u32, Error> {
        if RANK_SIZE_RANGE.contains(&value) {
            Ok(value as u32)
        } else {
            Err(invalid("显示数量必须在1-50之间"))
        }
    };

    Ok(match field {
        SettingField::MinBytes => {
            if value < 0 {
                return Err(invalid("最小字节数不能为负数"));
            }
            settings.min_bytes = value as u64;
            format!("✅ 最小统计字节数已设置为 {value} 字节")
        }
        SettingField::DailyRankSize => {
            settings.daily_rank_size = rank_size(value)?;
            format!("✅ 日排行显示数量已设置为 {value}")
        }
        SettingField::MonthlyRankSize => {
            settings.monthly_rank_size = rank_size(value)?;
            format!("✅ 月排行显示数量已设置为 {value}")
        }
        SettingField::AutoDeleteTimeout => {
            if value < config.min_timeout as i64 || value > config.max_timeout as i64 {
                return Err(Error::InvalidInput(format!(
                    "超时时间必须在 {} 到 {} 之间",
                    utils::format_duration(config.min_timeout),
                    utils::format_duration(config.max_timeout)
                )));
            }
            settings.auto_delete_timeout = value as u64;
            format!(
                "✅ 自动删除超时时间已设置为 {}",
                utils::format_duration(value as u64)
            )
        }
    })
}

fn stale() -> Error {
    invalid("该按钮已失效，请重新开始")
}

/// Exit the dialogue when the form timed out. Returns whether it did.
async fn expire(
    bot: &Bot,
    dialogue: &BotDialogue,
    service: &BotService,
    state: &State,
) -> Result<bool, Error> {
    if !state.is_expired(Utc::now(), service.config.state_timeout_secs) {
        return Ok(false);
    }
    debug!("Form of chat {} expired", dialogue.chat_id().0);
    dialogue.exit().await?;
    Prompt::text(EXPIRED).send(bot, dialogue.chat_id()).await?;
    Ok(true)
}

/// Group picker shown when a form starts without a group.
async fn choose_group(
    service: &BotService,
    user_id: i64,
    permission: GroupPermission,
    title: &str,
) -> Result<Prompt, Error> {
    let groups: Vec<Group> = service
        .database
        .manageable_groups(user_id)
        .await?
        .into_iter()
        .filter(|group| group.has_permission(permission))
        .collect();
    if groups.is_empty() {
        return Err(invalid("你没有可管理的群组"));
    }
    let markup = menu::group_choice(&groups, |g| CallbackAction::Form(FormAction::Group(g)))
        .append_row(vec![menu::cancel_button()]);
    Ok(Prompt::with(title, markup))
}

/// Group the form is for, checked again before anything is stored.
async fn form_group(
    service: &BotService,
    user_id: i64,
    group_id: i64,
    permission: GroupPermission,
) -> Result<Group, Error> {
    let group = service.managed_group(user_id, group_id).await?;
    if !group.permissions.contains(&permission) {
        return Err(Error::PermissionDenied);
    }
    Ok(group)
}

pub async fn start_keyword(
    bot: &Bot,
    dialogue: &BotDialogue,
    service: &BotService,
    user_id: i64,
    group_id: Option<i64>,
) -> Result<(), Error> {
    let form = KeywordForm::new(group_id, Utc::now());
    let prompt = match group_id {
        Some(group_id) => {
            form_group(service, user_id, group_id, GroupPermission::Keywords).await?;
            form.prompt(&service.config.keyword)
        }
        None => {
            choose_group(service, user_id, GroupPermission::Keywords, "请选择要添加关键词的群组：")
                .await?
        }
    };
    dialogue.update(State::Keyword(form)).await?;
    prompt.send(bot, dialogue.chat_id()).await?;
    Ok(())
}

pub async fn start_broadcast(
    bot: &Bot,
    dialogue: &BotDialogue,
    service: &BotService,
    user_id: i64,
    group_id: Option<i64>,
) -> Result<(), Error> {
    let form = BroadcastForm::new(group_id, Utc::now());
    let prompt = match group_id {
        Some(group_id) => {
            form_group(service, user_id, group_id, GroupPermission::Broadcast).await?;
            form.prompt(
                &service.config.broadcast,
                service.config.keyword.max_buttons,
                service.offset(),
            )
        }
        None => {
            choose_group(
                service,
                user_id,
                GroupPermission::Broadcast,
                "请选择要添加轮播消息的群组：",
            )
            .await?
        }
    };
    dialogue.update(State::Broadcast(form)).await?;
    prompt.send(bot, dialogue.chat_id()).await?;
    Ok(())
}

/// Open the review of a stored keyword for editing.
pub async fn edit_keyword(
    bot: &Bot,
    dialogue: &BotDialogue,
    service: &BotService,
    keyword: Keyword,
) -> Result<(), Error> {
    if keyword.is_command {
        return Err(invalid("命令关键词只能删除，不能编辑"));
    }
    let form = KeywordForm::editing(keyword, Utc::now());
    let prompt = form.prompt(&service.config.keyword);
    dialogue.update(State::Keyword(form)).await?;
    prompt.send(bot, dialogue.chat_id()).await?;
    Ok(())
}

pub async fn edit_broadcast(
    bot: &Bot,
    dialogue: &BotDialogue,
    service: &BotService,
    broadcast: &Broadcast,
) -> Result<(), Error> {
    let form = BroadcastForm::editing(broadcast, Utc::now());
    let prompt = form.prompt(
        &service.config.broadcast,
        service.config.keyword.max_buttons,
        service.offset(),
    );
    dialogue.update(State::Broadcast(form)).await?;
    prompt.send(bot, dialogue.chat_id()).await?;
    Ok(())
}

pub async fn start_setting(
    bot: &Bot,
    dialogue: &BotDialogue,
    service: &BotService,
    group_id: i64,
    field: SettingField,
) -> Result<(), Error> {
    dialogue
        .update(State::Setting(SettingInput {
            group_id,
            field,
            touched: Utc::now(),
        }))
        .await?;
    Prompt::with(
        setting_prompt(field, &service.config.auto_delete),
        menu::cancel_keyboard(),
    )
    .send(bot, dialogue.chat_id())
    .await?;
    Ok(())
}

/// Tell the user why their input was rejected and keep the form open.
async fn report_rejection(bot: &Bot, chat_id: ChatId, result: Result<(), Error>) -> Result<(), Error> {
    match result {
        Err(err) if !err.is_internal() => {
            debug!("Rejected form input in {}: {err}", chat_id.0);
            Prompt::error(&err).send(bot, chat_id).await?;
            Ok(())
        }
        result => result,
    }
}

pub async fn keyword_input(
    bot: Bot,
    dialogue: BotDialogue,
    service: BotService,
    msg: Message,
    form: KeywordForm,
) -> Result<(), Error> {
    let result = keyword_step(&bot, &dialogue, &service, &msg, form).await;
    report_rejection(&bot, msg.chat.id, result).await
}

async fn keyword_step(
    bot: &Bot,
    dialogue: &BotDialogue,
    service: &BotService,
    msg: &Message,
    mut form: KeywordForm,
) -> Result<(), Error> {
    if expire(bot, dialogue, service, &State::Keyword(form.clone())).await? {
        return Ok(());
    }
    let prompt = form.on_input(&service.config.keyword, Input::from_message(msg))?;
    form.touched = Utc::now();
    dialogue.update(State::Keyword(form)).await?;
    prompt.send(bot, msg.chat.id).await?;
    Ok(())
}

pub async fn broadcast_input(
    bot: Bot,
    dialogue: BotDialogue,
    service: BotService,
    msg: Message,
    form: BroadcastForm,
) -> Result<(), Error> {
    let result = broadcast_step(&bot, &dialogue, &service, &msg, form).await;
    report_rejection(&bot, msg.chat.id, result).await
}

async fn broadcast_step(
    bot: &Bot,
    dialogue: &BotDialogue,
    service: &BotService,
    msg: &Message,
    mut form: BroadcastForm,
) -> Result<(), Error> {
    if expire(bot, dialogue, service, &State::Broadcast(form.clone())).await? {
        return Ok(());
    }
    let now = Utc::now();
    let prompt = form.on_input(
        &service.config.broadcast,
        service.config.keyword.max_buttons,
        Input::from_message(msg),
        now,
        service.offset(),
    )?;
    form.touched = now;
    dialogue.update(State::Broadcast(form)).await?;
    prompt.send(bot, msg.chat.id).await?;
    Ok(())
}

pub async fn setting_input(
    bot: Bot,
    dialogue: BotDialogue,
    service: BotService,
    msg: Message,
    input: SettingInput,
) -> Result<(), Error> {
    let result = setting_step(&bot, &dialogue, &service, &msg, input).await;
    report_rejection(&bot, msg.chat.id, result).await
}

async fn setting_step(
    bot: &Bot,
    dialogue: &BotDialogue,
    service: &BotService,
    msg: &Message,
    input: SettingInput,
) -> Result<(), Error> {
    if expire(bot, dialogue, service, &State::Setting(input.clone())).await? {
        return Ok(());
    }
    let user_id = msg.from().ok_or(Error::PermissionDenied)?.id.0 as i64;
    let mut group = service.managed_group(user_id, input.group_id).await?;
    let text = msg.text().ok_or_else(|| invalid("请输入一个有效的数字"))?;
    let done = apply_setting(
        input.field,
        text,
        &service.config.auto_delete,
        &mut group.settings,
    )?;
    service
        .database
        .groups
        .update_settings(group.group_id, &group.settings)
        .await?;
    dialogue.exit().await?;

    Prompt::text(done).send(bot, msg.chat.id).await?;
    let menu = match input.field {
        SettingField::AutoDeleteTimeout => menu::auto_delete(&group, &service.config.auto_delete),
        _ => menu::stats_settings(&group),
    };
    Prompt::from(menu).send(bot, msg.chat.id).await?;
    Ok(())
}

enum Outcome {
    Continue(Prompt),
    Done(Prompt),
}

/// Handle a form button pressed by `user_id` in the private chat `chat_id`.
pub async fn handle_action(
    bot: &Bot,
    dialogue: &BotDialogue,
    service: &BotService,
    user_id: i64,
    chat_id: ChatId,
    action: FormAction,
) -> Result<(), Error> {
    let mut state = dialogue.get().await?.unwrap_or_default();
    if action == FormAction::Cancel {
        dialogue.exit().await?;
        Prompt::text("✅ 已取消").send(bot, chat_id).await?;
        return Ok(());
    }
    if matches!(state, State::Idle) {
        return Err(stale());
    }
    if expire(bot, dialogue, service, &state).await? {
        return Ok(());
    }

    let now = Utc::now();
    let outcome = match &mut state {
        State::Keyword(form) => {
            let outcome = keyword_action(bot, service, user_id, chat_id, form, action).await?;
            form.touched = now;
            outcome
        }
        State::Broadcast(form) => {
            let outcome = broadcast_action(bot, service, user_id, chat_id, form, action).await?;
            form.touched = now;
            outcome
        }
        State::Setting(_) | State::Idle => return Err(stale()),
    };

    match outcome {
        Outcome::Continue(prompt) => {
            dialogue.update(state).await?;
            prompt.send(bot, chat_id).await?;
        }
        Outcome::Done(prompt) => {
            dialogue.exit().await?;
            prompt.send(bot, chat_id).await?;
        }
    }
    Ok(())
}

async fn keyword_action(
    bot: &Bot,
    service: &BotService,
    user_id: i64,
    chat_id: ChatId,
    form: &mut KeywordForm,
    action: FormAction,
) -> Result<Outcome, Error> {
    let config = &service.config.keyword;
    let outcome = match action {
        FormAction::Group(group_id) if form.step == KeywordStep::ChooseGroup => {
            form_group(service, user_id, group_id, GroupPermission::Keywords).await?;
            form.keyword.group_id = group_id;
            form.step = KeywordStep::Pattern;
            Outcome::Continue(form.prompt(config))
        }
        FormAction::MatchType(match_type) => {
            Outcome::Continue(form.select_match_type(config, match_type)?)
        }
        FormAction::Buttons if form.reviewing() => {
            form.step = KeywordStep::Buttons;
            Outcome::Continue(form.prompt(config))
        }
        FormAction::Pattern if form.reviewing() => {
            form.step = KeywordStep::EditPattern;
            Outcome::Continue(form.prompt(config))
        }
        FormAction::Content if form.reviewing() => {
            form.step = KeywordStep::Response;
            Outcome::Continue(form.prompt(config))
        }
        FormAction::Preview if form.reviewing() => {
            bot.deliver(chat_id, &form.keyword.reply()).await?;
            form.step = KeywordStep::Review;
            Outcome::Continue(form.prompt(config))
        }
        FormAction::Submit if form.reviewing() => {
            let group_id = form.keyword.group_id;
            form_group(service, user_id, group_id, GroupPermission::Keywords).await?;
            let done = match form.keyword.id {
                Some(id) => {
                    service.keywords.update(id, &form.keyword).await?;
                    "已更新"
                }
                None => {
                    service.keywords.save(&form.keyword).await?;
                    "已保存"
                }
            };
            Outcome::Done(Prompt::text(format!(
                "✅ 关键词 <code>{}</code> {done}",
                html::escape(&form.keyword.pattern)
            )))
        }
        _ => return Err(stale()),
    };
    Ok(outcome)
}

async fn broadcast_action(
    bot: &Bot,
    service: &BotService,
    user_id: i64,
    chat_id: ChatId,
    form: &mut BroadcastForm,
    action: FormAction,
) -> Result<Outcome, Error> {
    let config = &service.config.broadcast;
    let max_buttons = service.config.keyword.max_buttons;
    let offset = service.offset();

    if let FormAction::Group(group_id) = action {
        if form.step != BroadcastStep::ChooseGroup {
            return Err(stale());
        }
        form_group(service, user_id, group_id, GroupPermission::Broadcast).await?;
        form.draft.group_id = group_id;
        form.step = BroadcastStep::Content;
        return Ok(Outcome::Continue(form.prompt(config, max_buttons, offset)));
    }
    if !form.reviewing() {
        return Err(stale());
    }

    let repeating = form.draft.repeat_type.unwrap_or_default() != RepeatType::Once;
    form.step = match action {
        FormAction::Repeat(repeat_type) => {
            form.select_repeat(repeat_type);
            BroadcastStep::Review
        }
        FormAction::Buttons => BroadcastStep::Buttons,
        FormAction::Content => BroadcastStep::Content,
        FormAction::Interval
            if form.draft.repeat_type == Some(RepeatType::Custom) =>
        {
            BroadcastStep::Interval
        }
        FormAction::StartTime => BroadcastStep::StartTime,
        FormAction::EndTime if repeating => BroadcastStep::EndTime,
        FormAction::ToggleFixedTime if repeating => {
            form.draft.use_fixed_time = !form.draft.use_fixed_time;
            BroadcastStep::Review
        }
        FormAction::Preview => {
            if !form.draft.has_content() {
                return Err(invalid("请至少提供文本、媒体或按钮"));
            }
            bot.deliver(chat_id, &form.reply()).await?;
            BroadcastStep::Review
        }
        FormAction::Submit => {
            let now = Utc::now();
            form_group(service, user_id, form.draft.group_id, GroupPermission::Broadcast).await?;
            let (broadcast, mut text) = match form.editing {
                Some(id) => (
                    service.broadcasts.update(id, &form.draft, now).await?,
                    "✅ 轮播消息已更新".to_string(),
                ),
                None => (
                    service.broadcasts.create(&form.draft, now).await?,
                    "✅ 轮播消息已创建".to_string(),
                ),
            };
            if let Some(next) = next_send_time(&broadcast, now, offset) {
                text.push_str(&format!("\n下次发送: {}", utils::format_local(next, offset)));
            }
            return Ok(Outcome::Done(Prompt::text(text)));
        }
        _ => return Err(stale()),
    };
    Ok(Outcome::Continue(form.prompt(config, max_buttons, offset)))
}
