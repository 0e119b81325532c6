//! Outgoing message content and delivery.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use teloxide::{
    payloads::{
        SendAnimationSetters, SendDocumentSetters, SendMessageSetters, SendPhotoSetters,
        SendVideoSetters,
    },
    requests::Requester,
    types::{ChatId, InlineKeyboardButton, InlineKeyboardMarkup, InputFile, Message, MessageId},
    Bot,
};

use crate::Error;

/// Text shown when a message only carries buttons.
const BUTTONS_ONLY_TEXT: &str = "👇 请点击下方按钮";

/// An inline button that opens a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlButton {
    pub text: String,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
    Document,
    Animation,
}

/// A file already uploaded to Telegram, referenced by file id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Media {
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub file_id: String,
}

impl MediaKind {
    pub fn label(&self) -> &'static str {
        match self {
            MediaKind::Photo => "图片",
            MediaKind::Video => "视频",
            MediaKind::Document => "文件",
            MediaKind::Animation => "动图",
        }
    }
}

impl Media {
    /// Media attached to `message`, using the largest photo size.
    pub fn from_message(message: &Message) -> Option<Self> {
        let (kind, file_id) = if let Some(photos) = message.photo() {
            (MediaKind::Photo, photos.last()?.file.id.clone())
        } else if let Some(video) = message.video() {
            (MediaKind::Video, video.file.id.clone())
        } else if let Some(animation) = message.animation() {
            (MediaKind::Animation, animation.file.id.clone())
        } else if let Some(document) = message.document() {
            (MediaKind::Document, document.file.id.clone())
        } else {
            return None;
        };
        Some(Self { kind, file_id })
    }
}

/// A message ready to be sent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply {
    pub text: Option<String>,
    pub media: Option<Media>,
    pub buttons: Vec<UrlButton>,
    pub reply_to: Option<MessageId>,
}

impl Reply {
    pub fn reply_to(mut self, message_id: MessageId) -> Self {
        self.reply_to = Some(message_id);
        self
    }

    /// One button per row. Buttons with an unparsable url are left out.
    pub fn markup(&self) -> Option<InlineKeyboardMarkup> {
        let rows: Vec<Vec<InlineKeyboardButton>> = self
            .buttons
            .iter()
            .filter_map(|button| {
                let url = url::Url::parse(&button.url).ok()?;
                Some(vec![InlineKeyboardButton::url(button.text.clone(), url)])
            })
            .collect();
        (!rows.is_empty()).then(|| InlineKeyboardMarkup::new(rows))
    }

    pub fn is_empty(&self) -> bool {
        self.text.as_deref().map_or(true, str::is_empty)
            && self.media.is_none()
            && self.buttons.is_empty()
    }
}

/// Something that can post and remove chat messages.
#[async_trait]
pub trait Outbox: Send + Sync {
    async fn deliver(&self, chat_id: ChatId, reply: &Reply) -> Result<MessageId, Error>;
    async fn remove(&self, chat_id: ChatId, message_id: MessageId) -> Result<(), Error>;
}

macro_rules! with_options {
    ($request:expr, $reply:expr) => {{
        let mut request = $request;
        if let Some(markup) = $reply.markup() {
            request = request.reply_markup(markup);
        }
        if let Some(id) = $reply.reply_to {
            request = request.reply_to_message_id(id);
        }
        request
    }};
}

macro_rules! with_caption {
    ($request:expr, $reply:expr) => {{
        let mut request = with_options!($request, $reply);
        if let Some(text) = &$reply.text {
            request = request.caption(text.clone());
        }
        request
    }};
}

#[async_trait]
impl Outbox for Bot {
    async fn deliver(&self, chat_id: ChatId, reply: &Reply) -> Result<MessageId, Error> {
        if reply.is_empty() {
            return Err(Error::InvalidInput("消息内容为空".to_string()));
        }

        let sent = match &reply.media {
            Some(media) => {
                let file = InputFile::file_id(media.file_id.clone());
                match media.kind {
                    MediaKind::Photo => with_caption!(self.send_photo(chat_id, file), reply).await?,
                    MediaKind::Video => with_caption!(self.send_video(chat_id, file), reply).await?,
                    MediaKind::Document => {
                        with_caption!(self.send_document(chat_id, file), reply).await?
                    }
                    MediaKind::Animation => {
                        with_caption!(self.send_animation(chat_id, file), reply).await?
                    }
                }
            }
            None => {
                let text = reply
                    .text
                    .clone()
                    .filter(|text| !text.is_empty())
                    .unwrap_or_else(|| BUTTONS_ONLY_TEXT.to_string());
                with_options!(self.send_message(chat_id, text), reply).await?
            }
        };
        Ok(sent.id)
    }

    async fn remove(&self, chat_id: ChatId, message_id: MessageId) -> Result<(), Error> {
        self.delete_message(chat_id, message_id).await?;
        Ok(())
    }
}
