use super::contact::{ChatFlags, ChatKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A message entry from `webwxsync`'s `AddMsgList`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RawMessage {
    pub msg_id: String,
    pub new_msg_id: u64,
    pub from_user_name: String,
    pub to_user_name: String,
    pub msg_type: u32,
    pub app_msg_type: u32,
    pub sub_msg_type: u32,
    pub content: String,
    pub create_time: i64,
    pub file_name: String,
    pub file_size: String,
    pub url: String,
    pub status_notify_code: u32,
    pub recommend_info: RecommendInfo,
}

/// Attached contact for friend requests and contact cards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RecommendInfo {
    pub user_name: String,
    pub nick_name: String,
    pub content: String,
    pub ticket: String,
}

// Wire message types.
const MSG_TEXT: u32 = 1;
const MSG_IMAGE: u32 = 3;
const MSG_VOICE: u32 = 34;
const MSG_VERIFY: u32 = 37;
const MSG_CARD: u32 = 42;
const MSG_VIDEO: u32 = 43;
const MSG_EMOTICON: u32 = 47;
const MSG_LOCATION: u32 = 48;
const MSG_APP: u32 = 49;
const MSG_STATUS_NOTIFY: u32 = 51;
const MSG_MICRO_VIDEO: u32 = 62;
const MSG_SYS_NOTICE: u32 = 9999;
const MSG_SYS: u32 = 10000;
const MSG_RECALLED: u32 = 10002;

// `AppMsgType` values for MSG_APP.
const APP_ATTACHMENT: u32 = 6;
const APP_EMOJI: u32 = 8;
const APP_REALTIME_LOCATION: u32 = 17;
const APP_TRANSFER: u32 = 2000;
const APP_RED_ENVELOPE: u32 = 2001;

/// Text messages starting with this are map pins.
pub const LOCATION_URL_PREFIX: &str = "http://weixin.qq.com/cgi-bin/redirectforward?args=";

/// Placeholder texts the service sends instead of content it does not
/// deliver to web clients.
const UNSUPPORTED_PROMPTS: &[&str] = &[
    "This type of message is not supported on Web WeChat. View it on your phone.",
    "该类型暂不支持，请在手机上查看",
    "該類型暫不支持，請在手機上查看。",
    "暫時不支援該類型，請在手機上查看。",
];

/// Coarse type tag used to route a message to the right handler. Payload
/// decoding is left to the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageKind {
    Text,
    Picture,
    Sticker,
    File,
    Voice,
    Video,
    Location,
    SharedLink,
    SystemNote,
    ContactCard,
    Unsupported,
}

impl MessageKind {
    /// Classifies a raw message. `None` means the entry is protocol
    /// bookkeeping (status notifications) and is not dispatched.
    pub fn classify(msg: &RawMessage) -> Option<Self> {
        let kind = match msg.msg_type {
            MSG_TEXT => {
                if msg.content.starts_with(LOCATION_URL_PREFIX) {
                    MessageKind::Location
                } else if UNSUPPORTED_PROMPTS.iter().any(|p| msg.content.trim() == *p) {
                    MessageKind::Unsupported
                } else {
                    MessageKind::Text
                }
            }
            MSG_IMAGE => MessageKind::Picture,
            MSG_VOICE => MessageKind::Voice,
            MSG_VERIFY => MessageKind::SystemNote,
            MSG_CARD => MessageKind::ContactCard,
            MSG_VIDEO | MSG_MICRO_VIDEO => MessageKind::Video,
            MSG_EMOTICON => MessageKind::Sticker,
            MSG_LOCATION => MessageKind::Location,
            MSG_APP => match msg.app_msg_type {
                APP_ATTACHMENT => MessageKind::File,
                APP_EMOJI => MessageKind::Sticker,
                APP_REALTIME_LOCATION => MessageKind::Location,
                APP_TRANSFER | APP_RED_ENVELOPE => MessageKind::SystemNote,
                _ => MessageKind::SharedLink,
            },
            MSG_STATUS_NOTIFY => return None,
            MSG_SYS | MSG_RECALLED | MSG_SYS_NOTICE => MessageKind::SystemNote,
            _ => MessageKind::Unsupported,
        };
        Some(kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Picture => "picture",
            MessageKind::Sticker => "sticker",
            MessageKind::File => "file",
            MessageKind::Voice => "voice",
            MessageKind::Video => "video",
            MessageKind::Location => "location",
            MessageKind::SharedLink => "shared-link",
            MessageKind::SystemNote => "system-note",
            MessageKind::ContactCard => "contact-card",
            MessageKind::Unsupported => "unsupported",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who sent a message and where it belongs, before identity resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRouting {
    pub chat: String,
    pub author: String,
    pub is_self: bool,
    /// Content with any group author prefix removed.
    pub content: String,
}

const GROUP_AUTHOR_SEPARATOR: &str = ":<br/>";

impl RawMessage {
    /// Works out chat, author and content for a message seen by
    /// `self_user_name`.
    ///
    /// Messages the user sent from their phone are routed to the recipient.
    /// Incoming group messages name their author in a `@user:<br/>` prefix.
    pub fn routing(&self, self_user_name: &str) -> MessageRouting {
        let is_self = !self_user_name.is_empty() && self.from_user_name == self_user_name;
        let chat = if is_self {
            self.to_user_name.clone()
        } else {
            self.from_user_name.clone()
        };

        if !is_self
            && chat.starts_with(super::contact::GROUP_PREFIX)
            && let Some((author, rest)) = self.content.split_once(GROUP_AUTHOR_SEPARATOR)
            && author.starts_with('@')
        {
            return MessageRouting {
                chat,
                author: author.to_string(),
                is_self,
                content: rest.to_string(),
            };
        }

        let author = if is_self {
            self_user_name.to_string()
        } else {
            chat.clone()
        };
        MessageRouting {
            chat,
            author,
            is_self,
            content: self.content.clone(),
        }
    }
}

/// A chat reference carried by a normalized message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatRef {
    pub user_name: String,
    /// Durable id, `None` when the chat could not be resolved.
    pub puid: Option<String>,
    pub display_name: String,
    pub kind: ChatKind,
    /// All unset for chats missing from the contact list.
    pub flags: ChatFlags,
}

/// A message ready for downstream delivery.
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedMessage {
    pub id: String,
    pub kind: MessageKind,
    pub chat: ChatRef,
    pub author: ChatRef,
    pub is_self: bool,
    pub text: String,
    pub file_name: Option<String>,
    pub url: Option<String>,
    pub create_time: i64,
    #[serde(skip)]
    pub raw: RawMessage,
}
