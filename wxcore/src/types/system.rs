use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Well-known service accounts, keyed by their fixed routing name.
///
/// These names never change between sessions, so the identity resolver uses
/// the name itself as the durable id. Values are display names; hosts that
/// localize them pass their own table at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemAccounts {
    names: BTreeMap<String, String>,
}

const BUILTIN: &[(&str, &str)] = &[
    ("filehelper", "File Transfer"),
    ("newsapp", "Tencent News"),
    ("fmessage", "Friend Recommendations"),
    ("weibo", "Weibo"),
    ("qqmail", "QQ Mail"),
    ("tmessage", "tmessage"),
    ("qmessage", "qmessage"),
    ("qqsync", "QQ Sync"),
    ("floatbottle", "Drift Bottle"),
    ("lbsapp", "Location Sharing"),
    ("shakeapp", "Shake"),
    ("medianote", "Voice Notes"),
    ("qqfriend", "QQ Friends"),
    ("readerapp", "Reader"),
    ("blogapp", "Blog"),
    ("facebookapp", "Facebook"),
    ("masssendapp", "Broadcast Messages"),
    ("meishiapp", "meishiapp"),
    ("feedsapp", "Feeds"),
    ("voip", "VoIP"),
    ("blogappweixin", "WeChat Blog"),
    ("weixin", "WeChat Team"),
    ("brandsessionholder", "Brand Sessions"),
    ("weixinreminder", "WeChat Reminders"),
    ("officialaccounts", "Official Accounts"),
    ("notification_messages", "Notifications"),
    ("wxitil", "wxitil"),
    ("userexperience_alarm", "User Experience"),
];

impl Default for SystemAccounts {
    fn default() -> Self {
        Self::from_pairs(BUILTIN.iter().copied())
    }
}

impl SystemAccounts {
    pub fn empty() -> Self {
        Self {
            names: BTreeMap::new(),
        }
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            names: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Overrides or adds a display name.
    pub fn with_display_name(mut self, user_name: impl Into<String>, name: impl Into<String>) -> Self {
        self.names.insert(user_name.into(), name.into());
        self
    }

    pub fn contains(&self, user_name: &str) -> bool {
        self.names.contains_key(user_name)
    }

    /// The stored routing name equal to `user_name`, if it is a system
    /// account.
    pub fn canonical(&self, user_name: &str) -> Option<&str> {
        self.names.get_key_value(user_name).map(|(k, _)| k.as_str())
    }

    pub fn display_name(&self, user_name: &str) -> Option<&str> {
        self.names.get(user_name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
