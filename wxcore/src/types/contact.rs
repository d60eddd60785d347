use super::system::SystemAccounts;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Routing-name prefix the service uses for group chats.
pub const GROUP_PREFIX: &str = "@@";

/// A contact entry as the service sends it in `webwxinit`, `webwxsync` and
/// group member lists.
///
/// Every field defaults when absent; the service omits fields freely
/// depending on the contact kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RawContact {
    /// Session-scoped routing name (`@...` for users, `@@...` for groups).
    pub user_name: String,
    pub nick_name: String,
    pub remark_name: String,
    /// Group member display name, set only inside `member_list`.
    pub display_name: String,
    /// The user-chosen WeChat id when exposed. Usually empty.
    pub alias: String,
    pub uin: u64,
    /// 0 unknown, 1 male, 2 female.
    pub sex: u8,
    pub province: String,
    pub city: String,
    pub signature: String,
    pub head_img_url: String,
    pub contact_flag: u32,
    pub verify_flag: u32,
    pub sns_flag: u32,
    pub statues: u32,
    pub is_owner: u32,
    pub member_count: u32,
    pub member_list: Vec<RawContact>,
}

impl RawContact {
    pub fn is_group(&self) -> bool {
        self.user_name.starts_with(GROUP_PREFIX)
    }

    /// Best-effort permanent identifier: the alias if exposed, else the uin.
    pub fn wxid(&self) -> Option<String> {
        if !self.alias.is_empty() {
            Some(self.alias.clone())
        } else if self.uin != 0 {
            Some(self.uin.to_string())
        } else {
            None
        }
    }
}

/// Coarse kind of a chat, decided from routing name and flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChatKind {
    User,
    Group,
    /// Official/brand account.
    OfficialAccount,
    System,
}

impl ChatKind {
    pub fn classify(contact: &RawContact, system: &SystemAccounts) -> Self {
        if system.contains(&contact.user_name) {
            ChatKind::System
        } else if contact.is_group() {
            ChatKind::Group
        } else if contact.verify_flag & VERIFY_FLAG_BIZ_BRAND != 0 {
            ChatKind::OfficialAccount
        } else {
            ChatKind::User
        }
    }
}

// Constants from the web client's contact model.
const CONTACT_FLAG_CONTACT: u32 = 1;
const CONTACT_FLAG_CHAT_CONTACT: u32 = 2;
const CONTACT_FLAG_CHAT_ROOM_CONTACT: u32 = 4;
const CONTACT_FLAG_BLACKLIST_CONTACT: u32 = 8;
const CONTACT_FLAG_NOTIFY_CLOSE_CONTACT: u32 = 512;
const CONTACT_FLAG_TOP_CONTACT: u32 = 2048;
const VERIFY_FLAG_BIZ_BRAND: u32 = 8;
const CHAT_ROOM_NOTIFY_CLOSE: u32 = 0;

/// Derived per-chat flags for host applications.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChatFlags {
    pub is_contact: bool,
    pub is_blacklist_contact: bool,
    pub is_conversation_contact: bool,
    pub is_room_contact_del: bool,
    pub is_room_owner: bool,
    pub is_brand_contact: bool,
    pub is_sp_contact: bool,
    pub is_shield_user: bool,
    pub is_muted: bool,
    pub is_top: bool,
    pub has_photo_album: bool,
}

impl ChatFlags {
    pub fn from_contact(contact: &RawContact, is_self: bool) -> Self {
        let flag = contact.contact_flag;
        let name = contact.user_name.as_str();
        let is_room = contact.is_group();
        Self {
            is_contact: flag & CONTACT_FLAG_CONTACT != 0 || is_self,
            is_blacklist_contact: flag & CONTACT_FLAG_BLACKLIST_CONTACT != 0,
            is_conversation_contact: flag & CONTACT_FLAG_CHAT_CONTACT != 0,
            is_room_contact_del: is_room && flag & CONTACT_FLAG_CHAT_ROOM_CONTACT == 0,
            is_room_owner: is_room && contact.is_owner != 0,
            is_brand_contact: contact.verify_flag & VERIFY_FLAG_BIZ_BRAND != 0,
            is_sp_contact: !name.contains('@') || name.ends_with("@qqim"),
            is_shield_user: name.ends_with("@lbsroom") || name.ends_with("@talkroom"),
            is_muted: if is_room {
                contact.statues == CHAT_ROOM_NOTIFY_CLOSE
            } else {
                flag & CONTACT_FLAG_NOTIFY_CLOSE_CONTACT != 0
            },
            is_top: flag & CONTACT_FLAG_TOP_CONTACT != 0,
            has_photo_album: contact.sns_flag != 0,
        }
    }
}

/// In-memory view of every chat the session knows about, split the way the
/// service splits them. Persisted as part of the session snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactSnapshot {
    pub self_user: Option<RawContact>,
    pub groups: BTreeMap<String, RawContact>,
    pub users: BTreeMap<String, RawContact>,
}

impl ContactSnapshot {
    /// Split the `webwxinit` contact list.
    ///
    /// Anything with a gender is an individual; `@@` names are groups (their
    /// member lists are not trustworthy at init and are cleared); other `@`
    /// names are individuals. Bare names are system accounts and skipped.
    pub fn split_initial(list: Vec<RawContact>) -> (Vec<RawContact>, Vec<RawContact>) {
        let mut groups = Vec::new();
        let mut users = Vec::new();
        for mut contact in list {
            if contact.sex != 0 {
                users.push(contact);
            } else if contact.is_group() {
                contact.member_list.clear();
                groups.push(contact);
            } else if contact.user_name.contains('@') {
                users.push(contact);
            }
        }
        (groups, users)
    }

    /// Split a `webwxsync` contact delta by routing-name prefix only.
    pub fn split_delta(list: Vec<RawContact>) -> (Vec<RawContact>, Vec<RawContact>) {
        list.into_iter().partition(RawContact::is_group)
    }

    /// Merge groups, keeping a previously known member list when the update
    /// arrives without one.
    pub fn update_groups(&mut self, groups: impl IntoIterator<Item = RawContact>) {
        for mut group in groups {
            if group.member_list.is_empty()
                && let Some(existing) = self.groups.get_mut(&group.user_name)
            {
                group.member_list = std::mem::take(&mut existing.member_list);
            }
            self.groups.insert(group.user_name.clone(), group);
        }
    }

    pub fn update_users(&mut self, users: impl IntoIterator<Item = RawContact>) {
        for user in users {
            self.users.insert(user.user_name.clone(), user);
        }
    }

    pub fn get(&self, user_name: &str) -> Option<&RawContact> {
        if let Some(me) = &self.self_user
            && me.user_name == user_name
        {
            return Some(me);
        }
        self.groups
            .get(user_name)
            .or_else(|| self.users.get(user_name))
    }

    /// Looks up `member` inside `group`'s member list, falling back to the
    /// top-level contact entry.
    pub fn member(&self, group: &str, member: &str) -> Option<&RawContact> {
        self.groups
            .get(group)
            .and_then(|g| g.member_list.iter().find(|m| m.user_name == member))
            .or_else(|| self.get(member))
    }

    pub fn len(&self) -> usize {
        self.groups.len() + self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.users.is_empty()
    }

    pub fn clear(&mut self) {
        self.self_user = None;
        self.groups.clear();
        self.users.clear();
    }
}
