use super::bimap::BiMap;
use super::caption::Caption;
use crate::types::contact::RawContact;
use crate::types::system::SystemAccounts;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Length of a minted durable id.
pub const PUID_LEN: usize = 8;

/// Attributes of a chat as observed at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatObservation {
    pub user_name: String,
    pub wxid: Option<String>,
    pub remark_name: Option<String>,
    pub caption: Caption,
}

impl ChatObservation {
    pub fn from_contact(contact: &RawContact) -> Self {
        Self {
            user_name: contact.user_name.clone(),
            wxid: contact.wxid(),
            remark_name: if contact.remark_name.is_empty() {
                None
            } else {
                Some(contact.remark_name.clone())
            },
            caption: Caption::from_contact(contact),
        }
    }
}

/// Which rule produced a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchSource {
    System,
    UserName,
    Wxid,
    RemarkName,
    Caption,
    Minted,
}

impl fmt::Display for MatchSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MatchSource::System => "system account",
            MatchSource::UserName => "user name",
            MatchSource::Wxid => "wxid",
            MatchSource::RemarkName => "remark name",
            MatchSource::Caption => "caption",
            MatchSource::Minted => "new",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub puid: String,
    pub source: MatchSource,
    /// True when any stored mapping changed and the store needs saving.
    pub updated: bool,
}

/// The persisted part of the identity store: one bijective table per
/// exact key type plus the caption table, all keyed to PUIDs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PuidTables {
    pub user_names: BiMap<String, String>,
    pub wxids: BiMap<String, String>,
    pub remark_names: BiMap<String, String>,
    pub captions: BiMap<Caption, String>,
}

impl PuidTables {
    fn owns(&self, puid: &String) -> bool {
        self.user_names.contains_value(puid)
            || self.wxids.contains_value(puid)
            || self.remark_names.contains_value(puid)
            || self.captions.contains_value(puid)
    }

    pub fn len(&self) -> usize {
        self.captions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.captions.is_empty() && self.user_names.is_empty()
    }
}

/// Resolves observed chats to durable ids.
///
/// Not synchronized; callers wrap the whole map in one lock so that a
/// lookup and its update happen as a unit.
#[derive(Debug, Clone)]
pub struct PuidMap {
    tables: PuidTables,
    system: SystemAccounts,
    /// Routing names observed since the current session began.
    live: BTreeSet<String>,
}

impl PuidMap {
    pub fn new(system: SystemAccounts) -> Self {
        Self::from_tables(PuidTables::default(), system)
    }

    pub fn from_tables(tables: PuidTables, system: SystemAccounts) -> Self {
        Self {
            tables,
            system,
            live: BTreeSet::new(),
        }
    }

    pub fn tables(&self) -> &PuidTables {
        &self.tables
    }

    pub fn system_accounts(&self) -> &SystemAccounts {
        &self.system
    }

    /// Forgets which routing names are live. Call when a new session
    /// starts; the service reissues every routing name.
    pub fn reset_session(&mut self) {
        self.live.clear();
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn puid_for_user_name(&self, user_name: &str) -> Option<&str> {
        if let Some(name) = self.system.canonical(user_name) {
            return Some(name);
        }
        self.tables
            .user_names
            .get_by_key(&user_name.to_string())
            .map(String::as_str)
    }

    pub fn user_name_for_puid(&self, puid: &str) -> Option<&str> {
        if let Some(name) = self.system.canonical(puid) {
            return Some(name);
        }
        self.tables
            .user_names
            .get_by_value(&puid.to_string())
            .map(String::as_str)
    }

    /// Finds or mints the durable id for `chat` and records its current
    /// attributes against it.
    ///
    /// Returns `None` when the chat has no routing name or no nick and is
    /// not a system account.
    pub fn resolve(&mut self, chat: &ChatObservation) -> Option<Resolution> {
        if self.system.contains(&chat.user_name) {
            return Some(Resolution {
                puid: chat.user_name.clone(),
                source: MatchSource::System,
                updated: false,
            });
        }
        if chat.user_name.is_empty() || chat.caption.nick.is_none() {
            return None;
        }

        let (puid, source) = match self.find(chat) {
            Some(found) => found,
            None => (self.mint(&chat.user_name), MatchSource::Minted),
        };

        let mut updated = source == MatchSource::Minted;
        updated |= self
            .tables
            .user_names
            .insert(chat.user_name.clone(), puid.clone());
        if let Some(wxid) = &chat.wxid {
            updated |= self.tables.wxids.insert(wxid.clone(), puid.clone());
        }
        if let Some(remark) = &chat.remark_name {
            updated |= self.tables.remark_names.insert(remark.clone(), puid.clone());
        }
        let caption = match self.tables.captions.get_by_value(&puid) {
            Some(stored) => stored.merged_with(&chat.caption),
            None => chat.caption.clone(),
        };
        updated |= self.tables.captions.insert(caption, puid.clone());

        self.live.insert(chat.user_name.clone());

        Some(Resolution {
            puid,
            source,
            updated,
        })
    }

    fn find(&self, chat: &ChatObservation) -> Option<(String, MatchSource)> {
        let t = &self.tables;
        if let Some(p) = t.user_names.get_by_key(&chat.user_name) {
            return Some((p.clone(), MatchSource::UserName));
        }
        if let Some(p) = chat.wxid.as_ref().and_then(|w| t.wxids.get_by_key(w)) {
            return Some((p.clone(), MatchSource::Wxid));
        }
        if let Some(p) = chat
            .remark_name
            .as_ref()
            .and_then(|r| t.remark_names.get_by_key(r))
        {
            return Some((p.clone(), MatchSource::RemarkName));
        }

        t.captions
            .iter()
            .filter(|(stored, _)| stored.is_compatible(&chat.caption))
            .find(|(_, puid)| !self.is_live_elsewhere(puid, &chat.user_name))
            .map(|(_, puid)| (puid.clone(), MatchSource::Caption))
    }

    /// True if `puid` belongs to a different chat that is live in this
    /// session, which rules it out as a caption match.
    fn is_live_elsewhere(&self, puid: &String, user_name: &str) -> bool {
        match self.tables.user_names.get_by_value(puid) {
            Some(owner) => owner != user_name && self.live.contains(owner),
            None => false,
        }
    }

    fn mint(&self, user_name: &str) -> String {
        let chars: Vec<char> = user_name.chars().collect();
        let start = chars.len().saturating_sub(PUID_LEN);
        let candidate: String = chars[start..].iter().collect();
        if !candidate.is_empty() && !self.is_taken(&candidate) {
            return candidate;
        }
        let mut rng = rand::rng();
        loop {
            let bytes: [u8; PUID_LEN / 2] = rng.random();
            let candidate = hex::encode(bytes);
            if !self.is_taken(&candidate) {
                return candidate;
            }
        }
    }

    fn is_taken(&self, puid: &String) -> bool {
        self.tables.owns(puid) || self.system.contains(puid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(user_name: &str, nick: &str) -> ChatObservation {
        ChatObservation {
            user_name: user_name.to_string(),
            caption: Caption::new(nick, 0, "", ""),
            ..Default::default()
        }
    }

    fn map() -> PuidMap {
        PuidMap::new(SystemAccounts::default())
    }

    #[test]
    fn system_accounts_keep_their_name() {
        let mut map = map();
        let r = map.resolve(&obs("filehelper", "")).unwrap();
        assert_eq!(r.puid, "filehelper");
        assert_eq!(r.source, MatchSource::System);
        assert!(!r.updated);
        assert!(map.is_empty());
    }

    #[test]
    fn unresolvable_without_nick() {
        let mut map = map();
        assert!(map.resolve(&obs("@abcdef0123456789", "")).is_none());
        assert!(map.resolve(&obs("", "Alice")).is_none());
    }

    #[test]
    fn mints_from_routing_name_suffix() {
        let mut map = map();
        let r = map.resolve(&obs("@0123456789abcdef", "Alice")).unwrap();
        assert_eq!(r.puid, "89abcdef");
        assert_eq!(r.source, MatchSource::Minted);
        assert!(r.updated);

        let again = map.resolve(&obs("@0123456789abcdef", "Alice")).unwrap();
        assert_eq!(again.puid, "89abcdef");
        assert_eq!(again.source, MatchSource::UserName);
        assert!(!again.updated);
    }

    #[test]
    fn suffix_collision_mints_random_id() {
        let mut map = map();
        let a = map.resolve(&obs("@aaaa89abcdef", "Alice")).unwrap();
        let b = map.resolve(&obs("@bbbb89abcdef", "Bob")).unwrap();
        assert_eq!(a.puid, "89abcdef");
        assert_ne!(b.puid, a.puid);
        assert_eq!(b.puid.len(), PUID_LEN);
    }

    #[test]
    fn exact_key_priority_is_user_name_then_wxid_then_remark() {
        let mut map = map();
        let mut alice = obs("@alice-session-1", "Alice");
        alice.wxid = Some("alice_w".into());
        alice.remark_name = Some("Al".into());
        let first = map.resolve(&alice).unwrap().puid;

        map.reset_session();
        let mut renamed = obs("@alice-session-2", "Alice");
        renamed.wxid = Some("alice_w".into());
        let second = map.resolve(&renamed).unwrap();
        assert_eq!(second.puid, first);
        assert_eq!(second.source, MatchSource::Wxid);

        map.reset_session();
        let mut by_remark = obs("@alice-session-3", "Alice (new nick)");
        by_remark.remark_name = Some("Al".into());
        let third = map.resolve(&by_remark).unwrap();
        assert_eq!(third.puid, first);
        assert_eq!(third.source, MatchSource::RemarkName);
    }

    #[test]
    fn caption_fallback_matches_after_session_change() {
        let mut map = map();
        let mut alice = obs("@session-1-alice", "Alice");
        alice.caption = Caption::new("Alice", 2, "Zhejiang", "Hangzhou");
        let first = map.resolve(&alice).unwrap().puid;

        map.reset_session();
        let mut again = obs("@session-2-alice", "Alice");
        again.caption = Caption::new("Alice", 2, "", "Hangzhou");
        let second = map.resolve(&again).unwrap();
        assert_eq!(second.puid, first);
        assert_eq!(second.source, MatchSource::Caption);

        let stored = map.tables().captions.get_by_value(&first).unwrap();
        assert_eq!(stored.province.as_deref(), Some("Zhejiang"));
    }

    #[test]
    fn live_chats_are_not_merged_by_caption() {
        let mut map = map();
        let a = map.resolve(&obs("@first-twin-aaaa", "Twin")).unwrap();
        let b = map.resolve(&obs("@second-twin-bbbb", "Twin")).unwrap();
        assert_ne!(a.puid, b.puid);
        assert_eq!(b.source, MatchSource::Minted);
    }

    #[test]
    fn reverse_lookup_follows_latest_routing_name() {
        let mut map = map();
        let mut chat = obs("@old-routing-name", "Alice");
        chat.wxid = Some("alice_w".into());
        let puid = map.resolve(&chat).unwrap().puid;

        map.reset_session();
        chat.user_name = "@new-routing-name".into();
        map.resolve(&chat).unwrap();

        assert_eq!(map.user_name_for_puid(&puid), Some("@new-routing-name"));
        assert!(map.puid_for_user_name("@old-routing-name").is_none());
        assert_eq!(map.puid_for_user_name("filehelper"), Some("filehelper"));
    }
}
