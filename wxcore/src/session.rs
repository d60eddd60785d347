use crate::login::{LoginDetail, RouteUrls};
use crate::sync::{BaseRequest, SyncCursor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Cookies that keep push login possible after the session itself is gone.
pub const PUSH_LOGIN_COOKIES: &[&str] = &["wxuin", "webwxuvid", "webwx_auth_ticket"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session is missing `{0}`")]
    Missing(&'static str),
}

/// One authenticated web session.
///
/// Only [`SessionBuilder::build`] creates one, and it refuses to do so
/// unless every field needed to poll is present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub urls: RouteUrls,
    pub skey: String,
    pub wxsid: String,
    pub wxuin: String,
    pub pass_ticket: String,
    pub device_id: String,
    /// Millisecond timestamp taken at login; incremented on every
    /// sync check.
    pub login_time: i64,
    pub sync_cursor: SyncCursor,
    pub user_name: String,
    pub nick_name: String,
}

impl Session {
    pub fn base_request(&self) -> BaseRequest {
        BaseRequest {
            uin: self.wxuin.clone(),
            sid: self.wxsid.clone(),
            skey: self.skey.clone(),
            device_id: self.device_id.clone(),
        }
    }

    /// Returns the next `_` value for a sync check.
    pub fn next_check_stamp(&mut self) -> i64 {
        self.login_time += 1;
        self.login_time
    }
}

#[derive(Debug, Default, Clone)]
pub struct SessionBuilder {
    urls: Option<RouteUrls>,
    detail: Option<LoginDetail>,
    device_id: Option<String>,
    login_time: Option<i64>,
    sync_cursor: Option<SyncCursor>,
    user_name: Option<String>,
    nick_name: Option<String>,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn urls(mut self, urls: RouteUrls) -> Self {
        self.urls = Some(urls);
        self
    }

    pub fn detail(mut self, detail: LoginDetail) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn login_time(mut self, login_time: i64) -> Self {
        self.login_time = Some(login_time);
        self
    }

    pub fn sync_cursor(mut self, cursor: SyncCursor) -> Self {
        self.sync_cursor = Some(cursor);
        self
    }

    pub fn user(mut self, user_name: impl Into<String>, nick_name: impl Into<String>) -> Self {
        self.user_name = Some(user_name.into());
        self.nick_name = Some(nick_name.into());
        self
    }

    pub fn build(self) -> Result<Session, SessionError> {
        let urls = self.urls.ok_or(SessionError::Missing("urls"))?;
        if urls.base.is_empty() || urls.sync.is_empty() {
            return Err(SessionError::Missing("urls"));
        }
        let detail = self.detail.ok_or(SessionError::Missing("login detail"))?;
        let sync_cursor = self
            .sync_cursor
            .filter(|c| !c.is_empty())
            .ok_or(SessionError::Missing("sync cursor"))?;
        let user_name = self
            .user_name
            .filter(|u| !u.is_empty())
            .ok_or(SessionError::Missing("user name"))?;

        Ok(Session {
            urls,
            skey: detail.skey,
            wxsid: detail.wxsid,
            wxuin: detail.wxuin,
            pass_ticket: detail.pass_ticket,
            device_id: self
                .device_id
                .filter(|d| !d.is_empty())
                .ok_or(SessionError::Missing("device id"))?,
            login_time: self.login_time.ok_or(SessionError::Missing("login time"))?,
            sync_cursor,
            user_name,
            nick_name: self.nick_name.unwrap_or_default(),
        })
    }
}

/// Cookie store keyed by name. The service uses one cookie namespace per
/// session, so domains and paths are not tracked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieJar {
    cookies: BTreeMap<String, String>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.cookies.insert(name.into(), value.into());
    }

    pub fn extend(&mut self, pairs: impl IntoIterator<Item = (String, String)>) {
        self.cookies.extend(pairs);
    }

    /// Drops everything except the named cookies.
    pub fn retain_only(&mut self, keep: &[&str]) {
        self.cookies.retain(|name, _| keep.contains(&name.as_str()));
    }

    pub fn clear(&mut self) {
        self.cookies.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// `Cookie` request header value, or `None` when empty.
    pub fn header_value(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}
