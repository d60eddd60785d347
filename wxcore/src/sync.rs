use crate::types::contact::RawContact;
use crate::types::message::RawMessage;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static SYNC_CHECK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"window\.synccheck=\{retcode:"(\d+)",selector:"(\d+)"\}"#).expect("static regex")
});

/// One `Key`/`Val` pair of a sync key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SyncKeyItem {
    pub key: u32,
    pub val: u64,
}

/// The server's progress token, sent back verbatim on the next sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SyncKey {
    pub count: u32,
    pub list: Vec<SyncKeyItem>,
}

impl SyncKey {
    /// `Key_Val|Key_Val|...`, the form the sync-check endpoint expects.
    pub fn to_query_string(&self) -> String {
        self.list
            .iter()
            .map(|item| format!("{}_{}", item.key, item.val))
            .collect::<Vec<_>>()
            .join("|")
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

/// Sync cursor: the key replayed to `webwxsync` plus the string form used
/// by `synccheck`. The two can differ; the service returns them separately.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub key: SyncKey,
    pub check: String,
}

impl SyncCursor {
    /// Cursor right after `webwxinit`, where both forms come from one key.
    pub fn from_init(key: SyncKey) -> Self {
        let check = key.to_query_string();
        Self { key, check }
    }

    /// Cursor after a `webwxsync` batch.
    pub fn from_sync(key: SyncKey, check_key: &SyncKey) -> Self {
        let check = if check_key.is_empty() {
            key.to_query_string()
        } else {
            check_key.to_query_string()
        };
        Self { key, check }
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }
}

/// Classification of one sync-check answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSignal {
    /// Nothing new, poll again.
    Idle,
    /// Something changed; `selector` hints what.
    Changed { selector: u32 },
    /// Session is gone (logged out elsewhere, expired, kicked).
    Dead { retcode: u32 },
}

impl SyncSignal {
    /// Parses a sync-check body. An empty body is the service's keep-alive
    /// and reads as idle. A body without the expected marker is dead.
    pub fn parse(body: &str) -> Self {
        if body.trim().is_empty() {
            return SyncSignal::Idle;
        }
        let Some(caps) = SYNC_CHECK_RE.captures(body) else {
            return SyncSignal::Dead { retcode: u32::MAX };
        };
        let retcode = caps[1].parse::<u32>().unwrap_or(u32::MAX);
        let selector = caps[2].parse::<u32>().unwrap_or(0);
        match (retcode, selector) {
            (0, 0) => SyncSignal::Idle,
            (0, selector) => SyncSignal::Changed { selector },
            (retcode, _) => SyncSignal::Dead { retcode },
        }
    }
}

/// Credentials block sent with every JSON API call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BaseRequest {
    pub uin: String,
    pub sid: String,
    pub skey: String,
    #[serde(rename = "DeviceID")]
    pub device_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct BaseResponse {
    pub ret: i64,
    pub err_msg: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct InitResponse {
    pub base_response: BaseResponse,
    pub user: RawContact,
    pub sync_key: SyncKey,
    pub contact_list: Vec<RawContact>,
    pub chat_set: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SyncResponse {
    pub base_response: BaseResponse,
    pub add_msg_count: u32,
    pub add_msg_list: Vec<RawMessage>,
    pub mod_contact_count: u32,
    pub mod_contact_list: Vec<RawContact>,
    pub del_contact_count: u32,
    pub del_contact_list: Vec<RawContact>,
    pub sync_key: SyncKey,
    pub sync_check_key: SyncKey,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct StatusNotifyResponse {
    pub base_response: BaseResponse,
    #[serde(rename = "MsgID")]
    pub msg_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InitRequest<'a> {
    pub base_request: &'a BaseRequest,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusNotifyRequest<'a> {
    pub base_request: &'a BaseRequest,
    pub code: u32,
    pub from_user_name: &'a str,
    pub to_user_name: &'a str,
    pub client_msg_id: i64,
}

#[derive(Serialize)]
pub struct SyncRequest<'a> {
    #[serde(rename = "BaseRequest")]
    pub base_request: &'a BaseRequest,
    #[serde(rename = "SyncKey")]
    pub sync_key: &'a SyncKey,
    pub rr: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_signal_classification() {
        assert_eq!(
            SyncSignal::parse(r#"window.synccheck={retcode:"0",selector:"0"}"#),
            SyncSignal::Idle
        );
        assert_eq!(
            SyncSignal::parse(r#"window.synccheck={retcode:"0",selector:"2"}"#),
            SyncSignal::Changed { selector: 2 }
        );
        assert_eq!(
            SyncSignal::parse(r#"window.synccheck={retcode:"1101",selector:"0"}"#),
            SyncSignal::Dead { retcode: 1101 }
        );
        assert_eq!(SyncSignal::parse(""), SyncSignal::Idle);
        assert_eq!(SyncSignal::parse("  \n"), SyncSignal::Idle);
        assert!(matches!(
            SyncSignal::parse("<html>gateway error</html>"),
            SyncSignal::Dead { .. }
        ));
    }

    #[test]
    fn cursor_uses_check_key_when_present() {
        let key = SyncKey {
            count: 2,
            list: vec![
                SyncKeyItem { key: 1, val: 100 },
                SyncKeyItem { key: 2, val: 200 },
            ],
        };
        assert_eq!(SyncCursor::from_init(key.clone()).check, "1_100|2_200");

        let check = SyncKey {
            count: 1,
            list: vec![SyncKeyItem { key: 1, val: 101 }],
        };
        let cursor = SyncCursor::from_sync(key.clone(), &check);
        assert_eq!(cursor.key, key);
        assert_eq!(cursor.check, "1_101");
    }

    #[test]
    fn sync_response_deserializes() {
        let json = r#"{
            "BaseResponse": {"Ret": 0, "ErrMsg": ""},
            "AddMsgCount": 1,
            "AddMsgList": [{"MsgId": "123", "FromUserName": "@a", "ToUserName": "@b",
                            "MsgType": 1, "Content": "hi", "CreateTime": 1700000000}],
            "ModContactCount": 0,
            "ModContactList": [],
            "SyncKey": {"Count": 1, "List": [{"Key": 1, "Val": 5}]},
            "SyncCheckKey": {"Count": 1, "List": [{"Key": 1, "Val": 5}]},
            "ContinueFlag": 0
        }"#;
        let resp: SyncResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.add_msg_list.len(), 1);
        assert_eq!(resp.add_msg_list[0].content, "hi");
        assert_eq!(resp.sync_key.to_query_string(), "1_5");
    }

    #[test]
    fn base_request_serializes_device_id_field() {
        let req = BaseRequest {
            uin: "1".into(),
            sid: "s".into(),
            skey: "k".into(),
            device_id: "e123".into(),
        };
        let json = serde_json::to_string(&InitRequest { base_request: &req }).unwrap();
        assert_eq!(
            json,
            r#"{"BaseRequest":{"Uin":"1","Sid":"s","Skey":"k","DeviceID":"e123"}}"#
        );
    }
}
