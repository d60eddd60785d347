use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const LOGIN_BASE_URL: &str = "https://login.weixin.qq.com";
pub const QR_CONTENT_PREFIX: &str = "https://login.weixin.qq.com/l/";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
pub const UOS_CLIENT_VERSION: &str = "2.0.0";

const APP_ID: &str = "wx782c26e4c19acffb";
const NEW_LOGIN_PAGE: &str = "https://wx.qq.com/cgi-bin/mmwebwx-bin/webwxnewloginpage?mod=desktop";

/// Host table: the login host decides which file and push hosts serve the
/// session. Order matters, `qq.com` must come after the more specific hosts.
const ROUTE_HOSTS: &[(&str, &str, &str)] = &[
    ("wx2.qq.com", "file.wx2.qq.com", "webpush.wx2.qq.com"),
    ("wx8.qq.com", "file.wx8.qq.com", "webpush.wx8.qq.com"),
    ("qq.com", "file.wx.qq.com", "webpush.wx.qq.com"),
    ("web2.wechat.com", "file.web2.wechat.com", "webpush.web2.wechat.com"),
    ("wechat.com", "file.web.wechat.com", "webpush.web.wechat.com"),
];

static QR_UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"window\.QRLogin\.code = (\d+); window\.QRLogin\.uuid = "(\S+?)";"#)
        .expect("static regex")
});
static LOGIN_CODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"window\.code=(\d+)").expect("static regex"));
static REDIRECT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"window\.redirect_uri="(\S+)";"#).expect("static regex"));

/// Phases of one login attempt.
///
/// `LoggedOut` and `Failed` are resting states; a new attempt starts again
/// from `Unauthenticated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoginState {
    Unauthenticated,
    AwaitingScan,
    Confirmed,
    Initializing,
    Active,
    LoggedOut,
    Failed,
}

impl LoginState {
    pub fn can_transition_to(self, next: LoginState) -> bool {
        use LoginState::*;
        matches!(
            (self, next),
            (Unauthenticated, AwaitingScan)
                | (Unauthenticated, Initializing)
                | (AwaitingScan, Confirmed)
                | (AwaitingScan, Initializing)
                | (Confirmed, AwaitingScan)
                | (Confirmed, Initializing)
                | (Initializing, Active)
                | (Active, LoggedOut)
                | (LoggedOut, Unauthenticated)
                | (Failed, Unauthenticated)
                | (AwaitingScan | Confirmed | Initializing, Failed)
                | (AwaitingScan | Confirmed | Initializing | Active, Unauthenticated)
        )
    }
}

impl fmt::Display for LoginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Status of a handshake id as reported by the login poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeStatus {
    /// Fresh code, nothing happened yet.
    Waiting,
    /// The code expired, a new one must be issued.
    Expired,
    /// Scanned on the phone, waiting for the user to confirm.
    Scanned,
    /// Confirmed; the response carries the redirect to the login detail.
    Confirmed,
    Failed(u16),
}

impl HandshakeStatus {
    pub fn from_code(code: u16) -> Self {
        match code {
            0 => HandshakeStatus::Waiting,
            408 => HandshakeStatus::Expired,
            201 => HandshakeStatus::Scanned,
            200 => HandshakeStatus::Confirmed,
            other => HandshakeStatus::Failed(other),
        }
    }

    pub fn code(self) -> u16 {
        match self {
            HandshakeStatus::Waiting => 0,
            HandshakeStatus::Expired => 408,
            HandshakeStatus::Scanned => 201,
            HandshakeStatus::Confirmed => 200,
            HandshakeStatus::Failed(code) => code,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoginDetailError {
    #[error("login detail rejected by server (ret={ret}): {message}")]
    Rejected { ret: i64, message: String },
    #[error("login detail is missing `{0}`")]
    MissingField(&'static str),
    #[error("login detail is not valid XML: {0}")]
    Malformed(String),
}

/// The `<error>` document returned by the login redirect.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LoginDetailXml {
    ret: Option<String>,
    message: Option<String>,
    skey: Option<String>,
    wxsid: Option<String>,
    wxuin: Option<String>,
    pass_ticket: Option<String>,
}

/// Secrets extracted from the login redirect response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginDetail {
    pub skey: String,
    pub wxsid: String,
    pub wxuin: String,
    pub pass_ticket: String,
}

impl LoginDetail {
    /// Parses the XML body of the redirect response. `wxsid` and `wxuin`
    /// fall back to cookie values when absent from the body.
    pub fn parse(
        body: &str,
        cookie: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, LoginDetailError> {
        let xml: LoginDetailXml = quick_xml::de::from_str(body)
            .map_err(|e| LoginDetailError::Malformed(e.to_string()))?;
        if let Some(ret) = xml.ret.as_deref().and_then(|r| r.trim().parse::<i64>().ok())
            && ret != 0
        {
            return Err(LoginDetailError::Rejected {
                ret,
                message: xml.message.unwrap_or_default(),
            });
        }

        let required = |name: &'static str, value: Option<String>| {
            value
                .filter(|v| !v.is_empty())
                .ok_or(LoginDetailError::MissingField(name))
        };

        Ok(Self {
            skey: required("skey", xml.skey)?,
            wxsid: required("wxsid", xml.wxsid.or_else(|| cookie("wxsid")))?,
            wxuin: required("wxuin", xml.wxuin.or_else(|| cookie("wxuin")))?,
            pass_ticket: required("pass_ticket", xml.pass_ticket)?,
        })
    }
}

/// Server-assigned URLs for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteUrls {
    /// Base for API calls, e.g. `https://wx2.qq.com/cgi-bin/mmwebwx-bin`.
    pub base: String,
    pub file: String,
    pub sync: String,
}

impl RouteUrls {
    pub fn from_redirect(redirect: &str) -> Self {
        let base = match redirect.rfind('/') {
            Some(i) => redirect[..i].to_string(),
            None => redirect.to_string(),
        };
        for (index_host, file_host, sync_host) in ROUTE_HOSTS {
            if base.contains(index_host) {
                return Self {
                    file: format!("https://{file_host}/cgi-bin/mmwebwx-bin"),
                    sync: format!("https://{sync_host}/cgi-bin/mmwebwx-bin"),
                    base,
                };
            }
        }
        Self {
            file: base.clone(),
            sync: base.clone(),
            base,
        }
    }
}

#[derive(Deserialize)]
struct PushLoginResponse {
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    ret: serde_json::Value,
}

/// Platform-independent helpers for the QR handshake.
pub struct LoginUtils;

impl LoginUtils {
    pub fn handshake_url() -> String {
        format!(
            "{LOGIN_BASE_URL}/jslogin?appid={APP_ID}&fun=new&redirect_uri={}&lang=zh_CN",
            urlencoding::encode(NEW_LOGIN_PAGE)
        )
    }

    /// Login poll URL. `now` is the current unix time in seconds.
    pub fn check_url(handshake_id: &str, now: i64) -> String {
        format!(
            "{LOGIN_BASE_URL}/cgi-bin/mmwebwx-bin/login?loginicon=true&uuid={}&tip=1&r={}&_={}",
            urlencoding::encode(handshake_id),
            -now / 1579,
            now
        )
    }

    pub fn push_login_url(uin: &str) -> String {
        format!(
            "{LOGIN_BASE_URL}/cgi-bin/mmwebwx-bin/webwxpushloginurl?uin={}",
            urlencoding::encode(uin)
        )
    }

    /// What the QR code encodes for a handshake id.
    pub fn qr_content(handshake_id: &str) -> String {
        format!("{QR_CONTENT_PREFIX}{handshake_id}")
    }

    /// Extracts the handshake id; only a `200` code carries a usable one.
    pub fn parse_handshake_id(body: &str) -> Option<String> {
        let caps = QR_UUID_RE.captures(body)?;
        if &caps[1] == "200" {
            Some(caps[2].to_string())
        } else {
            None
        }
    }

    /// Login poll result. A body without a code reads as status 400.
    pub fn parse_status(body: &str) -> HandshakeStatus {
        let code = LOGIN_CODE_RE
            .captures(body)
            .and_then(|c| c[1].parse::<u16>().ok())
            .unwrap_or(400);
        HandshakeStatus::from_code(code)
    }

    pub fn parse_redirect_uri(body: &str) -> Option<String> {
        REDIRECT_RE.captures(body).map(|c| c[1].to_string())
    }

    /// Handshake id from a push-login answer, if the push was accepted.
    pub fn parse_push_login(body: &str) -> Option<String> {
        let resp: PushLoginResponse = serde_json::from_str(body).ok()?;
        let accepted = match &resp.ret {
            serde_json::Value::Number(n) => n.as_i64() == Some(0),
            serde_json::Value::String(s) => s == "0",
            _ => false,
        };
        if accepted { resp.uuid } else { None }
    }

    /// `e` followed by 15 random digits.
    pub fn generate_device_id() -> String {
        let n: u64 = rand::rng().random_range(0..1_000_000_000_000_000);
        format!("e{n:015}")
    }
}
