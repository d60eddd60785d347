use std::path::PathBuf;
use std::time::Duration;
use wxcore::login::DEFAULT_USER_AGENT;
use wxcore::types::SystemAccounts;

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Session snapshot file. `None` disables session persistence.
    pub session_path: Option<PathBuf>,
    /// Identity store file. `None` keeps PUIDs in memory only.
    pub puid_path: Option<PathBuf>,
    /// Optional rotating log of every identity resolution.
    pub puid_log_path: Option<PathBuf>,

    /// Consecutive failed sync iterations tolerated before giving up.
    pub receiving_retry_count: u32,
    pub retry_delay: Duration,
    /// Read timeout for the sync-check long poll.
    pub long_poll_timeout: Duration,
    pub request_timeout: Duration,

    pub login_poll_interval: Duration,
    /// Consecutive network failures tolerated while polling the handshake.
    pub login_retry_count: u32,

    pub puid_dump_delay: Duration,
    pub session_save_delay: Duration,
    /// A snapshot younger than this is retried before being discarded on
    /// re-authentication.
    pub reauth_cool_down: Duration,

    pub enable_push_login: bool,
    pub user_agent: String,
    /// Value of the `extspam` header some accounts need for web login.
    pub uos_extspam: Option<String>,
    pub system_accounts: SystemAccounts,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            session_path: None,
            puid_path: None,
            puid_log_path: None,
            receiving_retry_count: 5,
            retry_delay: Duration::from_secs(1),
            long_poll_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
            login_poll_interval: Duration::from_secs(1),
            login_retry_count: 5,
            puid_dump_delay: Duration::from_secs(30),
            session_save_delay: Duration::from_secs(5),
            reauth_cool_down: Duration::from_secs(300),
            enable_push_login: true,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            uos_extspam: None,
            system_accounts: SystemAccounts::default(),
        }
    }
}

impl ClientConfig {
    pub fn with_session_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.session_path = Some(path.into());
        self
    }

    pub fn with_puid_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.puid_path = Some(path.into());
        self
    }

    pub fn with_puid_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.puid_log_path = Some(path.into());
        self
    }

    pub fn with_receiving_retry_count(mut self, count: u32) -> Self {
        self.receiving_retry_count = count;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_long_poll_timeout(mut self, timeout: Duration) -> Self {
        self.long_poll_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_login_poll_interval(mut self, interval: Duration) -> Self {
        self.login_poll_interval = interval;
        self
    }

    pub fn with_login_retry_count(mut self, count: u32) -> Self {
        self.login_retry_count = count;
        self
    }

    pub fn with_puid_dump_delay(mut self, delay: Duration) -> Self {
        self.puid_dump_delay = delay;
        self
    }

    pub fn with_session_save_delay(mut self, delay: Duration) -> Self {
        self.session_save_delay = delay;
        self
    }

    pub fn with_reauth_cool_down(mut self, cool_down: Duration) -> Self {
        self.reauth_cool_down = cool_down;
        self
    }

    pub fn with_push_login(mut self, enabled: bool) -> Self {
        self.enable_push_login = enabled;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_uos_extspam(mut self, extspam: impl Into<String>) -> Self {
        self.uos_extspam = Some(extspam.into());
        self
    }

    pub fn with_system_accounts(mut self, accounts: SystemAccounts) -> Self {
        self.system_accounts = accounts;
        self
    }
}
