use chrono::Local;
use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use wechat_web::bot::Bot;
use wechat_web::client::Client;
use wechat_web::config::ClientConfig;
use wechat_web::handlers::MessageHandler;
use wechat_web::qrcode::render_terminal;
use wxcore::types::events::Event;
use wxcore::types::{MessageKind, NormalizedMessage};

// Demo client: logs in (QR on the console), then logs incoming messages.
//
// Usage:
//   cargo run
//   cargo run -- --session-path state/session.bin --puid-path state/puid.bin
//   cargo run -- --puid-log puid.log --no-push-login

#[derive(Parser, Debug)]
#[command(about = "Log in to the web chat service and print incoming messages")]
struct Args {
    /// Session snapshot used to resume without scanning again.
    #[arg(long, default_value = "wechat_session.bin")]
    session_path: PathBuf,
    /// Durable chat id store.
    #[arg(long, default_value = "wechat_puid.bin")]
    puid_path: PathBuf,
    /// Optional log of every chat id decision.
    #[arg(long)]
    puid_log: Option<PathBuf>,
    /// Always show a QR code instead of prompting the phone.
    #[arg(long)]
    no_push_login: bool,
}

struct TextLogger;

#[async_trait::async_trait]
impl MessageHandler for TextLogger {
    fn kind(&self) -> MessageKind {
        MessageKind::Text
    }

    async fn handle(&self, _client: Arc<Client>, message: &NormalizedMessage) -> bool {
        let puid = message.chat.puid.as_deref().unwrap_or("-");
        info!(
            "[{}|{}] {}: {}",
            message.chat.display_name, puid, message.author.display_name, message.text
        );
        true
    }
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    rt.block_on(async {
        let mut config = ClientConfig::default()
            .with_session_path(args.session_path)
            .with_puid_path(args.puid_path)
            .with_push_login(!args.no_push_login);
        if let Some(log_path) = args.puid_log {
            config = config.with_puid_log_path(log_path);
        }

        let mut bot = match Bot::builder()
            .with_config(config)
            .with_message_handler(TextLogger)
            .on_event(|event, _client| async move {
                match event {
                    Event::LoginStatus(status) => match (status.status, &status.qr_content) {
                        (0 | 408, Some(content)) => match render_terminal(content) {
                            Ok(qr) => println!("\nScan this QR code with the phone app:\n{qr}"),
                            Err(e) => error!("Cannot render QR code: {e}"),
                        },
                        (0, None) => info!("Login request sent to the phone, please confirm there."),
                        (201, _) => info!("Scanned. Please confirm the login on your phone."),
                        (200, _) => info!("Login confirmed."),
                        (code, _) => warn!("Unexpected login status {code}"),
                    },
                    Event::LoggedIn(logged_in) => {
                        info!("Logged in as {} ({})", logged_in.nick_name, logged_in.user_name);
                    }
                    Event::LoggedOut(logged_out) => {
                        warn!("Logged out: {}. Restart to log in again.", logged_out.reason);
                    }
                    Event::Message(message) if message.kind != MessageKind::Text => {
                        info!(
                            "[{}] {} sent a {} message",
                            message.chat.display_name, message.author.display_name, message.kind
                        );
                    }
                    _ => {}
                }
            })
            .build()
            .await
        {
            Ok(bot) => bot,
            Err(e) => {
                error!("Failed to build bot: {e}");
                return;
            }
        };

        let client = bot.client();
        if let Err(e) = bot.run().await {
            error!("Bot failed to start: {e}");
            return;
        }

        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for Ctrl-C: {e}");
        }
        info!("Ctrl-C received, saving state...");
        if let Err(e) = client.shutdown().await {
            error!("Failed to save state: {e}");
        }
    });
}
