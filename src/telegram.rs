use std::io::{self, BufRead, Write};
use std::path::Path;

use async_trait::async_trait;
use grammers_client::session::Session;
use grammers_client::types::{Chat, Downloadable, Media, Message};
use grammers_client::{Client, Config, SignInError};
use log::{info, warn};

use crate::config::TelegramSettings;
use crate::error::{Error, Result};
use crate::scraper::{MessageRecord, PeerId, PhotoFetcher, PostSource, ScrapedPost};

fn tg_err(e: impl std::fmt::Display) -> Error {
    Error::Telegram(e.to_string())
}

/// Connect to Telegram using the session file named in the settings.
pub async fn connect(settings: &TelegramSettings) -> Result<Client> {
    let api_id = settings
        .api_id
        .ok_or_else(|| Error::Config("TELEGRAM_APP_ID is not set".into()))?;
    let api_hash = settings
        .api_hash
        .clone()
        .ok_or_else(|| Error::Config("TELEGRAM_APP_HASH is not set".into()))?;

    let session = Session::load_file_or_create(&settings.session_file)
        .map_err(|e| Error::io(&settings.session_file, e))?;
    let client = Client::connect(Config {
        session,
        api_id,
        api_hash,
        params: Default::default(),
    })
    .await
    .map_err(tg_err)?;
    info!("Connected to Telegram.");
    Ok(client)
}

pub async fn is_authorized(client: &Client) -> Result<bool> {
    client.is_authorized().await.map_err(tg_err)
}

/// Interactive first-time login. Saves the session so scheduled runs can reuse it.
pub async fn login(settings: &TelegramSettings) -> Result<()> {
    let client = connect(settings).await?;
    if is_authorized(&client).await? {
        println!("Session is already authorized.");
        return Ok(());
    }

    println!("First-time login: please enter your Telegram credentials.");
    let phone = prompt("Enter your phone number (international format): ")?;
    let token = client
        .request_login_code(phone.trim())
        .await
        .map_err(tg_err)?;
    let code = prompt("Enter the login code you received: ")?;
    match client.sign_in(&token, code.trim()).await {
        Err(SignInError::PasswordRequired(password_token)) => {
            // Two-factor authentication (password) is enabled
            let hint = password_token.hint().unwrap_or("none").to_string();
            let password = prompt(&format!("Enter your password (hint: {}): ", hint))?;
            client
                .check_password(password_token, password.trim())
                .await
                .map_err(tg_err)?;
        }
        Err(e) => return Err(Error::Telegram(format!("login failed: {}", e))),
        Ok(_) => {}
    }
    println!("Logged in to Telegram successfully.");

    client
        .session()
        .save_to_file(&settings.session_file)
        .map_err(|e| Error::io(&settings.session_file, e))?;
    Ok(())
}

/// Prompt user for input on the console.
fn prompt(message: &str) -> Result<String> {
    let console = Path::new("<stdin>");
    let mut stdout = io::stdout();
    write!(stdout, "{}", message).map_err(|e| Error::io(console, e))?;
    stdout.flush().map_err(|e| Error::io(console, e))?;
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|e| Error::io(console, e))?;
    Ok(line)
}

/// Messages requested from Telegram per page.
const PAGE_SIZE: usize = 100;

/// Most recent messages of one channel, paged newest first.
pub struct ChannelHistory<'c> {
    client: &'c Client,
    chat: Chat,
    username: String,
    remaining: usize,
    offset_id: Option<i32>,
    pending_error: Option<Error>,
}

/// Resolve a public channel and prepare to read up to `limit` of its messages.
pub async fn open_channel<'c>(
    client: &'c Client,
    username: &str,
    limit: usize,
) -> Result<ChannelHistory<'c>> {
    let chat = client
        .resolve_username(username)
        .await
        .map_err(tg_err)?
        .ok_or_else(|| Error::Telegram(format!("channel @{} could not be resolved", username)))?;
    if !matches!(chat, Chat::Channel(_)) {
        warn!("@{} is not a channel, scraping it anyway", username);
    }
    Ok(ChannelHistory {
        client,
        chat,
        username: username.to_string(),
        remaining: limit,
        offset_id: None,
        pending_error: None,
    })
}

#[async_trait]
impl PostSource for ChannelHistory<'_> {
    type Photo = Media;

    async fn next_page(&mut self) -> Result<Vec<ScrapedPost<Media>>> {
        // messages read before a failure were returned last time
        if let Some(e) = self.pending_error.take() {
            return Err(e);
        }
        let size = self.remaining.min(PAGE_SIZE);
        let mut page = Vec::with_capacity(size);
        if size == 0 {
            return Ok(page);
        }

        let mut messages = self.client.iter_messages(self.chat.pack()).limit(size);
        if let Some(id) = self.offset_id {
            messages = messages.offset_id(id);
        }
        loop {
            match messages.next().await {
                Ok(Some(message)) => {
                    page.push(scraped_post(&self.chat, &self.username, &message))
                }
                Ok(None) => break,
                Err(e) if page.is_empty() => return Err(tg_err(e)),
                Err(e) => {
                    self.pending_error = Some(tg_err(e));
                    break;
                }
            }
        }

        // a short page means the history ran out
        self.remaining = if page.len() < size {
            0
        } else {
            self.remaining - page.len()
        };
        if let Some(last) = page.last() {
            self.offset_id = Some(last.record.id);
        }
        Ok(page)
    }
}

fn scraped_post(chat: &Chat, username: &str, message: &Message) -> ScrapedPost<Media> {
    let photo = match message.media() {
        Some(media @ Media::Photo(_)) => Some(media),
        _ => None,
    };
    ScrapedPost {
        record: MessageRecord {
            id: message.id(),
            peer_id: PeerId {
                channel_id: chat.id(),
            },
            channel_username: username.to_string(),
            date: message.date(),
            message: message.text().to_string(),
            views: message.view_count(),
            forwards: message.forward_count(),
            edit_date: message.edit_date(),
            post_author: message.post_author().map(String::from),
            has_photo: photo.is_some(),
        },
        photo,
    }
}

/// Downloads message photos through the connected client.
pub struct MediaFetcher<'c> {
    client: &'c Client,
}

impl<'c> MediaFetcher<'c> {
    pub fn new(client: &'c Client) -> Self {
        MediaFetcher { client }
    }
}

#[async_trait]
impl PhotoFetcher for MediaFetcher<'_> {
    type Photo = Media;

    async fn fetch(&self, photo: &Media, dest: &Path) -> Result<()> {
        self.client
            .download_media(&Downloadable::Media(photo.clone()), dest)
            .await
            .map_err(|e| Error::io(dest, e))
    }
}
