use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{error, info};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::ingest::{self, Extracted, Ingest, IngestReport, Sink, Tally};
use crate::telegram;

/// Peer part of a scraped document; the loader reads `peer_id.channel_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerId {
    pub channel_id: i64,
}

/// JSON document written for every scraped message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: i32,
    pub peer_id: PeerId,
    pub channel_username: String,
    pub date: DateTime<Utc>,
    pub message: String,
    pub views: Option<i32>,
    pub forwards: Option<i32>,
    pub edit_date: Option<DateTime<Utc>>,
    pub post_author: Option<String>,
    pub has_photo: bool,
}

/// A message plus a handle to its photo, if it has one.
#[derive(Debug, Clone)]
pub struct ScrapedPost<P> {
    pub record: MessageRecord,
    pub photo: Option<P>,
}

/// Downloads a photo handle to a local file.
#[async_trait]
pub trait PhotoFetcher: Send + Sync {
    type Photo: Clone + Send + Sync;

    async fn fetch(&self, photo: &Self::Photo, dest: &Path) -> Result<()>;
}

/// A channel's history, newest first, handed out a page at a time.
#[async_trait]
pub trait PostSource: Send {
    type Photo: Clone + Send + Sync;

    /// Next page of posts; an empty page means the history is exhausted.
    async fn next_page(&mut self) -> Result<Vec<ScrapedPost<Self::Photo>>>;
}

/// Date/channel partitioned file tree under the data directory.
#[derive(Debug, Clone)]
pub struct Archive {
    messages_root: PathBuf,
    images_root: PathBuf,
}

impl Archive {
    pub fn new(messages_root: impl Into<PathBuf>, images_root: impl Into<PathBuf>) -> Self {
        Archive {
            messages_root: messages_root.into(),
            images_root: images_root.into(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Archive::new(settings.messages_dir(), settings.images_dir())
    }

    pub async fn create_roots(&self) -> Result<()> {
        for root in [&self.messages_root, &self.images_root] {
            fs::create_dir_all(root).await.map_err(|e| Error::io(root, e))?;
        }
        Ok(())
    }

    /// `<messages_root>/<YYYY-MM-DD>/<channel>/<message_id>.json`
    pub fn message_path(&self, record: &MessageRecord) -> PathBuf {
        self.messages_root
            .join(record.date.format("%Y-%m-%d").to_string())
            .join(&record.channel_username)
            .join(format!("{}.json", record.id))
    }

    /// `<images_root>/<YYYY-MM-DD>/<message_id>.jpg`
    pub fn image_path(&self, record: &MessageRecord) -> PathBuf {
        self.images_root
            .join(record.date.format("%Y-%m-%d").to_string())
            .join(format!("{}.jpg", record.id))
    }
}

/// What gets written to the archive for one message.
pub struct ArchiveEntry<P> {
    json_path: PathBuf,
    json: Vec<u8>,
    image: Option<(PathBuf, P)>,
}

/// Maps scraped posts onto archive entries; a post is done once its JSON and
/// (if any) its photo exist on disk.
pub struct ScrapeJob<'a, P> {
    archive: &'a Archive,
    _photo: PhantomData<fn() -> P>,
}

impl<'a, P> ScrapeJob<'a, P> {
    pub fn new(archive: &'a Archive) -> Self {
        ScrapeJob {
            archive,
            _photo: PhantomData,
        }
    }
}

#[async_trait]
impl<P: Clone + Send + Sync> Ingest for ScrapeJob<'_, P> {
    type Item = ScrapedPost<P>;
    type Row = ArchiveEntry<P>;

    fn natural_key(&self, item: &ScrapedPost<P>) -> String {
        self.archive
            .message_path(&item.record)
            .to_string_lossy()
            .into_owned()
    }

    fn already_done(&self, item: &ScrapedPost<P>, key: &str) -> bool {
        let image_done = item.photo.is_none() || self.archive.image_path(&item.record).exists();
        image_done && Path::new(key).exists()
    }

    async fn build(&mut self, item: &ScrapedPost<P>) -> Result<Extracted<ArchiveEntry<P>>> {
        let json_path = self.archive.message_path(&item.record);
        let json = serde_json::to_vec_pretty(&item.record).map_err(|e| Error::Json {
            path: json_path.clone(),
            source: e,
        })?;
        let image = item
            .photo
            .clone()
            .map(|photo| (self.archive.image_path(&item.record), photo));
        Ok(Extracted::Rows(vec![ArchiveEntry {
            json_path,
            json,
            image,
        }]))
    }
}

/// Writes message JSON with create-new semantics and downloads missing photos.
/// A failed download is logged and left for the next run; the message itself
/// still counts.
pub struct ArchiveSink<'f, F: PhotoFetcher> {
    fetcher: &'f F,
    pub new_images: usize,
    pub failed_images: usize,
}

impl<'f, F: PhotoFetcher> ArchiveSink<'f, F> {
    pub fn new(fetcher: &'f F) -> Self {
        ArchiveSink {
            fetcher,
            new_images: 0,
            failed_images: 0,
        }
    }

    async fn download(&self, photo: &F::Photo, image_path: &Path) -> Result<()> {
        if let Some(parent) = image_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(parent, e))?;
        }
        // download next to the target so a partial file never looks complete
        let partial = image_path.with_extension("jpg.part");
        if let Err(e) = self.fetcher.fetch(photo, &partial).await {
            let _ = fs::remove_file(&partial).await;
            return Err(e);
        }
        fs::rename(&partial, image_path)
            .await
            .map_err(|e| Error::io(image_path, e))
    }
}

async fn write_new_file(path: &Path, contents: &[u8]) -> Result<bool> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io(parent, e))?;
    }
    let mut file = match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
    {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(Error::io(path, e)),
    };
    file.write_all(contents)
        .await
        .map_err(|e| Error::io(path, e))?;
    file.flush().await.map_err(|e| Error::io(path, e))?;
    Ok(true)
}

#[async_trait]
impl<F: PhotoFetcher> Sink<ArchiveEntry<F::Photo>> for ArchiveSink<'_, F> {
    async fn store(&mut self, _key: &str, rows: Vec<ArchiveEntry<F::Photo>>) -> Result<Tally> {
        let mut tally = Tally::default();
        for entry in rows {
            tally += if write_new_file(&entry.json_path, &entry.json).await? {
                Tally::inserted()
            } else {
                Tally::duplicate()
            };

            let Some((image_path, photo)) = entry.image else {
                continue;
            };
            if fs::try_exists(&image_path).await.unwrap_or(false) {
                continue;
            }
            match self.download(&photo, &image_path).await {
                Ok(()) => self.new_images += 1,
                Err(e) => {
                    error!("Failed to download {}: {}", image_path.display(), e);
                    self.failed_images += 1;
                }
            }
        }
        Ok(tally)
    }
}

/// Outcome of archiving one channel.
#[derive(Debug, Default)]
pub struct ChannelScrape {
    pub report: IngestReport,
    pub new_images: usize,
    pub failed_images: usize,
    /// Set when paging stopped early; everything fetched before it is archived.
    pub error: Option<Error>,
}

/// Archive a channel page by page, so posts fetched before a paging error
/// are kept on disk.
pub async fn scrape_channel<F, S>(
    label: &str,
    archive: &Archive,
    fetcher: &F,
    source: &mut S,
) -> ChannelScrape
where
    F: PhotoFetcher,
    S: PostSource<Photo = F::Photo>,
{
    let mut job = ScrapeJob::new(archive);
    let mut sink = ArchiveSink::new(fetcher);
    let mut outcome = ChannelScrape::default();
    loop {
        let page = match source.next_page().await {
            Ok(page) if page.is_empty() => break,
            Ok(page) => page,
            Err(e) => {
                outcome.error = Some(e);
                break;
            }
        };
        outcome.report += &ingest::run(label, page, &mut job, &mut sink).await;
    }
    outcome.new_images = sink.new_images;
    outcome.failed_images = sink.failed_images;
    outcome
}

/// Scrape every configured channel, strictly one after another.
pub async fn scrape_channels(settings: &Settings) -> Result<Vec<(String, IngestReport)>> {
    let archive = Archive::from_settings(settings);
    archive.create_roots().await?;

    let client = telegram::connect(&settings.telegram).await?;
    if !telegram::is_authorized(&client).await? {
        return Err(Error::Unauthorized);
    }

    let fetcher = telegram::MediaFetcher::new(&client);
    let mut reports = Vec::new();
    for channel in &settings.telegram.channels {
        info!("--- Starting scrape for channel: {} ---", channel);
        let mut history =
            match telegram::open_channel(&client, channel, settings.telegram.scrape_limit).await {
                Ok(history) => history,
                Err(e) => {
                    error!("An error occurred while scraping {}: {}", channel, e);
                    continue;
                }
            };
        let outcome = scrape_channel(channel, &archive, &fetcher, &mut history).await;
        if let Some(e) = &outcome.error {
            error!(
                "An error occurred while scraping {}, kept {} messages fetched before it: {}",
                channel, outcome.report.seen, e
            );
        }
        info!(
            "Finished scraping {}. New messages: {}, new images: {}, failed images: {}",
            channel, outcome.report.inserted, outcome.new_images, outcome.failed_images
        );
        reports.push((channel.clone(), outcome.report));
    }
    Ok(reports)
}
