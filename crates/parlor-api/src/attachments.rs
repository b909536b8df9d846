use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use axum::http::Uri;
use bytes::Bytes;
use chrono::Utc;
use futures_util::{Stream, StreamExt};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use parlor_types::models::RoomSettings;

use crate::error::ChatError;

/// Public URL prefix attachments are served under.
pub const URL_PREFIX: &str = "/api/chat/images";
/// Bytes inspected to detect an image's real type.
pub const SNIFF_LEN: usize = 512;
/// Fixed cap for text attachments.
pub const TEXT_MAX_BYTES: u64 = 1024 * 1024;

const IMAGE_TYPES: &[(&str, &str)] = &[
    ("image/png", ".png"),
    ("image/jpeg", ".jpg"),
    ("image/gif", ".gif"),
    ("image/webp", ".webp"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Image,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAttachment {
    pub url: String,
    pub bytes: u64,
    pub content_type: String,
    /// Stored name: 32 hex chars plus extension.
    pub file_name: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneReport {
    pub removed_files: usize,
    pub freed_bytes: u64,
    pub remaining_bytes: u64,
}

/// Date-partitioned attachment tree: `<root>/<YYYYMMDD>/<32 hex><ext>`.
pub struct AttachmentStore {
    root: PathBuf,
}

impl AttachmentStore {
    pub async fn new(root: PathBuf) -> anyhow::Result<Self> {
        fs::create_dir_all(&root).await?;
        info!("Attachment directory: {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stream `body` into the tree, enforcing `limit` as bytes arrive.
    ///
    /// Images are typed by their leading bytes; the declared type and file
    /// name are ignored. Text must be valid UTF-8 as a whole.
    pub async fn store<S, E>(
        &self,
        kind: AttachmentKind,
        body: S,
        limit: u64,
    ) -> Result<StoredAttachment, ChatError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        let mut body = std::pin::pin!(body);

        // Buffer until we can sniff (or, for text, until the end).
        let mut head: Vec<u8> = Vec::new();
        let mut exhausted = false;
        while kind == AttachmentKind::Text || head.len() < SNIFF_LEN {
            match body.next().await {
                Some(chunk) => {
                    let chunk = chunk.map_err(|e| {
                        debug!("Attachment body stream failed: {}", e);
                        ChatError::InvalidRequest
                    })?;
                    head.extend_from_slice(&chunk);
                    if head.len() as u64 > limit {
                        return Err(ChatError::AttachmentTooLarge { limit });
                    }
                }
                None => {
                    exhausted = true;
                    break;
                }
            }
        }

        if head.is_empty() {
            return Err(ChatError::InvalidRequest);
        }

        let (content_type, ext) = match kind {
            AttachmentKind::Image => sniff_image(&head)?,
            AttachmentKind::Text => {
                if std::str::from_utf8(&head).is_err() {
                    return Err(ChatError::AttachmentTypeUnsupported {
                        expected: "UTF-8 text",
                    });
                }
                ("text/plain", ".txt")
            }
        };

        let date = Utc::now().format("%Y%m%d").to_string();
        let dir = self.root.join(&date);
        fs::create_dir_all(&dir)
            .await
            .map_err(ChatError::AttachmentIoFailed)?;

        let file_name = format!("{}{}", hex::encode(rand::random::<[u8; 16]>()), ext);
        let path = dir.join(&file_name);

        let written = match write_body(&path, &head, body.as_mut(), exhausted, limit).await {
            Ok(written) => written,
            Err(e) => {
                if let Err(rm) = fs::remove_file(&path).await {
                    if rm.kind() != io::ErrorKind::NotFound {
                        warn!("Failed to remove partial attachment {}: {}", path.display(), rm);
                    }
                }
                return Err(e);
            }
        };

        debug!("Stored attachment {}/{} ({} bytes)", date, file_name, written);
        Ok(StoredAttachment {
            url: format!("{URL_PREFIX}/{date}/{file_name}"),
            bytes: written,
            content_type: content_type.to_string(),
            file_name,
        })
    }

    /// Map a `{date}/{name}` request onto a file strictly inside the root.
    pub async fn resolve(&self, date: &str, name: &str) -> Result<PathBuf, ChatError> {
        if date.is_empty() || name.is_empty() {
            return Err(ChatError::NotFound);
        }
        if is_suspicious(date) || is_suspicious(name) {
            return Err(ChatError::PathTraversalRejected);
        }

        let root = fs::canonicalize(&self.root)
            .await
            .map_err(ChatError::AttachmentIoFailed)?;

        let candidate = match fs::canonicalize(self.root.join(date).join(name)).await {
            Ok(path) => path,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(ChatError::NotFound),
            Err(e) => return Err(ChatError::AttachmentIoFailed(e)),
        };

        if candidate == root || !candidate.starts_with(&root) {
            return Err(ChatError::PathTraversalRejected);
        }

        match fs::metadata(&candidate).await {
            Ok(meta) if meta.is_file() => Ok(candidate),
            Ok(_) => Err(ChatError::NotFound),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(ChatError::NotFound),
            Err(e) => Err(ChatError::AttachmentIoFailed(e)),
        }
    }

    /// Best-effort removal of the files behind attachment URLs. URLs that do
    /// not point into this tree are skipped. Returns how many were removed.
    pub async fn delete_urls(&self, urls: &[String]) -> usize {
        let mut removed = 0;
        for url in urls {
            let Some((date, name)) = parse_url(url) else {
                debug!("Skipping foreign attachment URL {}", url);
                continue;
            };

            let path = match self.resolve(date, name).await {
                Ok(path) => path,
                Err(ChatError::NotFound) => continue,
                Err(e) => {
                    warn!("Refusing to delete attachment {}: {}", url, e);
                    continue;
                }
            };

            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to delete attachment {}: {}", path.display(), e),
            }
        }
        removed
    }

    /// Delete files oldest-first until the tree fits in `budget` bytes, then
    /// drop any date directories left empty.
    pub async fn prune_to_budget(&self, budget: u64) -> anyhow::Result<PruneReport> {
        let mut files: Vec<(SystemTime, u64, PathBuf)> = Vec::new();
        let mut dirs: Vec<PathBuf> = Vec::new();

        let mut top = fs::read_dir(&self.root).await?;
        while let Some(entry) = top.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            dirs.push(entry.path());

            let mut inner = fs::read_dir(entry.path()).await?;
            while let Some(file) = inner.next_entry().await? {
                let meta = file.metadata().await?;
                if meta.is_file() {
                    let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                    files.push((modified, meta.len(), file.path()));
                }
            }
        }

        let mut total: u64 = files.iter().map(|(_, len, _)| len).sum();
        let mut report = PruneReport::default();

        if total > budget {
            files.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.2.cmp(&b.2)));
            for (_, len, path) in &files {
                if total <= budget {
                    break;
                }
                match fs::remove_file(path).await {
                    Ok(()) => {
                        total -= len;
                        report.removed_files += 1;
                        report.freed_bytes += len;
                    }
                    Err(e) => warn!("Failed to prune attachment {}: {}", path.display(), e),
                }
            }

            for dir in &dirs {
                // Fails harmlessly when the directory still has files.
                let _ = fs::remove_dir(dir).await;
            }

            info!(
                "Pruned {} attachments ({} bytes) to fit budget of {} bytes",
                report.removed_files, report.freed_bytes, budget
            );
        }

        report.remaining_bytes = total;
        Ok(report)
    }
}

async fn write_body<S, E>(
    path: &Path,
    head: &[u8],
    mut rest: std::pin::Pin<&mut S>,
    exhausted: bool,
    limit: u64,
) -> Result<u64, ChatError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let mut file = fs::File::create(path)
        .await
        .map_err(ChatError::AttachmentIoFailed)?;
    file.write_all(head)
        .await
        .map_err(ChatError::AttachmentIoFailed)?;
    let mut written = head.len() as u64;

    if !exhausted {
        while let Some(chunk) = rest.next().await {
            let chunk = chunk.map_err(|e| {
                ChatError::AttachmentIoFailed(io::Error::other(e.to_string()))
            })?;
            written += chunk.len() as u64;
            if written > limit {
                return Err(ChatError::AttachmentTooLarge { limit });
            }
            file.write_all(&chunk)
                .await
                .map_err(ChatError::AttachmentIoFailed)?;
        }
    }

    file.flush().await.map_err(ChatError::AttachmentIoFailed)?;
    Ok(written)
}

fn sniff_image(head: &[u8]) -> Result<(&'static str, &'static str), ChatError> {
    let sniffed = &head[..head.len().min(SNIFF_LEN)];
    infer::get(sniffed)
        .and_then(|kind| {
            IMAGE_TYPES
                .iter()
                .find(|(mime, _)| *mime == kind.mime_type())
                .copied()
        })
        .ok_or(ChatError::AttachmentTypeUnsupported {
            expected: "PNG, JPEG, GIF or WebP",
        })
}

/// Anything that could climb out of (or into a sibling of) the date
/// directory.
fn is_suspicious(segment: &str) -> bool {
    segment.contains("..")
        || segment.contains('/')
        || segment.contains('\\')
        || Path::new(segment)
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
}

/// `/api/chat/images/<date>/<name>` → `(date, name)`.
fn parse_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix(URL_PREFIX)?.strip_prefix('/')?;
    let (date, name) = rest.split_once('/')?;
    if date.is_empty() || name.is_empty() || name.contains('/') {
        return None;
    }
    Some((date, name))
}

/// Content-Type for a stored file, by extension.
pub fn content_type_for(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// Anti-hotlink check. With the policy on, a present Referer must name the
/// serving host or contain an allow-listed entry. No Referer, or one that
/// does not parse, is let through.
/// `host[:port]` of an absolute URI, without any userinfo.
pub(crate) fn host_and_port(uri: &Uri) -> Option<String> {
    let host = uri.host()?;
    Some(match uri.port_u16() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

pub fn referer_allowed(settings: &RoomSettings, referer: Option<&str>, host: Option<&str>) -> bool {
    if !settings.anti_hotlink_enabled {
        return true;
    }
    let Some(referer) = referer.filter(|r| !r.is_empty()) else {
        return true;
    };
    let Ok(uri) = referer.parse::<Uri>() else {
        return true;
    };

    let referer_host = host_and_port(&uri).unwrap_or_default();
    if let Some(host) = host {
        if !referer_host.is_empty() && referer_host.eq_ignore_ascii_case(host) {
            return true;
        }
    }

    settings
        .allowed_referers
        .iter()
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .any(|entry| referer_host.contains(entry))
}
