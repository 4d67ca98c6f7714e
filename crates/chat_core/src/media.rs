use async_trait::async_trait;
use chat_shared::{
    domain::{Attachment, AttachmentKind, UserId},
    protocol::MediaUploadResponse,
};
use reqwest::Client;
use serde::Deserialize;

use crate::error::SyncError;

#[derive(Debug, Clone)]
pub struct MediaUpload {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl MediaUpload {
    pub fn kind(&self) -> AttachmentKind {
        let mime = self.mime_type.as_deref().unwrap_or_default();
        match mime.split('/').next() {
            Some("image") => AttachmentKind::Image,
            Some("video") => AttachmentKind::Video,
            Some("audio") => AttachmentKind::Audio,
            _ => AttachmentKind::File,
        }
    }
}

/// Stores a binary payload and hands back a stable URL.
#[async_trait]
pub trait MediaUploader: Send + Sync {
    async fn upload(&self, upload: MediaUpload) -> Result<Attachment, SyncError>;
}

pub struct MissingMediaUploader;

#[async_trait]
impl MediaUploader for MissingMediaUploader {
    async fn upload(&self, upload: MediaUpload) -> Result<Attachment, SyncError> {
        Err(SyncError::Transport(format!(
            "media upload unavailable for {}",
            upload.filename
        )))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum UploadBody {
    Wrapped { data: MediaUploadResponse },
    Bare(MediaUploadResponse),
}

pub struct HttpMediaUploader {
    http: Client,
    base_url: String,
    user_id: UserId,
    token: Option<String>,
}

impl HttpMediaUploader {
    pub fn new(base_url: impl Into<String>, user_id: UserId, token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user_id,
            token,
        }
    }
}

#[async_trait]
impl MediaUploader for HttpMediaUploader {
    async fn upload(&self, upload: MediaUpload) -> Result<Attachment, SyncError> {
        let kind = upload.kind();
        let mime_type = upload
            .mime_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let mut request = self
            .http
            .post(format!("{}/media", self.base_url))
            .query(&[
                ("user_id", self.user_id.to_string()),
                ("filename", upload.filename.clone()),
                ("mime_type", mime_type.clone()),
            ])
            .header(reqwest::header::CONTENT_TYPE, mime_type)
            .body(upload.bytes);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = format!("media upload of {} failed: {status}", upload.filename);
            return Err(match status.as_u16() {
                401 | 403 => SyncError::Unauthorized(message),
                _ => SyncError::Transport(message),
            });
        }
        let url = match response.json::<UploadBody>().await? {
            UploadBody::Wrapped { data } => data.url,
            UploadBody::Bare(body) => body.url,
        };
        Ok(Attachment { kind, url })
    }
}
