use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Mutex,
};

use anyhow::Context;
use async_trait::async_trait;
use aws_config::{defaults, BehaviorVersion};
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    config::{Builder as S3ConfigBuilder, Region},
    Client,
};
use aws_smithy_types::byte_stream::ByteStream;
use bytes::Bytes;
use uuid::Uuid;

use crate::config::StorageConfig;

/// Folder an image is filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageCategory {
    Avatar,
    Cover,
}

impl ImageCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageCategory::Avatar => "avatars",
            ImageCategory::Cover => "covers",
        }
    }
}

/// An image file received from the client.
#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub body: Bytes,
    pub content_type: String,
}

impl ImageUpload {
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

pub fn ext_from_mime(ct: &str) -> Option<&'static str> {
    match ct {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        "image/gif" => Some("gif"),
        "image/heic" => Some("heic"),
        _ => None,
    }
}

/// External store holding profile images, addressed by public reference.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Stores the image and returns its public reference.
    async fn upload(&self, image: ImageUpload, category: ImageCategory) -> anyhow::Result<String>;
    async fn delete(&self, public_ref: &str) -> anyhow::Result<()>;
}

/// S3/MinIO-backed image store.
#[derive(Clone)]
pub struct S3ImageStore {
    client: Client,
    bucket: String,
    public_base_url: String,
}

impl S3ImageStore {
    pub async fn new(cfg: &StorageConfig) -> anyhow::Result<Self> {
        let shared = defaults(BehaviorVersion::latest())
            .region(Region::new(cfg.region.clone()))
            .credentials_provider(Credentials::new(
                &cfg.access_key,
                &cfg.secret_key,
                None,
                None,
                "static",
            ))
            .endpoint_url(&cfg.endpoint)
            .load()
            .await;

        let conf = S3ConfigBuilder::from(&shared)
            .endpoint_url(&cfg.endpoint)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: Client::from_conf(conf),
            bucket: cfg.bucket.clone(),
            public_base_url: cfg.public_base_url.clone(),
        })
    }

    fn key_for(&self, public_ref: &str) -> Option<String> {
        key_from_ref(&self.public_base_url, public_ref)
    }
}

fn key_from_ref(base: &str, public_ref: &str) -> Option<String> {
    public_ref
        .strip_prefix(base)
        .and_then(|rest| rest.strip_prefix('/'))
        .filter(|key| !key.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl ImageStore for S3ImageStore {
    async fn upload(&self, image: ImageUpload, category: ImageCategory) -> anyhow::Result<String> {
        let ext = ext_from_mime(&image.content_type).unwrap_or("bin");
        let key = format!("{}/{}.{}", category.as_str(), Uuid::new_v4(), ext);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(image.body))
            .content_type(&image.content_type)
            .send()
            .await
            .with_context(|| format!("s3 put_object {}", key))?;
        Ok(format!("{}/{}", self.public_base_url, key))
    }

    async fn delete(&self, public_ref: &str) -> anyhow::Result<()> {
        let key = self
            .key_for(public_ref)
            .with_context(|| format!("not a managed image: {}", public_ref))?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .with_context(|| format!("s3 delete_object {}", key))?;
        Ok(())
    }
}

/// In-process image store that records calls. Failures can be switched on
/// to exercise error paths.
#[derive(Default)]
pub struct MemoryImageStore {
    counter: AtomicUsize,
    pub fail_uploads: AtomicBool,
    pub fail_deletes: AtomicBool,
    uploaded: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
}

impl MemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uploaded(&self) -> Vec<String> {
        self.uploaded.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ImageStore for MemoryImageStore {
    async fn upload(&self, image: ImageUpload, category: ImageCategory) -> anyhow::Result<String> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            anyhow::bail!("upload refused");
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let ext = ext_from_mime(&image.content_type).unwrap_or("bin");
        let public_ref = format!("https://fake.local/{}/{}.{}", category.as_str(), n, ext);
        if let Ok(mut v) = self.uploaded.lock() {
            v.push(public_ref.clone());
        }
        Ok(public_ref)
    }

    async fn delete(&self, public_ref: &str) -> anyhow::Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            anyhow::bail!("delete refused");
        }
        if let Ok(mut v) = self.deleted.lock() {
            v.push(public_ref.to_string());
        }
        Ok(())
    }
}
