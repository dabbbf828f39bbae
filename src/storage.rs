//! Storage module for uploading report photos to the imgbb image host

use std::io::Cursor;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::future::try_join_all;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use serde::Deserialize;
use thiserror::Error;

const DEFAULT_UPLOAD_URL: &str = "https://api.imgbb.com/1/upload";
const DEFAULT_MAX_WIDTH: u32 = 1200;
const DEFAULT_QUALITY: u8 = 70;

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub upload_url: String,
    pub api_key: String,
    pub max_width: u32,
    pub quality: u8,
}

impl StorageConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            upload_url: DEFAULT_UPLOAD_URL.to_string(),
            api_key: api_key.into(),
            max_width: DEFAULT_MAX_WIDTH,
            quality: DEFAULT_QUALITY,
        }
    }

    /// Creates a new storage config from environment variables
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let api_key = std::env::var("SIGNALEMENT_IMGBB_API_KEY")
            .map_err(|_| anyhow!("SIGNALEMENT_IMGBB_API_KEY environment variable is required"))?;
        let upload_url = std::env::var("SIGNALEMENT_IMGBB_UPLOAD_URL")
            .unwrap_or_else(|_| DEFAULT_UPLOAD_URL.to_string());

        let max_width = match std::env::var("SIGNALEMENT_IMAGE_MAX_WIDTH") {
            Ok(raw) => raw
                .parse::<u32>()
                .ok()
                .filter(|w| *w > 0)
                .ok_or_else(|| anyhow!("SIGNALEMENT_IMAGE_MAX_WIDTH must be a positive integer"))?,
            Err(_) => DEFAULT_MAX_WIDTH,
        };
        let quality = match std::env::var("SIGNALEMENT_IMAGE_QUALITY") {
            Ok(raw) => raw
                .parse::<u8>()
                .ok()
                .filter(|q| (1..=100).contains(q))
                .ok_or_else(|| anyhow!("SIGNALEMENT_IMAGE_QUALITY must be between 1 and 100"))?,
            Err(_) => DEFAULT_QUALITY,
        };

        Ok(Self {
            upload_url,
            api_key,
            max_width,
            quality,
        })
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("image host API key is not configured")]
    MissingApiKey,
    #[error("not an image data URL")]
    NotADataUrl,
    #[error("image host returned HTTP {0}")]
    Http(u16),
    #[error("image host rejected the upload: {0}")]
    Rejected(String),
}

/// Remote image hosting used for report photos.
#[async_trait]
pub trait ImageHost: Send + Sync + 'static {
    /// Uploads one data-URL encoded image and returns its public URL.
    async fn upload_image(&self, data_url: &str, index: usize) -> Result<String>;
}

/// True for `data:image/...` payloads that still need uploading.
pub fn is_data_url(s: &str) -> bool {
    s.starts_with("data:image/")
}

pub fn is_hosted_url(s: &str) -> bool {
    s.contains("ibb.co") || s.contains("imgbb.com")
}

/// Decodes the base64 body of a `data:image/...;base64,` URL.
pub fn decode_data_url(data_url: &str) -> Result<Vec<u8>> {
    if !is_data_url(data_url) {
        return Err(UploadError::NotADataUrl.into());
    }
    let (header, body) = data_url
        .split_once(',')
        .ok_or(UploadError::NotADataUrl)?;
    if !header.ends_with(";base64") {
        return Err(anyhow!("Only base64 image data URLs are supported"));
    }
    base64::decode(body.trim()).context("Image data URL is not valid base64")
}

/// Bounds the width to `max_width` (aspect kept, never upscaled) and re-encodes as JPEG.
pub fn compress_image(bytes: &[u8], max_width: u32, quality: u8) -> Result<Vec<u8>> {
    let img = image::load_from_memory(bytes).context("Failed to decode image")?;

    let img = if img.width() > max_width {
        let height = ((img.height() as u64 * max_width as u64) / img.width() as u64).max(1) as u32;
        img.resize_exact(max_width, height, FilterType::Triangle)
    } else {
        img
    };

    let rgb = img.to_rgb8();
    let mut out = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode_image(&rgb)
        .context("Failed to encode JPEG")?;

    let out = out.into_inner();
    tracing::debug!(
        "Compressed image {} KB -> {} KB",
        bytes.len() / 1024,
        out.len() / 1024
    );
    Ok(out)
}

/// Uploads every image concurrently. Fails as a whole if any single upload fails;
/// on success the URLs are in input order.
pub async fn upload_multiple_images<H>(host: &H, data_urls: &[String]) -> Result<Vec<String>>
where
    H: ImageHost + ?Sized,
{
    if data_urls.is_empty() {
        return Ok(Vec::new());
    }
    tracing::info!("Uploading {} image(s)", data_urls.len());
    let uploads = data_urls
        .iter()
        .enumerate()
        .map(|(index, data_url)| host.upload_image(data_url, index));
    let urls = try_join_all(uploads).await?;
    tracing::info!("Uploaded {} image(s)", urls.len());
    Ok(urls)
}

#[derive(Debug, Deserialize)]
struct UploadEnvelope {
    #[serde(default)]
    success: bool,
    data: Option<UploadData>,
    error: Option<UploadErrorBody>,
}

#[derive(Debug, Deserialize)]
struct UploadData {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadErrorBody {
    message: Option<String>,
}

/// Extracts the hosted URL from the upload response envelope.
fn parse_upload_envelope(body: &str) -> Result<String> {
    let envelope: UploadEnvelope = serde_json::from_str(body)
        .map_err(|e| anyhow!("Failed to parse image host response: {} - {}", e, body))?;

    if !envelope.success {
        let message = envelope
            .error
            .and_then(|e| e.message)
            .unwrap_or_else(|| "unknown error".to_string());
        return Err(UploadError::Rejected(message).into());
    }

    envelope
        .data
        .and_then(|d| d.url)
        .ok_or_else(|| UploadError::Rejected("response carried no URL".to_string()).into())
}

#[derive(Debug, Clone)]
pub struct ImgbbClient {
    config: StorageConfig,
    http_client: reqwest::Client,
}

impl ImgbbClient {
    pub fn new(config: StorageConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .build()
            .map_err(|e| anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self {
            config,
            http_client,
        })
    }

    async fn compress(&self, data_url: &str) -> Result<Vec<u8>> {
        let bytes = decode_data_url(data_url)?;
        let max_width = self.config.max_width;
        let quality = self.config.quality;

        tokio::task::spawn_blocking(move || compress_image(&bytes, max_width, quality))
            .await
            .map_err(|e| anyhow!("Task join error: {}", e))?
    }
}

#[async_trait]
impl ImageHost for ImgbbClient {
    async fn upload_image(&self, data_url: &str, index: usize) -> Result<String> {
        if self.config.api_key.is_empty() {
            return Err(UploadError::MissingApiKey.into());
        }

        let result: Result<String> = async {
            tracing::debug!("Compressing image {}", index + 1);
            let compressed = self.compress(data_url).await?;

            let stamp = chrono::Utc::now().timestamp_millis();
            let name = format!("report_image_{}_{}", index, stamp);
            let part = reqwest::multipart::Part::bytes(compressed)
                .file_name(format!("{}.jpg", name))
                .mime_str("image/jpeg")?;
            let form = reqwest::multipart::Form::new()
                .text("key", self.config.api_key.clone())
                .part("image", part)
                .text("name", name);

            tracing::debug!("Uploading image {} to {}", index + 1, self.config.upload_url);
            let response = self
                .http_client
                .post(&self.config.upload_url)
                .multipart(form)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                return Err(UploadError::Http(status.as_u16()).into());
            }
            let body = response.text().await?;
            parse_upload_envelope(&body)
        }
        .await;

        match &result {
            Ok(url) => tracing::info!("Image {} uploaded: {}", index + 1, url),
            Err(e) => tracing::error!("Image {} upload failed: {}", index + 1, e),
        }
        result
    }
}

// to run just these tests do cargo test -- storage
#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn png_data_url(width: u32, height: u32) -> String {
        let img = DynamicImage::ImageRgb8(RgbImage::new(width, height));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        format!("data:image/png;base64,{}", base64::encode(buf.into_inner()))
    }

    struct CountingHost {
        calls: AtomicUsize,
        fail_index: Option<usize>,
    }

    #[async_trait]
    impl ImageHost for CountingHost {
        async fn upload_image(&self, _data_url: &str, index: usize) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if Some(index) == self.fail_index {
                return Err(anyhow!("upload {} rejected", index));
            }
            Ok(format!("https://i.ibb.co/img{}.jpg", index))
        }
    }

    #[test]
    fn test_url_classification() {
        assert!(is_data_url("data:image/jpeg;base64,AAAA"));
        assert!(!is_data_url("https://i.ibb.co/abc.jpg"));
        assert!(is_hosted_url("https://i.ibb.co/abc.jpg"));
        assert!(!is_hosted_url("https://example.com/abc.jpg"));
    }

    #[test]
    fn test_decode_data_url_rejects_plain_urls() {
        assert!(decode_data_url("https://i.ibb.co/abc.jpg").is_err());
        assert!(decode_data_url("data:image/png;base64,!!!").is_err());
    }

    #[test]
    fn test_compress_bounds_width_and_keeps_aspect() {
        let bytes = decode_data_url(&png_data_url(2400, 1200)).unwrap();
        let out = compress_image(&bytes, 1200, 70).unwrap();
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (1200, 600));
        assert_eq!(image::guess_format(&out).unwrap(), ImageFormat::Jpeg);
    }

    #[test]
    fn test_compress_never_upscales() {
        let bytes = decode_data_url(&png_data_url(320, 240)).unwrap();
        let out = compress_image(&bytes, 1200, 70).unwrap();
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (320, 240));
    }

    #[test]
    fn test_parse_upload_envelope() {
        let ok = r#"{"success": true, "data": {"url": "https://i.ibb.co/x.jpg"}}"#;
        assert_eq!(parse_upload_envelope(ok).unwrap(), "https://i.ibb.co/x.jpg");

        let rejected = r#"{"success": false, "error": {"message": "Invalid API v1 key."}}"#;
        let err = parse_upload_envelope(rejected).unwrap_err();
        assert!(err.to_string().contains("Invalid API v1 key."));

        let bare = r#"{"success": false}"#;
        assert!(parse_upload_envelope(bare)
            .unwrap_err()
            .to_string()
            .contains("unknown error"));
    }

    #[tokio::test]
    async fn test_upload_multiple_preserves_order() {
        let host = CountingHost {
            calls: AtomicUsize::new(0),
            fail_index: None,
        };
        let inputs: Vec<String> = (0..3).map(|_| png_data_url(4, 4)).collect();
        let urls = upload_multiple_images(&host, &inputs).await.unwrap();
        assert_eq!(
            urls,
            vec![
                "https://i.ibb.co/img0.jpg",
                "https://i.ibb.co/img1.jpg",
                "https://i.ibb.co/img2.jpg"
            ]
        );
        assert_eq!(host.calls.load(Ordering::SeqCst), 3);

        assert!(upload_multiple_images(&host, &[]).await.unwrap().is_empty());
        assert_eq!(host.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_upload_multiple_fails_when_one_fails() {
        let host = CountingHost {
            calls: AtomicUsize::new(0),
            fail_index: Some(1),
        };
        let inputs: Vec<String> = (0..3).map(|_| png_data_url(4, 4)).collect();
        assert!(upload_multiple_images(&host, &inputs).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_api_key_fails_before_network() {
        let client = ImgbbClient::new(StorageConfig::new("")).unwrap();
        let err = client
            .upload_image(&png_data_url(4, 4), 0)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UploadError>(),
            Some(UploadError::MissingApiKey)
        ));
    }
}
