use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;

use crate::adb::{self, DeviceExecutor};
use crate::cache::{now_ms, CacheService};
use crate::config::ObserverConfig;
use crate::error::AppError;
use crate::models::{CaptureFormat, CaptureOptions, CaptureResult};

const DEVICE_TMP_PATH: &str = "/sdcard/devicelens_screencap.png";

/// Captures device screenshots into the screenshot cache directory.
///
/// The inline strategy pipes the frame back through base64 on the shell
/// channel. When that trips the output cap (high-resolution frames on a
/// capped channel), the file-transfer strategy pulls the frame instead.
/// Both leave nothing behind on the device.
pub struct ScreenshotCapturer {
    executor: Arc<dyn DeviceExecutor>,
    cache: Arc<CacheService>,
    cache_limit_bytes: u64,
    timeout: Duration,
}

impl ScreenshotCapturer {
    pub fn new(
        executor: Arc<dyn DeviceExecutor>,
        cache: Arc<CacheService>,
        config: &ObserverConfig,
    ) -> Self {
        Self {
            executor,
            cache,
            cache_limit_bytes: config.cache.screenshot_cache_limit_bytes,
            timeout: Duration::from_secs(config.command.shell_timeout_secs),
        }
    }

    /// Never raises: failures come back as `CaptureResult.error`.
    pub async fn capture(
        &self,
        serial: &str,
        options: &CaptureOptions,
        trace_id: &str,
    ) -> CaptureResult {
        let bytes = match self.capture_inline(serial, trace_id).await {
            Ok(bytes) => bytes,
            Err(err) if err.is_output_limit() => {
                tracing::debug!(serial, "Inline capture hit output cap, pulling file instead");
                match self.capture_via_file(serial, trace_id).await {
                    Ok(bytes) => bytes,
                    Err(err) => return failed(err),
                }
            }
            Err(err) => return failed(err),
        };

        let path = match self.persist(&bytes, options, trace_id) {
            Ok(path) => path,
            Err(err) => return failed(err),
        };

        self.spawn_eviction();

        CaptureResult {
            success: true,
            path: Some(path.to_string_lossy().into_owned()),
            error: None,
        }
    }

    async fn capture_inline(&self, serial: &str, trace_id: &str) -> Result<Vec<u8>, AppError> {
        let command =
            format!("screencap -p {DEVICE_TMP_PATH} && base64 {DEVICE_TMP_PATH}");
        let result = adb::shell(self.executor.as_ref(), serial, &command, self.timeout, trace_id)
            .await;
        self.cleanup_device(serial, trace_id).await;
        let output = result?;

        let compact: Vec<u8> = output
            .stdout
            .bytes()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        base64::engine::general_purpose::STANDARD
            .decode(&compact)
            .map_err(|err| {
                AppError::dependency(format!("screenshot payload is not base64: {err}"), trace_id)
            })
    }

    async fn capture_via_file(&self, serial: &str, trace_id: &str) -> Result<Vec<u8>, AppError> {
        let command = format!("screencap -p {DEVICE_TMP_PATH}");
        adb::shell(self.executor.as_ref(), serial, &command, self.timeout, trace_id).await?;

        let transfer_path = self
            .cache
            .screenshots_dir()
            .join(format!(".transfer_{trace_id}.png"));
        if let Some(parent) = transfer_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| AppError::system(err.to_string(), trace_id))?;
        }

        let pull_args = vec![
            "pull".to_string(),
            DEVICE_TMP_PATH.to_string(),
            transfer_path.to_string_lossy().into_owned(),
        ];
        let result = self
            .executor
            .run(serial, &pull_args, self.timeout, trace_id)
            .await;
        self.cleanup_device(serial, trace_id).await;
        result?;

        let bytes = std::fs::read(&transfer_path)
            .map_err(|err| AppError::system(format!("pulled screenshot unreadable: {err}"), trace_id))?;
        let _ = std::fs::remove_file(&transfer_path);
        Ok(bytes)
    }

    async fn cleanup_device(&self, serial: &str, trace_id: &str) {
        let command = format!("rm -f {DEVICE_TMP_PATH}");
        if let Err(err) =
            adb::shell(self.executor.as_ref(), serial, &command, self.timeout, trace_id).await
        {
            tracing::debug!(serial, error = %err, "Device temp cleanup failed");
        }
    }

    fn persist(
        &self,
        png_bytes: &[u8],
        options: &CaptureOptions,
        trace_id: &str,
    ) -> Result<PathBuf, AppError> {
        let dir = self.cache.screenshots_dir();
        std::fs::create_dir_all(&dir)
            .map_err(|err| AppError::system(err.to_string(), trace_id))?;

        // Monotonic per-directory filenames even when two captures land in
        // the same millisecond.
        let mut timestamp = now_ms();
        let extension = options.format.extension();
        let mut path = dir.join(format!("screenshot_{timestamp}.{extension}"));
        while path.exists() {
            timestamp += 1;
            path = dir.join(format!("screenshot_{timestamp}.{extension}"));
        }

        match options.format {
            CaptureFormat::Png => {
                std::fs::write(&path, png_bytes)
                    .map_err(|err| AppError::system(err.to_string(), trace_id))?;
            }
            CaptureFormat::Webp => {
                let img = image::load_from_memory(png_bytes).map_err(|err| {
                    AppError::dependency(format!("captured frame did not decode: {err}"), trace_id)
                })?;
                if options.lossless == Some(true) {
                    let file = std::fs::File::create(&path)
                        .map_err(|err| AppError::system(err.to_string(), trace_id))?;
                    let encoder = image::codecs::webp::WebPEncoder::new_lossless(
                        std::io::BufWriter::new(file),
                    );
                    img.write_with_encoder(encoder).map_err(|err| {
                        AppError::system(format!("webp encode failed: {err}"), trace_id)
                    })?;
                } else {
                    let quality = f32::from(options.quality.unwrap_or(80).min(100));
                    let encoder = webp::Encoder::from_image(&img).map_err(|err| {
                        AppError::system(format!("webp encode failed: {err}"), trace_id)
                    })?;
                    let encoded = encoder.encode(quality);
                    std::fs::write(&path, &*encoded)
                        .map_err(|err| AppError::system(err.to_string(), trace_id))?;
                }
            }
        }
        Ok(path)
    }

    fn spawn_eviction(&self) {
        let dir = self.cache.screenshots_dir();
        let limit = self.cache_limit_bytes;
        tokio::task::spawn_blocking(move || evict_oldest(&dir, limit));
    }
}

fn failed(err: AppError) -> CaptureResult {
    CaptureResult {
        success: false,
        path: None,
        error: Some(err.error),
    }
}

/// Oldest-first removal until the directory fits under the ceiling. Runs off
/// the request path; errors are logged and swallowed.
pub(crate) fn evict_oldest(dir: &Path, limit_bytes: u64) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };

    let mut files: Vec<(PathBuf, std::time::SystemTime, u64)> = Vec::new();
    let mut total: u64 = 0;
    for entry in entries.flatten() {
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        total += meta.len();
        files.push((entry.path(), modified, meta.len()));
    }
    if total <= limit_bytes {
        return;
    }

    files.sort_by_key(|(_, modified, _)| *modified);
    for (path, _, size) in files {
        if total <= limit_bytes {
            break;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => total -= size,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "Screenshot eviction failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adb::testing::FakeExecutor;

    const INLINE_KEY: &str = "shell screencap -p /sdcard/devicelens_screencap.png && base64 /sdcard/devicelens_screencap.png";
    const FILE_KEY: &str = "shell screencap -p /sdcard/devicelens_screencap.png";
    const CLEANUP_KEY: &str = "shell rm -f /sdcard/devicelens_screencap.png";

    fn png_bytes() -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(16, 16, image::Rgba([10, 20, 30, 255]));
        let mut out = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
            .expect("encode png");
        out
    }

    fn setup() -> (Arc<FakeExecutor>, ScreenshotCapturer, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let executor = Arc::new(FakeExecutor::new());
        let cache = Arc::new(CacheService::new(dir.path().to_path_buf()));
        let capturer =
            ScreenshotCapturer::new(executor.clone(), cache, &ObserverConfig::default());
        (executor, capturer, dir)
    }

    #[tokio::test]
    async fn inline_capture_writes_png_and_cleans_up() {
        let (executor, capturer, _dir) = setup();
        let bytes = png_bytes();
        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
        executor.on(INLINE_KEY, &format!("{encoded}\n"));
        executor.on(CLEANUP_KEY, "");

        let result = capturer
            .capture("emulator-5554", &CaptureOptions::default(), "t")
            .await;
        assert!(result.success, "{:?}", result.error);
        let path = PathBuf::from(result.path.expect("path"));
        assert_eq!(std::fs::read(&path).expect("read"), bytes);
        assert!(path.file_name().unwrap().to_string_lossy().ends_with(".png"));
        assert_eq!(executor.call_count(CLEANUP_KEY), 1);
    }

    #[tokio::test]
    async fn output_limit_falls_back_to_file_transfer() {
        let (executor, capturer, dir) = setup();
        executor.on_err(INLINE_KEY, AppError::output_limit("too big", "t"));
        executor.on(FILE_KEY, "");
        executor.on(CLEANUP_KEY, "");
        executor.on_prefix("pull /sdcard/devicelens_screencap.png", "");

        // The fake pull does not create the local file, so stage it where the
        // transfer lands.
        let transfer = dir.path().join("screenshots").join(".transfer_t.png");
        std::fs::create_dir_all(transfer.parent().unwrap()).expect("mkdir");
        std::fs::write(&transfer, png_bytes()).expect("stage");

        let result = capturer
            .capture("emulator-5554", &CaptureOptions::default(), "t")
            .await;
        assert!(result.success, "{:?}", result.error);
        assert!(!transfer.exists(), "transfer temp should be removed");
        // Both strategies cleaned up after themselves.
        assert_eq!(executor.call_count(CLEANUP_KEY), 2);
    }

    #[tokio::test]
    async fn non_limit_error_does_not_fall_back() {
        let (executor, capturer, _dir) = setup();
        executor.on_err(INLINE_KEY, AppError::dependency("device offline", "t"));
        executor.on(CLEANUP_KEY, "");

        let result = capturer
            .capture("emulator-5554", &CaptureOptions::default(), "t")
            .await;
        assert!(!result.success);
        assert!(result.error.expect("error").contains("device offline"));
        assert_eq!(executor.call_count(FILE_KEY), 0);
    }

    #[tokio::test]
    async fn garbage_payload_fails_without_panicking() {
        let (executor, capturer, _dir) = setup();
        executor.on(INLINE_KEY, "!!! not base64 !!!");
        executor.on(CLEANUP_KEY, "");

        let result = capturer
            .capture("emulator-5554", &CaptureOptions::default(), "t")
            .await;
        assert!(!result.success);
        assert!(result.error.expect("error").contains("base64"));
    }

    #[tokio::test]
    async fn webp_option_reencodes_the_frame() {
        let (executor, capturer, _dir) = setup();
        let encoded = base64::engine::general_purpose::STANDARD.encode(png_bytes());
        executor.on(INLINE_KEY, &encoded);
        executor.on(CLEANUP_KEY, "");

        let options = CaptureOptions {
            format: CaptureFormat::Webp,
            quality: None,
            lossless: Some(true),
        };
        let result = capturer.capture("emulator-5554", &options, "t").await;
        assert!(result.success, "{:?}", result.error);
        let path = PathBuf::from(result.path.expect("path"));
        assert!(path.file_name().unwrap().to_string_lossy().ends_with(".webp"));
        let reloaded = image::open(&path).expect("decode webp");
        assert_eq!(reloaded.width(), 16);
    }

    #[tokio::test]
    async fn webp_quality_drives_a_lossy_encode() {
        let (executor, capturer, _dir) = setup();
        let encoded = base64::engine::general_purpose::STANDARD.encode(png_bytes());
        executor.on(INLINE_KEY, &encoded);
        executor.on(CLEANUP_KEY, "");

        let options = CaptureOptions {
            format: CaptureFormat::Webp,
            quality: Some(60),
            lossless: None,
        };
        let result = capturer.capture("emulator-5554", &options, "t").await;
        assert!(result.success, "{:?}", result.error);
        let path = PathBuf::from(result.path.expect("path"));
        let bytes = std::fs::read(&path).expect("read");
        // RIFF container without the lossless VP8L payload.
        assert_eq!(&bytes[..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WEBP");
        assert_ne!(&bytes[12..16], b"VP8L");
        let reloaded = image::open(&path).expect("decode webp");
        assert_eq!(reloaded.height(), 16);
    }

    #[tokio::test]
    async fn repeated_captures_never_reuse_a_filename() {
        let (executor, capturer, _dir) = setup();
        let encoded = base64::engine::general_purpose::STANDARD.encode(png_bytes());
        executor.on(INLINE_KEY, &encoded);
        executor.on(CLEANUP_KEY, "");

        let first = capturer
            .capture("emulator-5554", &CaptureOptions::default(), "t")
            .await;
        let second = capturer
            .capture("emulator-5554", &CaptureOptions::default(), "t")
            .await;
        assert_ne!(first.path.expect("path"), second.path.expect("path"));
    }

    #[test]
    fn eviction_removes_oldest_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        for (name, sleep_ms) in [("a.png", 20), ("b.png", 20), ("c.png", 0)] {
            std::fs::write(dir.path().join(name), vec![0u8; 1000]).expect("write");
            std::thread::sleep(std::time::Duration::from_millis(sleep_ms));
        }

        evict_oldest(dir.path(), 2500);
        assert!(!dir.path().join("a.png").exists());
        assert!(dir.path().join("b.png").exists());
        assert!(dir.path().join("c.png").exists());

        evict_oldest(dir.path(), 10_000);
        assert!(dir.path().join("b.png").exists());
    }
}
