//! Headless-Chromium [`reporter::ports::RenderBackend`], used by the
//! rendering pool to convert rendered HTML/text into PDF bytes. The
//! browser subprocess is launched lazily on first use and
//! reused for the lifetime of the backend, matching "each worker owns a
//! long-lived rendering subprocess": the pool itself owns one backend
//! instance per worker and never recreates it between tasks.

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::PrintToPdfParams;
use futures::StreamExt;
use reporter::ports::RenderBackend;
use reporter::ReportError;
use std::io::Write;
use std::time::Duration;
use tokio::sync::RwLock;

/// Delay after DOM-ready before capturing the artifact, to let
/// client-side rendering (fonts, charts, late-loading CSS) settle.
const RENDER_SETTLE_DELAY: Duration = Duration::from_millis(500);

struct LaunchedBrowser {
    browser: Browser,
    // Keeps the CDP event-handling task alive for as long as the browser is.
    _handler: tokio::task::JoinHandle<()>,
}

/// One long-lived Chromium subprocess, launched with bounded memory flags.
/// `render` is safe to call repeatedly; the underlying process is reused.
pub struct ChromiumRenderBackend {
    browser: RwLock<Option<LaunchedBrowser>>,
    max_old_space_mb: u32,
}

impl ChromiumRenderBackend {
    pub fn new(max_old_space_mb: u32) -> Self {
        Self { browser: RwLock::new(None), max_old_space_mb }
    }

    async fn ensure_launched(&self) -> Result<(), ReportError> {
        if self.browser.read().await.is_some() {
            return Ok(());
        }
        let mut guard = self.browser.write().await;
        if guard.is_some() {
            return Ok(());
        }

        let config = BrowserConfig::builder()
            .no_sandbox()
            .arg(format!("--max-old-space-size={}", self.max_old_space_mb))
            .arg("--disable-gpu")
            .build()
            .map_err(|e| ReportError::unknown_msg(e.to_string()))?;

        let (browser, mut handler) = Browser::launch(config).await.map_err(ReportError::unknown)?;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    tracing::warn!(error = %err, "chromium event handler error");
                }
            }
        });

        *guard = Some(LaunchedBrowser { browser, _handler: handler_task });
        Ok(())
    }

    async fn render_inner(&self, input: &[u8]) -> Result<Vec<u8>, ReportError> {
        self.ensure_launched().await?;

        let mut temp_file = tempfile::Builder::new()
            .suffix(".html")
            .tempfile()
            .map_err(|e| ReportError::unknown_msg(format!("failed to create render input temp file: {e}")))?;
        set_owner_only_permissions(temp_file.as_file())?;
        temp_file
            .write_all(input)
            .map_err(|e| ReportError::unknown_msg(format!("failed to write render input temp file: {e}")))?;
        let file_url = format!("file://{}", temp_file.path().display());

        let guard = self.browser.read().await;
        let launched = guard.as_ref().ok_or_else(|| ReportError::unknown_msg("browser not launched"))?;

        let page = launched.browser.new_page(file_url).await.map_err(ReportError::unknown)?;
        page.wait_for_navigation().await.map_err(ReportError::unknown)?;
        tokio::time::sleep(RENDER_SETTLE_DELAY).await;

        let pdf = page
            .pdf(PrintToPdfParams::default())
            .await
            .map_err(ReportError::unknown)?;

        if let Err(err) = page.close().await {
            tracing::warn!(error = %err, "failed to close render page after capture");
        }

        Ok(pdf)
    }
}

#[cfg(unix)]
fn set_owner_only_permissions(file: &std::fs::File) -> Result<(), ReportError> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(0o600))
        .map_err(|e| ReportError::unknown_msg(format!("failed to set render input temp file permissions: {e}")))
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_file: &std::fs::File) -> Result<(), ReportError> {
    Ok(())
}

#[async_trait]
impl RenderBackend for ChromiumRenderBackend {
    async fn render(&self, input: &[u8]) -> Result<Vec<u8>, ReportError> {
        self.render_inner(input).await
    }
}
