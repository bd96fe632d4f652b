//! Shared headless-browser service.
//!
//! One long-lived chromium container serves every flow; each request gets
//! a fresh page over CDP. Static resource classes (images, stylesheets,
//! fonts, media, manifests) are blocked before navigation so pages load
//! lean, and every fetch leaves a timestamped PNG in the scratch
//! directory for the transport layer to serve.

mod scripts;

use std::time::Duration;

use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EnableParams, EventRequestPaused, FailRequestParams, RequestPattern,
};
use chromiumoxide::cdp::browser_protocol::network::{ErrorReason, ResourceType};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;

use crate::config::BrowserConfig;
use crate::error::{BrowserError, SandboxError};
use crate::sandbox::{SandboxManager, SpawnSpec, browser_name};

pub use scripts::{CONTENT_SCRIPT, DOM_SIZE_SCRIPT, URLS_SCRIPT};

/// Image for the shared browser container.
pub const BROWSER_IMAGE: &str = "zenika/alpine-chrome:latest";

/// CDP debug port the container listens on.
pub const DEBUG_PORT: u16 = 9222;

/// Where screenshots land; served by the transport layer under /browser/.
pub const SCREENSHOT_DIR: &str = "./tmp/browser";

/// Hosts tried when no debug URL is configured. The list covers running
/// next to the container host and running inside it.
const CANDIDATE_HOSTS: [&str; 4] = ["localhost", "127.0.0.1", "host.docker.internal", "skiff-browser"];

/// DOM-stability polling: up to five polls, one second apart. The page
/// counts as stable once the DOM changed by at most the tolerance across
/// one interval.
const DOM_STABLE_POLLS: usize = 5;
const DOM_STABLE_INTERVAL: Duration = Duration::from_secs(1);
const DOM_STABLE_TOLERANCE: f64 = 0.05;

/// Spawn the shared browser container through the sandbox manager. Called
/// once at startup; failure is fatal.
pub async fn init_browser_container(sandbox: &SandboxManager) -> Result<i64, SandboxError> {
    sandbox
        .spawn(
            browser_name(),
            SpawnSpec {
                image: BROWSER_IMAGE.to_string(),
                cmd: vec![
                    "--headless".to_string(),
                    "--no-sandbox".to_string(),
                    "--disable-gpu".to_string(),
                    format!("--remote-debugging-port={DEBUG_PORT}"),
                    "--remote-debugging-address=0.0.0.0".to_string(),
                    "about:blank".to_string(),
                ],
                port: Some(DEBUG_PORT),
            },
        )
        .await
}

#[derive(Debug, serde::Deserialize)]
struct VersionInfo {
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: String,
}

/// Driver for the shared browser. Connections are made per request; the
/// container itself is externally serialized by using a fresh page each
/// time.
pub struct BrowserService {
    config: BrowserConfig,
    http: reqwest::Client,
}

impl BrowserService {
    pub fn new(config: BrowserConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(3))
            .build()
            .expect("discovery client builds with static configuration");
        Self { config, http }
    }

    /// Extracted visible text plus a viewport screenshot filename.
    pub async fn content(&self, url: &str) -> Result<(String, String), BrowserError> {
        tracing::debug!(url, "fetching page content");
        self.run(url, CONTENT_SCRIPT, false).await
    }

    /// Outgoing links plus a full-page screenshot filename.
    pub async fn urls(&self, url: &str) -> Result<(String, String), BrowserError> {
        tracing::debug!(url, "collecting page urls");
        self.run(url, URLS_SCRIPT, true).await
    }

    async fn run(
        &self,
        url: &str,
        script: &str,
        full_page: bool,
    ) -> Result<(String, String), BrowserError> {
        let (browser, handler_task) = self.connect().await?;

        let result = self.drive_page(&browser, url, script, full_page).await;

        handler_task.abort();
        drop(browser);
        result
    }

    async fn drive_page(
        &self,
        browser: &Browser,
        url: &str,
        script: &str,
        full_page: bool,
    ) -> Result<(String, String), BrowserError> {
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| BrowserError::Page {
                op: "new_page",
                reason: e.to_string(),
            })?;

        let intercept_task = install_request_filter(&page).await?;

        let navigation = async {
            page.goto(url).await.map_err(|e| BrowserError::Navigation {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

            wait_for_dom_stable(&page, url).await?;

            let text: String =
                page.evaluate(script)
                    .await
                    .map_err(|e| BrowserError::Page {
                        op: "evaluate",
                        reason: e.to_string(),
                    })?
                    .into_value()
                    .map_err(|e| BrowserError::Page {
                        op: "evaluate",
                        reason: format!("script did not return text: {e}"),
                    })?;

            let screenshot = page
                .screenshot(
                    ScreenshotParams::builder()
                        .format(CaptureScreenshotFormat::Png)
                        .full_page(full_page)
                        .build(),
                )
                .await
                .map_err(|e| BrowserError::Page {
                    op: "screenshot",
                    reason: e.to_string(),
                })?;

            let filename = write_screenshot(&screenshot).await?;
            Ok((text, filename))
        }
        .await;

        intercept_task.abort();
        if let Err(e) = page.close().await {
            tracing::debug!(error = %e, "failed to close page");
        }

        navigation
    }

    /// Connect to the browser: the configured debug URL first, then an
    /// auto-discovered one, then the direct websocket candidates.
    async fn connect(&self) -> Result<(Browser, tokio::task::JoinHandle<()>), BrowserError> {
        let mut candidates = Vec::new();
        if let Some(ref url) = self.config.debug_url {
            candidates.push(url.clone());
        }
        if let Some(discovered) = self.discover_ws_url().await {
            candidates.push(discovered);
        }
        for host in CANDIDATE_HOSTS {
            candidates.push(format!("ws://{host}:{DEBUG_PORT}"));
        }

        let mut last = String::new();
        for candidate in &candidates {
            tracing::debug!(url = %candidate, "trying browser endpoint");
            match Browser::connect(candidate.clone()).await {
                Ok((browser, mut handler)) => {
                    let handler_task = tokio::spawn(async move {
                        while handler.next().await.is_some() {}
                    });
                    tracing::info!(url = %candidate, "connected to browser");
                    return Ok((browser, handler_task));
                }
                Err(e) => last = format!("{candidate}: {e}"),
            }
        }

        Err(BrowserError::Connect {
            attempts: candidates.len(),
            last,
        })
    }

    /// Ask the debug endpoint for its websocket URL, the way a launcher
    /// resolves a running browser.
    async fn discover_ws_url(&self) -> Option<String> {
        for host in CANDIDATE_HOSTS {
            let url = format!("http://{host}:{DEBUG_PORT}/json/version");
            let Ok(response) = self.http.get(&url).send().await else {
                continue;
            };
            if let Ok(info) = response.json::<VersionInfo>().await {
                tracing::debug!(host, ws = %info.web_socket_debugger_url, "discovered browser");
                return Some(info.web_socket_debugger_url);
            }
        }
        None
    }
}

fn is_blocked_resource(resource_type: &ResourceType) -> bool {
    matches!(
        resource_type,
        ResourceType::Image
            | ResourceType::Stylesheet
            | ResourceType::Font
            | ResourceType::Media
            | ResourceType::Manifest
            | ResourceType::Other
    )
}

/// Install a fetch-domain filter that denies static resource classes and
/// lets documents, scripts, and data requests through.
async fn install_request_filter(
    page: &Page,
) -> Result<tokio::task::JoinHandle<()>, BrowserError> {
    let mut paused = page
        .event_listener::<EventRequestPaused>()
        .await
        .map_err(|e| BrowserError::Page {
            op: "event_listener",
            reason: e.to_string(),
        })?;

    page.execute(EnableParams {
        patterns: Some(vec![RequestPattern {
            url_pattern: Some("*".to_string()),
            resource_type: None,
            request_stage: None,
        }]),
        handle_auth_requests: None,
    })
    .await
    .map_err(|e| BrowserError::Page {
        op: "fetch_enable",
        reason: e.to_string(),
    })?;

    let driver = page.clone();
    Ok(tokio::spawn(async move {
        while let Some(event) = paused.next().await {
            let request_id = event.request_id.clone();
            let blocked = is_blocked_resource(&event.resource_type);
            let outcome = if blocked {
                driver
                    .execute(FailRequestParams::new(
                        request_id,
                        ErrorReason::BlockedByClient,
                    ))
                    .await
                    .map(|_| ())
            } else {
                driver
                    .execute(ContinueRequestParams::new(request_id))
                    .await
                    .map(|_| ())
            };
            if let Err(e) = outcome {
                tracing::debug!(error = %e, blocked, "request filter decision failed");
            }
        }
    }))
}

/// Has the DOM settled between two size snapshots one interval apart?
/// Mildly dynamic pages (live regions, timestamps) keep mutating forever,
/// so "settled" is a relative-change tolerance, not exact equality.
fn dom_settled(previous: u64, current: u64) -> bool {
    let change = current.abs_diff(previous) as f64 / previous.max(1) as f64;
    change <= DOM_STABLE_TOLERANCE
}

/// Poll the DOM until consecutive snapshots are within tolerance. A page
/// that never settles within the poll budget is used as-is.
async fn wait_for_dom_stable(page: &Page, url: &str) -> Result<(), BrowserError> {
    let mut previous: Option<u64> = None;
    for _ in 0..DOM_STABLE_POLLS {
        tokio::time::sleep(DOM_STABLE_INTERVAL).await;
        let size: u64 = page
            .evaluate(DOM_SIZE_SCRIPT)
            .await
            .map_err(|e| BrowserError::Page {
                op: "dom_snapshot",
                reason: e.to_string(),
            })?
            .into_value()
            .unwrap_or(0);

        if let Some(previous) = previous
            && dom_settled(previous, size)
        {
            return Ok(());
        }
        previous = Some(size);
    }

    tracing::debug!(url, "page kept changing, proceeding with current DOM");
    Ok(())
}

/// Persist a PNG under the scratch directory with a timestamped name.
async fn write_screenshot(bytes: &[u8]) -> Result<String, BrowserError> {
    let filename = format!("{}.png", chrono::Local::now().format("%Y-%m-%d-%H-%M-%S"));
    let path = format!("{SCREENSHOT_DIR}/{filename}");

    tokio::fs::create_dir_all(SCREENSHOT_DIR)
        .await
        .map_err(|source| BrowserError::Screenshot { source })?;
    tokio::fs::write(&path, bytes)
        .await
        .map_err(|source| BrowserError::Screenshot { source })?;

    Ok(filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_resources_are_blocked() {
        for blocked in [
            ResourceType::Image,
            ResourceType::Stylesheet,
            ResourceType::Font,
            ResourceType::Media,
            ResourceType::Manifest,
            ResourceType::Other,
        ] {
            assert!(is_blocked_resource(&blocked), "{blocked:?}");
        }
        for allowed in [
            ResourceType::Document,
            ResourceType::Script,
            ResourceType::Xhr,
            ResourceType::Fetch,
        ] {
            assert!(!is_blocked_resource(&allowed), "{allowed:?}");
        }
    }

    #[test]
    fn dom_settles_within_tolerance_not_on_exact_equality() {
        // Identical snapshots are stable.
        assert!(dom_settled(10_000, 10_000));
        // A ticking timestamp or live region moves the size a little;
        // still stable.
        assert!(dom_settled(10_000, 10_300));
        assert!(dom_settled(10_000, 9_700));
        // Content still streaming in is not.
        assert!(!dom_settled(10_000, 15_000));
        assert!(!dom_settled(10_000, 4_000));
        // An initially empty document never divides by zero.
        assert!(!dom_settled(0, 5_000));
    }

    #[test]
    fn screenshot_names_are_timestamped_pngs() {
        let name = format!("{}.png", chrono::Local::now().format("%Y-%m-%d-%H-%M-%S"));
        assert!(name.ends_with(".png"));
        assert_eq!(name.len(), "2024-01-02-15-04-05.png".len());
    }
}
