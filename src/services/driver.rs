//! Page driver for the target image-to-video site.
//!
//! The target exposes no API; everything here is heuristic discovery over
//! whatever markup the page happens to serve, with bounded polling around
//! every step. Element lookup mirrors the usual drill for an uncontrolled
//! third-party UI: CSS selectors first, then fuzzy text matching on control
//! labels (the site ships localized labels, so matching is multilingual and
//! typo-tolerant).

use std::time::Duration;

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};

/// Everything the driver needs to process one queue item.
#[derive(Debug, Clone)]
pub struct DispatchedItem {
    pub index: usize,
    pub name: String,
    pub payload: Vec<u8>,
    pub prompt: Option<String>,
}

/// Result of a successful automation pass.
#[derive(Debug, Clone)]
pub struct ItemOutcome {
    /// URL of the final (post-upscale) video.
    pub video_url: String,
}

/// Per-item failure taxonomy. The walker handles every variant the same
/// way (mark failed, advance), so the split exists for logs and tests.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("element not found within timeout: {0}")]
    ElementNotFound(&'static str),

    #[error("image upload failed: {0}")]
    UploadFailed(String),

    #[error("video generation not detected: {0}")]
    GenerationNotDetected(String),

    #[error("video download failed: {0}")]
    DownloadFailed(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Seam between the queue walker and the target site, so tests can script
/// outcomes without a live page.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Run the full automation sequence for one item and return the final
    /// video URL.
    async fn process(&mut self, item: &DispatchedItem) -> Result<ItemOutcome, DriverError>;

    /// Fetch the raw bytes of a result video.
    async fn fetch_video(&self, url: &str) -> Result<Vec<u8>, DriverError>;

    /// Discard the current session context (watchdog restart path).
    fn reset(&mut self);
}

const CONTROL_POLL_INTERVAL: Duration = Duration::from_millis(300);
const CONTROL_BUDGET: Duration = Duration::from_secs(10);
const VIDEO_POLL_INTERVAL: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const UPLOAD_SYNONYMS: &[&str] = &["upload a file", "upload file", "carregar um arquivo"];
const GENERATE_SYNONYMS: &[&str] = &["make a video", "fazer vídeo", "fazer video", "generate"];
const UPSCALE_SYNONYMS: &[&str] = &[
    "upscale",
    "upscale video",
    "upscale vídeo",
    "aprimorar",
    "melhorar qualidade",
];

/// HTTP-session driver against the live site.
pub struct HttpPageDriver {
    http: reqwest::Client,
    base_url: String,
    generation_timeout: Duration,
}

impl HttpPageDriver {
    pub fn new(base_url: &str, generation_timeout: Duration) -> Result<Self, DriverError> {
        Ok(Self {
            http: Self::build_client()?,
            base_url: base_url.to_string(),
            generation_timeout,
        })
    }

    fn build_client() -> Result<reqwest::Client, DriverError> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .user_agent("Mozilla/5.0 (compatible; imagine-batch/0.1)")
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(http)
    }

    async fn load_page(&self) -> Result<String, DriverError> {
        let response = self.http.get(&self.base_url).send().await?;
        Ok(response.text().await?)
    }

    /// Re-fetch the page until `find` locates something or the budget runs
    /// out. Element lookups on this page come and go as the SPA re-renders,
    /// so a single fetch proves nothing.
    async fn poll_for(
        &self,
        what: &'static str,
        find: impl Fn(&str) -> Option<String>,
    ) -> Result<String, DriverError> {
        let deadline = tokio::time::Instant::now() + CONTROL_BUDGET;
        loop {
            let html = self.load_page().await?;
            if let Some(found) = find(&html) {
                return Ok(found);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DriverError::ElementNotFound(what));
            }
            tokio::time::sleep(CONTROL_POLL_INTERVAL).await;
        }
    }

    /// Poll for a result video URL, skipping one already seen this item
    /// (the pre-upscale render, or the pre-prompt render).
    async fn poll_for_video(&self, skip: Option<&str>) -> Result<String, DriverError> {
        let deadline = tokio::time::Instant::now() + self.generation_timeout;
        loop {
            let html = self.load_page().await?;
            if let Some(url) = find_video_url(&html, &self.base_url, skip) {
                return Ok(url);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DriverError::GenerationNotDetected(format!(
                    "no video element appeared within {}s",
                    self.generation_timeout.as_secs()
                )));
            }
            tokio::time::sleep(VIDEO_POLL_INTERVAL).await;
        }
    }

    async fn upload(&self, url: &str, item: &DispatchedItem) -> Result<(), DriverError> {
        let part = reqwest::multipart::Part::bytes(item.payload.clone())
            .file_name(item.name.clone())
            .mime_str("application/octet-stream")
            .map_err(|e| DriverError::UploadFailed(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self.http.post(url).multipart(form).send().await?;
        if !response.status().is_success() {
            return Err(DriverError::UploadFailed(format!(
                "site returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn trigger_generation(
        &self,
        url: &str,
        prompt_field: Option<String>,
        prompt: Option<&str>,
    ) -> Result<(), DriverError> {
        let mut params: Vec<(String, String)> = Vec::new();
        if let (Some(field), Some(text)) = (prompt_field, prompt) {
            params.push((field, text.to_string()));
        }

        let response = self.http.post(url).form(&params).send().await?;
        if !response.status().is_success() {
            return Err(DriverError::GenerationNotDetected(format!(
                "generation request returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl PageDriver for HttpPageDriver {
    async fn process(&mut self, item: &DispatchedItem) -> Result<ItemOutcome, DriverError> {
        let base = self.base_url.clone();

        // 1. Attach control → upload endpoint.
        let upload_url = self
            .poll_for("attach file control", |h| find_upload_action(h, &base))
            .await?;
        self.upload(&upload_url, item).await?;

        // 2. Generate control, with the prompt submitted up front when set.
        let generate_url = self
            .poll_for("generate control", |h| find_generate_action(h, &base))
            .await?;
        let prompt_field = match item.prompt.as_deref() {
            Some(_) => Some(self.poll_for("prompt field", find_prompt_field).await?),
            None => None,
        };
        self.trigger_generation(&generate_url, prompt_field, item.prompt.as_deref())
            .await?;

        // 3. First render.
        let first_url = self.poll_for_video(None).await?;
        tracing::debug!(index = item.index, url = %first_url, "initial render detected");

        // 4. Upscale pass on the render we just saw.
        let upscale_url = self
            .poll_for("upscale menu entry", |h| {
                find_upscale_action(h, &base, &first_url)
            })
            .await?;
        let response = self.http.post(&upscale_url).send().await?;
        if !response.status().is_success() {
            return Err(DriverError::GenerationNotDetected(format!(
                "upscale request returned HTTP {}",
                response.status()
            )));
        }

        // 5. Upscaled render replaces the first one.
        let final_url = self.poll_for_video(Some(&first_url)).await?;
        Ok(ItemOutcome { video_url: final_url })
    }

    async fn fetch_video(&self, url: &str) -> Result<Vec<u8>, DriverError> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(DriverError::DownloadFailed(format!(
                "HTTP {}",
                response.status()
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }

    fn reset(&mut self) {
        // Fresh cookie jar and connection pool; on builder failure the old
        // session is kept rather than poisoning the driver.
        match Self::build_client() {
            Ok(client) => self.http = client,
            Err(e) => tracing::warn!(error = %e, "failed to rebuild session, reusing old one"),
        }
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Fuzzy label matching: containment first, then Jaro-Winkler similarity to
/// absorb typos and diacritic drift in the site's localized labels.
fn text_matches(text: &str, synonyms: &[&str]) -> bool {
    let text = normalize(text);
    if text.is_empty() {
        return false;
    }
    synonyms
        .iter()
        .any(|s| text.contains(s) || strsim::jaro_winkler(&text, s) >= 0.88)
}

fn absolutize(base_url: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") || href.starts_with("blob:") {
        return href.to_string();
    }
    match reqwest::Url::parse(base_url).and_then(|base| base.join(href)) {
        Ok(url) => url.to_string(),
        Err(_) => href.to_string(),
    }
}

/// Locate the upload endpoint: a form owning a file input (image-accepting
/// preferred), a menu entry labeled like "upload a file", or a bare file
/// input carrying an explicit endpoint attribute.
fn find_upload_action(html: &str, base_url: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let form_sel = Selector::parse("form").ok()?;
    let file_sel = Selector::parse("input[type=\"file\"]").ok()?;

    let forms: Vec<ElementRef> = doc
        .select(&form_sel)
        .filter(|form| form.select(&file_sel).next().is_some())
        .collect();

    let preferred = forms.iter().find(|form| {
        form.select(&file_sel)
            .any(|input| input.value().attr("accept").is_some_and(|a| a.contains("image")))
    });
    if let Some(action) = preferred
        .or(forms.first())
        .and_then(|form| form.value().attr("action"))
    {
        return Some(absolutize(base_url, action));
    }

    let item_sel = Selector::parse("[role=\"menuitem\"], a, button").ok()?;
    for entry in doc.select(&item_sel) {
        let label: String = entry.text().collect();
        if !text_matches(&label, UPLOAD_SYNONYMS) {
            continue;
        }
        if let Some(action) = entry
            .value()
            .attr("href")
            .or_else(|| entry.value().attr("data-action"))
        {
            return Some(absolutize(base_url, action));
        }
    }

    for input in doc.select(&file_sel) {
        if let Some(action) = input.value().attr("data-upload-url") {
            return Some(absolutize(base_url, action));
        }
    }

    None
}

/// Locate the generation endpoint via the "make a video" control: its
/// formaction/data-action, or the action of the form it sits in.
fn find_generate_action(html: &str, base_url: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let button_sel = Selector::parse("button, [role=\"button\"]").ok()?;

    for button in doc.select(&button_sel) {
        let label = match button.value().attr("aria-label") {
            Some(aria) => aria.to_string(),
            None => button.text().collect(),
        };
        if !text_matches(&label, GENERATE_SYNONYMS) {
            continue;
        }

        if let Some(action) = button
            .value()
            .attr("formaction")
            .or_else(|| button.value().attr("data-action"))
        {
            return Some(absolutize(base_url, action));
        }

        let form = button
            .ancestors()
            .filter_map(ElementRef::wrap)
            .find(|el| el.value().name() == "form");
        if let Some(action) = form.and_then(|f| f.value().attr("action")) {
            return Some(absolutize(base_url, action));
        }
    }

    None
}

/// Name of the prompt form field, defaulting to "prompt" when the field
/// carries no name of its own.
fn find_prompt_field(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let sel = Selector::parse("textarea, input[type=\"text\"], [role=\"textbox\"]").ok()?;

    for field in doc.select(&sel) {
        let aria = field.value().attr("aria-label").unwrap_or("");
        let named_prompt = field.value().attr("name") == Some("prompt");
        if named_prompt || text_matches(aria, GENERATE_SYNONYMS) {
            return Some(field.value().attr("name").unwrap_or("prompt").to_string());
        }
    }
    None
}

/// Find a result video URL in the page, skipping one already seen.
fn find_video_url(html: &str, base_url: &str, skip: Option<&str>) -> Option<String> {
    let doc = Html::parse_document(html);
    let candidates = [
        ("video", "src"),
        ("source[type=\"video/mp4\"]", "src"),
        ("a[href]", "href"),
    ];

    for (selector, attr) in candidates {
        let sel = Selector::parse(selector).ok()?;
        for el in doc.select(&sel) {
            let Some(value) = el.value().attr(attr) else {
                continue;
            };
            if !(value.starts_with("blob:") || value.contains(".mp4")) {
                continue;
            }
            let url = absolutize(base_url, value);
            if skip == Some(url.as_str()) {
                continue;
            }
            return Some(url);
        }
    }
    None
}

/// Upscale entry scoped to the container of the video we just rendered,
/// falling back to a page-wide search when the container yields nothing.
fn find_upscale_action(html: &str, base_url: &str, video_url: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let video_sel = Selector::parse("video, source").ok()?;
    let item_sel = Selector::parse("[role=\"menuitem\"], a, button").ok()?;

    let target = doc.select(&video_sel).find(|el| {
        el.value()
            .attr("src")
            .is_some_and(|src| absolutize(base_url, src) == video_url)
    });

    let mut scopes: Vec<ElementRef> = Vec::new();
    if let Some(video) = target {
        scopes.extend(video.ancestors().filter_map(ElementRef::wrap).take(6));
    }
    scopes.push(doc.root_element());

    for scope in scopes {
        for entry in scope.select(&item_sel) {
            let label: String = entry.text().collect();
            if !text_matches(&label, UPSCALE_SYNONYMS) {
                continue;
            }
            if let Some(action) = entry
                .value()
                .attr("href")
                .or_else(|| entry.value().attr("data-action"))
            {
                return Some(absolutize(base_url, action));
            }
        }
    }

    None
}
