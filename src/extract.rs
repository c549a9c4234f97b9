use std::time::Duration;

use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};

use crate::browser::PageSession;
use crate::link::is_absolute_http;

// ── Constants ────────────────────────────────────────────────────────────────

const NOTE_CONTAINER_SELECTOR: &str = "#noteContainer";
const TITLE_SELECTOR: &str = "#detail-title";
const DESC_SELECTOR: &str = "#detail-desc";
const IMAGE_SELECTOR: &str = ".swiper-slide img";
const VIDEO_SELECTOR: &str = "video";

const BLOCK_TAGS: &[&str] = &["p", "div", "li", "section", "h1", "h2", "h3", "h4", "h5", "h6"];

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum FieldError {
    #[error("invalid selector {0}")]
    Selector(String),
    #[error("no element matches {0}")]
    Missing(&'static str),
    #[error("page snapshot unavailable: {0}")]
    Snapshot(String),
}

// ── Public result type ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostMetadata {
    pub title: String,
    pub description: String,
    pub images: Vec<String>,
    pub video_sources: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct DomTimeouts {
    pub container: Duration,
    pub query: Duration,
}

// ── Public API ───────────────────────────────────────────────────────────────

/// Read post metadata from a rendered page. Never fails: each field falls
/// back to its empty value on its own.
pub async fn extract_metadata(session: &mut dyn PageSession, timeouts: DomTimeouts) -> PostMetadata {
    if let Err(e) = session
        .wait_for_selector(NOTE_CONTAINER_SELECTOR, timeouts.container)
        .await
    {
        warn!("note container not found: {}", e);
    }

    let html = session
        .html(timeouts.query)
        .await
        .map_err(|e| FieldError::Snapshot(e.to_string()));

    match html {
        Ok(html) => extract_from_html(&html),
        Err(e) => {
            warn!("{}", e);
            PostMetadata::default()
        }
    }
}

pub fn extract_from_html(html: &str) -> PostMetadata {
    let document = Html::parse_document(html);

    let title = or_default("title", read_title(&document));
    let description = or_default("description", read_description(&document));
    let images = or_default("images", read_images(&document));
    let video_sources = or_default("video sources", read_video_sources(&document));

    debug!(
        images = images.len(),
        videos = video_sources.len(),
        "metadata extracted"
    );

    PostMetadata {
        title,
        description,
        images,
        video_sources,
    }
}

fn or_default<T: Default>(field: &str, result: Result<T, FieldError>) -> T {
    result.unwrap_or_else(|e| {
        warn!("could not read {}: {}", field, e);
        T::default()
    })
}

// ── Field readers ────────────────────────────────────────────────────────────

fn selector(css: &'static str) -> Result<Selector, FieldError> {
    Selector::parse(css).map_err(|e| FieldError::Selector(format!("{}: {}", css, e)))
}

fn first<'doc>(document: &'doc Html, css: &'static str) -> Result<ElementRef<'doc>, FieldError> {
    let sel = selector(css)?;
    document.select(&sel).next().ok_or(FieldError::Missing(css))
}

fn read_title(document: &Html) -> Result<String, FieldError> {
    let el = first(document, TITLE_SELECTOR)?;
    Ok(collect_text(el).trim().to_string())
}

fn read_description(document: &Html) -> Result<String, FieldError> {
    let el = first(document, DESC_SELECTOR)?;
    Ok(inner_text(el).trim().to_string())
}

fn read_images(document: &Html) -> Result<Vec<String>, FieldError> {
    let sel = selector(IMAGE_SELECTOR)?;
    Ok(document
        .select(&sel)
        .filter_map(|img| {
            let v = img.value();
            v.attr("src")
                .filter(|s| !s.is_empty())
                .or_else(|| v.attr("data-src"))
                .map(str::trim)
                .filter(|s| is_absolute_http(s))
                .map(str::to_string)
        })
        .collect())
}

fn read_video_sources(document: &Html) -> Result<Vec<String>, FieldError> {
    let sel = selector(VIDEO_SELECTOR)?;
    Ok(document
        .select(&sel)
        .filter_map(|video| video.value().attr("src"))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect())
}

// ── DOM utility helpers ──────────────────────────────────────────────────────

/// Recursively collect all text from an element and its descendants.
fn collect_text(el: ElementRef<'_>) -> String {
    use scraper::node::Node;
    let mut parts = Vec::new();
    for child in el.children() {
        match child.value() {
            Node::Text(text) => parts.push((&*text.text).to_string()),
            Node::Element(_) => {
                if let Some(child_el) = ElementRef::wrap(child) {
                    parts.push(collect_text(child_el));
                }
            }
            _ => {}
        }
    }
    parts.join("")
}

/// Approximate rendered text: `<br>` and block boundaries become newlines,
/// runs of inline whitespace collapse, scripts are dropped.
fn inner_text(el: ElementRef<'_>) -> String {
    let mut out = String::new();
    render_inner_text(el, &mut out);
    out.lines()
        .map(normalize_line)
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_inner_text(el: ElementRef<'_>, out: &mut String) {
    use scraper::node::Node;
    for child in el.children() {
        match child.value() {
            Node::Text(text) => out.extend(
                text.chars()
                    .map(|c| if c.is_whitespace() { ' ' } else { c }),
            ),
            Node::Element(element) => {
                let name = element.name();
                if matches!(name, "script" | "style" | "noscript") {
                    continue;
                }
                if name == "br" {
                    out.push('\n');
                    continue;
                }
                if let Some(child_el) = ElementRef::wrap(child) {
                    let block = BLOCK_TAGS.contains(&name);
                    if block && !out.is_empty() && !out.ends_with('\n') {
                        out.push('\n');
                    }
                    render_inner_text(child_el, out);
                    if block && !out.ends_with('\n') {
                        out.push('\n');
                    }
                }
            }
            _ => {}
        }
    }
}

/// Collapse whitespace and trim within one line.
fn normalize_line(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}
