//! Browsing backend used by the fetcher.
//!
//! The fetcher only needs a page it can navigate, inspect for an export
//! affordance, and download from within the same session. [`HttpBrowser`]
//! provides that over plain HTTP with a per-page cookie jar; pages that only
//! expose their export through client-side script are reported as having no
//! download target.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use reqwest::Url;
use reqwest::blocking::{Client, Response};
use reqwest::header::{CONTENT_DISPOSITION, HeaderMap, HeaderValue, USER_AGENT};
use scraper::{ElementRef, Html, Selector};

use crate::error::ParcelError;

pub trait Browser: Send + Sync {
    type Page: BrowserPage;

    /// Opens an isolated navigation context. Dropping the page tears it down.
    fn new_page(&self) -> Result<Self::Page, ParcelError>;
}

pub trait BrowserPage {
    fn goto(&mut self, url: &str, timeout: Duration) -> Result<(), ParcelError>;
    /// Absolute targets of every anchor on the current page, in document order.
    fn anchor_hrefs(&self) -> Vec<String>;
    fn find_control(&self, selector: &ControlSelector) -> Option<PageControl>;
    /// Fetches a resource with the page's session.
    fn fetch(&self, href: &str, timeout: Duration) -> Result<Vec<u8>, ParcelError>;
    fn trigger_download(
        &self,
        control: &PageControl,
        timeout: Duration,
    ) -> Result<Download, ParcelError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlElement {
    Any,
    Button,
    Anchor,
}

#[derive(Debug, Clone, Copy)]
pub struct ControlSelector {
    pub element: ControlElement,
    pub text: &'static str,
}

/// Export controls in the order they are tried.
pub const EXPORT_CONTROLS: &[ControlSelector] = &[
    ControlSelector {
        element: ControlElement::Any,
        text: "Export to KML",
    },
    ControlSelector {
        element: ControlElement::Any,
        text: "Export KML",
    },
    ControlSelector {
        element: ControlElement::Any,
        text: "Download KML",
    },
    ControlSelector {
        element: ControlElement::Button,
        text: "Export",
    },
    ControlSelector {
        element: ControlElement::Button,
        text: "KML",
    },
    ControlSelector {
        element: ControlElement::Anchor,
        text: "KML",
    },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageControl {
    pub element: ControlElement,
    pub label: String,
    pub target: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Download {
    pub bytes: Vec<u8>,
    pub suggested_filename: Option<String>,
}

#[derive(Clone)]
pub struct HttpBrowser {
    user_agent: String,
}

impl HttpBrowser {
    pub fn launch(user_agent: &str) -> Result<Self, ParcelError> {
        build_client(user_agent)?;
        Ok(Self {
            user_agent: user_agent.to_string(),
        })
    }
}

impl Browser for HttpBrowser {
    type Page = HttpPage;

    fn new_page(&self) -> Result<Self::Page, ParcelError> {
        Ok(HttpPage {
            client: build_client(&self.user_agent)?,
            url: None,
            html: String::new(),
        })
    }
}

fn build_client(user_agent: &str) -> Result<Client, ParcelError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(user_agent).map_err(|err| ParcelError::BrowserLaunch(err.to_string()))?,
    );
    Client::builder()
        .default_headers(headers)
        .cookie_store(true)
        .build()
        .map_err(|err| ParcelError::BrowserLaunch(err.to_string()))
}

pub struct HttpPage {
    client: Client,
    url: Option<Url>,
    html: String,
}

impl HttpPage {
    fn current_url(&self) -> String {
        self.url
            .as_ref()
            .map(Url::to_string)
            .unwrap_or_else(|| "about:blank".to_string())
    }

    fn get(&self, href: &str, timeout: Duration) -> Result<Response, ParcelError> {
        let url = resolve_href(self.url.as_ref(), href).ok_or_else(|| ParcelError::Download {
            url: href.to_string(),
            message: "unresolvable link".to_string(),
        })?;
        let response = self
            .client
            .get(url.as_str())
            .timeout(timeout)
            .send()
            .map_err(|err| {
                if err.is_timeout() {
                    ParcelError::DownloadTimeout { url: url.clone() }
                } else {
                    ParcelError::Download {
                        url: url.clone(),
                        message: err.to_string(),
                    }
                }
            })?;
        if !response.status().is_success() {
            return Err(ParcelError::PageStatus {
                url,
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }
}

impl BrowserPage for HttpPage {
    fn goto(&mut self, url: &str, timeout: Duration) -> Result<(), ParcelError> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .map_err(|err| {
                if err.is_timeout() {
                    ParcelError::NavigationTimeout {
                        url: url.to_string(),
                    }
                } else {
                    ParcelError::Navigation {
                        url: url.to_string(),
                        message: err.to_string(),
                    }
                }
            })?;
        if !response.status().is_success() {
            return Err(ParcelError::PageStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        self.url = Some(response.url().clone());
        self.html = response.text().map_err(|err| ParcelError::Navigation {
            url: url.to_string(),
            message: err.to_string(),
        })?;
        Ok(())
    }

    fn anchor_hrefs(&self) -> Vec<String> {
        extract_anchor_hrefs(&self.html, self.url.as_ref())
    }

    fn find_control(&self, selector: &ControlSelector) -> Option<PageControl> {
        find_control_in(&self.html, self.url.as_ref(), selector)
    }

    fn fetch(&self, href: &str, timeout: Duration) -> Result<Vec<u8>, ParcelError> {
        let response = self.get(href, timeout)?;
        let url = response.url().to_string();
        let bytes = response
            .bytes()
            .map_err(|err| ParcelError::Download {
                url,
                message: err.to_string(),
            })?;
        Ok(bytes.to_vec())
    }

    fn trigger_download(
        &self,
        control: &PageControl,
        timeout: Duration,
    ) -> Result<Download, ParcelError> {
        let target = control
            .target
            .as_deref()
            .ok_or_else(|| ParcelError::MissingDownloadTarget {
                url: self.current_url(),
            })?;
        let response = self.get(target, timeout)?;
        let suggested_filename = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .and_then(filename_from_disposition)
            .or_else(|| filename_from_url(response.url()));
        let url = response.url().to_string();
        let bytes = response
            .bytes()
            .map_err(|err| ParcelError::Download {
                url,
                message: err.to_string(),
            })?;
        Ok(Download {
            bytes: bytes.to_vec(),
            suggested_filename,
        })
    }
}

static DISPOSITION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)filename\*?\s*=\s*(?:UTF-8'')?"?([^";]+)"?"#).expect("valid regex")
});

/// Attributes that can carry a control's download target.
const TARGET_ATTRIBUTES: &[&str] = &["href", "data-href", "data-url", "formaction"];

fn visible_text(element: &ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn resolve_href(base: Option<&Url>, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    let resolved = match base {
        Some(base) => base.join(href).ok()?,
        None => Url::parse(href).ok()?,
    };
    Some(resolved.to_string())
}

pub fn extract_anchor_hrefs(html: &str, base: Option<&Url>) -> Vec<String> {
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    Html::parse_document(html)
        .select(&selector)
        .filter_map(|anchor| resolve_href(base, anchor.value().attr("href")?))
        .collect()
}

pub fn find_control_in(
    html: &str,
    base: Option<&Url>,
    selector: &ControlSelector,
) -> Option<PageControl> {
    let css = match selector.element {
        ControlElement::Any => "a, button",
        ControlElement::Button => "button",
        ControlElement::Anchor => "a",
    };
    let css = Selector::parse(css).ok()?;
    let wanted = selector.text.to_lowercase();

    Html::parse_document(html).select(&css).find_map(|element| {
        let label = visible_text(&element);
        if !label.to_lowercase().contains(&wanted) {
            return None;
        }
        let kind = if element.value().name().eq_ignore_ascii_case("button") {
            ControlElement::Button
        } else {
            ControlElement::Anchor
        };
        let target = TARGET_ATTRIBUTES
            .iter()
            .find_map(|name| element.value().attr(name))
            .and_then(|href| resolve_href(base, href));
        Some(PageControl {
            element: kind,
            label,
            target,
        })
    })
}

pub fn filename_from_disposition(header: &str) -> Option<String> {
    DISPOSITION_RE
        .captures(header)
        .and_then(|caps| caps.get(1))
        .map(|value| value.as_str().trim().to_string())
        .filter(|value| !value.is_empty())
}

fn filename_from_url(url: &Url) -> Option<String> {
    url.path_segments()?
        .next_back()
        .filter(|segment| segment.contains('.'))
        .map(str::to_string)
}
