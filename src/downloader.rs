use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use reqwest::Url;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::error::StationError;

/// Save callback invoked once per successfully downloaded file.
pub type SaveHandler<'a> = &'a mut dyn FnMut(NaiveDate, &[u8], &str);

pub trait PublicationClient: Send + Sync {
    /// Publication date scraped from the index page.
    fn fetch_current_data_date(&self, page_url: &str) -> Result<NaiveDate, StationError>;

    /// Downloads every spreadsheet linked from the index page. A failure on
    /// one file is skipped; it never fails the batch.
    fn download_files(&self, page_url: &str, save: SaveHandler<'_>) -> Result<(), StationError>;
}

#[derive(Clone)]
pub struct HttpPublicationClient {
    client: Client,
}

impl HttpPublicationClient {
    pub fn new() -> Result<Self, StationError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("uke-stations/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| StationError::IndexHttp(err.to_string()))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| StationError::IndexHttp(err.to_string()))?;

        Ok(Self { client })
    }

    fn fetch_index_page(&self, page_url: &str) -> Result<String, StationError> {
        let response = self
            .client
            .get(page_url)
            .send()
            .map_err(|err| StationError::IndexHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "index request failed".to_string());
            return Err(StationError::IndexStatus { status, message });
        }
        response
            .text()
            .map_err(|err| StationError::IndexHttp(err.to_string()))
    }

    fn download_one(&self, url: &Url) -> Result<Vec<u8>, StationError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .map_err(|err| StationError::DownloadHttp(err.to_string()))?;
        if !response.status().is_success() {
            return Err(StationError::DownloadHttp(format!(
                "{url} returned status {}",
                response.status().as_u16()
            )));
        }
        let bytes = response
            .bytes()
            .map_err(|err| StationError::DownloadHttp(err.to_string()))?;
        Ok(bytes.to_vec())
    }
}

impl PublicationClient for HttpPublicationClient {
    fn fetch_current_data_date(&self, page_url: &str) -> Result<NaiveDate, StationError> {
        let html = self.fetch_index_page(page_url)?;
        extract_publication_date(&html).ok_or(StationError::MissingPublicationDate)
    }

    fn download_files(&self, page_url: &str, save: SaveHandler<'_>) -> Result<(), StationError> {
        let html = self.fetch_index_page(page_url)?;
        let date = extract_publication_date(&html).ok_or(StationError::MissingPublicationDate)?;
        let base = Url::parse(page_url).map_err(|err| StationError::IndexHttp(err.to_string()))?;

        for link in extract_xlsx_links(&html) {
            let Some(url) = resolve_link(&base, &link) else {
                tracing::warn!(link, "skipping unresolvable spreadsheet link");
                continue;
            };
            let Some(file_name) = last_path_segment(&url) else {
                tracing::warn!(%url, "skipping link without a file name");
                continue;
            };
            match self.download_one(&url) {
                Ok(data) => save(date, &data, &file_name),
                Err(err) => {
                    tracing::warn!(%url, error = %err, "skipping failed download");
                }
            }
        }
        Ok(())
    }
}

/// All `href` values ending in `.xlsx`, in page order.
pub fn extract_xlsx_links(html: &str) -> Vec<String> {
    let pattern = Regex::new(r#"href="([^"]+\.xlsx)""#).unwrap();
    pattern
        .captures_iter(html)
        .map(|captures| captures[1].to_string())
        .collect()
}

/// Last-modified date of the publication: a labeled table cell followed by a
/// bolded date, with the first bare `YYYY-MM-DD` substring as fallback.
pub fn extract_publication_date(html: &str) -> Option<NaiveDate> {
    extract_date_from_table_cell(html).or_else(|| extract_first_bare_date(html))
}

fn extract_date_from_table_cell(html: &str) -> Option<NaiveDate> {
    let pattern =
        Regex::new(r"Data ostatniej modyfikacji:\s*</td>\s*<td>\s*<strong>([^<]+)</strong>")
            .unwrap();
    let captures = pattern.captures(html)?;
    parse_publication_date(captures[1].trim())
}

fn extract_first_bare_date(html: &str) -> Option<NaiveDate> {
    let pattern = Regex::new(r"\d{4}-\d{2}-\d{2}").unwrap();
    let found = pattern.find(html)?;
    parse_publication_date(found.as_str())
}

/// Accepted formats, first match wins: `dd.MM.yyyy HH:mm`, `dd.MM.yyyy`,
/// `yyyy-MM-dd`. Only the civil date is kept.
pub fn parse_publication_date(value: &str) -> Option<NaiveDate> {
    if let Ok(datetime) = NaiveDateTime::parse_from_str(value, "%d.%m.%Y %H:%M") {
        return Some(datetime.date());
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%d.%m.%Y") {
        return Some(date);
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()
}

fn resolve_link(base: &Url, link: &str) -> Option<Url> {
    if link.starts_with("http") {
        Url::parse(link).ok()
    } else {
        base.join(link).ok()
    }
}

fn last_path_segment(url: &Url) -> Option<String> {
    url.path_segments()?
        .next_back()
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
}
