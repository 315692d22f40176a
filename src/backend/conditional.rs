//! Conditional request handling and the response shapes every backend emits.

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, NaiveDateTime, Utc};

use crate::cache::ResourceStat;

/// IMF-fixdate, the RFC1123 form used by HTTP.
pub const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Legacy size header, kept next to `Content-Length` for older clients.
pub static CONTENT_SIZE: HeaderName = HeaderName::from_static("content-size");

/// The parts of an inbound request a backend looks at.
#[derive(Debug, Clone)]
pub struct ResourceRequest {
  pub method: Method,
  pub headers: HeaderMap,
}

impl ResourceRequest {
  pub fn new(method: Method, headers: HeaderMap) -> Self {
    Self { method, headers }
  }

  pub fn is_head(&self) -> bool {
    self.method == Method::HEAD
  }

  pub fn is_read(&self) -> bool {
    self.method == Method::GET || self.method == Method::HEAD
  }

  fn header(&self, name: &HeaderName) -> Option<&str> {
    self
      .headers
      .get(name)
      .and_then(|v| v.to_str().ok())
      .filter(|v| !v.is_empty())
  }

  pub fn if_none_match(&self) -> Option<&str> {
    self.header(&header::IF_NONE_MATCH)
  }

  /// `If-Modified-Since`, ignored when it is not a valid HTTP date.
  pub fn if_modified_since(&self) -> Option<DateTime<Utc>> {
    self
      .header(&header::IF_MODIFIED_SINCE)
      .and_then(parse_http_date)
  }

  /// Whether the client already holds the version described by `stat`.
  pub fn is_not_modified(&self, stat: &ResourceStat) -> bool {
    if let Some(tag) = self.if_none_match() {
      if tag.eq_ignore_ascii_case(&stat.etag) {
        return true;
      }
    }
    matches!(self.if_modified_since(), Some(since) if since >= stat.last_modified)
  }
}

pub fn format_http_date(time: &DateTime<Utc>) -> String {
  time.format(HTTP_DATE_FORMAT).to_string()
}

/// Parse an RFC1123 date. Accepts the GMT form as well as numeric and
/// `UTC` zones.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
  let value = value.trim();
  DateTime::parse_from_rfc2822(value)
    .map(|t| t.with_timezone(&Utc))
    .ok()
    .or_else(|| {
      NaiveDateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S UTC")
        .ok()
        .map(|t| t.and_utc())
    })
}

fn validator_headers(stat: &ResourceStat, cache_control: Option<&HeaderValue>) -> HeaderMap {
  let mut headers = HeaderMap::new();
  headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("none"));
  if let Ok(etag) = HeaderValue::from_str(&stat.etag) {
    headers.insert(header::ETAG, etag);
  }
  if let Ok(modified) = HeaderValue::from_str(&format_http_date(&stat.last_modified)) {
    headers.insert(header::LAST_MODIFIED, modified);
  }
  if let Some(cache_control) = cache_control {
    headers.insert(header::CACHE_CONTROL, cache_control.clone());
  }
  headers
}

pub fn method_not_allowed() -> Response {
  (
    StatusCode::METHOD_NOT_ALLOWED,
    [(header::ALLOW, HeaderValue::from_static("GET,HEAD"))],
  )
    .into_response()
}

pub fn not_found() -> Response {
  StatusCode::NOT_FOUND.into_response()
}

pub fn not_modified(stat: &ResourceStat, cache_control: Option<&HeaderValue>) -> Response {
  (
    StatusCode::NOT_MODIFIED,
    validator_headers(stat, cache_control),
  )
    .into_response()
}

/// 200 with validators and size; `body` is empty for HEAD.
pub fn found(
  stat: &ResourceStat,
  size: u64,
  body: Body,
  cache_control: Option<&HeaderValue>,
) -> Response {
  let mut headers = validator_headers(stat, cache_control);
  headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
  headers.insert(CONTENT_SIZE.clone(), HeaderValue::from(size));
  (StatusCode::OK, headers, body).into_response()
}
