//! Request and response values exchanged between the agent, the network and the store.

use bytes::Bytes;
use color_eyre::{eyre::eyre, Report, Result};
use std::fmt;
use std::str::FromStr;

/// HTTP request method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Method {
  #[default]
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
  Options,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Get => "GET",
      Self::Head => "HEAD",
      Self::Post => "POST",
      Self::Put => "PUT",
      Self::Patch => "PATCH",
      Self::Delete => "DELETE",
      Self::Options => "OPTIONS",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Method {
  type Err = Report;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Self::Get),
      "HEAD" => Ok(Self::Head),
      "POST" => Ok(Self::Post),
      "PUT" => Ok(Self::Put),
      "PATCH" => Ok(Self::Patch),
      "DELETE" => Ok(Self::Delete),
      "OPTIONS" => Ok(Self::Options),
      other => Err(eyre!("Unknown request method: {}", other)),
    }
  }
}

/// An outbound resource request observed by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: String,
  pub headers: Vec<(String, String)>,
}

impl Request {
  pub fn new(method: Method, url: impl Into<String>) -> Self {
    Self {
      method,
      url: url.into(),
      headers: Vec::new(),
    }
  }

  /// Shorthand for a plain GET request.
  pub fn get(url: impl Into<String>) -> Self {
    Self::new(Method::Get, url)
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// The URL used as the storage identity of this request (fragment stripped).
  pub fn cache_url(&self) -> &str {
    match self.url.split_once('#') {
      Some((url, _)) => url,
      None => &self.url,
    }
  }
}

/// How a response may be inspected, mirroring the fetch response types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
  /// Same-origin response, fully readable and safe to replay offline
  Basic,
  /// Cross-origin response obtained with CORS
  Cors,
  /// Cross-origin response whose contents are hidden
  Opaque,
  /// Network error placeholder
  Error,
}

impl ResponseKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Basic => "basic",
      Self::Cors => "cors",
      Self::Opaque => "opaque",
      Self::Error => "error",
    }
  }
}

impl fmt::Display for ResponseKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ResponseKind {
  type Err = Report;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "basic" => Ok(Self::Basic),
      "cors" => Ok(Self::Cors),
      "opaque" => Ok(Self::Opaque),
      "error" => Ok(Self::Error),
      other => Err(eyre!("Unknown response kind: {}", other)),
    }
  }
}

/// A response body that can be read exactly once.
///
/// `Body` is deliberately not `Clone`; the only way to get a second readable
/// copy is [`Response::tee`], which consumes the original.
#[derive(Debug)]
pub struct Body(Bytes);

impl Body {
  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn into_bytes(self) -> Bytes {
    self.0
  }
}

/// A captured network or cached response.
#[derive(Debug)]
pub struct Response {
  status: u16,
  kind: ResponseKind,
  headers: Vec<(String, String)>,
  body: Body,
}

impl Response {
  pub fn new(status: u16, kind: ResponseKind, body: impl Into<Bytes>) -> Self {
    Self {
      status,
      kind,
      headers: Vec::new(),
      body: Body(body.into()),
    }
  }

  pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
    self.headers = headers;
    self
  }

  pub fn status(&self) -> u16 {
    self.status
  }

  pub fn kind(&self) -> ResponseKind {
    self.kind
  }

  pub fn headers(&self) -> &[(String, String)] {
    &self.headers
  }

  pub fn body(&self) -> &Body {
    &self.body
  }

  /// Whether the status is in the 2xx range.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Split into two independent responses carrying the same status, headers and body.
  pub fn tee(self) -> (Response, Response) {
    let copy = Response {
      status: self.status,
      kind: self.kind,
      headers: self.headers.clone(),
      body: Body(self.body.0.clone()),
    };
    (self, copy)
  }

  /// Consume the response, yielding its body bytes.
  pub fn into_body(self) -> Bytes {
    self.body.into_bytes()
  }

  /// Consume the response into its parts.
  pub fn into_parts(self) -> (u16, ResponseKind, Vec<(String, String)>, Bytes) {
    (self.status, self.kind, self.headers, self.body.into_bytes())
  }
}
