use std::{borrow::Cow, time::Duration};

use futures::future::BoxFuture;
use hyper::{
    body::Bytes,
    header::{self, HeaderName, HeaderValue},
    HeaderMap, Method, StatusCode,
};
use serde::de::DeserializeOwned;
use thiserror::Error;
use url::Url;

/// Whether a transport should follow `3xx` responses on its own.
///
/// Has no default. The login flow branches on 200 vs 302 vs 401, so every request states its
/// policy explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redirects {
    Follow,
    Manual,
}

/// Body of an outgoing request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Body {
    #[default]
    Empty,
    /// `application/x-www-form-urlencoded` pairs, in order. Keys may repeat.
    Form(Vec<(String, String)>),
}

/// A single HTTP request, independent of the library that ends up sending it.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub params: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Body,
    pub redirects: Redirects,
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>, redirects: Redirects) -> Self {
        Self {
            method,
            url: url.into(),
            params: Vec::new(),
            headers: HeaderMap::new(),
            body: Body::Empty,
            redirects,
            timeout: None,
        }
    }

    pub fn get(url: impl Into<String>, redirects: Redirects) -> Self {
        Self::new(Method::GET, url, redirects)
    }

    pub fn post(url: impl Into<String>, redirects: Redirects) -> Self {
        Self::new(Method::POST, url, redirects)
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn params<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.params
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn form(mut self, form: Vec<(String, String)>) -> Self {
        self.body = Body::Form(form);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The request url with `params` appended to its query string.
    pub fn full_url(&self) -> Result<Url, TransportError> {
        let mut url =
            Url::parse(&self.url).map_err(|err| TransportError::InvalidUrl(self.url.clone(), err))?;
        if !self.params.is_empty() {
            url.query_pairs_mut().extend_pairs(&self.params);
        }
        Ok(url)
    }
}

/// A fully buffered HTTP response.
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    url: String,
    headers: HeaderMap,
    body: Bytes,
}

impl Response {
    pub fn new(
        status: StatusCode,
        url: impl Into<String>,
        headers: HeaderMap,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            status,
            url: url.into(),
            headers,
            body: body.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The url this response was served from, after any followed redirects.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn bytes(&self) -> &Bytes {
        &self.body
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn is_redirect(&self) -> bool {
        self.status == StatusCode::FOUND
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    /// The `Location` header, resolved against [`Response::url`] when relative.
    pub fn location(&self) -> Option<String> {
        let location = self.headers.get(header::LOCATION)?.to_str().ok()?;
        match Url::parse(&self.url).and_then(|base| base.join(location)) {
            Ok(url) => Some(url.into()),
            Err(_) => Some(location.to_owned()),
        }
    }
}

/// A transport that blocks the calling thread until the response arrives.
pub trait Transport: Send {
    fn execute(&mut self, request: &Request) -> Result<Response, TransportError>;

    /// Headers sent with every request issued through this transport.
    fn headers_mut(&mut self) -> &mut HeaderMap;
}

/// A transport that suspends the calling task while the response is pending.
pub trait AsyncTransport: Send {
    fn execute<'a>(
        &'a mut self,
        request: &'a Request,
    ) -> BoxFuture<'a, Result<Response, TransportError>>;

    /// Headers sent with every request issued through this transport.
    fn headers_mut(&mut self) -> &mut HeaderMap;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn execute(&mut self, request: &Request) -> Result<Response, TransportError> {
        (**self).execute(request)
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        (**self).headers_mut()
    }
}

impl<T: AsyncTransport + ?Sized> AsyncTransport for &mut T {
    fn execute<'a>(
        &'a mut self,
        request: &'a Request,
    ) -> BoxFuture<'a, Result<Response, TransportError>> {
        (**self).execute(request)
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        (**self).headers_mut()
    }
}

/// Represents errors raised while sending a request.
///
/// These are never interpreted by the login flow; they reach the caller unchanged.
#[derive(Debug, Error)]
pub enum TransportError {
    /// An argument to build the HTTP request was invalid.
    /// See more [here](https://docs.rs/http/0.2.8/http/request/struct.Builder.html#errors)
    #[error("an argument while building an HTTP request was invalid")]
    MalformedHttpArgs(#[from] hyper::http::Error),
    /// Failed to send HTTP request.
    #[error("failed to send HTTP request")]
    HttpRequestFailed(#[from] hyper::Error),
    /// The request url could not be parsed.
    #[error("invalid request url `{0}`")]
    InvalidUrl(String, #[source] url::ParseError),
    /// No response arrived within the request's timeout.
    #[error("request to `{0}` timed out")]
    Timeout(String),
    /// A redirect chain was longer than the transport allows.
    #[error("gave up after {0} redirects")]
    TooManyRedirects(usize),
    /// Error raised by a transport outside of this crate.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_url_appends_params() {
        let request = Request::get("http://authserver.cqu.edu.cn/authserver/login", Redirects::Manual)
            .param("service", "https://my.cqu.edu.cn/?a=1&b=2");
        assert_eq!(
            request.full_url().unwrap().as_str(),
            "http://authserver.cqu.edu.cn/authserver/login?service=https%3A%2F%2Fmy.cqu.edu.cn%2F%3Fa%3D1%26b%3D2"
        );
    }

    #[test]
    fn location_is_resolved_against_response_url() {
        let mut headers = HeaderMap::new();
        headers.insert(header::LOCATION, HeaderValue::from_static("/authserver/index.do"));
        let response = Response::new(
            StatusCode::FOUND,
            "http://authserver.cqu.edu.cn/authserver/login",
            headers,
            Bytes::new(),
        );
        assert!(response.is_redirect());
        assert_eq!(
            response.location().as_deref(),
            Some("http://authserver.cqu.edu.cn/authserver/index.do")
        );
    }
}
