//! Transports backed by a hyper [`Client`].

use std::{
    io,
    time::{SystemTime, UNIX_EPOCH},
};

use cookie::Cookie;
use futures::future::BoxFuture;
use hyper::{
    body,
    client::connect::Connect,
    header::{self, HeaderValue},
    Client, HeaderMap, Method, StatusCode,
};
use tokio::runtime::{self, Runtime};
use tracing::trace;
use url::Url;

use crate::transport::{AsyncTransport, Body, Redirects, Request, Response, Transport, TransportError};

const USER_AGENT: &str = concat!("cqu-auth/", env!("CARGO_PKG_VERSION"));
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
const DEFAULT_MAX_REDIRECTS: usize = 10;

/// An async transport that keeps cookies and default headers across requests.
#[derive(Debug)]
pub struct HttpSession<C> {
    client: Client<C, hyper::Body>,
    cookies: CookieStore,
    headers: HeaderMap,
    max_redirects: usize,
}

#[cfg(feature = "rustls")]
impl HttpSession<hyper_rustls::HttpsConnector<hyper::client::HttpConnector>> {
    /// Creates a session speaking both `http` and `https`, trusting the platform's root
    /// certificates.
    ///
    /// The legacy authserver is only reachable over plain `http`, hence no `https_only`.
    pub fn new() -> Self {
        Self::with_client(
            Client::builder().build(
                hyper_rustls::HttpsConnectorBuilder::new()
                    .with_native_roots()
                    .https_or_http()
                    .enable_http1()
                    .build(),
            ),
        )
    }
}

#[cfg(feature = "rustls")]
impl Default for HttpSession<hyper_rustls::HttpsConnector<hyper::client::HttpConnector>> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> HttpSession<C> {
    pub fn with_client(client: Client<C, hyper::Body>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
        Self {
            client,
            cookies: CookieStore::default(),
            headers,
            max_redirects: DEFAULT_MAX_REDIRECTS,
        }
    }

    pub fn with_max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    pub fn cookies(&self) -> &CookieStore {
        &self.cookies
    }

    pub fn cookies_mut(&mut self) -> &mut CookieStore {
        &mut self.cookies
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

impl<C> HttpSession<C>
where
    C: Connect + Clone + Send + Sync + 'static,
{
    /// Sends `request`, following redirects if it asks to.
    pub async fn send(&mut self, request: &Request) -> Result<Response, TransportError> {
        match request.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.send_following(request))
                .await
                .map_err(|_| TransportError::Timeout(request.url.clone()))?,
            None => self.send_following(request).await,
        }
    }

    async fn send_following(&mut self, request: &Request) -> Result<Response, TransportError> {
        let mut url = request.full_url()?;
        let mut method = request.method.clone();
        let mut body = request.body.clone();
        let mut hops = 0;
        loop {
            let response = self.send_once(&method, &url, &request.headers, &body).await?;
            if request.redirects == Redirects::Manual || !response.status().is_redirection() {
                return Ok(response);
            }
            let Some(location) = response.location() else {
                return Ok(response);
            };
            if hops == self.max_redirects {
                return Err(TransportError::TooManyRedirects(hops));
            }
            hops += 1;

            trace!(from = %url, to = %location, status = %response.status(), "following redirect");
            url = Url::parse(&location).map_err(|err| TransportError::InvalidUrl(location, err))?;
            if !matches!(
                response.status(),
                StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT
            ) {
                method = Method::GET;
                body = Body::Empty;
            }
        }
    }

    async fn send_once(
        &mut self,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        body: &Body,
    ) -> Result<Response, TransportError> {
        let mut merged = self.headers.clone();
        merged.extend(headers.clone());
        if let Some(cookies) = self.cookies.header_for(url) {
            merged.insert(
                header::COOKIE,
                HeaderValue::from_str(&cookies).map_err(hyper::http::Error::from)?,
            );
        }

        let body = match body {
            Body::Empty => hyper::Body::empty(),
            Body::Form(pairs) => {
                merged
                    .entry(header::CONTENT_TYPE)
                    .or_insert(HeaderValue::from_static(FORM_CONTENT_TYPE));
                hyper::Body::from(
                    url::form_urlencoded::Serializer::new(String::new())
                        .extend_pairs(pairs)
                        .finish(),
                )
            }
        };

        let mut http_request = hyper::Request::builder()
            .method(method.clone())
            .uri(url.as_str())
            .body(body)?;
        *http_request.headers_mut() = merged;

        let (parts, body) = self.client.request(http_request).await?.into_parts();
        let body = body::to_bytes(body).await?;
        self.cookies.store(url, &parts.headers);

        Ok(Response::new(parts.status, url.as_str(), parts.headers, body))
    }
}

impl<C> AsyncTransport for HttpSession<C>
where
    C: Connect + Clone + Send + Sync + 'static,
{
    fn execute<'a>(
        &'a mut self,
        request: &'a Request,
    ) -> BoxFuture<'a, Result<Response, TransportError>> {
        Box::pin(self.send(request))
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }
}

/// A blocking transport running an [`HttpSession`] on its own single-threaded runtime.
///
/// Blocking inside another tokio runtime panics, so use [`HttpSession`] directly from async code.
#[derive(Debug)]
pub struct BlockingSession<C> {
    session: HttpSession<C>,
    runtime: Runtime,
}

#[cfg(feature = "rustls")]
impl BlockingSession<hyper_rustls::HttpsConnector<hyper::client::HttpConnector>> {
    pub fn new() -> io::Result<Self> {
        Self::from_session(HttpSession::new())
    }
}

impl<C> BlockingSession<C> {
    pub fn from_session(session: HttpSession<C>) -> io::Result<Self> {
        Ok(Self {
            session,
            runtime: runtime::Builder::new_current_thread().enable_all().build()?,
        })
    }

    pub fn session(&self) -> &HttpSession<C> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut HttpSession<C> {
        &mut self.session
    }

    pub fn into_session(self) -> HttpSession<C> {
        self.session
    }
}

impl<C> Transport for BlockingSession<C>
where
    C: Connect + Clone + Send + Sync + 'static,
{
    fn execute(&mut self, request: &Request) -> Result<Response, TransportError> {
        self.runtime.block_on(self.session.send(request))
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.session.headers
    }
}

/// Cookies collected from `Set-Cookie` headers, sent back to matching urls.
#[derive(Debug, Clone, Default)]
pub struct CookieStore {
    cookies: Vec<StoredCookie>,
}

#[derive(Debug, Clone)]
struct StoredCookie {
    cookie: Cookie<'static>,
    domain: String,
    host_only: bool,
    path: String,
    secure: bool,
    // Unix seconds; `None` lasts for the session.
    expires_at: Option<i64>,
}

impl StoredCookie {
    fn matches(&self, host: &str, path: &str, https: bool, now: i64) -> bool {
        (https || !self.secure)
            && self.expires_at.map_or(true, |expires_at| expires_at > now)
            && domain_matches(host, &self.domain, self.host_only)
            && path_matches(path, &self.path)
    }
}

impl CookieStore {
    /// Records every `Set-Cookie` header of a response received from `url`.
    pub fn store(&mut self, url: &Url, headers: &HeaderMap) {
        let Some(host) = url.host_str().map(str::to_ascii_lowercase) else {
            return;
        };
        let now = unix_now();

        // If it can't be parsed then skip it
        let cookies = headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(|raw| Cookie::parse(raw.to_owned()).ok());

        for cookie in cookies {
            let (domain, host_only) = match cookie.domain() {
                Some(domain) => {
                    let domain = domain.trim_start_matches('.').to_ascii_lowercase();
                    if !domain_matches(&host, &domain, false) {
                        continue;
                    }
                    (domain, false)
                }
                None => (host.clone(), true),
            };
            let path = cookie
                .path()
                .filter(|path| path.starts_with('/'))
                .map_or_else(|| default_path(url), str::to_owned);
            let expires_at = match cookie.max_age() {
                Some(max_age) => Some(now.saturating_add(max_age.whole_seconds())),
                None => cookie.expires_datetime().map(|expires| expires.unix_timestamp()),
            };

            self.cookies.retain(|stored| {
                !(stored.cookie.name() == cookie.name()
                    && stored.domain == domain
                    && stored.path == path)
            });
            if expires_at.map_or(false, |expires_at| expires_at <= now) {
                continue;
            }

            self.cookies.push(StoredCookie {
                secure: cookie.secure().unwrap_or(false),
                cookie,
                domain,
                host_only,
                path,
                expires_at,
            });
        }
    }

    /// The `Cookie` header value to send to `url`, if any cookie applies.
    pub fn header_for(&self, url: &Url) -> Option<String> {
        let host = url.host_str()?.to_ascii_lowercase();
        let https = url.scheme() == "https";
        let now = unix_now();

        let mut matching: Vec<_> = self
            .cookies
            .iter()
            .filter(|stored| stored.matches(&host, url.path(), https, now))
            .collect();
        if matching.is_empty() {
            return None;
        }
        // More specific paths go first.
        matching.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        Some(
            matching
                .iter()
                .map(|stored| format!("{}={}", stored.cookie.name(), stored.cookie.value()))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Value of the first live cookie named `name`, regardless of domain.
    pub fn get(&self, name: &str) -> Option<&str> {
        let now = unix_now();
        self.cookies
            .iter()
            .filter(|stored| stored.expires_at.map_or(true, |expires_at| expires_at > now))
            .find(|stored| stored.cookie.name() == name)
            .map(|stored| stored.cookie.value())
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn clear(&mut self) {
        self.cookies.clear();
    }
}

fn domain_matches(host: &str, domain: &str, host_only: bool) -> bool {
    host == domain
        || (!host_only
            && host
                .strip_suffix(domain)
                .map_or(false, |prefix| prefix.ends_with('.')))
}

fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    request_path == cookie_path
        || (request_path.starts_with(cookie_path)
            && (cookie_path.ends_with('/')
                || request_path[cookie_path.len()..].starts_with('/')))
}

fn default_path(url: &Url) -> String {
    match url.path().rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(end) => url.path()[..end].to_owned(),
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_cookies(values: &[&'static str]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for value in values {
            headers.append(header::SET_COOKIE, HeaderValue::from_static(value));
        }
        headers
    }

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    #[test]
    fn host_only_cookies_stay_on_their_host() {
        let mut store = CookieStore::default();
        store.store(
            &url("https://sso.cqu.edu.cn/login"),
            &set_cookies(&["SESSION=abc; Path=/; HttpOnly"]),
        );

        assert_eq!(
            store.header_for(&url("https://sso.cqu.edu.cn/logout")).as_deref(),
            Some("SESSION=abc")
        );
        assert_eq!(store.header_for(&url("https://my.cqu.edu.cn/")), None);
    }

    #[test]
    fn domain_cookies_reach_subdomains() {
        let mut store = CookieStore::default();
        store.store(
            &url("https://sso.cqu.edu.cn/login"),
            &set_cookies(&["TGC=t1; Domain=.cqu.edu.cn; Path=/"]),
        );

        assert_eq!(
            store.header_for(&url("https://my.cqu.edu.cn/enroll")).as_deref(),
            Some("TGC=t1")
        );
        assert_eq!(store.header_for(&url("https://notcqu.edu.cn/")), None);
    }

    #[test]
    fn foreign_domains_are_rejected() {
        let mut store = CookieStore::default();
        store.store(
            &url("https://sso.cqu.edu.cn/login"),
            &set_cookies(&["EVIL=1; Domain=example.com"]),
        );
        assert!(store.is_empty());
    }

    #[test]
    fn path_and_secure_are_respected() {
        let mut store = CookieStore::default();
        store.store(
            &url("https://authserver.cqu.edu.cn/authserver/login"),
            &set_cookies(&["CASTGC=c1; Path=/authserver; Secure", "route=r1"]),
        );

        assert_eq!(
            store
                .header_for(&url("https://authserver.cqu.edu.cn/authserver/index.do"))
                .as_deref(),
            Some("CASTGC=c1; route=r1")
        );
        // Default path of `/authserver/login` is `/authserver`.
        assert_eq!(store.header_for(&url("https://authserver.cqu.edu.cn/other")), None);
        assert_eq!(
            store
                .header_for(&url("http://authserver.cqu.edu.cn/authserver/login"))
                .as_deref(),
            Some("route=r1")
        );
        assert_eq!(store.header_for(&url("https://authserver.cqu.edu.cn/authserverx")), None);
    }

    #[test]
    fn cookies_are_replaced_and_expired() {
        let mut store = CookieStore::default();
        let login = url("https://sso.cqu.edu.cn/login");
        store.store(&login, &set_cookies(&["TGC=old; Path=/"]));
        store.store(&login, &set_cookies(&["TGC=new; Path=/"]));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("TGC"), Some("new"));

        store.store(&login, &set_cookies(&["TGC=; Path=/; Max-Age=0"]));
        assert_eq!(store.get("TGC"), None);
        assert!(store.is_empty());

        store.store(
            &login,
            &set_cookies(&["TGC=gone; Path=/; Expires=Thu, 01 Jan 1970 00:00:00 GMT"]),
        );
        assert!(store.is_empty());
    }
}
