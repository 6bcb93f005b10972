use std::time::Duration;

use hyper::{
    header::{HeaderName, HeaderValue},
    HeaderMap,
};

use crate::transport::Request;

/// Settings applied by a [`Pipeline`](crate::Pipeline) to every request it hands to a transport.
///
/// Both execution modes apply the same config, so a procedure emits identical requests whether it
/// runs blocking or suspended.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Used for requests that don't carry their own timeout.
    pub default_timeout: Option<Duration>,
    /// Added to requests that don't already set the same header.
    pub default_headers: HeaderMap,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn with_default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub(crate) fn apply(&self, mut request: Request) -> Request {
        if request.timeout.is_none() {
            request.timeout = self.default_timeout;
        }
        for (name, value) in &self.default_headers {
            if !request.headers.contains_key(name) {
                request.headers.insert(name.clone(), value.clone());
            }
        }
        request
    }
}

#[cfg(test)]
mod tests {
    use hyper::header;

    use super::*;
    use crate::transport::Redirects;

    #[test]
    fn request_settings_win_over_defaults() {
        let config = Config::new()
            .with_default_timeout(Duration::from_secs(30))
            .with_default_header(header::ACCEPT, HeaderValue::from_static("*/*"))
            .with_default_header(header::REFERER, HeaderValue::from_static("https://sso.cqu.edu.cn"));

        let request = config.apply(
            Request::get("https://sso.cqu.edu.cn/login", Redirects::Manual)
                .timeout(Duration::from_secs(10))
                .header(header::ACCEPT, HeaderValue::from_static("text/html")),
        );

        assert_eq!(request.timeout, Some(Duration::from_secs(10)));
        assert_eq!(request.headers[header::ACCEPT], "text/html");
        assert_eq!(request.headers[header::REFERER], "https://sso.cqu.edu.cn");
    }

    #[test]
    fn default_timeout_fills_gaps() {
        let config = Config::new().with_default_timeout(Duration::from_secs(30));
        let request = config.apply(Request::get("https://sso.cqu.edu.cn/logout", Redirects::Follow));
        assert_eq!(request.timeout, Some(Duration::from_secs(30)));
    }
}
