#![allow(dead_code)]

use std::collections::VecDeque;

use cqu_auth::{AsyncTransport, Body, Credentials, Request, Response, Transport, TransportError};
use futures::future::{self, BoxFuture};
use hyper::{
    header::{self, HeaderValue},
    HeaderMap, StatusCode,
};

pub const AUTHSERVER_LOGIN_URL: &str = "http://authserver.cqu.edu.cn/authserver/login";
pub const AUTHSERVER_LOGOUT_URL: &str = "http://authserver.cqu.edu.cn/authserver/logout";
pub const AUTHSERVER_CAPTCHA_CHECK_URL: &str = "http://authserver.cqu.edu.cn/authserver/needCaptcha.html";
pub const AUTHSERVER_CAPTCHA_IMAGE_URL: &str = "http://authserver.cqu.edu.cn/authserver/captcha.html";
pub const SSO_LOGIN_URL: &str = "https://sso.cqu.edu.cn/login";
pub const SSO_LOGOUT_URL: &str = "https://sso.cqu.edu.cn/logout";
pub const SERVICE_URL: &str = "https://service/x";
pub const CROYPTO: &str = "QkFTRTY0S0U=";

pub const AUTHSERVER_LOGIN_PAGE: &str = r#"<!DOCTYPE html>
<html>
<body>
    <form id="casLoginForm" class="fr-form" method="post" action="/authserver/login">
        <input id="username" name="username" placeholder="用户名" value="">
        <input id="password" name="password" type="password" value="">
        <input type="hidden" name="lt" value="L1"/>
        <input type="hidden" name="dllt" value="D1"/>
        <input type="hidden" name="execution" value="E1"/>
        <input type="hidden" name="_eventId" value="V1"/>
        <input type="hidden" name="rmShown" value="R1">
    </form>
    <script type="text/javascript">
        var pwdDefaultEncryptSalt = "S1S1S1S1S1S1S1S1";
    </script>
</body>
</html>"#;

pub const AUTHSERVER_CONFLICT_PAGE: &str = r#"<html><body>
    <table class="kick_table"><tr><td>
        <form method="post" id="continue" action="/authserver/login">
            <input type="hidden" name="execution" value="K1"/>
            <input type="hidden" name="_eventId" value="continue"/>
        </form>
    </td></tr></table>
    <form method="post" id="cancel" action="/authserver/login">
        <input type="hidden" name="execution" value="C1"/>
        <input type="hidden" name="_eventId" value="cancel"/>
    </form>
</body></html>"#;

pub fn authserver_error_page(message: &str) -> String {
    format!(
        r#"<html><body><form id="casLoginForm"><span id="msg" class="login_auth_error">{message}</span></form></body></html>"#
    )
}

pub fn sso_login_page(captcha_url: &str) -> String {
    format!(
        r#"<html><body><div style="display: none">
            <p id="login-croypto">{CROYPTO}</p>
            <p id="login-page-flowkey">FK1</p>
            <p id="captcha-url">{captcha_url}</p>
        </div></body></html>"#
    )
}

pub fn sso_error_page(code: u32) -> String {
    format!(r#"<html><body><div id="login-error-msg"><span>{code}</span></div></body></html>"#)
}

pub fn credentials() -> Credentials {
    Credentials::new("20204051", "hunter2")
}

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
}

/// Answers requests from a script, in order, and records every request it sees.
#[derive(Default)]
pub struct MockTransport {
    replies: VecDeque<Reply>,
    pub requests: Vec<Request>,
    pub headers: HeaderMap,
    /// The transport's default headers at the time of each request.
    pub sent_headers: Vec<HeaderMap>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&mut self, status: u16, body: &str) -> &mut Self {
        self.reply_with(status, HeaderMap::new(), body.as_bytes())
    }

    pub fn redirect(&mut self, location: &str) -> &mut Self {
        let mut headers = HeaderMap::new();
        headers.insert(header::LOCATION, HeaderValue::from_str(location).unwrap());
        self.reply_with(302, headers, b"")
    }

    pub fn reply_with(&mut self, status: u16, headers: HeaderMap, body: &[u8]) -> &mut Self {
        self.replies.push_back(Reply {
            status: StatusCode::from_u16(status).unwrap(),
            headers,
            body: body.to_vec(),
        });
        self
    }

    pub fn is_exhausted(&self) -> bool {
        self.replies.is_empty()
    }

    pub fn posts(&self) -> Vec<&Request> {
        self.requests
            .iter()
            .filter(|request| request.method == hyper::Method::POST)
            .collect()
    }

    pub fn last_request(&self) -> &Request {
        self.requests.last().unwrap()
    }

    fn respond(&mut self, request: &Request) -> Result<Response, TransportError> {
        self.requests.push(request.clone());
        self.sent_headers.push(self.headers.clone());
        let reply = self.replies.pop_front().ok_or_else(|| {
            TransportError::Other(format!("unscripted request to {}", request.url).into())
        })?;
        let url = request.full_url()?;
        Ok(Response::new(reply.status, url.as_str(), reply.headers, reply.body))
    }
}

impl Transport for MockTransport {
    fn execute(&mut self, request: &Request) -> Result<Response, TransportError> {
        self.respond(request)
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }
}

impl AsyncTransport for MockTransport {
    fn execute<'a>(
        &'a mut self,
        request: &'a Request,
    ) -> BoxFuture<'a, Result<Response, TransportError>> {
        Box::pin(future::ready(self.respond(request)))
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }
}

pub fn form(request: &Request) -> &[(String, String)] {
    match &request.body {
        Body::Form(form) => form,
        Body::Empty => &[],
    }
}

pub fn form_values<'a>(request: &'a Request, key: &str) -> Vec<&'a str> {
    form(request)
        .iter()
        .filter(|(name, _)| name == key)
        .map(|(_, value)| value.as_str())
        .collect()
}

pub fn form_value<'a>(request: &'a Request, key: &str) -> Option<&'a str> {
    form_values(request, key).first().copied()
}

/// `requests` with every `password` field blanked out.
pub fn without_passwords(requests: &[Request]) -> Vec<Request> {
    requests
        .iter()
        .cloned()
        .map(|mut request| {
            if let Body::Form(form) = &mut request.body {
                for (name, value) in form.iter_mut() {
                    if name == "password" {
                        value.clear();
                    }
                }
            }
            request
        })
        .collect()
}
