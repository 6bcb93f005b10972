//! Authorization for `my.cqu.edu.cn`, which wants an OAuth bearer token on top of the portal
//! session.

use std::sync::OnceLock;

use futures::future::BoxFuture;
use hyper::header::{self, HeaderValue};
use regex::Regex;
use serde::Deserialize;
use tracing::info;

use crate::{
    auth::{AccessService, AuthError, LoginProtocol},
    pipeline::{Executor, Procedure},
    transport::{Redirects, Request},
};

pub const SERVICE_URL: &str = "http://my.cqu.edu.cn/authserver/authentication/cas";
pub const TOKEN_INDEX_URL: &str = "https://my.cqu.edu.cn/enroll/token-index";
pub const AUTHORIZE_URL: &str = "https://my.cqu.edu.cn/authserver/oauth/authorize";
pub const TOKEN_URL: &str = "https://my.cqu.edu.cn/authserver/oauth/token";

const CLIENT_ID: &str = "enroll-prod";
const CLIENT_SECRET: &str = "app-a-1234";
const CODE_FORMAT: &str = r"\?code=([^&]+)&";

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Exchanges a logged in portal session for a `my.cqu.edu.cn` bearer token.
///
/// Outputs the `Authorization` header value, `Bearer <token>`. With
/// [`add_to_header`](AccessMycqu::add_to_header) set (the default) the value is also stored in the
/// transport's default headers, so later requests through it are authorized.
#[derive(Debug, Clone)]
pub struct AccessMycqu<P> {
    protocol: P,
    add_to_header: bool,
}

impl<P> AccessMycqu<P> {
    pub fn new(protocol: P) -> Self {
        Self {
            protocol,
            add_to_header: true,
        }
    }

    pub fn add_to_header(mut self, add_to_header: bool) -> Self {
        self.add_to_header = add_to_header;
        self
    }
}

impl<P: LoginProtocol> Procedure for AccessMycqu<P> {
    type Output = String;
    type Error = AuthError;

    fn run<'a>(self, executor: &'a mut dyn Executor) -> BoxFuture<'a, Result<String, AuthError>>
    where
        Self: 'a,
    {
        Box::pin(async move {
            // An expired token makes the authorize endpoint reject the request.
            executor.headers_mut().remove(header::AUTHORIZATION);

            // The service redirects from http to https once more before the cookies are set.
            let service = AccessService::new(self.protocol, SERVICE_URL)
                .run(&mut *executor)
                .await?;
            if let Some(location) = service.location() {
                executor
                    .execute(Request::get(location, Redirects::Manual))
                    .await?;
            }

            let authorize = executor
                .execute(
                    Request::get(AUTHORIZE_URL, Redirects::Manual).params([
                        ("client_id", CLIENT_ID),
                        ("response_type", "code"),
                        ("scope", "all"),
                        ("state", ""),
                        ("redirect_uri", TOKEN_INDEX_URL),
                    ]),
                )
                .await?;
            let code = authorize
                .location()
                .and_then(|location| authorization_code(&location))
                .ok_or_else(|| AuthError::unknown(&authorize, "no authorization code in redirect"))?;

            let token = executor
                .execute(Request::post(TOKEN_URL, Redirects::Follow).form(vec![
                    ("client_id".to_owned(), CLIENT_ID.to_owned()),
                    ("client_secret".to_owned(), CLIENT_SECRET.to_owned()),
                    ("code".to_owned(), code),
                    ("redirect_uri".to_owned(), TOKEN_INDEX_URL.to_owned()),
                    ("grant_type".to_owned(), "authorization_code".to_owned()),
                ]))
                .await?;
            let bearer = format!("Bearer {}", token.json::<TokenResponse>()?.access_token);

            if self.add_to_header {
                let value = HeaderValue::from_str(&bearer)
                    .map_err(|_| AuthError::unknown(&token, "access token is not a valid header value"))?;
                executor.headers_mut().insert(header::AUTHORIZATION, value);
            }
            info!("authorized for my.cqu.edu.cn");
            Ok(bearer)
        })
    }
}

fn authorization_code(location: &str) -> Option<String> {
    static CODE: OnceLock<Option<Regex>> = OnceLock::new();
    CODE.get_or_init(|| Regex::new(CODE_FORMAT).ok())
        .as_ref()?
        .captures(location)?
        .get(1)
        .map(|code| code.as_str().to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_is_taken_from_redirect() {
        assert_eq!(
            authorization_code("https://my.cqu.edu.cn/enroll/token-index?code=Ab12Cd&state=").as_deref(),
            Some("Ab12Cd")
        );
        assert_eq!(authorization_code("https://my.cqu.edu.cn/enroll/token-index?code=Ab12Cd"), None);
    }
}
