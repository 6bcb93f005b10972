use futures::future::BoxFuture;

use super::{AuthError, Credentials, LoginOptions, LoginProtocol, MultiSessionConflict, Submitted};
use crate::{
    encrypt,
    parser::{AuthserverLoginPage, LoginResultPage},
    pipeline::Executor,
    transport::{Redirects, Request, Response},
};

const BASE_URL: &str = "http://authserver.cqu.edu.cn/authserver";

const NOT_REGISTERED: &str = "应用未注册";
const INVALID_CAPTCHA: &str = "无效的验证码";
const INCORRECT_CREDENTIALS: &str = "您提供的用户名或者密码有误";

/// The legacy CAS authserver at `authserver.cqu.edu.cn`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authserver {
    login_url: String,
    logout_url: String,
    captcha_check_url: String,
    captcha_image_url: String,
}

impl Default for Authserver {
    fn default() -> Self {
        Self::with_base_url(BASE_URL)
    }
}

impl Authserver {
    /// Endpoints relative to `base_url`, e.g. `http://authserver.cqu.edu.cn/authserver`.
    pub fn with_base_url(base_url: &str) -> Self {
        let base_url = base_url.trim_end_matches('/');
        Self {
            login_url: format!("{base_url}/login"),
            logout_url: format!("{base_url}/logout"),
            captcha_check_url: format!("{base_url}/needCaptcha.html"),
            captcha_image_url: format!("{base_url}/captcha.html"),
        }
    }
}

impl LoginProtocol for Authserver {
    type Page = AuthserverLoginPage;

    const NAME: &'static str = "authserver";

    fn login_url(&self) -> &str {
        &self.login_url
    }

    fn logout_url(&self) -> &str {
        &self.logout_url
    }

    fn parse_login_page(&self, response: &Response) -> Result<AuthserverLoginPage, AuthError> {
        let page = AuthserverLoginPage::parse(&response.text())?;
        match page.error.as_deref() {
            None => Ok(page),
            Some(NOT_REGISTERED) => Err(AuthError::NotAllowedService(NOT_REGISTERED.to_owned())),
            Some(message) => Err(AuthError::unknown(
                response,
                format!("error message before login: {message}"),
            )),
        }
    }

    fn captcha_url<'a>(
        &'a self,
        executor: &'a mut dyn Executor,
        _page: &'a AuthserverLoginPage,
        credentials: &'a Credentials,
        options: &'a LoginOptions,
    ) -> BoxFuture<'a, Result<Option<String>, AuthError>> {
        Box::pin(async move {
            let response = executor
                .execute(
                    Request::get(&self.captcha_check_url, Redirects::Follow)
                        .param("username", &credentials.username)
                        .timeout(options.timeout),
                )
                .await?;
            Ok((response.text().trim() == "true").then(|| self.captcha_image_url.clone()))
        })
    }

    fn build_form(
        &self,
        page: &AuthserverLoginPage,
        credentials: &Credentials,
        options: &LoginOptions,
        captcha: Option<&str>,
    ) -> Result<Vec<(String, String)>, AuthError> {
        let mut form = page.hidden_inputs.clone();
        form.push(("username".to_owned(), credentials.username.clone()));
        form.push((
            "password".to_owned(),
            encrypt::authserver_password(&page.salt, &credentials.password)?,
        ));
        if options.keep_longer {
            form.push(("rememberMe".to_owned(), "on".to_owned()));
        }
        if let Some(captcha) = captcha {
            form.push(("captchaResponse".to_owned(), captcha.to_owned()));
        }
        Ok(form)
    }

    fn submit<'a>(
        &'a self,
        executor: &'a mut dyn Executor,
        form: Vec<(String, String)>,
        options: &'a LoginOptions,
    ) -> BoxFuture<'a, Result<Submitted, AuthError>> {
        Box::pin(async move {
            let response = executor
                .execute(
                    Request::post(&self.login_url, Redirects::Manual)
                        .form(form)
                        .timeout(options.timeout),
                )
                .await?;
            if response.is_redirect() {
                return Ok(Submitted::Redirect(response));
            }

            let status = response.status().as_u16();
            match LoginResultPage::parse(&response.text())? {
                LoginResultPage::Conflict {
                    kick_execution,
                    cancel_execution,
                } => Ok(Submitted::Conflict(MultiSessionConflict::new(
                    self.login_url.clone(),
                    kick_execution,
                    cancel_execution,
                    options.timeout,
                ))),
                LoginResultPage::Error(message) if message == INVALID_CAPTCHA => {
                    Err(AuthError::InvalidCaptcha)
                }
                LoginResultPage::Error(message) if message == INCORRECT_CREDENTIALS => {
                    Err(AuthError::IncorrectCredentials)
                }
                LoginResultPage::Error(message) => Err(AuthError::unknown(
                    &response,
                    format!("status code {status} is got (302 expected) when sending login post, {message}"),
                )),
                LoginResultPage::Unrecognized => Err(AuthError::unknown(
                    &response,
                    format!(
                        "status code {status} is got (302 expected) when sending login post, \
                         but can not find the element span.login_auth_error#msg"
                    ),
                )),
            }
        })
    }
}
