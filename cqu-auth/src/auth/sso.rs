use futures::future::BoxFuture;
use hyper::StatusCode;

use super::{AuthError, Credentials, LoginOptions, LoginProtocol, Submitted};
use crate::{
    encrypt,
    parser::{self, SsoLoginPage, SSO_CAPTCHA_ERROR_CODE, SSO_CREDENTIAL_ERROR_CODES},
    pipeline::Executor,
    transport::{Redirects, Request, Response},
};

const ROOT_URL: &str = "https://sso.cqu.edu.cn";

/// The SSO portal at `sso.cqu.edu.cn`.
///
/// It has no "remember me" field, so [`LoginOptions::keep_longer`] is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sso {
    root_url: String,
    login_url: String,
    logout_url: String,
}

impl Default for Sso {
    fn default() -> Self {
        Self::with_base_url(ROOT_URL)
    }
}

impl Sso {
    pub fn with_base_url(root_url: &str) -> Self {
        let root_url = root_url.trim_end_matches('/');
        Self {
            root_url: root_url.to_owned(),
            login_url: format!("{root_url}/login"),
            logout_url: format!("{root_url}/logout"),
        }
    }

    fn resolve(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_owned()
        } else {
            format!("{}/{}", self.root_url, path.trim_start_matches('/'))
        }
    }
}

impl LoginProtocol for Sso {
    type Page = SsoLoginPage;

    const NAME: &'static str = "sso";

    fn login_url(&self) -> &str {
        &self.login_url
    }

    fn logout_url(&self) -> &str {
        &self.logout_url
    }

    fn parse_login_page(&self, response: &Response) -> Result<SsoLoginPage, AuthError> {
        Ok(SsoLoginPage::parse(&response.text())?)
    }

    fn captcha_url<'a>(
        &'a self,
        _executor: &'a mut dyn Executor,
        page: &'a SsoLoginPage,
        _credentials: &'a Credentials,
        _options: &'a LoginOptions,
    ) -> BoxFuture<'a, Result<Option<String>, AuthError>> {
        let url = page.captcha_url.as_deref().map(|path| self.resolve(path));
        Box::pin(async move { Ok(url) })
    }

    fn build_form(
        &self,
        page: &SsoLoginPage,
        credentials: &Credentials,
        _options: &LoginOptions,
        captcha: Option<&str>,
    ) -> Result<Vec<(String, String)>, AuthError> {
        let password = encrypt::sso_password(&page.croypto, &credentials.password)?;
        let mut form: Vec<(String, String)> = [
            ("username", credentials.username.as_str()),
            ("type", "UsernamePassword"),
            ("_eventId", "submit"),
            ("geolocation", ""),
            ("execution", page.flow_key.as_str()),
            ("croypto", page.croypto.as_str()),
            ("password", password.as_str()),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
        .collect();
        if let Some(captcha) = captcha {
            // The portal's own form posts the field twice.
            form.push(("captcha_code".to_owned(), captcha.to_owned()));
            form.push(("captcha_code".to_owned(), captcha.to_owned()));
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
            let mut request = Request::post(&self.login_url, Redirects::Manual)
                .form(form)
                .timeout(options.timeout);
            if let Some(service) = &options.service {
                request = request.param("service", service);
            }
            let response = executor.execute(request).await?;

            match response.status() {
                StatusCode::FOUND => Ok(Submitted::Redirect(response)),
                StatusCode::UNAUTHORIZED => Err(AuthError::IncorrectCredentials),
                StatusCode::OK => match parser::sso_error_code(&response.text())? {
                    Some(SSO_CAPTCHA_ERROR_CODE) => Err(AuthError::InvalidCaptcha),
                    Some(code) if SSO_CREDENTIAL_ERROR_CODES.contains(&code) => {
                        Err(AuthError::IncorrectCredentials)
                    }
                    Some(code) => Err(AuthError::unknown(
                        &response,
                        format!("{code}: {}", parser::sso_error_message(code).unwrap_or_default()),
                    )),
                    None => Err(AuthError::unknown(&response, "no error code")),
                },
                status => Err(AuthError::unknown(
                    &response,
                    format!("unexpected status {status} when sending login post"),
                )),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captcha_path_is_resolved_against_root() {
        let sso = Sso::default();
        assert_eq!(
            sso.resolve("api/captcha/generate/DEFAULT"),
            "https://sso.cqu.edu.cn/api/captcha/generate/DEFAULT"
        );
        assert_eq!(sso.resolve("/x"), "https://sso.cqu.edu.cn/x");
        assert_eq!(sso.resolve("https://cdn.example/c.png"), "https://cdn.example/c.png");
    }

    #[test]
    fn captcha_code_is_sent_twice() {
        let page = SsoLoginPage {
            croypto: "azN5azN5azM=".to_owned(),
            flow_key: "FK1".to_owned(),
            captcha_url: None,
        };
        let form = Sso::default()
            .build_form(
                &page,
                &Credentials::new("20204051", "hunter2"),
                &LoginOptions::default().keep_longer(true),
                Some("a1b2"),
            )
            .unwrap();

        let keys: Vec<_> = form.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(
            keys,
            [
                "username",
                "type",
                "_eventId",
                "geolocation",
                "execution",
                "croypto",
                "password",
                "captcha_code",
                "captcha_code",
            ]
        );
        assert!(!keys.contains(&"rememberMe"));
        assert_eq!(form[4].1, "FK1");
        assert_eq!(form[8].1, "a1b2");
    }
}
