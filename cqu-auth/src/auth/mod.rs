//! The login state machine shared by both portals.
//!
//! Every operation is a [`Procedure`], so it runs unchanged over a blocking [`Transport`] or an
//! [`AsyncTransport`]. [`Authorizer`] bundles a protocol with a [`Pipeline`] and exposes both
//! flavours of each operation.

mod authserver;
mod sso;

pub use authserver::Authserver;
pub use sso::Sso;

use std::{fmt, time::Duration};

use futures::future::BoxFuture;
use hyper::{body::Bytes, StatusCode};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    config::Config,
    encrypt::EncryptError,
    parser::ParseError,
    pipeline::{BoxProcedure, Executor, Pipeline, Procedure},
    transport::{AsyncTransport, Redirects, Request, Response, Transport, TransportError},
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CAPTCHA_MIME: &str = "application/octet-stream";

/// Username and password of a portal account.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Knobs of a single login attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginOptions {
    /// Service to be redirected to once logged in.
    pub service: Option<String>,
    /// Timeout of every request sent while logging in.
    pub timeout: Duration,
    /// Log out and log in again even if the portal already recognizes the session.
    pub force_relogin: bool,
    /// Ask the portal for a week-long session. Only the legacy authserver supports it.
    pub keep_longer: bool,
    /// End other sessions of an account restricted to a single session instead of reporting the
    /// conflict.
    pub kick_others: bool,
}

impl Default for LoginOptions {
    fn default() -> Self {
        Self {
            service: None,
            timeout: DEFAULT_TIMEOUT,
            force_relogin: false,
            keep_longer: false,
            kick_others: false,
        }
    }
}

impl LoginOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn force_relogin(mut self, force_relogin: bool) -> Self {
        self.force_relogin = force_relogin;
        self
    }

    pub fn keep_longer(mut self, keep_longer: bool) -> Self {
        self.keep_longer = keep_longer;
        self
    }

    pub fn kick_others(mut self, kick_others: bool) -> Self {
        self.kick_others = kick_others;
        self
    }
}

/// What a portal answered to a login form.
#[derive(Debug)]
pub enum Submitted {
    /// The credentials were accepted and the portal redirects to the service.
    Redirect(Response),
    /// The account is already logged in elsewhere.
    Conflict(MultiSessionConflict),
}

/// The parts of a login that differ between the two portals.
pub trait LoginProtocol: Clone + Send + Sync + 'static {
    /// Whatever [`parse_login_page`](LoginProtocol::parse_login_page) scrapes from the login form.
    type Page: Clone + Send + Sync + 'static;

    /// Shows up in log events.
    const NAME: &'static str;

    fn login_url(&self) -> &str;

    fn logout_url(&self) -> &str;

    /// Extracts the form tokens from a `200` login page.
    ///
    /// Only [`AuthError::Parse`] is retried, after logging out once.
    fn parse_login_page(&self, response: &Response) -> Result<Self::Page, AuthError>;

    /// Url of the captcha image if this attempt has to solve one.
    fn captcha_url<'a>(
        &'a self,
        executor: &'a mut dyn Executor,
        page: &'a Self::Page,
        credentials: &'a Credentials,
        options: &'a LoginOptions,
    ) -> BoxFuture<'a, Result<Option<String>, AuthError>>;

    /// Builds the login form, password encrypted.
    fn build_form(
        &self,
        page: &Self::Page,
        credentials: &Credentials,
        options: &LoginOptions,
        captcha: Option<&str>,
    ) -> Result<Vec<(String, String)>, AuthError>;

    /// Posts the login form and classifies the answer.
    fn submit<'a>(
        &'a self,
        executor: &'a mut dyn Executor,
        form: Vec<(String, String)>,
        options: &'a LoginOptions,
    ) -> BoxFuture<'a, Result<Submitted, AuthError>>;
}

/// How a login attempt ended.
#[derive(Debug)]
pub enum LoginOutcome {
    /// Logged in. Holds the response of the redirect target.
    Success(Response),
    /// The session was already logged in. Holds the portal's unfollowed `302`.
    AlreadyLoggedIn(Response),
    /// A captcha has to be solved before the form can be submitted.
    NeedCaptcha(PendingCaptcha),
    /// The account only allows one session and another one is active.
    Conflict(MultiSessionConflict),
}

impl LoginOutcome {
    /// The final response, treating captchas and conflicts as errors.
    pub fn into_response(self) -> Result<Response, AuthError> {
        match self {
            Self::Success(response) | Self::AlreadyLoggedIn(response) => Ok(response),
            Self::NeedCaptcha(pending) => Err(AuthError::NeedCaptcha(pending)),
            Self::Conflict(conflict) => Err(AuthError::MultiSessionConflict(conflict)),
        }
    }

    pub fn is_logged_in(&self) -> bool {
        matches!(self, Self::Success(_) | Self::AlreadyLoggedIn(_))
    }
}

type Resume = Box<dyn FnOnce(String) -> BoxProcedure<LoginOutcome, AuthError> + Send + Sync>;

/// A login suspended on a captcha.
///
/// Holds its own copy of the login page tokens, so it stays valid no matter what else happens to
/// the transport. Resuming consumes it; the portal only accepts its tokens once anyway.
pub struct PendingCaptcha {
    image: Bytes,
    mime_type: String,
    resume: Resume,
}

impl PendingCaptcha {
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    /// MIME type of [`image`](PendingCaptcha::image), as reported by the portal.
    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// The rest of the login, submitting `captcha` with the form.
    pub fn resume(self, captcha: impl Into<String>) -> BoxProcedure<LoginOutcome, AuthError> {
        (self.resume)(captcha.into())
    }
}

impl fmt::Debug for PendingCaptcha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCaptcha")
            .field("image", &format_args!("{} bytes", self.image.len()))
            .field("mime_type", &self.mime_type)
            .finish_non_exhaustive()
    }
}

/// The authserver refused a login because the account is logged in somewhere else.
///
/// Either [`kick`](MultiSessionConflict::kick) the other sessions or
/// [`cancel`](MultiSessionConflict::cancel) this login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiSessionConflict {
    login_url: String,
    kick_execution: String,
    cancel_execution: String,
    timeout: Duration,
}

impl MultiSessionConflict {
    pub fn new(
        login_url: impl Into<String>,
        kick_execution: impl Into<String>,
        cancel_execution: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            login_url: login_url.into(),
            kick_execution: kick_execution.into(),
            cancel_execution: cancel_execution.into(),
            timeout,
        }
    }

    /// Ends the other sessions and finishes logging in.
    pub fn kick(&self) -> Kick {
        Kick {
            login_url: self.login_url.clone(),
            execution: self.kick_execution.clone(),
            timeout: self.timeout,
        }
    }

    /// Gives up on this login, leaving the other sessions alone.
    pub fn cancel(&self) -> Cancel {
        Cancel {
            login_url: self.login_url.clone(),
            execution: self.cancel_execution.clone(),
            timeout: self.timeout,
        }
    }
}

/// Fetches the login page and drives the attempt up to its [`LoginOutcome`].
#[derive(Debug, Clone)]
pub struct Login<P> {
    protocol: P,
    credentials: Credentials,
    options: LoginOptions,
}

impl<P> Login<P> {
    pub fn new(protocol: P, credentials: Credentials, options: LoginOptions) -> Self {
        Self {
            protocol,
            credentials,
            options,
        }
    }
}

impl<P: LoginProtocol> Procedure for Login<P> {
    type Output = LoginOutcome;
    type Error = AuthError;

    fn run<'a>(self, executor: &'a mut dyn Executor) -> BoxFuture<'a, Result<LoginOutcome, AuthError>>
    where
        Self: 'a,
    {
        Box::pin(async move {
            let Self {
                protocol,
                credentials,
                options,
            } = self;

            let mut response = fetch_login_page(&protocol, &mut *executor, &options).await?;
            if response.is_redirect() {
                if !options.force_relogin {
                    info!(protocol = P::NAME, "already logged in");
                    return Ok(LoginOutcome::AlreadyLoggedIn(response));
                }
                info!(protocol = P::NAME, "logging out to force a new login");
                Logout::new(protocol.clone()).run(&mut *executor).await?;
                response = fetch_login_page(&protocol, &mut *executor, &options).await?;
            }
            if response.status() != StatusCode::OK {
                return Err(AuthError::unknown(
                    &response,
                    format!("unexpected status {} of the login page", response.status()),
                ));
            }

            let page = match protocol.parse_login_page(&response) {
                Err(AuthError::Parse(err)) => {
                    warn!(protocol = P::NAME, error = %err, "incomplete login page, logging out and retrying once");
                    Logout::new(protocol.clone()).run(&mut *executor).await?;
                    let response = fetch_login_page(&protocol, &mut *executor, &options).await?;
                    protocol.parse_login_page(&response)?
                }
                page => page?,
            };

            let captcha_url = protocol
                .captcha_url(&mut *executor, &page, &credentials, &options)
                .await?;
            if let Some(captcha_url) = captcha_url {
                info!(protocol = P::NAME, "captcha required");
                let image = executor
                    .execute(Request::get(captcha_url, Redirects::Follow).timeout(options.timeout))
                    .await?;
                let mime_type = image
                    .content_type()
                    .unwrap_or(DEFAULT_CAPTCHA_MIME)
                    .to_owned();
                return Ok(LoginOutcome::NeedCaptcha(PendingCaptcha {
                    image: image.bytes().clone(),
                    mime_type,
                    resume: Box::new(move |captcha| {
                        BoxProcedure::new(Submit::new(
                            protocol,
                            page,
                            credentials,
                            options,
                            Some(captcha),
                        ))
                    }),
                }));
            }

            Submit::new(protocol, page, credentials, options, None)
                .run(executor)
                .await
        })
    }
}

/// Posts the login form of an already parsed page, optionally with a captcha answer.
#[derive(Debug, Clone)]
pub struct Submit<P: LoginProtocol> {
    protocol: P,
    page: P::Page,
    credentials: Credentials,
    options: LoginOptions,
    captcha: Option<String>,
}

impl<P: LoginProtocol> Submit<P> {
    pub fn new(
        protocol: P,
        page: P::Page,
        credentials: Credentials,
        options: LoginOptions,
        captcha: Option<String>,
    ) -> Self {
        Self {
            protocol,
            page,
            credentials,
            options,
            captcha,
        }
    }
}

impl<P: LoginProtocol> Procedure for Submit<P> {
    type Output = LoginOutcome;
    type Error = AuthError;

    fn run<'a>(self, executor: &'a mut dyn Executor) -> BoxFuture<'a, Result<LoginOutcome, AuthError>>
    where
        Self: 'a,
    {
        Box::pin(async move {
            let form = self.protocol.build_form(
                &self.page,
                &self.credentials,
                &self.options,
                self.captcha.as_deref(),
            )?;
            match self.protocol.submit(&mut *executor, form, &self.options).await? {
                Submitted::Redirect(response) => {
                    let response = follow(&mut *executor, &response, self.options.timeout).await?;
                    info!(protocol = P::NAME, url = response.url(), "logged in");
                    Ok(LoginOutcome::Success(response))
                }
                Submitted::Conflict(conflict) if self.options.kick_others => {
                    warn!(protocol = P::NAME, "kicking other sessions of the account");
                    Ok(LoginOutcome::Success(conflict.kick().run(executor).await?))
                }
                Submitted::Conflict(conflict) => {
                    warn!(protocol = P::NAME, "account is logged in elsewhere");
                    Ok(LoginOutcome::Conflict(conflict))
                }
            }
        })
    }
}

/// Ends the other sessions of a conflicting login and follows the portal to the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kick {
    login_url: String,
    execution: String,
    timeout: Duration,
}

impl Procedure for Kick {
    type Output = Response;
    type Error = AuthError;

    fn run<'a>(self, executor: &'a mut dyn Executor) -> BoxFuture<'a, Result<Response, AuthError>>
    where
        Self: 'a,
    {
        Box::pin(async move {
            let response = executor
                .execute(
                    Request::post(self.login_url, Redirects::Manual)
                        .form(vec![
                            ("execution".to_owned(), self.execution),
                            ("_eventId".to_owned(), "continue".to_owned()),
                        ])
                        .timeout(self.timeout),
                )
                .await?;
            follow(executor, &response, self.timeout).await
        })
    }
}

/// Abandons a conflicting login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cancel {
    login_url: String,
    execution: String,
    timeout: Duration,
}

impl Procedure for Cancel {
    type Output = Response;
    type Error = AuthError;

    fn run<'a>(self, executor: &'a mut dyn Executor) -> BoxFuture<'a, Result<Response, AuthError>>
    where
        Self: 'a,
    {
        Box::pin(async move {
            Ok(executor
                .execute(
                    Request::post(self.login_url, Redirects::Manual)
                        .form(vec![
                            ("execution".to_owned(), self.execution),
                            ("_eventId".to_owned(), "cancel".to_owned()),
                        ])
                        .timeout(self.timeout),
                )
                .await?)
        })
    }
}

/// Logs the portal session out. The answer is ignored.
#[derive(Debug, Clone)]
pub struct Logout<P> {
    protocol: P,
}

impl<P> Logout<P> {
    pub fn new(protocol: P) -> Self {
        Self { protocol }
    }
}

impl<P: LoginProtocol> Procedure for Logout<P> {
    type Output = ();
    type Error = AuthError;

    fn run<'a>(self, executor: &'a mut dyn Executor) -> BoxFuture<'a, Result<(), AuthError>>
    where
        Self: 'a,
    {
        Box::pin(async move {
            executor
                .execute(Request::get(self.protocol.logout_url(), Redirects::Follow))
                .await?;
            Ok(())
        })
    }
}

/// Whether the portal recognizes the session, i.e. redirects away from its login page.
#[derive(Debug, Clone)]
pub struct IsLoggedIn<P> {
    protocol: P,
}

impl<P> IsLoggedIn<P> {
    pub fn new(protocol: P) -> Self {
        Self { protocol }
    }
}

impl<P: LoginProtocol> Procedure for IsLoggedIn<P> {
    type Output = bool;
    type Error = AuthError;

    fn run<'a>(self, executor: &'a mut dyn Executor) -> BoxFuture<'a, Result<bool, AuthError>>
    where
        Self: 'a,
    {
        Box::pin(async move {
            let response = executor
                .execute(Request::get(self.protocol.login_url(), Redirects::Manual))
                .await?;
            Ok(response.status() == StatusCode::FOUND)
        })
    }
}

/// Obtains a service ticket for a logged in session and hands it to the service.
///
/// Every downstream service gets its own cookies this way.
#[derive(Debug, Clone)]
pub struct AccessService<P> {
    protocol: P,
    service: String,
}

impl<P> AccessService<P> {
    pub fn new(protocol: P, service: impl Into<String>) -> Self {
        Self {
            protocol,
            service: service.into(),
        }
    }
}

impl<P: LoginProtocol> Procedure for AccessService<P> {
    type Output = Response;
    type Error = AuthError;

    fn run<'a>(self, executor: &'a mut dyn Executor) -> BoxFuture<'a, Result<Response, AuthError>>
    where
        Self: 'a,
    {
        Box::pin(async move {
            let response = executor
                .execute(
                    Request::get(self.protocol.login_url(), Redirects::Manual)
                        .param("service", self.service),
                )
                .await?;
            if !response.is_redirect() {
                return Err(AuthError::NotLoggedIn);
            }
            let location = response.location().ok_or(AuthError::NotLoggedIn)?;
            Ok(executor
                .execute(Request::get(location, Redirects::Manual))
                .await?)
        })
    }
}

async fn fetch_login_page<P: LoginProtocol>(
    protocol: &P,
    executor: &mut dyn Executor,
    options: &LoginOptions,
) -> Result<Response, TransportError> {
    let mut request = Request::get(protocol.login_url(), Redirects::Manual).timeout(options.timeout);
    if let Some(service) = &options.service {
        request = request.param("service", service);
    }
    executor.execute(request).await
}

async fn follow(
    executor: &mut dyn Executor,
    response: &Response,
    timeout: Duration,
) -> Result<Response, AuthError> {
    let location = response
        .location()
        .ok_or_else(|| AuthError::unknown(response, "redirected without a `Location` header"))?;
    Ok(executor
        .execute(Request::get(location, Redirects::Manual).timeout(timeout))
        .await?)
}

/// Logs into one portal, blocking or async, through a caller-owned transport.
#[derive(Debug, Clone, Default)]
pub struct Authorizer<P> {
    protocol: P,
    pipeline: Pipeline,
}

impl<P: LoginProtocol> Authorizer<P> {
    pub fn new(protocol: P) -> Self {
        Self::with_config(protocol, Config::default())
    }

    pub fn with_config(protocol: P, config: Config) -> Self {
        Self {
            protocol,
            pipeline: Pipeline::new(config),
        }
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn login_procedure(&self, credentials: &Credentials, options: &LoginOptions) -> Login<P> {
        Login::new(self.protocol.clone(), credentials.clone(), options.clone())
    }

    pub fn login<T>(
        &self,
        transport: &mut T,
        credentials: &Credentials,
        options: &LoginOptions,
    ) -> Result<LoginOutcome, AuthError>
    where
        T: Transport + ?Sized,
    {
        self.run(transport, self.login_procedure(credentials, options))
    }

    pub async fn login_async<T>(
        &self,
        transport: &mut T,
        credentials: &Credentials,
        options: &LoginOptions,
    ) -> Result<LoginOutcome, AuthError>
    where
        T: AsyncTransport + ?Sized,
    {
        self.run_async(transport, self.login_procedure(credentials, options))
            .await
    }

    /// Logs in, asking `solve` for the captcha text if one is required.
    ///
    /// `solve` gets the image and its MIME type; returning `None` gives up with
    /// [`AuthError::InvalidCaptcha`]. A multi-session conflict comes back as
    /// [`AuthError::MultiSessionConflict`].
    pub fn login_with_captcha<T, F>(
        &self,
        transport: &mut T,
        credentials: &Credentials,
        options: &LoginOptions,
        solve: F,
    ) -> Result<Response, AuthError>
    where
        T: Transport + ?Sized,
        F: FnOnce(&[u8], &str) -> Option<String>,
    {
        match self.login(transport, credentials, options)? {
            LoginOutcome::NeedCaptcha(pending) => {
                let captcha = solve(pending.image(), pending.mime_type()).ok_or(AuthError::InvalidCaptcha)?;
                self.run(transport, pending.resume(captcha))?.into_response()
            }
            outcome => outcome.into_response(),
        }
    }

    pub async fn login_with_captcha_async<T, F>(
        &self,
        transport: &mut T,
        credentials: &Credentials,
        options: &LoginOptions,
        solve: F,
    ) -> Result<Response, AuthError>
    where
        T: AsyncTransport + ?Sized,
        F: FnOnce(&[u8], &str) -> Option<String>,
    {
        match self.login_async(transport, credentials, options).await? {
            LoginOutcome::NeedCaptcha(pending) => {
                let captcha = solve(pending.image(), pending.mime_type()).ok_or(AuthError::InvalidCaptcha)?;
                self.run_async(transport, pending.resume(captcha))
                    .await?
                    .into_response()
            }
            outcome => outcome.into_response(),
        }
    }

    pub fn logout<T: Transport + ?Sized>(&self, transport: &mut T) -> Result<(), AuthError> {
        self.run(transport, Logout::new(self.protocol.clone()))
    }

    pub async fn logout_async<T: AsyncTransport + ?Sized>(&self, transport: &mut T) -> Result<(), AuthError> {
        self.run_async(transport, Logout::new(self.protocol.clone()))
            .await
    }

    pub fn is_logged_in<T: Transport + ?Sized>(&self, transport: &mut T) -> Result<bool, AuthError> {
        self.run(transport, IsLoggedIn::new(self.protocol.clone()))
    }

    pub async fn is_logged_in_async<T: AsyncTransport + ?Sized>(
        &self,
        transport: &mut T,
    ) -> Result<bool, AuthError> {
        self.run_async(transport, IsLoggedIn::new(self.protocol.clone()))
            .await
    }

    pub fn access_service<T: Transport + ?Sized>(
        &self,
        transport: &mut T,
        service: &str,
    ) -> Result<Response, AuthError> {
        self.run(transport, AccessService::new(self.protocol.clone(), service))
    }

    pub async fn access_service_async<T: AsyncTransport + ?Sized>(
        &self,
        transport: &mut T,
        service: &str,
    ) -> Result<Response, AuthError> {
        self.run_async(transport, AccessService::new(self.protocol.clone(), service))
            .await
    }

    /// Runs any procedure, e.g. a resumed captcha or a [`Kick`], with this authorizer's config.
    pub fn run<T, Q>(&self, transport: &mut T, procedure: Q) -> Result<Q::Output, Q::Error>
    where
        T: Transport + ?Sized,
        Q: Procedure,
    {
        self.pipeline.run_sync(transport, procedure)
    }

    pub async fn run_async<T, Q>(&self, transport: &mut T, procedure: Q) -> Result<Q::Output, Q::Error>
    where
        T: AsyncTransport + ?Sized,
        Q: Procedure,
    {
        self.pipeline.run_async(transport, procedure).await
    }
}

/// Represents errors that can occur while talking to a portal.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The portal doesn't allow logging into the requested service.
    #[error("service is not allowed to use the portal: {0}")]
    NotAllowedService(String),
    /// A captcha has to be solved before logging in.
    #[error("captcha is needed")]
    NeedCaptcha(PendingCaptcha),
    #[error("invalid captcha")]
    InvalidCaptcha,
    #[error("incorrect username or password")]
    IncorrectCredentials,
    /// The portal answered in a way the login flow doesn't know.
    #[error("unknown portal response (status {status}): {message}")]
    UnknownAuthServer {
        status: StatusCode,
        message: String,
        body: String,
    },
    /// Accessing a service requires a logged in session.
    #[error("not logged in")]
    NotLoggedIn,
    /// The account only allows one session and another one is active.
    #[error("account is logged in elsewhere, kick the other sessions or cancel")]
    MultiSessionConflict(MultiSessionConflict),
    #[error("could not parse portal page")]
    Parse(#[from] ParseError),
    #[error("could not encrypt password")]
    Encrypt(#[from] EncryptError),
    #[error("could not decode JSON response")]
    InvalidJson(#[from] serde_json::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl AuthError {
    pub(crate) fn unknown(response: &Response, message: impl Into<String>) -> Self {
        Self::UnknownAuthServer {
            status: response.status(),
            message: message.into(),
            body: response.text().into_owned(),
        }
    }
}
