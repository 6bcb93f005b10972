mod auth;
mod config;
pub mod encrypt;
pub mod mycqu;
pub mod parser;
mod pipeline;
mod session;
mod transport;

pub use auth::{
    AccessService, AuthError, Authorizer, Authserver, Cancel, Credentials, IsLoggedIn, Kick, Login,
    LoginOptions, LoginOutcome, LoginProtocol, Logout, MultiSessionConflict, PendingCaptcha, Sso,
    Submit, Submitted,
};
pub use config::Config;
pub use encrypt::EncryptError;
pub use parser::ParseError;
pub use pipeline::{BoxProcedure, Executor, Pipeline, Procedure};
pub use session::{BlockingSession, CookieStore, HttpSession};
pub use transport::{AsyncTransport, Body, Redirects, Request, Response, Transport, TransportError};

/// Logs into the legacy `authserver.cqu.edu.cn` portal.
pub type AuthserverAuthorizer = Authorizer<Authserver>;
/// Logs into the `sso.cqu.edu.cn` portal.
pub type SsoAuthorizer = Authorizer<Sso>;
