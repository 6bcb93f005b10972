mod common;

use common::*;
use cqu_auth::{encrypt, AuthError, LoginOptions, LoginOutcome, Redirects, SsoAuthorizer};
use hyper::{Method, StatusCode};

fn submit_answer(status: u16, body: &str) -> (MockTransport, Result<LoginOutcome, AuthError>) {
    let mut transport = MockTransport::new();
    transport
        .reply(200, &sso_login_page(""))
        .reply(status, body);
    let result = SsoAuthorizer::default().login(&mut transport, &credentials(), &LoginOptions::default());
    (transport, result)
}

#[test]
fn unauthorized_submit_is_incorrect_credentials() {
    let (transport, result) = submit_answer(401, "");

    assert!(matches!(result, Err(AuthError::IncorrectCredentials)));
    // No captcha probe: the page itself says whether one is needed.
    assert_eq!(transport.requests.len(), 2);
    assert_eq!(transport.requests[0].url, SSO_LOGIN_URL);
    assert_eq!(transport.requests[1].method, Method::POST);
}

#[test]
fn captcha_error_code() {
    let (_, result) = submit_answer(200, &sso_error_page(1320007));
    assert!(matches!(result, Err(AuthError::InvalidCaptcha)));
}

#[test]
fn credential_error_codes() {
    for code in [1030027, 1030031] {
        let (_, result) = submit_answer(200, &sso_error_page(code));
        assert!(matches!(result, Err(AuthError::IncorrectCredentials)));
    }
}

#[test]
fn other_error_codes_are_unknown() {
    let (_, result) = submit_answer(200, &sso_error_page(1410040));
    match result {
        Err(AuthError::UnknownAuthServer { status, message, .. }) => {
            assert_eq!(status, StatusCode::OK);
            assert_eq!(message, "1410040: 当前用户名已失效");
        }
        other => panic!("unexpected result {other:?}"),
    }

    let (_, result) = submit_answer(200, &sso_error_page(999));
    match result {
        Err(AuthError::UnknownAuthServer { message, .. }) => assert_eq!(message, "999: "),
        other => panic!("unexpected result {other:?}"),
    }

    let (_, result) = submit_answer(200, "<html><body>huh</body></html>");
    match result {
        Err(AuthError::UnknownAuthServer { message, .. }) => assert_eq!(message, "no error code"),
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn login_posts_the_encrypted_form() {
    let mut transport = MockTransport::new();
    transport
        .reply(200, &sso_login_page(""))
        .redirect(SERVICE_URL)
        .reply(200, "welcome");

    let outcome = SsoAuthorizer::default()
        .login(
            &mut transport,
            &credentials(),
            &LoginOptions::default().service(SERVICE_URL),
        )
        .unwrap();
    let LoginOutcome::Success(response) = outcome else {
        panic!("expected a successful login");
    };
    assert_eq!(response.url(), SERVICE_URL);

    let submit = &transport.requests[1];
    assert_eq!(submit.redirects, Redirects::Manual);
    assert_eq!(
        submit.full_url().unwrap().as_str(),
        "https://sso.cqu.edu.cn/login?service=https%3A%2F%2Fservice%2Fx"
    );
    let expected_password = encrypt::sso_password(CROYPTO, "hunter2").unwrap();
    assert_eq!(
        form(submit),
        [
            ("username", "20204051"),
            ("type", "UsernamePassword"),
            ("_eventId", "submit"),
            ("geolocation", ""),
            ("execution", "FK1"),
            ("croypto", CROYPTO),
            ("password", expected_password.as_str()),
        ]
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
    );
}

#[test]
fn captcha_url_on_the_page_suspends_the_login() {
    let mut transport = MockTransport::new();
    transport
        .reply(200, &sso_login_page("api/captcha/generate/DEFAULT"))
        .reply(200, "png");

    let authorizer = SsoAuthorizer::default();
    let outcome = authorizer
        .login(&mut transport, &credentials(), &LoginOptions::default())
        .unwrap();
    let LoginOutcome::NeedCaptcha(pending) = outcome else {
        panic!("expected a captcha");
    };
    assert_eq!(transport.requests.len(), 2);
    assert_eq!(
        transport.requests[1].url,
        "https://sso.cqu.edu.cn/api/captcha/generate/DEFAULT"
    );
    assert!(transport.posts().is_empty());

    transport.redirect(SERVICE_URL).reply(200, "welcome");
    let outcome = authorizer
        .run(&mut transport, pending.resume("x7k2"))
        .unwrap();
    assert!(matches!(outcome, LoginOutcome::Success(_)));

    let posts = transport.posts();
    assert_eq!(posts.len(), 1);
    assert_eq!(form_values(posts[0], "captcha_code"), ["x7k2", "x7k2"]);
}

#[test]
fn already_logged_in_returns_the_redirect() {
    let mut transport = MockTransport::new();
    transport.redirect(SERVICE_URL);

    let outcome = SsoAuthorizer::default()
        .login(&mut transport, &credentials(), &LoginOptions::default())
        .unwrap();
    assert!(matches!(outcome, LoginOutcome::AlreadyLoggedIn(_)));
    assert_eq!(transport.requests.len(), 1);
}

#[tokio::test]
async fn blocking_and_async_logins_send_identical_requests() {
    let authorizer = SsoAuthorizer::default();
    let options = LoginOptions::default().service(SERVICE_URL);
    let script = |transport: &mut MockTransport| {
        transport
            .reply(200, &sso_login_page(""))
            .redirect(SERVICE_URL)
            .reply(200, "welcome");
    };

    let mut blocking = MockTransport::new();
    script(&mut blocking);
    authorizer.login(&mut blocking, &credentials(), &options).unwrap();

    let mut suspending = MockTransport::new();
    script(&mut suspending);
    authorizer
        .login_async(&mut suspending, &credentials(), &options)
        .await
        .unwrap();

    // DES-ECB has no iv, so even the password matches.
    assert_eq!(blocking.requests, suspending.requests);
}

#[tokio::test]
async fn async_logout_and_probe() {
    let authorizer = SsoAuthorizer::default();
    let mut transport = MockTransport::new();
    transport.reply(200, "").redirect("https://sso.cqu.edu.cn/").reply(200, "");

    authorizer.logout_async(&mut transport).await.unwrap();
    assert!(authorizer.is_logged_in_async(&mut transport).await.unwrap());
    assert!(!authorizer.is_logged_in_async(&mut transport).await.unwrap());

    assert_eq!(transport.requests[0].url, SSO_LOGOUT_URL);
    assert_eq!(transport.requests[0].redirects, Redirects::Follow);
    assert_eq!(transport.requests[1].url, SSO_LOGIN_URL);
    assert_eq!(transport.requests[1].redirects, Redirects::Manual);
}
