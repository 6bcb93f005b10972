use std::{borrow::Cow, sync::OnceLock};

use regex::Regex;
use thiserror::Error;
use tl::{HTMLTag, Node, Parser, ParserOptions, VDom};

const SALT_FORMAT: &str = r#"var pwdDefaultEncryptSalt = "([^"]+)""#;
// Hidden inputs of the authserver login form that are echoed back on submit.
const AUTHSERVER_HIDDEN_INPUTS: [&str; 5] = ["lt", "dllt", "execution", "_eventId", "rmShown"];

const SSO_CROYPTO_ID: &str = "login-croypto";
const SSO_FLOWKEY_ID: &str = "login-page-flowkey";
const SSO_CAPTCHA_URL_ID: &str = "captcha-url";
const SSO_ERROR_ID: &str = "login-error-msg";

/// SSO error code returned for a wrong captcha.
pub const SSO_CAPTCHA_ERROR_CODE: u32 = 1320007;
/// SSO error codes returned for a wrong username or password.
pub const SSO_CREDENTIAL_ERROR_CODES: [u32; 2] = [1030027, 1030031];

/// Human readable message for a known SSO error code.
pub fn sso_error_message(code: u32) -> Option<&'static str> {
    Some(match code {
        1030027 | 1030031 => "用户名或密码错误，请确认后重新输入",
        1410040 | 1410041 => "当前用户名已失效",
        SSO_CAPTCHA_ERROR_CODE => "验证码有误，请确认后重新输入",
        _ => return None,
    })
}

/// Fields scraped from the authserver login page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthserverLoginPage {
    /// Hidden form inputs, in page order. Inputs without a value are left out.
    pub hidden_inputs: Vec<(String, String)>,
    /// AES key for the password field.
    pub salt: String,
    /// Message of the error block shown instead of the form, e.g. `应用未注册`.
    pub error: Option<String>,
}

impl AuthserverLoginPage {
    pub fn parse(html: &str) -> Result<Self, ParseError> {
        let dom = tl::parse(html, ParserOptions::default())?;
        let parser = dom.parser();

        let mut hidden_inputs: Vec<(String, String)> = Vec::new();
        let mut error = None;
        for tag in tags(&dom) {
            match &*tag.name().as_utf8_str() {
                "input" => {
                    let Some(name) = attribute(tag, "name") else {
                        continue;
                    };
                    if !AUTHSERVER_HIDDEN_INPUTS.contains(&&*name) {
                        continue;
                    }
                    let Some(value) = attribute(tag, "value") else {
                        continue;
                    };
                    // The page may render a field more than once; the last one wins.
                    hidden_inputs.retain(|(existing, _)| *existing != *name);
                    hidden_inputs.push((name.into_owned(), value.into_owned()));
                }
                "div" if error.is_none()
                    && attribute(tag, "id").as_deref() == Some("msg")
                    && has_class(tag, "errors") =>
                {
                    error = first_descendant(tag, parser, "h2")
                        .map(|heading| heading.inner_text(parser).trim().to_owned());
                }
                _ => {}
            }
        }

        // An error page carries neither a form nor a salt.
        if error.is_some() {
            return Ok(Self {
                hidden_inputs,
                salt: String::new(),
                error,
            });
        }

        let salt = salt_regex()
            .and_then(|salt| salt.captures(html))
            .and_then(|captures| captures.get(1))
            .map(|salt| salt.as_str().to_owned())
            .ok_or(ParseError::MissingField("pwdDefaultEncryptSalt"))?;
        if !hidden_inputs.iter().any(|(name, _)| name == "execution") {
            return Err(ParseError::MissingField("execution"));
        }

        Ok(Self {
            hidden_inputs,
            salt,
            error: None,
        })
    }
}

/// Fields scraped from the SSO login page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsoLoginPage {
    /// Base64 DES key for the password field.
    pub croypto: String,
    pub flow_key: String,
    /// Path of the captcha image, present only when the portal wants one.
    pub captcha_url: Option<String>,
}

impl SsoLoginPage {
    pub fn parse(html: &str) -> Result<Self, ParseError> {
        let dom = tl::parse(html, ParserOptions::default())?;
        let parser = dom.parser();

        let mut croypto = None;
        let mut flow_key = None;
        let mut captcha_url = None;
        for tag in tags(&dom).filter(|tag| tag.name().as_utf8_str() == "p") {
            let slot = match attribute(tag, "id").as_deref() {
                Some(SSO_CROYPTO_ID) => &mut croypto,
                Some(SSO_FLOWKEY_ID) => &mut flow_key,
                Some(SSO_CAPTCHA_URL_ID) => &mut captcha_url,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(tag.inner_text(parser).trim().to_owned());
            }
            if croypto.is_some() && flow_key.is_some() && captcha_url.is_some() {
                break;
            }
        }

        Ok(Self {
            croypto: croypto
                .filter(|value| !value.is_empty())
                .ok_or(ParseError::MissingField(SSO_CROYPTO_ID))?,
            flow_key: flow_key
                .filter(|value| !value.is_empty())
                .ok_or(ParseError::MissingField(SSO_FLOWKEY_ID))?,
            captcha_url: captcha_url.filter(|value| !value.is_empty()),
        })
    }
}

/// Numeric error code shown on a rejected SSO login, if there is one.
pub fn sso_error_code(html: &str) -> Result<Option<u32>, ParseError> {
    let dom = tl::parse(html, ParserOptions::default())?;
    Ok(get_node_from_id(&dom, SSO_ERROR_ID)
        .and_then(|node| node.inner_text(dom.parser()).trim().parse().ok()))
}

/// What the authserver answered to a login POST that didn't redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginResultPage {
    /// The account only allows one session and another one is active.
    Conflict {
        kick_execution: String,
        cancel_execution: String,
    },
    /// Inline error message next to the form.
    Error(String),
    Unrecognized,
}

impl LoginResultPage {
    pub fn parse(html: &str) -> Result<Self, ParseError> {
        let dom = tl::parse(html, ParserOptions::default())?;
        let parser = dom.parser();

        let mut message = None;
        let mut kick_table = false;
        let mut kick_execution = None;
        let mut cancel_execution = None;
        for tag in tags(&dom) {
            match &*tag.name().as_utf8_str() {
                "span"
                    if message.is_none()
                        && attribute(tag, "id").as_deref() == Some("msg")
                        && has_class(tag, "login_auth_error") =>
                {
                    message = Some(tag.inner_text(parser).trim().to_owned());
                }
                "table" if has_class(tag, "kick_table") => kick_table = true,
                "form" if is_post(tag) => {
                    let slot = match attribute(tag, "id").as_deref() {
                        Some("continue") => &mut kick_execution,
                        Some("cancel") => &mut cancel_execution,
                        _ => continue,
                    };
                    *slot = form_execution(tag, parser);
                }
                _ => {}
            }
        }

        if kick_table || kick_execution.is_some() {
            return Ok(Self::Conflict {
                kick_execution: kick_execution.unwrap_or_default(),
                cancel_execution: cancel_execution.unwrap_or_default(),
            });
        }
        Ok(match message {
            Some(message) => Self::Error(message),
            None => Self::Unrecognized,
        })
    }
}

fn salt_regex() -> Option<&'static Regex> {
    static SALT: OnceLock<Option<Regex>> = OnceLock::new();
    SALT.get_or_init(|| Regex::new(SALT_FORMAT).ok()).as_ref()
}

fn tags<'a, 'b>(dom: &'a VDom<'b>) -> impl Iterator<Item = &'a HTMLTag<'b>> + 'a {
    dom.nodes().iter().filter_map(Node::as_tag)
}

fn attribute<'a>(tag: &'a HTMLTag<'_>, name: &'a str) -> Option<Cow<'a, str>> {
    tag.attributes()
        .get(name)
        .flatten()
        .map(|value| value.as_utf8_str())
}

fn has_class(tag: &HTMLTag<'_>, class: &str) -> bool {
    attribute(tag, "class").map_or(false, |classes| {
        classes.split_whitespace().any(|name| name == class)
    })
}

fn is_post(tag: &HTMLTag<'_>) -> bool {
    attribute(tag, "method").map_or(false, |method| method.eq_ignore_ascii_case("post"))
}

fn first_descendant<'a, 'b>(
    tag: &'b HTMLTag<'a>,
    parser: &'b Parser<'a>,
    name: &str,
) -> Option<&'b HTMLTag<'a>> {
    tag.children()
        .all(parser)
        .iter()
        .filter_map(Node::as_tag)
        .find(|child| child.name().as_utf8_str() == name)
}

fn form_execution<'a, 'b>(form: &'b HTMLTag<'a>, parser: &'b Parser<'a>) -> Option<String> {
    form.children()
        .all(parser)
        .iter()
        .filter_map(Node::as_tag)
        .filter(|child| child.name().as_utf8_str() == "input")
        .find(|input| attribute(input, "name").as_deref() == Some("execution"))
        .and_then(|input| attribute(input, "value"))
        .map(Cow::into_owned)
}

fn get_node_from_id<'a>(dom: &'a VDom, id: &str) -> Option<&'a Node<'a>> {
    dom.get_element_by_id(id)?.get(dom.parser())
}

#[derive(Debug, Error)]
pub enum ParseError {
    /// HTML is not in a valid format.
    #[error("could not parse HTML due to invalid format")]
    InvalidHtmlFormat(#[from] tl::errors::ParseError),
    /// A field the login flow depends on is not on the page. Usually the page belongs to a stale
    /// session rather than a fresh login.
    #[error("could not find `{0}` in page")]
    MissingField(&'static str),
}
