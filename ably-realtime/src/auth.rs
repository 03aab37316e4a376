//! Credentials: API key (basic auth), static token, or a callback producing
//! signed token requests that are exchanged for tokens over REST.

use std::fmt;
use std::future::Future;

use tracing::{debug, info};

use crate::error::{Error, ErrorInfo, error_code};
use crate::options::{AuthCallback, ClientOptions};
use crate::types::{TokenDetails, TokenRequest, now_millis};

const PROTOCOL_VERSION: &str = "5";

/// A token is treated as expired this long before its stated expiry.
const EXPIRY_MARGIN_MS: i64 = 15_000;

/// What a transport presents to the service.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// `keyName:keySecret`
    Key(String),
    Token(String),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Key(_) => f.write_str("Key(<redacted>)"),
            Credential::Token(_) => f.write_str("Token(<redacted>)"),
        }
    }
}

pub(crate) struct Auth {
    key: Option<String>,
    token: Option<String>,
    callback: Option<AuthCallback>,
    http: reqwest::Client,
    rest_host: String,
    tls: bool,
    port: Option<u16>,
    current: Option<TokenDetails>,
}

impl Auth {
    pub(crate) fn new(options: &ClientOptions) -> Self {
        if let Some(name) = options.key_name() {
            debug!(key_name = name, "using basic auth");
        }
        Self {
            key: options.key.clone(),
            token: options.token.clone(),
            callback: options.auth_callback.clone(),
            http: reqwest::Client::new(),
            rest_host: options.rest_host(),
            tls: options.tls,
            port: options.port,
            current: None,
        }
    }

    /// Resolves without I/O when possible. `None` means a token must be
    /// fetched with [`Auth::fetch`].
    pub(crate) fn cached(&self, force_new: bool) -> Option<Result<Credential, ErrorInfo>> {
        if let Some(callback_token) = self.current.as_ref().filter(|t| !force_new && is_fresh(t)) {
            return Some(Ok(Credential::Token(callback_token.token.clone())));
        }
        if self.callback.is_some() {
            return None;
        }
        if let Some(token) = &self.token {
            if force_new {
                return Some(Err(ErrorInfo::new(
                    error_code::TOKEN_NOT_RENEWABLE,
                    403,
                    "Token not renewable: no means to renew the token was provided",
                )));
            }
            return Some(Ok(Credential::Token(token.clone())));
        }
        Some(
            self.key
                .clone()
                .map(Credential::Key)
                .ok_or_else(|| ErrorInfo::new(error_code::INVALID_CREDENTIALS, 401, "No credentials configured")),
        )
    }

    /// Runs the auth callback and exchanges its token request. `host`
    /// overrides the REST host, e.g. with a fallback that reached CONNECTED.
    pub(crate) fn fetch(
        &self,
        host: Option<String>,
    ) -> impl Future<Output = Result<TokenDetails, ErrorInfo>> + Send + 'static {
        let callback = self.callback.clone();
        let http = self.http.clone();
        let base = rest_base(&host.unwrap_or_else(|| self.rest_host.clone()), self.tls, self.port);
        async move {
            let Some(callback) = callback else {
                return Err(ErrorInfo::new(
                    error_code::TOKEN_NOT_RENEWABLE,
                    403,
                    "Token not renewable: no auth callback configured",
                ));
            };
            info!("requesting token");
            let token_request = callback().await.map_err(|e| Error::TokenFetch(e).into_error_info())?;
            exchange_token(&http, &token_request, &base)
                .await
                .map_err(Error::into_error_info)
        }
    }

    /// Remembers a fetched token for later connect attempts.
    pub(crate) fn store(&mut self, token: TokenDetails) -> Credential {
        let credential = Credential::Token(token.token.clone());
        self.current = Some(token);
        credential
    }
}

fn is_fresh(token: &TokenDetails) -> bool {
    token.expires == 0 || token.expires - EXPIRY_MARGIN_MS > now_millis()
}

fn rest_base(host: &str, tls: bool, port: Option<u16>) -> String {
    let scheme = if tls { "https" } else { "http" };
    match port {
        Some(port) if !host.contains(':') => format!("{scheme}://{host}:{port}"),
        _ => format!("{scheme}://{host}"),
    }
}

/// Exchange a TokenRequest for a TokenDetails via Ably's REST API.
pub(crate) async fn exchange_token(
    client: &reqwest::Client,
    token_request: &TokenRequest,
    base: &str,
) -> Result<TokenDetails, Error> {
    let url = format!("{base}/keys/{}/requestToken", token_request.key_name);
    let resp = client
        .post(&url)
        .header("X-Ably-Version", PROTOCOL_VERSION)
        .json(token_request)
        .send()
        .await?
        .error_for_status()?
        .json::<TokenDetails>()
        .await?;
    Ok(resp)
}
