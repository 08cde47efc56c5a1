//! Login state machine for the App Store Connect identity service.
//!
//! # State Machine
//!
//! ```text
//! Start ──▶ CredentialsSubmitted ──┬──▶ Verified ──▶ SessionEstablished
//!                                  ├──▶ TwoFactorPending ──▶ Verified
//!                                  └──▶ RepairPending ─────▶ Verified
//! ```
//!
//! Every state may also end in `Failed`, which is represented by returning an
//! [`AuthError`] from [`SessionAuthenticator::authenticate`].

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use super::second_factor::SecondFactorProvider;
use super::session::CredentialSession;
use crate::http::{HttpRequest, HttpResponse, HttpTransport, TransportError};

/// Widget key the App Store Connect web client identifies itself with.
pub const DEFAULT_WIDGET_KEY: &str =
    "e0b80c3bf78523bfe80974d320935bfa30add02e1bff88ec2166c6bd5a706c42";

const SESSION_ID_HEADER: &str = "X-Apple-ID-Session-Id";
const SCNT_HEADER: &str = "scnt";
const WIDGET_KEY_HEADER: &str = "X-Apple-Widget-Key";

/// Maximum number of response-body bytes kept in [`AuthError::Unexpected`].
const MAX_ERROR_BODY: usize = 512;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("two-step verification required but no security code was provided")]
    MissingSecondFactor,

    #[error("too many security codes requested; try again later or reuse the last code")]
    RateLimited,

    #[error("two-step verification rejected (status {status})")]
    ChallengeRejected { status: u16 },

    #[error("could not skip two-step verification via session repair (status {status})")]
    RepairFailed { status: u16 },

    #[error("login response did not set the account info cookie")]
    MissingAccountCookie,

    #[error("session response did not set the session cookie")]
    MissingSessionCookie,

    #[error("unexpected response from identity service (status {status}): {body}")]
    Unexpected { status: u16, body: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl AuthError {
    /// Short recovery hint for the operator.
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "Check ASA_USERNAME and ASA_PASSWORD.",
            Self::MissingSecondFactor => {
                "Pass --code or set ASA_SECURITY_CODE, or run interactively."
            }
            Self::RateLimited => "Wait before requesting another code, or reuse the last one.",
            Self::ChallengeRejected { .. } => "Request a fresh code and try again.",
            Self::RepairFailed { .. } => "Sign in through the web portal once, then retry.",
            Self::MissingAccountCookie | Self::MissingSessionCookie => {
                "The portal's login response changed shape; this needs a code update."
            }
            Self::Unexpected { .. } => "Retry later; the identity service may be degraded.",
            Self::Transport(_) => "Check network connectivity and retry.",
        }
    }

    /// Whether re-running the login may succeed without operator changes.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unexpected { .. } | Self::Transport(_))
    }
}

/// Where the identity service lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthEndpoints {
    /// Base of the `appleauth/auth` API.
    pub auth_base_url: String,
    /// App Store Connect session endpoint handing out the session cookie.
    pub session_url: String,
    pub widget_key: String,
}

impl Default for AuthEndpoints {
    fn default() -> Self {
        Self {
            auth_base_url: "https://idmsa.apple.com/appleauth/auth".to_string(),
            session_url: "https://appstoreconnect.apple.com/olympus/v1/session".to_string(),
            widget_key: DEFAULT_WIDGET_KEY.to_string(),
        }
    }
}

/// Context the identity service hands out with a 409/412 and expects back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationChallenge {
    pub session_id: Option<String>,
    pub scnt: Option<String>,
}

impl VerificationChallenge {
    fn from_response(response: &HttpResponse) -> Self {
        Self {
            session_id: response.header(SESSION_ID_HEADER).map(str::to_string),
            scnt: response.header(SCNT_HEADER).map(str::to_string),
        }
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = Vec::with_capacity(2);
        if let Some(id) = &self.session_id {
            headers.push((SESSION_ID_HEADER, id.clone()));
        }
        if let Some(scnt) = &self.scnt {
            headers.push((SCNT_HEADER, scnt.clone()));
        }
        headers
    }
}

#[derive(Debug)]
enum AuthState {
    Start,
    CredentialsSubmitted(HttpResponse),
    TwoFactorPending(VerificationChallenge),
    RepairPending(VerificationChallenge),
    Verified,
    SessionEstablished,
}

impl AuthState {
    fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::CredentialsSubmitted(_) => "credentials_submitted",
            Self::TwoFactorPending(_) => "two_factor_pending",
            Self::RepairPending(_) => "repair_pending",
            Self::Verified => "verified",
            Self::SessionEstablished => "session_established",
        }
    }
}

/// Drives the sign-in protocol over an [`HttpTransport`].
pub struct SessionAuthenticator<T> {
    transport: Arc<T>,
    endpoints: AuthEndpoints,
}

impl<T: HttpTransport> SessionAuthenticator<T> {
    pub fn new(transport: Arc<T>, endpoints: AuthEndpoints) -> Self {
        Self {
            transport,
            endpoints,
        }
    }

    /// Log in and return a session carrying both the account and session cookies.
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
        second_factor: &mut dyn SecondFactorProvider,
    ) -> Result<CredentialSession, AuthError> {
        let mut session = CredentialSession::new();
        let mut state = AuthState::Start;

        loop {
            let from = state.name();
            let next = match state {
                AuthState::Start => {
                    let response = self
                        .submit_credentials(&mut session, username, password)
                        .await?;
                    AuthState::CredentialsSubmitted(response)
                }
                AuthState::CredentialsSubmitted(response) => classify_sign_in(&response)?,
                AuthState::TwoFactorPending(challenge) => {
                    self.verify_second_factor(&mut session, &challenge, second_factor)
                        .await?
                }
                AuthState::RepairPending(challenge) => {
                    self.repair_session(&mut session, &challenge).await?
                }
                AuthState::Verified => self.establish_session(&mut session).await?,
                AuthState::SessionEstablished => break,
            };
            debug!(from, to = next.name(), "auth transition");
            state = next;
        }

        info!(cookies = session.len(), "app store connect session established");
        Ok(session)
    }

    async fn send(
        &self,
        session: &mut CredentialSession,
        request: HttpRequest,
    ) -> Result<HttpResponse, AuthError> {
        let request = request
            .headers(session.request_headers())
            .header(WIDGET_KEY_HEADER, self.endpoints.widget_key.clone());
        let response = self.transport.execute(request).await?;
        session.absorb_response(&response);
        Ok(response)
    }

    async fn submit_credentials(
        &self,
        session: &mut CredentialSession,
        username: &str,
        password: &str,
    ) -> Result<HttpResponse, AuthError> {
        let url = format!(
            "{}/signin?isRememberMeEnabled=true",
            self.endpoints.auth_base_url
        );
        let body = serde_json::json!({
            "accountName": username,
            "password": password,
            "rememberMe": false,
        });
        self.send(session, HttpRequest::post(url).json(body)).await
    }

    async fn verify_second_factor(
        &self,
        session: &mut CredentialSession,
        challenge: &VerificationChallenge,
        second_factor: &mut dyn SecondFactorProvider,
    ) -> Result<AuthState, AuthError> {
        debug!("handling two-step verification");
        let code_request = HttpRequest::get(self.endpoints.auth_base_url.clone())
            .headers(challenge.headers());
        let response = self.send(session, code_request).await?;
        match response.status {
            s if (200..300).contains(&s) => {}
            423 => return Err(AuthError::RateLimited),
            status => return Err(AuthError::ChallengeRejected { status }),
        }

        let code = second_factor
            .security_code()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or(AuthError::MissingSecondFactor)?;

        let url = format!(
            "{}/verify/phone/securitycode",
            self.endpoints.auth_base_url
        );
        let body = serde_json::json!({
            "mode": "sms",
            "phoneNumber": { "id": 1 },
            "securityCode": { "code": code },
        });
        let response = self
            .send(
                session,
                HttpRequest::post(url).headers(challenge.headers()).json(body),
            )
            .await?;
        if response.is_success() {
            Ok(AuthState::Verified)
        } else {
            Err(AuthError::ChallengeRejected {
                status: response.status,
            })
        }
    }

    async fn repair_session(
        &self,
        session: &mut CredentialSession,
        challenge: &VerificationChallenge,
    ) -> Result<AuthState, AuthError> {
        debug!("completing session repair");
        let url = format!("{}/repair/complete", self.endpoints.auth_base_url);
        let response = self
            .send(session, HttpRequest::post(url).headers(challenge.headers()))
            .await?;
        if response.is_success() {
            Ok(AuthState::Verified)
        } else {
            Err(AuthError::RepairFailed {
                status: response.status,
            })
        }
    }

    async fn establish_session(
        &self,
        session: &mut CredentialSession,
    ) -> Result<AuthState, AuthError> {
        if !session.has_account_cookie() {
            return Err(AuthError::MissingAccountCookie);
        }
        let response = self
            .send(session, HttpRequest::get(self.endpoints.session_url.clone()))
            .await?;
        if !response.is_success() {
            return Err(unexpected(&response));
        }
        if !session.has_session_cookie() {
            return Err(AuthError::MissingSessionCookie);
        }
        Ok(AuthState::SessionEstablished)
    }
}

/// Transition out of `CredentialsSubmitted` based on the sign-in status.
fn classify_sign_in(response: &HttpResponse) -> Result<AuthState, AuthError> {
    match response.status {
        s if (200..300).contains(&s) => Ok(AuthState::Verified),
        409 => Ok(AuthState::TwoFactorPending(
            VerificationChallenge::from_response(response),
        )),
        412 => Ok(AuthState::RepairPending(VerificationChallenge::from_response(
            response,
        ))),
        401 => Err(AuthError::InvalidCredentials),
        _ => Err(unexpected(response)),
    }
}

fn unexpected(response: &HttpResponse) -> AuthError {
    let mut body = response.body.clone();
    if body.len() > MAX_ERROR_BODY {
        let cut = (0..=MAX_ERROR_BODY)
            .rev()
            .find(|i| body.is_char_boundary(*i))
            .unwrap_or(0);
        body.truncate(cut);
    }
    AuthError::Unexpected {
        status: response.status,
        body,
    }
}
