//! App Store Connect authentication.
//!
//! - [`session`]: cookie jar and the derived "usable" flags
//! - [`authenticator`]: sign-in, two-step verification and session repair
//! - [`second_factor`]: where security codes come from

pub mod authenticator;
pub mod second_factor;
pub mod session;

pub use authenticator::{AuthEndpoints, AuthError, SessionAuthenticator, VerificationChallenge};
pub use second_factor::{FixedCode, SecondFactorProvider, TerminalPrompt, provider_for};
pub use session::{ACCOUNT_COOKIE, CredentialSession, SESSION_COOKIE};
