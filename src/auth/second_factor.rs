//! Sources of the second-factor security code.

use std::io::IsTerminal;

use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::warn;

/// Supplies the out-of-band verification code when the portal asks for one.
pub trait SecondFactorProvider: Send {
    /// Return the code, or `None` when no code could be obtained.
    fn security_code(&mut self) -> Option<String>;
}

/// A code known ahead of time (CLI flag, env var, tests).
#[derive(Debug, Clone, Default)]
pub struct FixedCode(Option<String>);

impl FixedCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(Some(code.into()))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

impl SecondFactorProvider for FixedCode {
    fn security_code(&mut self) -> Option<String> {
        self.0.clone()
    }
}

/// Prompts on the controlling terminal.
#[derive(Debug, Clone, Default)]
pub struct TerminalPrompt;

impl SecondFactorProvider for TerminalPrompt {
    fn security_code(&mut self) -> Option<String> {
        if !std::io::stdin().is_terminal() {
            warn!("second factor requested but stdin is not a terminal");
            return None;
        }
        let answer = off_runtime(|| {
            dialoguer::Input::<String>::new()
                .with_prompt("Enter 2SV code")
                .allow_empty(true)
                .interact_text()
        });
        match answer {
            Ok(code) => Some(code),
            Err(e) => {
                warn!("reading 2SV code failed: {e}");
                None
            }
        }
    }
}

/// Run a blocking call without stalling the other tasks of a multi-thread runtime.
fn off_runtime<R>(blocking: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(blocking)
        }
        _ => blocking(),
    }
}

/// Prefer a fixed code when one was configured, otherwise prompt.
pub fn provider_for(code: Option<String>) -> Box<dyn SecondFactorProvider> {
    match code {
        Some(code) if !code.trim().is_empty() => Box::new(FixedCode::new(code.trim())),
        _ => Box::new(TerminalPrompt),
    }
}

impl<P: SecondFactorProvider + ?Sized> SecondFactorProvider for Box<P> {
    fn security_code(&mut self) -> Option<String> {
        (**self).security_code()
    }
}
