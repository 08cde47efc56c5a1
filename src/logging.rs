//! Tracing setup for the binary.
//!
//! Logs go to stderr. The account password is registered once it is known and
//! replaced by `********` in every line written afterwards.

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

const DEFAULT_FILTER: &str = "app_store_analytics=info,warn";
const VERBOSE_FILTER: &str = "app_store_analytics=debug,info";
const MASK: &str = "********";

/// Secrets to scrub from log output. Cheap to clone; clones share the slot.
#[derive(Debug, Clone, Default)]
pub struct Redactions {
    secret: Arc<Mutex<Option<String>>>,
}

impl Redactions {
    /// Start masking `secret`. Empty strings are ignored.
    pub fn set(&self, secret: impl Into<String>) {
        let secret = secret.into();
        if !secret.is_empty() {
            *self.secret.lock() = Some(secret);
        }
    }

    fn apply<'a>(&self, text: &'a str) -> std::borrow::Cow<'a, str> {
        match self.secret.lock().as_deref() {
            Some(secret) if text.contains(secret) => text.replace(secret, MASK).into(),
            _ => text.into(),
        }
    }
}

pub struct RedactingWriter<W> {
    inner: W,
    redactions: Redactions,
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        self.inner.write_all(self.redactions.apply(&text).as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

pub struct RedactingMakeWriter {
    redactions: Redactions,
}

impl<'a> MakeWriter<'a> for RedactingMakeWriter {
    type Writer = RedactingWriter<std::io::Stderr>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter {
            inner: std::io::stderr(),
            redactions: self.redactions.clone(),
        }
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `verbose`.
pub fn init(verbose: bool) -> Redactions {
    let redactions = Redactions::default();
    let fallback = if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_writer(RedactingMakeWriter {
            redactions: redactions.clone(),
        })
        .try_init();
    redactions
}
