//! SSLRequest probe
//!
//! Asks the backend whether it accepts TLS. The answer is a single unframed byte:
//! `S` (go ahead with the handshake) or `N` (plaintext only).

use super::{Completion, Exchange, Next, Operation};
use crate::protocol::FrontendMessage;
use crate::{Error, Result};
use std::time::Duration;
use tokio::sync::oneshot;

/// Probe operation resolving to whether the backend accepts encryption
#[derive(Debug)]
pub struct SslProbe {
    completion: Completion<bool>,
    timeout: Option<Duration>,
}

impl SslProbe {
    /// Probe and the receiver for its answer
    pub fn new(timeout: Option<Duration>) -> (Self, oneshot::Receiver<Result<bool>>) {
        let (completion, rx) = Completion::channel();
        (
            Self {
                completion,
                timeout,
            },
            rx,
        )
    }
}

impl Operation for SslProbe {
    fn name(&self) -> &'static str {
        "ssl_probe"
    }

    fn on_start(&mut self, cx: &mut Exchange<'_>) -> Result<Next> {
        cx.write.write_message(&FrontendMessage::SslRequest)?;
        Ok(Next::Write)
    }

    fn on_write(&mut self, _cx: &mut Exchange<'_>) -> Result<Next> {
        Ok(Next::read_at_least(1))
    }

    fn on_read(&mut self, cx: &mut Exchange<'_>) -> Result<Next> {
        let Some(&answer) = cx.read.readable().first() else {
            return Ok(Next::read_at_least(1));
        };
        cx.read.consume(1);
        let accepted = match answer {
            b'S' => true,
            b'N' => false,
            other => {
                return Err(Error::UnexpectedMessage(format!(
                    "SSLRequest answered with {:?}",
                    other as char
                )))
            }
        };
        // anything after the answer arrived unencrypted and cannot be trusted
        if !cx.read.is_empty() {
            return Err(Error::Protocol(
                "unexpected data after SSLRequest answer".into(),
            ));
        }
        tracing::debug!(accepted, "ssl probe answered");
        self.completion.complete(Ok(accepted));
        Ok(Next::Finished)
    }

    fn on_fail(&mut self, err: Error) {
        self.completion.complete(Err(err));
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}
