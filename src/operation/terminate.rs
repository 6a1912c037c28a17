//! Graceful session end

use super::{Completion, Exchange, Next, Operation};
use crate::protocol::FrontendMessage;
use crate::{Error, Result};
use tokio::sync::oneshot;

/// Sends Terminate and closes the socket
#[derive(Debug)]
pub struct Terminate {
    completion: Completion<()>,
}

impl Terminate {
    /// Operation and the receiver signalling that Terminate was sent
    pub fn new() -> (Self, oneshot::Receiver<Result<()>>) {
        let (completion, rx) = Completion::channel();
        (Self { completion }, rx)
    }
}

impl Operation for Terminate {
    fn name(&self) -> &'static str {
        "terminate"
    }

    fn on_start(&mut self, cx: &mut Exchange<'_>) -> Result<Next> {
        cx.write.write_message(&FrontendMessage::Terminate)?;
        Ok(Next::Write)
    }

    fn on_read(&mut self, _cx: &mut Exchange<'_>) -> Result<Next> {
        Err(Error::UnexpectedMessage("data received after Terminate".into()))
    }

    fn on_write(&mut self, _cx: &mut Exchange<'_>) -> Result<Next> {
        self.completion.complete(Ok(()));
        Ok(Next::Terminate)
    }

    fn on_fail(&mut self, err: Error) {
        self.completion.complete(Err(err));
    }
}
