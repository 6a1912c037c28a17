//! Startup and authentication
//!
//! Sends the StartupMessage, answers the authentication exchange (trust, cleartext
//! password or SCRAM-SHA-256) and drains BackendKeyData / ParameterStatus until the
//! first ReadyForQuery.

use super::pump::{DiscardRows, Flow, Pump};
use super::{BackendKey, Completion, Exchange, Next, Operation};
use crate::auth::scram::{self, ScramClient, ScramState};
use crate::metrics::{counters, labels};
use crate::protocol::encode::startup;
use crate::protocol::{AuthenticationMessage, BackendMessage, FrontendMessage};
use crate::{Error, Result};
use std::time::Duration;
use tokio::sync::oneshot;

enum Auth {
    /// Nothing requested yet
    Pending,
    /// Cleartext password sent
    Cleartext,
    /// client-first sent
    ScramFirst(ScramClient),
    /// client-final sent
    ScramFinal(ScramClient, ScramState),
    /// Server accepted the credentials
    Done,
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Auth::Pending => "Pending",
            Auth::Cleartext => "Cleartext",
            Auth::ScramFirst(_) => "ScramFirst",
            Auth::ScramFinal(..) => "ScramFinal",
            Auth::Done => "Done",
        })
    }
}

/// Startup operation
pub struct Startup {
    params: Vec<(String, String)>,
    user: String,
    password: Option<String>,
    auth: Auth,
    mechanism: Option<&'static str>,
    pump: Pump,
    completion: Completion<()>,
    timeout: Option<Duration>,
}

impl Startup {
    /// Startup for `user` with extra startup parameters (`database`, `application_name`, ...)
    pub fn new(
        user: impl Into<String>,
        password: Option<String>,
        params: Vec<(String, String)>,
        timeout: Option<Duration>,
    ) -> (Self, oneshot::Receiver<Result<()>>) {
        let (completion, rx) = Completion::channel();
        (
            Self {
                params,
                user: user.into(),
                password,
                auth: Auth::Pending,
                mechanism: None,
                pump: Pump::new(),
                completion,
                timeout,
            },
            rx,
        )
    }

    fn password(&self) -> Result<&str> {
        self.password
            .as_deref()
            .ok_or_else(|| Error::Authentication("password required but not configured".into()))
    }

    fn authenticate(
        &mut self,
        msg: AuthenticationMessage,
        cx: &mut Exchange<'_>,
    ) -> Result<Flow> {
        match (msg, std::mem::replace(&mut self.auth, Auth::Pending)) {
            (AuthenticationMessage::Ok, previous) => {
                if matches!(previous, Auth::ScramFirst(_) | Auth::ScramFinal(..)) {
                    return Err(Error::Authentication(
                        "server accepted before SCRAM completed".into(),
                    ));
                }
                if let Some(mechanism) = self.mechanism {
                    counters::auth_successful(mechanism);
                }
                tracing::debug!(user = %self.user, "authenticated");
                self.auth = Auth::Done;
                Ok(Flow::Continue)
            }
            (AuthenticationMessage::CleartextPassword, Auth::Pending) => {
                let password = self.password()?.to_string();
                cx.write
                    .write_message(&FrontendMessage::Password(password))?;
                self.auth = Auth::Cleartext;
                self.mechanism = Some(labels::MECHANISM_CLEARTEXT);
                Ok(Flow::Stop)
            }
            (AuthenticationMessage::Md5Password { .. }, _) => Err(Error::Authentication(
                "MD5 password authentication is not supported".into(),
            )),
            (AuthenticationMessage::Sasl { mechanisms }, Auth::Pending) => {
                if !mechanisms.iter().any(|m| m == scram::MECHANISM) {
                    return Err(Error::Authentication(format!(
                        "no supported SASL mechanism in {mechanisms:?}"
                    )));
                }
                let client = ScramClient::new(self.user.clone(), self.password()?);
                cx.write.write_message(&FrontendMessage::SaslInitialResponse {
                    mechanism: scram::MECHANISM.to_string(),
                    data: client.client_first().into_bytes(),
                })?;
                self.auth = Auth::ScramFirst(client);
                self.mechanism = Some(labels::MECHANISM_SCRAM);
                Ok(Flow::Stop)
            }
            (AuthenticationMessage::SaslContinue { data }, Auth::ScramFirst(client)) => {
                let server_first = String::from_utf8(data)
                    .map_err(|_| Error::Authentication("server-first is not UTF-8".into()))?;
                let (client_final, state) = client.client_final(&server_first)?;
                cx.write.write_message(&FrontendMessage::SaslResponse {
                    data: client_final.into_bytes(),
                })?;
                self.auth = Auth::ScramFinal(client, state);
                Ok(Flow::Stop)
            }
            (AuthenticationMessage::SaslFinal { data }, Auth::ScramFinal(client, state)) => {
                let server_final = String::from_utf8(data)
                    .map_err(|_| Error::Authentication("server-final is not UTF-8".into()))?;
                client.verify_server_final(&server_final, &state)?;
                // AuthenticationOk follows
                self.auth = Auth::Done;
                Ok(Flow::Continue)
            }
            (other, state) => Err(Error::UnexpectedMessage(format!(
                "authentication message {other:?} while in {state:?}"
            ))),
        }
    }

    fn record_failure(&self) {
        if let (Some(mechanism), false) = (self.mechanism, matches!(self.auth, Auth::Done)) {
            counters::auth_failed(mechanism);
        }
    }
}

impl Operation for Startup {
    fn name(&self) -> &'static str {
        "startup"
    }

    fn on_start(&mut self, cx: &mut Exchange<'_>) -> Result<Next> {
        let mut params = vec![("user".to_string(), self.user.clone())];
        params.extend(self.params.iter().cloned());
        cx.write.write_message(&startup(params))?;
        Ok(Next::Write)
    }

    fn on_read(&mut self, cx: &mut Exchange<'_>) -> Result<Next> {
        let mut pump = std::mem::take(&mut self.pump);
        let mut ready = false;
        let next = pump.pump(
            cx,
            &mut DiscardRows,
            |msg, cx| match msg {
                BackendMessage::Authentication(auth) => self.authenticate(auth, cx),
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                } => {
                    cx.session.backend_key = Some(BackendKey {
                        process_id,
                        secret_key,
                    });
                    Ok(Flow::Continue)
                }
                BackendMessage::ReadyForQuery(_) => {
                    ready = true;
                    Ok(Flow::Stop)
                }
                other => Err(Error::UnexpectedMessage(format!(
                    "{} during startup",
                    other.name()
                ))),
            },
            |_, cx| {
                if cx.write.is_empty() {
                    Ok(Next::Finished)
                } else {
                    Ok(Next::Write)
                }
            },
        );
        self.pump = pump;
        let next = next?;

        // the backend closes the socket after a startup error; do not wait for it
        if let Some(err) = self.pump.take_error() {
            return Err(err);
        }
        if next == Next::Finished && !ready {
            return Err(Error::Protocol("startup stopped before ReadyForQuery".into()));
        }
        if next == Next::Finished {
            if !matches!(self.auth, Auth::Done) {
                return Err(Error::Authentication(
                    "ReadyForQuery before authentication completed".into(),
                ));
            }
            tracing::info!(user = %self.user, "session established");
            self.completion.complete(Ok(()));
        }
        Ok(next)
    }

    fn on_fail(&mut self, err: Error) {
        self.record_failure();
        tracing::debug!(error = %err, "startup failed");
        self.completion.complete(Err(err));
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}
