//! Per-message protocol handling: validate, authenticate, route.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::context::BridgeContext;
use crate::events::LogLevel;
use crate::proto::{
    AUTH_ALREADY, AUTH_REJECTED, AUTH_SUCCESS, Command, CommandName, Envelope, Response, VERSION,
};
use crate::session::{AuthOutcome, Session};
use crate::workflow;

/// Sending half of a connection's response queue.
///
/// Every response is checked against the outbound schema first; one that
/// fails is logged and dropped instead of reaching the client.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Response>,
}

impl Outbox {
    pub fn new(tx: mpsc::Sender<Response>) -> Self {
        Self { tx }
    }

    /// A bounded queue and its receiving end.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Response>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self::new(tx), rx)
    }

    pub async fn send(&self, response: Response) {
        if let Err(e) = response.validate() {
            warn!(
                communication = %response.communication,
                "suppressing invalid response: {e}"
            );
            return;
        }
        if self.tx.send(response).await.is_err() {
            debug!("connection closed before response could be sent");
        }
    }
}

/// Handle one inbound text frame and queue the reply.
///
/// Never fails: every input, however malformed, produces exactly one final
/// response (sign also queues a progress status before it).
pub async fn handle_message(
    ctx: &BridgeContext,
    session: &mut Session,
    text: &str,
    out: &Outbox,
) {
    let response = respond(ctx, session, text, out).await;
    out.send(response).await;
}

async fn respond(
    ctx: &BridgeContext,
    session: &mut Session,
    text: &str,
    out: &Outbox,
) -> Response {
    let envelope = match Envelope::from_json(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!("rejecting frame: {e}");
            return Response::invalid_payload(&e);
        }
    };

    let name = envelope.command_name();
    if name != Some(CommandName::Passcode) && !session.is_authenticated() {
        debug!(command = %envelope.command, "command before authentication");
        return Response::must_authenticate();
    }

    let Some(name) = name else {
        debug!(command = %envelope.command, "unknown command");
        return Response::unknown_command();
    };

    let command = match envelope.into_command(name) {
        Ok(command) => command,
        Err(e) => {
            debug!(command = %name, "rejecting frame: {e}");
            return Response::invalid_payload(&e);
        }
    };

    debug!(command = %name, "dispatching");
    match command {
        Command::Passcode { code } => match session.authenticate(&code, ctx.passcode()) {
            AuthOutcome::Granted => {
                info!("client authenticated");
                ctx.log(LogLevel::Info, "Client authenticated.");
                Response::status(AUTH_SUCCESS)
            }
            AuthOutcome::Rejected => {
                warn!("client sent a wrong passcode");
                ctx.log(LogLevel::Error, "Client sent a wrong passcode.");
                Response::status(AUTH_REJECTED)
            }
            AuthOutcome::AlreadyAuthenticated => Response::status(AUTH_ALREADY),
        },
        Command::Sign {
            message,
            fingerprint,
        } => workflow::sign(ctx, out, &message, &fingerprint).await,
        Command::GetKeys => workflow::get_keys(ctx).await,
        Command::Version => {
            Response::status(VERSION).with_product(ctx.app_name(), ctx.app_version())
        }
        Command::ImportKey { message } => workflow::import_key(ctx, &message).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyRecord;
    use crate::proto::{AUTH_REQUIRED, INVALID_PAYLOAD, UNKNOWN_COMMAND};
    use crate::testing::TestBridge;

    /// Drives one connection the way the server does and collects replies.
    struct Client {
        bridge: TestBridge,
        session: Session,
        out: Outbox,
        rx: mpsc::Receiver<Response>,
    }

    impl Client {
        fn new(bridge: TestBridge) -> Self {
            let (out, rx) = Outbox::channel(16);
            Self {
                bridge,
                session: Session::new(),
                out,
                rx,
            }
        }

        /// Send a frame and return every response it produced.
        async fn send(&mut self, text: &str) -> Vec<Response> {
            handle_message(&self.bridge.ctx, &mut self.session, text, &self.out).await;
            let mut replies = Vec::new();
            while let Ok(resp) = self.rx.try_recv() {
                replies.push(resp);
            }
            replies
        }

        async fn send_one(&mut self, text: &str) -> Response {
            let mut replies = self.send(text).await;
            assert_eq!(replies.len(), 1, "expected one reply to {text}");
            replies.remove(0)
        }

        async fn login(&mut self) {
            let resp = self
                .send_one(r#"{"command":"passcode","message":"123456"}"#)
                .await;
            assert_eq!(resp.communication, AUTH_SUCCESS);
        }
    }

    #[tokio::test]
    async fn version_requires_authentication() {
        let mut client = Client::new(TestBridge::new());

        let resp = client.send_one(r#"{"command":"version"}"#).await;
        assert_eq!(resp, Response::status(AUTH_REQUIRED));

        client.login().await;

        let resp = client.send_one(r#"{"command":"version"}"#).await;
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"communication": "version", "name": "gpg-bridge", "version": "0.3.0"})
        );
    }

    #[tokio::test]
    async fn nothing_reaches_gpg_before_authentication() {
        let mut client = Client::new(TestBridge::new());
        for frame in [
            r#"{"command":"getkeys"}"#,
            r#"{"command":"sign","message":"aGk=","fingerprint":"ABCD"}"#,
            r#"{"command":"importkey","message":"aGk="}"#,
            r#"{"command":"version"}"#,
        ] {
            let resp = client.send_one(frame).await;
            assert_eq!(resp.communication, AUTH_REQUIRED);
        }
        assert!(client.bridge.runner.calls().is_empty());
        assert!(client.bridge.leftover_files().is_empty());
        assert!(!client.session.is_authenticated());
    }

    #[tokio::test]
    async fn wrong_passcode_keeps_session_locked() {
        let mut client = Client::new(TestBridge::new());

        let resp = client
            .send_one(r#"{"command":"passcode","message":"654321"}"#)
            .await;
        assert_eq!(resp.communication, AUTH_REJECTED);

        let resp = client.send_one(r#"{"command":"getkeys"}"#).await;
        assert_eq!(resp.communication, AUTH_REQUIRED);
    }

    #[tokio::test]
    async fn second_passcode_is_acknowledged_without_change() {
        let mut client = Client::new(TestBridge::new());
        client.login().await;

        let resp = client
            .send_one(r#"{"command":"passcode","message":"000000"}"#)
            .await;
        assert_eq!(resp.communication, AUTH_ALREADY);
        assert!(client.session.is_authenticated());
    }

    #[tokio::test]
    async fn unknown_command_before_and_after_auth() {
        let mut client = Client::new(TestBridge::new());

        let resp = client.send_one(r#"{"command":"frobnicate"}"#).await;
        assert_eq!(resp.communication, AUTH_REQUIRED);

        client.login().await;

        let resp = client.send_one(r#"{"command":"frobnicate"}"#).await;
        assert_eq!(resp.communication, UNKNOWN_COMMAND);
    }

    #[tokio::test]
    async fn malformed_frames_get_invalid_payload() {
        let mut client = Client::new(TestBridge::new());
        for frame in ["{", "[1,2]", r#"{"command":null}"#, ""] {
            let resp = client.send_one(frame).await;
            assert_eq!(resp.communication, INVALID_PAYLOAD);
            assert!(resp.error.is_some());
        }
        assert!(!client.session.is_authenticated());

        client.login().await;
        let resp = client.send_one(r#"{"command":"sign","message":"aGk="}"#).await;
        assert_eq!(resp.communication, INVALID_PAYLOAD);
        assert!(client.session.is_authenticated());
    }

    #[tokio::test]
    async fn passcode_without_message_is_invalid() {
        let mut client = Client::new(TestBridge::new());
        let resp = client.send_one(r#"{"command":"passcode"}"#).await;
        assert_eq!(resp.communication, INVALID_PAYLOAD);
    }

    #[tokio::test]
    async fn getkeys_on_empty_keyring() {
        let mut client = Client::new(TestBridge::new());
        client.bridge.runner.respond_to("--with-colons", 0, "", "");
        client.login().await;

        let resp = client.send_one(r#"{"command":"getkeys"}"#).await;
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"communication": "No GPG keys found.", "gpgkeys": []})
        );
    }

    #[tokio::test]
    async fn sign_sends_progress_then_result() {
        let mut client = Client::new(TestBridge::new());
        client
            .bridge
            .runner
            .respond_to("--detach-sign", 0, "-----BEGIN PGP SIGNATURE-----\n", "");
        client.login().await;

        let replies = client
            .send(r#"{"command":"sign","message":"aGk=","fingerprint":"ABCD"}"#)
            .await;
        let texts: Vec<&str> = replies.iter().map(|r| r.communication.as_str()).collect();
        assert_eq!(texts, [workflow::SIGN_STARTED, workflow::SIGN_SUCCEEDED]);
    }

    #[tokio::test]
    async fn invalid_outbound_frame_is_suppressed() {
        let (out, mut rx) = Outbox::channel(4);
        out.send(Response::status("Keys retrieved.").with_keys(vec![KeyRecord {
            fingerprint: String::new(),
            uid: "Alice".into(),
            pubkey: None,
        }]))
        .await;
        out.send(Response::status("")).await;
        drop(out);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn closed_connection_is_not_an_error() {
        let (out, rx) = Outbox::channel(1);
        drop(rx);
        out.send(Response::status("ok")).await;
    }
}
