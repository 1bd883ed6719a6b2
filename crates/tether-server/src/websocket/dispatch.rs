//! Typed inbound message dispatch.
//!
//! After the handshake every text frame is an envelope
//! `{"type": .., "data": .., "request_id": ..}`. The registry routes it to
//! the handler registered for `type` and shapes the reply.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use metrics::counter;
use serde::Deserialize;
use serde_json::{Value, json};
use tether_core::ids::{ClientId, ConnectionId, SessionId};
use tether_session::ContextService;
use tracing::{debug, error, warn};

use super::registry::ConnectionRegistry;
use crate::metrics::{WS_HANDLER_ERRORS_TOTAL, WS_MESSAGES_TOTAL};

/// Error envelope code for an unregistered `type`.
pub const UNKNOWN_TYPE: &str = "UNKNOWN_TYPE";
/// Error envelope code for a frame that is not an envelope.
pub const INVALID_MESSAGE: &str = "INVALID_MESSAGE";
/// Error envelope code for [`HandlerError::Invalid`].
pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
/// Error envelope code for [`HandlerError::NotFound`].
pub const NOT_FOUND: &str = tether_core::errors::NOT_FOUND;

/// Default per-handler deadline.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// Failure from a [`MessageHandler`].
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The envelope `data` is unusable. Reported to the client.
    #[error("{0}")]
    Invalid(String),
    /// The referenced resource does not exist. Reported to the client.
    #[error("{0}")]
    NotFound(String),
    /// The handler could not complete. The connection is closed.
    #[error("{0}")]
    Internal(String),
}

/// What a handler sees besides the envelope data.
#[derive(Clone, Debug)]
pub struct InboundContext {
    /// Client that sent the message.
    pub client_id: ClientId,
    /// Connection serial of the sender.
    pub connection_id: ConnectionId,
    /// Session declared in the handshake.
    pub session_id: Option<SessionId>,
    /// Session and delta facade.
    pub context: ContextService,
    /// Outbound routing to any connected client.
    pub registry: Arc<ConnectionRegistry>,
}

/// Handler for one envelope `type`.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle `data`. `Ok(Some(v))` is sent back as `<type>.result`.
    async fn handle(
        &self,
        data: Value,
        ctx: &InboundContext,
    ) -> Result<Option<Value>, HandlerError>;
}

/// What the connection task should do after dispatch.
#[derive(Debug, PartialEq)]
pub enum DispatchOutcome {
    /// Send this envelope back.
    Reply(Value),
    /// Nothing to send.
    Silent,
    /// Close the connection with an internal-error code.
    Fatal {
        /// Envelope type that failed.
        kind: String,
        /// Server-side detail; never sent to the client.
        detail: String,
    },
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    request_id: Option<Value>,
}

/// Map from envelope type to handler.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
    timeout: Duration,
}

impl HandlerRegistry {
    /// Empty registry with the default deadline.
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_HANDLER_TIMEOUT)
    }

    /// Empty registry with a custom deadline.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            handlers: HashMap::new(),
            timeout,
        }
    }

    /// Registry with the built-in handlers.
    pub fn with_builtin(timeout: Duration) -> Self {
        let mut registry = Self::with_timeout(timeout);
        registry.register_builtin();
        registry
    }

    /// Register a handler for an envelope type.
    pub fn register(&mut self, kind: &str, handler: impl MessageHandler + 'static) {
        let _ = self.handlers.insert(kind.to_owned(), Arc::new(handler));
    }

    /// Register `ping`, `context.delta`, `context.reset` and `session.info`.
    pub fn register_builtin(&mut self) {
        self.register("ping", PingHandler);
        self.register("context.delta", ContextDeltaHandler);
        self.register("context.reset", ContextResetHandler);
        self.register("session.info", SessionInfoHandler);
    }

    /// Registered types, sorted.
    pub fn types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether a type is registered.
    pub fn has_type(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Parse and route one text frame.
    pub async fn dispatch(&self, text: &str, ctx: &InboundContext) -> DispatchOutcome {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(client_id = %ctx.client_id, error = %e, "invalid envelope received");
                return DispatchOutcome::Reply(error_envelope(
                    INVALID_MESSAGE,
                    &format!("invalid message: {e}"),
                    None,
                ));
            }
        };
        let Envelope {
            kind,
            data,
            request_id,
        } = envelope;

        let Some(handler) = self.handlers.get(&kind) else {
            counter!(WS_MESSAGES_TOTAL, "type" => "unknown").increment(1);
            debug!(client_id = %ctx.client_id, kind = %kind, "unknown message type");
            return DispatchOutcome::Reply(error_envelope(
                UNKNOWN_TYPE,
                &format!("unknown message type '{kind}'"),
                request_id,
            ));
        };
        counter!(WS_MESSAGES_TOTAL, "type" => kind.clone()).increment(1);

        let call = AssertUnwindSafe(handler.handle(data, ctx)).catch_unwind();
        let outcome = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(Ok(Some(value)))) => {
                DispatchOutcome::Reply(reply_envelope(&kind, value, request_id))
            }
            Ok(Ok(Ok(None))) => DispatchOutcome::Silent,
            Ok(Ok(Err(HandlerError::Invalid(message)))) => {
                counter!(WS_HANDLER_ERRORS_TOTAL, "type" => kind.clone()).increment(1);
                DispatchOutcome::Reply(error_envelope(INVALID_PARAMS, &message, request_id))
            }
            Ok(Ok(Err(HandlerError::NotFound(message)))) => {
                DispatchOutcome::Reply(error_envelope(NOT_FOUND, &message, request_id))
            }
            Ok(Ok(Err(HandlerError::Internal(detail)))) => fatal(kind, detail),
            Ok(Err(panic)) => fatal(kind, format!("handler panicked: {}", panic_message(&*panic))),
            Err(_elapsed) => fatal(kind, format!("handler timed out after {:?}", self.timeout)),
        };

        if let DispatchOutcome::Fatal { kind, detail } = &outcome {
            error!(
                client_id = %ctx.client_id,
                connection_id = %ctx.connection_id,
                kind = %kind,
                detail = %detail,
                "handler failed"
            );
        }
        outcome
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn fatal(kind: String, detail: String) -> DispatchOutcome {
    counter!(WS_HANDLER_ERRORS_TOTAL, "type" => kind.clone()).increment(1);
    DispatchOutcome::Fatal { kind, detail }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

fn reply_envelope(kind: &str, data: Value, request_id: Option<Value>) -> Value {
    let mut envelope = json!({ "type": format!("{kind}.result"), "data": data });
    if let Some(id) = request_id {
        envelope["request_id"] = id;
    }
    envelope
}

/// `{"type":"error","data":{"code":..,"message":..}}`.
pub fn error_envelope(code: &str, message: &str, request_id: Option<Value>) -> Value {
    let mut envelope = json!({
        "type": "error",
        "data": { "code": code, "message": message },
    });
    if let Some(id) = request_id {
        envelope["request_id"] = id;
    }
    envelope
}

// ── Built-in handlers ───────────────────────────────────────────────────────

/// Session id from `data.session_id`, falling back to the handshake's.
fn session_param(data: &Value, ctx: &InboundContext) -> Result<String, HandlerError> {
    match data.get("session_id") {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_owned()),
        Some(Value::String(_)) | None | Some(Value::Null) => ctx
            .session_id
            .as_ref()
            .map(ToString::to_string)
            .ok_or_else(|| HandlerError::Invalid("missing session_id".into())),
        Some(_) => Err(HandlerError::Invalid("session_id must be a string".into())),
    }
}

/// `ping` → `{pong: <server time ms>}`.
struct PingHandler;

#[async_trait]
impl MessageHandler for PingHandler {
    async fn handle(
        &self,
        _data: Value,
        _ctx: &InboundContext,
    ) -> Result<Option<Value>, HandlerError> {
        Ok(Some(json!({ "pong": chrono::Utc::now().timestamp_millis() })))
    }
}

/// `context.delta` → messages the AI has not seen for the session.
struct ContextDeltaHandler;

#[async_trait]
impl MessageHandler for ContextDeltaHandler {
    async fn handle(
        &self,
        data: Value,
        ctx: &InboundContext,
    ) -> Result<Option<Value>, HandlerError> {
        let session_id = session_param(&data, ctx)?;
        let messages = match data.get("messages") {
            Some(Value::Array(items)) => items.clone(),
            None | Some(Value::Null) => Vec::new(),
            Some(_) => return Err(HandlerError::Invalid("messages must be an array".into())),
        };
        let outcome = ctx.context.apply_message_delta(&session_id, messages);
        serde_json::to_value(&outcome)
            .map(Some)
            .map_err(|e| HandlerError::Internal(format!("serialize delta outcome: {e}")))
    }
}

/// `context.reset` → next delta is a full resend.
struct ContextResetHandler;

#[async_trait]
impl MessageHandler for ContextResetHandler {
    async fn handle(
        &self,
        data: Value,
        ctx: &InboundContext,
    ) -> Result<Option<Value>, HandlerError> {
        let session_id = session_param(&data, ctx)?;
        ctx.context.force_full_context(&session_id);
        Ok(Some(json!({ "session_id": session_id, "reset": true })))
    }
}

/// `session.info` → public session fields.
struct SessionInfoHandler;

#[async_trait]
impl MessageHandler for SessionInfoHandler {
    async fn handle(
        &self,
        data: Value,
        ctx: &InboundContext,
    ) -> Result<Option<Value>, HandlerError> {
        let session_id = session_param(&data, ctx)?;
        let info = ctx
            .context
            .get_session_info(&session_id)
            .ok_or_else(|| HandlerError::NotFound(format!("session not found: {session_id}")))?;
        serde_json::to_value(&info)
            .map(Some)
            .map_err(|e| HandlerError::Internal(format!("serialize session info: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tether_session::{ClientContext, DeltaEngine, SessionStore, TokenIssuer};

    struct EchoHandler;

    #[async_trait]
    impl MessageHandler for EchoHandler {
        async fn handle(
            &self,
            data: Value,
            _ctx: &InboundContext,
        ) -> Result<Option<Value>, HandlerError> {
            Ok(Some(data))
        }
    }

    struct QuietHandler;

    #[async_trait]
    impl MessageHandler for QuietHandler {
        async fn handle(
            &self,
            _data: Value,
            _ctx: &InboundContext,
        ) -> Result<Option<Value>, HandlerError> {
            Ok(None)
        }
    }

    struct FailHandler;

    #[async_trait]
    impl MessageHandler for FailHandler {
        async fn handle(
            &self,
            _data: Value,
            _ctx: &InboundContext,
        ) -> Result<Option<Value>, HandlerError> {
            Err(HandlerError::Internal("boom".into()))
        }
    }

    struct PanicHandler;

    #[async_trait]
    impl MessageHandler for PanicHandler {
        async fn handle(
            &self,
            _data: Value,
            _ctx: &InboundContext,
        ) -> Result<Option<Value>, HandlerError> {
            panic!("handler exploded");
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl MessageHandler for SlowHandler {
        async fn handle(
            &self,
            _data: Value,
            _ctx: &InboundContext,
        ) -> Result<Option<Value>, HandlerError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(None)
        }
    }

    fn make_ctx(session_id: Option<SessionId>) -> InboundContext {
        let store = Arc::new(SessionStore::new(30, Arc::new(TokenIssuer::random())));
        InboundContext {
            client_id: ClientId::from("c1"),
            connection_id: ConnectionId(1),
            session_id,
            context: ContextService::new(store, Arc::new(DeltaEngine::new())),
            registry: Arc::new(ConnectionRegistry::new(10)),
        }
    }

    fn registry() -> HandlerRegistry {
        let mut reg = HandlerRegistry::with_builtin(Duration::from_millis(200));
        reg.register("echo", EchoHandler);
        reg.register("quiet", QuietHandler);
        reg.register("fail", FailHandler);
        reg.register("panic", PanicHandler);
        reg.register("slow", SlowHandler);
        reg
    }

    async fn reply(reg: &HandlerRegistry, text: &str, ctx: &InboundContext) -> Value {
        match reg.dispatch(text, ctx).await {
            DispatchOutcome::Reply(v) => v,
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn success_reply_carries_request_id() {
        let ctx = make_ctx(None);
        let v = reply(
            &registry(),
            r#"{"type":"echo","data":{"x":1},"request_id":"r1"}"#,
            &ctx,
        )
        .await;
        assert_eq!(v["type"], "echo.result");
        assert_eq!(v["data"]["x"], 1);
        assert_eq!(v["request_id"], "r1");
    }

    #[tokio::test]
    async fn request_id_is_omitted_when_absent() {
        let ctx = make_ctx(None);
        let v = reply(&registry(), r#"{"type":"echo"}"#, &ctx).await;
        assert!(v.get("request_id").is_none());
        assert_eq!(v["data"], Value::Null);
    }

    #[tokio::test]
    async fn none_is_silent() {
        let ctx = make_ctx(None);
        assert_eq!(registry().dispatch(r#"{"type":"quiet"}"#, &ctx).await, DispatchOutcome::Silent);
    }

    #[tokio::test]
    async fn unknown_type_gets_error_envelope() {
        let ctx = make_ctx(None);
        let v = reply(&registry(), r#"{"type":"nope","request_id":7}"#, &ctx).await;
        assert_eq!(v["type"], "error");
        assert_eq!(v["data"]["code"], UNKNOWN_TYPE);
        assert_eq!(v["request_id"], 7);
    }

    #[tokio::test]
    async fn malformed_envelope_gets_error_envelope() {
        let ctx = make_ctx(None);
        for text in ["not json", r#"{"data":{}}"#, r#"{"type":5}"#] {
            let v = reply(&registry(), text, &ctx).await;
            assert_eq!(v["data"]["code"], INVALID_MESSAGE, "{text}");
        }
    }

    #[tokio::test]
    async fn internal_error_is_fatal() {
        let ctx = make_ctx(None);
        assert_matches!(
            registry().dispatch(r#"{"type":"fail"}"#, &ctx).await,
            DispatchOutcome::Fatal { kind, detail } => {
                assert_eq!(kind, "fail");
                assert_eq!(detail, "boom");
            }
        );
    }

    #[tokio::test]
    async fn panic_is_caught_and_fatal() {
        let ctx = make_ctx(None);
        assert_matches!(
            registry().dispatch(r#"{"type":"panic"}"#, &ctx).await,
            DispatchOutcome::Fatal { detail, .. } => assert!(detail.contains("handler exploded"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_fatal() {
        let ctx = make_ctx(None);
        assert_matches!(
            registry().dispatch(r#"{"type":"slow"}"#, &ctx).await,
            DispatchOutcome::Fatal { detail, .. } => assert!(detail.contains("timed out"))
        );
    }

    #[tokio::test]
    async fn ping_returns_server_time() {
        let ctx = make_ctx(None);
        let v = reply(&registry(), r#"{"type":"ping"}"#, &ctx).await;
        assert_eq!(v["type"], "ping.result");
        assert!(v["data"]["pong"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn context_delta_uses_handshake_session() {
        let ctx = make_ctx(None);
        let sid = ctx.context.store().create_session(ClientContext::default());
        let ctx = InboundContext {
            session_id: Some(sid),
            ..ctx
        };
        let reg = registry();
        let text = r#"{"type":"context.delta","data":{"messages":[
            {"timestamp":1640995200000},{"timestamp":1640995201000},{"timestamp":"junk"}]}}"#;

        let first = reply(&reg, text, &ctx).await;
        assert_eq!(first["data"]["full_context"], true);
        assert_eq!(first["data"]["messages"].as_array().unwrap().len(), 2);
        assert_eq!(first["data"]["dropped_invalid"], 1);
        assert_eq!(first["data"]["baseline"], 1_640_995_201_000_i64);

        let second = reply(&reg, text, &ctx).await;
        assert_eq!(second["data"]["full_context"], false);
        assert!(second["data"]["messages"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn context_reset_forces_full_resend() {
        let ctx = make_ctx(None);
        let sid = ctx.context.store().create_session(ClientContext::default());
        let reg = registry();
        let delta = json!({
            "type": "context.delta",
            "data": {"session_id": sid, "messages": [{"timestamp": 5}]},
        })
        .to_string();
        let _ = reply(&reg, &delta, &ctx).await;

        let reset = json!({"type": "context.reset", "data": {"session_id": sid}}).to_string();
        let v = reply(&reg, &reset, &ctx).await;
        assert_eq!(v["data"]["reset"], true);

        let again = reply(&reg, &delta, &ctx).await;
        assert_eq!(again["data"]["full_context"], true);
    }

    #[tokio::test]
    async fn context_delta_validates_params() {
        let ctx = make_ctx(None);
        let v = reply(
            &registry(),
            r#"{"type":"context.delta","data":{"messages":[]}}"#,
            &ctx,
        )
        .await;
        assert_eq!(v["data"]["code"], INVALID_PARAMS);

        let v = reply(
            &registry(),
            r#"{"type":"context.delta","data":{"session_id":"s","messages":{}}}"#,
            &ctx,
        )
        .await;
        assert_eq!(v["data"]["code"], INVALID_PARAMS);
    }

    #[tokio::test]
    async fn session_info_found_and_missing() {
        let ctx = make_ctx(None);
        let sid = ctx.context.store().create_session(ClientContext::default());
        let reg = registry();

        let found_req = json!({"type": "session.info", "data": {"session_id": sid}}).to_string();
        let found = reply(&reg, &found_req, &ctx).await;
        assert_eq!(found["type"], "session.info.result");
        assert_eq!(found["data"]["session_id"], sid.as_str());

        let missing_req = r#"{"type":"session.info","data":{"session_id":"sess_gone"}}"#;
        let missing = reply(&reg, missing_req, &ctx).await;
        assert_eq!(missing["type"], "error");
        assert_eq!(missing["data"]["code"], NOT_FOUND);
    }

    #[test]
    fn builtin_types_are_registered() {
        let reg = HandlerRegistry::with_builtin(DEFAULT_HANDLER_TIMEOUT);
        assert_eq!(reg.types(), vec!["context.delta", "context.reset", "ping", "session.info"]);
        assert!(reg.has_type("ping"));
        assert!(!reg.has_type("echo"));
    }
}
