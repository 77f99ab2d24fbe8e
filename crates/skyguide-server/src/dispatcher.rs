use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use skyguide_telemetry::MetricsRecorder;
use tracing::{debug, warn};

use crate::error::HandlerError;
use crate::registry::MethodRegistry;
use crate::rpc::{self, Incoming, RequestItem, RpcReply, RpcRequest, RpcResponse};
use crate::session::ClientSession;

/// Routes decoded requests to method handlers and builds the replies.
pub struct Dispatcher {
    methods: MethodRegistry,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl Dispatcher {
    pub fn new(methods: MethodRegistry) -> Self {
        Self {
            methods,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<MetricsRecorder>>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Handle one inbound frame. `None` means nothing is written back.
    pub fn handle_frame(&self, frame: &[u8], session: &ClientSession) -> Option<RpcReply> {
        let incoming = match rpc::parse_frame(frame) {
            Ok(incoming) => incoming,
            Err(e) => {
                debug!(client_id = %session.id(), error = %e, "unparseable request");
                self.count_error("parse_error");
                return Some(RpcReply::Single(RpcResponse::parse_error()));
            }
        };

        match incoming {
            Incoming::Single(item) => self.dispatch_item(item, session).map(RpcReply::Single),
            Incoming::Batch(items) => {
                let responses: Vec<RpcResponse> = items
                    .into_iter()
                    .filter_map(|item| self.dispatch_item(item, session))
                    .collect();
                (!responses.is_empty()).then_some(RpcReply::Batch(responses))
            }
        }
    }

    fn dispatch_item(&self, item: RequestItem, session: &ClientSession) -> Option<RpcResponse> {
        match item {
            Ok(request) => self.dispatch(request, session),
            Err(invalid) => {
                debug!(client_id = %session.id(), reason = %invalid.reason, "invalid request");
                self.count_error("invalid_request");
                Some(RpcResponse::invalid_request(
                    invalid.id.unwrap_or(Value::Null),
                    invalid.reason,
                ))
            }
        }
    }

    /// Run one request. Notifications run their handler but get no response.
    pub fn dispatch(&self, request: RpcRequest, session: &ClientSession) -> Option<RpcResponse> {
        let RpcRequest { method, params, id } = request;
        if let Some(m) = &self.metrics {
            m.counter_inc("rpc.requests_total", &[], 1);
        }

        let Some(handler) = self.methods.get(&method) else {
            debug!(client_id = %session.id(), method = %method, "method not found");
            self.count_error("method_not_found");
            return id.map(RpcResponse::method_not_found);
        };

        if let Some(id) = &id {
            session.begin_request(id);
            tracing::trace!(client_id = %session.id(), method = %method, in_flight = ?session.in_flight(), "request started");
        }
        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| handler(&params)));
        let elapsed_us = started.elapsed().as_micros() as f64;
        if let Some(id) = &id {
            session.end_request(id);
        }
        if let Some(m) = &self.metrics {
            m.histogram_observe("rpc.duration_us", &[("method", method.as_str())], elapsed_us);
        }

        let outcome = outcome.unwrap_or_else(|_| {
            warn!(client_id = %session.id(), method = %method, "handler panicked");
            Err(HandlerError::Internal("internal error".into()))
        });

        match outcome {
            Ok(result) => id.map(|id| RpcResponse::success(id, result)),
            Err(e) => {
                debug!(client_id = %session.id(), method = %method, error = %e, kind = e.kind(), "request failed");
                self.count_error(e.kind());
                id.map(|id| RpcResponse::error(id, e.code(), e.to_string()))
            }
        }
    }

    fn count_error(&self, kind: &str) {
        if let Some(m) = &self.metrics {
            m.counter_inc("rpc.errors_total", &[("kind", kind)], 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR};
    use serde_json::json;
    use skyguide_core::errors::GuideError;
    use skyguide_core::ids::ClientId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn session() -> ClientSession {
        let (tx, _rx) = mpsc::unbounded_channel();
        ClientSession::new(ClientId::from_raw(1), None, tx, CancellationToken::new())
    }

    fn dispatcher() -> (Dispatcher, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut methods = MethodRegistry::new();
        methods.register("get_connected", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!(true))
        });
        methods.register("set_exposure", |params| match params.get("exposure") {
            Some(_) => Ok(json!(0)),
            None => Err(HandlerError::invalid_params("expected exposure param")),
        });
        methods.register("guide", |_| Err(GuideError::NotCalibrated.into()));
        methods.register("explode", |_| panic!("boom"));
        (Dispatcher::new(methods), calls)
    }

    fn reply_json(reply: Option<RpcReply>) -> Value {
        serde_json::to_value(reply.expect("expected a reply")).unwrap()
    }

    #[test]
    fn success_echoes_id() {
        let (d, _) = dispatcher();
        let reply = d.handle_frame(br#"{"method":"get_connected","id":7}"#, &session());
        assert_eq!(reply_json(reply), json!({"result": true, "id": 7}));

        let reply = d.handle_frame(br#"{"method":"get_connected","id":0}"#, &session());
        assert_eq!(reply_json(reply), json!({"result": true, "id": 0}));

        let reply = d.handle_frame(br#"{"method":"get_connected","id":"abc"}"#, &session());
        assert_eq!(reply_json(reply), json!({"result": true, "id": "abc"}));
    }

    #[test]
    fn null_id_gets_response() {
        let (d, _) = dispatcher();
        let reply = d.handle_frame(br#"{"method":"get_connected","id":null}"#, &session());
        assert_eq!(reply_json(reply), json!({"result": true, "id": null}));
    }

    #[test]
    fn notification_runs_handler_silently() {
        let (d, calls) = dispatcher();
        let reply = d.handle_frame(br#"{"method":"get_connected"}"#, &session());
        assert!(reply.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_method() {
        let (d, _) = dispatcher();
        let json = reply_json(d.handle_frame(br#"{"method":"bogus_method","id":"q"}"#, &session()));
        assert_eq!(json["error"]["code"], METHOD_NOT_FOUND);
        assert_eq!(json["error"]["message"], "Method not found");
        assert_eq!(json["id"], "q");

        assert!(d
            .handle_frame(br#"{"method":"bogus_method"}"#, &session())
            .is_none());
    }

    #[test]
    fn parse_error_reply() {
        let (d, _) = dispatcher();
        let json = reply_json(d.handle_frame(b"{oops", &session()));
        assert_eq!(json["error"]["code"], PARSE_ERROR);
        assert_eq!(json["id"], Value::Null);
    }

    #[test]
    fn missing_method_is_invalid_request() {
        let (d, _) = dispatcher();
        let json = reply_json(d.handle_frame(br#"{"id":5}"#, &session()));
        assert_eq!(json["error"]["code"], INVALID_REQUEST);
        assert_eq!(json["id"], 5);
    }

    #[test]
    fn handler_errors_map_to_codes() {
        let (d, _) = dispatcher();
        let json = reply_json(d.handle_frame(
            br#"{"method":"set_exposure","params":{},"id":1}"#,
            &session(),
        ));
        assert_eq!(json["error"]["code"], INVALID_PARAMS);

        let json = reply_json(d.handle_frame(br#"{"method":"guide","id":2}"#, &session()));
        assert_eq!(json["error"]["code"], 1);
        assert_eq!(json["error"]["message"], "cannot guide: not calibrated");
    }

    #[test]
    fn panicking_handler_becomes_internal_error() {
        let (d, _) = dispatcher();
        let json = reply_json(d.handle_frame(br#"{"method":"explode","id":3}"#, &session()));
        assert_eq!(json["error"]["code"], crate::rpc::INTERNAL_ERROR);
        assert_eq!(json["id"], 3);
    }

    #[test]
    fn batch_with_mixed_elements() {
        let (d, calls) = dispatcher();
        let frame = br#"[
            {"method":"get_connected","id":1},
            {"method":"get_connected"},
            42,
            {"method":"bogus_method","id":2}
        ]"#;
        let json = reply_json(d.handle_frame(frame, &session()));
        let responses = json.as_array().unwrap();
        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0], json!({"result": true, "id": 1}));
        assert_eq!(responses[1]["error"]["code"], INVALID_REQUEST);
        assert_eq!(responses[2]["error"]["code"], METHOD_NOT_FOUND);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn batch_of_notifications_writes_nothing() {
        let (d, _) = dispatcher();
        let frame = br#"[{"method":"get_connected"},{"method":"get_connected"}]"#;
        assert!(d.handle_frame(frame, &session()).is_none());
    }

    #[test]
    fn empty_batch_is_one_invalid_request() {
        let (d, _) = dispatcher();
        let json = reply_json(d.handle_frame(b"[]", &session()));
        assert_eq!(json["error"]["code"], INVALID_REQUEST);
        assert!(json.is_object());
    }

    #[test]
    fn in_flight_cleared_after_dispatch() {
        let (d, _) = dispatcher();
        let s = session();
        d.handle_frame(br#"{"method":"get_connected","id":9}"#, &s);
        assert!(s.in_flight().is_empty());
    }

    #[test]
    fn metrics_are_recorded() {
        let (d, _) = dispatcher();
        let metrics = Arc::new(MetricsRecorder::new());
        let d = d.with_metrics(Some(Arc::clone(&metrics)));
        d.handle_frame(br#"{"method":"get_connected","id":1}"#, &session());
        d.handle_frame(br#"{"method":"nope","id":2}"#, &session());
        assert_eq!(metrics.counter_get("rpc.requests_total", &[]), 2);
        assert_eq!(
            metrics.counter_get("rpc.errors_total", &[("kind", "method_not_found")]),
            1
        );
    }

    #[test]
    fn error_metrics_are_labelled_by_failure_kind() {
        let (d, _) = dispatcher();
        let metrics = Arc::new(MetricsRecorder::new());
        let d = d.with_metrics(Some(Arc::clone(&metrics)));
        d.handle_frame(br#"{"method":"guide","id":1}"#, &session());
        d.handle_frame(br#"{"method":"set_exposure","params":{},"id":2}"#, &session());
        d.handle_frame(br#"{"method":"explode","id":3}"#, &session());

        for kind in ["not_calibrated", "invalid_params", "internal"] {
            assert_eq!(metrics.counter_get("rpc.errors_total", &[("kind", kind)]), 1, "{kind}");
        }
    }
}
