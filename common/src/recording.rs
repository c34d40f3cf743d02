//! The persisted session artifact and the typed views over its entries.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One captured session.
///
/// Event streams and API responses are kept as opaque JSON so a loaded
/// artifact serializes back unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recording {
    #[serde(default)]
    pub initial_state: Value,
    #[serde(default)]
    pub dispatches: Vec<Value>,
    #[serde(default)]
    pub key_presses: Vec<Value>,
    /// Serialized [`XhrResponse`] entries in request-completion order.
    #[serde(default)]
    pub xhr_responses: Vec<Value>,
    #[serde(default)]
    pub ws_responses: Vec<Value>,
    #[serde(default)]
    pub sse_responses: Vec<Value>,
    #[serde(default)]
    pub images: BTreeMap<String, ImageData>,
    #[serde(default)]
    pub impurities: Value,
}

impl Recording {
    /// Fresh accumulator for a capture starting from `initial_state`.
    pub fn new(initial_state: Value) -> Self {
        Recording {
            initial_state,
            ..Default::default()
        }
    }

    /// The subtrees scanned for image references.  Key presses carry raw
    /// input codes only and are not part of the scan.
    pub fn scanned_trees(&self) -> impl Iterator<Item = &Value> {
        std::iter::once(&self.initial_state)
            .chain(self.dispatches.iter())
            .chain(self.xhr_responses.iter())
            .chain(self.ws_responses.iter())
            .chain(self.sse_responses.iter())
    }

    pub fn scanned_trees_mut(&mut self) -> impl Iterator<Item = &mut Value> {
        std::iter::once(&mut self.initial_state)
            .chain(self.dispatches.iter_mut())
            .chain(self.xhr_responses.iter_mut())
            .chain(self.ws_responses.iter_mut())
            .chain(self.sse_responses.iter_mut())
    }

    /// Append an incoming event envelope to the stream it belongs to.
    pub fn ingest(&mut self, event: Value) -> Option<EventKind> {
        let kind = classify(&event)?;
        match kind {
            EventKind::Dispatch => self.dispatches.push(event),
            EventKind::KeyPress => self.key_presses.push(event),
        }
        Some(kind)
    }

    /// The event queue a replay walks through.
    pub fn replay_queue(&self, raw_session: bool) -> &[Value] {
        if raw_session {
            &self.key_presses
        } else {
            &self.dispatches
        }
    }
}

/// Catalog entry for an image reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageData {
    /// Referenced but not fetched yet (`true` on disk).
    Pending(bool),
    /// `data:image/<type>;base64,<payload>`
    Inline(String),
}

impl ImageData {
    pub fn pending() -> Self {
        ImageData::Pending(true)
    }

    pub fn data_uri(&self) -> Option<&str> {
        match self {
            ImageData::Inline(uri) => Some(uri),
            ImageData::Pending(_) => None,
        }
    }
}

/// The stream an incoming envelope is appended to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Dispatch,
    KeyPress,
}

/// Classify an opaque event envelope.
///
/// Anything with a `type` is an event; it is a key press when it carries a
/// `payload.code`, a dispatch otherwise.  Other shapes return `None`.
pub fn classify(event: &Value) -> Option<EventKind> {
    fn present(value: Option<&Value>) -> bool {
        value.is_some_and(|v| !v.is_null())
    }

    if !present(event.get("type")) {
        return None;
    }
    let code = event.get("payload").and_then(|payload| payload.get("code"));
    if present(code) {
        Some(EventKind::KeyPress)
    } else {
        Some(EventKind::Dispatch)
    }
}

// ── API responses ────────────────────────────────────────────────────────

/// Header snapshot: lower-case header name → value(s).
pub type HeaderSnapshot = BTreeMap<String, HeaderValues>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValues {
    One(String),
    Many(Vec<String>),
}

impl HeaderValues {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let values: &[String] = match self {
            HeaderValues::One(v) => std::slice::from_ref(v),
            HeaderValues::Many(vs) => vs,
        };
        values.iter().map(String::as_str)
    }

    /// Add one more value for the same header name.
    pub fn push(&mut self, value: String) {
        match self {
            HeaderValues::One(first) => {
                *self = HeaderValues::Many(vec![std::mem::take(first), value]);
            }
            HeaderValues::Many(values) => values.push(value),
        }
    }
}

/// Status line and headers as emitted by the API server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseHead {
    pub status_code: u16,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub headers: HeaderSnapshot,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMeta {
    /// Completion time, Unix milliseconds.
    pub timestamp: i64,
}

/// One completed API exchange as seen by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct XhrResponse {
    pub headers: ResponseHead,
    #[serde(default)]
    pub body: Value,
    /// Headers actually sent to the client when the response finished.
    #[serde(default)]
    pub get_headers: HeaderSnapshot,
    #[serde(rename = "__META__", alias = "meta", default)]
    pub meta: ResponseMeta,
}

impl XhrResponse {
    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_key_press() {
        let event = json!({"type": "X", "payload": {"code": "ArrowUp"}});
        assert_eq!(classify(&event), Some(EventKind::KeyPress));
    }

    #[test]
    fn test_classify_dispatch() {
        assert_eq!(
            classify(&json!({"type": "X", "payload": {"value": 1}})),
            Some(EventKind::Dispatch)
        );
        assert_eq!(classify(&json!({"type": "X"})), Some(EventKind::Dispatch));
        assert_eq!(
            classify(&json!({"type": "X", "payload": {"code": null}})),
            Some(EventKind::Dispatch)
        );
        assert_eq!(
            classify(&json!({"type": "X", "payload": 3})),
            Some(EventKind::Dispatch)
        );
    }

    #[test]
    fn test_classify_drops_other_shapes() {
        assert_eq!(classify(&json!({"payload": {"code": "KeyA"}})), None);
        assert_eq!(classify(&json!({"type": null})), None);
        assert_eq!(classify(&json!([1, 2])), None);
        assert_eq!(classify(&json!("INC")), None);
    }

    #[test]
    fn test_ingest_preserves_append_order() {
        let mut rec = Recording::new(json!({"score": 0}));
        rec.ingest(json!({"type": "A"}));
        rec.ingest(json!({"type": "K", "payload": {"code": "KeyW"}}));
        rec.ingest(json!({"type": "B"}));
        rec.ingest(json!({"junk": true}));

        assert_eq!(rec.dispatches, vec![json!({"type": "A"}), json!({"type": "B"})]);
        assert_eq!(rec.key_presses.len(), 1);
        assert_eq!(rec.replay_queue(true), rec.key_presses.as_slice());
    }

    #[test]
    fn test_recording_field_names() {
        let mut rec = Recording::new(json!({}));
        rec.images.insert("/a.png".into(), ImageData::pending());
        let value = serde_json::to_value(&rec).unwrap();
        for key in [
            "initialState",
            "dispatches",
            "keyPresses",
            "xhrResponses",
            "wsResponses",
            "sseResponses",
            "images",
            "impurities",
        ] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert_eq!(value["images"]["/a.png"], json!(true));
    }

    #[test]
    fn test_reserved_streams_round_trip() {
        let text = r#"{"initialState":1,"wsResponses":[{"a":[1,"x"]}],"sseResponses":["raw"]}"#;
        let rec: Recording = serde_json::from_str(text).unwrap();
        let again: Recording =
            serde_json::from_str(&serde_json::to_string(&rec).unwrap()).unwrap();
        assert_eq!(again.ws_responses, vec![json!({"a": [1, "x"]})]);
        assert_eq!(again.sse_responses, vec![json!("raw")]);
    }

    #[test]
    fn test_xhr_response_wire_shape() {
        let value = json!({
            "headers": {
                "statusCode": 200,
                "statusMessage": "OK",
                "headers": {"content-type": "application/json", "set-cookie": ["a=1", "b=2"]}
            },
            "body": {"rows": ["#"]},
            "getHeaders": {"content-type": "application/json"},
            "__META__": {"timestamp": 1500000000000i64}
        });
        let xhr = XhrResponse::from_value(value.clone()).unwrap();
        assert_eq!(xhr.headers.status_code, 200);
        assert_eq!(
            xhr.headers.headers["set-cookie"].iter().collect::<Vec<_>>(),
            vec!["a=1", "b=2"]
        );
        assert_eq!(xhr.to_value().unwrap(), value);
    }

    #[test]
    fn test_xhr_response_accepts_meta_alias() {
        let value = json!({
            "headers": {"statusCode": 404},
            "meta": {"timestamp": 7}
        });
        let xhr = XhrResponse::from_value(value).unwrap();
        assert_eq!(xhr.meta.timestamp, 7);
        assert_eq!(xhr.body, Value::Null);
        // Always written back under the artifact key.
        let written = xhr.to_value().unwrap();
        assert_eq!(written["__META__"], json!({"timestamp": 7}));
        assert!(written.get("meta").is_none());
    }

    #[test]
    fn test_header_values_push() {
        let mut values = HeaderValues::One("a".into());
        values.push("b".into());
        assert_eq!(values, HeaderValues::Many(vec!["a".into(), "b".into()]));
    }
}
