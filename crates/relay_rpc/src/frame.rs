//! JSON wire envelopes carried in WebSocket text frames.
//!
//! Three shapes travel over a session, distinguished by their fields:
//!
//! - request `{ "id": u64, "cmd": String, "data": Value }`: `id == 0` marks
//!   a fire-and-forget request that gets no response frame
//! - response `{ "id": u64, "ok": bool, "data": Value }`: `data` carries the
//!   error string when `ok` is false
//! - push `{ "push": Value }`: one-way, delivered to session push listeners

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request id reserved for fire-and-forget requests.
pub const NOTIFY_ID: u64 = 0;

/// One wire envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    /// Command invocation addressed at the peer's command table.
    Request {
        id: u64,
        cmd: String,
        #[serde(default)]
        data: Value,
    },
    /// Answer to a request, matched back by id.
    Response {
        id: u64,
        ok: bool,
        #[serde(default)]
        data: Value,
    },
    /// One-way message outside the request/response flow.
    Push { push: Value },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_round_trips() {
        let text = r#"{"id":3,"cmd":"hello","data":{"who":"peer"}}"#;
        let frame: Frame = serde_json::from_str(text).unwrap();
        match frame {
            Frame::Request { id, ref cmd, ref data } => {
                assert_eq!(id, 3);
                assert_eq!(cmd, "hello");
                assert_eq!(data["who"], "peer");
            }
            other => panic!("parsed wrong variant: {other:?}"),
        }
    }

    #[test]
    fn response_is_not_mistaken_for_request() {
        let text = r#"{"id":3,"ok":false,"data":"no such module"}"#;
        let frame: Frame = serde_json::from_str(text).unwrap();
        assert!(matches!(frame, Frame::Response { ok: false, .. }));
    }

    #[test]
    fn push_parses() {
        let frame: Frame = serde_json::from_str(r#"{"push":{"level":"info"}}"#).unwrap();
        match frame {
            Frame::Push { push } => assert_eq!(push["level"], "info"),
            other => panic!("parsed wrong variant: {other:?}"),
        }
    }

    #[test]
    fn missing_data_defaults_to_null() {
        let frame: Frame = serde_json::from_str(r#"{"id":1,"cmd":"hello"}"#).unwrap();
        match frame {
            Frame::Request { data, .. } => assert_eq!(data, json!(null)),
            other => panic!("parsed wrong variant: {other:?}"),
        }
    }
}
