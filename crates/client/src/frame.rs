//! Wire frames
//!
//! Inbound frames come in three shapes that share no tag field, so they are
//! told apart by which fields are present: a non-empty `event` makes an
//! event, a non-empty `id` together with a non-empty `op` makes a command
//! reply, and anything else with `arg.channel` and `data` is a data push.
//! The checks run in that order and exactly once per frame.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::ClientError;

pub const EVENT_SUBSCRIBE: &str = "subscribe";
pub const EVENT_UNSUBSCRIBE: &str = "unsubscribe";
pub const EVENT_LOGIN: &str = "login";
pub const EVENT_ERROR: &str = "error";
pub const EVENT_NOTICE: &str = "notice";

/// Event code announcing a server upgrade; the connection must be replaced.
pub const UPGRADE_NOTICE_CODE: &str = "64008";

/// Accept `"0"`, `0` or `null` for fields the server sends in either form.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(D::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

/// Topic descriptor used in subscribe/unsubscribe args and echoed in pushes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Arg {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inst_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inst_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inst_family: Option<String>,
    #[serde(default, rename = "uly", skip_serializing_if = "Option::is_none")]
    pub underlying: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ccy: Option<String>,
}

impl Arg {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            ..Self::default()
        }
    }

    pub fn with_inst_id(mut self, inst_id: impl Into<String>) -> Self {
        self.inst_id = Some(inst_id.into());
        self
    }

    pub fn with_inst_type(mut self, inst_type: impl Into<String>) -> Self {
        self.inst_type = Some(inst_type.into());
        self
    }

    pub fn with_inst_family(mut self, inst_family: impl Into<String>) -> Self {
        self.inst_family = Some(inst_family.into());
        self
    }

    pub fn with_underlying(mut self, underlying: impl Into<String>) -> Self {
        self.underlying = Some(underlying.into());
        self
    }

    pub fn with_ccy(mut self, ccy: impl Into<String>) -> Self {
        self.ccy = Some(ccy.into());
        self
    }

    /// Subscription key: every scoping field, `|`-joined, empty when unset.
    pub fn key(&self) -> String {
        let field = |v: &Option<String>| v.clone().unwrap_or_default();
        [
            self.channel.clone(),
            field(&self.inst_id),
            field(&self.inst_type),
            field(&self.inst_family),
            field(&self.underlying),
            field(&self.ccy),
        ]
        .join("|")
    }
}

/// `{id?, event, code?, msg?, arg?, connId?}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFrame {
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: String,
    pub event: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub code: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub arg: Option<Arg>,
    #[serde(default)]
    pub conn_id: String,
}

impl EventFrame {
    pub fn is_upgrade_notice(&self) -> bool {
        self.event == EVENT_NOTICE && self.code == UPGRADE_NOTICE_CODE
    }
}

/// `{id, op, code, msg, data, inTime?, outTime?}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpReply {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub op: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub code: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub in_time: String,
    #[serde(default)]
    pub out_time: String,
}

impl OpReply {
    pub fn is_success(&self) -> bool {
        self.code == "0"
    }
}

/// `{arg: {channel, ...}, action?, data: [...]}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PushFrame {
    pub arg: Arg,
    #[serde(default)]
    pub action: Option<String>,
    pub data: Value,
}

impl PushFrame {
    /// Decode the `data` array into typed payloads.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Vec<T>, serde_json::Error> {
        Vec::<T>::deserialize(&self.data)
    }
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(EventFrame),
    OpReply(OpReply),
    Push(PushFrame),
}

fn present(value: Option<&Value>) -> bool {
    match value {
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Number(_)) => true,
        _ => false,
    }
}

impl Frame {
    /// Parse and classify one text frame.
    pub fn parse(text: &str) -> Result<Self, ClientError> {
        let value: Value = serde_json::from_str(text)?;
        let object = value
            .as_object()
            .ok_or_else(|| ClientError::Malformed("frame is not a JSON object".to_string()))?;

        if present(object.get("event")) {
            return Ok(Frame::Event(serde_json::from_value(value)?));
        }

        if present(object.get("id")) && present(object.get("op")) {
            return Ok(Frame::OpReply(serde_json::from_value(value)?));
        }

        let has_channel = present(object.get("arg").and_then(|arg| arg.get("channel")));
        if has_channel && object.contains_key("data") {
            return Ok(Frame::Push(serde_json::from_value(value)?));
        }

        Err(ClientError::Malformed(format!(
            "unrecognised frame shape: {}",
            truncate(text, 200)
        )))
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Outbound command `{id, op, args}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub op: String,
    pub args: Vec<Value>,
}

impl Command {
    pub fn subscribe(id: impl Into<String>, args: &[Arg]) -> Result<Self, ClientError> {
        Self::topics(id, EVENT_SUBSCRIBE, args)
    }

    pub fn unsubscribe(id: impl Into<String>, args: &[Arg]) -> Result<Self, ClientError> {
        Self::topics(id, EVENT_UNSUBSCRIBE, args)
    }

    fn topics(id: impl Into<String>, op: &str, args: &[Arg]) -> Result<Self, ClientError> {
        let args = args
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            id: id.into(),
            op: op.to_string(),
            args,
        })
    }

    pub fn op(id: impl Into<String>, op: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            id: id.into(),
            op: op.into(),
            args,
        }
    }

    pub fn to_text(&self) -> Result<String, ClientError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUBSCRIBE_ACK: &str = r#"{"id":"1512","event":"subscribe","arg":{"channel":"books","instId":"BTC-USDT"},"connId":"a4d3ae55"}"#;
    const ERROR_EVENT: &str = r#"{"id":"1512","event":"error","code":"60012","msg":"Invalid request: {\"op\": \"subscribe\"}","connId":"a4d3ae55"}"#;
    const NOTICE: &str = r#"{"event":"notice","code":"64008","msg":"The connection will soon be closed for a service upgrade.","connId":"a4d3ae55"}"#;
    const OP_REPLY: &str = r#"{"id":"1512","op":"order","data":[{"clOrdId":"","ordId":"12345689","tag":"","ts":"1695190491421","sCode":"0","sMsg":""}],"code":"0","msg":"","inTime":"1695190491421339","outTime":"1695190491423240"}"#;
    const BOOK_PUSH: &str = r#"{"arg":{"channel":"books","instId":"BTC-USDT"},"action":"snapshot","data":[{"asks":[["8476.98","415","0","13"]],"bids":[["8476.97","256","0","12"]],"ts":"1597026383085","checksum":-855196043,"prevSeqId":-1,"seqId":123456}]}"#;

    #[test]
    fn test_classify_event() {
        match Frame::parse(SUBSCRIBE_ACK).unwrap() {
            Frame::Event(event) => {
                assert_eq!(event.id, "1512");
                assert_eq!(event.event, "subscribe");
                assert_eq!(event.conn_id, "a4d3ae55");
                let arg = event.arg.expect("arg");
                assert_eq!(arg.channel, "books");
                assert_eq!(arg.inst_id.as_deref(), Some("BTC-USDT"));
            }
            other => panic!("expected Event, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_error_and_notice() {
        match Frame::parse(ERROR_EVENT).unwrap() {
            Frame::Event(event) => {
                assert_eq!(event.event, "error");
                assert_eq!(event.code, "60012");
                assert!(!event.is_upgrade_notice());
            }
            other => panic!("expected Event, got {:?}", other),
        }
        match Frame::parse(NOTICE).unwrap() {
            Frame::Event(event) => assert!(event.is_upgrade_notice()),
            other => panic!("expected Event, got {:?}", other),
        }
    }

    #[test]
    fn test_numeric_code_is_accepted() {
        let frame = Frame::parse(r#"{"event":"error","code":60012,"msg":"bad"}"#).unwrap();
        match frame {
            Frame::Event(event) => assert_eq!(event.code, "60012"),
            other => panic!("expected Event, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_op_reply() {
        match Frame::parse(OP_REPLY).unwrap() {
            Frame::OpReply(reply) => {
                assert_eq!(reply.id, "1512");
                assert_eq!(reply.op, "order");
                assert!(reply.is_success());
                assert_eq!(reply.data[0]["ordId"], "12345689");
                assert_eq!(reply.in_time, "1695190491421339");
            }
            other => panic!("expected OpReply, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_push() {
        match Frame::parse(BOOK_PUSH).unwrap() {
            Frame::Push(push) => {
                assert_eq!(push.arg.channel, "books");
                assert_eq!(push.action.as_deref(), Some("snapshot"));
                let books: Vec<pushfeed_book::BookData> = push.decode().unwrap();
                assert_eq!(books.len(), 1);
                assert_eq!(books[0].seq_id, 123456);
                assert_eq!(books[0].checksum, Some(-855196043));
            }
            other => panic!("expected Push, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_id_and_op_fall_through_to_push() {
        let text = r#"{"id":"","op":"","arg":{"channel":"tickers","instId":"BTC-USDT"},"data":[]}"#;
        assert!(matches!(Frame::parse(text).unwrap(), Frame::Push(_)));
    }

    #[test]
    fn test_event_wins_over_op_fields() {
        let text = r#"{"id":"7","op":"order","event":"error","code":"1","msg":"x"}"#;
        assert!(matches!(Frame::parse(text).unwrap(), Frame::Event(_)));
    }

    #[test]
    fn test_unrecognised_shapes_are_malformed() {
        assert!(matches!(
            Frame::parse(r#"{"arg":{"channel":"books"}}"#),
            Err(ClientError::Malformed(_))
        ));
        assert!(matches!(
            Frame::parse(r#"{"data":[]}"#),
            Err(ClientError::Malformed(_))
        ));
        assert!(matches!(Frame::parse("[1,2]"), Err(ClientError::Malformed(_))));
        assert!(matches!(Frame::parse("not json"), Err(ClientError::Json(_))));
    }

    #[test]
    fn test_arg_key_distinguishes_scope() {
        let a = Arg::new("books").with_inst_id("BTC-USDT");
        let b = Arg::new("books").with_inst_id("ETH-USDT");
        let c = Arg::new("positions").with_inst_type("SWAP").with_inst_family("BTC-USD");
        assert_eq!(a.key(), "books|BTC-USDT||||");
        assert_ne!(a.key(), b.key());
        assert_eq!(c.key(), "positions||SWAP|BTC-USD||");
    }

    #[test]
    fn test_command_serialization() {
        let args = vec![
            Arg::new("books").with_inst_id("BTC-USDT"),
            Arg::new("account").with_ccy("BTC"),
        ];
        let cmd = Command::subscribe("3", &args).unwrap();
        assert_eq!(
            cmd.to_text().unwrap(),
            r#"{"id":"3","op":"subscribe","args":[{"channel":"books","instId":"BTC-USDT"},{"channel":"account","ccy":"BTC"}]}"#
        );

        let anonymous = Command::op("", "login", vec![serde_json::json!({"apiKey": "k"})]);
        assert_eq!(
            anonymous.to_text().unwrap(),
            r#"{"op":"login","args":[{"apiKey":"k"}]}"#
        );
    }
}
