//! Wire frames exchanged with the service and the push-channel vocabulary.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::trace;

use crate::error::XapiError;

const RESERVED_KEYS: [&str; 4] = ["command", "arguments", "streamSessionId", "customTag"];

/// Outbound frame.
///
/// Command frames carry their arguments under `arguments`; streaming
/// subscribe/stop frames put instance keys and extra arguments at the top
/// level through `fields`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutboundFrame {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_tag: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl OutboundFrame {
    pub fn command(command: impl Into<String>, arguments: Option<Value>) -> Self {
        Self {
            command: command.into(),
            arguments,
            stream_session_id: None,
            custom_tag: None,
            fields: Map::new(),
        }
    }

    /// Streaming frame. Entries of `fields` named like one of the frame's own
    /// keys are dropped so the serialized object never repeats a key.
    pub fn streaming(
        command: impl Into<String>,
        stream_session_id: impl Into<String>,
        mut fields: Map<String, Value>,
    ) -> Self {
        for reserved in RESERVED_KEYS {
            if fields.remove(reserved).is_some() {
                trace!(event = "reserved_field_dropped", field = reserved);
            }
        }
        Self {
            command: command.into(),
            arguments: None,
            stream_session_id: Some(stream_session_id.into()),
            custom_tag: None,
            fields,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.custom_tag = Some(tag.into());
        self
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Any inbound frame, before it is classified by the demultiplexer.
///
/// Replies carry `status` and `customTag`; pushes carry `command` and `data`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InboundFrame {
    #[serde(default)]
    pub status: Option<bool>,
    #[serde(default)]
    pub return_data: Option<Value>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_descr: Option<String>,
    #[serde(default)]
    pub custom_tag: Option<String>,
    #[serde(default)]
    pub stream_session_id: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl InboundFrame {
    /// Parses one text frame. Anything that is not a JSON object is a
    /// protocol error.
    pub fn from_text(text: &str) -> Result<Self, XapiError> {
        serde_json::from_str(text)
            .map_err(|err| XapiError::Protocol(format!("malformed inbound frame: {err}")))
    }

    /// Splits the frame into its reply part, if it has one.
    pub fn reply(&self) -> Option<Reply> {
        let status = self.status?;
        Some(Reply {
            status,
            return_data: self.return_data.clone(),
            error_code: self.error_code.clone(),
            error_descr: self.error_descr.clone(),
            stream_session_id: self.stream_session_id.clone(),
        })
    }

    /// Splits the frame into its push part, if it has one.
    pub fn push(self) -> Option<PushMessage> {
        let command = self.command?;
        Some(PushMessage {
            command,
            data: self.data.unwrap_or(Value::Null),
        })
    }
}

/// Correlated reply payload, carried through unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: bool,
    pub return_data: Option<Value>,
    pub error_code: Option<String>,
    pub error_descr: Option<String>,
    /// Present on login replies.
    pub stream_session_id: Option<String>,
}

impl Reply {
    /// Maps `status: false` to [`XapiError::Remote`] with the service's own
    /// description, and `status: true` to the `returnData` payload.
    pub fn into_result(self) -> Result<Value, XapiError> {
        if self.status {
            return Ok(self.return_data.unwrap_or(Value::Null));
        }
        Err(XapiError::Remote {
            code: self.error_code.unwrap_or_default(),
            description: self.error_descr.unwrap_or_default(),
        })
    }
}

/// Push message received on a streaming session.
#[derive(Debug, Clone, PartialEq)]
pub struct PushMessage {
    pub command: String,
    pub data: Value,
}

/// Push channel families offered by the streaming endpoint.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum StreamChannel {
    Balance,
    Candles,
    KeepAlive,
    News,
    Profits,
    TickPrices,
    Trades,
    TradeStatus,
}

impl StreamChannel {
    pub const ALL: [StreamChannel; 8] = [
        Self::Balance,
        Self::Candles,
        Self::KeepAlive,
        Self::News,
        Self::Profits,
        Self::TickPrices,
        Self::Trades,
        Self::TradeStatus,
    ];

    pub fn subscribe_command(self) -> &'static str {
        match self {
            Self::Balance => "getBalance",
            Self::Candles => "getCandles",
            Self::KeepAlive => "getKeepAlive",
            Self::News => "getNews",
            Self::Profits => "getProfits",
            Self::TickPrices => "getTickPrices",
            Self::Trades => "getTrades",
            Self::TradeStatus => "getTradeStatus",
        }
    }

    pub fn stop_command(self) -> &'static str {
        match self {
            Self::Balance => "stopBalance",
            Self::Candles => "stopCandles",
            Self::KeepAlive => "stopKeepAlive",
            Self::News => "stopNews",
            Self::Profits => "stopProfits",
            Self::TickPrices => "stopTickPrices",
            Self::Trades => "stopTrades",
            Self::TradeStatus => "stopTradeStatus",
        }
    }

    /// `command` value of the pushes this channel produces.
    pub fn push_command(self) -> &'static str {
        match self {
            Self::Balance => "balance",
            Self::Candles => "candle",
            Self::KeepAlive => "keepAlive",
            Self::News => "news",
            Self::Profits => "profit",
            Self::TickPrices => "tickPrices",
            Self::Trades => "trade",
            Self::TradeStatus => "tradeStatus",
        }
    }

    /// Event name surfaced to listeners.
    pub fn event_name(self) -> &'static str {
        match self {
            Self::Balance => "balance",
            Self::Candles => "candle",
            Self::KeepAlive => "keepAliveFromServer",
            Self::News => "news",
            Self::Profits => "profits",
            Self::TickPrices => "tickPrices",
            Self::Trades => "trade",
            Self::TradeStatus => "tradeStatus",
        }
    }

    pub fn from_push_command(command: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|channel| channel.push_command() == command)
    }

    /// Whether instances of this channel are keyed by `symbol`.
    pub fn keyed_by_symbol(self) -> bool {
        matches!(self, Self::TickPrices | Self::Candles)
    }
}

impl fmt::Display for StreamChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_name())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::{InboundFrame, OutboundFrame, StreamChannel};
    use crate::error::XapiError;

    #[test]
    fn command_frame_omits_absent_fields() {
        let frame = OutboundFrame::command("getServerTime", None).with_tag("7");
        let value: Value = serde_json::from_str(&frame.to_text().expect("encode")).expect("json");
        assert_eq!(value, json!({"command": "getServerTime", "customTag": "7"}));
    }

    #[test]
    fn streaming_frame_flattens_fields_beside_session_id() {
        let mut fields = Map::new();
        fields.insert("symbol".to_string(), json!("EURUSD"));
        fields.insert("minArrivalTime".to_string(), json!(5000));
        let frame = OutboundFrame::streaming("getTickPrices", "sid-1", fields);

        let value: Value = serde_json::from_str(&frame.to_text().expect("encode")).expect("json");
        assert_eq!(
            value,
            json!({
                "command": "getTickPrices",
                "streamSessionId": "sid-1",
                "symbol": "EURUSD",
                "minArrivalTime": 5000
            })
        );
    }

    #[test]
    fn streaming_frame_drops_fields_that_shadow_frame_keys() {
        let mut fields = Map::new();
        fields.insert("command".to_string(), json!("stopBalance"));
        fields.insert("streamSessionId".to_string(), json!("other"));
        fields.insert("symbol".to_string(), json!("EURUSD"));
        let frame = OutboundFrame::streaming("getCandles", "sid-1", fields);

        let text = frame.to_text().expect("encode");
        assert_eq!(text.matches("\"command\"").count(), 1);
        assert_eq!(text.matches("\"streamSessionId\"").count(), 1);
        let value: Value = serde_json::from_str(&text).expect("json");
        assert_eq!(
            value,
            json!({"command": "getCandles", "streamSessionId": "sid-1", "symbol": "EURUSD"})
        );
    }

    #[test]
    fn reply_frame_exposes_reply_and_no_push() {
        let frame = InboundFrame::from_text(
            r#"{"status":true,"returnData":{"time":1700000000000},"customTag":"3"}"#,
        )
        .expect("parse");
        assert_eq!(frame.custom_tag.as_deref(), Some("3"));
        let reply = frame.reply().expect("reply");
        assert_eq!(
            reply.into_result().expect("ok"),
            json!({"time": 1700000000000_i64})
        );
        assert!(frame.push().is_none());
    }

    #[test]
    fn failed_reply_passes_remote_description_through() {
        let frame = InboundFrame::from_text(
            r#"{"status":false,"errorCode":"BE005","errorDescr":"userPasswordCheck: Invalid login or password","customTag":"1"}"#,
        )
        .expect("parse");
        match frame.reply().expect("reply").into_result() {
            Err(XapiError::Remote { code, description }) => {
                assert_eq!(code, "BE005");
                assert_eq!(description, "userPasswordCheck: Invalid login or password");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn push_frame_exposes_command_and_data() {
        let frame = InboundFrame::from_text(
            r#"{"command":"tickPrices","data":{"symbol":"EURUSD","ask":1.1}}"#,
        )
        .expect("parse");
        assert!(frame.reply().is_none());
        let push = frame.push().expect("push");
        assert_eq!(push.command, "tickPrices");
        assert_eq!(push.data["symbol"], "EURUSD");
    }

    #[test]
    fn non_object_frame_is_protocol_error() {
        assert!(matches!(
            InboundFrame::from_text("[1,2,3]"),
            Err(XapiError::Protocol(_))
        ));
        assert!(matches!(
            InboundFrame::from_text("not json"),
            Err(XapiError::Protocol(_))
        ));
    }

    #[test]
    fn push_commands_map_back_to_channels() {
        for channel in StreamChannel::ALL {
            assert_eq!(
                StreamChannel::from_push_command(channel.push_command()),
                Some(channel)
            );
        }
        assert_eq!(StreamChannel::from_push_command("getTickPrices"), None);
        assert_eq!(StreamChannel::KeepAlive.event_name(), "keepAliveFromServer");
        assert_eq!(StreamChannel::Profits.push_command(), "profit");
    }
}
