//! JSON framing for the browser message stream.
//!
//! Wire format: one WebSocket text frame per `{"t": .., "p": ..}` envelope.

use crate::error::{GatewayError, GatewayResult};
use crate::messages::*;

/// Decode a client text frame into a typed message.
pub fn decode_client(text: &str) -> GatewayResult<ClientMessage> {
    let envelope: Envelope = serde_json::from_str(text)?;
    match envelope.t.as_str() {
        CLIENT_CONNECT => Ok(ClientMessage::Connect(serde_json::from_str(&envelope.p)?)),
        CLIENT_DATA => Ok(ClientMessage::Data(envelope.p)),
        CLIENT_RESIZE => Ok(ClientMessage::Resize(serde_json::from_str(&envelope.p)?)),
        CLIENT_SUSPEND => Ok(ClientMessage::Suspend { token: envelope.p }),
        CLIENT_DISCONNECT => Ok(ClientMessage::Disconnect { token: envelope.p }),
        other => Err(GatewayError::Unsupported(other.to_string())),
    }
}

/// Encode a gateway message as a text frame.
pub fn encode_server(msg: &ServerMessage) -> String {
    let envelope = match msg {
        ServerMessage::Output(text) => Envelope {
            t: SERVER_OUTPUT.into(),
            p: text.clone(),
        },
        ServerMessage::Geometry(rc) => Envelope {
            t: SERVER_GEOMETRY.into(),
            // RowsCols has no map keys or floats, serialization cannot fail
            p: serde_json::to_string(rc).unwrap_or_default(),
        },
        ServerMessage::Participants(text) => Envelope {
            t: SERVER_PARTICIPANTS.into(),
            p: text.clone(),
        },
    };
    serde_json::to_string(&envelope).unwrap_or_default()
}

/// Encode a client message; used by tests and tooling that play the browser.
pub fn encode_client(msg: &ClientMessage) -> GatewayResult<String> {
    let envelope = match msg {
        ClientMessage::Connect(trc) => Envelope {
            t: CLIENT_CONNECT.into(),
            p: serde_json::to_string(trc)?,
        },
        ClientMessage::Data(d) => Envelope {
            t: CLIENT_DATA.into(),
            p: d.clone(),
        },
        ClientMessage::Resize(rc) => Envelope {
            t: CLIENT_RESIZE.into(),
            p: serde_json::to_string(rc)?,
        },
        ClientMessage::Suspend { token } => Envelope {
            t: CLIENT_SUSPEND.into(),
            p: token.clone(),
        },
        ClientMessage::Disconnect { token } => Envelope {
            t: CLIENT_DISCONNECT.into(),
            p: token.clone(),
        },
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Incremental UTF-8 decoder that carries incomplete trailing sequences over
/// to the next chunk instead of mangling them.
#[derive(Debug, Default)]
pub struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `chunk`, prefixed with any bytes held back last time.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, tail) = rest.split_at(e.valid_up_to());
                    // valid_up_to guarantees this prefix is UTF-8
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[bad..];
                        }
                        None => {
                            rest = tail;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        out
    }

    /// Bytes currently held back.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_connect() {
        let text = r#"{"t":"connect","p":"{\"token\":\"abc\",\"rows\":24,\"cols\":80}"}"#;
        let msg = decode_client(text).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Connect(TokenRowsCols {
                token: "abc".into(),
                rows: 24,
                cols: 80
            })
        );
    }

    #[test]
    fn decode_data_and_control() {
        assert_eq!(
            decode_client(r#"{"t":"d","p":"ls\n"}"#).unwrap(),
            ClientMessage::Data("ls\n".into())
        );
        assert_eq!(
            decode_client(r#"{"t":"suspend","p":"tok"}"#).unwrap(),
            ClientMessage::Suspend { token: "tok".into() }
        );
        assert_eq!(
            decode_client(r#"{"t":"resize","p":"{\"rows\":40,\"cols\":120}"}"#).unwrap(),
            ClientMessage::Resize(RowsCols { rows: 40, cols: 120 })
        );
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            decode_client("not json"),
            Err(GatewayError::ProtocolDecode(_))
        ));
        assert!(matches!(
            decode_client(r#"{"t":"connect","p":"{bad"}"#),
            Err(GatewayError::ProtocolDecode(_))
        ));
        let err = decode_client(r#"{"t":"zap","p":""}"#).unwrap_err();
        assert_eq!(err.to_string(), "Unsupported Message: zap");
    }

    #[test]
    fn encode_geometry_nests_json() {
        let text = encode_server(&ServerMessage::Geometry(RowsCols { rows: 30, cols: 100 }));
        let env: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(env.t, "s");
        let rc: RowsCols = serde_json::from_str(&env.p).unwrap();
        assert_eq!(rc, RowsCols { rows: 30, cols: 100 });
    }

    #[test]
    fn notice_is_wrapped() {
        assert_eq!(
            ServerMessage::notice("Session Suspended"),
            ServerMessage::Output("\r\nSession Suspended\r\n".into())
        );
    }

    #[test]
    fn utf8_carry_joins_split_sequence() {
        let bytes = "héllo".as_bytes();
        let mut carry = Utf8Carry::new();
        // split inside the two-byte 'é'
        let first = carry.decode(&bytes[..2]);
        assert_eq!(first, "h");
        assert_eq!(carry.pending(), 1);
        let second = carry.decode(&bytes[2..]);
        assert_eq!(second, "éllo");
        assert_eq!(carry.pending(), 0);
    }

    #[test]
    fn utf8_carry_replaces_invalid() {
        let mut carry = Utf8Carry::new();
        assert_eq!(carry.decode(b"a\xffb"), "a\u{fffd}b");
    }
}
