use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use crate::error::{io_err, DaemonError};

/// Electrum protocol version advertised by the listener.
pub const PROTOCOL_VERSION: &str = "1.4";

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;

/// JSON newline-delimited Electrum request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectrumRequest {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectrumErrorObject {
    pub code: i64,
    pub message: String,
}

/// JSON newline-delimited Electrum response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectrumResponse {
    pub jsonrpc: String,
    pub id: Value,
    /// `Some(Value::Null)` for a present `null` result, `None` when absent.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ElectrumErrorObject>,
}

fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl ElectrumResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(ElectrumErrorObject {
                code,
                message: message.into(),
            }),
        }
    }
}

pub fn server_software() -> String {
    format!("bwt {}", env!("CARGO_PKG_VERSION"))
}

/// Answer one request. Only the session handshake methods are served.
pub fn respond(request: &ElectrumRequest) -> ElectrumResponse {
    let id = request.id.clone();
    match request.method.as_str() {
        "server.version" => ElectrumResponse::ok(id, json!([server_software(), PROTOCOL_VERSION])),
        "server.ping" => ElectrumResponse::ok(id, Value::Null),
        "server.banner" => ElectrumResponse::ok(id, json!(format!("Welcome to {}", server_software()))),
        other => ElectrumResponse::error(id, METHOD_NOT_FOUND, format!("unknown method '{other}'")),
    }
}

/// Answer one raw request line.
pub fn respond_line(line: &str) -> ElectrumResponse {
    match serde_json::from_str::<ElectrumRequest>(line) {
        Ok(request) => respond(&request),
        Err(err) => ElectrumResponse::error(Value::Null, PARSE_ERROR, format!("invalid request JSON: {err}")),
    }
}

/// Send one JSON request to an Electrum listener and return one response.
pub fn send_request(
    addr: SocketAddr,
    request: &ElectrumRequest,
    timeout: Duration,
) -> Result<ElectrumResponse, DaemonError> {
    let label = format!("electrum://{addr}");
    let mut stream =
        TcpStream::connect_timeout(&addr, timeout).map_err(|e| io_err(&label, e))?;
    stream
        .set_read_timeout(Some(timeout))
        .map_err(|e| io_err(&label, e))?;

    let payload = serde_json::to_string(request)?;
    stream
        .write_all(payload.as_bytes())
        .map_err(|e| io_err(&label, e))?;
    stream.write_all(b"\n").map_err(|e| io_err(&label, e))?;
    stream.flush().map_err(|e| io_err(&label, e))?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let read = reader.read_line(&mut line).map_err(|e| io_err(&label, e))?;
    if read == 0 {
        return Err(DaemonError::Runtime(
            "electrum listener closed connection before responding".to_string(),
        ));
    }

    Ok(serde_json::from_str(line.trim_end())?)
}

/// Handshake with an Electrum listener; returns the advertised software name.
pub fn probe(addr: SocketAddr, timeout: Duration) -> Result<String, DaemonError> {
    let request = ElectrumRequest {
        id: json!(0),
        method: "server.version".to_string(),
        params: vec![json!("bwt-probe"), json!(PROTOCOL_VERSION)],
    };
    let response = send_request(addr, &request, timeout)?;
    if let Some(err) = response.error {
        return Err(DaemonError::Runtime(format!(
            "electrum error {}: {}",
            err.code, err.message
        )));
    }
    response
        .result
        .as_ref()
        .and_then(|result| result.get(0))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DaemonError::Runtime("malformed server.version response".to_string()))
}
