use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{self, BufRead, Write};

/// Largest message body accepted from a client.
pub const MAX_CONTENT_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
pub struct DapMessage {
    pub seq: u64,
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(flatten)]
    pub content: DapMessageContent,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DapMessageContent {
    Request {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        arguments: Option<Value>,
    },
    Response {
        request_seq: u64,
        success: bool,
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
    },
    Event {
        event: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
    },
}

impl DapMessage {
    pub fn new(seq: u64, content: DapMessageContent) -> Self {
        let msg_type = match &content {
            DapMessageContent::Request { .. } => "request",
            DapMessageContent::Response { .. } => "response",
            DapMessageContent::Event { .. } => "event",
        };
        Self {
            seq,
            msg_type: msg_type.to_string(),
            content,
        }
    }
}

/// Write one `Content-Length` framed message.
pub fn write_message<W: Write + ?Sized>(out: &mut W, msg: &DapMessage) -> io::Result<()> {
    let json = serde_json::to_string(msg)?;
    write!(out, "Content-Length: {}\r\n\r\n{}", json.len(), json)?;
    out.flush()
}

/// Read one framed message. `Ok(None)` at end of input.
pub fn read_message<R: BufRead + ?Sized>(input: &mut R) -> io::Result<Option<DapMessage>> {
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            if content_length.is_some() {
                break;
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("Content-Length:") {
            let len: usize = rest.trim().parse().map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "bad Content-Length header")
            })?;
            if len > MAX_CONTENT_LENGTH {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Content-Length {} exceeds {}", len, MAX_CONTENT_LENGTH),
                ));
            }
            content_length = Some(len);
        }
    }

    let mut buffer = vec![0u8; content_length.unwrap_or(0)];
    input.read_exact(&mut buffer)?;
    let msg = serde_json::from_slice(&buffer)?;
    Ok(Some(msg))
}
