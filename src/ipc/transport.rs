//! JsonLinesTransport (spec §4.12): newline-delimited JSON framing.

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Reads frames from an `AsyncBufRead`, splitting on `\n`. Malformed lines
/// (empty, non-JSON, non-object, missing `type`, `type` not a string) are
/// silently ignored and do not stall the stream (spec §4.12).
pub struct JsonLinesReader<R> {
    lines: tokio::io::Lines<BufReader<R>>,
}

impl<R: tokio::io::AsyncRead + Unpin> JsonLinesReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }

    /// Returns the next well-formed frame, skipping malformed lines.
    /// Returns `Ok(None)` at EOF.
    pub async fn next_frame(&mut self) -> std::io::Result<Option<Value>> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Ok(None);
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
                continue;
            };
            let Some(obj) = value.as_object() else {
                continue;
            };
            match obj.get("type") {
                Some(Value::String(_)) => return Ok(Some(value)),
                _ => continue,
            }
        }
    }
}

pub struct JsonLinesWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> JsonLinesWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_frame(&mut self, value: &Value) -> std::io::Result<()> {
        let mut line = serde_json::to_string(value)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await
    }
}
