//! Incremental parser for the streamed `POST /image` response body.
//!
//! The server writes progress fragments (`{"step": 3, "total_steps": 50}`)
//! followed by the final payload (`{"status": "succeeded", "output": [...]}`).
//! Each chunk is tried as a standalone JSON document: fragments with a
//! `step` become [`ProgressUpdate`]s, everything else is accumulated as the
//! final payload, which may itself arrive in several pieces.
//!
//! Some intermediaries buffer the whole stream and deliver it in one piece,
//! so the accumulated text can look like `{"step":1}{"step":2}{"status":...}`.
//! [`strip_concatenated_prefix`] keeps only the last document in that case.
//!
//! Nothing in this module does I/O; the HTTP client feeds it bytes.

use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;

use crate::error::{Result, SdError};
use crate::types::{GeneratedImage, GenerationOutput, ProgressUpdate};

/// Status value of a successful final payload.
pub const STATUS_SUCCEEDED: &str = "succeeded";

/// Decodes UTF-8 across chunk boundaries.
///
/// A multibyte sequence split between two chunks is held back until the
/// rest arrives. Invalid bytes decode to U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode as much of `chunk` (plus any held-back bytes) as possible.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);

        let mut out = String::with_capacity(self.pending.len());
        let mut start = 0;
        while start < self.pending.len() {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(s) => {
                    out.push_str(s);
                    start = self.pending.len();
                }
                Err(e) => {
                    let valid_end = start + e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[start..valid_end]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            start = valid_end + len;
                        }
                        // Incomplete sequence at the end: wait for more bytes.
                        None => {
                            start = valid_end;
                            break;
                        }
                    }
                }
            }
        }

        self.pending.drain(..start);
        out
    }

    /// Flush held-back bytes at end of stream.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// Per-request parser state. Create one per batch; discard after [`finish`](Self::finish).
#[derive(Debug)]
pub struct StreamParser {
    batches_done: u32,
    batch_count: u32,
    decoder: Utf8Decoder,
    final_json: String,
    prev_chunk: Option<Instant>,
    steps_remaining: u64,
    time_remaining_ms: u64,
}

impl StreamParser {
    /// `batches_done` and `batch_count` describe the owning task, so progress
    /// is reported across the whole task rather than the single batch.
    pub fn new(batches_done: u32, batch_count: u32) -> Self {
        Self {
            batches_done,
            batch_count,
            decoder: Utf8Decoder::new(),
            final_json: String::new(),
            prev_chunk: None,
            steps_remaining: 0,
            time_remaining_ms: 0,
        }
    }

    /// Feed one raw body chunk that arrived at `now`.
    pub fn push_bytes(&mut self, chunk: &[u8], now: Instant) -> Option<ProgressUpdate> {
        let text = self.decoder.decode(chunk);
        self.push_text(&text, now)
    }

    /// Feed one already decoded chunk that arrived at `now`.
    pub fn push_text(&mut self, text: &str, now: Instant) -> Option<ProgressUpdate> {
        let elapsed = self
            .prev_chunk
            .map(|prev| now.saturating_duration_since(prev));
        self.prev_chunk = Some(now);

        if let Ok(json) = serde_json::from_str::<Value>(text) {
            if let Some(step) = json.get("step") {
                return Some(self.progress(step, json.get("total_steps"), elapsed));
            }
        }

        self.final_json.push_str(text);
        None
    }

    fn progress(&mut self, step: &Value, total: Option<&Value>, elapsed: Option<Duration>) -> ProgressUpdate {
        let step = step.as_u64().unwrap_or(0);
        let steps_per_batch = total.and_then(Value::as_u64).unwrap_or(0);

        let overall_step = step + u64::from(self.batches_done) * steps_per_batch;
        let total_steps = u64::from(self.batch_count) * steps_per_batch;

        let percent = if total_steps == 0 {
            0
        } else {
            (100.0 * overall_step as f64 / total_steps as f64)
                .round()
                .min(100.0) as u8
        };

        self.steps_remaining = total_steps.saturating_sub(overall_step);
        self.time_remaining_ms = match elapsed {
            Some(gap) => self
                .steps_remaining
                .saturating_mul(gap.as_millis() as u64),
            None => 0,
        };

        ProgressUpdate {
            step,
            total_steps: steps_per_batch,
            overall_step,
            percent,
            steps_remaining: self.steps_remaining,
            time_remaining_ms: self.time_remaining_ms,
        }
    }

    pub fn steps_remaining(&self) -> u64 {
        self.steps_remaining
    }

    pub fn time_remaining_ms(&self) -> u64 {
        self.time_remaining_ms
    }

    /// Text accumulated so far for the final payload.
    pub fn accumulated(&self) -> &str {
        &self.final_json
    }

    /// End of stream: repair and interpret the accumulated final payload.
    pub fn finish(mut self) -> Result<GenerationOutput> {
        let tail = self.decoder.finish();
        self.final_json.push_str(&tail);
        parse_final_payload(strip_concatenated_prefix(&self.final_json))
    }
}

/// Keep only the text after the last `}{`, i.e. the last of several
/// JSON objects written back to back without a separator.
pub fn strip_concatenated_prefix(buffer: &str) -> &str {
    match buffer.rfind("}{") {
        Some(idx) => &buffer[idx + 1..],
        None => buffer,
    }
}

/// Interpret the terminal `{status, output, detail?}` document.
///
/// A status other than `succeeded` becomes [`SdError::GenerationFailed`]
/// carrying `detail` (or the whole document when there is none).
/// Unreadable `output` entries are skipped and counted.
pub fn parse_final_payload(text: &str) -> Result<GenerationOutput> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(SdError::InvalidResponse(
            "Stream ended without a result".into(),
        ));
    }

    let json: Value = serde_json::from_str(trimmed).map_err(|e| {
        SdError::InvalidResponse(format!(
            "Could not parse result ({}): {}",
            e,
            trimmed.chars().take(200).collect::<String>()
        ))
    })?;

    if json.get("status").and_then(Value::as_str) != Some(STATUS_SUCCEEDED) {
        let msg = match json.get("detail") {
            Some(Value::String(detail)) => detail.clone(),
            Some(detail) if !detail.is_null() => detail.to_string(),
            _ => json.to_string(),
        };
        return Err(SdError::generation_failed(msg));
    }

    let mut output = GenerationOutput::default();
    let entries = json
        .get("output")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    for (idx, entry) in entries.iter().enumerate() {
        match serde_json::from_value::<GeneratedImage>(entry.clone()) {
            Ok(image) => output.images.push(image),
            Err(e) => {
                debug!(index = idx, error = %e, "skipping invalid image entry");
                output.invalid_entries += 1;
            }
        }
    }

    Ok(output)
}

/// The error for a non-200 response. While the server is not yet known to be
/// online a failure is expected (it is still loading), so the message says so
/// instead of surfacing the body.
pub fn status_error(status: u16, body: String, server_online: bool) -> SdError {
    if server_online {
        SdError::Server { status, body }
    } else {
        SdError::StartingUp { status }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(parser: &mut StreamParser, chunks: &[&str]) -> Vec<ProgressUpdate> {
        let start = Instant::now();
        chunks
            .iter()
            .enumerate()
            .filter_map(|(i, c)| {
                parser.push_text(c, start + Duration::from_millis(100 * i as u64))
            })
            .collect()
    }

    #[test]
    fn test_progress_percent_across_batches() {
        let mut parser = StreamParser::new(0, 2);
        let updates = feed(
            &mut parser,
            &[r#"{"step":1,"total_steps":10}"#, r#"{"step":5,"total_steps":10}"#],
        );
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].percent, 5);
        assert_eq!(updates[1].percent, 25);
        assert_eq!(updates[1].overall_step, 5);
        assert_eq!(updates[1].steps_remaining, 15);
    }

    #[test]
    fn test_progress_offset_by_batches_done() {
        let mut parser = StreamParser::new(1, 2);
        let updates = feed(&mut parser, &[r#"{"step":5,"total_steps":10}"#]);
        assert_eq!(updates[0].overall_step, 15);
        assert_eq!(updates[0].percent, 75);
    }

    #[test]
    fn test_percent_clamped_to_100() {
        let mut parser = StreamParser::new(3, 2);
        let updates = feed(&mut parser, &[r#"{"step":10,"total_steps":10}"#]);
        assert_eq!(updates[0].percent, 100);
        assert_eq!(updates[0].steps_remaining, 0);
    }

    #[test]
    fn test_percent_rounds_half_up() {
        // 1/8 of 100 = 12.5
        let mut parser = StreamParser::new(0, 1);
        let updates = feed(&mut parser, &[r#"{"step":1,"total_steps":8}"#]);
        assert_eq!(updates[0].percent, 13);
    }

    #[test]
    fn test_missing_total_steps_reports_zero() {
        let mut parser = StreamParser::new(0, 1);
        let updates = feed(&mut parser, &[r#"{"step":4}"#]);
        assert_eq!(updates[0].percent, 0);
    }

    #[test]
    fn test_time_remaining_uses_chunk_gap() {
        let mut parser = StreamParser::new(0, 1);
        let start = Instant::now();
        let first = parser
            .push_text(r#"{"step":1,"total_steps":10}"#, start)
            .unwrap();
        assert_eq!(first.time_remaining_ms, 0);

        let second = parser
            .push_text(r#"{"step":2,"total_steps":10}"#, start + Duration::from_millis(250))
            .unwrap();
        assert_eq!(second.steps_remaining, 8);
        assert_eq!(second.time_remaining_ms, 2000);
        assert_eq!(parser.time_remaining_ms(), 2000);
        assert_eq!(parser.steps_remaining(), 8);
    }

    #[test]
    fn test_progress_chunks_not_accumulated() {
        let mut parser = StreamParser::new(0, 1);
        feed(
            &mut parser,
            &[
                r#"{"step":1,"total_steps":2}"#,
                r#"{"status":"succeeded","output":[]}"#,
            ],
        );
        assert_eq!(parser.accumulated(), r#"{"status":"succeeded","output":[]}"#);
    }

    #[test]
    fn test_final_payload_split_across_chunks() {
        let mut parser = StreamParser::new(0, 1);
        let updates = feed(
            &mut parser,
            &[
                r#"{"step":1,"total_steps":2}"#,
                r#"{"status":"succeeded","output":[{"data":"data:image/png;base64,AA==","#,
                r#""seed":42}]}"#,
            ],
        );
        assert_eq!(updates.len(), 1);
        let output = parser.finish().unwrap();
        assert_eq!(output.images.len(), 1);
        assert_eq!(output.images[0].seed, 42);
    }

    #[test]
    fn test_strip_concatenated_prefix_keeps_last_object() {
        assert_eq!(
            strip_concatenated_prefix(r#"{"step":9}{"status":"succeeded","output":[]}"#),
            r#"{"status":"succeeded","output":[]}"#
        );
        assert_eq!(
            strip_concatenated_prefix(r#"{"step":1}{"step":2}{"status":"x"}"#),
            r#"{"status":"x"}"#
        );
        assert_eq!(strip_concatenated_prefix(r#"{"a":1}"#), r#"{"a":1}"#);
        assert_eq!(strip_concatenated_prefix(""), "");
    }

    #[test]
    fn test_buffered_stream_in_one_chunk() {
        let mut parser = StreamParser::new(0, 1);
        let updates = feed(
            &mut parser,
            &[r#"{"step":9}{"status":"succeeded","output":[]}"#],
        );
        assert!(updates.is_empty());
        let output = parser.finish().unwrap();
        assert!(output.images.is_empty());
        assert_eq!(output.invalid_entries, 0);
    }

    #[test]
    fn test_failed_status_uses_detail() {
        let err = parse_final_payload(r#"{"status":"failed","detail":"bad prompt"}"#).unwrap_err();
        assert!(matches!(err, SdError::GenerationFailed(ref m) if m == "bad prompt"));
    }

    #[test]
    fn test_failed_status_without_detail_reports_document() {
        let err = parse_final_payload(r#"{"status":"failed"}"#).unwrap_err();
        assert_eq!(err.to_string(), r#"{"status":"failed"}"#);
    }

    #[test]
    fn test_out_of_memory_detail_gets_suggestions() {
        let err = parse_final_payload(
            r#"{"status":"failed","detail":"CUDA out of memory. Tried to allocate"}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Suggestions:"));
    }

    #[test]
    fn test_malformed_entry_does_not_block_others() {
        let output = parse_final_payload(
            r#"{"status":"succeeded","output":[
                {"data":"data:image/png;base64,AA==","seed":1},
                null,
                {"seed":3},
                {"data":"data:image/png;base64,AQ==","seed":4}
            ]}"#,
        )
        .unwrap();
        assert_eq!(output.images.len(), 2);
        assert_eq!(output.images[0].seed, 1);
        assert_eq!(output.images[1].seed, 4);
        assert_eq!(output.invalid_entries, 2);
    }

    #[test]
    fn test_missing_seed_defaults_to_zero() {
        let output =
            parse_final_payload(r#"{"status":"succeeded","output":[{"data":"x"}]}"#).unwrap();
        assert_eq!(output.images[0].seed, 0);
    }

    #[test]
    fn test_unparseable_or_empty_payload() {
        assert!(matches!(
            parse_final_payload("not json"),
            Err(SdError::InvalidResponse(_))
        ));
        assert!(matches!(
            parse_final_payload("   "),
            Err(SdError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_utf8_split_across_chunks() {
        let text = "{\"detail\":\"caf\u{e9} \u{1F600}\"}";
        let bytes = text.as_bytes();
        let mut decoder = Utf8Decoder::new();
        let mut out = String::new();
        // Split inside the two-byte é and inside the four-byte emoji.
        let e_acute = text.find('\u{e9}').unwrap() + 1;
        let emoji = text.find('\u{1F600}').unwrap() + 2;
        out.push_str(&decoder.decode(&bytes[..e_acute]));
        out.push_str(&decoder.decode(&bytes[e_acute..emoji]));
        out.push_str(&decoder.decode(&bytes[emoji..]));
        out.push_str(&decoder.finish());
        assert_eq!(out, text);
    }

    #[test]
    fn test_utf8_invalid_bytes_replaced() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"ab\xffcd"), "ab\u{FFFD}cd");
        assert_eq!(decoder.decode(b"x\xe2\x82"), "x");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    #[test]
    fn test_status_error_depends_on_liveness() {
        assert!(matches!(
            status_error(500, "boom".into(), true),
            SdError::Server { status: 500, .. }
        ));
        assert!(matches!(
            status_error(500, "boom".into(), false),
            SdError::StartingUp { status: 500 }
        ));
    }
}
