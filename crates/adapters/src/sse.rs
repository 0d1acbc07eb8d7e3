use std::io::BufRead;

use log::{debug, warn};
use serde_json::Value;

use story_core::transport::TransportError;

use crate::error::AdapterError;

/// Lazily reads `data:` lines of a chat-completion event stream and yields
/// `choices[0].delta.content` for each event. Ends at `[DONE]`, at end of
/// body, or after the first error.
pub struct SseFragments<R> {
    reader: R,
    line: String,
    finished: bool,
}

impl<R: BufRead> SseFragments<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
            finished: false,
        }
    }

    fn fail(&mut self, err: AdapterError) -> Option<Result<Option<String>, TransportError>> {
        self.finished = true;
        Some(Err(err.into()))
    }
}

/// Extracts the fragment carried by one event payload.
pub fn parse_event(data: &str) -> Result<Option<String>, AdapterError> {
    let value: Value = serde_json::from_str(data)?;
    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(AdapterError::Remote(message));
    }
    Ok(value["choices"][0]["delta"]["content"]
        .as_str()
        .map(str::to_string))
}

impl<R: BufRead> Iterator for SseFragments<R> {
    type Item = Result<Option<String>, TransportError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        self.line.clear();
        match self.reader.read_line(&mut self.line) {
            Ok(0) => {
                self.finished = true;
                debug!("event stream closed without [DONE]");
                None
            }
            Ok(_) => {
                let line = self.line.trim_end_matches(|c: char| c == '\r' || c == '\n');
                let Some(data) = line.strip_prefix("data:") else {
                    // blank separators, comments and other fields
                    return Some(Ok(None));
                };
                let data = data.trim();
                if data == "[DONE]" {
                    self.finished = true;
                    return None;
                }
                if data.is_empty() {
                    return Some(Ok(None));
                }
                match parse_event(data) {
                    Ok(fragment) => Some(Ok(fragment)),
                    Err(err) => {
                        warn!("malformed stream event: {err}");
                        self.fail(err)
                    }
                }
            }
            Err(err) => self.fail(AdapterError::Stream(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use story_core::transport::{aggregate_fragments, TransportErrorKind};
    use tokio_util::sync::CancellationToken;

    const BODY: &str = concat!(
        ": keep-alive\n\n",
        "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"\"}}]}\n\n",
        "data:{\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\r\n\r\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\" world\"},\"finish_reason\":null}]}\n\n",
        "data: [DONE]\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
    );

    #[test]
    fn aggregates_canned_event_stream() {
        let mut seen = Vec::new();
        let mut callback = |fragment: &str| seen.push(fragment.to_string());
        let text = aggregate_fragments(
            SseFragments::new(Cursor::new(BODY)),
            Some(&mut callback),
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(text, "Hello world");
        assert_eq!(seen, vec!["Hel", "lo", " world"]);
    }

    #[test]
    fn body_without_done_still_terminates() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"半\"}}]}\n";
        let fragments: Vec<_> = SseFragments::new(Cursor::new(body)).collect();
        assert_eq!(fragments.len(), 1);
    }

    #[test]
    fn malformed_event_stops_the_stream() {
        let body = "data: {oops\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n";
        let items: Vec<_> = SseFragments::new(Cursor::new(body)).collect();
        assert_eq!(items.len(), 1);
        let err = items.into_iter().next().unwrap().unwrap_err();
        assert_eq!(err.kind(), TransportErrorKind::Malformed);
    }

    #[test]
    fn error_events_are_reported() {
        let body = "data: {\"error\":{\"message\":\"quota exceeded\"}}\n";
        let err = aggregate_fragments(
            SseFragments::new(Cursor::new(body)),
            None,
            &CancellationToken::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), TransportErrorKind::Other);
        assert!(err.message().contains("quota exceeded"));
    }
}
