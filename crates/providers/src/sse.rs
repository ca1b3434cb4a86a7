//! Shared SSE plumbing for provider adapters: buffer response chunks,
//! split on `\n\n`, extract `data:` payloads, and hand each payload to an
//! adapter-specific parser.

use crate::util::from_reqwest;
use dg_domain::error::Result;
use dg_domain::stream::{BoxStream, StreamEvent};

/// Drain complete `data:` payloads from an SSE buffer in place. A trailing
/// partial event stays in the buffer for the next chunk.
pub(crate) fn drain_data_lines(buffer: &mut String) -> Vec<String> {
    let mut payloads = Vec::new();
    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2);
        for line in block.lines() {
            if let Some(data) = line.trim().strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    payloads.push(data.to_string());
                }
            }
        }
    }
    payloads
}

/// Wrap an SSE `reqwest::Response` into an event stream via a parser
/// closure. Guarantees a terminal `Done` even when the server closes the
/// body without one.
pub(crate) fn sse_response_stream<F>(
    response: reqwest::Response,
    mut parse_data: F,
) -> BoxStream<'static, Result<StreamEvent>>
where
    F: FnMut(&str) -> Vec<Result<StreamEvent>> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut response = response;
        let mut buffer = String::new();
        let mut done_emitted = false;

        loop {
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    for data in drain_data_lines(&mut buffer) {
                        for event in parse_data(&data) {
                            if matches!(&event, Ok(StreamEvent::Done { .. })) {
                                done_emitted = true;
                            }
                            yield event;
                        }
                    }
                }
                Ok(None) => {
                    // Body closed; flush a trailing partial event if any.
                    if !buffer.trim().is_empty() {
                        buffer.push_str("\n\n");
                        for data in drain_data_lines(&mut buffer) {
                            for event in parse_data(&data) {
                                if matches!(&event, Ok(StreamEvent::Done { .. })) {
                                    done_emitted = true;
                                }
                                yield event;
                            }
                        }
                    }
                    break;
                }
                Err(e) => {
                    yield Err(from_reqwest(e));
                    break;
                }
            }
        }

        if !done_emitted {
            yield Ok(StreamEvent::Done { usage: None, finish_reason: Some("stop".into()) });
        }
    };

    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_complete_events() {
        let mut buf = String::from("event: delta\ndata: {\"a\":1}\n\ndata: [DONE]\n\n");
        assert_eq!(drain_data_lines(&mut buf), vec!["{\"a\":1}", "[DONE]"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn keeps_partial_event_buffered() {
        let mut buf = String::from("data: whole\n\ndata: par");
        assert_eq!(drain_data_lines(&mut buf), vec!["whole"]);
        assert_eq!(buf, "data: par");

        buf.push_str("tial\n\n");
        assert_eq!(drain_data_lines(&mut buf), vec!["partial"]);
    }

    #[test]
    fn ignores_non_data_fields_and_blank_payloads() {
        let mut buf = String::from("id: 7\nretry: 100\ndata: \n\ndata: x\n\n");
        assert_eq!(drain_data_lines(&mut buf), vec!["x"]);
    }
}
