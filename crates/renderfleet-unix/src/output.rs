use renderfleet_core::{
    OutputStream, ProcessEvent, ProcessEventKind, ProcessEventSender, ProcessId,
};
use tokio::io::AsyncRead;
use tokio_stream::StreamExt;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, FramedRead};

/// Longest line kept whole; anything longer is emitted in chunks
const MAX_LINE: usize = 16 * 1024;

/// Newline-delimited decoder that tolerates invalid UTF-8 from the engine
pub(crate) struct LossyLineCodec;

impl LossyLineCodec {
    fn take_line(src: &mut BytesMut, len: usize, consumed: usize) -> String {
        let chunk = src.split_to(consumed);
        let mut line = String::from_utf8_lossy(&chunk[..len]).into_owned();
        if line.ends_with('\r') {
            line.pop();
        }
        line
    }
}

impl Decoder for LossyLineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(newline) = src.iter().position(|b| *b == b'\n') {
            return Ok(Some(Self::take_line(src, newline, newline + 1)));
        }
        if src.len() >= MAX_LINE {
            return Ok(Some(Self::take_line(src, MAX_LINE, MAX_LINE)));
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(line) => Ok(Some(line)),
            None if src.is_empty() => Ok(None),
            None => {
                let len = src.len();
                Ok(Some(Self::take_line(src, len, len)))
            }
        }
    }
}

/// Identifies which process an output pump reports for
#[derive(Clone)]
pub(crate) struct PumpTarget {
    pub session_id: String,
    pub instance: u64,
    pub pid: Option<ProcessId>,
    pub events: ProcessEventSender,
}

/// Forward every line read from `io` as an output event until EOF
pub(crate) async fn pump<R: AsyncRead + Unpin>(io: R, stream: OutputStream, target: PumpTarget) {
    let mut frames = FramedRead::with_capacity(io, LossyLineCodec, 1024);
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(line) => {
                let event = ProcessEvent {
                    session_id: target.session_id.clone(),
                    instance: target.instance,
                    pid: target.pid,
                    kind: ProcessEventKind::Output { stream, line },
                };
                if target.events.send(event).is_err() {
                    // Supervisor is gone; keep draining so the pipe never fills
                    continue;
                }
            }
            Err(e) => {
                tracing::warn!(session = %target.session_id, "Output stream {:?} failed: {}", stream, e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn decode_all(input: &[u8]) -> Vec<String> {
        let mut codec = LossyLineCodec;
        let mut buf = BytesMut::from(input);
        let mut lines = Vec::new();
        while let Some(line) = codec.decode(&mut buf).unwrap() {
            lines.push(line);
        }
        while let Some(line) = codec.decode_eof(&mut buf).unwrap() {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn test_splits_lines_and_trailing_fragment() {
        assert_eq!(
            decode_all(b"ready\r\nport 6100\npartial"),
            vec!["ready", "port 6100", "partial"]
        );
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let lines = decode_all(b"caf\xff\n");
        assert_eq!(lines, vec!["caf\u{fffd}"]);
    }

    #[test]
    fn test_overlong_line_is_chunked() {
        let input = vec![b'a'; MAX_LINE + 10];
        let lines = decode_all(&input);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), MAX_LINE);
        assert_eq!(lines[1].len(), 10);
    }

    #[tokio::test]
    async fn test_pump_emits_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let target = PumpTarget {
            session_id: "s1".to_string(),
            instance: 4,
            pid: Some(ProcessId(42)),
            events: tx,
        };
        pump(&b"one\ntwo\n"[..], OutputStream::Stderr, target).await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.session_id, "s1");
        assert_eq!(first.instance, 4);
        assert_eq!(
            first.kind,
            ProcessEventKind::Output {
                stream: OutputStream::Stderr,
                line: "one".to_string()
            }
        );
        assert!(matches!(
            rx.recv().await.unwrap().kind,
            ProcessEventKind::Output { ref line, .. } if line == "two"
        ));
    }
}
