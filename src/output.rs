//! Shared output buffer for a running program.
//!
//! A dedicated reader task appends chunks in arrival order and runs the
//! input detector after every append. Consumers subscribe to state changes
//! through a `watch` channel instead of sharing closures with the reader.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::detector::detect;
use crate::language::Language;
use crate::runtime::{OutputChunk, OutputStream};

/// How much of the most recent stdout the detector looks at.
const DETECT_TAIL_BYTES: usize = 1024;

/// Snapshot of everything a program has emitted so far.
#[derive(Debug, Clone, Default)]
pub struct OutputState {
    pub stdout: String,
    pub stderr: String,
    /// Set when the detector believes the program is blocked on stdin.
    pub waiting: bool,
    pub prompt: Option<String>,
    /// Automatic input is still being delivered; detection is suppressed.
    pub input_pending: bool,
    /// The output stream has ended.
    pub closed: bool,
    /// Number of chunks appended.
    pub generation: u64,
    /// Start of the stdout produced since the last delivered input.
    input_mark: usize,
    carry_out: Vec<u8>,
    carry_err: Vec<u8>,
}

impl OutputState {
    fn reevaluate(&mut self, language: Language) {
        if self.input_pending || self.closed {
            self.waiting = false;
            self.prompt = None;
            return;
        }
        let fresh = &self.stdout[self.input_mark..];
        let detection = detect(tail(fresh, DETECT_TAIL_BYTES), language);
        self.waiting = detection.waiting;
        self.prompt = detection.prompt;
    }
}

fn tail(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Append `bytes` to `out`, holding back an incomplete trailing UTF-8 sequence.
fn push_utf8(out: &mut String, carry: &mut Vec<u8>, bytes: &[u8]) {
    carry.extend_from_slice(bytes);
    let valid = match std::str::from_utf8(carry) {
        Ok(_) => carry.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => {
            out.push_str(&String::from_utf8_lossy(carry).replace('\r', ""));
            carry.clear();
            return;
        }
    };
    let rest = carry.split_off(valid);
    out.push_str(&String::from_utf8_lossy(carry).replace('\r', ""));
    *carry = rest;
}

/// Output of one execution, shared between the reader task and consumers.
#[derive(Debug)]
pub struct OutputBuffer {
    language: Language,
    state: watch::Sender<OutputState>,
}

impl OutputBuffer {
    pub fn new(language: Language) -> Arc<Self> {
        let (state, _) = watch::channel(OutputState::default());
        Arc::new(Self { language, state })
    }

    pub fn append(&self, chunk: &OutputChunk) {
        self.state.send_modify(|s| {
            match chunk {
                OutputChunk::Stdout(bytes) => {
                    let OutputState { stdout, carry_out, .. } = s;
                    push_utf8(stdout, carry_out, bytes);
                }
                OutputChunk::Stderr(bytes) => {
                    let OutputState { stderr, carry_err, .. } = s;
                    push_utf8(stderr, carry_err, bytes);
                }
            }
            s.generation += 1;
            s.reevaluate(self.language);
        });
    }

    pub fn set_input_pending(&self, pending: bool) {
        self.state.send_modify(|s| {
            s.input_pending = pending;
            s.reevaluate(self.language);
        });
    }

    /// Record that input was delivered: the current detection is dropped
    /// and later detection only looks at output produced after this point,
    /// so an answered prompt on the same line is not reported again.
    pub fn mark_input_delivered(&self) {
        self.state.send_modify(|s| {
            s.input_mark = s.stdout.len();
            s.waiting = false;
            s.prompt = None;
        });
    }

    pub fn close(&self) {
        self.state.send_modify(|s| {
            s.closed = true;
            s.reevaluate(self.language);
        });
    }

    pub fn snapshot(&self) -> OutputState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<OutputState> {
        self.state.subscribe()
    }

    /// Wait until the stream has ended, at most `timeout`.
    pub async fn wait_closed(&self, timeout: Duration) {
        let mut rx = self.subscribe();
        let _ = tokio::time::timeout(timeout, rx.wait_for(|s| s.closed)).await;
    }
}

/// Spawn the task that drains `output` into `buffer`.
pub fn spawn_reader(mut output: OutputStream, buffer: Arc<OutputBuffer>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = output.next().await {
            match item {
                Ok(chunk) => buffer.append(&chunk),
                Err(e) => {
                    debug!(error = %e, "Output stream ended with error");
                    break;
                }
            }
        }
        buffer.close();
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn out(text: &str) -> OutputChunk {
        OutputChunk::Stdout(text.as_bytes().to_vec())
    }

    #[test]
    fn appends_in_order_and_strips_cr() {
        let buffer = OutputBuffer::new(Language::Python);
        buffer.append(&out("a\r\n"));
        buffer.append(&OutputChunk::Stderr(b"oops\n".to_vec()));
        buffer.append(&out("b\n"));
        let s = buffer.snapshot();
        assert_eq!(s.stdout, "a\nb\n");
        assert_eq!(s.stderr, "oops\n");
        assert_eq!(s.generation, 3);
    }

    #[test]
    fn split_utf8_sequence_is_reassembled() {
        let buffer = OutputBuffer::new(Language::Cpp);
        let bytes = "Xin chào\n".as_bytes();
        let split = bytes.iter().position(|b| *b >= 0x80).unwrap() + 1;
        buffer.append(&OutputChunk::Stdout(bytes[..split].to_vec()));
        buffer.append(&OutputChunk::Stdout(bytes[split..].to_vec()));
        assert_eq!(buffer.snapshot().stdout, "Xin chào\n");
    }

    #[test]
    fn detection_runs_after_each_chunk() {
        let buffer = OutputBuffer::new(Language::Python);
        buffer.append(&out("Hello\n"));
        assert!(!buffer.snapshot().waiting);
        buffer.append(&out("Name: "));
        let s = buffer.snapshot();
        assert!(s.waiting);
        assert_eq!(s.prompt.as_deref(), Some("Name:"));
    }

    #[test]
    fn pending_input_suppresses_detection() {
        let buffer = OutputBuffer::new(Language::Python);
        buffer.set_input_pending(true);
        buffer.append(&out("Name: "));
        assert!(!buffer.snapshot().waiting);
        buffer.set_input_pending(false);
        assert!(buffer.snapshot().waiting);
        buffer.mark_input_delivered();
        assert!(!buffer.snapshot().waiting);
    }

    #[test]
    fn answered_prompt_is_not_detected_again() {
        let buffer = OutputBuffer::new(Language::Python);
        buffer.append(&out("Name: "));
        assert!(buffer.snapshot().waiting);

        buffer.mark_input_delivered();
        buffer.append(&out("hi Ada\n"));
        let s = buffer.snapshot();
        assert!(!s.waiting);
        assert_eq!(s.stdout, "Name: hi Ada\n");

        buffer.append(&out("Age? "));
        let s = buffer.snapshot();
        assert!(s.waiting);
        assert_eq!(s.prompt.as_deref(), Some("Age?"));
    }

    #[test]
    fn tail_respects_char_boundaries() {
        let text = "ééééé";
        let t = tail(text, 3);
        assert_eq!(t, "é");
    }

    #[tokio::test]
    async fn reader_closes_buffer_at_end_of_stream() {
        let buffer = OutputBuffer::new(Language::Javascript);
        let stream = futures_util::stream::iter(vec![Ok(out("1\n")), Ok(out("2\n"))]);
        spawn_reader(Box::pin(stream), Arc::clone(&buffer))
            .await
            .unwrap();
        let s = buffer.snapshot();
        assert!(s.closed);
        assert_eq!(s.stdout, "1\n2\n");
    }
}
