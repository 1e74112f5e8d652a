//! Streaming permessage-deflate pipelines (RFC 7692).
//!
//! Two independent single-slot pipelines, one per direction. Each holds a
//! FIFO queue of pending fragments and an `Idle`/`Working` slot; fragments
//! are drained strictly in order. The streaming contexts carry an LZ77
//! sliding window across messages, so concurrent use of a context would
//! interleave output and corrupt the window history; the slot guard makes
//! that impossible.

use std::collections::VecDeque;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};

use crate::error::{Error, Result};
use crate::protocol::OpCode;

/// The sync-flush sentinel every compressed message is terminated with
/// (RFC 7692 Section 7.2.2). Appended before inflating the terminating
/// fragment, stripped from deflater output before it reaches the wire.
pub const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

const MAX_PIPELINE_ITERATIONS: usize = 100_000;
const CHUNK: usize = 4096;

/// Negotiated permessage-deflate parameters from the server's response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeflateParams {
    /// Server resets its compression context after each message.
    pub server_no_context_takeover: bool,
    /// Client must reset its compression context after each message.
    pub client_no_context_takeover: bool,
    /// Server's declared LZ77 window size (8-15).
    pub server_max_window_bits: u8,
    /// Window size the server demands of the client (8-15).
    pub client_max_window_bits: u8,
}

impl Default for DeflateParams {
    fn default() -> Self {
        Self {
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            server_max_window_bits: 15,
            client_max_window_bits: 15,
        }
    }
}

impl DeflateParams {
    /// Parse the server's `Sec-WebSocket-Extensions` tokens.
    ///
    /// Returns `Ok(None)` when no deflate extension was negotiated (any token
    /// whose name contains `-deflate` counts).
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidHandshake` on unknown parameters or window bits
    /// outside 8-15.
    pub fn from_tokens(tokens: &[String]) -> Result<Option<Self>> {
        let token = match tokens
            .iter()
            .find(|t| t.split(';').next().unwrap_or("").contains("-deflate"))
        {
            Some(token) => token,
            None => return Ok(None),
        };

        let mut params = Self::default();
        for part in token.split(';').skip(1) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (name, value) = match part.split_once('=') {
                Some((name, value)) => (name.trim(), Some(value.trim().trim_matches('"'))),
                None => (part, None),
            };
            match name {
                "server_no_context_takeover" => params.server_no_context_takeover = true,
                "client_no_context_takeover" => params.client_no_context_takeover = true,
                "server_max_window_bits" => {
                    params.server_max_window_bits = parse_window_bits(value)?;
                }
                "client_max_window_bits" => {
                    params.client_max_window_bits = parse_window_bits(value)?;
                }
                other => {
                    return Err(Error::InvalidHandshake(format!(
                        "unknown permessage-deflate parameter: {other}"
                    )));
                }
            }
        }

        Ok(Some(params))
    }
}

fn parse_window_bits(value: Option<&str>) -> Result<u8> {
    match value {
        Some(s) => {
            let bits: u8 = s.parse().map_err(|_| {
                Error::InvalidHandshake(format!("invalid window bits value: {s}"))
            })?;
            if !(8..=15).contains(&bits) {
                return Err(Error::InvalidHandshake(format!(
                    "window bits must be 8-15, got {bits}"
                )));
            }
            Ok(bits)
        }
        None => Ok(15),
    }
}

/// Single-slot pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    Idle,
    Working,
}

#[derive(Debug)]
struct InflateJob {
    opcode: OpCode,
    /// False while more fragments of the same message follow.
    fin: bool,
    data: Vec<u8>,
}

#[derive(Debug)]
struct DeflateJob {
    opcode: OpCode,
    data: Vec<u8>,
}

/// One inflated fragment, tagged with the frame metadata it arrived under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InflateOutput {
    /// Opcode of the originating frame.
    pub opcode: OpCode,
    /// Whether this fragment terminated its message.
    pub fin: bool,
    /// Decompressed bytes.
    pub data: Vec<u8>,
}

/// One compressed outbound message ready for framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeflateOutput {
    /// Opcode to frame the message with.
    pub opcode: OpCode,
    /// Compressed bytes, trailer already stripped.
    pub data: Vec<u8>,
}

/// Per-connection compression engine: one inflate and one deflate pipeline.
pub struct DeflateEngine {
    params: DeflateParams,
    /// Outbound compression is declined when the server demands a window
    /// smaller than this backend can produce; inbound inflate still runs.
    compress_outbound: bool,
    inflate_ctx: Decompress,
    deflate_ctx: Compress,
    inflate_state: PipelineState,
    deflate_state: PipelineState,
    inflate_pending: VecDeque<InflateJob>,
    deflate_pending: VecDeque<DeflateJob>,
    /// Maximum inflated size per message; 0 = unbounded.
    max_inflated_len: usize,
}

impl std::fmt::Debug for DeflateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeflateEngine")
            .field("params", &self.params)
            .field("compress_outbound", &self.compress_outbound)
            .field("inflate_state", &self.inflate_state)
            .field("deflate_state", &self.deflate_state)
            .field("inflate_pending", &self.inflate_pending.len())
            .field("deflate_pending", &self.deflate_pending.len())
            .finish()
    }
}

impl DeflateEngine {
    /// Create an engine for the negotiated parameters.
    ///
    /// `max_inflated_len` bounds the decompressed size of a single message
    /// (0 disables the bound).
    #[must_use]
    pub fn new(params: DeflateParams, max_inflated_len: usize) -> Self {
        // The default flate2 backend always uses a 15-bit raw window. A
        // smaller server window inflates fine under 15 bits; a demand for a
        // smaller *client* window cannot be honored, so outbound messages
        // stay uncompressed in that case.
        let compress_outbound = params.client_max_window_bits == 15;
        Self {
            params,
            compress_outbound,
            inflate_ctx: Decompress::new(false),
            deflate_ctx: Compress::new(Compression::default(), false),
            inflate_state: PipelineState::Idle,
            deflate_state: PipelineState::Idle,
            inflate_pending: VecDeque::new(),
            deflate_pending: VecDeque::new(),
            max_inflated_len,
        }
    }

    /// Whether outbound messages will actually be compressed.
    #[must_use]
    pub fn compresses_outbound(&self) -> bool {
        self.compress_outbound
    }

    /// Enqueue a compressed inbound fragment and drain the pipeline.
    ///
    /// `fin` marks the terminating fragment of the message; the
    /// `00 00 FF FF` sentinel is appended to the compressed stream for that
    /// fragment only. Outputs come back in enqueue order.
    ///
    /// # Errors
    ///
    /// - `Error::FrameTooLarge` when the inflated size exceeds the bound
    ///   (the caller closes with status 1009)
    /// - `Error::Compression` on decoder failure
    pub fn inflate(&mut self, opcode: OpCode, fin: bool, data: Vec<u8>) -> Result<Vec<InflateOutput>> {
        self.inflate_pending.push_back(InflateJob { opcode, fin, data });
        self.drain_inflate()
    }

    /// Enqueue an outbound message payload and drain the pipeline.
    ///
    /// The returned payloads have the deflater's sync-flush tail stripped and
    /// are framed by the caller with `RSV1=1`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Compression` on encoder failure.
    pub fn deflate(&mut self, opcode: OpCode, data: Vec<u8>) -> Result<Vec<DeflateOutput>> {
        self.deflate_pending.push_back(DeflateJob { opcode, data });
        self.drain_deflate()
    }

    fn drain_inflate(&mut self) -> Result<Vec<InflateOutput>> {
        if self.inflate_state == PipelineState::Working {
            // A drain is already underway; the queued job will be picked up
            // by it in order.
            return Ok(Vec::new());
        }

        let mut outputs = Vec::new();
        while let Some(job) = self.inflate_pending.pop_front() {
            self.inflate_state = PipelineState::Working;
            let result = self.run_inflate(&job);
            self.inflate_state = PipelineState::Idle;
            outputs.push(InflateOutput {
                opcode: job.opcode,
                fin: job.fin,
                data: result?,
            });
        }
        Ok(outputs)
    }

    fn drain_deflate(&mut self) -> Result<Vec<DeflateOutput>> {
        if self.deflate_state == PipelineState::Working {
            return Ok(Vec::new());
        }

        let mut outputs = Vec::new();
        while let Some(job) = self.deflate_pending.pop_front() {
            self.deflate_state = PipelineState::Working;
            let result = self.run_deflate(&job);
            self.deflate_state = PipelineState::Idle;
            outputs.push(DeflateOutput {
                opcode: job.opcode,
                data: result?,
            });
        }
        Ok(outputs)
    }

    fn run_inflate(&mut self, job: &InflateJob) -> Result<Vec<u8>> {
        let mut input = job.data.clone();
        if job.fin {
            input.extend_from_slice(&DEFLATE_TRAILER);
        }

        let mut out = Vec::with_capacity(input.len().max(256));
        let mut pos = 0;
        let mut iterations = 0;

        while pos < input.len() {
            iterations += 1;
            if iterations > MAX_PIPELINE_ITERATIONS {
                return Err(Error::Compression(
                    "decompression exceeded max iterations".into(),
                ));
            }

            let old_len = out.len();
            out.resize(old_len + CHUNK, 0);

            let before_in = self.inflate_ctx.total_in();
            let before_out = self.inflate_ctx.total_out();

            self.inflate_ctx
                .decompress(&input[pos..], &mut out[old_len..], FlushDecompress::Sync)
                .map_err(|e| Error::Compression(format!("decompression failed: {e}")))?;

            let consumed = (self.inflate_ctx.total_in() - before_in) as usize;
            let produced = (self.inflate_ctx.total_out() - before_out) as usize;

            out.truncate(old_len + produced);
            pos += consumed;

            if self.max_inflated_len != 0 && out.len() > self.max_inflated_len {
                return Err(Error::FrameTooLarge {
                    size: out.len(),
                    max: self.max_inflated_len,
                });
            }

            if consumed == 0 && produced == 0 {
                break;
            }
        }

        if job.fin && self.params.server_no_context_takeover {
            self.inflate_ctx = Decompress::new(false);
        }

        Ok(out)
    }

    fn run_deflate(&mut self, job: &DeflateJob) -> Result<Vec<u8>> {
        if job.data.is_empty() {
            return Ok(Vec::new());
        }

        let mut out = Vec::with_capacity(job.data.len() / 2 + 16);
        let mut pos = 0;
        let mut iterations = 0;

        loop {
            iterations += 1;
            if iterations > MAX_PIPELINE_ITERATIONS {
                return Err(Error::Compression(
                    "compression exceeded max iterations".into(),
                ));
            }

            let old_len = out.len();
            out.resize(old_len + CHUNK, 0);

            let before_in = self.deflate_ctx.total_in();
            let before_out = self.deflate_ctx.total_out();

            self.deflate_ctx
                .compress(&job.data[pos..], &mut out[old_len..], FlushCompress::Sync)
                .map_err(|e| Error::Compression(format!("compression failed: {e}")))?;

            let consumed = (self.deflate_ctx.total_in() - before_in) as usize;
            let produced = (self.deflate_ctx.total_out() - before_out) as usize;

            out.truncate(old_len + produced);
            pos += consumed;

            if pos >= job.data.len() && produced < CHUNK {
                break;
            }
            if consumed == 0 && produced == 0 {
                break;
            }
        }

        // The sync flush leaves the sentinel at the tail; it must not appear
        // on the wire (RFC 7692 Section 7.2.1).
        if out.len() >= DEFLATE_TRAILER.len() && out[out.len() - 4..] == DEFLATE_TRAILER {
            out.truncate(out.len() - 4);
        }

        if self.params.client_no_context_takeover {
            self.deflate_ctx = Compress::new(Compression::default(), false);
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> DeflateEngine {
        DeflateEngine::new(DeflateParams::default(), 0)
    }

    #[test]
    fn test_roundtrip_single_message() {
        let mut sender = engine();
        let mut receiver = engine();

        let original = b"Hello, WebSocket compression! This is a test message.".to_vec();
        let compressed = sender
            .deflate(OpCode::Text, original.clone())
            .unwrap()
            .remove(0);

        assert_eq!(compressed.opcode, OpCode::Text);
        assert_ne!(compressed.data, original);
        // The sentinel never reaches the wire.
        assert!(compressed.data.len() < 4 || compressed.data[compressed.data.len() - 4..] != DEFLATE_TRAILER);

        let inflated = receiver
            .inflate(OpCode::Text, true, compressed.data)
            .unwrap()
            .remove(0);
        assert!(inflated.fin);
        assert_eq!(inflated.data, original);
    }

    #[test]
    fn test_fragmented_compressed_message() {
        let mut sender = engine();
        let mut receiver = engine();

        let original = b"The quick brown fox jumps over the lazy dog. ".repeat(8);
        let compressed = sender.deflate(OpCode::Text, original.clone()).unwrap().remove(0);

        // Split the compressed stream into two wire fragments at an
        // arbitrary point; inflate must stream across the split.
        let mid = compressed.data.len() / 2;
        let first = receiver
            .inflate(OpCode::Text, false, compressed.data[..mid].to_vec())
            .unwrap()
            .remove(0);
        assert!(!first.fin);
        let second = receiver
            .inflate(OpCode::Continuation, true, compressed.data[mid..].to_vec())
            .unwrap()
            .remove(0);
        assert!(second.fin);

        let mut body = first.data;
        body.extend(second.data);
        assert_eq!(body, original);
    }

    #[test]
    fn test_context_takeover_across_messages() {
        let mut sender = engine();
        let mut receiver = engine();

        let message = b"repetition repetition repetition repetition".repeat(4);

        let first = sender.deflate(OpCode::Text, message.clone()).unwrap().remove(0);
        let first_size = first.data.len();
        assert_eq!(
            receiver.inflate(OpCode::Text, true, first.data).unwrap().remove(0).data,
            message
        );

        // With context takeover the second identical message compresses at
        // least as well, and still inflates against the shared window.
        let second = sender.deflate(OpCode::Text, message.clone()).unwrap().remove(0);
        assert!(second.data.len() <= first_size);
        assert_eq!(
            receiver.inflate(OpCode::Text, true, second.data).unwrap().remove(0).data,
            message
        );
    }

    #[test]
    fn test_no_context_takeover_resets() {
        let params = DeflateParams {
            client_no_context_takeover: true,
            server_no_context_takeover: true,
            ..DeflateParams::default()
        };
        let mut sender = DeflateEngine::new(params.clone(), 0);
        let mut receiver = DeflateEngine::new(params, 0);

        let message = b"stateless stateless stateless".repeat(4);

        let first = sender.deflate(OpCode::Text, message.clone()).unwrap().remove(0);
        let second = sender.deflate(OpCode::Text, message.clone()).unwrap().remove(0);
        assert_eq!(first.data.len(), second.data.len());

        assert_eq!(
            receiver.inflate(OpCode::Text, true, first.data).unwrap().remove(0).data,
            message
        );
        assert_eq!(
            receiver.inflate(OpCode::Text, true, second.data).unwrap().remove(0).data,
            message
        );
    }

    #[test]
    fn test_inflated_size_limit() {
        let mut sender = engine();
        let mut receiver = DeflateEngine::new(DeflateParams::default(), 64);

        let big = vec![0u8; 4096];
        let compressed = sender.deflate(OpCode::Binary, big).unwrap().remove(0);
        let result = receiver.inflate(OpCode::Binary, true, compressed.data);
        assert!(matches!(result, Err(Error::FrameTooLarge { max: 64, .. })));
    }

    #[test]
    fn test_empty_payload() {
        let mut sender = engine();
        let outputs = sender.deflate(OpCode::Text, Vec::new()).unwrap();
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].data.is_empty());
    }

    #[test]
    fn test_outputs_preserve_enqueue_order() {
        let mut sender = engine();
        let mut receiver = engine();
        for i in 0..5u8 {
            let body = vec![i; 100 + i as usize];
            let compressed = sender.deflate(OpCode::Binary, body.clone()).unwrap().remove(0);
            let inflated = receiver
                .inflate(OpCode::Binary, true, compressed.data)
                .unwrap()
                .remove(0);
            assert_eq!(inflated.data, body);
        }
    }

    #[test]
    fn test_params_from_tokens() {
        let tokens = vec![
            "permessage-deflate; server_no_context_takeover; server_max_window_bits=12"
                .to_string(),
        ];
        let params = DeflateParams::from_tokens(&tokens).unwrap().unwrap();
        assert!(params.server_no_context_takeover);
        assert!(!params.client_no_context_takeover);
        assert_eq!(params.server_max_window_bits, 12);
        assert_eq!(params.client_max_window_bits, 15);
    }

    #[test]
    fn test_params_absent_without_deflate_token() {
        let tokens = vec!["x-custom-extension".to_string()];
        assert_eq!(DeflateParams::from_tokens(&tokens).unwrap(), None);
        assert_eq!(DeflateParams::from_tokens(&[]).unwrap(), None);
    }

    #[test]
    fn test_params_substring_match() {
        let tokens = vec!["x-webkit-deflate-frame".to_string()];
        assert!(DeflateParams::from_tokens(&tokens).unwrap().is_some());
    }

    #[test]
    fn test_params_reject_bad_window_bits() {
        let tokens = vec!["permessage-deflate; server_max_window_bits=7".to_string()];
        assert!(DeflateParams::from_tokens(&tokens).is_err());
        let tokens = vec!["permessage-deflate; client_max_window_bits=sixteen".to_string()];
        assert!(DeflateParams::from_tokens(&tokens).is_err());
    }

    #[test]
    fn test_params_reject_unknown_parameter() {
        let tokens = vec!["permessage-deflate; bogus_param=1".to_string()];
        assert!(DeflateParams::from_tokens(&tokens).is_err());
    }

    #[test]
    fn test_small_client_window_declines_outbound() {
        let params = DeflateParams {
            client_max_window_bits: 10,
            ..DeflateParams::default()
        };
        let engine = DeflateEngine::new(params, 0);
        assert!(!engine.compresses_outbound());
    }
}
