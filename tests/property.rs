//! Property-based tests for framing, parsing, reassembly, and compression.

use proptest::prelude::*;

use tether::protocol::{Frame, FrameParser, MessageAssembler, OpCode};
use tether::{DeflateEngine, DeflateParams};

fn data_opcode() -> impl Strategy<Value = OpCode> {
    prop_oneof![Just(OpCode::Text), Just(OpCode::Binary)]
}

/// Boundary payload lengths around each length-encoding switchover.
const BOUNDARY_LENGTHS: [usize; 8] = [0, 1, 125, 126, 127, 65535, 65536, 1_000_000];

#[test]
fn test_roundtrip_at_boundary_lengths() {
    for &len in &BOUNDARY_LENGTHS {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        for opcode in [OpCode::Text, OpCode::Binary] {
            for mask in [None, Some([0x37, 0xfa, 0x21, 0x3d])] {
                let frame = Frame::new(true, opcode, payload.clone());
                let bytes = frame.encode(mask);
                let (parsed, consumed) = Frame::parse(&bytes).unwrap();
                assert_eq!(consumed, bytes.len(), "len {len}");
                assert_eq!(parsed.opcode, opcode);
                assert!(parsed.fin);
                assert_eq!(parsed.payload, payload, "len {len} mask {mask:?}");
            }
        }
    }
}

proptest! {
    // Round-trip framing: parse(encode(o, p)) restores opcode, payload, FIN.
    #[test]
    fn prop_roundtrip_unmasked(
        fin in any::<bool>(),
        opcode in data_opcode(),
        payload in prop::collection::vec(any::<u8>(), 0..1000)
    ) {
        let frame = Frame::new(fin, opcode, payload.clone());
        let bytes = frame.encode(None);
        let (parsed, consumed) = Frame::parse(&bytes).unwrap();
        prop_assert_eq!(consumed, bytes.len());
        prop_assert_eq!(parsed.fin, fin);
        prop_assert_eq!(parsed.opcode, opcode);
        prop_assert_eq!(parsed.payload, payload);
    }

    #[test]
    fn prop_roundtrip_masked(
        opcode in data_opcode(),
        payload in prop::collection::vec(any::<u8>(), 0..500),
        mask in any::<[u8; 4]>()
    ) {
        let frame = Frame::new(true, opcode, payload.clone());
        let bytes = frame.encode(Some(mask));
        let (parsed, _) = Frame::parse(&bytes).unwrap();
        prop_assert_eq!(parsed.payload, payload);
    }

    // Fragment reassembly: any partition of a payload into [o, 0, 0, ...]
    // frames with FIN on the last reassembles to the original.
    #[test]
    fn prop_fragment_reassembly(
        opcode in data_opcode(),
        payload in prop::collection::vec(any::<u8>(), 1..600),
        cut_points in prop::collection::vec(any::<prop::sample::Index>(), 0..4)
    ) {
        let mut cuts: Vec<usize> = cut_points.iter().map(|i| i.index(payload.len())).collect();
        cuts.sort_unstable();
        cuts.dedup();

        let mut parts: Vec<&[u8]> = Vec::new();
        let mut start = 0;
        for &cut in &cuts {
            parts.push(&payload[start..cut]);
            start = cut;
        }
        parts.push(&payload[start..]);

        let mut assembler = MessageAssembler::new();
        let last = parts.len() - 1;
        let mut result = None;
        for (i, part) in parts.iter().enumerate() {
            let frame_opcode = if i == 0 { opcode } else { OpCode::Continuation };
            let frame = Frame::new(i == last, frame_opcode, part.to_vec());
            if let Some(message) = assembler.push(frame).unwrap() {
                prop_assert_eq!(i, last);
                result = Some(message);
            }
        }

        let message = result.expect("message must complete on the FIN frame");
        prop_assert_eq!(message.opcode, opcode);
        prop_assert_eq!(message.payload, payload);
    }

    // Parser resumability: splitting the serialized byte stream of any frame
    // sequence at any offset yields the same frames as feeding it whole.
    #[test]
    fn prop_parser_resumable(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..200), 1..5),
        split in any::<prop::sample::Index>()
    ) {
        let mut stream = Vec::new();
        for payload in &payloads {
            stream.extend(Frame::binary(payload.clone()).encode(None));
        }

        let mut whole = FrameParser::new(0);
        whole.feed(&stream);
        let mut expected = Vec::new();
        while let Some(frame) = whole.next_frame().unwrap() {
            expected.push(frame);
        }

        let cut = split.index(stream.len() + 1);
        let mut parser = FrameParser::new(0);
        let mut produced = Vec::new();
        parser.feed(&stream[..cut]);
        while let Some(frame) = parser.next_frame().unwrap() {
            produced.push(frame);
        }
        parser.feed(&stream[cut..]);
        while let Some(frame) = parser.next_frame().unwrap() {
            produced.push(frame);
        }

        prop_assert_eq!(produced, expected);
    }

    // Compression round-trip: deflating then inflating any payload restores
    // it, and the wire payload never ends in the 00 00 FF FF sentinel.
    #[test]
    fn prop_deflate_roundtrip(payload in prop::collection::vec(any::<u8>(), 1..2000)) {
        let mut sender = DeflateEngine::new(DeflateParams::default(), 0);
        let mut receiver = DeflateEngine::new(DeflateParams::default(), 0);

        let compressed = sender
            .deflate(OpCode::Binary, payload.clone())
            .unwrap()
            .remove(0);
        if compressed.data.len() >= 4 {
            prop_assert_ne!(
                &compressed.data[compressed.data.len() - 4..],
                &[0x00, 0x00, 0xFF, 0xFF][..]
            );
        }

        let inflated = receiver
            .inflate(OpCode::Binary, true, compressed.data)
            .unwrap()
            .remove(0);
        prop_assert!(inflated.fin);
        prop_assert_eq!(inflated.data, payload);
    }

    // Compression streams across messages: a shared window on both sides
    // keeps round-tripping as message count grows.
    #[test]
    fn prop_deflate_context_stream(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..300), 1..6)
    ) {
        let mut sender = DeflateEngine::new(DeflateParams::default(), 0);
        let mut receiver = DeflateEngine::new(DeflateParams::default(), 0);

        for payload in payloads {
            let compressed = sender
                .deflate(OpCode::Binary, payload.clone())
                .unwrap()
                .remove(0);
            let inflated = receiver
                .inflate(OpCode::Binary, true, compressed.data)
                .unwrap()
                .remove(0);
            prop_assert_eq!(inflated.data, payload);
        }
    }
}
