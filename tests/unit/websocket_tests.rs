/* STATIC Proxy (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/


use bytes::Bytes;
use intercept_proxy::websocket::{
    DecodeStatus, Opcode, WebSocketError, WebSocketFrame, WebSocketFrameDecoder,
    WebSocketMessage, WebSocketMessageAssembler,
};
use proptest::prelude::*;
use uuid::Uuid;

/// Serializes one frame; `mask` set means client-to-server.
fn encode_frame(fin: bool, opcode: Opcode, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let mut out = vec![(if fin { 0x80 } else { 0 }) | opcode.as_u8()];
    let mask_bit = if mask.is_some() { 0x80 } else { 0 };
    match payload.len() {
        len if len < 126 => out.push(mask_bit | len as u8),
        len if len <= usize::from(u16::MAX) => {
            out.push(mask_bit | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        }
        len => {
            out.push(mask_bit | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }
    match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            out.extend(payload.iter().enumerate().map(|(i, byte)| byte ^ key[i % 4]));
        }
        None => out.extend_from_slice(payload),
    }
    out
}

/// Decodes `wire` in `step`-sized reads and reassembles every message.
fn reassemble(wire: &[u8], step: usize, capture_limit: usize) -> Vec<WebSocketMessage> {
    let mut decoder = WebSocketFrameDecoder::new(capture_limit);
    let mut assembler = WebSocketMessageAssembler::new(Uuid::new_v4(), capture_limit);
    let mut messages = Vec::new();

    for read in wire.chunks(step.max(1)) {
        let mut input = read;
        loop {
            match decoder.decode(input).expect("valid frame") {
                DecodeStatus::Complete { frame, consumed } => {
                    input = &input[consumed..];
                    if let Some(message) = assembler.try_create_or_add(frame).expect("valid sequence") {
                        messages.push(message);
                    }
                }
                DecodeStatus::NeedMore { consumed } => {
                    assert_eq!(consumed, input.len());
                    break;
                }
            }
        }
    }
    messages
}

proptest! {
    #[test]
    fn fragments_reassemble_to_their_concatenation(
        fragments in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..300), 1..6),
        binary in any::<bool>(),
        mask in prop::option::of(any::<[u8; 4]>()),
        ping_after in prop::option::of(0usize..5),
        step in 1usize..64,
    ) {
        let opcode = if binary { Opcode::Binary } else { Opcode::Text };
        let last = fragments.len() - 1;
        let mut wire = Vec::new();
        for (index, fragment) in fragments.iter().enumerate() {
            let frame_opcode = if index == 0 { opcode } else { Opcode::Continuation };
            wire.extend(encode_frame(index == last, frame_opcode, fragment, mask));
            if ping_after == Some(index) && index != last {
                wire.extend(encode_frame(true, Opcode::Ping, b"are you there", mask));
            }
        }

        let messages = reassemble(&wire, step, 1 << 16);
        let interleaved = matches!(ping_after, Some(index) if index < last);
        prop_assert_eq!(messages.len(), if interleaved { 2 } else { 1 });

        let data = messages.last().expect("data message");
        let expected: Vec<u8> = fragments.concat();
        prop_assert_eq!(data.opcode, opcode);
        prop_assert_eq!(&data.payload[..], &expected[..]);
        prop_assert_eq!(data.payload_len, expected.len() as u64);
        prop_assert!(!data.payload_truncated);
        if interleaved {
            prop_assert_eq!(messages[0].opcode, Opcode::Ping);
            prop_assert_eq!(&messages[0].payload[..], b"are you there");
        }
    }
}

#[test]
fn extended_lengths_decode() {
    let medium = vec![7u8; 300];
    let large = vec![9u8; 70_000];
    let mut wire = encode_frame(true, Opcode::Binary, &medium, None);
    wire.extend(encode_frame(true, Opcode::Binary, &large, Some([1, 2, 3, 4])));

    let messages = reassemble(&wire, 4096, 1 << 20);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].payload_len, 300);
    assert_eq!(&messages[1].payload[..], &large[..]);
}

#[test]
fn oversized_payload_is_counted_not_captured() {
    let payload = vec![b'x'; 64];
    let wire = encode_frame(true, Opcode::Text, &payload, Some([9, 9, 9, 9]));
    let messages = reassemble(&wire, 5, 16);

    assert_eq!(messages.len(), 1);
    assert!(messages[0].payload.is_empty());
    assert!(messages[0].payload_truncated);
    assert_eq!(messages[0].payload_len, 64);
}

#[test]
fn control_frame_rules_are_enforced() {
    let mut decoder = WebSocketFrameDecoder::new(1024);
    assert_eq!(
        decoder.decode(&encode_frame(false, Opcode::Ping, b"x", None)),
        Err(WebSocketError::FragmentedControlFrame(Opcode::Ping))
    );

    let mut decoder = WebSocketFrameDecoder::new(1024);
    let long = vec![0u8; 126];
    assert!(matches!(
        decoder.decode(&encode_frame(true, Opcode::Close, &long, None)),
        Err(WebSocketError::ControlFrameTooLong { .. })
    ));
}

#[test]
fn single_frame_messages_keep_compression_flag() {
    let frame = WebSocketFrame {
        fin: true,
        rsv1: true,
        rsv2: false,
        rsv3: false,
        opcode: Opcode::Text,
        mask: None,
        payload_len: 3,
        payload: Bytes::from_static(b"abc"),
        payload_truncated: false,
    };
    let session = Uuid::new_v4();
    let message = WebSocketMessage::from_frame(frame, session).expect("final data frame");

    // Per-message deflate: the payload is not readable text until inflated.
    assert!(message.compressed);
    assert_eq!(message.text(), None);
    assert_eq!(&message.payload[..], b"abc");
    assert_eq!(message.session_id, session);
    assert_ne!(message.id, session);
}
