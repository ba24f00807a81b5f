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


use http::{Method, StatusCode};
use intercept_proxy::http::{
    BodyBuffer, ChunkedBodyDecoder, HttpMessage, HttpMessageReader, ReaderEvent,
};
use proptest::prelude::*;

/// Pushes `wire` through `reader` in pieces whose sizes cycle through `cuts`, keeping
/// unconsumed bytes around the way a connection's read buffer does.
fn drive(reader: &mut HttpMessageReader, wire: &[u8], cuts: &[usize]) -> Vec<HttpMessage> {
    let mut pending = Vec::new();
    let mut messages = Vec::new();
    let mut offset = 0;
    let mut cut = cuts.iter().cycle();

    while offset < wire.len() {
        let step = (*cut.next().unwrap_or(&1)).max(1);
        let end = (offset + step).min(wire.len());
        pending.extend_from_slice(&wire[offset..end]);
        offset = end;

        loop {
            let progress = reader.feed(&pending).expect("well-formed wire");
            pending.drain(..progress.consumed);
            match progress.event {
                Some(ReaderEvent::Complete(message)) => messages.push(message),
                Some(_) => {}
                None if progress.consumed == 0 => break,
                None => {}
            }
        }
    }
    messages
}

#[derive(Debug, Clone)]
struct RequestCase {
    method: &'static str,
    path: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    chunk: Option<usize>,
}

impl RequestCase {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", self.method, self.path).as_bytes());
        out.extend_from_slice(b"Host: example.test\r\n");
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        match self.chunk {
            Some(size) => {
                out.extend_from_slice(b"Transfer-Encoding: chunked\r\n\r\n");
                for piece in self.body.chunks(size) {
                    out.extend_from_slice(format!("{:x}\r\n", piece.len()).as_bytes());
                    out.extend_from_slice(piece);
                    out.extend_from_slice(b"\r\n");
                }
                out.extend_from_slice(b"0\r\n\r\n");
            }
            None => {
                out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", self.body.len()).as_bytes());
                out.extend_from_slice(&self.body);
            }
        }
    }
}

fn request_case() -> impl Strategy<Value = RequestCase> {
    (
        prop::sample::select(vec!["GET", "POST", "PUT", "DELETE"]),
        "/[a-z0-9/]{0,12}",
        prop::collection::vec(("X-[A-Za-z]{1,10}", "[A-Za-z0-9;=/.]{0,24}"), 0..5),
        prop::collection::vec(any::<u8>(), 0..96),
        prop::option::of(1usize..17),
    )
        .prop_map(|(method, path, headers, body, chunk)| RequestCase {
            method,
            path,
            headers,
            body,
            chunk,
        })
}

proptest! {
    #[test]
    fn pipelined_requests_parse_the_same_under_any_split(
        cases in prop::collection::vec(request_case(), 1..4),
        cuts in prop::collection::vec(1usize..40, 1..16),
    ) {
        let mut wire = Vec::new();
        for case in &cases {
            case.encode(&mut wire);
        }

        let whole = drive(&mut HttpMessageReader::requests(4096, 8192), &wire, &[wire.len()]);
        prop_assert_eq!(whole.len(), cases.len());
        for (message, case) in whole.iter().zip(&cases) {
            let line = message.request_line().expect("request line");
            prop_assert_eq!(line.method.as_str(), case.method);
            prop_assert_eq!(&message.body[..], &case.body[..]);
            prop_assert_eq!(message.body_len, case.body.len() as u64);
        }

        let split = drive(&mut HttpMessageReader::requests(4096, 8192), &wire, &cuts);
        prop_assert_eq!(split, whole);
    }

    #[test]
    fn chunked_payload_survives_any_chunking_and_split(
        payload in prop::collection::vec(any::<u8>(), 0..256),
        chunk in 1usize..64,
        step in 1usize..32,
    ) {
        let mut wire = Vec::new();
        for piece in payload.chunks(chunk) {
            wire.extend_from_slice(format!("{:X};ext=1\r\n", piece.len()).as_bytes());
            wire.extend_from_slice(piece);
            wire.extend_from_slice(b"\r\n");
        }
        wire.extend_from_slice(b"0\r\nX-Checksum: ok\r\n\r\nNEXT");

        let mut decoder = ChunkedBodyDecoder::new(1024);
        let mut body = BodyBuffer::with_limit(4096);
        let mut offset = 0;
        while offset < wire.len() && !decoder.is_done() {
            let segment = &wire[offset..(offset + step).min(wire.len())];
            let progress = decoder.feed(segment, &mut body).expect("valid chunked body");
            if progress.consumed < segment.len() {
                prop_assert!(progress.done);
            }
            offset += progress.consumed;
        }

        prop_assert!(decoder.is_done());
        prop_assert_eq!(body.as_bytes(), &payload[..]);
        prop_assert_eq!(&wire[offset..], b"NEXT");
        let trailers = decoder.take_trailers();
        prop_assert_eq!(trailers.get("x-checksum"), Some("ok"));
    }
}

#[test]
fn pipelined_responses_follow_request_methods() {
    let mut reader = HttpMessageReader::responses(1024, 8192);
    reader.expect_response_to(&Method::HEAD);
    reader.expect_response_to(&Method::GET);

    let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n\
HTTP/1.1 404 Not Found\r\nContent-Length: 4\r\n\r\ngone";
    let messages = drive(&mut reader, wire, &[3]);

    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].body_len, 0);
    assert_eq!(messages[0].headers.content_length().unwrap(), Some(5));
    let second = messages[1].status_line().expect("status line");
    assert_eq!(second.status, StatusCode::NOT_FOUND);
    assert_eq!(second.reason, "Not Found");
    assert_eq!(&messages[1].body[..], b"gone");
    assert!(reader.is_idle());
}

#[test]
fn switching_protocols_has_no_body() {
    let mut reader = HttpMessageReader::responses(1024, 8192);
    reader.expect_response_to(&Method::GET);
    let wire = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n\x81\x02hi";

    let progress = reader.feed(wire).unwrap();
    assert_eq!(progress.event, Some(ReaderEvent::HeadComplete));
    let done = reader.feed(&wire[progress.consumed..]).unwrap();
    assert_eq!(done.consumed, 0);
    let Some(ReaderEvent::Complete(message)) = done.event else {
        panic!("101 should complete without a body");
    };
    assert_eq!(message.status_line().unwrap().status, StatusCode::SWITCHING_PROTOCOLS);
    assert_eq!(&wire[progress.consumed..], b"\x81\x02hi");
}

#[test]
fn keep_alive_follows_version_and_connection_header() {
    let parse = |wire: &[u8]| {
        let mut reader = HttpMessageReader::requests(1024, 8192);
        drive(&mut reader, wire, &[wire.len()]).remove(0)
    };

    assert!(parse(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n").keep_alive());
    assert!(!parse(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").keep_alive());
    assert!(!parse(b"GET / HTTP/1.0\r\n\r\n").keep_alive());
    assert!(parse(b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n").keep_alive());
}
