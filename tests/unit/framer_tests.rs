//! Unit tests for newline framing over chunked byte streams.
//!
//! Covers split-point independence, malformed-line recovery, noise
//! skipping, concatenated values and end-of-stream flushing.

use agent_conduit::protocol::Framer;
use agent_conduit::SdkError;
use serde_json::{json, Value};

fn feed_all(framer: &mut Framer, chunks: &[&[u8]]) -> Vec<Value> {
    let mut out = Vec::new();
    for chunk in chunks {
        for frame in framer.feed(chunk) {
            out.push(frame.expect("valid frame"));
        }
    }
    for frame in framer.finish() {
        out.push(frame.expect("valid frame"));
    }
    out
}

// ── Split independence ──────────────────────────────────────────────────────

/// Every chunk size from one byte up to the whole input yields the same
/// documents in the same order.
#[test]
fn any_chunk_size_yields_identical_documents() {
    let wire = concat!(
        "{\"id\":1,\"result\":\"ok\"}\n",
        "{\"type\":\"assistant\",\"message\":{\"content\":\"héllo wörld\"}}\n",
        "{\"method\":\"progress\",\"params\":{\"pct\":50}}\n",
        "[1,2,3]\n",
    )
    .as_bytes();

    let expected = vec![
        json!({"id": 1, "result": "ok"}),
        json!({"type": "assistant", "message": {"content": "héllo wörld"}}),
        json!({"method": "progress", "params": {"pct": 50}}),
        json!([1, 2, 3]),
    ];

    for size in 1..=wire.len() {
        let chunks: Vec<&[u8]> = wire.chunks(size).collect();
        let mut framer = Framer::new("stdout");
        assert_eq!(
            feed_all(&mut framer, &chunks),
            expected,
            "chunk size {size} changed the framed output"
        );
        assert_eq!(framer.buffered(), 0);
    }
}

/// Two-way splits at every offset, including inside multi-byte UTF-8.
#[test]
fn every_two_way_split_point_is_lossless() {
    let wire = "{\"text\":\"日本語\"}\n{\"n\":2}\n".as_bytes();
    for cut in 0..=wire.len() {
        let (head, tail) = wire.split_at(cut);
        let mut framer = Framer::new("stdout");
        let out = feed_all(&mut framer, &[head, tail]);
        assert_eq!(out, vec![json!({"text": "日本語"}), json!({"n": 2})], "cut at {cut}");
    }
}

// ── Malformed input ─────────────────────────────────────────────────────────

/// A malformed line surfaces as a decode error and later lines still decode.
#[test]
fn malformed_line_does_not_stop_framing() {
    let mut framer = Framer::new("stdout");
    let frames: Vec<_> = framer
        .feed(b"{\"a\":1}\n{\"broken\": \n{\"b\":2}\n")
        .collect();

    assert_eq!(frames.len(), 3);
    assert_eq!(*frames[0].as_ref().expect("first"), json!({"a": 1}));
    match &frames[1] {
        Err(SdkError::Decode { stream, raw, .. }) => {
            assert_eq!(stream, "stdout");
            assert_eq!(raw, "{\"broken\":");
        }
        other => panic!("expected decode error, got {other:?}"),
    }
    assert_eq!(*frames[2].as_ref().expect("third"), json!({"b": 2}));
}

/// Invalid UTF-8 inside a JSON line is a decode error, not silently
/// replaced, and the next line still decodes.
#[test]
fn invalid_utf8_is_a_decode_error() {
    let mut framer = Framer::new("stdout");
    let frames: Vec<_> = framer
        .feed(b"{\"a\":\"\xff\xfe\"}\n{\"b\":2}\n")
        .collect();

    assert_eq!(frames.len(), 2);
    match &frames[0] {
        Err(SdkError::Decode { stream, reason, .. }) => {
            assert_eq!(stream, "stdout");
            assert!(reason.contains("UTF-8"), "reason was {reason:?}");
        }
        other => panic!("expected decode error, got {other:?}"),
    }
    assert_eq!(*frames[1].as_ref().expect("second"), json!({"b": 2}));
}

/// Stray log output and blank lines are skipped without error.
#[test]
fn noise_and_blank_lines_are_skipped() {
    let mut framer = Framer::new("stdout");
    let out = feed_all(
        &mut framer,
        &[b"Loading model...\n\n   \r\n{\"ok\":true}\r\nWARN: slow disk\n"],
    );
    assert_eq!(out, vec![json!({"ok": true})]);
}

// ── Concatenated values and end of stream ───────────────────────────────────

/// Back-to-back values on one line are split into separate messages.
#[test]
fn concatenated_values_on_one_line_are_split() {
    let mut framer = Framer::new("http:response");
    let out = feed_all(&mut framer, &[b"{\"a\":1}{\"b\":2} {\"c\":3}\n"]);
    assert_eq!(out, vec![json!({"a": 1}), json!({"b": 2}), json!({"c": 3})]);
}

/// An unterminated trailing document is only emitted by `finish`.
#[test]
fn unterminated_tail_is_flushed_by_finish() {
    let mut framer = Framer::new("http:response");
    assert_eq!(framer.feed(b"{\"id\":5,\"result\":null}").count(), 0);
    assert!(framer.buffered() > 0);

    let tail: Vec<_> = framer.finish().collect();
    assert_eq!(tail.len(), 1);
    assert_eq!(
        *tail[0].as_ref().expect("tail"),
        json!({"id": 5, "result": null})
    );
    assert_eq!(framer.buffered(), 0);
}

/// An oversized line is reported once and framing resumes after it.
#[test]
fn oversized_line_is_reported_then_skipped() {
    let mut framer = Framer::with_max_line_bytes("stdout", 16);
    let mut frames: Vec<_> = framer.feed(&[b'x'; 40]).collect();
    frames.extend(framer.feed(b"yyyy\n{\"ok\":1}\n").collect::<Vec<_>>());

    assert_eq!(frames.len(), 2);
    match &frames[0] {
        Err(SdkError::Decode { reason, .. }) => assert!(reason.contains("line too long")),
        other => panic!("expected oversize error, got {other:?}"),
    }
    assert_eq!(*frames[1].as_ref().expect("resumed"), json!({"ok": 1}));
}

/// `reset` drops everything buffered.
#[test]
fn reset_discards_partial_input() {
    let mut framer = Framer::new("stdout");
    assert_eq!(framer.feed(b"{\"half\":").count(), 0);
    framer.reset();
    assert_eq!(framer.buffered(), 0);
    assert_eq!(feed_all(&mut framer, &[b"{\"whole\":1}\n"]), vec![json!({"whole": 1})]);
}
