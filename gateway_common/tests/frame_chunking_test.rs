//! Chunk-boundary independence of the frame decoder.
//!
//! However a byte sequence is split into chunks, the decoder must yield the
//! same ordered frames, and every frame must decode to the same message.

use bytes::BytesMut;
use futures::StreamExt;
use gateway_common::{FrameDecoder, Message};
use tokio::io::AsyncWriteExt;
use tokio_util::codec::{Decoder, FramedRead};

const STREAM: &[u8] = b"{\"jsonrpc\":\"2.0\",\"method\":\"ping\"}\n\
\r\n\
{\"jsonrpc\":\"2.0\",\"id\":7,\"method\":\"foo\",\"params\":{\"s\":\"caf\xc3\xa9\"}}\r\n\
\x20\x20\t\n\
{\"jsonrpc\":\"2.0\",\"id\":\"x\",\"result\":{\"ok\":true}}\n";

fn decode_chunks(chunks: &[&[u8]]) -> Vec<String> {
    let mut decoder = FrameDecoder::new();
    let mut buf = BytesMut::new();
    let mut frames = Vec::new();
    for chunk in chunks {
        buf.extend_from_slice(chunk);
        while let Some(frame) = decoder.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
    }
    while let Some(frame) = decoder.decode_eof(&mut buf).unwrap() {
        frames.push(frame);
    }
    frames
}

fn expected() -> Vec<String> {
    decode_chunks(&[STREAM])
}

#[test]
fn whole_stream_yields_three_frames() {
    let frames = expected();
    assert_eq!(frames.len(), 3);
    let messages: Vec<Message> = frames.iter().map(|f| Message::decode(f).unwrap()).collect();
    assert!(matches!(messages[0], Message::Notification(_)));
    assert!(matches!(messages[1], Message::Request(_)));
    assert!(matches!(messages[2], Message::Response(_)));
}

#[test]
fn every_single_split_point_yields_same_frames() {
    let expected = expected();
    for split in 0..=STREAM.len() {
        let (a, b) = STREAM.split_at(split);
        assert_eq!(decode_chunks(&[a, b]), expected, "split at {}", split);
    }
}

#[test]
fn every_pair_of_split_points_yields_same_frames() {
    let expected = expected();
    for first in 0..=STREAM.len() {
        for second in first..=STREAM.len() {
            let chunks = [
                &STREAM[..first],
                &STREAM[first..second],
                &STREAM[second..],
            ];
            assert_eq!(
                decode_chunks(&chunks),
                expected,
                "splits at {} and {}",
                first,
                second
            );
        }
    }
}

#[test]
fn byte_at_a_time_yields_same_frames() {
    let chunks: Vec<&[u8]> = STREAM.chunks(1).collect();
    assert_eq!(decode_chunks(&chunks), expected());
}

#[tokio::test]
async fn framed_read_over_async_pipe() {
    let (mut writer, reader) = tokio::io::duplex(16);
    let mut frames = FramedRead::new(reader, FrameDecoder::new());

    tokio::spawn(async move {
        for chunk in STREAM.chunks(5) {
            writer.write_all(chunk).await.unwrap();
        }
        // Dropping the writer ends the stream
    });

    let mut collected = Vec::new();
    while let Some(frame) = frames.next().await {
        collected.push(frame.unwrap());
    }
    assert_eq!(collected, expected());
}
