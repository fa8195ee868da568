//! Multi-peer race behavior
//!
//! Simulated peers serve scripted wire bytes so the race is controlled:
//! 1. A fast peer that corrupts block 1 wins the head race, delivers block
//!    0, then the reader switches to the slow honest peer without
//!    re-emitting block 0.
//! 2. Byzantine peers corrupting block 3 never get a corrupted block to
//!    the consumer; the honest peer completes the fetch.

use std::net::SocketAddr;
use std::time::Duration;

use cachecraft_cache::{
    session::write_part, sign_response, FetchEvent, InjectionMeta, MultiPeerReader, Part,
    ResponseHead, SignedResponse, DEFAULT_BLOCK_SIZE,
};
use cachecraft_core::Cancel;
use cachecraft_crypto::SigningKeypair;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const URL: &str = "https://example.com/contested.bin";
const GROUP: &str = "example.com";

enum Segment {
    Bytes(Vec<u8>),
    Delay(Duration),
}

/// Serve the scripted segments to every connection, after draining the
/// request head.
async fn scripted_peer(segments: Vec<Segment>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let segments: std::sync::Arc<Vec<Segment>> = std::sync::Arc::new(segments);
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { return };
            let segments = segments.clone();
            tokio::spawn(async move {
                // Drain the request until the blank line.
                let mut buf = Vec::new();
                let mut byte = [0u8; 1];
                while !buf.ends_with(b"\r\n\r\n") {
                    if stream.read_exact(&mut byte).await.is_err() {
                        return;
                    }
                    buf.push(byte[0]);
                }
                for segment in segments.iter() {
                    match segment {
                        Segment::Bytes(bytes) => {
                            if stream.write_all(bytes).await.is_err() {
                                return;
                            }
                        }
                        Segment::Delay(d) => tokio::time::sleep(*d).await,
                    }
                }
                let _ = stream.flush().await;
            });
        }
    });
    addr
}

/// Wire-encode a signed response; `corrupt_block` flips a byte inside that
/// block's chunk body, `block_delay` sleeps before each data chunk.
async fn wire_script(
    signed: &SignedResponse,
    corrupt_block: Option<usize>,
    block_delay: Duration,
) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut head = signed.head.clone();
    head.set_header("Transfer-Encoding", "chunked");
    let mut bytes = Vec::new();
    write_part(&mut bytes, &Part::Head(head)).await.unwrap();
    segments.push(Segment::Bytes(bytes));

    for (i, block) in signed.blocks.iter().enumerate() {
        if !block_delay.is_zero() {
            segments.push(Segment::Delay(block_delay));
        }
        let mut data = block.data.clone();
        if corrupt_block == Some(i) {
            data[0] ^= 0xff;
        }
        let mut bytes = Vec::new();
        write_part(
            &mut bytes,
            &Part::ChunkHeader { size: data.len() as u64, signature: Some(block.signature) },
        )
        .await
        .unwrap();
        write_part(&mut bytes, &Part::ChunkBody(data)).await.unwrap();
        segments.push(Segment::Bytes(bytes));
    }

    let mut bytes = Vec::new();
    write_part(&mut bytes, &Part::ChunkHeader { size: 0, signature: None }).await.unwrap();
    write_part(&mut bytes, &Part::Trailer(signed.trailers())).await.unwrap();
    segments.push(Segment::Bytes(bytes));
    segments
}

fn make_signed(keypair: &SigningKeypair, blocks: usize) -> (SignedResponse, Vec<u8>) {
    let body: Vec<u8> = (0..blocks * DEFAULT_BLOCK_SIZE as usize)
        .map(|i| (i % 249) as u8)
        .collect();
    let signed = sign_response(
        &ResponseHead::new(200),
        URL,
        &body,
        keypair,
        &InjectionMeta::generate(1_700_000_000),
        DEFAULT_BLOCK_SIZE,
    )
    .unwrap();
    (signed, body)
}

/// Drive a fetch to completion, asserting strict block order with no
/// duplicates, and return the reassembled body.
async fn collect_blocks(
    reader: &MultiPeerReader,
    peers: &[SocketAddr],
    cancel: &Cancel,
) -> Vec<u8> {
    let mut response = reader.fetch(URL, GROUP, peers, cancel).await.unwrap();
    let mut body = Vec::new();
    let mut expected_index = 0u64;
    loop {
        match response.events.recv().await.expect("stream must finish").unwrap() {
            FetchEvent::Block { index, data, .. } => {
                assert_eq!(index, expected_index, "blocks must arrive in order, once each");
                expected_index += 1;
                body.extend_from_slice(&data);
            }
            FetchEvent::Complete { .. } => return body,
        }
    }
}

#[tokio::test]
async fn test_switch_to_honest_peer_without_reemitting() {
    let cancel = Cancel::new();
    let keypair = SigningKeypair::generate();
    let (signed, body) = make_signed(&keypair, 4);

    // Fast peer: instant, but block 1 is corrupted.
    let fast = scripted_peer(wire_script(&signed, Some(1), Duration::ZERO).await).await;
    // Honest peer: 200 ms per block.
    let honest =
        scripted_peer(wire_script(&signed, None, Duration::from_millis(200)).await).await;

    let reader = MultiPeerReader::new(keypair.public_key_bytes(), None);
    let fetched = collect_blocks(&reader, &[fast, honest], &cancel).await;
    assert_eq!(fetched, body);
    cancel.fire();
}

#[tokio::test]
async fn test_byzantine_majority_does_not_corrupt_output() {
    let cancel = Cancel::new();
    let keypair = SigningKeypair::generate();
    let (signed, body) = make_signed(&keypair, 5);

    // Two Byzantine peers corrupt block 3; one honest peer is slow.
    let bad1 = scripted_peer(wire_script(&signed, Some(3), Duration::ZERO).await).await;
    let bad2 = scripted_peer(wire_script(&signed, Some(3), Duration::from_millis(10)).await).await;
    let honest =
        scripted_peer(wire_script(&signed, None, Duration::from_millis(100)).await).await;

    let reader = MultiPeerReader::new(keypair.public_key_bytes(), None);
    let fetched = collect_blocks(&reader, &[bad1, bad2, honest], &cancel).await;
    assert_eq!(fetched, body, "corrupted bytes must never reach the consumer");
    cancel.fire();
}

#[tokio::test]
async fn test_all_peers_failing_surfaces_error() {
    let cancel = Cancel::new();
    let keypair = SigningKeypair::generate();
    let (signed, _) = make_signed(&keypair, 3);

    let bad1 = scripted_peer(wire_script(&signed, Some(0), Duration::ZERO).await).await;
    let bad2 = scripted_peer(wire_script(&signed, Some(0), Duration::ZERO).await).await;

    let reader = MultiPeerReader::new(keypair.public_key_bytes(), None);
    let mut response = reader.fetch(URL, GROUP, &[bad1, bad2], &cancel).await.unwrap();
    let mut saw_error = false;
    while let Some(event) = response.events.recv().await {
        match event {
            Ok(FetchEvent::Complete { .. }) => panic!("corrupt-only swarm must not complete"),
            Ok(FetchEvent::Block { .. }) => {}
            Err(_) => {
                saw_error = true;
                break;
            }
        }
    }
    assert!(saw_error);
    cancel.fire();
}

#[tokio::test]
async fn test_fetch_cancellation_is_prompt() {
    let cancel = Cancel::new();
    let keypair = SigningKeypair::generate();
    let (signed, _) = make_signed(&keypair, 4);

    // A peer that stalls forever after the head.
    let mut segments = wire_script(&signed, None, Duration::ZERO).await;
    segments.insert(1, Segment::Delay(Duration::from_secs(3600)));
    let stalling = scripted_peer(segments).await;

    let reader = MultiPeerReader::new(keypair.public_key_bytes(), None);
    let fetch_cancel = cancel.child();
    let mut response = reader.fetch(URL, GROUP, &[stalling], &fetch_cancel).await.unwrap();
    fetch_cancel.fire();

    let outcome = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(event) = response.events.recv().await {
            if event.is_err() {
                return;
            }
        }
    })
    .await;
    assert!(outcome.is_ok(), "cancellation must drain the stream promptly");
    cancel.fire();
}
