//! Signed response round trips
//!
//! 1. Sign a body that splits into two full blocks and a short tail,
//!    stream it through the incremental verifier, and check corruption is
//!    caught at the right block.
//! 2. Serve a stored signed response over TCP with the peer server and
//!    fetch it back with the multi-peer reader.

use std::sync::Arc;

use cachecraft_cache::{
    sign_response, FetchEvent, HttpStore, InjectionMeta, MultiPeerReader, PeerServer,
    ResponseHead, Verifier, DEFAULT_BLOCK_SIZE,
};
use cachecraft_core::{Cancel, Error};
use cachecraft_crypto::SigningKeypair;

const URL: &str = "https://example.com/big.bin";
const GROUP: &str = "example.com";

fn make_signed(
    keypair: &SigningKeypair,
    body: &[u8],
) -> cachecraft_cache::SignedResponse {
    let mut head = ResponseHead::new(200);
    head.set_header("Content-Type", "application/octet-stream");
    head.set_header("Server", "origin/1.0");
    sign_response(
        &head,
        URL,
        body,
        keypair,
        &InjectionMeta::generate(1_700_000_000),
        DEFAULT_BLOCK_SIZE,
    )
    .unwrap()
}

// =============================================================================
// 1. Signer → verifier
// =============================================================================

#[test]
fn test_roundtrip_two_and_a_bit_blocks() {
    let keypair = SigningKeypair::generate();
    let body = vec![0x42u8; 131_076];
    let signed = make_signed(&keypair, &body);
    assert_eq!(signed.blocks.len(), 3);

    let mut verifier = Verifier::new(keypair.public_key_bytes());
    verifier.verify_head(&signed.head).unwrap();
    for block in &signed.blocks {
        verifier.verify_block(&block.data, &block.signature).unwrap();
    }
    verifier.finish(&signed.trailers()).unwrap();
}

#[test]
fn test_corrupting_final_byte_rejects_final_block() {
    let keypair = SigningKeypair::generate();
    let body = vec![0x42u8; 131_076];
    let mut signed = make_signed(&keypair, &body);
    *signed.blocks[2].data.last_mut().unwrap() ^= 0x01;

    let mut verifier = Verifier::new(keypair.public_key_bytes());
    verifier.verify_head(&signed.head).unwrap();
    verifier.verify_block(&signed.blocks[0].data, &signed.blocks[0].signature).unwrap();
    verifier.verify_block(&signed.blocks[1].data, &signed.blocks[1].signature).unwrap();
    let result = verifier.verify_block(&signed.blocks[2].data, &signed.blocks[2].signature);
    assert!(matches!(result, Err(Error::SignatureInvalid)));
}

// =============================================================================
// 2. Store → peer server → multi-peer reader
// =============================================================================

async fn store_signed(
    store: &Arc<HttpStore>,
    keypair: &SigningKeypair,
    signed: &cachecraft_cache::SignedResponse,
) {
    let mut verifier = Verifier::new(keypair.public_key_bytes());
    let verified = verifier.verify_head(&signed.head).unwrap();
    let mut writer = store.begin_write(URL, GROUP).await.unwrap().unwrap();
    writer.write_head(&verified.head).unwrap();
    for block in &signed.blocks {
        let receipt = verifier.verify_block(&block.data, &block.signature).unwrap();
        writer.append_block(&block.data, &receipt).unwrap();
    }
    verifier.finish(&signed.trailers()).unwrap();
    writer.commit(&signed.trailers()).unwrap();
}

#[tokio::test]
async fn test_fetch_from_peer_server() {
    let cancel = Cancel::new();
    let keypair = SigningKeypair::generate();
    let body: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let signed = make_signed(&keypair, &body);

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(HttpStore::open(dir.path(), 16).unwrap());
    store_signed(&store, &keypair, &signed).await;

    let server = PeerServer::start(store, "127.0.0.1:0".parse().unwrap(), &cancel)
        .await
        .unwrap();

    let reader = MultiPeerReader::new(keypair.public_key_bytes(), None);
    let mut response = reader
        .fetch(URL, GROUP, &[server.local_addr()], &cancel)
        .await
        .unwrap();
    assert_eq!(response.head.block_size, DEFAULT_BLOCK_SIZE);

    let mut fetched = Vec::new();
    let mut complete = false;
    while let Some(event) = response.events.recv().await {
        match event.unwrap() {
            FetchEvent::Block { data, .. } => fetched.extend_from_slice(&data),
            FetchEvent::Complete { .. } => {
                complete = true;
                break;
            }
        }
    }
    assert!(complete);
    assert_eq!(fetched, body);
    cancel.fire();
}

#[tokio::test]
async fn test_fetch_unknown_key_fails() {
    let cancel = Cancel::new();
    let keypair = SigningKeypair::generate();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(HttpStore::open(dir.path(), 16).unwrap());
    let server = PeerServer::start(store, "127.0.0.1:0".parse().unwrap(), &cancel)
        .await
        .unwrap();

    let reader = MultiPeerReader::new(keypair.public_key_bytes(), None);
    let result = reader
        .fetch("https://example.com/absent", GROUP, &[server.local_addr()], &cancel)
        .await;
    assert!(result.is_err());
    cancel.fire();
}

#[tokio::test]
async fn test_fetch_with_no_candidates_is_not_found() {
    let cancel = Cancel::new();
    let keypair = SigningKeypair::generate();
    let reader = MultiPeerReader::new(keypair.public_key_bytes(), None);
    let result = reader.fetch(URL, GROUP, &[], &cancel).await;
    assert!(matches!(result, Err(Error::NotFound)));
    cancel.fire();
}

#[tokio::test]
async fn test_fetch_rejects_peer_signed_with_other_key() {
    let cancel = Cancel::new();
    let signer = SigningKeypair::generate();
    let body = vec![1u8; 50_000];
    let signed = make_signed(&signer, &body);

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(HttpStore::open(dir.path(), 16).unwrap());
    store_signed(&store, &signer, &signed).await;
    let server = PeerServer::start(store, "127.0.0.1:0".parse().unwrap(), &cancel)
        .await
        .unwrap();

    // The reader trusts a different cache key.
    let other = SigningKeypair::generate();
    let reader = MultiPeerReader::new(other.public_key_bytes(), None);
    let result = reader.fetch(URL, GROUP, &[server.local_addr()], &cancel).await;
    assert!(result.is_err());
    cancel.fire();
}
