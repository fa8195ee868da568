//! HTTP store atomicity and eviction
//!
//! 1. A write interrupted before the final rename leaves the key absent
//!    after reopening the store.
//! 2. The same write run to completion leaves the key present and
//!    readable.
//! 3. LRU eviction keeps exactly the most recently inserted/touched keys.

use std::sync::Arc;

use cachecraft_cache::{
    sign_response, HttpStore, InjectionMeta, ResponseHead, Verifier, DEFAULT_BLOCK_SIZE,
};
use cachecraft_core::Error;
use cachecraft_crypto::SigningKeypair;

const GROUP: &str = "example.com";

fn signed_for(
    keypair: &SigningKeypair,
    url: &str,
    body: &[u8],
) -> cachecraft_cache::SignedResponse {
    sign_response(
        &ResponseHead::new(200),
        url,
        body,
        keypair,
        &InjectionMeta::generate(1_700_000_000),
        DEFAULT_BLOCK_SIZE,
    )
    .unwrap()
}

async fn commit_signed(store: &Arc<HttpStore>, keypair: &SigningKeypair, url: &str, body: &[u8]) {
    let signed = signed_for(keypair, url, body);
    let mut verifier = Verifier::new(keypair.public_key_bytes());
    let verified = verifier.verify_head(&signed.head).unwrap();
    let mut writer = store.begin_write(url, GROUP).await.unwrap().unwrap();
    writer.write_head(&verified.head).unwrap();
    for block in &signed.blocks {
        let receipt = verifier.verify_block(&block.data, &block.signature).unwrap();
        writer.append_block(&block.data, &receipt).unwrap();
    }
    writer.commit(&signed.trailers()).unwrap();
}

// =============================================================================
// 1 + 2. Atomic commit
// =============================================================================

#[tokio::test]
async fn test_interrupted_write_leaves_key_absent() {
    let url = "https://example.com/three-blocks";
    let keypair = SigningKeypair::generate();
    let body = vec![9u8; 3 * DEFAULT_BLOCK_SIZE as usize];
    let dir = tempfile::tempdir().unwrap();

    {
        let store = Arc::new(HttpStore::open(dir.path(), 8).unwrap());
        let signed = signed_for(&keypair, url, &body);
        let mut verifier = Verifier::new(keypair.public_key_bytes());
        let verified = verifier.verify_head(&signed.head).unwrap();
        let mut writer = store.begin_write(url, GROUP).await.unwrap().unwrap();
        writer.write_head(&verified.head).unwrap();
        // All of the body lands in the temp directory, but the write is
        // abandoned before the rename.
        for block in &signed.blocks {
            let receipt = verifier.verify_block(&block.data, &block.signature).unwrap();
            writer.append_block(&block.data, &receipt).unwrap();
        }
        drop(writer);
        assert!(matches!(store.read(url), Err(Error::NotFound)));
    }

    // A fresh open after the "crash" sees nothing either.
    let store = Arc::new(HttpStore::open(dir.path(), 8).unwrap());
    assert!(matches!(store.read(url), Err(Error::NotFound)));
    assert_eq!(store.len(), 0);

    // Re-run without interruption: present and readable.
    commit_signed(&store, &keypair, url, &body).await;
    let mut entry = store.read(url).unwrap();
    assert_eq!(entry.data_size, body.len() as u64);
    assert_eq!(entry.block_count(), 3);
    entry.verify_chain().unwrap();
}

// =============================================================================
// 3. LRU eviction
// =============================================================================

#[tokio::test]
async fn test_eviction_keeps_c_most_recent() {
    let capacity = 3;
    let keypair = SigningKeypair::generate();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(HttpStore::open(dir.path(), capacity).unwrap());

    for i in 0..7 {
        let url = format!("https://example.com/{i}");
        commit_signed(&store, &keypair, &url, b"body").await;
        std::thread::sleep(std::time::Duration::from_millis(2));
        // Touch an early survivor so recency, not insertion order, decides.
        if i == 4 {
            let _ = store.read("https://example.com/3");
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
    }

    assert_eq!(store.len(), capacity);
    assert!(store.contains("https://example.com/3"), "touched entry must survive");
    assert!(store.contains("https://example.com/6"));
    assert!(!store.contains("https://example.com/0"));
    assert!(!store.contains("https://example.com/1"));

    // The group index agrees with the store.
    let urls = store.group_index().urls(GROUP);
    assert_eq!(urls.len(), capacity);
    assert!(urls.iter().any(|u| u.ends_with("/3")));
}

#[tokio::test]
async fn test_purge_group_removes_everything() {
    let keypair = SigningKeypair::generate();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(HttpStore::open(dir.path(), 8).unwrap());

    commit_signed(&store, &keypair, "https://example.com/a", b"a").await;
    commit_signed(&store, &keypair, "https://example.com/b", b"b").await;

    let removed = store.purge_group(GROUP).unwrap();
    assert_eq!(removed, 2);
    assert!(!store.contains("https://example.com/a"));
    assert!(store.group_index().groups().is_empty());
}

#[tokio::test]
async fn test_store_survives_reload() {
    let url = "https://example.com/persist";
    let keypair = SigningKeypair::generate();
    let dir = tempfile::tempdir().unwrap();
    let body = vec![7u8; 70_000];

    {
        let store = Arc::new(HttpStore::open(dir.path(), 8).unwrap());
        commit_signed(&store, &keypair, url, &body).await;
    }

    let store = Arc::new(HttpStore::open(dir.path(), 8).unwrap());
    assert_eq!(store.len(), 1);
    let mut entry = store.read(url).unwrap();
    assert_eq!(entry.data_size, body.len() as u64);
    let block = entry.read_block(0).unwrap().unwrap();
    assert_eq!(block.data.len() as u64, DEFAULT_BLOCK_SIZE);
    assert_eq!(store.group_index().urls(GROUP), vec![url.to_string()]);
}
