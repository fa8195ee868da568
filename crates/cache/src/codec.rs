//! Signing and verifying cache responses
//!
//! The signer turns a plain response into its signed form: canonical head
//! with `X-Ouinet-*` fields, body split into fixed-size blocks chained by
//! SHA-512, one Ed25519 signature per block, and a whole-response signature
//! over head, size and digest. The verifier consumes the same thing
//! incrementally and hands each block to its caller only after the block's
//! signature checked out; the first mismatch is final for the stream.

use cachecraft_core::{Error, Result};
use cachecraft_crypto::{sha256_digest, verify_detached, PublicKey, Signature, SigningKeypair};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::head::{field, ResponseHead, PROTOCOL_VERSION};
use crate::sign::{
    block_signable, chain_step, covered_fields, signing_string, BlockSigParams, SigParams,
};

/// Default body block size in bytes.
pub const DEFAULT_BLOCK_SIZE: u64 = 65536;

const ZERO_HASH: [u8; 64] = [0u8; 64];

/// The `X-Ouinet-Injection` value: a fresh id plus the injection time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionMeta {
    pub id: String,
    pub ts: u64,
}

impl InjectionMeta {
    pub fn generate(ts: u64) -> Self {
        Self { id: Uuid::new_v4().to_string(), ts }
    }

    pub fn format(&self) -> String {
        format!("id={},ts={}", self.id, self.ts)
    }

    pub fn parse(value: &str) -> Result<Self> {
        let mut id = None;
        let mut ts = None;
        for part in value.split(',') {
            match part.trim().split_once('=') {
                Some(("id", v)) => id = Some(v.to_string()),
                Some(("ts", v)) => {
                    ts = Some(v.parse().map_err(|_| Error::protocol("bad injection ts"))?)
                }
                _ => {}
            }
        }
        match (id, ts) {
            (Some(id), Some(ts)) => Ok(Self { id, ts }),
            _ => Err(Error::protocol("bad injection field")),
        }
    }
}

/// One verified body block as stored on disk and sent on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedBlock {
    /// Byte offset of the block start within the body.
    pub offset: u64,
    pub data: Vec<u8>,
    pub signature: Signature,
    /// Chain hash through this block.
    pub chain_hash: [u8; 64],
}

/// A completely signed response, ready to store or stream.
#[derive(Debug, Clone)]
pub struct SignedResponse {
    /// Canonical head including `X-Ouinet-BSigs` and `X-Ouinet-Sig0`.
    pub head: ResponseHead,
    pub blocks: Vec<SignedBlock>,
    pub data_size: u64,
    pub digest: [u8; 32],
    pub sig1: SigParams,
}

impl SignedResponse {
    pub fn block_size(&self) -> Result<u64> {
        let bsigs = self
            .head
            .header(field::BSIGS)
            .ok_or_else(|| Error::protocol("head lost its block-signature field"))?;
        Ok(BlockSigParams::parse(bsigs)?.block_size)
    }

    /// The trailer fields of the wire form.
    pub fn trailers(&self) -> Vec<(String, String)> {
        use base64::Engine;
        vec![
            (field::DATA_SIZE.to_string(), self.data_size.to_string()),
            (
                field::DIGEST.to_string(),
                format!(
                    "SHA-256={}",
                    base64::engine::general_purpose::STANDARD.encode(self.digest)
                ),
            ),
            (field::SIG1.to_string(), self.sig1.format()),
        ]
    }
}

/// Sign a complete response.
///
/// `uri` becomes `X-Ouinet-URI`; the head is canonicalized first, so hop-by-
/// hop fields never make it into the signature.
pub fn sign_response(
    raw_head: &ResponseHead,
    uri: &str,
    body: &[u8],
    keypair: &SigningKeypair,
    injection: &InjectionMeta,
    block_size: u64,
) -> Result<SignedResponse> {
    if block_size == 0 {
        return Err(Error::Config("zero block size".into()));
    }
    let key = keypair.public_key_bytes();

    let mut head = raw_head.clone();
    head.set_header(field::VERSION, PROTOCOL_VERSION.to_string());
    head.set_header(field::URI, uri);
    head.set_header(field::INJECTION, injection.format());
    let canonical = head.canonical();

    let covered = covered_fields(&canonical);
    let sig0 = SigParams {
        key,
        created: injection.ts,
        headers: covered.clone(),
        signature: keypair.sign(&signing_string(&canonical, injection.ts, &covered)),
    };

    let mut signed_head = canonical.clone();
    signed_head
        .headers
        .push((field::BSIGS.to_string(), BlockSigParams { key, block_size }.format()));
    signed_head.headers.push((field::SIG0.to_string(), sig0.format()));

    let mut blocks = Vec::new();
    let mut chain_hash = ZERO_HASH;
    let mut prev_sig: Option<Signature> = None;
    let mut offset = 0u64;
    for (index, data) in body.chunks(block_size as usize).enumerate() {
        chain_hash = chain_step(&chain_hash, prev_sig.as_ref(), data);
        let offset_end = offset + data.len() as u64;
        let signature = keypair.sign(&block_signable(&key, index as u64, offset_end, &chain_hash));
        blocks.push(SignedBlock { offset, data: data.to_vec(), signature, chain_hash });
        prev_sig = Some(signature);
        offset = offset_end;
    }

    let data_size = body.len() as u64;
    let digest = sha256_digest(body);
    let sig1 = {
        let mut head1 = canonical.clone();
        head1.headers.push((field::DATA_SIZE.to_string(), data_size.to_string()));
        head1.headers.push((field::DIGEST.to_string(), {
            use base64::Engine;
            format!("SHA-256={}", base64::engine::general_purpose::STANDARD.encode(digest))
        }));
        let covered = covered_fields(&head1);
        SigParams {
            key,
            created: injection.ts,
            headers: covered.clone(),
            signature: keypair.sign(&signing_string(&head1, injection.ts, &covered)),
        }
    };

    Ok(SignedResponse { head: signed_head, blocks, data_size, digest, sig1 })
}

/// A verified, accepted head plus what the body stream must look like.
#[derive(Debug, Clone)]
pub struct VerifiedHead {
    /// The head worth storing: canonical fields plus BSigs and Sig0.
    pub head: ResponseHead,
    pub block_size: u64,
    pub injection: InjectionMeta,
}

/// A verified block receipt (the caller already owns the data).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockReceipt {
    pub index: u64,
    /// Offset of the block start within the body.
    pub offset: u64,
    pub chain_hash: [u8; 64],
    pub signature: Signature,
}

enum VerifierPhase {
    Head,
    Blocks,
    Done,
}

/// Incremental verifier for one response stream.
///
/// Call order is fixed: `verify_head`, then `verify_block` for each block in
/// index order, then `finish` with the trailers. Any failure poisons the
/// verifier; blocks accepted before the failure were valid and may already
/// have been forwarded, which is fine: the consumer gets told to drop state
/// by the error itself.
pub struct Verifier {
    expected_key: PublicKey,
    phase: VerifierPhase,
    bsigs: Option<BlockSigParams>,
    canonical: Option<ResponseHead>,
    chain_hash: [u8; 64],
    prev_sig: Option<Signature>,
    next_index: u64,
    offset: u64,
    saw_short_block: bool,
    body_digest: Sha256,
}

impl Verifier {
    pub fn new(expected_key: PublicKey) -> Self {
        Self {
            expected_key,
            phase: VerifierPhase::Head,
            bsigs: None,
            canonical: None,
            chain_hash: ZERO_HASH,
            prev_sig: None,
            next_index: 0,
            offset: 0,
            saw_short_block: false,
            body_digest: Sha256::new(),
        }
    }

    pub fn block_size(&self) -> Option<u64> {
        self.bsigs.map(|b| b.block_size)
    }

    /// Step 1: the head. Checks `X-Ouinet-BSigs` and `X-Ouinet-Sig0`
    /// against the expected key.
    pub fn verify_head(&mut self, head: &ResponseHead) -> Result<VerifiedHead> {
        if !matches!(self.phase, VerifierPhase::Head) {
            return Err(Error::protocol("head after body"));
        }
        let bsigs = BlockSigParams::parse(
            head.header(field::BSIGS)
                .ok_or_else(|| Error::protocol("missing block-signature field"))?,
        )?;
        if bsigs.key != self.expected_key {
            return Err(Error::SignatureInvalid);
        }
        let sig0 = SigParams::parse(
            head.header(field::SIG0)
                .ok_or_else(|| Error::protocol("missing head signature"))?,
        )?;
        if sig0.key != self.expected_key {
            return Err(Error::SignatureInvalid);
        }
        let injection = InjectionMeta::parse(
            head.header(field::INJECTION)
                .ok_or_else(|| Error::protocol("missing injection field"))?,
        )?;

        let canonical = head.canonical();
        // The signature must commit to every canonical field; a shorter
        // covered list would let a peer smuggle unsigned fields.
        if sig0.headers != covered_fields(&canonical) {
            return Err(Error::SignatureInvalid);
        }
        let signable = signing_string(&canonical, sig0.created, &sig0.headers);
        if !verify_detached(&self.expected_key, &signable, &sig0.signature) {
            return Err(Error::SignatureInvalid);
        }

        let mut stored_head = canonical.clone();
        stored_head.headers.push((field::BSIGS.to_string(), bsigs.format()));
        stored_head.headers.push((field::SIG0.to_string(), sig0.format()));

        self.bsigs = Some(bsigs);
        self.canonical = Some(canonical);
        self.phase = VerifierPhase::Blocks;
        Ok(VerifiedHead { head: stored_head, block_size: bsigs.block_size, injection })
    }

    /// Step 2, repeated: one block and its chunk-extension signature, in
    /// strict index order.
    pub fn verify_block(&mut self, data: &[u8], signature: &Signature) -> Result<BlockReceipt> {
        if !matches!(self.phase, VerifierPhase::Blocks) {
            return Err(Error::protocol("block outside body"));
        }
        let block_size = self.bsigs.expect("set when entering Blocks").block_size;
        if data.len() as u64 > block_size {
            return Err(Error::protocol("oversized block"));
        }
        if self.saw_short_block {
            return Err(Error::protocol("data after the final short block"));
        }
        if (data.len() as u64) < block_size {
            self.saw_short_block = true;
        }

        let chain_hash = chain_step(&self.chain_hash, self.prev_sig.as_ref(), data);
        let offset_end = self.offset + data.len() as u64;
        let signable =
            block_signable(&self.expected_key, self.next_index, offset_end, &chain_hash);
        if !verify_detached(&self.expected_key, &signable, signature) {
            self.phase = VerifierPhase::Done;
            return Err(Error::SignatureInvalid);
        }

        let receipt = BlockReceipt {
            index: self.next_index,
            offset: self.offset,
            chain_hash,
            signature: *signature,
        };
        self.chain_hash = chain_hash;
        self.prev_sig = Some(*signature);
        self.offset = offset_end;
        self.next_index += 1;
        self.body_digest.update(data);
        Ok(receipt)
    }

    /// Step 3: the trailers. Checks size, digest and `X-Ouinet-Sig1`.
    pub fn finish(&mut self, trailers: &[(String, String)]) -> Result<()> {
        if !matches!(self.phase, VerifierPhase::Blocks) {
            return Err(Error::protocol("trailer outside body"));
        }
        let lookup = |name: &str| {
            trailers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        };
        let data_size: u64 = lookup(field::DATA_SIZE)
            .ok_or_else(|| Error::protocol("missing data-size trailer"))?
            .parse()
            .map_err(|_| Error::protocol("bad data-size trailer"))?;
        if data_size != self.offset {
            return Err(Error::SignatureInvalid);
        }
        let digest_value =
            lookup(field::DIGEST).ok_or_else(|| Error::protocol("missing digest trailer"))?;
        let digest: [u8; 32] = {
            use base64::Engine;
            digest_value
                .strip_prefix("SHA-256=")
                .and_then(|b64| base64::engine::general_purpose::STANDARD.decode(b64).ok())
                .and_then(|raw| raw.try_into().ok())
                .ok_or_else(|| Error::protocol("bad digest trailer"))?
        };
        let computed: [u8; 32] = self.body_digest.clone().finalize().into();
        if digest != computed {
            return Err(Error::SignatureInvalid);
        }

        let sig1 = SigParams::parse(
            lookup(field::SIG1).ok_or_else(|| Error::protocol("missing final signature"))?,
        )?;
        if sig1.key != self.expected_key {
            return Err(Error::SignatureInvalid);
        }
        let mut head1 = self.canonical.clone().expect("set when entering Blocks");
        head1.headers.push((field::DATA_SIZE.to_string(), data_size.to_string()));
        head1.headers.push((field::DIGEST.to_string(), digest_value.to_string()));
        if sig1.headers != covered_fields(&head1) {
            return Err(Error::SignatureInvalid);
        }
        let signable = signing_string(&head1, sig1.created, &sig1.headers);
        if !verify_detached(&self.expected_key, &signable, &sig1.signature) {
            return Err(Error::SignatureInvalid);
        }
        self.phase = VerifierPhase::Done;
        Ok(())
    }
}
