//! Signature header grammar and signing strings
//!
//! `X-Ouinet-Sig0`/`Sig1` carry HTTP-Message-Signatures-style parameter
//! lists; the signing string puts each covered field on its own
//! LF-terminated line with pseudo-fields in parentheses, no trailing LF.
//! `X-Ouinet-BSigs` announces the block-signature key and block size.

use base64::Engine;
use cachecraft_core::{Error, Result};
use cachecraft_crypto::{format_key_tag, parse_key_tag, sha512_digest, PublicKey, Signature};

use crate::head::ResponseHead;

/// The algorithm label: key-determined, per HTTP Message Signatures.
pub const ALGORITHM: &str = "hs2019";

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Parsed `X-Ouinet-Sig0`/`Sig1` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigParams {
    pub key: PublicKey,
    pub created: u64,
    /// Space-separated covered-field list, pseudo-fields included.
    pub headers: Vec<String>,
    pub signature: Signature,
}

impl SigParams {
    pub fn format(&self) -> String {
        format!(
            "keyId=\"{}\",algorithm=\"{}\",created={},headers=\"{}\",signature=\"{}\"",
            format_key_tag(&self.key),
            ALGORITHM,
            self.created,
            self.headers.join(" "),
            B64.encode(self.signature),
        )
    }

    pub fn parse(value: &str) -> Result<Self> {
        let params = parse_param_list(value);
        let key_tag = lookup(&params, "keyId")?;
        let key = parse_key_tag(key_tag).map_err(Error::protocol)?;
        let algorithm = lookup(&params, "algorithm")?;
        if algorithm != ALGORITHM {
            return Err(Error::protocol(format!("unsupported algorithm {algorithm}")));
        }
        let created = lookup(&params, "created")?
            .parse()
            .map_err(|_| Error::protocol("bad created timestamp"))?;
        let headers = lookup(&params, "headers")?
            .split_ascii_whitespace()
            .map(str::to_string)
            .collect();
        let signature = B64
            .decode(lookup(&params, "signature")?)
            .ok()
            .and_then(|raw| <[u8; 64]>::try_from(raw.as_slice()).ok())
            .ok_or_else(|| Error::protocol("bad signature encoding"))?;
        Ok(Self { key, created, headers, signature })
    }
}

/// Parsed `X-Ouinet-BSigs` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSigParams {
    pub key: PublicKey,
    pub block_size: u64,
}

impl BlockSigParams {
    pub fn format(&self) -> String {
        format!(
            "keyId=\"{}\",algorithm=\"{}\",size={}",
            format_key_tag(&self.key),
            ALGORITHM,
            self.block_size,
        )
    }

    pub fn parse(value: &str) -> Result<Self> {
        let params = parse_param_list(value);
        let key = parse_key_tag(lookup(&params, "keyId")?).map_err(Error::protocol)?;
        let algorithm = lookup(&params, "algorithm")?;
        if algorithm != ALGORITHM {
            return Err(Error::protocol(format!("unsupported algorithm {algorithm}")));
        }
        let block_size = lookup(&params, "size")?
            .parse()
            .map_err(|_| Error::protocol("bad block size"))?;
        if block_size == 0 {
            return Err(Error::protocol("zero block size"));
        }
        Ok(Self { key, block_size })
    }
}

/// `name=value` and `name="value"` items separated by commas; commas inside
/// quotes do not split.
fn parse_param_list(value: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = value.trim();
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let name = rest[..eq].trim().to_string();
        rest = &rest[eq + 1..];
        let val;
        if let Some(stripped) = rest.strip_prefix('"') {
            let Some(end) = stripped.find('"') else { break };
            val = stripped[..end].to_string();
            rest = stripped[end + 1..].trim_start().trim_start_matches(',').trim_start();
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            val = rest[..end].trim().to_string();
            rest = rest[end..].trim_start_matches(',').trim_start();
        }
        params.push((name, val));
    }
    params
}

fn lookup<'a>(params: &'a [(String, String)], name: &str) -> Result<&'a str> {
    params
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
        .ok_or_else(|| Error::protocol(format!("missing signature parameter {name}")))
}

/// Covered-field list for a head signature: the two pseudo-fields, then
/// every field of the (already canonical) head, lowercased, in order.
pub fn covered_fields(head: &ResponseHead) -> Vec<String> {
    let mut covered = vec!["(response-status)".to_string(), "(created)".to_string()];
    covered.extend(head.headers.iter().map(|(n, _)| n.to_ascii_lowercase()));
    covered
}

/// Build the signing string over `head` for the covered-field list.
/// Each line is `name: value`, LF-separated, no trailing LF.
pub fn signing_string(head: &ResponseHead, created: u64, covered: &[String]) -> Vec<u8> {
    let mut lines: Vec<String> = Vec::with_capacity(covered.len());
    for name in covered {
        match name.as_str() {
            "(response-status)" => lines.push(format!("(response-status): {}", head.status)),
            "(created)" => lines.push(format!("(created): {created}")),
            _ => {
                // Repeated fields collapse onto one line, comma-separated.
                let values: Vec<&str> = head
                    .headers
                    .iter()
                    .filter(|(n, _)| n.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v.as_str())
                    .collect();
                lines.push(format!("{}: {}", name, values.join(", ")));
            }
        }
    }
    lines.join("\n").into_bytes()
}

/// One step of the block hash chain:
/// H_i = SHA-512(H_{i-1} ‖ SIG_{i-1} ‖ block_i), with H_{-1} = 0 and an
/// empty SIG_{-1}.
pub fn chain_step(
    prev_hash: &[u8; 64],
    prev_signature: Option<&Signature>,
    block: &[u8],
) -> [u8; 64] {
    let mut buf = Vec::with_capacity(64 + 64 + block.len());
    buf.extend_from_slice(prev_hash);
    if let Some(sig) = prev_signature {
        buf.extend_from_slice(sig);
    }
    buf.extend_from_slice(block);
    sha512_digest(&buf)
}

/// The byte string a block signature covers: the key tag, the block index,
/// the data size through this block, and the chain hash, NUL-separated.
pub fn block_signable(
    key: &PublicKey,
    block_index: u64,
    offset_end: u64,
    chain_hash: &[u8; 64],
) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(format_key_tag(key).as_bytes());
    buf.push(0);
    buf.extend_from_slice(block_index.to_string().as_bytes());
    buf.push(0);
    buf.extend_from_slice(offset_end.to_string().as_bytes());
    buf.push(0);
    buf.extend_from_slice(chain_hash);
    buf
}
