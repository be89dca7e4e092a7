//! Name hashing for client init responses.
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD, Engine};
use derive_more::Display;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// How gate, config and layer names are obfuscated in a client init response.
#[derive(Debug, Display, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// Names are emitted as-is.
    #[default]
    #[display("none")]
    None,
    /// 32-bit djb2 over UTF-16 code units, printed as an unsigned decimal.
    #[display("djb2")]
    Djb2,
    /// Base64-encoded SHA-256 digest.
    #[display("sha256")]
    Sha256,
}

impl HashAlgorithm {
    pub fn hash(self, input: &str) -> String {
        match self {
            HashAlgorithm::None => input.to_owned(),
            HashAlgorithm::Djb2 => djb2(input),
            HashAlgorithm::Sha256 => STANDARD.encode(Sha256::digest(input.as_bytes())),
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<HashAlgorithm> {
        match s {
            "" | "none" => Ok(HashAlgorithm::None),
            "djb2" => Ok(HashAlgorithm::Djb2),
            "sha256" => Ok(HashAlgorithm::Sha256),
            other => Err(Error::malformed(
                "hash_algorithm",
                format!("unknown hash algorithm {other:?}"),
            )),
        }
    }
}

fn djb2(input: &str) -> String {
    let hash = input.encode_utf16().fold(0i32, |hash, unit| {
        (hash << 5).wrapping_sub(hash).wrapping_add(i32::from(unit))
    });
    (hash as u32).to_string()
}
