use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_ENGINE;
use jsonwebtoken::{EncodingKey, Header};
use pem as pem_crate;
use sha2::{Digest, Sha256};
use simple_asn1::{ASN1Block, from_der};
use std::path::Path;
use std::sync::Arc;

/// RS256 signer for internal JWTs, built from a PEM private key.
///
/// The matching public key is published as a JWKS document at
/// `/.well-known/jwks.json` so downstream services can verify issued
/// tokens offline.
#[derive(Clone)]
pub struct PemSigner {
    kid: String,
    encoding_key: EncodingKey,
    jwk: serde_json::Value,
}

pub trait Signer: Send + Sync {
    fn kid(&self) -> &str;
    fn sign(&self, header: Header, claims: &serde_json::Value) -> Result<String>;
    fn jwks(&self) -> serde_json::Value;
}

impl PemSigner {
    /// Build a signer from PEM-encoded key bytes (PKCS1 or PKCS8).
    ///
    /// The public modulus and exponent are extracted by parsing the PEM
    /// ourselves with simple_asn1, both to publish the JWKS and to derive a
    /// stable key id when the settings do not pin one.
    pub fn from_pem(key_pem: &[u8], key_id: Option<&str>) -> Result<Self> {
        let encoding_key =
            EncodingKey::from_rsa_pem(key_pem).context("failed to create encoding key from pem")?;

        let pem = pem_crate::parse(std::str::from_utf8(key_pem).context("key pem to str")?)
            .map_err(|e| anyhow::anyhow!("failed to parse key pem: {}", e))?;

        // Parse ASN.1 structure of private key (PKCS1 or PKCS8) to extract n,e
        let der = pem.contents;
        let asn1 = from_der(&der).context("failed to parse private key DER ASN.1")?;

        // Walk ASN.1 to locate integers for modulus and exponent
        fn extract_n_e(blocks: &[ASN1Block]) -> Option<(Vec<u8>, Vec<u8>)> {
            for b in blocks {
                if let ASN1Block::Sequence(_, inner) = b {
                    // PKCS1 private key: sequence of integers: 0, n, e, d, ...
                    if inner.len() >= 3
                        && let (ASN1Block::Integer(_, n), ASN1Block::Integer(_, e)) =
                            (&inner[1], &inner[2])
                    {
                        let n_bytes = n.to_signed_bytes_be();
                        let e_bytes = e.to_signed_bytes_be();
                        return Some((n_bytes, e_bytes));
                    }
                    // PKCS8 will embed algorithmIdentifier and privateKey as octet string
                    for elem in inner.iter() {
                        if let ASN1Block::OctetString(_, os) = elem
                            && let Ok(nested) = from_der(os)
                            && let Some((n, e)) = extract_n_e(&nested)
                        {
                            return Some((n, e));
                        }
                    }
                }
            }
            None
        }

        let (n_bytes, e_bytes) = extract_n_e(&asn1)
            .ok_or_else(|| anyhow::anyhow!("failed to extract n/e from private key ASN.1"))?;
        let n_bytes = strip_sign_byte(n_bytes);
        let e_bytes = strip_sign_byte(e_bytes);

        let n_b64 = BASE64_ENGINE.encode(&n_bytes);
        let e_b64 = BASE64_ENGINE.encode(&e_bytes);

        // Unless the settings pin a key id, use SHA-256(n || e)
        let kid = match key_id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                let mut hasher = Sha256::new();
                hasher.update(&n_bytes);
                hasher.update(&e_bytes);
                hex::encode(hasher.finalize())
            }
        };

        let jwk = serde_json::json!({
            "kty": "RSA",
            "use": "sig",
            "alg": "RS256",
            "kid": kid,
            "n": n_b64,
            "e": e_b64,
        });

        Ok(PemSigner {
            kid,
            encoding_key,
            jwk,
        })
    }
}

/// Drop the leading zero byte big-integer encoding adds for a set sign bit;
/// JWK wants the unsigned magnitude.
fn strip_sign_byte(bytes: Vec<u8>) -> Vec<u8> {
    let mut bytes = bytes;
    while bytes.len() > 1 && bytes[0] == 0 {
        bytes.remove(0);
    }
    bytes
}

impl Signer for PemSigner {
    fn kid(&self) -> &str {
        &self.kid
    }

    fn sign(&self, mut header: Header, claims: &serde_json::Value) -> Result<String> {
        header.kid = Some(self.kid.clone());
        let token = jsonwebtoken::encode(&header, claims, &self.encoding_key)
            .context("failed to encode jwt")?;
        Ok(token)
    }

    fn jwks(&self) -> serde_json::Value {
        serde_json::json!({ "keys": [self.jwk.clone()] })
    }
}

pub type DynSigner = Arc<dyn Signer>;

pub fn load_pem_signer_from_path(key_path: &Path, key_id: Option<&str>) -> Result<DynSigner> {
    let key = std::fs::read(key_path)
        .with_context(|| format!("read private key {}", key_path.display()))?;
    let signer = PemSigner::from_pem(&key, key_id).context("create pem signer")?;
    Ok(Arc::new(signer))
}
