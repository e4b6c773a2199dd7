//! Reward distribution manifests fetched from IPFS
//!
//! The staking contract publishes the sha2-256 digest of the current
//! distribution manifest. The manifest lists, per wallet, the LINK `amount`
//! and stLINK `sharesAmount` accrued at that distribution. Content is
//! addressed by hash, so a manifest that was fetched (or found undecodable)
//! is remembered for the rest of the process. Fetch failures are not.

use alloy::primitives::{Address, B256, U256};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::constants;

/// A wallet's entry in a distribution manifest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Allocation {
    /// LINK distribution amount (feeds `getQueuedTokens`)
    pub amount: U256,
    /// stLINK share amount (feeds `getLSDTokens`)
    pub shares_amount: U256,
}

/// Decoded manifest: wallet -> allocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistributionManifest {
    pub cid: String,
    pub entries: HashMap<Address, Allocation>,
}

impl DistributionManifest {
    /// Allocation for `wallet`; a wallet missing from the manifest has accrued nothing yet
    pub fn allocation(&self, wallet: &Address) -> Allocation {
        self.entries.get(wallet).copied().unwrap_or_default()
    }
}

/// Why a manifest could not be used
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("failed to fetch manifest {cid}: {reason}")]
    Fetch { cid: String, reason: String },

    #[error("manifest {cid} is not valid JSON: {reason}")]
    Decode { cid: String, reason: String },

    #[error("manifest {cid} has a malformed entry for {address}: {reason}")]
    MalformedEntry {
        cid: String,
        address: String,
        reason: String,
    },
}

/// CIDv0 for a sha2-256 digest: base58(0x12 0x20 || digest)
pub fn cid_from_digest(digest: &B256) -> String {
    let mut multihash = Vec::with_capacity(34);
    multihash.extend_from_slice(&[0x12, 0x20]);
    multihash.extend_from_slice(digest.as_slice());
    bs58::encode(multihash).into_string()
}

/// Source of manifest allocations (the IPFS gateway in production)
#[async_trait]
pub trait ManifestSource: Send {
    /// Allocation of `wallet` in the manifest whose digest is `digest`
    async fn allocation(&mut self, digest: B256, wallet: Address)
    -> Result<Allocation, ManifestError>;
}

/// IPFS gateway client with a per-process memo
pub struct IpfsClient {
    client: reqwest::Client,
    gateway: String,
    retry_base: Duration,
    memo: HashMap<String, Result<Arc<DistributionManifest>, ManifestError>>,
}

impl IpfsClient {
    pub fn new(gateway: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(constants::HTTP_TIMEOUT_SECS))
            .build()?;

        let mut gateway = gateway.to_string();
        if !gateway.ends_with('/') {
            gateway.push('/');
        }

        Ok(Self {
            client,
            gateway,
            retry_base: Duration::from_secs(1),
            memo: HashMap::new(),
        })
    }

    #[cfg(test)]
    fn with_retry_base(mut self, retry_base: Duration) -> Self {
        self.retry_base = retry_base;
        self
    }

    /// Fetch and decode a manifest, memoized by CID
    ///
    /// Only outcomes determined by the content are memoized; a gateway
    /// failure is retried on the next lookup of the same CID.
    pub async fn fetch_manifest(
        &mut self,
        digest: &B256,
    ) -> Result<Arc<DistributionManifest>, ManifestError> {
        let cid = cid_from_digest(digest);
        if let Some(cached) = self.memo.get(&cid) {
            return cached.clone();
        }

        let result = self.fetch_uncached(&cid).await.map(Arc::new);
        if !matches!(result, Err(ManifestError::Fetch { .. })) {
            self.memo.insert(cid, result.clone());
        }
        result
    }

    async fn fetch_uncached(&self, cid: &str) -> Result<DistributionManifest, ManifestError> {
        let url = format!("{}{}", self.gateway, cid);
        info!(cid, "Fetching distribution manifest");

        let mut last_error = String::new();

        for attempt in 0..constants::IPFS_MAX_ATTEMPTS {
            if attempt > 0 {
                let delay = self.retry_base * 2u32.pow(attempt - 1);
                debug!(cid, attempt, ?delay, "Retrying manifest fetch");
                sleep(delay).await;
            }

            match self.client.get(&url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let body = response.text().await.map_err(|e| ManifestError::Fetch {
                            cid: cid.to_string(),
                            reason: format!("failed to read body: {}", e),
                        })?;
                        return parse_manifest(cid, &body);
                    } else if status.is_server_error() || status.as_u16() == 429 {
                        last_error = format!("gateway returned status {}", status);
                    } else {
                        return Err(ManifestError::Fetch {
                            cid: cid.to_string(),
                            reason: format!("gateway returned status {}", status),
                        });
                    }
                }
                Err(e) => {
                    last_error = format!("request failed: {}", e);
                }
            }
        }

        Err(ManifestError::Fetch {
            cid: cid.to_string(),
            reason: last_error,
        })
    }
}

#[async_trait]
impl ManifestSource for IpfsClient {
    async fn allocation(
        &mut self,
        digest: B256,
        wallet: Address,
    ) -> Result<Allocation, ManifestError> {
        // No distribution published yet
        if digest.is_zero() {
            return Ok(Allocation::default());
        }

        let manifest = self.fetch_manifest(&digest).await?;
        if !manifest.entries.contains_key(&wallet) {
            debug!(cid = %manifest.cid, %wallet, "Wallet not in manifest (yet)");
        }
        Ok(manifest.allocation(&wallet))
    }
}

/// Decode a manifest body. Accepts plain JSON or a JSON string holding JSON.
pub fn parse_manifest(cid: &str, body: &str) -> Result<DistributionManifest, ManifestError> {
    let decode_err = |e: serde_json::Error| ManifestError::Decode {
        cid: cid.to_string(),
        reason: e.to_string(),
    };

    let mut root: Value = serde_json::from_str(body).map_err(decode_err)?;
    if let Value::String(inner) = &root {
        root = serde_json::from_str(inner).map_err(decode_err)?;
    }

    let mut entries = HashMap::new();
    collect_entries(cid, &root, &mut entries)?;

    if entries.is_empty() {
        warn!(cid, "Manifest contains no wallet entries");
    }

    Ok(DistributionManifest {
        cid: cid.to_string(),
        entries,
    })
}

/// Walk the document collecting `"<address>": { "amount": .., "sharesAmount": .. }` pairs
fn collect_entries(
    cid: &str,
    value: &Value,
    entries: &mut HashMap<Address, Allocation>,
) -> Result<(), ManifestError> {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                match (key.parse::<Address>(), child) {
                    (Ok(address), Value::Object(fields)) if has_field(fields, "amount") => {
                        let malformed = |reason: String| ManifestError::MalformedEntry {
                            cid: cid.to_string(),
                            address: key.clone(),
                            reason,
                        };
                        let amount = amount_field(fields, "amount").map_err(malformed)?;
                        let shares_amount =
                            amount_field(fields, "sharesAmount").map_err(malformed)?;
                        entries.insert(
                            address,
                            Allocation {
                                amount,
                                shares_amount,
                            },
                        );
                    }
                    _ => collect_entries(cid, child, entries)?,
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_entries(cid, item, entries)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn field<'a>(fields: &'a serde_json::Map<String, Value>, name: &str) -> Option<&'a Value> {
    fields
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v)
}

fn has_field(fields: &serde_json::Map<String, Value>, name: &str) -> bool {
    field(fields, name).is_some()
}

/// Decimal or 0x-hex string, or a non-negative JSON integer
fn amount_field(fields: &serde_json::Map<String, Value>, name: &str) -> Result<U256, String> {
    match field(fields, name) {
        Some(Value::String(s)) => s
            .trim()
            .parse::<U256>()
            .map_err(|e| format!("{} '{}' is not an integer: {}", name, s, e)),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(U256::from)
            .ok_or_else(|| format!("{} {} is not a non-negative integer", name, n)),
        Some(other) => Err(format!("{} has unexpected type: {}", name, other)),
        None => Err(format!("missing {}", name)),
    }
}
