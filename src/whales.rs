//! Top-N whale list.
//!
//! Candidate addresses come from a curated JSON file; the provider removes
//! known exchange/bridge/burn addresses, reads balances through the batcher,
//! drops failed reads and returns the top N by native balance.

use crate::rpc::multicall::{BalanceReader, WETH_ADDRESS};
use crate::types::WhaleEntry;
use alloy_primitives::{address, Address, U256};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Addresses that hold enormous balances but are not whales: exchange hot and
/// cold wallets, canonical bridges, the beacon deposit contract, burn sinks.
const DENY_LIST: &[Address] = &[
    address!("0000000000000000000000000000000000000000"), // burn
    address!("000000000000000000000000000000000000dEaD"), // burn
    address!("00000000219ab540356cBB839Cbe05303d7705Fa"), // beacon deposit
    address!("BE0eB53F46cd790Cd13851d5EFf43D12404d33E8"), // Binance 7
    address!("F977814e90dA44bFA03b6295A0616a897441aceC"), // Binance 8
    address!("28C6c06298d514Db089934071355E5743bf21d60"), // Binance 14
    address!("2910543Af39abA0Cd09dBb2D50200b3E800A63D2"), // Kraken
    address!("742d35Cc6634C0532925a3b844Bc454e4438f44e"), // Bitfinex
    address!("8315177aB297bA92A06054cE80a67Ed4DBd7ed3a"), // Arbitrum bridge
    address!("99C9fc46f92E8a1c0deC1b1747d010903E884bE1"), // Optimism gateway
];

/// Produces the current top-N whales with balances already read.
#[async_trait]
pub trait WhaleSource: Send + Sync {
    /// Sorted by native balance descending, ranks assigned from 1. An empty
    /// result means "unable to analyse".
    async fn get_top_whales(&self, limit: usize) -> eyre::Result<Vec<WhaleEntry>>;
}

/// JSON format:
/// `{ "addresses": ["0x..", ...], "deny": ["0x..", ...] }`
/// `deny` extends the built-in deny-list and is optional.
#[derive(Debug, Deserialize)]
struct CandidateFile {
    addresses: Vec<String>,
    #[serde(default)]
    deny: Vec<String>,
}

pub struct WhaleListProvider {
    reader: Arc<dyn BalanceReader>,
    candidates_path: PathBuf,
    min_balance_wei: U256,
}

impl WhaleListProvider {
    pub fn new(reader: Arc<dyn BalanceReader>, candidates_path: PathBuf, min_balance_wei: U256) -> Self {
        Self {
            reader,
            candidates_path,
            min_balance_wei,
        }
    }

    fn load_candidates(&self) -> eyre::Result<Vec<Address>> {
        load_candidate_file(&self.candidates_path)
    }
}

fn load_candidate_file(path: &Path) -> eyre::Result<Vec<Address>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| eyre::eyre!("cannot read candidate file {}: {e}", path.display()))?;
    let file: CandidateFile = serde_json::from_str(&content)
        .map_err(|e| eyre::eyre!("malformed candidate file {}: {e}", path.display()))?;

    let mut deny: HashSet<Address> = DENY_LIST.iter().copied().collect();
    // WETH holds pooled ETH; it is a contract, not a whale.
    deny.insert(WETH_ADDRESS);
    for raw in &file.deny {
        match raw.parse::<Address>() {
            Ok(addr) => {
                deny.insert(addr);
            }
            Err(_) => warn!(address = %raw, "skipping invalid deny-list entry"),
        }
    }

    let mut seen = HashSet::new();
    let mut candidates = Vec::new();
    for raw in &file.addresses {
        let addr = match raw.parse::<Address>() {
            Ok(a) => a,
            Err(_) => {
                warn!(address = %raw, "skipping invalid candidate address");
                continue;
            }
        };
        if deny.contains(&addr) || !seen.insert(addr) {
            continue;
        }
        candidates.push(addr);
    }

    info!(
        candidates = candidates.len(),
        denied = deny.len(),
        path = %path.display(),
        "loaded whale candidates"
    );
    Ok(candidates)
}

#[async_trait]
impl WhaleSource for WhaleListProvider {
    async fn get_top_whales(&self, limit: usize) -> eyre::Result<Vec<WhaleEntry>> {
        let candidates = self.load_candidates()?;
        if candidates.is_empty() {
            error!("candidate list is empty after filtering");
            return Ok(Vec::new());
        }

        let balances = match self.reader.get_native_balances(&candidates, None).await {
            Ok(map) => map,
            Err(e) => {
                error!(error = %e, "balance reads failed for every candidate chunk");
                return Ok(Vec::new());
            }
        };

        let mut whales: Vec<(Address, U256)> = candidates
            .iter()
            .filter_map(|addr| match balances.get(addr) {
                Some(Some(balance)) if *balance >= self.min_balance_wei => Some((*addr, *balance)),
                _ => None,
            })
            .collect();

        if whales.is_empty() {
            error!("no candidate produced a readable balance");
            return Ok(Vec::new());
        }

        // Balance descending; address ascending as a deterministic tiebreak.
        whales.sort_unstable_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        whales.truncate(limit);

        Ok(whales
            .into_iter()
            .enumerate()
            .map(|(i, (address, native_balance))| WhaleEntry {
                address,
                native_balance,
                rank: (i + 1) as u32,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FixedReader {
        balances: HashMap<Address, Option<U256>>,
        fail: bool,
    }

    #[async_trait]
    impl BalanceReader for FixedReader {
        async fn get_native_balances(
            &self,
            addresses: &[Address],
            _block: Option<u64>,
        ) -> eyre::Result<HashMap<Address, Option<U256>>> {
            if self.fail {
                eyre::bail!("rpc down");
            }
            Ok(addresses
                .iter()
                .map(|a| (*a, self.balances.get(a).copied().flatten()))
                .collect())
        }

        async fn get_token_balances(
            &self,
            _token: Address,
            addresses: &[Address],
            _block: Option<u64>,
        ) -> eyre::Result<HashMap<Address, Option<U256>>> {
            Ok(addresses.iter().map(|a| (*a, None)).collect())
        }

        async fn get_latest_block(&self) -> eyre::Result<u64> {
            Ok(0)
        }
    }

    fn write_candidates(addresses: &[&str], deny: &[&str]) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "whale_candidates_test_{}.json",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let body = serde_json::json!({ "addresses": addresses, "deny": deny });
        std::fs::write(&path, serde_json::to_string(&body).unwrap()).unwrap();
        path
    }

    const A1: Address = address!("1111111111111111111111111111111111111111");
    const A2: Address = address!("2222222222222222222222222222222222222222");
    const A3: Address = address!("3333333333333333333333333333333333333333");

    fn eth(n: u64) -> U256 {
        U256::from(n) * U256::from(10u64).pow(U256::from(18u64))
    }

    #[tokio::test]
    async fn sorts_descending_and_assigns_ranks() {
        let path = write_candidates(
            &[
                "0x1111111111111111111111111111111111111111",
                "0x2222222222222222222222222222222222222222",
                "0x3333333333333333333333333333333333333333",
            ],
            &[],
        );
        let reader = FixedReader {
            balances: HashMap::from([
                (A1, Some(eth(100))),
                (A2, Some(eth(300))),
                (A3, Some(eth(200))),
            ]),
            fail: false,
        };
        let provider = WhaleListProvider::new(Arc::new(reader), path, U256::ZERO);

        let whales = provider.get_top_whales(10).await.unwrap();
        assert_eq!(whales.len(), 3);
        assert_eq!(whales[0].address, A2);
        assert_eq!(whales[0].rank, 1);
        assert_eq!(whales[1].address, A3);
        assert_eq!(whales[2].address, A1);
        assert_eq!(whales[2].rank, 3);
    }

    #[tokio::test]
    async fn drops_failed_reads_and_truncates() {
        let path = write_candidates(
            &[
                "0x1111111111111111111111111111111111111111",
                "0x2222222222222222222222222222222222222222",
                "0x3333333333333333333333333333333333333333",
            ],
            &[],
        );
        let reader = FixedReader {
            balances: HashMap::from([
                (A1, Some(eth(100))),
                (A2, None), // failed read, must not appear
                (A3, Some(eth(200))),
            ]),
            fail: false,
        };
        let provider = WhaleListProvider::new(Arc::new(reader), path, U256::ZERO);

        let whales = provider.get_top_whales(1).await.unwrap();
        assert_eq!(whales.len(), 1);
        assert_eq!(whales[0].address, A3);
    }

    #[tokio::test]
    async fn zero_balance_is_kept_by_default() {
        let path = write_candidates(&["0x1111111111111111111111111111111111111111"], &[]);
        let reader = FixedReader {
            balances: HashMap::from([(A1, Some(U256::ZERO))]),
            fail: false,
        };
        let provider = WhaleListProvider::new(Arc::new(reader), path, U256::ZERO);

        let whales = provider.get_top_whales(10).await.unwrap();
        assert_eq!(whales.len(), 1);
        assert_eq!(whales[0].native_balance, U256::ZERO);
    }

    #[tokio::test]
    async fn deny_list_filters_exchanges_and_file_entries() {
        let binance = "0xBE0eB53F46cd790Cd13851d5EFf43D12404d33E8";
        let path = write_candidates(
            &[
                binance,
                "0x1111111111111111111111111111111111111111",
                "0x2222222222222222222222222222222222222222",
            ],
            &["0x2222222222222222222222222222222222222222"],
        );
        let reader = FixedReader {
            balances: HashMap::from([
                (A1, Some(eth(5))),
                (A2, Some(eth(50))),
                (binance.parse().unwrap(), Some(eth(5000))),
            ]),
            fail: false,
        };
        let provider = WhaleListProvider::new(Arc::new(reader), path, U256::ZERO);

        let whales = provider.get_top_whales(10).await.unwrap();
        assert_eq!(whales.len(), 1);
        assert_eq!(whales[0].address, A1);
    }

    #[tokio::test]
    async fn total_read_failure_yields_empty() {
        let path = write_candidates(&["0x1111111111111111111111111111111111111111"], &[]);
        let reader = FixedReader {
            balances: HashMap::new(),
            fail: true,
        };
        let provider = WhaleListProvider::new(Arc::new(reader), path, U256::ZERO);

        let whales = provider.get_top_whales(10).await.unwrap();
        assert!(whales.is_empty());
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let path = write_candidates(
            &["not-an-address", "0x1111111111111111111111111111111111111111"],
            &["also-bad"],
        );
        let candidates = load_candidate_file(&path).unwrap();
        assert_eq!(candidates, vec![A1]);
    }

    #[test]
    fn min_balance_floor_applies() {
        // covered through the async path: floor of 10 ETH drops the 5 ETH whale
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let path = write_candidates(
                &[
                    "0x1111111111111111111111111111111111111111",
                    "0x2222222222222222222222222222222222222222",
                ],
                &[],
            );
            let reader = FixedReader {
                balances: HashMap::from([(A1, Some(eth(5))), (A2, Some(eth(50)))]),
                fail: false,
            };
            let provider = WhaleListProvider::new(Arc::new(reader), path, eth(10));
            let whales = provider.get_top_whales(10).await.unwrap();
            assert_eq!(whales.len(), 1);
            assert_eq!(whales[0].address, A2);
        });
    }
}
