//! Hourly snapshot driver.
//!
//! One run = one atomic batch: top-N whales with native balances, WETH and
//! stETH balances for the same set, one transactional write. Either the full
//! batch commits or nothing does; there are no per-row retries.

use crate::rpc::multicall::{BalanceReader, STETH_ADDRESS, WETH_ADDRESS};
use crate::store::snapshots::SnapshotStore;
use crate::types::BalanceSnapshot;
use crate::whales::WhaleSource;
use alloy_primitives::{Address, U256};
use chrono::Utc;
use eyre::bail;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

pub struct SnapshotJob {
    whales: Arc<dyn WhaleSource>,
    reader: Arc<dyn BalanceReader>,
    store: Arc<dyn SnapshotStore>,
    network: String,
    top_n: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct SnapshotRunSummary {
    pub whales: usize,
    pub written: u64,
    pub block_height: u64,
}

impl SnapshotJob {
    pub fn new(
        whales: Arc<dyn WhaleSource>,
        reader: Arc<dyn BalanceReader>,
        store: Arc<dyn SnapshotStore>,
        network: String,
        top_n: usize,
    ) -> Self {
        Self {
            whales,
            reader,
            store,
            network,
            top_n,
        }
    }

    pub async fn run(&self) -> eyre::Result<SnapshotRunSummary> {
        let whales = self.whales.get_top_whales(self.top_n).await?;
        if whales.is_empty() {
            bail!("whale list is empty, nothing to snapshot");
        }
        if whales.len() < self.top_n {
            // The provider already skipped unreadable candidates.
            warn!(
                requested = self.top_n,
                got = whales.len(),
                "snapshot covers fewer whales than requested"
            );
        }

        let block_height = self.reader.get_latest_block().await?;
        let snapshot_instant = Utc::now();
        let addresses: Vec<Address> = whales.iter().map(|w| w.address).collect();

        // LST balances are best-effort: a failed read is stored as NULL and
        // only disables migration counting for that whale.
        let (weth, steth) = futures::future::join(
            self.token_balances(WETH_ADDRESS, &addresses, "WETH"),
            self.token_balances(STETH_ADDRESS, &addresses, "stETH"),
        )
        .await;

        let rows: Vec<BalanceSnapshot> = whales
            .iter()
            .map(|w| BalanceSnapshot {
                address: w.address,
                snapshot_instant,
                block_height,
                native_balance: w.native_balance,
                weth_balance: weth.get(&w.address).copied().flatten(),
                steth_balance: steth.get(&w.address).copied().flatten(),
                rank: w.rank,
                network: self.network.clone(),
            })
            .collect();

        let written = self.store.save_snapshots_batch(&rows).await?;
        info!(
            whales = whales.len(),
            written,
            block = block_height,
            network = %self.network,
            "snapshot committed"
        );

        Ok(SnapshotRunSummary {
            whales: whales.len(),
            written,
            block_height,
        })
    }

    async fn token_balances(
        &self,
        token: Address,
        addresses: &[Address],
        label: &str,
    ) -> HashMap<Address, Option<U256>> {
        match self.reader.get_token_balances(token, addresses, None).await {
            Ok(map) => map,
            Err(e) => {
                warn!(token = label, error = %e, "token balance batch failed, storing NULLs");
                addresses.iter().map(|a| (*a, None)).collect()
            }
        }
    }
}
