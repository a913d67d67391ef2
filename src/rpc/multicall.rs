//! Batched balance reads through Multicall3.
//!
//! Native balances use the aggregator's `getEthBalance` helper; token
//! balances use ERC-20 `balanceOf`. Addresses are partitioned into chunks
//! sized to stay under the node's payload/gas limits.
//!
//! The one invariant that matters here: a failed read is `None`, a genuine
//! zero balance is `Some(0)`. Collapsing the two would fabricate
//! distribution signals downstream.

use super::RpcClient;
use alloy_primitives::{address, Address, U256};
use alloy_sol_types::{sol, SolCall, SolValue};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Multicall3, same address on every major EVM chain.
pub const MULTICALL3_ADDRESS: Address = address!("cA11bde05977b3631167028862bE2a173976CA11");

/// Canonical mainnet WETH.
pub const WETH_ADDRESS: Address = address!("C02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2");

/// Lido stETH.
pub const STETH_ADDRESS: Address = address!("ae7ab96520DE3A18E5e111B5EaAb095312D7fE84");

sol! {
    #[derive(Debug)]
    struct Call3 {
        address target;
        bool allowFailure;
        bytes callData;
    }

    #[derive(Debug)]
    struct CallReturn {
        bool success;
        bytes returnData;
    }

    function aggregate3(Call3[] calldata calls) external payable returns (CallReturn[] memory returnData);

    function getEthBalance(address addr) external view returns (uint256 balance);

    function balanceOf(address account) external view returns (uint256);
}

/// Read-only balance access used by the whale provider, the snapshot job and
/// the calculator. `None` values mean the read failed for that address.
#[async_trait]
pub trait BalanceReader: Send + Sync {
    async fn get_native_balances(
        &self,
        addresses: &[Address],
        block: Option<u64>,
    ) -> eyre::Result<HashMap<Address, Option<U256>>>;

    async fn get_token_balances(
        &self,
        token: Address,
        addresses: &[Address],
        block: Option<u64>,
    ) -> eyre::Result<HashMap<Address, Option<U256>>>;

    async fn get_latest_block(&self) -> eyre::Result<u64>;
}

pub struct MulticallBatcher {
    rpc: Arc<RpcClient>,
    chunk_size: usize,
}

impl MulticallBatcher {
    pub fn new(rpc: Arc<RpcClient>, chunk_size: usize) -> Self {
        Self { rpc, chunk_size }
    }

    /// Run one chunk through `aggregate3` and map per-call results back onto
    /// the chunk's addresses.
    async fn read_chunk(
        &self,
        chunk: &[Address],
        make_call: &(dyn Fn(Address) -> Call3 + Sync),
        block: Option<u64>,
        out: &mut HashMap<Address, Option<U256>>,
    ) -> eyre::Result<()> {
        let calls: Vec<Call3> = chunk.iter().map(|&a| make_call(a)).collect();
        let calldata = aggregate3Call { calls }.abi_encode();

        let raw = self.rpc.eth_call(MULTICALL3_ADDRESS, &calldata, block).await?;
        let results: Vec<CallReturn> = aggregate3Call::abi_decode_returns(&raw)
            .map_err(|e| eyre::eyre!("aggregate3 return decode failed: {e}"))?;

        if results.len() != chunk.len() {
            eyre::bail!(
                "aggregate3 returned {} results for {} calls",
                results.len(),
                chunk.len()
            );
        }

        for (&addr, result) in chunk.iter().zip(results.iter()) {
            out.insert(addr, decode_balance(result));
        }
        Ok(())
    }

    async fn batch_read(
        &self,
        addresses: &[Address],
        make_call: &(dyn Fn(Address) -> Call3 + Sync),
        block: Option<u64>,
    ) -> eyre::Result<HashMap<Address, Option<U256>>> {
        let mut out = HashMap::with_capacity(addresses.len());
        if addresses.is_empty() {
            return Ok(out);
        }

        let mut failed_chunks = 0usize;
        let mut total_chunks = 0usize;
        let mut last_error: Option<eyre::Report> = None;

        for chunk in addresses.chunks(self.chunk_size) {
            total_chunks += 1;
            if let Err(e) = self.read_chunk(chunk, make_call, block, &mut out).await {
                warn!(
                    chunk_len = chunk.len(),
                    error = %e,
                    "multicall chunk failed, marking addresses as unread"
                );
                for &addr in chunk {
                    out.insert(addr, None);
                }
                failed_chunks += 1;
                last_error = Some(e);
            }
        }

        // Partial failures degrade to None values; a total failure is the
        // caller's problem.
        if failed_chunks == total_chunks {
            if let Some(e) = last_error {
                return Err(e.wrap_err("every multicall chunk failed"));
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl BalanceReader for MulticallBatcher {
    async fn get_native_balances(
        &self,
        addresses: &[Address],
        block: Option<u64>,
    ) -> eyre::Result<HashMap<Address, Option<U256>>> {
        self.batch_read(
            addresses,
            &|addr| Call3 {
                target: MULTICALL3_ADDRESS,
                allowFailure: true,
                callData: getEthBalanceCall { addr }.abi_encode().into(),
            },
            block,
        )
        .await
    }

    async fn get_token_balances(
        &self,
        token: Address,
        addresses: &[Address],
        block: Option<u64>,
    ) -> eyre::Result<HashMap<Address, Option<U256>>> {
        self.batch_read(
            addresses,
            &|account| Call3 {
                target: token,
                allowFailure: true,
                callData: balanceOfCall { account }.abi_encode().into(),
            },
            block,
        )
        .await
    }

    async fn get_latest_block(&self) -> eyre::Result<u64> {
        self.rpc.block_number().await
    }
}

/// A failed call, or return data too short for a uint256, is an unread
/// balance, never zero.
fn decode_balance(result: &CallReturn) -> Option<U256> {
    if !result.success {
        return None;
    }
    if result.returnData.len() < 32 {
        return None;
    }
    <U256 as SolValue>::abi_decode(&result.returnData).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_selectors_match_known_signatures() {
        // keccak("aggregate3((address,bool,bytes)[])")[..4]
        assert_eq!(aggregate3Call::SELECTOR, [0x82, 0xad, 0x56, 0xcb]);
        // keccak("balanceOf(address)")[..4]
        assert_eq!(balanceOfCall::SELECTOR, [0x70, 0xa0, 0x82, 0x31]);
        // keccak("getEthBalance(address)")[..4]
        assert_eq!(getEthBalanceCall::SELECTOR, [0x4d, 0x23, 0x01, 0xcc]);
    }

    #[test]
    fn decode_balance_distinguishes_failure_from_zero() {
        let zero = CallReturn {
            success: true,
            returnData: U256::ZERO.abi_encode().into(),
        };
        assert_eq!(decode_balance(&zero), Some(U256::ZERO));

        let failed = CallReturn {
            success: false,
            returnData: U256::from(5u64).abi_encode().into(),
        };
        assert_eq!(decode_balance(&failed), None);

        let truncated = CallReturn {
            success: true,
            returnData: vec![0u8; 16].into(),
        };
        assert_eq!(decode_balance(&truncated), None);
    }

    #[test]
    fn decode_balance_reads_value() {
        let result = CallReturn {
            success: true,
            returnData: U256::from(1_000_000_000_000_000_000u64).abi_encode().into(),
        };
        assert_eq!(
            decode_balance(&result),
            Some(U256::from(1_000_000_000_000_000_000u64))
        );
    }

    #[test]
    fn aggregate3_returns_roundtrip() {
        let returns = vec![
            CallReturn {
                success: true,
                returnData: U256::from(7u64).abi_encode().into(),
            },
            CallReturn {
                success: false,
                returnData: Vec::<u8>::new().into(),
            },
        ];
        let encoded = returns.abi_encode();
        let decoded: Vec<CallReturn> = aggregate3Call::abi_decode_returns(&encoded).unwrap();
        assert_eq!(decoded.len(), 2);
        assert!(decoded[0].success);
        assert_eq!(decode_balance(&decoded[0]), Some(U256::from(7u64)));
        assert_eq!(decode_balance(&decoded[1]), None);
    }

    #[test]
    fn well_known_addresses_parse() {
        assert_eq!(
            format!("{MULTICALL3_ADDRESS:#x}"),
            "0xca11bde05977b3631167028862be2a173976ca11"
        );
        assert_eq!(
            format!("{WETH_ADDRESS:#x}"),
            "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2"
        );
        assert_eq!(
            format!("{STETH_ADDRESS:#x}"),
            "0xae7ab96520de3a18e5e111b5eaab095312d7fe84"
        );
    }
}
