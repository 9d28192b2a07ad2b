// This file is part of bitcoin-ingest.
// Copyright (C) 2025 Bitcoin Ingest Authors
// SPDX-License-Identifier: Apache-2.0
// Licensed under the Apache License, Version 2.0 (the "License");
// You may not use this file except in compliance with the License.
// You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use bitcoin::hashes::Hash as _;
use serde::{Deserialize, Serialize};

/// Static facts about the ingested network used for normalization and verification.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "network_default")]
    pub network: bitcoin::Network,

    #[serde(default = "has_segwit_default")]
    pub has_segwit: bool,

    #[serde(default = "max_block_size_default")]
    pub max_block_size: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            network: network_default(),
            has_segwit: has_segwit_default(),
            max_block_size: max_block_size_default(),
        }
    }
}

fn network_default() -> bitcoin::Network {
    bitcoin::Network::Bitcoin
}

fn has_segwit_default() -> bool {
    true
}

fn max_block_size_default() -> u64 {
    4_000_000
}

/// Provider-agnostic block shape, field names as the upstream node reports them. Blocks produced
/// by a height-addressed path always carry `height`; hash-addressed paths may resolve it via a
/// follow-up call. The hex-decode path cannot derive `mediantime`, `chainwork`, `difficulty` or
/// `nextblockhash` locally and leaves them unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniversalBlock {
    pub hash: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,

    pub size: u64,
    pub strippedsize: u64,
    pub weight: u64,
    pub version: i32,

    #[serde(rename = "versionHex")]
    pub version_hex: String,

    pub merkleroot: String,
    pub time: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mediantime: Option<u32>,

    pub nonce: u32,
    pub bits: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chainwork: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previousblockhash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nextblockhash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx: Option<Vec<UniversalTxEntry>>,

    #[serde(rename = "nTx", default, skip_serializing_if = "Option::is_none")]
    pub n_tx: Option<u32>,
}

/// A `tx` array entry: either a bare txid (low verbosity) or a decoded transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UniversalTxEntry {
    Full(UniversalTransaction),
    Id(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniversalTransaction {
    pub txid: String,

    /// Witness txid; equals `txid` for transactions without witness data.
    pub hash: String,

    pub version: i32,
    pub size: u64,
    pub vsize: u64,
    pub weight: u64,
    pub locktime: u32,
    pub vin: Vec<UniversalVin>,
    pub vout: Vec<UniversalVout>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniversalVin {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vout: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coinbase: Option<String>,

    #[serde(
        rename = "scriptSig",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub script_sig: Option<ScriptSig>,

    #[serde(
        rename = "txinwitness",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub witness: Option<Vec<String>>,

    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptSig {
    #[serde(default)]
    pub asm: String,

    pub hex: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniversalVout {
    pub value: f64,
    pub n: u32,

    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: ScriptPubKey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptPubKey {
    pub hex: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub script_type: Option<String>,
}

/// Loader metadata: the upstream total size is the base for reply-size budgeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub hash: String,
    pub size: u64,
    pub height: u32,
}

/// Normalized block, the core entity streamed to consumers. `height` is required, `tx` contains
/// only decoded transactions, and the derived size metrics are filled in by the normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub height: u32,
    pub hash: String,
    pub size: u64,
    pub strippedsize: u64,
    pub weight: u64,
    pub version: i32,

    #[serde(rename = "versionHex")]
    pub version_hex: String,

    pub merkleroot: String,
    pub time: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mediantime: Option<u32>,

    pub nonce: u32,
    pub bits: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chainwork: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previousblockhash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nextblockhash: Option<String>,

    pub tx: Vec<UniversalTransaction>,

    #[serde(rename = "nTx")]
    pub n_tx: u32,

    pub vsize: u64,

    #[serde(rename = "witnessSize", default, skip_serializing_if = "Option::is_none")]
    pub witness_size: Option<u64>,

    #[serde(rename = "headerSize")]
    pub header_size: u64,

    #[serde(rename = "transactionsSize")]
    pub transactions_size: u64,

    #[serde(rename = "blockSizeEfficiency")]
    pub block_size_efficiency: f64,

    #[serde(
        rename = "witnessDataRatio",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub witness_data_ratio: Option<f64>,
}

impl Block {
    /// Convert back into the provider-agnostic shape, dropping the derived metrics.
    pub fn as_universal(&self) -> UniversalBlock {
        UniversalBlock {
            hash: self.hash.clone(),
            height: Some(self.height),
            size: self.size,
            strippedsize: self.strippedsize,
            weight: self.weight,
            version: self.version,
            version_hex: self.version_hex.clone(),
            merkleroot: self.merkleroot.clone(),
            time: self.time,
            mediantime: self.mediantime,
            nonce: self.nonce,
            bits: self.bits.clone(),
            difficulty: self.difficulty,
            chainwork: self.chainwork.clone(),
            previousblockhash: self.previousblockhash.clone(),
            nextblockhash: self.nextblockhash.clone(),
            tx: Some(
                self.tx
                    .iter()
                    .cloned()
                    .map(UniversalTxEntry::Full)
                    .collect(),
            ),
            n_tx: Some(self.n_tx),
        }
    }
}

impl From<&Block> for BlockInfo {
    fn from(block: &Block) -> Self {
        Self {
            hash: block.hash.clone(),
            size: block.size,
            height: block.height,
        }
    }
}

impl UniversalTransaction {
    pub fn from_consensus(tx: &bitcoin::Transaction) -> Self {
        let txid = tx.compute_txid();
        let wtxid = tx.compute_wtxid();
        let is_coinbase = tx.is_coinbase();

        let vin = tx
            .input
            .iter()
            .map(|input| {
                if is_coinbase {
                    UniversalVin {
                        txid: None,
                        vout: None,
                        coinbase: Some(const_hex::encode(input.script_sig.as_bytes())),
                        script_sig: None,
                        witness: witness_hex(&input.witness),
                        sequence: input.sequence.0,
                    }
                } else {
                    UniversalVin {
                        txid: Some(input.previous_output.txid.to_string()),
                        vout: Some(input.previous_output.vout),
                        coinbase: None,
                        script_sig: Some(ScriptSig {
                            asm: input.script_sig.to_asm_string(),
                            hex: const_hex::encode(input.script_sig.as_bytes()),
                        }),
                        witness: witness_hex(&input.witness),
                        sequence: input.sequence.0,
                    }
                }
            })
            .collect();

        let vout = tx
            .output
            .iter()
            .enumerate()
            .map(|(n, output)| UniversalVout {
                value: output.value.to_btc(),
                n: n as u32,
                script_pub_key: ScriptPubKey {
                    hex: const_hex::encode(output.script_pubkey.as_bytes()),
                    address: None,
                    script_type: None,
                },
            })
            .collect();

        Self {
            txid: txid.to_string(),
            hash: wtxid.to_string(),
            version: tx.version.0,
            size: tx.total_size() as u64,
            vsize: tx.vsize() as u64,
            weight: tx.weight().to_wu(),
            locktime: tx.lock_time.to_consensus_u32(),
            vin,
            vout,
        }
    }
}

fn witness_hex(witness: &bitcoin::Witness) -> Option<Vec<String>> {
    if witness.is_empty() {
        None
    } else {
        Some(witness.iter().map(const_hex::encode).collect())
    }
}

impl UniversalBlock {
    /// Build the universal shape from a consensus-decoded block. `height` is the request-side
    /// height for height-addressed fetches, `None` for hash-addressed ones.
    pub fn from_consensus(block: &bitcoin::Block, height: Option<u32>) -> Self {
        let header = &block.header;
        let version = header.version.to_consensus();
        let previousblockhash = (header.prev_blockhash
            != bitcoin::BlockHash::from_byte_array([0; 32]))
        .then(|| header.prev_blockhash.to_string());

        Self {
            hash: block.block_hash().to_string(),
            height,
            size: block.total_size() as u64,
            strippedsize: (block.weight().to_wu() - block.total_size() as u64) / 3,
            weight: block.weight().to_wu(),
            version,
            version_hex: format!("{version:08x}"),
            merkleroot: header.merkle_root.to_string(),
            time: header.time,
            mediantime: None,
            nonce: header.nonce,
            bits: format!("{:08x}", header.bits.to_consensus()),
            difficulty: Some(header.difficulty_float()),
            chainwork: None,
            previousblockhash,
            nextblockhash: None,
            tx: Some(
                block
                    .txdata
                    .iter()
                    .map(|tx| UniversalTxEntry::Full(UniversalTransaction::from_consensus(tx)))
                    .collect(),
            ),
            n_tx: Some(block.txdata.len() as u32),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::{UniversalBlock, UniversalTxEntry};
    use bitcoin::constants::genesis_block;

    #[test]
    fn test_from_consensus_genesis() {
        let genesis = genesis_block(bitcoin::Network::Bitcoin);
        let block = UniversalBlock::from_consensus(&genesis, Some(0));

        assert_eq!(block.height, Some(0));
        assert_eq!(
            block.hash,
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
        assert_eq!(block.previousblockhash, None);
        assert_eq!(block.n_tx, Some(1));

        let tx = match block.tx.as_deref() {
            Some([UniversalTxEntry::Full(tx)]) => tx,
            other => panic!("expected one decoded transaction, got {other:?}"),
        };
        assert_eq!(tx.txid, block.merkleroot);
        assert!(tx.vin[0].coinbase.is_some());
    }

    #[test]
    fn test_verbose_json_shape() {
        let json = serde_json::json!({
            "hash": "00".repeat(32),
            "height": 7,
            "size": 285,
            "strippedsize": 285,
            "weight": 1140,
            "version": 1,
            "versionHex": "00000001",
            "merkleroot": "11".repeat(32),
            "time": 1_231_006_505,
            "mediantime": 1_231_006_505,
            "nonce": 2_083_236_893,
            "bits": "1d00ffff",
            "difficulty": 1.0,
            "chainwork": "00".repeat(32),
            "nTx": 1,
            "tx": ["aa".repeat(32)],
        });

        let block =
            serde_json::from_value::<UniversalBlock>(json).expect("verbose shape deserializes");
        assert_eq!(block.height, Some(7));
        assert_eq!(block.n_tx, Some(1));
        assert!(matches!(
            block.tx.as_deref(),
            Some([UniversalTxEntry::Id(_)])
        ));
    }
}
