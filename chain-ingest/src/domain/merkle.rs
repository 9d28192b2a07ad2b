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

use crate::domain::{UniversalBlock, UniversalTransaction, UniversalTxEntry};
use bitcoin::{
    Txid, Wtxid,
    hashes::{Hash, HashEngine, sha256d},
    merkle_tree,
};
use std::str::FromStr;
use thiserror::Error;

/// Marker of the witness commitment output script: `OP_RETURN` followed by a 36 byte push starting
/// with the BIP141 commitment header.
const WITNESS_COMMITMENT_PREFIX: &str = "6a24aa21a9ed";

/// Recompute the block's transaction Merkle root and compare it to the header's `merkleroot`.
/// Genesis gets its dedicated verifier; all other blocks additionally get the witness commitment
/// check when the network supports SegWit and the block carries witness data.
pub fn verify_block_merkle(block: &UniversalBlock, has_segwit: bool) -> Result<(), MerkleError> {
    let transactions = decoded_transactions(block)?;

    if block.height == Some(0) {
        return verify_genesis(block, &transactions);
    }

    verify_tx_root(block, &transactions)?;

    if has_segwit && transactions.iter().any(|tx| has_witness(tx)) {
        verify_witness_commitment(block, &transactions)?;
    }

    Ok(())
}

/// Genesis carries exactly one coinbase transaction whose txid is the Merkle root.
fn verify_genesis(
    block: &UniversalBlock,
    transactions: &[&UniversalTransaction],
) -> Result<(), MerkleError> {
    let [coinbase] = transactions else {
        return Err(MerkleError::MalformedGenesis(transactions.len()));
    };

    if coinbase.txid != block.merkleroot {
        return Err(MerkleError::Mismatch {
            hash: block.hash.clone(),
            expected: block.merkleroot.clone(),
            computed: coinbase.txid.clone(),
        });
    }

    Ok(())
}

fn verify_tx_root(
    block: &UniversalBlock,
    transactions: &[&UniversalTransaction],
) -> Result<(), MerkleError> {
    let txids = transactions
        .iter()
        .map(|tx| parse_hash::<Txid>(&tx.txid))
        .collect::<Result<Vec<_>, _>>()?;

    let computed = merkle_tree::calculate_root(txids.into_iter().map(Txid::to_raw_hash))
        .ok_or_else(|| MerkleError::NoTransactions(block.hash.clone()))?;
    let expected = parse_hash::<Txid>(&block.merkleroot)?.to_raw_hash();

    if computed != expected {
        return Err(MerkleError::Mismatch {
            hash: block.hash.clone(),
            expected: block.merkleroot.clone(),
            computed: computed.to_string(),
        });
    }

    Ok(())
}

/// BIP141: the coinbase commits to the wtxid Merkle root (coinbase wtxid counted as zero) hashed
/// together with the reserved value from the coinbase witness.
fn verify_witness_commitment(
    block: &UniversalBlock,
    transactions: &[&UniversalTransaction],
) -> Result<(), MerkleError> {
    let coinbase = transactions
        .first()
        .filter(|tx| tx.vin.first().is_some_and(|vin| vin.coinbase.is_some()))
        .ok_or_else(|| MerkleError::MissingCoinbase(block.hash.clone()))?;

    let commitment_hex = coinbase
        .vout
        .iter()
        .rev()
        .find_map(|vout| {
            vout.script_pub_key
                .hex
                .strip_prefix(WITNESS_COMMITMENT_PREFIX)
        })
        .ok_or_else(|| MerkleError::MissingWitnessCommitment(block.hash.clone()))?;
    let commitment_hex = commitment_hex.get(..64).ok_or_else(|| {
        MerkleError::MissingWitnessCommitment(block.hash.clone())
    })?;

    let reserved = coinbase
        .vin
        .first()
        .and_then(|vin| vin.witness.as_ref())
        .and_then(|witness| witness.first())
        .ok_or_else(|| MerkleError::MissingWitnessReserved(block.hash.clone()))?;
    let reserved =
        const_hex::decode(reserved).map_err(|_| MerkleError::InvalidHash(reserved.clone()))?;

    let wtxids = std::iter::once(Ok(Wtxid::all_zeros()))
        .chain(
            transactions
                .iter()
                .skip(1)
                .map(|tx| parse_hash::<Wtxid>(&tx.hash)),
        )
        .collect::<Result<Vec<_>, _>>()?;

    let witness_root = merkle_tree::calculate_root(wtxids.into_iter().map(Wtxid::to_raw_hash))
        .ok_or_else(|| MerkleError::NoTransactions(block.hash.clone()))?;

    let mut engine = sha256d::Hash::engine();
    engine.input(witness_root.as_byte_array());
    engine.input(&reserved);
    let computed = sha256d::Hash::from_engine(engine);

    // The script push stores the commitment in internal byte order.
    let expected = const_hex::decode(commitment_hex)
        .map_err(|_| MerkleError::InvalidHash(commitment_hex.to_string()))?;

    if computed.as_byte_array().as_slice() != expected.as_slice() {
        return Err(MerkleError::WitnessCommitmentMismatch {
            hash: block.hash.clone(),
        });
    }

    Ok(())
}

/// The hex path always yields fully decoded transactions; bare ids cannot be verified.
fn decoded_transactions(
    block: &UniversalBlock,
) -> Result<Vec<&UniversalTransaction>, MerkleError> {
    let entries = block
        .tx
        .as_deref()
        .ok_or_else(|| MerkleError::NoTransactions(block.hash.clone()))?;

    entries
        .iter()
        .map(|entry| match entry {
            UniversalTxEntry::Full(tx) => Ok(tx),
            UniversalTxEntry::Id(_) => {
                Err(MerkleError::UndecodedTransactions(block.hash.clone()))
            }
        })
        .collect()
}

fn has_witness(tx: &UniversalTransaction) -> bool {
    tx.vin
        .iter()
        .any(|vin| vin.witness.as_ref().is_some_and(|w| !w.is_empty()))
}

fn parse_hash<H>(hex: &str) -> Result<H, MerkleError>
where
    H: FromStr,
{
    hex.parse::<H>()
        .map_err(|_| MerkleError::InvalidHash(hex.to_string()))
}

#[derive(Debug, Error)]
pub enum MerkleError {
    #[error("merkle root mismatch for block {hash}: header {expected}, computed {computed}")]
    Mismatch {
        hash: String,
        expected: String,
        computed: String,
    },

    #[error("witness commitment mismatch for block {hash}")]
    WitnessCommitmentMismatch { hash: String },

    #[error("genesis block must contain exactly one transaction, found {0}")]
    MalformedGenesis(usize),

    #[error("block {0} has no transactions to verify")]
    NoTransactions(String),

    #[error("block {0} contains undecoded transaction ids")]
    UndecodedTransactions(String),

    #[error("block {0} has no coinbase transaction")]
    MissingCoinbase(String),

    #[error("block {0} carries witness data but no witness commitment output")]
    MissingWitnessCommitment(String),

    #[error("block {0} coinbase has no witness reserved value")]
    MissingWitnessReserved(String),

    #[error("invalid hash hex: {0}")]
    InvalidHash(String),
}
