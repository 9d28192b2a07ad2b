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

use bitcoin::{
    BlockHash, Txid,
    consensus::{deserialize, serialize},
    p2p::{
        Address, Magic, ServiceFlags,
        message::NetworkMessage,
        message_blockdata::{GetHeadersMessage, Inventory},
        message_network::VersionMessage,
    },
};
use log::{debug, warn};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    select,
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
    time::{Instant, sleep_until, timeout},
};

pub const USER_AGENT: &str = "/bitcoin-ingest:1.2.0/";

/// Wire message header: magic (4) + command (12) + length (4) + checksum (4).
const MESSAGE_HEADER_LEN: usize = 24;

/// Upper bound on a single message payload; blocks stay below 4 MB weight.
const MAX_PAYLOAD_LEN: usize = 8 * 1_024 * 1_024;

/// One connected peer. Requests are serviced by an actor task owning the socket; unsolicited
/// `inv` block announcements are forwarded to the provider's broadcast channel. Cloning shares
/// the underlying connection.
#[derive(Clone)]
pub struct Peer {
    addr: SocketAddr,
    cmd_tx: mpsc::Sender<Command>,
    task: Arc<JoinHandle<()>>,
}

enum Command {
    GetBlocks {
        hashes: Vec<BlockHash>,
        reply: oneshot::Sender<Result<Vec<Option<bitcoin::Block>>, PeerError>>,
    },

    GetHeaders {
        locator: Vec<BlockHash>,
        reply: oneshot::Sender<Result<Vec<bitcoin::block::Header>, PeerError>>,
    },

    GetTransactions {
        txids: Vec<Txid>,
        reply: oneshot::Sender<Result<Vec<Option<bitcoin::Transaction>>, PeerError>>,
    },
}

impl Peer {
    pub async fn connect(
        addr: SocketAddr,
        magic: Magic,
        connection_timeout: Duration,
        request_timeout: Duration,
        inv_tx: broadcast::Sender<BlockHash>,
    ) -> Result<Self, PeerError> {
        let stream = timeout(connection_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::Timeout)??;

        let stream = handshake(stream, magic, addr).await?;
        debug!(peer:% = addr; "peer handshake completed");

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let task = tokio::spawn(actor(stream, magic, cmd_rx, inv_tx, request_timeout));

        Ok(Self {
            addr,
            cmd_tx,
            task: Arc::new(task),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_alive(&self) -> bool {
        !self.cmd_tx.is_closed()
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }

    /// Request blocks via `getdata`; a block the peer does not announce within the request
    /// timeout (or reports as `notfound`) yields `None` in its slot.
    pub async fn get_blocks(
        &self,
        hashes: Vec<BlockHash>,
    ) -> Result<Vec<Option<bitcoin::Block>>, PeerError> {
        self.request(|reply| Command::GetBlocks { hashes, reply })
            .await
    }

    pub async fn get_headers(
        &self,
        locator: Vec<BlockHash>,
    ) -> Result<Vec<bitcoin::block::Header>, PeerError> {
        self.request(|reply| Command::GetHeaders { locator, reply })
            .await
    }

    pub async fn get_transactions(
        &self,
        txids: Vec<Txid>,
    ) -> Result<Vec<Option<bitcoin::Transaction>>, PeerError> {
        self.request(|reply| Command::GetTransactions { txids, reply })
            .await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, PeerError>>) -> Command,
    ) -> Result<T, PeerError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply))
            .await
            .map_err(|_| PeerError::Closed)?;

        rx.await.map_err(|_| PeerError::Closed)?
    }
}

enum Pending {
    Blocks {
        wanted: HashMap<BlockHash, usize>,
        results: Vec<Option<bitcoin::Block>>,
        reply: oneshot::Sender<Result<Vec<Option<bitcoin::Block>>, PeerError>>,
        outstanding: usize,
    },

    Headers {
        reply: oneshot::Sender<Result<Vec<bitcoin::block::Header>, PeerError>>,
    },

    Transactions {
        wanted: HashMap<Txid, usize>,
        results: Vec<Option<bitcoin::Transaction>>,
        reply: oneshot::Sender<Result<Vec<Option<bitcoin::Transaction>>, PeerError>>,
        outstanding: usize,
    },
}

async fn actor(
    stream: TcpStream,
    magic: Magic,
    mut cmd_rx: mpsc::Receiver<Command>,
    inv_tx: broadcast::Sender<BlockHash>,
    request_timeout: Duration,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut pending: Option<Pending> = None;

    // Reads happen on their own task: a message channel is cancellation-safe inside select!,
    // a partially read socket is not.
    let (msg_tx, mut msg_rx) = mpsc::channel::<Result<NetworkMessage, PeerError>>(16);
    let reader_task = tokio::spawn(async move {
        loop {
            let message = read_message(&mut reader).await;
            let failed = message.is_err();
            if msg_tx.send(message).await.is_err() || failed {
                break;
            }
        }
    });

    let deadline = sleep_until(Instant::now() + request_timeout);
    tokio::pin!(deadline);

    loop {
        select! {
            cmd = cmd_rx.recv(), if pending.is_none() => {
                let Some(cmd) = cmd else { break };

                match start_request(&mut writer, magic, cmd).await {
                    Ok(started) => {
                        pending = Some(started);
                        deadline.as_mut().reset(Instant::now() + request_timeout);
                    }

                    // The failing reply sender has already been consumed by start_request.
                    Err(error) => {
                        warn!(error:%; "cannot send peer request, closing connection");
                        break;
                    }
                }
            }

            () = &mut deadline, if pending.is_some() => {
                match pending.take() {
                    // Partial results: unanswered slots stay None.
                    Some(Pending::Blocks { results, reply, .. }) => {
                        let _ = reply.send(Ok(results));
                    }

                    Some(Pending::Transactions { results, reply, .. }) => {
                        let _ = reply.send(Ok(results));
                    }

                    Some(Pending::Headers { reply }) => {
                        let _ = reply.send(Err(PeerError::Timeout));
                    }

                    None => {}
                }
            }

            message = msg_rx.recv() => {
                match message {
                    Some(Ok(message)) => {
                        if let Err(error) =
                            handle_message(message, &mut writer, magic, &mut pending, &inv_tx).await
                        {
                            warn!(error:%; "peer connection failed");
                            break;
                        }
                    }

                    Some(Err(error)) => {
                        debug!(error:%; "peer read failed, closing connection");
                        break;
                    }

                    None => break,
                }
            }
        }
    }

    reader_task.abort();

    if let Some(pending) = pending.take() {
        fail_pending(pending);
    }
}

async fn start_request(
    writer: &mut (impl AsyncWrite + Unpin),
    magic: Magic,
    cmd: Command,
) -> Result<Pending, PeerError> {
    match cmd {
        Command::GetBlocks { hashes, reply } => {
            let inventory = hashes
                .iter()
                .map(|hash| Inventory::WitnessBlock(*hash))
                .collect();

            if let Err(error) =
                write_message(writer, magic, NetworkMessage::GetData(inventory)).await
            {
                let _ = reply.send(Err(error));
                return Err(PeerError::Closed);
            }

            let outstanding = hashes.len();
            Ok(Pending::Blocks {
                wanted: hashes
                    .into_iter()
                    .enumerate()
                    .map(|(index, hash)| (hash, index))
                    .collect(),
                results: vec![None; outstanding],
                reply,
                outstanding,
            })
        }

        Command::GetHeaders { locator, reply } => {
            use bitcoin::hashes::Hash;

            let message = GetHeadersMessage::new(locator, BlockHash::all_zeros());
            if let Err(error) =
                write_message(writer, magic, NetworkMessage::GetHeaders(message)).await
            {
                let _ = reply.send(Err(error));
                return Err(PeerError::Closed);
            }

            Ok(Pending::Headers { reply })
        }

        Command::GetTransactions { txids, reply } => {
            let inventory = txids
                .iter()
                .map(|txid| Inventory::WitnessTransaction(*txid))
                .collect();

            if let Err(error) =
                write_message(writer, magic, NetworkMessage::GetData(inventory)).await
            {
                let _ = reply.send(Err(error));
                return Err(PeerError::Closed);
            }

            let outstanding = txids.len();
            Ok(Pending::Transactions {
                wanted: txids
                    .into_iter()
                    .enumerate()
                    .map(|(index, txid)| (txid, index))
                    .collect(),
                results: vec![None; outstanding],
                reply,
                outstanding,
            })
        }
    }
}

async fn handle_message(
    message: NetworkMessage,
    writer: &mut (impl AsyncWrite + Unpin),
    magic: Magic,
    pending: &mut Option<Pending>,
    inv_tx: &broadcast::Sender<BlockHash>,
) -> Result<(), PeerError> {
    match message {
        NetworkMessage::Ping(nonce) => {
            write_message(writer, magic, NetworkMessage::Pong(nonce)).await?;
        }

        NetworkMessage::Inv(inventory) => {
            for item in inventory {
                if let Inventory::Block(hash) | Inventory::WitnessBlock(hash) = item {
                    let _ = inv_tx.send(hash);
                }
            }
        }

        NetworkMessage::Block(block) => {
            if let Some(Pending::Blocks {
                wanted,
                results,
                outstanding,
                ..
            }) = pending.as_mut()
            {
                if let Some(index) = wanted.remove(&block.block_hash()) {
                    results[index] = Some(block);
                    *outstanding -= 1;
                }

                if *outstanding == 0 {
                    if let Some(Pending::Blocks { results, reply, .. }) = pending.take() {
                        let _ = reply.send(Ok(results));
                    }
                }
            }
        }

        NetworkMessage::Headers(headers) => {
            if matches!(pending, Some(Pending::Headers { .. })) {
                if let Some(Pending::Headers { reply }) = pending.take() {
                    let _ = reply.send(Ok(headers));
                }
            }
        }

        NetworkMessage::Tx(tx) => {
            if let Some(Pending::Transactions {
                wanted,
                results,
                outstanding,
                ..
            }) = pending.as_mut()
            {
                if let Some(index) = wanted.remove(&tx.compute_txid()) {
                    results[index] = Some(tx);
                    *outstanding -= 1;
                }

                if *outstanding == 0 {
                    if let Some(Pending::Transactions { results, reply, .. }) = pending.take() {
                        let _ = reply.send(Ok(results));
                    }
                }
            }
        }

        NetworkMessage::NotFound(inventory) => {
            for item in inventory {
                match (item, pending.as_mut()) {
                    (
                        Inventory::Block(hash) | Inventory::WitnessBlock(hash),
                        Some(Pending::Blocks {
                            wanted,
                            outstanding,
                            ..
                        }),
                    ) => {
                        if wanted.remove(&hash).is_some() {
                            *outstanding -= 1;
                        }
                    }

                    (
                        Inventory::Transaction(txid) | Inventory::WitnessTransaction(txid),
                        Some(Pending::Transactions {
                            wanted,
                            outstanding,
                            ..
                        }),
                    ) => {
                        if wanted.remove(&txid).is_some() {
                            *outstanding -= 1;
                        }
                    }

                    _ => {}
                }
            }

            complete_if_done(pending);
        }

        // Everything else (addr, feefilter, sendheaders, ...) is irrelevant to the fetcher.
        _ => {}
    }

    Ok(())
}

fn complete_if_done(pending: &mut Option<Pending>) {
    let done = match pending {
        Some(Pending::Blocks { outstanding, .. }) => *outstanding == 0,
        Some(Pending::Transactions { outstanding, .. }) => *outstanding == 0,
        _ => false,
    };

    if done {
        match pending.take() {
            Some(Pending::Blocks { results, reply, .. }) => {
                let _ = reply.send(Ok(results));
            }

            Some(Pending::Transactions { results, reply, .. }) => {
                let _ = reply.send(Ok(results));
            }

            _ => {}
        }
    }
}

fn fail_pending(pending: Pending) {
    match pending {
        Pending::Blocks { reply, .. } => {
            let _ = reply.send(Err(PeerError::Closed));
        }

        Pending::Headers { reply } => {
            let _ = reply.send(Err(PeerError::Closed));
        }

        Pending::Transactions { reply, .. } => {
            let _ = reply.send(Err(PeerError::Closed));
        }
    }
}

async fn handshake(
    mut stream: TcpStream,
    magic: Magic,
    addr: SocketAddr,
) -> Result<TcpStream, PeerError> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default();
    let local = SocketAddr::from(([0, 0, 0, 0], 0));

    let version = VersionMessage::new(
        ServiceFlags::NONE,
        timestamp,
        Address::new(&addr, ServiceFlags::NONE),
        Address::new(&local, ServiceFlags::NONE),
        rand::random(),
        USER_AGENT.to_string(),
        0,
    );
    write_message(&mut stream, magic, NetworkMessage::Version(version)).await?;

    let mut version_received = false;
    let mut verack_received = false;
    while !(version_received && verack_received) {
        match read_message(&mut stream).await? {
            NetworkMessage::Version(_) => {
                version_received = true;
                write_message(&mut stream, magic, NetworkMessage::Verack).await?;
            }

            NetworkMessage::Verack => verack_received = true,

            _ => {}
        }
    }

    Ok(stream)
}

async fn read_message(
    reader: &mut (impl AsyncRead + Unpin),
) -> Result<NetworkMessage, PeerError> {
    let mut header = [0u8; MESSAGE_HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let payload_len =
        u32::from_le_bytes(header[16..20].try_into().expect("4 byte slice")) as usize;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(PeerError::Oversized(payload_len));
    }

    let mut message = vec![0u8; MESSAGE_HEADER_LEN + payload_len];
    message[..MESSAGE_HEADER_LEN].copy_from_slice(&header);
    reader.read_exact(&mut message[MESSAGE_HEADER_LEN..]).await?;

    let message = deserialize::<bitcoin::p2p::message::RawNetworkMessage>(&message)?;
    Ok(message.into_payload())
}

async fn write_message(
    writer: &mut (impl AsyncWrite + Unpin),
    magic: Magic,
    message: NetworkMessage,
) -> Result<(), PeerError> {
    let message = bitcoin::p2p::message::RawNetworkMessage::new(magic, message);
    writer.write_all(&serialize(&message)).await?;
    writer.flush().await?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer i/o failed")]
    Io(#[from] std::io::Error),

    #[error("cannot decode peer message")]
    Decode(#[from] bitcoin::consensus::encode::Error),

    #[error("peer connection closed")]
    Closed,

    #[error("peer request timed out")]
    Timeout,

    #[error("peer message too large: {0} bytes")]
    Oversized(usize),
}
