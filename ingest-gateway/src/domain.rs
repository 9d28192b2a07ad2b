// This file is part of bitcoin-ingest.
// Copyright (C) 2025 Bitcoin Ingest Authors
// SPDX-License-Identifier: Apache-2.0

mod ack;
mod heartbeat;
mod publisher;
mod sender;
mod subscriber;
mod transport;

pub use ack::*;
pub use heartbeat::*;
pub use publisher::*;
pub use sender::*;
pub use subscriber::*;
pub use transport::*;
