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

mod block;
mod connection_manager;
mod iterator;
mod loader;
mod merkle;
mod normalizer;
mod provider;
mod queue;

pub use block::*;
pub use connection_manager::*;
pub use iterator::*;
pub use loader::*;
pub use merkle::*;
pub use normalizer::*;
pub use provider::*;
pub use queue::*;
