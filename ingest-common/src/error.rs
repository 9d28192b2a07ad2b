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

use std::error::Error as StdError;

/// A type-erased error which can be transferred across threads.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Extension methods for [std::error::Error].
pub trait StdErrorExt
where
    Self: StdError,
{
    /// Format this error including its whole source chain, separated by colons.
    fn display_chain(&self) -> String {
        let mut message = self.to_string();

        let mut source = self.source();
        while let Some(error) = source {
            message.push_str(&format!(": {error}"));
            source = error.source();
        }

        message
    }
}

impl<T: ?Sized> StdErrorExt for T where T: StdError {}

#[cfg(test)]
mod tests {
    use crate::error::StdErrorExt;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("outer")]
    struct Outer(#[source] Inner);

    #[derive(Debug, Error)]
    #[error("inner")]
    struct Inner;

    #[test]
    fn test_display_chain() {
        assert_eq!(Outer(Inner).display_chain(), "outer: inner");
    }
}
