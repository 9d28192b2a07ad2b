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

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::de::DeserializeOwned;

/// Environment variable pointing at the YAML configuration file; defaults to `config.yaml` in the
/// working directory.
pub const CONFIG_FILE_ENV_VAR: &str = "CONFIG_FILE";

/// Extension trait to load a configuration from a YAML file overridden by prefixed environment
/// variables, e.g. `APP__NODE__URL` for the `url` field of the `node` section.
pub trait ConfigExt
where
    Self: DeserializeOwned,
{
    fn load() -> Result<Self, figment::Error> {
        let config_file =
            std::env::var(CONFIG_FILE_ENV_VAR).unwrap_or_else(|_| "config.yaml".to_string());

        Figment::new()
            .merge(Yaml::file(config_file))
            .merge(Env::prefixed("APP__").split("__"))
            .extract()
    }
}

impl<T> ConfigExt for T where T: DeserializeOwned {}

#[cfg(test)]
mod tests {
    use crate::config::ConfigExt;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Config {
        queue: QueueSection,
    }

    #[derive(Debug, Deserialize)]
    struct QueueSection {
        max_queue_size: u64,
    }

    #[test]
    fn test_load_from_env() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("APP__QUEUE__MAX_QUEUE_SIZE", "1048576");

            let config = Config::load().expect("config can be loaded");
            assert_eq!(config.queue.max_queue_size, 1_048_576);

            Ok(())
        });
    }
}
