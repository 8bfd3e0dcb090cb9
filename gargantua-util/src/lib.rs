// Copyright 2025 The Gargantua Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub mod clock;
pub mod labels;
pub mod names;
pub mod retry;
pub mod task;
pub mod workqueue;

// Re-exported for `#[gargantua_test]`, so test crates do not need a direct
// tracing dependency.
#[doc(hidden)]
pub use tracing as __tracing;

/// Installs the global `tracing` subscriber. The filter defaults to `WARN`
/// and is overridden through `RUST_LOG`. Returns an error if called twice.
pub fn init_tracing() -> Result<(), gargantua_error::Error> {
    static LOGGING_INITIALIZED: parking_lot::Mutex<bool> = parking_lot::const_mutex(false);
    let mut logging_initialized_guard = LOGGING_INITIALIZED.lock();
    if *logging_initialized_guard {
        return Err(gargantua_error::make_err!(
            gargantua_error::Code::Internal,
            "Logging already initialized"
        ));
    }
    *logging_initialized_guard = true;
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing::metadata::LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init()
        .map_err(|e| {
            gargantua_error::make_err!(
                gargantua_error::Code::Internal,
                "Could not install tracing subscriber: {e}"
            )
        })
}
