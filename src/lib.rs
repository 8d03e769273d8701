// Copyright 2025 Zhipu AI (Original Python implementation)
// Copyright 2025 ModerRAS (Rust implementation)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Mobile Agent
//!
//! Multi-agent automation of Android devices with vision-language models.
//!
//! A task runs as a sequence of steps. Each step captures the screen, lets a
//! Manager keep a plan, an Executor pick one action, dispatches it through
//! ADB, and has a Reflector judge the result while a Notetaker keeps facts
//! for later steps. A single-agent engine is available as an alternative.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mobile_agent::adb::AdbDevice;
//! use mobile_agent::agent::{RunOptions, TaskRunner};
//! use mobile_agent::model::{ModelClient, ModelConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let model = ModelClient::new(
//!         ModelConfig::default()
//!             .with_base_url("http://localhost:8000/v1")
//!             .with_model_name("gui-owl-7b"),
//!     );
//!     let runner = TaskRunner::new(
//!         Arc::new(model),
//!         Arc::new(AdbDevice::new(None)),
//!         RunOptions::default().with_max_steps(20),
//!     );
//!
//!     let result = runner.run("Open Settings", CancellationToken::new()).await;
//!     println!("{:?}: {}", result.status, result.final_note);
//! }
//! ```

pub mod actions;
pub mod adb;
pub mod agent;
pub mod artifacts;
pub mod config;
pub mod device;
pub mod model;
pub mod perception;
pub mod settings;

#[cfg(test)]
mod testing;

pub use actions::{Action, ActionValidator, BoundsPolicy};
pub use agent::{
    EngineKind, Event, EventKind, RunOptions, RunResult, RunStatus, TaskRunner, TerminalReason,
};
pub use device::{DeviceAdapter, DeviceError};
pub use model::{ModelClient, ModelConfig, ModelGateway};
pub use settings::AppSettings;
