//! harpoon のコンテナ操作
//!
//! エンジンの抽象（[`Engine`]）と Docker 実装、依存関係を考慮したランナーを提供します。

pub mod converter;
pub mod docker;
pub mod engine;
pub mod error;
pub mod intervention;
pub mod network;
pub mod port;
pub mod runner;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod waiter;

pub use converter::{SpecRequest, container_spec, ensure_bind_dirs};
pub use docker::DockerEngine;
pub use engine::*;
pub use error::*;
pub use intervention::{Intervener, NoIntervention, ShellIntervener};
pub use network::NetworkManager;
pub use port::{allocate_port, check_ports_available};
pub use runner::{RunOptions, RunSession, Runner, RunningContainer};
pub use waiter::{WaitOutcome, wait_for_ready};
