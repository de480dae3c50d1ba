pub mod runner;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::AppError;
pub use runner::CommandOutput;

/// Seam between the observation core and the device control tool. Every
/// probe goes through this trait, so tests script it and platforms swap it.
#[async_trait]
pub trait DeviceExecutor: Send + Sync {
    async fn run(
        &self,
        serial: &str,
        args: &[String],
        timeout: Duration,
        trace_id: &str,
    ) -> Result<CommandOutput, AppError>;
}

/// Runs `adb -s <serial> …` against the host adb binary.
pub struct AdbExecutor {
    adb_path: String,
    output_limit_bytes: usize,
}

impl AdbExecutor {
    pub fn new(adb_path: impl Into<String>, output_limit_bytes: usize) -> Self {
        Self {
            adb_path: adb_path.into(),
            output_limit_bytes,
        }
    }
}

#[async_trait]
impl DeviceExecutor for AdbExecutor {
    async fn run(
        &self,
        serial: &str,
        args: &[String],
        timeout: Duration,
        trace_id: &str,
    ) -> Result<CommandOutput, AppError> {
        let mut full_args = vec!["-s".to_string(), serial.to_string()];
        full_args.extend_from_slice(args);
        runner::run_command_with_timeout(
            &self.adb_path,
            &full_args,
            timeout,
            self.output_limit_bytes,
            trace_id,
        )
        .await
    }
}

/// Runs `idb … --udid <serial>` for iOS targets.
pub struct IdbExecutor {
    idb_path: String,
    output_limit_bytes: usize,
}

impl IdbExecutor {
    pub fn new(idb_path: impl Into<String>, output_limit_bytes: usize) -> Self {
        Self {
            idb_path: idb_path.into(),
            output_limit_bytes,
        }
    }
}

#[async_trait]
impl DeviceExecutor for IdbExecutor {
    async fn run(
        &self,
        serial: &str,
        args: &[String],
        timeout: Duration,
        trace_id: &str,
    ) -> Result<CommandOutput, AppError> {
        let mut full_args = args.to_vec();
        full_args.push("--udid".to_string());
        full_args.push(serial.to_string());
        runner::run_command_with_timeout(
            &self.idb_path,
            &full_args,
            timeout,
            self.output_limit_bytes,
            trace_id,
        )
        .await
    }
}

/// Convenience for `adb shell <command>`.
pub async fn shell(
    executor: &dyn DeviceExecutor,
    serial: &str,
    command: &str,
    timeout: Duration,
    trace_id: &str,
) -> Result<CommandOutput, AppError> {
    executor
        .run(
            serial,
            &["shell".to_string(), command.to_string()],
            timeout,
            trace_id,
        )
        .await
}
