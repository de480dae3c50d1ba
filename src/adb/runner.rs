use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::error::AppError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

pub async fn run_command_with_timeout(
    program: &str,
    args: &[String],
    timeout: Duration,
    output_limit_bytes: usize,
    trace_id: &str,
) -> Result<CommandOutput, AppError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| AppError::system(format!("Failed to spawn command: {err}"), trace_id))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stdout", trace_id))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stderr", trace_id))?;

    // Drain stdout/stderr while waiting; otherwise a chatty child blocks once
    // the pipe buffer fills and the command "hangs" until the timeout.
    let collect = async {
        let stdout_read = read_capped(&mut stdout, output_limit_bytes);
        let stderr_read = read_capped(&mut stderr, output_limit_bytes);
        let (stdout_res, stderr_res) = tokio::join!(stdout_read, stderr_read);
        let (stdout_buf, stdout_truncated) = stdout_res
            .map_err(|err| AppError::system(format!("Failed to read stdout: {err}"), trace_id))?;
        let (stderr_buf, _) = stderr_res
            .map_err(|err| AppError::system(format!("Failed to read stderr: {err}"), trace_id))?;
        let status = child
            .wait()
            .await
            .map_err(|err| AppError::system(format!("Failed to wait for command: {err}"), trace_id))?;
        Ok::<_, AppError>((stdout_buf, stdout_truncated, stderr_buf, status.code()))
    };

    let (stdout_bytes, stdout_truncated, stderr_bytes, exit_code) =
        match tokio::time::timeout(timeout, collect).await {
            Ok(result) => result?,
            // kill_on_drop reaps the child when the collect future is dropped.
            Err(_) => return Err(AppError::system("Command timed out", trace_id)),
        };

    if stdout_truncated {
        return Err(AppError::output_limit(
            format!("Command output exceeded {output_limit_bytes} bytes"),
            trace_id,
        ));
    }

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        exit_code,
    })
}

/// Reads a stream to EOF, keeping at most `cap` bytes. Bytes past the cap are
/// discarded instead of left in the pipe, so an over-cap child still gets to
/// finish writing and exit rather than block on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(
    reader: &mut R,
    cap: usize,
) -> std::io::Result<(Vec<u8>, bool)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        if truncated {
            continue;
        }
        let keep = n.min(cap - buf.len());
        buf.extend_from_slice(&chunk[..keep]);
        if keep < n {
            truncated = true;
        }
    }
    Ok((buf, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 8 * 1024 * 1024;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let output = run_command_with_timeout(
            "sh",
            &["-c".to_string(), "echo hello".to_string()],
            Duration::from_secs(5),
            LIMIT,
            "test-trace",
        )
        .await
        .expect("command");
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.exit_code, Some(0));
    }

    #[tokio::test]
    async fn does_not_deadlock_on_large_stdout() {
        // Regression guard carried over from the thread-based runner: piped
        // but undrained stdout stalls the child at pipe-buffer size.
        let output = run_command_with_timeout(
            "sh",
            &[
                "-c".to_string(),
                "i=0; while [ $i -lt 100000 ]; do echo 1234567890; i=$((i+1)); done".to_string(),
            ],
            Duration::from_secs(10),
            LIMIT,
            "test-trace",
        )
        .await
        .expect("command");
        assert!(output.stdout.len() >= 1_000_000);
    }

    #[tokio::test]
    async fn kills_command_on_timeout() {
        let err = run_command_with_timeout(
            "sh",
            &["-c".to_string(), "sleep 30".to_string()],
            Duration::from_millis(100),
            LIMIT,
            "test-trace",
        )
        .await
        .expect_err("should time out");
        assert!(err.error.contains("timed out"));
    }

    #[tokio::test]
    async fn flags_output_over_the_cap() {
        let err = run_command_with_timeout(
            "sh",
            &["-c".to_string(), "echo 1234567890".to_string()],
            Duration::from_secs(5),
            4,
            "test-trace",
        )
        .await
        .expect_err("should exceed cap");
        assert!(err.is_output_limit());
    }

    #[tokio::test]
    async fn oversized_output_reports_the_cap_not_a_timeout() {
        // 2 MiB is far past the pipe buffer: the child only exits if the
        // reader keeps draining beyond the cap.
        let err = run_command_with_timeout(
            "sh",
            &[
                "-c".to_string(),
                "dd if=/dev/zero bs=65536 count=32 2>/dev/null".to_string(),
            ],
            Duration::from_secs(5),
            64 * 1024,
            "test-trace",
        )
        .await
        .expect_err("should exceed cap");
        assert!(err.is_output_limit(), "{}", err.error);
    }
}
