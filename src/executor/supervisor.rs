//! The execution supervisor.
//!
//! One `Execute` call maps to one executor child process. The supervisor
//! spawns the child in the resolved working directory, hands the instruction
//! set over stdin, and multiplexes the child's stdout, stderr, a periodic
//! keepalive, and the exit waiter onto the call's response channel. All
//! emitters share one bounded mpsc sender, which is the serialization point
//! for the RPC stream.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use prost::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tonic::Status;
use uuid::Uuid;

use crate::proto::{ExecutionRequest, ExecutionResponse};
use crate::resource::{AllocationGuard, AllocationLedger, ComputeResource};

/// Matches typical pipe capacities; the RPC message is the batching unit, so
/// a larger buffer only adds latency.
const PUMP_BUFFER_SIZE: usize = 1024;

type ResponseSender = mpsc::Sender<Result<ExecutionResponse, Status>>;

pub struct Supervisor {
    ledger: Arc<AllocationLedger>,
    executor_bin: Option<PathBuf>,
    keepalive_interval: Duration,
}

impl Supervisor {
    pub fn new(
        ledger: Arc<AllocationLedger>,
        executor_bin: Option<PathBuf>,
        keepalive_interval: Duration,
    ) -> Self {
        Self {
            ledger,
            executor_bin,
            keepalive_interval,
        }
    }

    /// Runs one execution request to completion, reporting every outcome
    /// through `tx`. Caller cancellation is observed as `tx` closing.
    pub async fn run(&self, request: ExecutionRequest, work_dir: PathBuf, tx: ResponseSender) {
        let exec_id = Uuid::new_v4();
        if let Err(status) = self.execute(&request, &work_dir, &tx, exec_id).await {
            tracing::error!(
                exec_id = %exec_id,
                name = %request.name,
                error = %status,
                "Execution failed"
            );
            let _ = tx.send(Err(status)).await;
        }
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
        work_dir: &Path,
        tx: &ResponseSender,
        exec_id: Uuid,
    ) -> Result<(), Status> {
        let instructions = request
            .instructions
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("Instruction set cannot be empty"))?;

        let allocation = request
            .resource
            .clone()
            .map(ComputeResource::from)
            .unwrap_or_default();
        let _allocation = AllocationGuard::new(self.ledger.clone(), allocation);

        let executor = match &self.executor_bin {
            Some(path) => path.clone(),
            None => std::env::current_exe().map_err(|e| {
                Status::internal(format!("failed to locate agent executable: {e}"))
            })?,
        };

        let (system_before, user_before) = children_cpu_times();

        let mut child = Command::new(&executor)
            .arg("execute")
            .arg("--note")
            .arg(&request.name)
            .current_dir(work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                tracing::error!(
                    exec_id = %exec_id,
                    executor = %executor.display(),
                    work_dir = %work_dir.display(),
                    error = %e,
                    "Failed to spawn executor"
                );
                Status::internal(format!("failed to spawn executor: {e}"))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Status::internal("executor stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Status::internal("executor stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Status::internal("executor stderr not captured"))?;

        tracing::info!(
            exec_id = %exec_id,
            name = %request.name,
            work_dir = %work_dir.display(),
            "Executor started"
        );

        // The pumps must be running before the instruction write: a child
        // that starts emitting early would otherwise fill its pipe while we
        // are still blocked on stdin.
        let (err_tx, mut err_rx) = mpsc::channel::<Status>(3);
        let stdout_pump = tokio::spawn(pump_stdout(stdout, tx.clone(), err_tx.clone()));
        let stderr_pump = tokio::spawn(pump_stderr(stderr, tx.clone(), err_tx.clone()));
        drop(err_tx);

        let pulse_stop = CancellationToken::new();
        tokio::spawn(pulse(
            self.keepalive_interval,
            tx.clone(),
            pulse_stop.clone(),
        ));
        let _pulse_guard = pulse_stop.clone().drop_guard();

        // Instruction handoff: one contiguous write, then close stdin so the
        // child sees EOF and knows no further instructions follow.
        let encoded = instructions.encode_to_vec();
        let handoff = async {
            stdin.write_all(&encoded).await?;
            stdin.shutdown().await
        }
        .await;
        drop(stdin);
        if let Err(e) = handoff {
            // The child may already have read enough; it is left to exit on
            // EOF rather than being killed.
            tracing::error!(exec_id = %exec_id, error = %e, "Failed to write instruction set");
            return Err(Status::internal(format!(
                "failed to write instruction set: {e}"
            )));
        }

        // First-of rendezvous: caller cancellation, a pump error, or the
        // child exiting. `biased` polls cancellation first so a pump whose
        // send failed because the caller went away cannot mask the kill.
        enum Outcome {
            Cancelled,
            Failed(Status),
            Exited(std::process::ExitStatus),
            WaitFailed(std::io::Error),
        }

        let outcome = tokio::select! {
            biased;
            _ = tx.closed() => Outcome::Cancelled,
            Some(status) = err_rx.recv() => Outcome::Failed(status),
            wait = child.wait() => match wait {
                Ok(status) => Outcome::Exited(status),
                Err(e) => Outcome::WaitFailed(e),
            },
        };

        match outcome {
            Outcome::Cancelled => {
                tracing::info!(exec_id = %exec_id, name = %request.name, "Execution cancelled by caller");
                if let Err(e) = child.kill().await {
                    tracing::warn!(exec_id = %exec_id, error = %e, "Failed to kill executor");
                }
                Err(Status::cancelled("execution cancelled by caller"))
            }
            Outcome::Failed(status) => Err(status),
            Outcome::WaitFailed(e) => {
                Err(Status::internal(format!("failed to wait for executor: {e}")))
            }
            Outcome::Exited(status) if !status.success() => {
                tracing::error!(exec_id = %exec_id, name = %request.name, %status, "Executor failed");
                Err(Status::internal(format!("executor exited with {status}")))
            }
            Outcome::Exited(_) => {
                // Drain both pumps so the exit-stats message is the last one
                // on the stream, then stop the pulse before emitting it.
                let _ = stdout_pump.await;
                let _ = stderr_pump.await;
                pulse_stop.cancel();

                let (system_after, user_after) = children_cpu_times();
                let stats = ExecutionResponse {
                    system_time: (system_after - system_before).max(0.0),
                    user_time: (user_after - user_before).max(0.0),
                    ..Default::default()
                };
                tx.send(Ok(stats))
                    .await
                    .map_err(|_| Status::cancelled("caller went away before exit stats"))?;
                tracing::info!(exec_id = %exec_id, name = %request.name, "Executor finished");
                Ok(())
            }
        }
    }
}

/// Reads the child's stdout in chunks of up to [`PUMP_BUFFER_SIZE`] bytes
/// and emits each chunk verbatim as an output response.
async fn pump_stdout(mut reader: ChildStdout, tx: ResponseSender, err_tx: mpsc::Sender<Status>) {
    let mut buffer = [0u8; PUMP_BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buffer).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                let _ = err_tx
                    .send(Status::internal(format!("failed to read stdout: {e}")))
                    .await;
                return;
            }
        };
        let response = ExecutionResponse {
            output: buffer[..n].to_vec(),
            ..Default::default()
        };
        if tx.send(Ok(response)).await.is_err() {
            let _ = err_tx
                .send(Status::internal("failed to send stdout chunk"))
                .await;
            return;
        }
    }
}

/// Like [`pump_stdout`] for stderr, with each chunk also teed verbatim to
/// the agent's own stderr so the operator sees child diagnostics locally.
async fn pump_stderr(mut reader: ChildStderr, tx: ResponseSender, err_tx: mpsc::Sender<Status>) {
    let mut local_stderr = tokio::io::stderr();
    let mut buffer = [0u8; PUMP_BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buffer).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                let _ = err_tx
                    .send(Status::internal(format!("failed to read stderr: {e}")))
                    .await;
                return;
            }
        };
        if let Err(e) = local_stderr.write_all(&buffer[..n]).await {
            let _ = err_tx
                .send(Status::internal(format!("failed to tee stderr: {e}")))
                .await;
            return;
        }
        let response = ExecutionResponse {
            error: buffer[..n].to_vec(),
            ..Default::default()
        };
        if tx.send(Ok(response)).await.is_err() {
            let _ = err_tx
                .send(Status::internal("failed to send stderr chunk"))
                .await;
            return;
        }
    }
}

/// Emits an empty response every `interval` until stopped. Keeps proxies and
/// client timeouts from tearing down long executions with no output traffic.
async fn pulse(interval: Duration, tx: ResponseSender, stop: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {
                if tx.send(Ok(ExecutionResponse::default())).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// System and user CPU seconds accumulated by this process's reaped
/// children; exit stats report the delta around one execution.
fn children_cpu_times() -> (f64, f64) {
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
    // SAFETY: getrusage fills the out-parameter; RUSAGE_CHILDREN is a valid
    // target for the calling process.
    let rc = unsafe { libc::getrusage(libc::RUSAGE_CHILDREN, usage.as_mut_ptr()) };
    if rc != 0 {
        return (0.0, 0.0);
    }
    let usage = unsafe { usage.assume_init() };
    (
        timeval_seconds(usage.ru_stime),
        timeval_seconds(usage.ru_utime),
    )
}

fn timeval_seconds(tv: libc::timeval) -> f64 {
    tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0
}
