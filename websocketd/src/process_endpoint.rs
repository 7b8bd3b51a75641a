use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt as _, AsyncReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio::time::timeout;
use websocketd_task::spawn_in_span;

use crate::endpoint::{Endpoint, FramingMode, Message, MessageReceiver};
use crate::launcher::LaunchedProcess;

/// Upper bound on unread child output held for a slow consumer.
const MAX_BACKLOG_BYTES: usize = 1024 * 1024;
/// How long the stdout reader waits on the consumer before giving up on the
/// whole session. Dropping the session beats stalling the child.
const RECEIVER_TIMEOUT: Duration = Duration::from_secs(3);
/// Binary-mode reads are chunked at this size.
const BINARY_CHUNK_SIZE: usize = 64 * 1024;
const OUTPUT_CHANNEL_CAPACITY: usize = 32;

const STDIN_CLOSE_WAIT: Duration = Duration::from_millis(100);
const SIGINT_WAIT: Duration = Duration::from_millis(250);
const SIGTERM_WAIT: Duration = Duration::from_millis(500);
const SIGKILL_WAIT: Duration = Duration::from_millis(1000);

/// Typed endpoint around a running child process.
///
/// Owns the child and its three pipes exclusively. `start_reading` spawns
/// the stdout reader, the stderr logger, and the reaper; the reaper is the
/// only task that observes the exit and flips the endpoint to terminated.
pub struct ProcessEndpoint {
    mode: FramingMode,
    close_grace: Duration,
    pid: Option<u32>,
    child: Option<Child>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    terminate_notify: Arc<Notify>,
    exited_tx: Option<watch::Sender<bool>>,
    exited_rx: watch::Receiver<bool>,
    output_tx: Option<mpsc::Sender<Message>>,
    output_rx: Option<MessageReceiver>,
    backlog: Arc<AtomicUsize>,
}

impl ProcessEndpoint {
    pub fn new(launched: LaunchedProcess, mode: FramingMode, close_grace: Duration) -> Self {
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (exited_tx, exited_rx) = watch::channel(false);
        let backlog = Arc::new(AtomicUsize::new(0));

        Self {
            mode,
            close_grace,
            pid: launched.pid,
            child: Some(launched.child),
            stdin: Arc::new(Mutex::new(Some(launched.stdin))),
            stdout: Some(launched.stdout),
            stderr: Some(launched.stderr),
            terminate_notify: Arc::new(Notify::new()),
            exited_tx: Some(exited_tx),
            exited_rx,
            output_tx: Some(output_tx),
            output_rx: Some(MessageReceiver::with_backlog(output_rx, Arc::clone(&backlog))),
            backlog,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

#[async_trait]
impl Endpoint for ProcessEndpoint {
    fn start_reading(&mut self) {
        let (Some(child), Some(stdout), Some(stderr), Some(output_tx), Some(exited_tx)) = (
            self.child.take(),
            self.stdout.take(),
            self.stderr.take(),
            self.output_tx.take(),
            self.exited_tx.take(),
        ) else {
            return;
        };

        spawn_in_span(reap(
            child,
            Arc::clone(&self.stdin),
            Arc::clone(&self.terminate_notify),
            exited_tx,
            self.close_grace,
        ));

        let backlog = Arc::clone(&self.backlog);
        let terminate = Arc::clone(&self.terminate_notify);
        match self.mode {
            FramingMode::Text => {
                spawn_in_span(read_stdout_lines(stdout, output_tx, backlog, terminate));
            }
            FramingMode::Binary => {
                spawn_in_span(read_stdout_chunks(stdout, output_tx, backlog, terminate));
            }
        }

        spawn_in_span(log_stderr(stderr));
    }

    fn output(&mut self) -> Option<MessageReceiver> {
        self.output_rx.take()
    }

    async fn send(&mut self, msg: Message) -> bool {
        if *self.exited_rx.borrow() {
            return false;
        }

        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return false;
        };

        let result: io::Result<()> = async {
            match &msg {
                Message::Text(text) => {
                    stdin.write_all(text.as_bytes()).await?;
                    stdin.write_all(b"\n").await?;
                }
                Message::Binary(data) => stdin.write_all(data).await?,
            }
            stdin.flush().await
        }
        .await;

        match result {
            Ok(()) => true,
            Err(error) => {
                info!(%error, "unable to write to process");
                false
            }
        }
    }

    async fn terminate(&mut self) {
        if let Some(mut child) = self.child.take() {
            // The reaper was never spawned; nothing gentle is owed to a
            // child whose session never started.
            self.stdin.lock().await.take();
            let _ = child.start_kill();
            let _ = child.wait().await;
            if let Some(exited_tx) = self.exited_tx.take() {
                let _ = exited_tx.send(true);
            }
            return;
        }

        self.terminate_notify.notify_one();
        let _ = self.exited_rx.wait_for(|exited| *exited).await;
    }
}

async fn reap(
    mut child: Child,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    terminate: Arc<Notify>,
    exited: watch::Sender<bool>,
    close_grace: Duration,
) {
    let status = tokio::select! {
        result = child.wait() => result,
        _ = terminate.notified() => escalate(&mut child, &stdin, close_grace).await,
    };

    match status {
        Ok(status) => debug!(%status, "process completed"),
        Err(error) => debug!(%error, "failed to reap process"),
    }

    let _ = exited.send(true);
}

/// Stop the child, politely first: close stdin, then SIGINT, SIGTERM and
/// finally SIGKILL, with a short wait after each step. A step is skipped as
/// soon as the child is observed to exit.
async fn escalate(
    child: &mut Child,
    stdin: &Mutex<Option<ChildStdin>>,
    close_grace: Duration,
) -> io::Result<ExitStatus> {
    if !close_grace.is_zero() {
        if let Ok(result) = timeout(close_grace, child.wait()).await {
            return result;
        }
    }

    // try_lock: a writer blocked on a full pipe may hold the lock, and the
    // ladder must keep moving towards the signals that unblock it.
    if let Ok(mut guard) = stdin.try_lock() {
        guard.take();
    }
    if let Ok(result) = timeout(STDIN_CLOSE_WAIT, child.wait()).await {
        return result;
    }

    send_signal(child, StopSignal::Interrupt);
    if let Ok(result) = timeout(SIGINT_WAIT, child.wait()).await {
        return result;
    }

    send_signal(child, StopSignal::Terminate);
    if let Ok(result) = timeout(SIGTERM_WAIT, child.wait()).await {
        return result;
    }

    debug!("process did not react to polite signals, sending SIGKILL");
    let _ = child.start_kill();
    match timeout(SIGKILL_WAIT, child.wait()).await {
        Ok(result) => result,
        Err(_) => child.wait().await,
    }
}

#[derive(Clone, Copy)]
enum StopSignal {
    Interrupt,
    Terminate,
}

#[cfg(unix)]
fn send_signal(child: &Child, signal: StopSignal) {
    let Some(pid) = child.id() else {
        return;
    };
    let Ok(pid) = i32::try_from(pid) else {
        return;
    };
    let number = match signal {
        StopSignal::Interrupt => libc::SIGINT,
        StopSignal::Terminate => libc::SIGTERM,
    };
    // SAFETY: kill(2) with a pid we own and a valid signal number.
    unsafe {
        libc::kill(pid, number);
    }
}

/// Polite signals do not exist here; the escalation falls through to the
/// SIGKILL-equivalent `start_kill`.
#[cfg(not(unix))]
fn send_signal(_child: &Child, _signal: StopSignal) {}

async fn read_stdout_lines(
    stdout: ChildStdout,
    tx: mpsc::Sender<Message>,
    backlog: Arc<AtomicUsize>,
    terminate: Arc<Notify>,
) {
    let mut reader = BufReader::new(stdout);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("process STDOUT closed");
                break;
            }
            Ok(_) => {
                let trimmed = trim_eol(&line);
                if trimmed.is_empty() {
                    continue;
                }
                if !enqueue(&tx, &backlog, &terminate, Message::Text(trimmed.to_owned())).await {
                    break;
                }
            }
            Err(error) => {
                debug!(%error, "STDOUT stream ended");
                break;
            }
        }
    }
}

async fn read_stdout_chunks(
    mut stdout: ChildStdout,
    tx: mpsc::Sender<Message>,
    backlog: Arc<AtomicUsize>,
    terminate: Arc<Notify>,
) {
    let mut buf = vec![0u8; BINARY_CHUNK_SIZE];

    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => {
                debug!("process STDOUT closed");
                break;
            }
            Ok(n) => {
                let chunk = Message::Binary(Bytes::copy_from_slice(&buf[..n]));
                if !enqueue(&tx, &backlog, &terminate, chunk).await {
                    break;
                }
            }
            Err(error) => {
                debug!(%error, "STDOUT stream ended");
                break;
            }
        }
    }
}

/// Hand one message to the consumer, enforcing the backlog policy: when the
/// byte budget is exceeded or the consumer does not pick the message up in
/// time, termination is initiated and the output stream closes.
async fn enqueue(
    tx: &mpsc::Sender<Message>,
    backlog: &AtomicUsize,
    terminate: &Notify,
    msg: Message,
) -> bool {
    let size = msg.len();

    if backlog.fetch_add(size, Ordering::Relaxed) + size > MAX_BACKLOG_BYTES {
        warn!("process output backlog limit exceeded, dropping session");
        terminate.notify_one();
        return false;
    }

    match tx.send_timeout(msg, RECEIVER_TIMEOUT).await {
        Ok(()) => true,
        Err(SendTimeoutError::Timeout(_)) => {
            warn!("consumer too slow for process output, dropping session");
            terminate.notify_one();
            false
        }
        Err(SendTimeoutError::Closed(_)) => false,
    }
}

pub(crate) async fn log_stderr(stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("process STDERR closed");
                break;
            }
            Ok(_) => {
                let trimmed = trim_eol(&line);
                if !trimmed.is_empty() {
                    error!(target: "stderr", "{trimmed}");
                }
            }
            Err(error) => {
                debug!(%error, "STDERR stream ended");
                break;
            }
        }
    }
}

/// Cut a unixy `\n` or windowsy `\r\n` suffix from the line.
pub fn trim_eol(line: &str) -> &str {
    match line.strip_suffix('\n') {
        Some(rest) => rest.strip_suffix('\r').unwrap_or(rest),
        None => line,
    }
}
