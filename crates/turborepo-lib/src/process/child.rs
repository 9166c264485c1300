use std::{
    io::Write,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::{mpsc, watch},
};
use tracing::debug;

use super::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Finished(Option<i32>),
    /// Killed by this process's shutdown request.
    Killed,
    /// Killed from outside, e.g. a user signalling the child directly.
    KilledExternal,
    Failed,
}

#[derive(Debug, Clone, Copy)]
pub enum ShutdownStyle {
    /// Ask nicely (SIGINT on unix), wait up to the timeout, then kill.
    Graceful(Duration),
    Kill,
}

#[derive(Debug)]
enum ChildCommand {
    Stop,
    Kill,
}

/// A handle to a spawned task command. Cloneable; all clones observe the
/// same exit. The process is killed if the monitor task is dropped with it
/// still running.
#[derive(Debug, Clone)]
pub struct Child {
    pid: Option<u32>,
    command_channel: mpsc::Sender<ChildCommand>,
    exit_channel: watch::Receiver<Option<ChildExit>>,
    stdout: Arc<Mutex<Option<tokio::process::ChildStdout>>>,
    stderr: Arc<Mutex<Option<tokio::process::ChildStderr>>>,
    label: String,
}

impl Child {
    pub fn spawn(command: Command, shutdown_style: ShutdownStyle) -> std::io::Result<Self> {
        let label = command.label();
        let mut cmd: tokio::process::Command = command.into();
        cmd.kill_on_drop(true);
        let mut child = cmd.spawn()?;
        let pid = child.id();
        let stdout = Arc::new(Mutex::new(child.stdout.take()));
        let stderr = Arc::new(Mutex::new(child.stderr.take()));

        let (command_tx, command_rx) = mpsc::channel(1);
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(monitor(child, shutdown_style, command_rx, exit_tx));

        Ok(Self {
            pid,
            command_channel: command_tx,
            exit_channel: exit_rx,
            stdout,
            stderr,
            label,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Waits for the child to exit without intervening.
    pub async fn wait(&mut self) -> Option<ChildExit> {
        let mut exit = self.exit_channel.clone();
        loop {
            if let Some(exit) = *exit.borrow() {
                return Some(exit);
            }
            if exit.changed().await.is_err() {
                return *exit.borrow();
            }
        }
    }

    /// Requests shutdown per the child's `ShutdownStyle` and waits for it to
    /// exit.
    pub async fn stop(&mut self) -> Option<ChildExit> {
        // A closed channel means the monitor already observed an exit.
        self.command_channel.send(ChildCommand::Stop).await.ok();
        self.wait().await
    }

    pub async fn kill(&mut self) -> Option<ChildExit> {
        self.command_channel.send(ChildCommand::Kill).await.ok();
        self.wait().await
    }

    /// Streams the child's stdout and stderr, line by line, into the given
    /// writer until the child exits. Both streams multiplex into one writer;
    /// the writer is expected to be line-atomic.
    pub async fn wait_with_piped_outputs<W: Write>(
        &mut self,
        mut stdout_pipe: W,
    ) -> Result<Option<ChildExit>, std::io::Error> {
        let stdout = self.stdout.lock().expect("child stdout mutex poisoned").take();
        let stderr = self.stderr.lock().expect("child stderr mutex poisoned").take();

        let mut stdout_lines = stdout.map(|stdout| BufReader::new(stdout).lines());
        let mut stderr_lines = stderr.map(|stderr| BufReader::new(stderr).lines());

        loop {
            tokio::select! {
                Some(line) = next_line(&mut stdout_lines) => {
                    let line = line?;
                    stdout_pipe.write_all(line.as_bytes())?;
                    stdout_pipe.write_all(b"\n")?;
                }
                Some(line) = next_line(&mut stderr_lines) => {
                    let line = line?;
                    stdout_pipe.write_all(line.as_bytes())?;
                    stdout_pipe.write_all(b"\n")?;
                }
                else => break,
            }
        }
        stdout_pipe.flush()?;

        Ok(self.wait().await)
    }
}

async fn next_line(
    lines: &mut Option<tokio::io::Lines<BufReader<impl tokio::io::AsyncRead + Unpin>>>,
) -> Option<std::io::Result<String>> {
    match lines {
        Some(reader) => match reader.next_line().await.transpose() {
            Some(line) => Some(line),
            None => {
                *lines = None;
                None
            }
        },
        None => None,
    }
}

async fn monitor(
    mut child: tokio::process::Child,
    shutdown_style: ShutdownStyle,
    command_rx: mpsc::Receiver<ChildCommand>,
    exit_tx: watch::Sender<Option<ChildExit>>,
) {
    let mut command_rx = Some(command_rx);
    let exit = loop {
        tokio::select! {
            status = child.wait() => {
                break match status {
                    Ok(status) => match status.code() {
                        Some(code) => ChildExit::Finished(Some(code)),
                        // Exited via a signal we never sent.
                        None => ChildExit::KilledExternal,
                    },
                    Err(_) => ChildExit::Failed,
                };
            }
            command = recv_command(&mut command_rx), if command_rx.is_some() => {
                match command {
                    Some(ChildCommand::Stop) => {
                        break shutdown(&mut child, shutdown_style).await;
                    }
                    Some(ChildCommand::Kill) => {
                        break shutdown(&mut child, ShutdownStyle::Kill).await;
                    }
                    None => {
                        // All handles dropped; keep waiting on the child.
                        command_rx = None;
                    }
                }
            }
        }
    };
    debug!("child process exited: {:?}", exit);
    exit_tx.send(Some(exit)).ok();
}

async fn recv_command(
    command_rx: &mut Option<mpsc::Receiver<ChildCommand>>,
) -> Option<ChildCommand> {
    match command_rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn shutdown(child: &mut tokio::process::Child, style: ShutdownStyle) -> ChildExit {
    match style {
        ShutdownStyle::Graceful(timeout) => {
            #[cfg(unix)]
            if let Some(pid) = child.id() {
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGINT);
                }
            }
            #[cfg(not(unix))]
            {
                // No polite signal to send; fall straight through to the
                // timeout-then-kill below by not waiting.
            }

            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(Ok(status)) => match status.code() {
                    Some(code) => ChildExit::Finished(Some(code)),
                    None => ChildExit::Killed,
                },
                Ok(Err(_)) => ChildExit::Failed,
                Err(_) => {
                    if child.kill().await.is_err() {
                        return ChildExit::Failed;
                    }
                    ChildExit::Killed
                }
            }
        }
        ShutdownStyle::Kill => {
            if child.kill().await.is_err() {
                return ChildExit::Failed;
            }
            ChildExit::Killed
        }
    }
}
