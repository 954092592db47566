// Copyright 2025 coScene
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

// Sampler subprocess supervision driven by remote control commands
//
// One actor task owns the child. Commands are processed strictly in order,
// so a start queued behind a stop only runs after teardown finished.

use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Start,
    Stop,
}

#[derive(Deserialize)]
struct ControlMessage {
    command: String,
}

impl ControlCommand {
    /// Parse `{"command": "start"|"stop"}`, case-insensitive.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let message: ControlMessage = serde_json::from_slice(payload)
            .map_err(|e| PipelineError::Validation(format!("invalid control message: {}", e)))?;

        match message.command.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(ControlCommand::Start),
            "stop" => Ok(ControlCommand::Stop),
            other => Err(PipelineError::Validation(format!(
                "unknown command '{}'",
                other
            ))),
        }
    }
}

/// How to launch the producer subprocess.
#[derive(Debug, Clone)]
pub struct ProducerSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub stop_grace: Duration,
}

enum Request {
    Command(ControlCommand),
    Status(oneshot::Sender<Option<u32>>),
}

/// Cloneable handle to the supervisor actor.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<Request>,
}

impl SupervisorHandle {
    pub async fn send(&self, command: ControlCommand) -> Result<()> {
        self.tx
            .send(Request::Command(command))
            .await
            .map_err(|_| PipelineError::Transport("supervisor stopped".to_string()))
    }

    /// Pid of the running producer, after every earlier command was handled.
    pub async fn running_pid(&self) -> Result<Option<u32>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Status(reply))
            .await
            .map_err(|_| PipelineError::Transport("supervisor stopped".to_string()))?;
        rx.await
            .map_err(|_| PipelineError::Transport("supervisor stopped".to_string()))
    }
}

struct ManagedChild {
    child: Child,
    pid: Option<u32>,
}

impl ManagedChild {
    fn spawn(spec: &ProducerSpec) -> std::io::Result<Self> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let child = cmd.spawn()?;
        let pid = child.id();
        Ok(Self { child, pid })
    }

    fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL.
    async fn terminate(&mut self, grace: Duration) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!(pid, error = %e, "failed to send SIGTERM");
            }
        }
        #[cfg(not(unix))]
        let _ = self.child.start_kill();

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => info!(pid = ?self.pid, %status, "producer exited"),
            Ok(Err(e)) => warn!(pid = ?self.pid, error = %e, "error waiting for producer"),
            Err(_) => {
                warn!(pid = ?self.pid, ?grace, "producer ignored SIGTERM, killing");
                if let Err(e) = self.child.kill().await {
                    error!(pid = ?self.pid, error = %e, "failed to kill producer");
                }
            }
        }
    }
}

pub struct ProducerSupervisor {
    spec: ProducerSpec,
    child: Option<ManagedChild>,
    rx: mpsc::Receiver<Request>,
}

impl ProducerSupervisor {
    /// Start the actor. It stops (terminating any child) once every handle
    /// is dropped.
    pub fn spawn(spec: ProducerSpec) -> (SupervisorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(16);
        let supervisor = Self {
            spec,
            child: None,
            rx,
        };
        let task = tokio::spawn(supervisor.run());
        (SupervisorHandle { tx }, task)
    }

    async fn run(mut self) {
        info!(program = %self.spec.program.display(), "producer supervisor started");

        while let Some(request) = self.rx.recv().await {
            self.reap();
            match request {
                Request::Command(ControlCommand::Start) => self.start(),
                Request::Command(ControlCommand::Stop) => self.stop().await,
                Request::Status(reply) => {
                    let _ = reply.send(self.child.as_ref().and_then(|c| c.pid));
                }
            }
        }

        self.stop().await;
        info!("producer supervisor stopped");
    }

    /// Forget a child that exited on its own.
    fn reap(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if child.has_exited() {
                warn!(pid = ?child.pid, "producer exited on its own");
                self.child = None;
            }
        }
    }

    fn start(&mut self) {
        if let Some(child) = &self.child {
            info!(pid = ?child.pid, "producer already running, start ignored");
            return;
        }

        match ManagedChild::spawn(&self.spec) {
            Ok(child) => {
                info!(pid = ?child.pid, "producer started");
                self.child = Some(child);
            }
            Err(e) => error!(
                program = %self.spec.program.display(),
                error = %e,
                "failed to start producer"
            ),
        }
    }

    async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            info!("no producer running, stop ignored");
            return;
        };

        info!(pid = ?child.pid, "stopping producer");
        child.terminate(self.spec.stop_grace).await;
    }
}
