//! Local process controller
//!
//! Supervises server processes as children of the host controller using
//! tokio::process. Outcomes are reported as `ProcessEvent`s on an unbounded
//! channel, like a remote supervisor would.

use crate::domain::constants::{DESTROY_GRACE_PERIOD, UNSTABLE_UPTIME};
use crate::domain::ports::{AddProcessRequest, ProcessControllerClient, ProcessEvent, StdinSink};
use crate::domain::{DomainError, ProcessInfo};
use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

struct ProcessEntry {
    request: AddProcessRequest,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    stopping: bool,
}

type ProcessTable = Arc<Mutex<HashMap<String, ProcessEntry>>>;

pub struct LocalProcessController {
    processes: ProcessTable,
    events: UnboundedSender<ProcessEvent>,
}

fn lock(table: &ProcessTable) -> MutexGuard<'_, HashMap<String, ProcessEntry>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

fn not_found(process_name: &str) -> DomainError {
    DomainError::ProcessController(format!("unknown process {process_name}"))
}

fn send_signal(process_name: &str, pid: u32, sig: Signal) -> Result<(), DomainError> {
    let raw = i32::try_from(pid)
        .map_err(|_| DomainError::ProcessController(format!("invalid pid {pid}")))?;
    debug!(process = %process_name, pid, signal = ?sig, "Sending signal");
    signal::kill(Pid::from_raw(raw), sig)
        .map_err(|e| DomainError::process_controller(&format!("signal {process_name}"), e))
}

impl LocalProcessController {
    pub fn new(events: UnboundedSender<ProcessEvent>) -> Self {
        Self {
            processes: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    fn emit(&self, event: ProcessEvent) {
        if self.events.send(event).is_err() {
            debug!("Process event receiver dropped");
        }
    }

    fn running_pid(&self, process_name: &str) -> Result<Option<u32>, DomainError> {
        lock(&self.processes)
            .get(process_name)
            .map(|entry| entry.pid)
            .ok_or_else(|| not_found(process_name))
    }

    fn spawn(request: &AddProcessRequest) -> Result<Child, DomainError> {
        let Some((program, args)) = request.command.split_first() else {
            return Err(DomainError::ProcessController(format!(
                "empty command for {}",
                request.process_name
            )));
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(&request.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        if let Some(dir) = &request.working_dir {
            command.current_dir(dir);
        }

        command.spawn().map_err(|e| {
            DomainError::process_controller(&format!("spawn {}", request.process_name), e)
        })
    }

    /// Wait for the child to exit and report it
    fn watch_exit(&self, process_name: String, pid: u32, mut child: Child) {
        let processes = self.processes.clone();
        let events = self.events.clone();
        let started_at = Instant::now();

        tokio::spawn(async move {
            let status = child.wait().await;
            let uptime = started_at.elapsed();

            {
                let mut table = lock(&processes);
                if let Some(entry) = table.get_mut(&process_name)
                    && entry.pid == Some(pid)
                {
                    entry.pid = None;
                    entry.stdin = None;
                    entry.stopping = false;
                }
            }

            match status {
                Ok(status) => {
                    info!(process = %process_name, pid, status = %status, "Process exited")
                }
                Err(e) => {
                    warn!(process = %process_name, pid, error = %e, "Failed to wait for process")
                }
            }

            if uptime < UNSTABLE_UPTIME {
                let _ = events.send(ProcessEvent::Unstable {
                    process_name: process_name.clone(),
                });
            }
            let _ = events.send(ProcessEvent::Stopped {
                process_name,
                uptime,
            });
        });
    }
}

#[async_trait]
impl ProcessControllerClient for LocalProcessController {
    async fn add_process(&self, request: AddProcessRequest) -> Result<(), DomainError> {
        let process_name = request.process_name.clone();
        {
            let mut table = lock(&self.processes);
            if table.contains_key(&process_name) {
                return Err(DomainError::ProcessController(format!(
                    "process {process_name} already added"
                )));
            }
            table.insert(
                process_name.clone(),
                ProcessEntry {
                    request,
                    pid: None,
                    stdin: None,
                    stopping: false,
                },
            );
        }
        debug!(process = %process_name, "Process added");
        self.emit(ProcessEvent::Added { process_name });
        Ok(())
    }

    async fn start_process(&self, process_name: &str) -> Result<(), DomainError> {
        let (pid, child) = {
            let mut table = lock(&self.processes);
            let entry = table
                .get_mut(process_name)
                .ok_or_else(|| not_found(process_name))?;
            if let Some(pid) = entry.pid {
                return Err(DomainError::ProcessController(format!(
                    "process {process_name} already running with pid {pid}"
                )));
            }

            let mut child = Self::spawn(&entry.request)?;
            let pid = child.id().ok_or_else(|| {
                DomainError::ProcessController(format!("process {process_name} exited at spawn"))
            })?;
            entry.pid = Some(pid);
            entry.stdin = child.stdin.take();
            entry.stopping = false;
            (pid, child)
        };

        info!(process = %process_name, pid, "Process started");
        self.emit(ProcessEvent::Started {
            process_name: process_name.to_string(),
        });
        self.watch_exit(process_name.to_string(), pid, child);
        Ok(())
    }

    async fn send_stdin(&self, process_name: &str) -> Result<StdinSink, DomainError> {
        let mut table = lock(&self.processes);
        let entry = table
            .get_mut(process_name)
            .ok_or_else(|| not_found(process_name))?;
        let stdin = entry.stdin.take().ok_or_else(|| {
            DomainError::ProcessController(format!("stdin of {process_name} not available"))
        })?;
        Ok(Box::pin(stdin))
    }

    async fn stop_process(&self, process_name: &str) -> Result<(), DomainError> {
        let pid = {
            let mut table = lock(&self.processes);
            let entry = table
                .get_mut(process_name)
                .ok_or_else(|| not_found(process_name))?;
            entry.stopping = entry.pid.is_some();
            entry.pid
        };

        match pid {
            Some(pid) => send_signal(process_name, pid, Signal::SIGTERM),
            None => {
                debug!(process = %process_name, "Process not running, reporting stopped");
                self.emit(ProcessEvent::Stopped {
                    process_name: process_name.to_string(),
                    uptime: std::time::Duration::ZERO,
                });
                Ok(())
            }
        }
    }

    async fn destroy_process(&self, process_name: &str) -> Result<(), DomainError> {
        let Some(pid) = self.running_pid(process_name)? else {
            return Ok(());
        };
        send_signal(process_name, pid, Signal::SIGTERM)?;

        let processes = self.processes.clone();
        let process_name = process_name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(DESTROY_GRACE_PERIOD).await;
            let still_running = lock(&processes)
                .get(&process_name)
                .is_some_and(|entry| entry.pid == Some(pid));
            if still_running {
                warn!(process = %process_name, pid, "Process ignored SIGTERM, sending SIGKILL");
                if let Err(e) = send_signal(&process_name, pid, Signal::SIGKILL) {
                    debug!(process = %process_name, error = %e, "SIGKILL failed");
                }
            }
        });
        Ok(())
    }

    async fn kill_process(&self, process_name: &str) -> Result<(), DomainError> {
        match self.running_pid(process_name)? {
            Some(pid) => send_signal(process_name, pid, Signal::SIGKILL),
            None => Ok(()),
        }
    }

    async fn remove_process(&self, process_name: &str) -> Result<(), DomainError> {
        {
            let mut table = lock(&self.processes);
            match table.get(process_name) {
                None => return Err(not_found(process_name)),
                Some(entry) if entry.pid.is_some() => {
                    return Err(DomainError::ProcessController(format!(
                        "process {process_name} is still running"
                    )));
                }
                Some(_) => {
                    table.remove(process_name);
                }
            }
        }
        debug!(process = %process_name, "Process removed");
        self.emit(ProcessEvent::Removed {
            process_name: process_name.to_string(),
        });
        Ok(())
    }

    async fn reconnect_process(
        &self,
        process_name: &str,
        _auth_token: &str,
    ) -> Result<(), DomainError> {
        // Children do not survive the controller, so only live children can reconnect
        match self.running_pid(process_name)? {
            Some(pid) => {
                debug!(process = %process_name, pid, "Reconnect requested");
                Ok(())
            }
            None => Err(DomainError::ProcessController(format!(
                "process {process_name} is not running"
            ))),
        }
    }

    async fn request_process_inventory(&self) -> Result<(), DomainError> {
        let inventory: HashMap<String, ProcessInfo> = lock(&self.processes)
            .iter()
            .map(|(name, entry)| {
                (
                    name.clone(),
                    ProcessInfo {
                        process_name: name.clone(),
                        running: entry.pid.is_some(),
                        stopping: entry.stopping,
                    },
                )
            })
            .collect();
        self.emit(ProcessEvent::Inventory(inventory));
        Ok(())
    }
}
