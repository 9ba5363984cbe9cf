//! Engine backed by an external tunneling binary
//!
//! The outbound is rendered into a full engine document, written to a
//! uniquely named file and passed as the last argument of the binary.
//! Readiness is taken from the first output line containing the configured
//! marker, or from a successful spawn when no marker is configured.

use super::{Engine, EngineHandle, EventSink};
use crate::config::EngineConfig;
use crate::error::{IntoVpnError, Result};
use crate::protocol::OutboundConfig;
use log::{debug, info, warn};
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use uuid::Uuid;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
#[cfg(unix)]
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Spawns the engine binary once per tunnel session
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    binary: PathBuf,
    args: Vec<String>,
    ready_marker: Option<String>,
    working_dir: Option<PathBuf>,
    log_level: String,
}

impl ProcessEngine {
    pub fn new(config: &EngineConfig, log_level: &str) -> Self {
        Self {
            binary: config.binary.clone(),
            args: config.args.clone(),
            ready_marker: config.ready_marker.clone(),
            working_dir: config.working_dir.clone(),
            log_level: log_level.to_string(),
        }
    }

    fn write_document(&self, config: &OutboundConfig) -> Result<PathBuf> {
        let dir = self.working_dir.clone().unwrap_or_else(std::env::temp_dir);
        let path = dir.join(format!("rbox-{}.json", Uuid::new_v4()));
        let document = config.to_engine_document(&self.log_level)?;
        fs::write(&path, serde_json::to_vec_pretty(&document)?)?;
        debug!("Wrote engine document to {}", path.display());
        Ok(path)
    }
}

impl Engine for ProcessEngine {
    fn launch(&self, config: &OutboundConfig, events: EventSink) -> Result<Box<dyn EngineHandle>> {
        let config_path = self.write_document(config)?;

        let mut command = Command::new(&self.binary);
        command
            .args(&self.args)
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let spawned = command
            .spawn()
            .into_vpn_error(&format!("Failed to spawn {}", self.binary.display()));
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let _ = fs::remove_file(&config_path);
                return Err(e);
            }
        };
        info!(
            "Engine {} started with pid {} for '{}'",
            self.binary.display(),
            child.id(),
            config.tag()
        );

        let ready = Arc::new(AtomicBool::new(false));
        let last_line = Arc::new(Mutex::new(String::new()));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(watch_output(
                stdout,
                self.ready_marker.clone(),
                ready.clone(),
                last_line.clone(),
                events.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(watch_output(
                stderr,
                self.ready_marker.clone(),
                ready.clone(),
                last_line.clone(),
                events.clone(),
            ));
        }

        if self.ready_marker.is_none() {
            ready.store(true, Ordering::SeqCst);
            events.ready();
        }

        let child = Arc::new(Mutex::new(child));
        let stopping = Arc::new(AtomicBool::new(false));
        let watcher = {
            let child = child.clone();
            let stopping = stopping.clone();
            thread::Builder::new()
                .name("rbox-engine-exit".to_string())
                .spawn(move || {
                    let status = wait_for_exit(&child);
                    for reader in readers {
                        let _ = reader.join();
                    }
                    let detail = last_line
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clone();
                    let reason = match status {
                        Some(status) => format!("engine exited with {status}"),
                        None => "engine exit status unavailable".to_string(),
                    };
                    let reason = if detail.is_empty() {
                        reason
                    } else {
                        format!("{reason}: {detail}")
                    };

                    if stopping.load(Ordering::SeqCst) {
                        events.stopped();
                    } else if ready.load(Ordering::SeqCst) {
                        events.crashed(reason);
                    } else {
                        events.error(reason);
                    }
                })
                .into_vpn_error("Failed to start engine exit watcher")?
        };

        Ok(Box::new(ProcessHandle {
            child,
            stopping,
            watcher: Some(watcher),
            config_path,
        }))
    }
}

fn watch_output<R: Read + Send + 'static>(
    stream: R,
    marker: Option<String>,
    ready: Arc<AtomicBool>,
    last_line: Arc<Mutex<String>>,
    events: EventSink,
) -> JoinHandle<()> {
    thread::spawn(move || {
        for line in BufReader::new(stream).lines() {
            let Ok(line) = line else { break };
            debug!("engine: {line}");

            if let Some(marker) = &marker {
                if line.contains(marker.as_str()) && !ready.swap(true, Ordering::SeqCst) {
                    events.ready();
                }
            }
            if !line.trim().is_empty() {
                *last_line.lock().unwrap_or_else(PoisonError::into_inner) = line;
            }
        }
    })
}

fn wait_for_exit(child: &Mutex<Child>) -> Option<ExitStatus> {
    loop {
        {
            let mut child = child.lock().unwrap_or_else(PoisonError::into_inner);
            match child.try_wait() {
                Ok(Some(status)) => return Some(status),
                Ok(None) => {}
                Err(e) => {
                    warn!("Failed to poll engine process: {e}");
                    return None;
                }
            }
        }
        thread::sleep(EXIT_POLL_INTERVAL);
    }
}

struct ProcessHandle {
    child: Arc<Mutex<Child>>,
    stopping: Arc<AtomicBool>,
    watcher: Option<JoinHandle<()>>,
    config_path: PathBuf,
}

impl ProcessHandle {
    fn terminate(&self) -> Result<()> {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        if child.try_wait()?.is_some() {
            return Ok(());
        }

        #[cfg(unix)]
        {
            if let Ok(pid) = libc::pid_t::try_from(child.id()) {
                // SAFETY: plain signal delivery to a child we spawned and have not reaped
                unsafe {
                    libc::kill(pid, libc::SIGTERM);
                }
                let deadline = Instant::now() + TERMINATE_GRACE;
                while Instant::now() < deadline {
                    if child.try_wait()?.is_some() {
                        return Ok(());
                    }
                    thread::sleep(EXIT_POLL_INTERVAL);
                }
                warn!("Engine ignored SIGTERM, killing pid {pid}");
            }
        }

        match child.kill() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl EngineHandle for ProcessHandle {
    fn shutdown(&mut self) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);
        let result = self.terminate();

        if let Some(watcher) = self.watcher.take() {
            if watcher.join().is_err() {
                warn!("Engine exit watcher panicked");
            }
        }
        if let Err(e) = fs::remove_file(&self.config_path) {
            debug!("Engine document {} not removed: {e}", self.config_path.display());
        }
        result
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.watcher.is_some() {
            self.stopping.store(true, Ordering::SeqCst);
            if let Err(e) = self.terminate() {
                warn!("Failed to terminate engine on drop: {e}");
            }
            let _ = fs::remove_file(&self.config_path);
        }
    }
}
