//! PTY host: the process side of a session.
//!
//! [`PtyHost`] is the contract the emulation consumes: push bytes to the
//! child, propagate window-size changes. Events travel the other way as
//! [`PtyEvent`]s on a channel. [`LocalPty`] implements the contract over a
//! local pseudo-terminal with dedicated reader and writer threads; writes
//! are batched and both threads are panic-guarded so a broken PTY surfaces
//! as an `Exit` event instead of a crash.

use std::io::{Read, Write};
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};

/// Events from the PTY up to the session.
#[derive(Debug)]
pub enum PtyEvent {
    /// Output bytes from the child.
    Data(Vec<u8>),
    /// The child exited; the code is unavailable when it died on a signal.
    Exit(Option<u32>),
}

/// What the core needs from a pseudo-terminal host.
pub trait PtyHost: Send + Sync {
    /// Re-propagate the window size to the child (SIGWINCH side).
    fn set_size(&self, lines: u16, columns: u16);
    /// Write bytes to the PTY master.
    fn send_bytes(&self, data: &[u8]);
}

/// Shared shutdown coordination between the reader and writer threads.
struct PtyShutdownState {
    broken: AtomicBool,
}

impl PtyShutdownState {
    fn new() -> Self {
        Self {
            broken: AtomicBool::new(false),
        }
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Relaxed)
    }

    fn mark_broken(&self) {
        self.broken.store(true, Ordering::Relaxed);
    }
}

/// Extract a human-readable message from a panic payload.
fn format_panic(payload: &dyn std::any::Any) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A local pseudo-terminal running one child process.
pub struct LocalPty {
    master: Mutex<Box<dyn MasterPty + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    input_tx: Sender<Vec<u8>>,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<PtyShutdownState>,
}

impl LocalPty {
    /// Start `program args...` under a fresh PTY with `TERM=term` and the
    /// given initial size. Returns the host plus the event stream.
    pub fn spawn(
        program: &str,
        args: &[String],
        term: &str,
        cwd: Option<&Path>,
        lines: u16,
        columns: u16,
    ) -> Result<(Arc<Self>, Receiver<PtyEvent>)> {
        let pty_system = native_pty_system();
        let pair = pty_system.openpty(PtySize {
            rows: lines,
            cols: columns,
            pixel_width: 0,
            pixel_height: 0,
        })?;

        let mut cmd = CommandBuilder::new(program);
        for arg in args {
            cmd.arg(arg);
        }
        cmd.env("TERM", term);
        if let Some(cwd) = cwd {
            cmd.cwd(cwd);
        }

        let child = pair.slave.spawn_command(cmd)?;
        let child_pid = child.process_id();

        let reader = pair.master.try_clone_reader()?;
        let writer = pair.master.take_writer()?;

        let (event_tx, event_rx) = crossbeam_channel::bounded::<PtyEvent>(4096);
        let (input_tx, input_rx) = crossbeam_channel::unbounded::<Vec<u8>>();
        let shutdown = Arc::new(PtyShutdownState::new());

        let reader_shutdown = Arc::clone(&shutdown);
        let reader_tx = event_tx.clone();
        let reader_handle = std::thread::Builder::new()
            .name("pty-reader".into())
            .spawn(move || {
                let tx_panic = reader_tx.clone();
                let shutdown_panic = Arc::clone(&reader_shutdown);
                if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    Self::read_loop(reader, reader_tx, reader_shutdown, child_pid);
                })) {
                    log::error!("PTY reader thread panicked: {}", format_panic(&*panic));
                    shutdown_panic.mark_broken();
                    let _ = tx_panic.send(PtyEvent::Exit(None));
                }
            })?;

        let writer_shutdown = Arc::clone(&shutdown);
        let writer_tx = event_tx;
        let writer_handle = std::thread::Builder::new()
            .name("pty-writer".into())
            .spawn(move || {
                let tx_panic = writer_tx.clone();
                let shutdown_panic = Arc::clone(&writer_shutdown);
                if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    Self::write_loop(writer, input_rx, writer_shutdown, writer_tx);
                })) {
                    log::error!("PTY writer thread panicked: {}", format_panic(&*panic));
                    shutdown_panic.mark_broken();
                    let _ = tx_panic.send(PtyEvent::Exit(None));
                }
            })?;

        let host = Arc::new(Self {
            master: Mutex::new(pair.master),
            child: Mutex::new(child),
            input_tx,
            reader_handle: Mutex::new(Some(reader_handle)),
            writer_handle: Mutex::new(Some(writer_handle)),
            shutdown,
        });
        Ok((host, event_rx))
    }

    fn read_loop(
        mut reader: Box<dyn Read + Send>,
        tx: Sender<PtyEvent>,
        shutdown: Arc<PtyShutdownState>,
        child_pid: Option<u32>,
    ) {
        let mut buf = [0u8; 65536];
        loop {
            if shutdown.is_broken() {
                log::debug!("PTY reader stopping: shutdown signaled");
                break;
            }
            match reader.read(&mut buf) {
                Ok(0) => {
                    // EOF: the child exited.
                    let exit_code = child_pid.and_then(wait_for_exit_code);
                    let _ = tx.send(PtyEvent::Exit(exit_code));
                    break;
                }
                Ok(n) => {
                    if shutdown.is_broken() {
                        break;
                    }
                    // send blocks when the channel is full (backpressure);
                    // an error means the session is gone.
                    if tx.send(PtyEvent::Data(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    if !shutdown.is_broken() {
                        log::error!("PTY read error: {e}");
                    }
                    let exit_code = child_pid.and_then(wait_for_exit_code);
                    let _ = tx.send(PtyEvent::Exit(exit_code));
                    break;
                }
            }
        }
    }

    /// Batches queued writes into single `write_all` calls.
    fn write_loop(
        mut writer: Box<dyn Write + Send>,
        rx: Receiver<Vec<u8>>,
        shutdown: Arc<PtyShutdownState>,
        event_tx: Sender<PtyEvent>,
    ) {
        loop {
            let first = match rx.recv() {
                Ok(data) => data,
                Err(_) => break, // channel closed
            };
            let mut batch = first;
            while let Ok(data) = rx.try_recv() {
                batch.extend(data);
            }
            if let Err(e) = writer.write_all(&batch) {
                log::error!("failed to write to PTY: {e}");
                shutdown.mark_broken();
                let _ = event_tx.send(PtyEvent::Exit(None));
                break;
            }
        }
    }

    /// Kill the child and join the I/O threads.
    pub fn kill(&self) {
        self.shutdown.mark_broken();
        if let Err(e) = self.child.lock().kill() {
            log::warn!("failed to kill PTY child: {e}");
        }
        if let Some(handle) = self.writer_handle.lock().take()
            && let Err(panic) = handle.join()
        {
            log::warn!("PTY writer thread panicked on join: {}", format_panic(&*panic));
        }
        if let Some(handle) = self.reader_handle.lock().take()
            && let Err(panic) = handle.join()
        {
            log::warn!("PTY reader thread panicked on join: {}", format_panic(&*panic));
        }
    }

    pub fn child_pid(&self) -> Option<u32> {
        self.child.lock().process_id()
    }
}

impl PtyHost for LocalPty {
    fn set_size(&self, lines: u16, columns: u16) {
        if let Err(e) = self.master.lock().resize(PtySize {
            rows: lines,
            cols: columns,
            pixel_width: 0,
            pixel_height: 0,
        }) {
            log::error!("failed to resize PTY: {e}");
        }
    }

    fn send_bytes(&self, data: &[u8]) {
        let _ = self.input_tx.send(data.to_vec());
    }
}

/// Try to retrieve the exit code for a process that has exited.
/// Uses `waitpid` on Unix to get the actual exit status.
fn wait_for_exit_code(pid: u32) -> Option<u32> {
    #[cfg(unix)]
    {
        // The process should have exited by now (reader got EOF). Try a few
        // times with small delays in case it has not fully terminated yet.
        for _ in 0..10 {
            let mut status: libc::c_int = 0;
            let result = unsafe { libc::waitpid(pid as i32, &mut status, libc::WNOHANG) };
            if result > 0 {
                if libc::WIFEXITED(status) {
                    return Some(libc::WEXITSTATUS(status) as u32);
                }
                // Killed by a signal, no exit code.
                return None;
            }
            if result < 0 {
                // ECHILD: already reaped elsewhere.
                return None;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        None
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn collect_until_exit(rx: &Receiver<PtyEvent>) -> (Vec<u8>, Option<Option<u32>>) {
        let mut data = Vec::new();
        let mut exit = None;
        while let Ok(event) = rx.recv_timeout(Duration::from_secs(10)) {
            match event {
                PtyEvent::Data(bytes) => data.extend(bytes),
                PtyEvent::Exit(code) => {
                    exit = Some(code);
                    break;
                }
            }
        }
        (data, exit)
    }

    #[test]
    #[cfg(unix)]
    fn child_output_and_exit_code_arrive() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (host, rx) = LocalPty::spawn(
            "sh",
            &["-c".into(), "printf hello-from-pty".into()],
            "xterm",
            None,
            24,
            80,
        )
        .expect("spawn sh");
        let (data, exit) = collect_until_exit(&rx);
        assert!(
            String::from_utf8_lossy(&data).contains("hello-from-pty"),
            "got {:?}",
            String::from_utf8_lossy(&data)
        );
        assert_eq!(exit, Some(Some(0)));
        host.kill();
    }

    #[test]
    #[cfg(unix)]
    fn bytes_written_reach_the_child() {
        let (host, rx) = LocalPty::spawn("cat", &[], "xterm", None, 24, 80).expect("spawn cat");
        host.send_bytes(b"ping\n");
        let mut seen = Vec::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while std::time::Instant::now() < deadline {
            match rx.recv_timeout(Duration::from_millis(200)) {
                Ok(PtyEvent::Data(bytes)) => {
                    seen.extend(bytes);
                    if String::from_utf8_lossy(&seen).contains("ping") {
                        break;
                    }
                }
                Ok(PtyEvent::Exit(_)) => break,
                Err(_) => {}
            }
        }
        assert!(String::from_utf8_lossy(&seen).contains("ping"));
        host.kill();
    }

    #[test]
    #[cfg(unix)]
    fn nonzero_exit_code_is_reported() {
        let (host, rx) = LocalPty::spawn(
            "sh",
            &["-c".into(), "exit 3".into()],
            "xterm",
            None,
            24,
            80,
        )
        .expect("spawn sh");
        let (_, exit) = collect_until_exit(&rx);
        assert_eq!(exit, Some(Some(3)));
        host.kill();
    }
}
