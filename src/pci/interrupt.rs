//! Interrupt delivery through the device's uio node.
//!
//! A uio read blocks until the next interrupt and yields its 32-bit event count.
//! The adapter leaves the interrupt masked after delivery, so the handler clears
//! the "interrupt disable" bit in the command register before every wait.

use crate::error::{PdaError, PdaResult};
use crate::uio::sysfs::{COMMAND_HIGH_OFFSET, INTERRUPT_DISABLE_BIT};
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

/// Upper bound on how long a stop request waits for the handler thread.
const POLL_TIMEOUT_MS: libc::c_int = 50;

/// A running interrupt thread. Stops (and joins) on drop.
#[derive(Debug)]
pub struct InterruptHandler {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

/// Waits until `irq` is readable or `stop` is raised. `Ok(false)` means stop.
fn wait_readable(irq: &File, stop: &AtomicBool) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd: irq.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };

    while !stop.load(Ordering::Acquire) {
        let ret = unsafe { libc::poll(&raw mut pfd, 1, POLL_TIMEOUT_MS) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if ret > 0 {
            return Ok(true);
        }
    }
    Ok(false)
}

fn run<F>(config: &File, mut irq: File, stop: &AtomicBool, mut callback: F) -> io::Result<()>
where
    F: FnMut(u32),
{
    let mut command_high = [0u8; 1];
    config.read_exact_at(&mut command_high, COMMAND_HIGH_OFFSET)?;
    command_high[0] &= !INTERRUPT_DISABLE_BIT;

    let mut sequence = [0u8; 4];
    loop {
        config.write_all_at(&command_high, COMMAND_HIGH_OFFSET)?;

        if !wait_readable(&irq, stop)? {
            return Ok(());
        }
        irq.read_exact(&mut sequence)?;
        callback(u32::from_ne_bytes(sequence));
    }
}

impl InterruptHandler {
    /// Starts a thread that re-enables the interrupt through `config`, waits on
    /// `irq` and calls `callback` with the event count of every interrupt.
    ///
    /// # Errors
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn<F>(config: File, irq: File, callback: F) -> PdaResult<Self>
    where
        F: FnMut(u32) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);

        let thread = thread::Builder::new()
            .name("pda-isr".into())
            .spawn(move || {
                if let Err(e) = run(&config, irq, &flag, callback) {
                    log::error!("Interrupt handler stopped: {e}");
                }
            })
            .map_err(PdaError::Io)?;

        log::debug!("Interrupt handler started");
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signals the thread and waits for it to leave its wait.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Interrupt callback panicked");
            }
            log::debug!("Interrupt handler stopped");
        }
    }
}

impl Drop for InterruptHandler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::TempDir;
    use std::io::Write;
    use std::os::fd::FromRawFd;
    use std::sync::mpsc;
    use std::time::Duration;

    fn pipe() -> (File, File) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) }
    }

    fn config_file(dir: &TempDir) -> File {
        let path = dir.path().join("config");
        let mut header = [0u8; 64];
        header[5] = INTERRUPT_DISABLE_BIT | 0x1;
        std::fs::write(&path, header).unwrap();
        File::options().read(true).write(true).open(path).unwrap()
    }

    #[test]
    fn delivers_sequence_numbers_and_unmasks() {
        let dir = TempDir::new("isr-deliver");
        let config = config_file(&dir);
        let probe = config.try_clone().unwrap();
        let (irq, mut trigger) = pipe();
        let (tx, rx) = mpsc::channel();

        let mut handler = InterruptHandler::spawn(config, irq, move |seq| {
            tx.send(seq).ok();
        })
        .unwrap();

        for seq in [1u32, 2, 7] {
            trigger.write_all(&seq.to_ne_bytes()).unwrap();
            assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), seq);
        }

        let mut command_high = [0u8; 1];
        probe.read_exact_at(&mut command_high, 5).unwrap();
        assert_eq!(command_high[0], 0x1);

        assert!(handler.is_running());
        handler.stop();
        assert!(!handler.is_running());
    }

    #[test]
    fn stops_while_waiting() {
        let dir = TempDir::new("isr-stop");
        let (irq, _trigger) = pipe();
        let handler = InterruptHandler::spawn(config_file(&dir), irq, |_| {}).unwrap();
        thread::sleep(Duration::from_millis(20));
        drop(handler);
    }
}
