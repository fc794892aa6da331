use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::{Mutex, ReentrantMutex};

use super::{
    DigitalLine, Direction, Edge, GpioMem, InterruptEvent, LineEvent, LineHandler, Pull,
};
use crate::error::{PiIoError, Result};
use crate::worker::Worker;

pub const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";

const INTERRUPT_POLL_TIMEOUT_MS: i32 = 100;

/// A native GPIO line driven through the sysfs interface, with reads and
/// writes optionally routed through the `/dev/gpiomem` register block.
pub struct SysfsLine {
    pin: u16,
    root: PathBuf,
    pre_exported: bool,
    fast: Option<Arc<GpioMem>>,
    io: ReentrantMutex<()>,
    interrupts: Mutex<Worker>,
}

impl SysfsLine {
    pub fn open(
        root: impl Into<PathBuf>,
        pin: u16,
        direction: Direction,
        edge: Edge,
        fast: Option<Arc<GpioMem>>,
    ) -> Result<Self> {
        let root = root.into();
        let pre_exported = export(&root, pin)?;
        let line = Self {
            pin,
            root,
            pre_exported,
            fast,
            io: ReentrantMutex::new(()),
            interrupts: Mutex::new(Worker::new(format!("gpio{pin}-irq"))),
        };
        // on failure the drop below unexports what we exported
        line.set_direction(direction)?;
        line.set_edge(edge)?;
        Ok(line)
    }

    pub fn is_pre_exported(&self) -> bool {
        self.pre_exported
    }

    fn attr(&self, name: &str) -> PathBuf {
        self.root.join(format!("gpio{}", self.pin)).join(name)
    }

    fn read_attr(&self, name: &str) -> Result<String> {
        let path = self.attr(name);
        fs::read_to_string(&path)
            .map_err(|e| PiIoError::OperationFailed(format!("read {}: {e}", path.display())))
    }

    fn write_attr(&self, name: &str, text: &str) -> Result<()> {
        let path = self.attr(name);
        write_file(&path, text)
            .map_err(|e| PiIoError::OperationFailed(format!("write {}: {e}", path.display())))
    }
}

fn write_file(path: &Path, text: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).truncate(true).open(path)?;
    file.write_all(text.as_bytes())
}

/// Exports `pin`. Returns true if the pin was already exported by someone
/// else.
fn export(root: &Path, pin: u16) -> Result<bool> {
    if root.join(format!("gpio{pin}")).exists() {
        return Ok(true);
    }
    match write_file(&root.join("export"), &format!("{pin}\n")) {
        Ok(()) => Ok(false),
        Err(e) if e.raw_os_error() == Some(libc::EBUSY) => Ok(true),
        Err(e) => Err(PiIoError::OperationFailed(format!("export gpio{pin}: {e}"))),
    }
}

fn unexport(root: &Path, pin: u16) {
    if let Err(e) = write_file(&root.join("unexport"), &format!("{pin}\n")) {
        warn!("unexport gpio{pin}: {e}");
    }
}

impl DigitalLine for SysfsLine {
    fn pin(&self) -> u16 {
        self.pin
    }

    fn direction(&self) -> Result<Direction> {
        let _guard = self.io.lock();
        match self.read_attr("direction")?.trim_start().chars().next() {
            Some('i') => Ok(Direction::In),
            Some('o') | Some('h') | Some('l') => Ok(Direction::Out),
            _ => Err(PiIoError::OperationFailed(format!(
                "gpio{}: unreadable direction",
                self.pin
            ))),
        }
    }

    fn set_direction(&self, direction: Direction) -> Result<()> {
        let _guard = self.io.lock();
        let text = match direction {
            Direction::In => "in\n",
            Direction::Out => "out\n",
        };
        self.write_attr("direction", text)
    }

    fn edge(&self) -> Result<Edge> {
        let _guard = self.io.lock();
        match self.read_attr("edge")?.trim_start().chars().next() {
            Some('n') => Ok(Edge::None),
            Some('r') => Ok(Edge::Rising),
            Some('f') => Ok(Edge::Falling),
            Some('b') => Ok(Edge::Both),
            _ => Err(PiIoError::OperationFailed(format!(
                "gpio{}: unreadable edge",
                self.pin
            ))),
        }
    }

    fn set_edge(&self, edge: Edge) -> Result<()> {
        let _guard = self.io.lock();
        let text = match edge {
            Edge::None => "none\n",
            Edge::Rising => "rising\n",
            Edge::Falling => "falling\n",
            Edge::Both => "both\n",
        };
        self.write_attr("edge", text)
    }

    fn set_pull(&self, pull: Pull) -> Result<()> {
        let fast = self.fast.as_ref().ok_or_else(|| {
            PiIoError::FeatureNotImplemented(format!(
                "gpio{}: pull resistors need /dev/gpiomem",
                self.pin
            ))
        })?;
        let _guard = self.io.lock();
        fast.set_pull(self.pin, pull);
        Ok(())
    }

    fn value(&self) -> Result<bool> {
        let _guard = self.io.lock();
        if let Some(fast) = &self.fast {
            return Ok(fast.level(self.pin));
        }
        Ok(!self.read_attr("value")?.starts_with('0'))
    }

    fn set_value(&self, value: bool) -> Result<()> {
        let _guard = self.io.lock();
        if let Some(fast) = &self.fast {
            fast.set_level(self.pin, value);
            return Ok(());
        }
        self.write_attr("value", if value { "1\n" } else { "0\n" })
    }

    fn start_interrupts(&self, handler: LineHandler) -> Result<()> {
        let pin = self.pin;
        let path = self.attr("value");
        let on_error = handler.clone();

        self.interrupts.lock().start(
            move |token| {
                let mut file = File::open(&path).map_err(|e| {
                    PiIoError::OperationFailed(format!("open {}: {e}", path.display()))
                })?;
                let mut buf = [0u8; 8];
                // clear any pending edge before waiting
                let _ = file.read(&mut buf);

                while token.is_running() {
                    file.seek(SeekFrom::Start(0))
                        .map_err(|e| PiIoError::OperationFailed(format!("gpio{pin} seek: {e}")))?;
                    let mut pfd = libc::pollfd {
                        fd: file.as_raw_fd(),
                        events: libc::POLLPRI | libc::POLLERR,
                        revents: 0,
                    };
                    // SAFETY: one valid pollfd that outlives the call.
                    let ready = unsafe { libc::poll(&mut pfd, 1, INTERRUPT_POLL_TIMEOUT_MS) };
                    if ready < 0 {
                        let err = io::Error::last_os_error();
                        if err.kind() == io::ErrorKind::Interrupted {
                            continue;
                        }
                        return Err(PiIoError::OperationFailed(format!("gpio{pin} poll: {err}")));
                    }
                    if ready == 0 || !token.is_running() {
                        continue;
                    }
                    let read = file
                        .read(&mut buf)
                        .map_err(|e| PiIoError::OperationFailed(format!("gpio{pin} read: {e}")))?;
                    let value = read > 0 && buf[0] != b'0';
                    handler(LineEvent::Interrupt(InterruptEvent::from_level(pin, value)));
                }
                Ok(())
            },
            move |e| on_error(LineEvent::Failed(e.to_string())),
        )
    }

    fn stop_interrupts(&self) {
        self.interrupts.lock().stop();
    }
}

impl Drop for SysfsLine {
    fn drop(&mut self) {
        self.stop_interrupts();
        if !self.pre_exported {
            debug!("unexporting gpio{}", self.pin);
            unexport(&self.root, self.pin);
        }
    }
}
