use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

/// Waker backed by a unix pipe.
///
/// The read end sits in the multiplexer under the sentinel token; the
/// write end is poked by `stop`/`intr`. Writing one byte is all it
/// takes, and writes are safe from signal handlers.
#[derive(Debug)]
pub(crate) struct Waker {
    sender: File,
    receiver: File,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        let [receiver, sender] = super::pipe()?;
        // SAFETY: pipe() returns two freshly created, owned fds.
        let sender = unsafe { File::from_raw_fd(sender) };
        let receiver = unsafe { File::from_raw_fd(receiver) };
        Ok(Waker { sender, receiver })
    }

    pub(crate) fn wake(&self) -> io::Result<()> {
        match (&self.sender).write(&[1]) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // The pipe is full; empty it and try again.
                self.empty();
                self.wake()
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => self.wake(),
            Err(err) => Err(err),
        }
    }

    /// A second handle to the write end, for waking the loop from
    /// outside it (other threads, signal handlers).
    pub(crate) fn try_clone_sender(&self) -> io::Result<File> {
        self.sender.try_clone()
    }

    /// Drains pending wake-up bytes. Called when the read end reports
    /// readiness; errors are ignored.
    pub(crate) fn empty(&self) {
        let mut buf = [0; 4096];
        loop {
            match (&self.receiver).read(&mut buf) {
                Ok(n) if n > 0 => continue,
                _ => return,
            }
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.receiver.as_raw_fd()
    }
}
