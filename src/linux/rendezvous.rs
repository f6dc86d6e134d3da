//! One-shot pipe used to hold the tracer child back until it has been granted
//! permission to ptrace the crashing process.
//!
//! Creating the pipe may fail, in which case both ends stay invalid and every
//! operation silently does nothing. The child then proceeds right away and may
//! simply fail to attach, which still tends to produce a useful tombstone.

use {failspot::failspot, nix::errno::Errno, std::mem};

/// The byte written to let the child proceed
pub const GO_TOKEN: u8 = b'a';

#[derive(Debug)]
pub struct Channel {
    read: libc::c_int,
    write: libc::c_int,
}

impl Channel {
    /// Creates the pipe. Safe to call from a signal handler.
    pub fn open() -> Self {
        let mut fds = [-1, -1];

        let created = failspot!(if RendezvousChannel {
            false
        } else {
            // SAFETY: syscall
            unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) != -1 }
        });

        if !created {
            debug_print!("unable to create the rendezvous pipe");
            fds = [-1, -1];
        }

        Self {
            read: fds[0],
            write: fds[1],
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.read != -1 && self.write != -1
    }

    /// Lets the child proceed. Returns false if the token couldn't be written.
    pub fn send_go(&self) -> bool {
        if self.write == -1 {
            return false;
        }

        loop {
            // SAFETY: syscall writing a single byte from the stack
            let res = unsafe {
                libc::write(
                    self.write,
                    (&GO_TOKEN as *const u8).cast::<libc::c_void>(),
                    mem::size_of::<u8>(),
                )
            };

            if res == -1 && Errno::last() == Errno::EINTR {
                continue;
            }

            if res != 1 {
                debug_print!("failed to send the go token to the tracer");
            }
            return res == 1;
        }
    }

    /// Blocks until the go token arrives, the write end is closed, or an
    /// error occurs. Returns immediately for an invalid channel.
    pub fn wait_for_go(&self) -> bool {
        if self.read == -1 {
            return false;
        }

        let mut received = 0u8;
        loop {
            // SAFETY: syscall reading a single byte onto the stack
            let res = unsafe {
                libc::read(
                    self.read,
                    (&mut received as *mut u8).cast::<libc::c_void>(),
                    mem::size_of::<u8>(),
                )
            };

            if res == -1 && Errno::last() == Errno::EINTR {
                continue;
            }

            return res == 1 && received == GO_TOKEN;
        }
    }

    /// Closes both ends.
    ///
    /// Only ever called by the crashing process; the tracer shares our file
    /// descriptor table, so closing there would close them for us too.
    pub fn close(&mut self) {
        for fd in [&mut self.read, &mut self.write] {
            if *fd != -1 {
                // SAFETY: syscall on a descriptor we own
                unsafe { libc::close(*fd) };
                *fd = -1;
            }
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn go_token_is_received() {
        let _client = crate::FailSpotName::testing_client();
        let mut channel = Channel::open();
        assert!(channel.is_valid());

        assert!(channel.send_go());
        assert!(channel.wait_for_go());

        channel.close();
        assert!(!channel.is_valid());
        assert!(!channel.send_go());
        assert!(!channel.wait_for_go());
    }

    #[test]
    fn closed_writer_releases_the_reader() {
        let _client = crate::FailSpotName::testing_client();
        let mut channel = Channel::open();

        // SAFETY: closing our own descriptor
        unsafe { libc::close(channel.write) };
        channel.write = -1;

        assert!(!channel.wait_for_go());
    }

    #[test]
    fn failed_creation_degrades_to_no_ops() {
        let mut client = crate::FailSpotName::testing_client();
        client.set_enabled(crate::FailSpotName::RendezvousChannel, true);

        let channel = Channel::open();
        assert!(!channel.is_valid());
        assert!(!channel.send_go());
        assert!(!channel.wait_for_go());
    }
}
