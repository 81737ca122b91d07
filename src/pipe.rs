use std::{
    io::Read,
    sync::{Mutex, MutexGuard, PoisonError},
    thread,
};

static INHERITANCE: Mutex<()> = Mutex::new(());

/// Process-wide lock over the window in which this process holds
/// inheritable pipe ends.
///
/// A child created with handle inheritance receives every inheritable handle
/// in the process, including pipe ends another thread is preparing for its
/// own child. Holding this from pipe creation until the parent's write ends
/// are closed keeps each child to its own pipes.
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) fn inheritance_guard() -> MutexGuard<'static, ()> {
    INHERITANCE.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reads `reader` until end-of-stream and decodes it as UTF-8.
///
/// A read error ends the drain early; whatever arrived before it is kept.
///
/// # Parameters
///
/// * `reader` - The read end of a pipe.
///
/// # Returns
///
/// * Returns a `String` containing the data read from the pipe.
pub fn drain<R: Read>(mut reader: R) -> String {
    let mut buffer = [0u8; 1 << 12];
    let mut output = Vec::new();

    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => output.extend_from_slice(&buffer[..read]),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::warn!(%err, bytes = output.len(), "pipe read failed, keeping partial output");
                break;
            }
        }
    }

    String::from_utf8_lossy(&output).into_owned()
}

/// Drains `stdout` and `stderr` on two threads while `wait` runs on the
/// calling thread.
///
/// Returns once `wait` has returned and both streams reached end-of-stream.
/// Every write end held by this process must be closed before calling,
/// otherwise the drains never see end-of-stream.
pub fn drain_concurrently<O, E, W, T>(stdout: O, stderr: E, wait: W) -> (T, String, String)
where
    O: Read + Send,
    E: Read + Send,
    W: FnOnce() -> T,
{
    thread::scope(|scope| {
        let out = scope.spawn(move || drain(stdout));
        let err = scope.spawn(move || drain(stderr));

        let waited = wait();

        let out = out.join().unwrap_or_else(|_| {
            tracing::warn!("stdout drain panicked");
            String::new()
        });
        let err = err.join().unwrap_or_else(|_| {
            tracing::warn!("stderr drain panicked");
            String::new()
        });

        (waited, out, err)
    })
}

#[cfg(windows)]
pub use self::anonymous::*;

#[cfg(windows)]
mod anonymous {
    use crate::{
        error::{last_error, Error, Result},
        handle::KernelHandle,
    };
    use core::ptr::null_mut;
    use std::io;
    use windows_sys::Win32::{
        Foundation::{SetHandleInformation, ERROR_BROKEN_PIPE, FALSE, HANDLE_FLAG_INHERIT, TRUE},
        Security::SECURITY_ATTRIBUTES,
        Storage::FileSystem::ReadFile,
        System::Pipes::CreatePipe,
    };

    /// An anonymous pipe whose write end is handed to a child process.
    #[derive(Debug)]
    pub struct Pipe {
        read: KernelHandle,
        write: KernelHandle,
    }

    impl Pipe {
        /// Creates an anonymous pipe with an inheritable write end and a
        /// non-inheritable read end.
        ///
        /// # Returns
        ///
        /// * `Ok(Pipe)` - Both ends, owned.
        /// * `Err(Error::PipeSetupFailed)` - Creation or an inheritance
        ///   change failed; any end already created is closed.
        pub fn create() -> Result<Self> {
            let sa = SECURITY_ATTRIBUTES {
                nLength: size_of::<SECURITY_ATTRIBUTES>() as u32,
                bInheritHandle: TRUE,
                lpSecurityDescriptor: null_mut(),
            };

            let mut h_read = null_mut();
            let mut h_write = null_mut();
            if unsafe { CreatePipe(&mut h_read, &mut h_write, &sa, 0) } == FALSE {
                return Err(Error::PipeSetupFailed(last_error()));
            }

            let pipe = Pipe {
                read: unsafe { KernelHandle::from_raw(h_read) },
                write: unsafe { KernelHandle::from_raw(h_write) },
            };

            if unsafe { SetHandleInformation(pipe.read.as_raw(), HANDLE_FLAG_INHERIT, 0) } == FALSE {
                return Err(Error::PipeSetupFailed(last_error()));
            }

            if unsafe { SetHandleInformation(pipe.write.as_raw(), HANDLE_FLAG_INHERIT, HANDLE_FLAG_INHERIT) } == FALSE {
                return Err(Error::PipeSetupFailed(last_error()));
            }

            tracing::debug!(read = ?pipe.read, write = ?pipe.write, "created pipe");
            Ok(pipe)
        }

        /// The write end, for `STARTUPINFOW`.
        pub fn write_end(&self) -> &KernelHandle {
            &self.write
        }

        /// Closes this process's write end and returns a reader over the read end.
        pub fn into_reader(self) -> PipeReader {
            let Pipe { read, write } = self;
            drop(write);
            PipeReader(read)
        }
    }

    /// Blocking reader over the read end of a pipe.
    ///
    /// A broken pipe means every writer has closed and is reported as
    /// end-of-stream.
    #[derive(Debug)]
    pub struct PipeReader(KernelHandle);

    impl io::Read for PipeReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut bytes_read = 0u32;
            let len = buf.len().min(u32::MAX as usize) as u32;
            if unsafe { ReadFile(self.0.as_raw(), buf.as_mut_ptr(), len, &mut bytes_read, null_mut()) } == FALSE {
                return match last_error() {
                    ERROR_BROKEN_PIPE => Ok(0),
                    code => Err(io::Error::from_raw_os_error(code as i32)),
                };
            }

            Ok(bytes_read as usize)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor};

    /// Yields `data` in small chunks, then fails.
    struct FailingReader {
        data: Cursor<Vec<u8>>,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let limit = buf.len().min(3);
            match self.data.read(&mut buf[..limit])? {
                0 => Err(io::Error::new(io::ErrorKind::Other, "pipe went away")),
                n => Ok(n),
            }
        }
    }

    #[test]
    fn drain_reads_to_end() {
        let text = "line one\r\nline two\r\n".repeat(1000);
        assert_eq!(drain(Cursor::new(text.clone().into_bytes())), text);
    }

    #[test]
    fn drain_keeps_partial_output_on_error() {
        let reader = FailingReader { data: Cursor::new(b"partial".to_vec()) };
        assert_eq!(drain(reader), "partial");
    }

    #[test]
    fn drain_does_not_split_multibyte_characters() {
        // The odd prefix puts a chunk boundary inside a two-byte character.
        let text = format!("x{}", "é".repeat(1 << 12));
        assert_eq!(drain(Cursor::new(text.clone().into_bytes())), text);
    }

    #[test]
    fn concurrent_drain_joins_wait_and_both_streams() {
        let (waited, out, err) = drain_concurrently(
            Cursor::new(b"to stdout".to_vec()),
            Cursor::new(b"to stderr".to_vec()),
            || 42,
        );
        assert_eq!((waited, out.as_str(), err.as_str()), (42, "to stdout", "to stderr"));
    }

    #[test]
    fn inheritance_guard_serializes_holders() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let inside = AtomicUsize::new(0);
        let overlaps = AtomicUsize::new(0);
        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        let _guard = inheritance_guard();
                        if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn inheritance_guard_survives_a_panicking_holder() {
        let panicked = thread::spawn(|| {
            let _guard = inheritance_guard();
            panic!("launch failed while holding the lock");
        })
        .join();

        assert!(panicked.is_err());
        drop(inheritance_guard());
    }

    #[cfg(unix)]
    #[test]
    fn no_deadlock_when_one_stream_fills_first() {
        use std::process::{Command, Stdio};

        // Well past the 64KB pipe buffer on stdout before anything on stderr.
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("head -c 200000 /dev/zero | tr '\\000' a; printf done >&2")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("spawn sh");

        let stdout = child.stdout.take().expect("stdout");
        let stderr = child.stderr.take().expect("stderr");
        let (status, out, err) = drain_concurrently(stdout, stderr, || child.wait());

        assert!(status.expect("wait").success());
        assert_eq!(out.len(), 200_000);
        assert!(out.bytes().all(|b| b == b'a'));
        assert_eq!(err, "done");
    }
}
