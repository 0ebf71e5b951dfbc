//! Process pool built on forked workers.
//!
//! Each worker is a `fork()` of the calling process, so it already holds a
//! copy of the mapped function. Only inputs and outputs cross the boundary,
//! as length-prefixed JSON frames over a pair of pipes. A dispatcher thread
//! in the parent owns each worker: it pulls jobs from the shared queue,
//! forwards them and resolves the matching future with the reply.
//!
//! Workers exit when their input pipe reaches end-of-file, which happens
//! once the pool is shut down and the queue has drained.
//!
//! Only the forking thread survives in a worker. A lock that another thread
//! of the parent held at fork time stays held in the child forever, so the
//! mapped function should not depend on such locks, and a worker can hang
//! if it panics while another parent thread held the panic hook or stderr
//! lock. The descriptor list a worker closes is gathered before forking.
//! Task panics are reported through the default hook and travel back to
//! the parent as [`Error::TaskFailure`](crate::Error::TaskFailure).

use crate::error::{panic_message, Error, Result};
use crate::future::Completer;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{self, Read, Write};
use std::marker::PhantomData;
use std::os::unix::io::{FromRawFd, RawFd};
use std::thread::{self, JoinHandle};

/// Upper bound on a single frame; anything larger is treated as corrupt
const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Fallback descriptor sweep limit where `/proc/self/fd` is unavailable
const FD_SWEEP_LIMIT: RawFd = 4096;

/// Serialized input plus the future it resolves
pub(crate) struct ProcessJob<R> {
    pub(crate) id: usize,
    pub(crate) payload: Vec<u8>,
    pub(crate) completer: Completer<R>,
}

/// Parent-side handle on one forked worker
struct WorkerProcess {
    pid: libc::pid_t,
    to_child: Option<File>,
    from_child: File,
}

impl WorkerProcess {
    /// Send one frame and read one reply frame
    fn call(&mut self, payload: &[u8]) -> io::Result<Vec<u8>> {
        let to_child = self
            .to_child
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "worker input closed"))?;
        write_frame(to_child, payload)?;
        read_frame(&mut self.from_child)?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "worker exited mid-task")
        })
    }

    /// Close the worker's input and reap it
    fn finish(&mut self, id: usize) {
        self.to_child = None;
        log_exit(id, self.pid, reap(self.pid));
    }
}

/// Block until `pid` exits and return its raw wait status
fn reap(pid: libc::pid_t) -> io::Result<libc::c_int> {
    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: pid is a child of this process that has not been reaped yet
        if unsafe { libc::waitpid(pid, &mut status, 0) } != -1 {
            return Ok(status);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn log_exit(id: usize, pid: libc::pid_t, reaped: io::Result<libc::c_int>) {
    match reaped {
        Err(e) => warn!(
            "Process worker {} (pid {}): waitpid failed: {}",
            id, pid, e
        ),
        Ok(status) if libc::WIFEXITED(status) => debug!(
            "Process worker {} (pid {}): exited with code {}",
            id,
            pid,
            libc::WEXITSTATUS(status)
        ),
        Ok(status) if libc::WIFSIGNALED(status) => warn!(
            "Process worker {} (pid {}): killed by signal {}",
            id,
            pid,
            libc::WTERMSIG(status)
        ),
        Ok(_) => {}
    }
}

/// A fixed-size pool of forked worker processes mapping `I` to `R`
pub struct ProcessPool<I, R> {
    sender: Mutex<Option<Sender<ProcessJob<R>>>>,
    dispatchers: Vec<JoinHandle<()>>,
    _input: PhantomData<fn(I)>,
}

impl<I, R> ProcessPool<I, R>
where
    I: Serialize + DeserializeOwned,
    R: Serialize + DeserializeOwned + Send + 'static,
{
    /// Fork `workers` processes that each run `func` on incoming inputs.
    pub fn spawn<F>(workers: usize, thread_name_prefix: &str, func: &F) -> Result<Self>
    where
        F: Fn(I) -> R,
    {
        if workers == 0 {
            return Err(Error::InvalidConfig(
                "process pool needs at least one worker".to_string(),
            ));
        }

        info!("Creating process pool with {} workers", workers);

        let (sender, receiver) = unbounded::<ProcessJob<R>>();
        let mut pool = Self {
            sender: Mutex::new(Some(sender)),
            dispatchers: Vec::with_capacity(workers),
            _input: PhantomData,
        };

        for id in 0..workers {
            // On error `pool` drops, closing the queue and reaping earlier workers
            let worker = fork_worker(func)?;
            debug!("Process worker {}: forked as pid {}", id, worker.pid);

            let pid = worker.pid;
            let jobs = receiver.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-proc-{}", thread_name_prefix, id))
                .spawn(move || dispatch_loop(id, worker, jobs));

            match spawned {
                Ok(handle) => pool.dispatchers.push(handle),
                Err(e) => {
                    error!("Failed to spawn dispatcher for process worker {}: {}", id, e);
                    // The dropped closure closed the worker's input, so it exits on EOF
                    log_exit(id, pid, reap(pid));
                    return Err(Error::Io(e));
                }
            }
        }

        Ok(pool)
    }
}

impl<I, R> ProcessPool<I, R> {
    /// Queue an already serialized input for the next free worker.
    pub(crate) fn submit_encoded(
        &self,
        id: usize,
        payload: Vec<u8>,
        completer: Completer<R>,
    ) -> Result<()> {
        let sender = self.sender.lock().clone();
        let Some(sender) = sender else {
            return Err(Error::PoolState("process pool is shut down".to_string()));
        };

        // If every dispatcher is gone the job bounces back and its
        // completer resolves the future as lost
        if let Err(bounced) = sender.send(ProcessJob {
            id,
            payload,
            completer,
        }) {
            warn!("Process pool has no live workers; task {} lost", id);
            drop(bounced);
        }
        Ok(())
    }

    /// Stop accepting work. Queued work still runs.
    pub fn shutdown(&self) {
        if self.sender.lock().take().is_some() {
            info!("Shutting down process pool");
        }
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_shutting_down(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Number of worker processes
    pub fn worker_count(&self) -> usize {
        self.dispatchers.len()
    }

    /// Shut down and wait until every worker has drained and been reaped
    pub fn shutdown_and_join(mut self) {
        self.join_dispatchers();
    }

    fn join_dispatchers(&mut self) {
        self.sender.lock().take();

        if self.dispatchers.is_empty() {
            return;
        }

        for dispatcher in self.dispatchers.drain(..) {
            dispatcher.join().unwrap_or_else(|e| {
                error!("Process dispatcher panicked during shutdown: {:?}", e);
            });
        }

        info!("Process pool shutdown complete");
    }
}

impl<I, R> Drop for ProcessPool<I, R> {
    fn drop(&mut self) {
        self.join_dispatchers();
    }
}

fn dispatch_loop<R>(id: usize, mut worker: WorkerProcess, jobs: Receiver<ProcessJob<R>>)
where
    R: DeserializeOwned,
{
    for job in jobs.iter() {
        trace!("Process worker {}: dispatching task {}", id, job.id);

        let reply = match worker.call(&job.payload) {
            Ok(reply) => reply,
            Err(e) => {
                error!("Process worker {}: lost task {}: {}", id, job.id, e);
                // Dropping the completer resolves the future as lost;
                // the remaining queue goes to the surviving workers
                drop(job);
                break;
            }
        };

        let outcome = match serde_json::from_slice::<std::result::Result<R, String>>(&reply) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(Error::TaskFailure(message)),
            Err(e) => Err(Error::from(e)),
        };
        job.completer.complete(outcome);
    }

    worker.finish(id);
}

fn fork_worker<I, R, F>(func: &F) -> Result<WorkerProcess>
where
    I: DeserializeOwned,
    R: Serialize,
    F: Fn(I) -> R,
{
    let (task_read, task_write) = cloexec_pipe()?;
    let (result_read, result_write) = cloexec_pipe()?;
    let inherited = open_fds();

    // SAFETY: the child only touches its own pipes and the mapped function
    // before calling `_exit`; it never returns into the caller's frames.
    let pid = unsafe { libc::fork() };

    match pid {
        -1 => Err(Error::Io(io::Error::last_os_error())),
        0 => {
            drop(task_write);
            drop(result_read);
            run_worker(task_read, result_write, &inherited, func)
        }
        pid => Ok(WorkerProcess {
            pid,
            to_child: Some(task_write),
            from_child: result_read,
        }),
    }
}

/// Child side: answer frames until end-of-file, then exit without unwinding.
fn run_worker<I, R, F>(mut input: File, mut output: File, inherited: &[RawFd], func: &F) -> !
where
    I: DeserializeOwned,
    R: Serialize,
    F: Fn(I) -> R,
{
    use std::os::unix::io::AsRawFd;

    close_inherited_fds(inherited, &[input.as_raw_fd(), output.as_raw_fd()]);

    let served = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        while let Ok(Some(frame)) = read_frame(&mut input) {
            let reply = answer(&frame, func);
            if write_frame(&mut output, &reply).is_err() {
                break;
            }
        }
    }));

    let code = if served.is_ok() { 0 } else { 1 };
    // SAFETY: terminating the forked child without running the parent's destructors
    unsafe { libc::_exit(code) }
}

fn answer<I, R, F>(frame: &[u8], func: &F) -> Vec<u8>
where
    I: DeserializeOwned,
    R: Serialize,
    F: Fn(I) -> R,
{
    let outcome: std::result::Result<R, String> = match serde_json::from_slice::<I>(frame) {
        Ok(input) => std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| func(input)))
            .map_err(|payload| panic_message(payload.as_ref())),
        Err(e) => Err(format!("failed to decode task input: {}", e)),
    };

    serde_json::to_vec(&outcome).unwrap_or_else(|e| {
        let fallback: std::result::Result<R, String> =
            Err(format!("failed to encode task output: {}", e));
        serde_json::to_vec(&fallback).unwrap_or_default()
    })
}

/// Descriptors open in this process, listed before forking.
fn open_fds() -> Vec<RawFd> {
    std::fs::read_dir("/proc/self/fd")
        .map(|dir| {
            dir.filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
                .collect()
        })
        .unwrap_or_else(|_| (3..FD_SWEEP_LIMIT).collect())
}

/// Close every descriptor in `inherited` except stdio and `keep`.
///
/// A forked worker must not hold other workers' pipe ends, or their
/// end-of-file would never arrive. Runs in the child, so it neither
/// allocates nor touches the filesystem.
fn close_inherited_fds(inherited: &[RawFd], keep: &[RawFd]) {
    for &fd in inherited {
        if fd <= 2 || keep.contains(&fd) {
            continue;
        }
        // SAFETY: closing descriptors this process no longer needs; EBADF is harmless
        unsafe {
            libc::close(fd);
        }
    }
}

fn cloexec_pipe() -> io::Result<(File, File)> {
    let mut fds: [libc::c_int; 2] = [0; 2];
    // SAFETY: fds is a valid two-element buffer
    if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: both descriptors were just returned by pipe() and are owned here
    let (read, write) = unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) };

    for fd in fds {
        // SAFETY: fd is open; keeps parent ends out of exec'd subprocesses
        if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok((read, write))
}

fn write_frame(w: &mut impl Write, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    w.write_all(&len.to_be_bytes())?;
    w.write_all(payload)?;
    w.flush()
}

/// Read one frame; `Ok(None)` on a clean end-of-file between frames.
fn read_frame(r: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        match r.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated frame header",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }

    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::task_pair;
    use std::io::Cursor;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_frame_roundtrip_and_eof() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").unwrap();
        write_frame(&mut buf, b"").unwrap();

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), b"hello");
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), b"");
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_truncated_frame_is_error() {
        let mut cursor = Cursor::new(vec![0u8, 0, 0, 9, b'x']);
        assert!(read_frame(&mut cursor).is_err());

        let mut cursor = Cursor::new(vec![0u8, 0]);
        assert!(read_frame(&mut cursor).is_err());
    }

    #[test]
    fn test_answer_reports_panics() {
        let double = |x: i32| -> i32 {
            if x < 0 {
                panic!("negative input {}", x);
            }
            x * 2
        };

        let reply = answer(b"21", &double);
        let decoded: std::result::Result<i32, String> = serde_json::from_slice(&reply).unwrap();
        assert_eq!(decoded, Ok(42));

        let reply = answer(b"-1", &double);
        let decoded: std::result::Result<i32, String> = serde_json::from_slice(&reply).unwrap();
        assert_eq!(decoded, Err("negative input -1".to_string()));

        let reply = answer(b"\"text\"", &double);
        let decoded: std::result::Result<i32, String> = serde_json::from_slice(&reply).unwrap();
        assert!(decoded.unwrap_err().contains("decode"));
    }

    #[test]
    fn test_reap_collects_exit_status() {
        let child = std::process::Command::new("sh")
            .args(["-c", "exit 3"])
            .spawn()
            .unwrap();
        let pid = child.id() as libc::pid_t;

        let status = reap(pid).unwrap();
        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), 3);

        // Already reaped, so nothing is left to wait for
        let err = reap(pid).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ECHILD));
    }

    #[test]
    fn test_open_fds_lists_live_pipes() {
        let (read, write) = cloexec_pipe().unwrap();
        let fds = open_fds();
        assert!(fds.contains(&read.as_raw_fd()));
        assert!(fds.contains(&write.as_raw_fd()));
    }

    #[test]
    fn test_process_pool_runs_in_child() {
        let parent = std::process::id();
        let pool = ProcessPool::<u32, (u32, u32)>::spawn(2, "test", &|x: u32| {
            (x + 1, std::process::id())
        })
        .unwrap();
        assert_eq!(pool.worker_count(), 2);

        let (future, completer) = task_pair(0, None);
        pool.submit_encoded(0, serde_json::to_vec(&41u32).unwrap(), completer)
            .unwrap();

        let (value, pid) = future.result().unwrap();
        assert_eq!(value, 42);
        assert_ne!(pid, parent);

        pool.shutdown_and_join();
    }

    #[test]
    fn test_submit_after_shutdown() {
        let pool = ProcessPool::<u32, u32>::spawn(1, "test", &|x: u32| x).unwrap();
        pool.shutdown();
        assert!(pool.is_shutting_down());

        let (future, completer) = task_pair(0, None);
        let result = pool.submit_encoded(0, b"1".to_vec(), completer);
        assert!(matches!(result, Err(Error::PoolState(_))));
        assert!(matches!(future.result(), Err(Error::TaskLost { .. })));
    }
}
