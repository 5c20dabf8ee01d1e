use log::debug;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::io::Read;
use std::os::fd::AsFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Longest accepted command line for [`parse_cmdline`].
const MAX_CMDLINE_INPUT: usize = 16 * 1024;

const READ_CHUNK: usize = 4096;

#[non_exhaustive]
#[derive(Error, Debug, PartialEq)]
pub enum CmdlineError {
    #[error("command line has an unterminated single quote")]
    UnterminatedQuote,

    #[error("command line ends with a dangling backslash")]
    TrailingBackslash,

    #[error("command line is empty")]
    Empty,

    #[error("command line is longer than {MAX_CMDLINE_INPUT} bytes")]
    InputTooLong,
}

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuncmdError {
    #[error("empty argument vector")]
    EmptyArgv,

    #[error("failed to execute '{program}': {source}")]
    SpawnFailed {
        program: String,
        source: std::io::Error,
    },

    #[error("I/O error while reading child output: {0}")]
    Io(#[from] std::io::Error),

    #[error("system error while supervising child: {0}")]
    Sys(#[from] nix::Error),
}

/// How the child ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CmdStatus {
    Exited(i32),
    Signaled(i32),
    /// The deadline expired and the child group was killed. Callers
    /// conventionally treat this as Critical.
    TimedOut,
}

/// Captured result of one child invocation. Lines are in insertion
/// order per stream; CRLF is normalized to LF before splitting.
#[derive(Clone, Debug, PartialEq)]
pub struct CmdResult {
    pub status: CmdStatus,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

/// Split a command line into an argument vector.
///
/// Single quotes group words, a backslash outside quotes escapes the
/// next character, whitespace separates. The runner itself never
/// reinterprets the resulting argv; this is the only quoting layer.
pub fn parse_cmdline(input: &str) -> Result<Vec<String>, CmdlineError> {
    if input.len() > MAX_CMDLINE_INPUT {
        return Err(CmdlineError::InputTooLong);
    }

    let mut argv = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = input.chars();

    loop {
        let c = match chars.next() {
            Some(c) => c,
            None => break,
        };
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(inner) => current.push(inner),
                        None => return Err(CmdlineError::UnterminatedQuote),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(escaped) => current.push(escaped),
                    None => return Err(CmdlineError::TrailingBackslash),
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    argv.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        argv.push(current);
    }

    if argv.is_empty() {
        return Err(CmdlineError::Empty);
    }
    Ok(argv)
}

#[cfg(test)]
mod parse_cmdline_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn words(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_simple_split() {
        assert_eq!(
            parse_cmdline("/bin/echo hello world"),
            Ok(words(&["/bin/echo", "hello", "world"]))
        );
    }

    #[test]
    fn test_single_quotes_group() {
        assert_eq!(
            parse_cmdline("/bin/echo 'hello world' tail"),
            Ok(words(&["/bin/echo", "hello world", "tail"]))
        );
    }

    #[test]
    fn test_backslash_escapes_next() {
        assert_eq!(
            parse_cmdline("/bin/echo hello\\ world"),
            Ok(words(&["/bin/echo", "hello world"]))
        );
        assert_eq!(
            parse_cmdline("/bin/echo \\'"),
            Ok(words(&["/bin/echo", "'"]))
        );
    }

    #[test]
    fn test_empty_quotes_make_empty_arg() {
        assert_eq!(parse_cmdline("/bin/prog ''"), Ok(words(&["/bin/prog", ""])));
    }

    #[test]
    fn test_adjacent_quote_and_word() {
        assert_eq!(
            parse_cmdline("pre'mid'post"),
            Ok(words(&["premidpost"]))
        );
    }

    #[test]
    fn test_unterminated_quote() {
        assert_eq!(
            parse_cmdline("/bin/echo 'oops"),
            Err(CmdlineError::UnterminatedQuote)
        );
    }

    #[test]
    fn test_trailing_backslash() {
        assert_eq!(
            parse_cmdline("/bin/echo oops\\"),
            Err(CmdlineError::TrailingBackslash)
        );
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(parse_cmdline("   "), Err(CmdlineError::Empty));
    }

    #[test]
    fn test_oversized_input() {
        let huge = "a".repeat(MAX_CMDLINE_INPUT + 1);
        assert_eq!(parse_cmdline(&huge), Err(CmdlineError::InputTooLong));
    }
}

/// Normalize CRLF to LF and split into lines. A trailing fragment
/// without a terminator is kept as its own line.
fn split_lines(buffer: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(buffer);
    let mut lines = Vec::new();
    for line in text.split('\n') {
        lines.push(line.strip_suffix('\r').unwrap_or(line).to_string());
    }
    // split() leaves one empty fragment after a terminating LF.
    if lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    lines
}

#[cfg(test)]
mod split_lines_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_lf_lines() {
        assert_eq!(split_lines(b"a\nb\n"), vec!["a", "b"]);
    }

    #[test]
    fn test_crlf_normalized() {
        assert_eq!(split_lines(b"a\r\nb\r\n"), vec!["a", "b"]);
    }

    #[test]
    fn test_unterminated_tail_kept() {
        assert_eq!(split_lines(b"a\nb"), vec!["a", "b"]);
    }

    #[test]
    fn test_empty_buffer() {
        assert_eq!(split_lines(b""), Vec::<String>::new());
    }

    #[test]
    fn test_inner_empty_lines_kept() {
        assert_eq!(split_lines(b"a\n\nb\n"), vec!["a", "", "b"]);
    }
}

fn set_nonblocking(fd: std::os::fd::BorrowedFd) -> Result<(), RuncmdError> {
    use std::os::fd::AsRawFd;

    let raw = fd.as_raw_fd();
    // SAFETY: plain fcntl flag manipulation on an owned, open descriptor.
    unsafe {
        let flags = libc::fcntl(raw, libc::F_GETFL);
        if flags < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        if libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
    }
    Ok(())
}

/// Drain a readable non-blocking stream into `buffer`. Returns false
/// once the stream reached EOF.
fn drain_stream(stream: &mut impl Read, buffer: &mut Vec<u8>) -> Result<bool, RuncmdError> {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => return Ok(false),
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Synchronous argv-based child execution with stream capture and a
/// hard deadline.
///
/// No shell is involved: the program is exec'd directly with a scrubbed
/// environment (`LC_ALL=C`, nothing else — not even `PATH`) and a zero
/// core-dump limit. The child runs in its own process group so that a
/// timeout can kill the whole group.
#[derive(Clone, Debug)]
pub struct ChildRunner {
    timeout: Duration,
}

impl ChildRunner {
    pub fn new(timeout: Duration) -> Self {
        ChildRunner { timeout }
    }

    pub fn run(&self, argv: &[String]) -> Result<CmdResult, RuncmdError> {
        let (program, args) = argv.split_first().ok_or(RuncmdError::EmptyArgv)?;
        debug!("Running '{}' with {} argument(s)", program, args.len());

        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        unsafe {
            command.pre_exec(|| {
                let limit = libc::rlimit {
                    rlim_cur: 0,
                    rlim_max: 0,
                };
                libc::setrlimit(libc::RLIMIT_CORE, &limit);
                Ok(())
            });
        }

        let mut child = command.spawn().map_err(|source| RuncmdError::SpawnFailed {
            program: program.clone(),
            source,
        })?;

        let deadline = Instant::now() + self.timeout;
        match self.supervise(&mut child, deadline) {
            Ok(result) => Ok(result),
            Err(e) => {
                // Never leave the child behind on an internal error.
                let _ = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL);
                let _ = child.wait();
                Err(e)
            }
        }
    }

    fn supervise(&self, child: &mut Child, deadline: Instant) -> Result<CmdResult, RuncmdError> {
        let missing_pipe = || {
            RuncmdError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "child spawned without capture pipes",
            ))
        };
        let mut stdout = child.stdout.take().ok_or_else(missing_pipe)?;
        let mut stderr = child.stderr.take().ok_or_else(missing_pipe)?;
        set_nonblocking(stdout.as_fd())?;
        set_nonblocking(stderr.as_fd())?;

        let mut out_buf = Vec::new();
        let mut err_buf = Vec::new();
        let mut out_open = true;
        let mut err_open = true;

        while out_open || err_open {
            let now = Instant::now();
            if now >= deadline {
                return self.kill_timed_out(child, &out_buf, &err_buf);
            }
            let wait = deadline
                .duration_since(now)
                .min(Duration::from_millis(500));
            let timeout = PollTimeout::from(wait.as_millis() as u16);

            // One poll drives both pipes; a stalled stream can never
            // deadlock the other.
            let mut fds = Vec::with_capacity(2);
            if out_open {
                fds.push(PollFd::new(stdout.as_fd(), PollFlags::POLLIN));
            }
            if err_open {
                fds.push(PollFd::new(stderr.as_fd(), PollFlags::POLLIN));
            }
            match poll(&mut fds, timeout) {
                Ok(_) => {}
                Err(nix::Error::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }

            let mut ready = Vec::with_capacity(2);
            for fd in &fds {
                ready.push(
                    fd.revents()
                        .map(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP))
                        .unwrap_or(false),
                );
            }
            drop(fds);

            let mut index = 0;
            if out_open {
                if ready[index] {
                    out_open = drain_stream(&mut stdout, &mut out_buf)?;
                }
                index += 1;
            }
            if err_open && ready[index] {
                err_open = drain_stream(&mut stderr, &mut err_buf)?;
            }
        }

        // Pipes are closed; give the child the rest of the deadline to
        // actually exit.
        loop {
            if let Some(status) = child.try_wait()? {
                let cmd_status = match status.code() {
                    Some(code) => CmdStatus::Exited(code),
                    None => CmdStatus::Signaled(status.signal().unwrap_or(0)),
                };
                debug!("Child finished with {:?}", cmd_status);
                return Ok(CmdResult {
                    status: cmd_status,
                    stdout: split_lines(&out_buf),
                    stderr: split_lines(&err_buf),
                });
            }
            if Instant::now() >= deadline {
                return self.kill_timed_out(child, &out_buf, &err_buf);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn kill_timed_out(
        &self,
        child: &mut Child,
        out_buf: &[u8],
        err_buf: &[u8],
    ) -> Result<CmdResult, RuncmdError> {
        debug!(
            "Child did not finish within {:?}, killing process group",
            self.timeout
        );
        let _ = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL);
        child.wait()?;
        Ok(CmdResult {
            status: CmdStatus::TimedOut,
            stdout: split_lines(out_buf),
            stderr: split_lines(err_buf),
        })
    }
}
