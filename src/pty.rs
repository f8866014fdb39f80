//! Interactive-mode support: allocate a pseudo-terminal, put the host's
//! controlling terminal into raw mode, fork the user command onto the
//! PTY slave, and shuttle bytes (and window-resize events) between the
//! host terminal and the PTY master until the child exits.

use std::ffi::CString;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::pty::{openpty, Winsize};
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::termios::{self, SetArg};
use nix::sys::wait::waitpid;
use nix::unistd::{execvp, fork, setsid, ForkResult, Pid};

use crate::error::ExecError;

static RESIZE_PENDING: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigwinch(_: i32) {
    RESIZE_PENDING.store(true, Ordering::SeqCst);
}

fn host_winsize() -> Winsize {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    unsafe {
        libc::ioctl(libc::STDIN_FILENO, libc::TIOCGWINSZ, &mut ws);
    }
    Winsize {
        ws_row: ws.ws_row,
        ws_col: ws.ws_col,
        ws_xpixel: ws.ws_xpixel,
        ws_ypixel: ws.ws_ypixel,
    }
}

fn set_winsize(fd: RawFd, ws: &Winsize) {
    let raw = libc::winsize {
        ws_row: ws.ws_row,
        ws_col: ws.ws_col,
        ws_xpixel: ws.ws_xpixel,
        ws_ypixel: ws.ws_ypixel,
    };
    unsafe {
        libc::ioctl(fd, libc::TIOCSWINSZ, &raw);
    }
}

/// Make the PTY slave the calling process's controlling terminal. Must be
/// called in the forked child, after `setsid`.
fn make_controlling_tty(slave_fd: RawFd) -> nix::Result<()> {
    setsid()?;
    let ret = unsafe { libc::ioctl(slave_fd, libc::TIOCSCTTY as _, 0) };
    if ret < 0 {
        return Err(nix::Error::last());
    }
    Ok(())
}

/// Run `cmd` with `args` attached to a freshly allocated PTY, with the
/// host's own terminal switched to raw mode for the duration. Returns once
/// the user command has exited; terminal state is always restored.
pub fn run_interactive(cmd: &str, args: &[String]) -> Result<(), ExecError> {
    let pty = openpty(Some(&host_winsize()), None)
        .map_err(|e| ExecError::PtySpawn(cmd.to_string(), io::Error::from(e)))?;

    let stdin_fd = io::stdin().as_raw_fd();
    let had_termios = termios::tcgetattr(unsafe {
        std::os::fd::BorrowedFd::borrow_raw(stdin_fd)
    })
    .ok();

    if let Some(ref original) = had_termios {
        let mut raw = original.clone();
        termios::cfmakeraw(&mut raw);
        let _ = termios::tcsetattr(
            unsafe { std::os::fd::BorrowedFd::borrow_raw(stdin_fd) },
            SetArg::TCSANOW,
            &raw,
        );
    }

    let restore = {
        let stdin_fd = stdin_fd;
        let original = had_termios.clone();
        move || {
            if let Some(original) = &original {
                let _ = termios::tcsetattr(
                    unsafe { std::os::fd::BorrowedFd::borrow_raw(stdin_fd) },
                    SetArg::TCSANOW,
                    original,
                );
            }
        }
    };

    let result = spawn_and_pump(cmd, args, pty.master, pty.slave);
    restore();
    result
}

fn spawn_and_pump(
    cmd: &str,
    args: &[String],
    master: OwnedFd,
    slave: OwnedFd,
) -> Result<(), ExecError> {
    let slave_fd = slave.as_raw_fd();

    match unsafe { fork() }.map_err(|e| ExecError::PtySpawn(cmd.to_string(), io::Error::from(e)))? {
        ForkResult::Child => {
            drop(master);
            make_controlling_tty(slave_fd).ok();
            unsafe {
                libc::dup2(slave_fd, 0);
                libc::dup2(slave_fd, 1);
                libc::dup2(slave_fd, 2);
            }
            if slave_fd > 2 {
                let _ = nix::unistd::close(slave_fd);
            }

            let cmd_c = CString::new(cmd).expect("command has no interior NUL");
            let mut argv = vec![cmd_c.clone()];
            for a in args {
                argv.push(CString::new(a.as_str()).expect("argument has no interior NUL"));
            }
            let _ = execvp(&cmd_c, &argv);
            // execvp only returns on error.
            std::process::exit(127);
        }
        ForkResult::Parent { child } => {
            drop(slave);
            pump_io(master, child);
            Ok(())
        }
    }
}

fn master_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn master_write_all(fd: RawFd, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        buf = &buf[n as usize..];
    }
    Ok(())
}

/// Concurrently copy host stdin into the PTY master, the PTY master into
/// host stdout, and propagate SIGWINCH — three independent activities
/// sharing only the PTY master fd and stdio, all safe for concurrent
/// kernel-level access, joined on the child's exit.
fn pump_io(master: OwnedFd, child: Pid) {
    let master_fd = master.as_raw_fd();
    let done = Arc::new(AtomicBool::new(false));

    unsafe {
        let _ = signal::signal(Signal::SIGWINCH, SigHandler::Handler(on_sigwinch));
    }
    set_winsize(master_fd, &host_winsize());

    let stdin_to_master = {
        let done = done.clone();
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            let mut stdin = io::stdin();
            while !done.load(Ordering::SeqCst) {
                match stdin.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if master_write_all(master_fd, &buf[..n]).is_err() {
                            break;
                        }
                    }
                }
            }
        })
    };

    let resize_watcher = {
        let done = done.clone();
        std::thread::spawn(move || {
            while !done.load(Ordering::SeqCst) {
                if RESIZE_PENDING.swap(false, Ordering::SeqCst) {
                    set_winsize(master_fd, &host_winsize());
                }
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
        })
    };

    // master -> stdout runs on this thread and is the structural join
    // point: once the user command exits, reads from the master start
    // failing (EIO) and we fall through to waitpid.
    {
        let mut buf = [0u8; 4096];
        let mut stdout = io::stdout();
        loop {
            match master_read(master_fd, &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdout.write_all(&buf[..n]).is_err() {
                        break;
                    }
                    let _ = stdout.flush();
                }
            }
        }
    }

    let _ = waitpid(child, None);
    done.store(true, Ordering::SeqCst);
    let _ = stdin_to_master.join();
    let _ = resize_watcher.join();
    drop(master);
}
