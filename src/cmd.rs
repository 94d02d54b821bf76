use std::{
    fmt,
    io::{self, Read, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
};

use tracing::{debug, warn};

use crate::{config::Secret, error::InstallerError};

// ── Invocation ────────────────────────────────────────────────────────────────

/// One external tool call. Secrets only ever travel through `stdin`.
#[derive(Clone)]
pub struct Invocation {
    program: String,
    args: Vec<String>,
    root: Option<PathBuf>,
    env: Vec<(String, String)>,
    stdin: Option<Secret>,
}

impl Invocation {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            root: None,
            env: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_string()));
        self
    }

    /// Runs the program with `root` as its filesystem root (`chroot`).
    pub fn in_root(mut self, root: &Path) -> Self {
        self.root = Some(root.to_path_buf());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    /// Feeds `payload` to the child's stdin, then closes it.
    pub fn stdin(mut self, payload: Secret) -> Self {
        self.stdin = Some(payload);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn stdin_payload(&self) -> Option<&Secret> {
        self.stdin.as_ref()
    }

    /// The argument vector exactly as it reaches `execve`.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 3);
        if let Some(ref root) = self.root {
            argv.push("chroot".to_string());
            argv.push(root.display().to_string());
        }
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }

    fn command(&self) -> Command {
        let argv = self.argv();
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.argv().join(" "))?;
        if self.stdin.is_some() {
            f.write_str(" <stdin:***>")?;
        }
        Ok(())
    }
}

// ── Runner ────────────────────────────────────────────────────────────────────

/// Executes external tools on behalf of the stages.
///
/// Every partitioning, formatting, copy, package or bootloader command goes
/// through this trait, which is what makes the tool choices pluggable and
/// lets the tests drive whole runs without touching a disk.
pub trait CommandRunner: Send + Sync {
    /// Runs to completion and returns the captured stdout.
    fn run(&self, inv: &Invocation) -> Result<String, InstallerError>;

    /// Runs to completion, handing every stdout line to `on_line` as it
    /// arrives. Both `\n` and `\r` terminate a line.
    fn stream(
        &self,
        inv: &Invocation,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<(), InstallerError>;

    /// Runs a command and ignores any failure. Use for cleanup operations
    /// where partial failure is acceptable (e.g. umount).
    fn run_best_effort(&self, inv: &Invocation) {
        if let Err(e) = self.run(inv) {
            warn!("best-effort command {:?} failed: {}", inv, e);
        }
    }
}

/// Runs commands on the host with `std::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

fn not_found_or_io(program: &str, err: io::Error) -> InstallerError {
    if err.kind() == io::ErrorKind::NotFound {
        InstallerError::CommandNotFound {
            program: program.to_string(),
            package: package_for(program).to_string(),
        }
    } else {
        InstallerError::Io(err)
    }
}

/// Maps a binary name to the Debian package shipping it.
fn package_for(program: &str) -> &str {
    match program {
        "mkfs.fat" | "mkfs.vfat" => "dosfstools",
        "mkfs.ext4" => "e2fsprogs",
        "mkfs.btrfs" => "btrfs-progs",
        "mkfs.xfs" => "xfsprogs",
        "wipefs" | "lsblk" | "blkid" | "findmnt" => "util-linux",
        "mount" | "umount" => "mount",
        "parted" | "partprobe" => "parted",
        "udevadm" => "udev",
        "chroot" | "sync" => "coreutils",
        other => other,
    }
}

/// Feeds the secret and closes the pipe. A write error is only logged: a
/// child that exits without reading its stdin still has to be reaped, and
/// its exit status and stderr are what explain the failure.
fn write_stdin(child: &mut std::process::Child, program: &str, payload: Option<&Secret>) {
    if let (Some(mut pipe), Some(secret)) = (child.stdin.take(), payload) {
        let written = pipe
            .write_all(secret.expose().as_bytes())
            .and_then(|()| pipe.write_all(b"\n"));
        match written {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!("{} exited before reading its stdin", program)
            }
            Err(e) => warn!("could not write stdin of {}: {}", program, e),
        }
    }
}

fn diagnostic<'a>(stdout: &'a [u8], stderr: &'a [u8]) -> &'a [u8] {
    if String::from_utf8_lossy(stderr).trim().is_empty() {
        stdout
    } else {
        stderr
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, inv: &Invocation) -> Result<String, InstallerError> {
        debug!("running {:?}", inv);
        let argv0 = inv.argv().swap_remove(0);

        let mut child = inv
            .command()
            .stdin(if inv.stdin_payload().is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| not_found_or_io(&argv0, e))?;

        write_stdin(&mut child, inv.program(), inv.stdin_payload());
        let output = child.wait_with_output()?;

        if !output.status.success() {
            return Err(InstallerError::tool_failed(
                inv.program(),
                output.status.code(),
                diagnostic(&output.stdout, &output.stderr),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn stream(
        &self,
        inv: &Invocation,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<(), InstallerError> {
        debug!("streaming {:?}", inv);
        let argv0 = inv.argv().swap_remove(0);

        let mut child = inv
            .command()
            .stdin(if inv.stdin_payload().is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| not_found_or_io(&argv0, e))?;

        // Drain stderr on the side so a chatty tool cannot fill the pipe
        // while we block on stdin or stdout.
        let stderr_reader = child.stderr.take().map(|mut err| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = err.read_to_end(&mut buf);
                buf
            })
        });

        write_stdin(&mut child, inv.program(), inv.stdin_payload());

        let mut tail = Vec::new();
        if let Some(mut out) = child.stdout.take() {
            let mut chunk = [0u8; 8192];
            let mut line = Vec::new();
            loop {
                let n = match out.read(&mut chunk) {
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!("lost stdout of {}: {}", inv.program(), e);
                        0
                    }
                };
                if n == 0 {
                    break;
                }
                for &b in &chunk[..n] {
                    if b == b'\n' || b == b'\r' {
                        if !line.is_empty() {
                            on_line(&String::from_utf8_lossy(&line));
                            tail = std::mem::take(&mut line);
                        }
                    } else {
                        line.push(b);
                    }
                }
            }
            if !line.is_empty() {
                on_line(&String::from_utf8_lossy(&line));
                tail = line;
            }
        }

        let status = child.wait()?;
        let stderr = stderr_reader
            .and_then(|h| h.join().ok())
            .unwrap_or_default();

        if !status.success() {
            return Err(InstallerError::tool_failed(
                inv.program(),
                status.code(),
                diagnostic(&tail, &stderr),
            ));
        }
        Ok(())
    }
}

// ── Test double ───────────────────────────────────────────────────────────────
