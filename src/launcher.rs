//! Starting the measured command

use anyhow::{Context, Result};
use nix::sys::signal::{kill, pthread_sigmask, SigSet, SigmaskHow, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command};

/// Start `command` as a direct child running with `child_mask` as its signal
/// mask.
///
/// The child inherits the sampler's blocked set across fork and exec, so the
/// mask must be replaced between the two or forwarded signals would stay
/// pending in the workload.
pub fn launch(command: &[String], child_mask: &SigSet) -> Result<Child> {
    let Some((program, args)) = command.split_first() else {
        anyhow::bail!("Command array is empty");
    };

    let mask = *child_mask;
    let mut cmd = Command::new(program);
    cmd.args(args);
    // SAFETY: pthread_sigmask is async-signal-safe and touches no heap state
    unsafe {
        cmd.pre_exec(move || {
            pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&mask), None)?;
            Ok(())
        });
    }

    let child = cmd
        .spawn()
        .with_context(|| format!("Failed to start {}", program))?;

    tracing::debug!("Started {} as pid {}", program, child.id());
    Ok(child)
}

/// Pass a termination signal on to the child. Best effort: the child may
/// already be gone.
pub fn forward_signal(pid: u32, signal: Signal) {
    tracing::debug!("Forwarding {} to pid {}", signal, pid);
    if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
        tracing::debug!("Could not forward {} to {}: {}", signal, pid, e);
    }
}

/// Block until the child terminates and return its exit code.
///
/// Death by signal is reported shell-style as `128 + signo`.
pub fn reap(pid: u32) -> Result<i32> {
    let pid = Pid::from_raw(pid as i32);
    loop {
        match waitpid(pid, None).context("Failed to wait for child")? {
            WaitStatus::Exited(_, code) => return Ok(code),
            WaitStatus::Signaled(_, sig, _) => {
                tracing::debug!("Child killed by signal: {:?}", sig);
                return Ok(128 + sig as i32);
            }
            _ => continue,
        }
    }
}

/// Kill and reap a child when setup fails after it was started
pub fn abort_child(pid: u32) {
    forward_signal(pid, Signal::SIGKILL);
    let _ = reap(pid);
}
