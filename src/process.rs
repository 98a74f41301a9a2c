//! Running shell commands for actions.

use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Success,
    Interrupted,
    Failure,
}

#[cfg(unix)]
fn shell_command(cmdline: &str) -> std::process::Command {
    let mut cmd = std::process::Command::new("/bin/sh");
    cmd.arg("-c").arg(cmdline);
    cmd
}

#[cfg(windows)]
fn shell_command(cmdline: &str) -> std::process::Command {
    let mut cmd = std::process::Command::new("cmd");
    cmd.arg("/c").arg(cmdline);
    cmd
}

#[cfg(unix)]
fn describe_signal(status: &std::process::ExitStatus, output: &mut Vec<u8>) -> Termination {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(libc::SIGINT) => {
            let _ = write!(output, "interrupted");
            Termination::Interrupted
        }
        Some(sig) => {
            let _ = write!(output, "signal {}", sig);
            Termination::Failure
        }
        None => Termination::Failure,
    }
}

#[cfg(windows)]
fn describe_signal(_status: &std::process::ExitStatus, _output: &mut Vec<u8>) -> Termination {
    Termination::Failure
}

/// Run a command line through the shell, returning how it ended and its
/// stdout followed by its stderr.  Returns an Err() only if the shell
/// couldn't be started.
pub fn run_command(cmdline: &str) -> anyhow::Result<(Termination, Vec<u8>)> {
    let mut result = shell_command(cmdline)
        .stdin(std::process::Stdio::null())
        .output()
        .map_err(|err| anyhow::anyhow!("spawn shell: {}", err))?;
    let mut output = Vec::new();
    output.append(&mut result.stdout);
    output.append(&mut result.stderr);
    let termination = if result.status.success() {
        Termination::Success
    } else {
        describe_signal(&result.status, &mut output)
    };
    Ok((termination, output))
}
