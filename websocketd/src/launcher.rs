use std::io;
use std::process::Stdio;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

/// A freshly spawned child with its three pipes detached and ready to hand
/// to a process endpoint.
pub struct LaunchedProcess {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
    pub pid: Option<u32>,
}

/// Spawn `command` with pipes on all three standard streams.
///
/// The child inherits nothing: its environment is exactly the supplied
/// list, applied in order so later duplicates mask earlier ones. On any
/// failure the pipes created so far are released by drop.
pub fn launch(command: &str, args: &[String], env: &[(String, String)]) -> io::Result<LaunchedProcess> {
    let mut cmd = Command::new(command);
    cmd.args(args)
        .env_clear()
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for (key, value) in env {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn()?;

    let stdin = child.stdin.take().ok_or_else(|| io::Error::other("child stdin missing"))?;
    let stdout = child.stdout.take().ok_or_else(|| io::Error::other("child stdout missing"))?;
    let stderr = child.stderr.take().ok_or_else(|| io::Error::other("child stderr missing"))?;
    let pid = child.id();

    Ok(LaunchedProcess {
        child,
        stdin,
        stdout,
        stderr,
        pid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_failure_reports_the_error() {
        let result = launch("/definitely/not/a/binary", &[], &[]);
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn child_sees_only_the_supplied_environment() {
        use tokio::io::AsyncReadExt as _;

        let env = vec![("MARKER".to_owned(), "42".to_owned())];
        let mut launched = launch("/usr/bin/env", &[], &env).expect("env spawns");

        let mut output = String::new();
        launched
            .stdout
            .read_to_string(&mut output)
            .await
            .expect("read stdout");
        launched.child.wait().await.expect("child exits");

        assert!(output.contains("MARKER=42"));
        assert!(!output.contains("PATH="), "environment must not be inherited");
    }
}
