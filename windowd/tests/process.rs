//! Drives real `windowd` processes
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

struct WindowdProcess {
    child: Child,
    lines: flume::Receiver<String>,
}

impl WindowdProcess {
    fn spawn(runtime_dir: &Path, commandline: &[&str]) -> anyhow::Result<Self> {
        let mut child = Command::new(env!("CARGO_BIN_EXE_windowd"))
            .arg("--runtime-dir")
            .arg(runtime_dir)
            .args(["--liveness-poll", "20ms", "--"])
            .args(commandline)
            .env("RUST_LOG", "warn")
            .stdout(Stdio::piped())
            .spawn()?;

        let stdout = child.stdout.take().expect("piped");
        let (tx, lines) = flume::unbounded();
        std::thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        Ok(Self { child, lines })
    }

    fn expect_line(&self, expected: &str) -> anyhow::Result<()> {
        loop {
            let line = self.lines.recv_timeout(Duration::from_secs(10))?;
            if line == expected {
                return Ok(());
            }
        }
    }

    fn terminate(&mut self) -> anyhow::Result<()> {
        kill(Pid::from_raw(i32::try_from(self.child.id())?), Signal::SIGTERM)?;
        assert!(self.child.wait()?.success());
        Ok(())
    }

    fn crash(&mut self) -> anyhow::Result<()> {
        self.child.kill()?;
        // reap it, a zombie still looks alive
        self.child.wait()?;
        Ok(())
    }
}

impl Drop for WindowdProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[test]
fn delegation_and_takeover_across_processes() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;

    let mut a = WindowdProcess::spawn(dir.path(), &["a"])?;
    a.expect_line("execute id=1 args=a")?;

    let mut b = WindowdProcess::spawn(dir.path(), &["b"])?;
    b.expect_line("execute id=2 args=b")?;
    b.expect_line("state=Watching")?;

    let mut delegating = WindowdProcess::spawn(dir.path(), &["-w", "1", "to-a"])?;
    delegating.expect_line("delegated")?;
    assert!(delegating.child.wait()?.success());
    a.expect_line("execute id=1 args=-w 1 to-a")?;

    a.crash()?;
    b.expect_line("state=Leader")?;

    let mut delegating = WindowdProcess::spawn(dir.path(), &["-w", "last", "to-b"])?;
    delegating.expect_line("delegated")?;
    assert!(delegating.child.wait()?.success());
    b.expect_line("execute id=2 args=-w last to-b")?;

    b.terminate()?;
    Ok(())
}
