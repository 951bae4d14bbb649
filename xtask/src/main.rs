//! Development tasks of the autofs workspace, run as `cargo xtask <task>`.

use anyhow::{bail, ensure, Context as _};
use std::{
    env,
    ffi::OsStr,
    fs,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::Duration,
};
use wait_timeout::ChildExt as _;

const USAGE: &str = "\
usage: cargo xtask <task>

tasks:
    lint    check formatting and run clippy on every target
    test    run the unit, integration and doc tests of the workspace
    doc     build the API docs of the library crates
";

/// Crates whose API docs are built. The first one is the landing page.
const DOC_CRATES: &[&str] = &["autofs", "autofs-kernel"];

/// Upper bound for a single `cargo doc` run.
const DOC_TIMEOUT: Duration = Duration::from_secs(10 * 60);

fn main() -> anyhow::Result<()> {
    let mut args = pico_args::Arguments::from_env();
    if args.contains(["-h", "--help"]) {
        print!("{}", USAGE);
        return Ok(());
    }

    let task = args.subcommand()?;
    let rest = args.finish();
    ensure!(rest.is_empty(), "unexpected arguments: {:?}", rest);

    let ws = Workspace::locate()?;
    match task.as_deref() {
        Some("lint") => ws.lint(),
        Some("test") => ws.test(),
        Some("doc") => ws.doc(),
        Some(other) => {
            eprint!("{}", USAGE);
            bail!("unknown task `{}`", other)
        }
        None => {
            eprint!("{}", USAGE);
            bail!("no task given")
        }
    }
}

struct Workspace {
    root: PathBuf,
    target: PathBuf,
}

impl Workspace {
    fn locate() -> anyhow::Result<Self> {
        let root = Path::new(env!("CARGO_MANIFEST_DIR"))
            .parent()
            .context("xtask is not inside the workspace")?
            .to_owned();
        let target = env::var_os("CARGO_TARGET_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| root.join("target"));
        Ok(Self { root, target })
    }

    fn cargo<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(env::var_os("CARGO").unwrap_or_else(|| "cargo".into()));
        cmd.args(args).current_dir(&self.root).stdin(Stdio::null());
        cmd
    }

    /// Whether the cargo subcommand `tool` is installed.
    fn has(&self, tool: &str) -> bool {
        self.cargo([tool, "--version"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_or(false, |st| st.success())
    }

    fn lint(&self) -> anyhow::Result<()> {
        let checks: [(&str, &[&str]); 2] = [
            ("fmt", &["fmt", "--all", "--", "--check"]),
            ("clippy", &["clippy", "--workspace", "--all-targets"]),
        ];
        for (tool, args) in checks {
            if self.has(tool) {
                run(&mut self.cargo(args), None)?;
            } else {
                eprintln!("[xtask] cargo {} is not installed, skipping", tool);
            }
        }
        Ok(())
    }

    fn test(&self) -> anyhow::Result<()> {
        run(&mut self.cargo(["test", "--workspace", "--all-targets"]), None)?;
        // doctests are not part of `--all-targets`.
        run(&mut self.cargo(["test", "--workspace", "--doc"]), None)
    }

    fn doc(&self) -> anyhow::Result<()> {
        let out = self.target.join("doc");
        if out.exists() {
            fs::remove_dir_all(&out)
                .with_context(|| format!("cannot clean {}", out.display()))?;
        }

        let mut cmd = self.cargo(["doc", "--no-deps"]);
        for krate in DOC_CRATES {
            cmd.arg("--package").arg(krate);
        }
        run(&mut cmd, Some(DOC_TIMEOUT))?;

        let landing = DOC_CRATES[0].replace('-', "_");
        fs::write(
            out.join("index.html"),
            format!("<meta http-equiv=\"refresh\" content=\"0;url={}\">\n", landing),
        )?;
        Ok(())
    }
}

fn run(cmd: &mut Command, timeout: Option<Duration>) -> anyhow::Result<()> {
    eprintln!("[xtask] {:?}", cmd);
    let program = cmd.get_program().to_owned();
    let mut child = cmd
        .spawn()
        .with_context(|| format!("cannot spawn {:?}", program))?;

    let status = match timeout {
        None => child.wait()?,
        Some(limit) => match child.wait_timeout(limit)? {
            Some(status) => status,
            None => {
                let _ = child.kill();
                child.wait()?;
                bail!("{:?} did not finish within {:?}", program, limit);
            }
        },
    };
    ensure!(status.success(), "{:?} exited with {}", program, status);
    Ok(())
}
