//! Git repository fixtures for adapter and component tests.

use std::path::Path;
use std::process::Command;

use gitvan_core::{Error, Result};

/// Initialize a minimal git repo with one commit and a configured identity.
pub fn init_git_repo(dir: &Path) -> Result<()> {
    run(dir, &["git", "init", "-b", "main"])?;
    run(dir, &["git", "config", "user.email", "gitvan@example.com"])?;
    run(dir, &["git", "config", "user.name", "gitvan"])?;
    std::fs::write(dir.join("README.md"), "fixture")
        .map_err(|e| Error::io(dir.join("README.md").display().to_string(), e))?;
    run(dir, &["git", "add", "."])?;
    run(dir, &["git", "commit", "-m", "init"])?;
    Ok(())
}

/// Write a file and commit it, advancing HEAD by one commit.
pub fn commit_file(dir: &Path, name: &str, contents: &str) -> Result<()> {
    std::fs::write(dir.join(name), contents)
        .map_err(|e| Error::io(dir.join(name).display().to_string(), e))?;
    run(dir, &["git", "add", name])?;
    run(dir, &["git", "commit", "-m", &format!("add {}", name)])?;
    Ok(())
}

fn run(dir: &Path, args: &[&str]) -> Result<()> {
    let out = Command::new(args[0])
        .args(&args[1..])
        .current_dir(dir)
        .output()
        .map_err(|e| Error::io(format!("{:?}", args), e))?;
    if !out.status.success() {
        return Err(Error::Git {
            op: args.join(" "),
            code: out.status.code(),
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        });
    }
    Ok(())
}
