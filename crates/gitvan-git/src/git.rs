use std::path::{Path, PathBuf};
use std::process::Stdio;

use gitvan_core::{Error, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Thin, deterministic wrapper over the host `git`. Arguments are passed as
/// argv (no shell), the working directory is the repo root handed in at
/// construction, and every invocation runs with `TZ=UTC`, a C locale and a
/// neutral author/committer identity so note commits never depend on host
/// configuration. `GIT_DIR` / `GIT_WORK_TREE` pass through untouched.
#[derive(Clone, Debug)]
pub struct GitRepo {
    root: PathBuf,
}

impl GitRepo {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fails with a `Git` error if the root is not inside a git repository.
    pub async fn ensure_repo(&self) -> Result<()> {
        self.run(&["rev-parse", "--git-dir"]).await?;
        Ok(())
    }

    // ---- refs ----

    /// Atomic "create only if absent". A lost race is `false`, not an error.
    pub async fn update_ref_if_absent(&self, reference: &str, sha: &str) -> Result<bool> {
        self.run_guarded(&["update-ref", reference, sha, ""]).await
    }

    /// Compare-and-swap: move `reference` from `expect` to `new`.
    pub async fn update_ref(&self, reference: &str, new: &str, expect: &str) -> Result<bool> {
        self.run_guarded(&["update-ref", reference, new, expect]).await
    }

    /// Unconditional ref update.
    pub async fn set_ref(&self, reference: &str, sha: &str) -> Result<()> {
        self.run(&["update-ref", reference, sha]).await?;
        Ok(())
    }

    pub async fn delete_ref(&self, reference: &str) -> Result<bool> {
        self.run_guarded(&["update-ref", "-d", reference]).await
    }

    /// Delete only if the ref still points at `expect`.
    pub async fn delete_ref_expecting(&self, reference: &str, expect: &str) -> Result<bool> {
        self.run_guarded(&["update-ref", "-d", reference, expect]).await
    }

    /// `None` when the ref does not exist. Never mutates.
    pub async fn read_ref(&self, reference: &str) -> Result<Option<String>> {
        let out = self
            .run_text(&["for-each-ref", "--format=%(objectname)", reference])
            .await?;
        Ok(out.lines().next().map(|l| l.to_string()))
    }

    pub async fn list_refs(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let out = self
            .run_text(&["for-each-ref", "--format=%(refname) %(objectname)", prefix])
            .await?;
        let mut refs = Vec::new();
        for line in out.lines() {
            if let Some((name, sha)) = line.split_once(' ') {
                refs.push((name.to_string(), sha.to_string()));
            }
        }
        Ok(refs)
    }

    // ---- objects ----

    pub async fn write_blob(&self, bytes: &[u8]) -> Result<String> {
        let out = self
            .output(&["hash-object", "-w", "--stdin"], Some(bytes))
            .await?;
        if !out.status.success() {
            return Err(self.git_error(&["hash-object", "-w", "--stdin"], &out));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    /// Raw blob bytes, untrimmed.
    pub async fn read_blob(&self, sha: &str) -> Result<Vec<u8>> {
        self.run(&["cat-file", "blob", sha]).await
    }

    // ---- notes ----

    /// Append `text` to the note on `commit`, creating it if absent. Uses a
    /// read-modify-write (`show` + `add -f`) so lines are joined with exactly
    /// one `\n` regardless of the host git's `notes append` separator.
    pub async fn append_note(&self, note_ref: &str, commit: &str, text: &str) -> Result<()> {
        let combined = match self.show_note(note_ref, commit).await? {
            Some(existing) => format!("{}\n{}", existing, text),
            None => text.to_string(),
        };
        let args = ["notes", "--ref", note_ref, "add", "-f", "-F", "-", commit];
        let out = self.output(&args, Some(combined.as_bytes())).await?;
        if !out.status.success() {
            return Err(self.git_error(&args, &out));
        }
        Ok(())
    }

    /// `None` when `commit` carries no note on this ref.
    pub async fn show_note(&self, note_ref: &str, commit: &str) -> Result<Option<String>> {
        let args = ["notes", "--ref", note_ref, "show", commit];
        let out = self.output(&args, None).await?;
        if !out.status.success() {
            debug!("no note at {} for {}", note_ref, commit);
            return Ok(None);
        }
        Ok(Some(
            String::from_utf8_lossy(&out.stdout)
                .trim_end_matches('\n')
                .to_string(),
        ))
    }

    /// All `(note_sha, target_commit)` pairs on a notes ref.
    pub async fn list_notes(&self, note_ref: &str) -> Result<Vec<(String, String)>> {
        let args = ["notes", "--ref", note_ref, "list"];
        let out = self.output(&args, None).await?;
        if !out.status.success() {
            // A notes ref that was never written lists as empty.
            return Ok(Vec::new());
        }
        let text = String::from_utf8_lossy(&out.stdout).to_string();
        let mut notes = Vec::new();
        for line in text.lines() {
            if let Some((note, target)) = line.split_once(' ') {
                notes.push((note.to_string(), target.to_string()));
            }
        }
        Ok(notes)
    }

    pub async fn remove_note(&self, note_ref: &str, commit: &str) -> Result<()> {
        self.run(&["notes", "--ref", note_ref, "remove", "--ignore-missing", commit])
            .await?;
        Ok(())
    }

    // ---- commits ----

    pub async fn head_commit(&self) -> Result<String> {
        self.run_text(&["rev-parse", "HEAD"]).await
    }

    /// `None` when HEAD is detached.
    pub async fn current_branch(&self) -> Result<Option<String>> {
        let out = self.output(&["rev-parse", "--abbrev-ref", "HEAD"], None).await?;
        if !out.status.success() {
            return Ok(None);
        }
        let name = String::from_utf8_lossy(&out.stdout).trim().to_string();
        if name.is_empty() || name == "HEAD" {
            Ok(None)
        } else {
            Ok(Some(name))
        }
    }

    /// The `n` most recent commits reachable from HEAD, newest first.
    pub async fn recent_commits(&self, n: usize) -> Result<Vec<String>> {
        let count = n.to_string();
        let out = self.run_text(&["rev-list", "-n", &count, "HEAD"]).await?;
        Ok(out.lines().map(|l| l.to_string()).collect())
    }

    // ---- plumbing ----

    async fn run(&self, args: &[&str]) -> Result<Vec<u8>> {
        let out = self.output(args, None).await?;
        if !out.status.success() {
            return Err(self.git_error(args, &out));
        }
        Ok(out.stdout)
    }

    async fn run_text(&self, args: &[&str]) -> Result<String> {
        let bytes = self.run(args).await?;
        Ok(String::from_utf8_lossy(&bytes).trim().to_string())
    }

    /// For guarded ref updates a non-zero exit is the lost race.
    async fn run_guarded(&self, args: &[&str]) -> Result<bool> {
        let out = self.output(args, None).await?;
        if !out.status.success() {
            debug!(
                "git {} refused: {}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(out.status.success())
    }

    async fn output(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<std::process::Output> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(&self.root)
            .env("TZ", "UTC")
            .env("LANG", "C")
            .env("LC_ALL", "C")
            .env("GIT_AUTHOR_NAME", "gitvan")
            .env("GIT_AUTHOR_EMAIL", "gitvan@localhost")
            .env("GIT_COMMITTER_NAME", "gitvan")
            .env("GIT_COMMITTER_EMAIL", "gitvan@localhost")
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::io(format!("spawn git {}", args.join(" ")), e))?;

        if let Some(bytes) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(bytes)
                    .await
                    .map_err(|e| Error::io(format!("git {} stdin", args.join(" ")), e))?;
                // Dropping the pipe closes stdin.
            }
        }

        child
            .wait_with_output()
            .await
            .map_err(|e| Error::io(format!("git {}", args.join(" ")), e))
    }

    fn git_error(&self, args: &[&str], out: &std::process::Output) -> Error {
        Error::Git {
            op: args.join(" "),
            code: out.status.code(),
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{commit_file, init_git_repo};
    use tempfile::tempdir;

    fn repo() -> (tempfile::TempDir, GitRepo) {
        let dir = tempdir().unwrap();
        init_git_repo(dir.path()).unwrap();
        let repo = GitRepo::open(dir.path());
        (dir, repo)
    }

    #[tokio::test]
    async fn blob_round_trip_preserves_bytes() {
        let (_dir, repo) = repo();
        let payload = b"line one\nline two\n";
        let sha = repo.write_blob(payload).await.unwrap();
        assert_eq!(sha.len(), 40);
        let back = repo.read_blob(&sha).await.unwrap();
        assert_eq!(back, payload);
    }

    #[tokio::test]
    async fn ref_create_is_exclusive() {
        let (_dir, repo) = repo();
        let a = repo.write_blob(b"a").await.unwrap();
        let b = repo.write_blob(b"b").await.unwrap();

        assert!(repo
            .update_ref_if_absent("refs/gitvan/locks/t", &a)
            .await
            .unwrap());
        assert!(!repo
            .update_ref_if_absent("refs/gitvan/locks/t", &b)
            .await
            .unwrap());
        assert_eq!(
            repo.read_ref("refs/gitvan/locks/t").await.unwrap(),
            Some(a.clone())
        );

        // CAS with the wrong expectation fails, with the right one succeeds.
        assert!(!repo.update_ref("refs/gitvan/locks/t", &b, &b).await.unwrap());
        assert!(repo.update_ref("refs/gitvan/locks/t", &b, &a).await.unwrap());

        assert!(repo.delete_ref("refs/gitvan/locks/t").await.unwrap());
        assert!(repo.read_ref("refs/gitvan/locks/t").await.unwrap().is_none());
        assert!(!repo.delete_ref("refs/gitvan/locks/t").await.unwrap());
    }

    #[tokio::test]
    async fn list_refs_scopes_by_prefix() {
        let (_dir, repo) = repo();
        let sha = repo.write_blob(b"x").await.unwrap();
        repo.set_ref("refs/gitvan/snapshots/one", &sha).await.unwrap();
        repo.set_ref("refs/gitvan/snapshots/two", &sha).await.unwrap();
        repo.set_ref("refs/gitvan/locks/other", &sha).await.unwrap();

        let refs = repo.list_refs("refs/gitvan/snapshots/").await.unwrap();
        assert_eq!(refs.len(), 2);
        assert!(refs.iter().all(|(name, _)| name.starts_with("refs/gitvan/snapshots/")));
    }

    #[tokio::test]
    async fn notes_append_show_and_remove() {
        let (_dir, repo) = repo();
        let head = repo.head_commit().await.unwrap();
        let nref = "refs/notes/gitvan/results";

        assert!(repo.show_note(nref, &head).await.unwrap().is_none());
        repo.append_note(nref, &head, "{\"n\":1}").await.unwrap();
        repo.append_note(nref, &head, "{\"n\":2}").await.unwrap();

        let text = repo.show_note(nref, &head).await.unwrap().unwrap();
        assert_eq!(text, "{\"n\":1}\n{\"n\":2}");

        let notes = repo.list_notes(nref).await.unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].1, head);

        repo.remove_note(nref, &head).await.unwrap();
        assert!(repo.show_note(nref, &head).await.unwrap().is_none());
        // Removing again is tolerated.
        repo.remove_note(nref, &head).await.unwrap();
    }

    #[tokio::test]
    async fn head_branch_and_recent_commits() {
        let (dir, repo) = repo();
        let first = repo.head_commit().await.unwrap();
        assert_eq!(repo.current_branch().await.unwrap().as_deref(), Some("main"));

        commit_file(dir.path(), "second.txt", "2").unwrap();
        let second = repo.head_commit().await.unwrap();
        assert_ne!(first, second);

        let recent = repo.recent_commits(10).await.unwrap();
        assert_eq!(recent, vec![second, first]);
    }

    #[tokio::test]
    async fn ensure_repo_rejects_plain_directories() {
        let dir = tempdir().unwrap();
        let repo = GitRepo::open(dir.path());
        let err = repo.ensure_repo().await.unwrap_err();
        assert!(matches!(err, Error::Git { .. }));
    }
}
