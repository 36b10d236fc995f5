//! Source tree controller.
//!
//! Wraps the version-control primitives the pipeline consumes: sync, diff,
//! branch, commit, push, merge, delete, discard. Each operation either fully
//! succeeds or returns an error; partial application is not modeled. The
//! orchestrator is the sole writer of the checkout.

use std::path::{Path, PathBuf};

use git2::build::CheckoutBuilder;
use git2::{BranchType, Delta, DiffOptions, IndexAddOption, Oid, Repository, ResetType, Signature};
use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangedPath {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// The actual (path, change-type) pairs in the working tree relative to a
/// snapshot. Ground truth for classification; never assumed to match the
/// agent's self-reported file lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffResult {
    pub changes: Vec<ChangedPath>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn paths_of(&self, kind: ChangeKind) -> Vec<&Path> {
        self.changes
            .iter()
            .filter(|c| c.kind == kind)
            .map(|c| c.path.as_path())
            .collect()
    }
}

fn vc(op: &'static str) -> impl FnOnce(git2::Error) -> PipelineError {
    move |source| PipelineError::VersionControl { op, source }
}

pub struct SourceTree {
    repo: Repository,
    remote_name: String,
    integrated: String,
}

impl SourceTree {
    pub fn open(
        project_dir: &Path,
        remote_name: &str,
        integrated: &str,
    ) -> Result<Self, PipelineError> {
        let repo = Repository::open(project_dir).map_err(vc("open"))?;
        Ok(Self {
            repo,
            remote_name: remote_name.to_string(),
            integrated: integrated.to_string(),
        })
    }

    pub fn integrated_branch(&self) -> &str {
        &self.integrated
    }

    fn signature(&self) -> Result<Signature<'static>, PipelineError> {
        Signature::now("shipwright", "shipwright@localhost").map_err(vc("signature"))
    }

    pub fn current_branch(&self) -> Result<String, PipelineError> {
        let head = self.repo.head().map_err(vc("head"))?;
        Ok(head.shorthand().unwrap_or("HEAD").to_string())
    }

    pub fn head_sha(&self) -> Result<String, PipelineError> {
        let commit = self
            .repo
            .head()
            .and_then(|h| h.peel_to_commit())
            .map_err(vc("head"))?;
        Ok(commit.id().to_string())
    }

    /// True when the index and working tree exactly match HEAD.
    pub fn is_clean(&self) -> Result<bool, PipelineError> {
        let mut opts = git2::StatusOptions::new();
        opts.include_untracked(true).include_ignored(false);
        let statuses = self.repo.statuses(Some(&mut opts)).map_err(vc("status"))?;
        Ok(statuses.is_empty())
    }

    /// Synchronize to the latest integrated state, discarding local drift:
    /// fetch, force the local integrated branch to the remote tip, check it
    /// out, and drop uncommitted and untracked content.
    pub fn sync_to_integrated(&self) -> Result<(), PipelineError> {
        {
            let mut remote = self
                .repo
                .find_remote(&self.remote_name)
                .map_err(vc("fetch"))?;
            remote
                .fetch(&[self.integrated.as_str()], None, None)
                .map_err(vc("fetch"))?;
        }
        let remote_ref = format!("refs/remotes/{}/{}", self.remote_name, self.integrated);
        let target = self
            .repo
            .find_reference(&remote_ref)
            .and_then(|r| r.peel_to_commit())
            .map_err(vc("sync"))?;

        // Detach first so the integrated branch can be force-moved even when
        // it is the current HEAD.
        self.repo
            .set_head_detached(target.id())
            .map_err(vc("sync"))?;
        self.repo
            .branch(&self.integrated, &target, true)
            .map_err(vc("sync"))?;
        self.repo
            .set_head(&format!("refs/heads/{}", self.integrated))
            .map_err(vc("sync"))?;
        self.discard_all()
    }

    /// Drop all uncommitted and untracked content, keeping HEAD where it is.
    pub fn discard_all(&self) -> Result<(), PipelineError> {
        let head = self
            .repo
            .head()
            .and_then(|h| h.peel_to_commit())
            .map_err(vc("discard"))?;
        self.repo
            .reset(head.as_object(), ResetType::Hard, None)
            .map_err(vc("discard"))?;
        let mut co = CheckoutBuilder::new();
        co.force().remove_untracked(true);
        self.repo
            .checkout_head(Some(&mut co))
            .map_err(vc("discard"))?;
        Ok(())
    }

    /// Unconditional return to a clean integrated state. Covers the
    /// exception path: aborts any in-progress merge, discards everything,
    /// and checks the integrated line back out.
    pub fn restore_clean(&self) -> Result<(), PipelineError> {
        let _ = self.repo.cleanup_state();
        self.discard_all()?;
        self.repo
            .set_head(&format!("refs/heads/{}", self.integrated))
            .map_err(vc("restore"))?;
        let mut co = CheckoutBuilder::new();
        co.force().remove_untracked(true);
        self.repo
            .checkout_head(Some(&mut co))
            .map_err(vc("restore"))?;
        Ok(())
    }

    /// Compute the actual changes in the working tree since `base_sha`.
    pub fn diff_since(&self, base_sha: &str) -> Result<DiffResult, PipelineError> {
        let oid = Oid::from_str(base_sha).map_err(vc("diff"))?;
        let base_tree = self
            .repo
            .find_commit(oid)
            .and_then(|c| c.tree())
            .map_err(vc("diff"))?;

        let mut opts = DiffOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let diff = self
            .repo
            .diff_tree_to_workdir_with_index(Some(&base_tree), Some(&mut opts))
            .map_err(vc("diff"))?;

        let mut changes = Vec::new();
        diff.foreach(
            &mut |delta, _progress| {
                let kind = match delta.status() {
                    Delta::Added | Delta::Untracked => Some(ChangeKind::Added),
                    Delta::Modified | Delta::Renamed | Delta::Typechange => {
                        Some(ChangeKind::Modified)
                    }
                    Delta::Deleted => Some(ChangeKind::Deleted),
                    _ => None,
                };
                if let (Some(kind), Some(path)) = (kind, delta.new_file().path()) {
                    changes.push(ChangedPath {
                        path: path.to_path_buf(),
                        kind,
                    });
                }
                true
            },
            None,
            None,
            None,
        )
        .map_err(vc("diff"))?;

        Ok(DiffResult { changes })
    }

    /// Create `name` at HEAD and check it out.
    pub fn create_branch(&self, name: &str) -> Result<(), PipelineError> {
        let head = self
            .repo
            .head()
            .and_then(|h| h.peel_to_commit())
            .map_err(vc("branch"))?;
        self.repo.branch(name, &head, false).map_err(vc("branch"))?;
        self.repo
            .set_head(&format!("refs/heads/{}", name))
            .map_err(vc("branch"))?;
        Ok(())
    }

    /// Stage everything (including deletions) and commit. Returns the sha.
    pub fn commit_all(&self, message: &str) -> Result<String, PipelineError> {
        let mut index = self.repo.index().map_err(vc("commit"))?;
        index
            .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
            .map_err(vc("commit"))?;
        index.update_all(["*"].iter(), None).map_err(vc("commit"))?;
        index.write().map_err(vc("commit"))?;
        let tree_id = index.write_tree().map_err(vc("commit"))?;
        let tree = self.repo.find_tree(tree_id).map_err(vc("commit"))?;
        let parent = self
            .repo
            .head()
            .and_then(|h| h.peel_to_commit())
            .map_err(vc("commit"))?;
        let sig = self.signature()?;
        let commit_id = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])
            .map_err(vc("commit"))?;
        Ok(commit_id.to_string())
    }

    pub fn push(&self, branch: &str) -> Result<(), PipelineError> {
        let mut remote = self
            .repo
            .find_remote(&self.remote_name)
            .map_err(vc("push"))?;
        let refspec = format!("refs/heads/{0}:refs/heads/{0}", branch);
        remote
            .push(&[refspec.as_str()], None)
            .map_err(vc("push"))?;
        Ok(())
    }

    /// Merge `branch` into the integrated line. Fast-forwards when possible,
    /// creates a merge commit otherwise. Conflicts abort the merge, leave
    /// the tree clean, and surface as `MergeFailed`. Returns the sha of the
    /// integrated tip after the merge.
    pub fn merge_into_integrated(&self, branch: &str) -> Result<String, PipelineError> {
        self.repo
            .set_head(&format!("refs/heads/{}", self.integrated))
            .map_err(vc("merge"))?;
        let mut co = CheckoutBuilder::new();
        co.force();
        self.repo.checkout_head(Some(&mut co)).map_err(vc("merge"))?;

        let branch_ref = self
            .repo
            .find_branch(branch, BranchType::Local)
            .map_err(vc("merge"))?;
        let annotated = self
            .repo
            .reference_to_annotated_commit(branch_ref.get())
            .map_err(vc("merge"))?;
        let (analysis, _) = self
            .repo
            .merge_analysis(&[&annotated])
            .map_err(vc("merge"))?;

        if analysis.is_up_to_date() {
            return self.head_sha();
        }

        if analysis.is_fast_forward() {
            let target_id = annotated.id();
            let mut reference = self
                .repo
                .find_reference(&format!("refs/heads/{}", self.integrated))
                .map_err(vc("merge"))?;
            reference
                .set_target(target_id, &format!("fast-forward to {}", branch))
                .map_err(vc("merge"))?;
            self.repo
                .set_head(&format!("refs/heads/{}", self.integrated))
                .map_err(vc("merge"))?;
            let mut co = CheckoutBuilder::new();
            co.force();
            self.repo.checkout_head(Some(&mut co)).map_err(vc("merge"))?;
            return Ok(target_id.to_string());
        }

        self.repo
            .merge(&[&annotated], None, Some(CheckoutBuilder::new().force()))
            .map_err(vc("merge"))?;

        let mut index = self.repo.index().map_err(vc("merge"))?;
        if index.has_conflicts() {
            let conflicted: Vec<String> = index
                .conflicts()
                .map_err(vc("merge"))?
                .filter_map(|c| c.ok())
                .filter_map(|c| c.our.or(c.their))
                .map(|entry| String::from_utf8_lossy(&entry.path).into_owned())
                .collect();
            let _ = self.repo.cleanup_state();
            let _ = self.discard_all();
            return Err(PipelineError::MergeFailed {
                branch: branch.to_string(),
                message: format!("conflicts in {}", conflicted.join(", ")),
            });
        }

        let tree_id = index.write_tree_to(&self.repo).map_err(vc("merge"))?;
        let tree = self.repo.find_tree(tree_id).map_err(vc("merge"))?;
        let head_commit = self
            .repo
            .head()
            .and_then(|h| h.peel_to_commit())
            .map_err(vc("merge"))?;
        let branch_commit = self
            .repo
            .find_commit(annotated.id())
            .map_err(vc("merge"))?;
        let sig = self.signature()?;
        let merge_id = self
            .repo
            .commit(
                Some("HEAD"),
                &sig,
                &sig,
                &format!("Merge branch '{}'", branch),
                &tree,
                &[&head_commit, &branch_commit],
            )
            .map_err(vc("merge"))?;
        self.repo.cleanup_state().map_err(vc("merge"))?;
        let mut co = CheckoutBuilder::new();
        co.force();
        self.repo.checkout_head(Some(&mut co)).map_err(vc("merge"))?;
        Ok(merge_id.to_string())
    }

    /// Delete `name` locally and on the remote. Must not be checked out.
    pub fn delete_branch(&self, name: &str) -> Result<(), PipelineError> {
        let mut branch = self
            .repo
            .find_branch(name, BranchType::Local)
            .map_err(vc("delete-branch"))?;
        branch.delete().map_err(vc("delete-branch"))?;
        let mut remote = self
            .repo
            .find_remote(&self.remote_name)
            .map_err(vc("delete-branch"))?;
        let refspec = format!(":refs/heads/{}", name);
        remote
            .push(&[refspec.as_str()], None)
            .map_err(vc("delete-branch"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// Work repo with a bare origin, one pushed commit on main.
    fn setup() -> (SourceTree, TempDir) {
        let dir = TempDir::new().unwrap();
        let origin_path = dir.path().join("origin.git");
        let mut opts = git2::RepositoryInitOptions::new();
        opts.bare(true).initial_head("main");
        Repository::init_opts(&origin_path, &opts).unwrap();

        let work_path = dir.path().join("work");
        let mut opts = git2::RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(&work_path, &opts).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        drop(config);
        repo.remote("origin", origin_path.to_str().unwrap()).unwrap();

        fs::write(work_path.join("index.html"), "<h1>home</h1>\n").unwrap();
        commit_all_raw(&repo, "init");
        push_raw(&repo, "main");

        let tree = SourceTree::open(&work_path, "origin", "main").unwrap();
        (tree, dir)
    }

    fn commit_all_raw(repo: &Repository, msg: &str) -> String {
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
            .unwrap();
        index.update_all(["*"].iter(), None).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("test", "test@test.com").unwrap();
        let id = if let Ok(head) = repo.head() {
            let parent = head.peel_to_commit().unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[&parent])
                .unwrap()
        } else {
            repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[])
                .unwrap()
        };
        id.to_string()
    }

    fn push_raw(repo: &Repository, branch: &str) {
        let mut remote = repo.find_remote("origin").unwrap();
        remote
            .push(
                &[format!("+refs/heads/{0}:refs/heads/{0}", branch).as_str()],
                None,
            )
            .unwrap();
    }

    fn workdir(tree: &SourceTree) -> PathBuf {
        tree.repo.workdir().unwrap().to_path_buf()
    }

    #[test]
    fn sync_discards_local_drift() {
        let (tree, _dir) = setup();
        let work = workdir(&tree);
        fs::write(work.join("index.html"), "tampered").unwrap();
        fs::write(work.join("stray.txt"), "untracked").unwrap();

        tree.sync_to_integrated().unwrap();

        assert!(tree.is_clean().unwrap());
        assert_eq!(tree.current_branch().unwrap(), "main");
        let content = fs::read_to_string(work.join("index.html")).unwrap();
        assert_eq!(content, "<h1>home</h1>\n");
        assert!(!work.join("stray.txt").exists());
    }

    #[test]
    fn diff_since_reports_added_modified_deleted() {
        let (tree, _dir) = setup();
        let work = workdir(&tree);
        fs::write(work.join("about.html"), "<h1>about</h1>").unwrap();
        fs::write(work.join("extra.html"), "x").unwrap();
        commit_all_raw(&tree.repo, "existing files");
        let base = tree.head_sha().unwrap();

        fs::write(work.join("new.html"), "new").unwrap();
        fs::write(work.join("about.html"), "<h1>about us</h1>").unwrap();
        fs::remove_file(work.join("extra.html")).unwrap();

        let diff = tree.diff_since(&base).unwrap();
        assert_eq!(diff.paths_of(ChangeKind::Added), vec![Path::new("new.html")]);
        assert_eq!(
            diff.paths_of(ChangeKind::Modified),
            vec![Path::new("about.html")]
        );
        assert_eq!(
            diff.paths_of(ChangeKind::Deleted),
            vec![Path::new("extra.html")]
        );
    }

    #[test]
    fn diff_since_empty_on_untouched_tree() {
        let (tree, _dir) = setup();
        let base = tree.head_sha().unwrap();
        let diff = tree.diff_since(&base).unwrap();
        assert!(diff.is_empty());
    }

    #[test]
    fn diff_recurses_into_new_directories() {
        let (tree, _dir) = setup();
        let work = workdir(&tree);
        let base = tree.head_sha().unwrap();
        fs::create_dir_all(work.join("pages")).unwrap();
        fs::write(work.join("pages/status.html"), "ok").unwrap();

        let diff = tree.diff_since(&base).unwrap();
        assert_eq!(
            diff.paths_of(ChangeKind::Added),
            vec![Path::new("pages/status.html")]
        );
    }

    #[test]
    fn branch_commit_push_merge_fast_forward() {
        let (tree, _dir) = setup();
        let work = workdir(&tree);

        tree.create_branch("ship/test-branch").unwrap();
        fs::write(work.join("status.html"), "up").unwrap();
        let commit_sha = tree.commit_all("[ship] add status page").unwrap();
        tree.push("ship/test-branch").unwrap();

        let merged = tree.merge_into_integrated("ship/test-branch").unwrap();
        assert_eq!(merged, commit_sha);
        assert_eq!(tree.current_branch().unwrap(), "main");
        assert!(work.join("status.html").exists());
        assert!(tree.is_clean().unwrap());
    }

    #[test]
    fn merge_creates_merge_commit_when_diverged() {
        let (tree, _dir) = setup();
        let work = workdir(&tree);

        tree.create_branch("ship/feature").unwrap();
        fs::write(work.join("feature.html"), "f").unwrap();
        tree.commit_all("feature work").unwrap();

        // Diverge the integrated line with an unrelated file.
        tree.restore_clean().unwrap();
        fs::write(work.join("news.html"), "n").unwrap();
        commit_all_raw(&tree.repo, "news on main");

        let merged = tree.merge_into_integrated("ship/feature").unwrap();
        let merge_commit = tree
            .repo
            .find_commit(Oid::from_str(&merged).unwrap())
            .unwrap();
        assert_eq!(merge_commit.parent_count(), 2);
        assert!(work.join("feature.html").exists());
        assert!(work.join("news.html").exists());
        assert!(tree.is_clean().unwrap());
    }

    #[test]
    fn merge_conflict_fails_and_leaves_tree_clean() {
        let (tree, _dir) = setup();
        let work = workdir(&tree);

        tree.create_branch("ship/conflict").unwrap();
        fs::write(work.join("index.html"), "<h1>branch version</h1>\n").unwrap();
        tree.commit_all("branch edit").unwrap();

        tree.restore_clean().unwrap();
        fs::write(work.join("index.html"), "<h1>main version</h1>\n").unwrap();
        commit_all_raw(&tree.repo, "main edit");

        let err = tree.merge_into_integrated("ship/conflict").unwrap_err();
        match err {
            PipelineError::MergeFailed { branch, message } => {
                assert_eq!(branch, "ship/conflict");
                assert!(message.contains("index.html"));
            }
            other => panic!("expected MergeFailed, got {:?}", other),
        }
        assert!(tree.is_clean().unwrap());
        assert_eq!(tree.current_branch().unwrap(), "main");
        // The branch survives for retry.
        assert!(
            tree.repo
                .find_branch("ship/conflict", BranchType::Local)
                .is_ok()
        );
    }

    #[test]
    fn delete_branch_removes_local_and_remote() {
        let (tree, dir) = setup();
        tree.create_branch("ship/done").unwrap();
        tree.push("ship/done").unwrap();
        tree.restore_clean().unwrap();

        tree.delete_branch("ship/done").unwrap();
        assert!(
            tree.repo
                .find_branch("ship/done", BranchType::Local)
                .is_err()
        );
        let origin = Repository::open_bare(dir.path().join("origin.git")).unwrap();
        assert!(origin.find_reference("refs/heads/ship/done").is_err());
    }

    #[test]
    fn restore_clean_returns_to_integrated_from_branch() {
        let (tree, _dir) = setup();
        let work = workdir(&tree);
        tree.create_branch("ship/wip").unwrap();
        fs::write(work.join("half-done.html"), "wip").unwrap();

        tree.restore_clean().unwrap();

        assert_eq!(tree.current_branch().unwrap(), "main");
        assert!(tree.is_clean().unwrap());
        assert!(!work.join("half-done.html").exists());
    }

    #[test]
    fn push_publishes_integrated_line() {
        let (tree, dir) = setup();
        let work = workdir(&tree);
        fs::write(work.join("more.html"), "m").unwrap();
        let sha = tree.commit_all("more content").unwrap();
        tree.push("main").unwrap();

        let origin = Repository::open_bare(dir.path().join("origin.git")).unwrap();
        let tip = origin
            .find_reference("refs/heads/main")
            .unwrap()
            .peel_to_commit()
            .unwrap();
        assert_eq!(tip.id().to_string(), sha);
    }
}
