//! Per-task workspace materialization.
//!
//! A run directory looks like this:
//!
//! ```text
//! runs/<task-id>/
//!   repo/          agent-visible copy of the base repository (rw)
//!   input/         problem statement, harness and agent sources (ro)
//!   output/        agent's output.json (rw)
//!   baseline.git/  object store holding the initial tree (never mounted)
//!   result.json    written after collection
//! ```
//!
//! The baseline is a bare git directory whose worktree is pointed at `repo/`
//! on demand, so nothing inside `repo/` refers back to it.

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use git2::{Index, IndexEntry, IndexTime, Oid, Repository, Signature};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::harness::{AGENT_DIR, HARNESS_FILE, HARNESS_PY, PROBLEM_FILE};
use super::task::AgentEntry;
use crate::error::WorkspaceError;

/// Name of the persisted result inside a run directory.
pub const RESULT_FILE: &str = "result.json";

const REPO_DIR: &str = "repo";
const INPUT_DIR: &str = "input";
const OUTPUT_DIR: &str = "output";
const BASELINE_DIR: &str = "baseline.git";

/// Paths of one materialized run directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Describes the layout rooted at `root` without touching the filesystem.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The run directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Agent-visible repository copy.
    pub fn repo_dir(&self) -> PathBuf {
        self.root.join(REPO_DIR)
    }

    /// Read-only inputs for the agent.
    pub fn input_dir(&self) -> PathBuf {
        self.root.join(INPUT_DIR)
    }

    /// Writable output directory for the agent.
    pub fn output_dir(&self) -> PathBuf {
        self.root.join(OUTPUT_DIR)
    }

    /// Baseline object store.
    pub fn baseline_dir(&self) -> PathBuf {
        self.root.join(BASELINE_DIR)
    }

    /// Where `result.json` is persisted.
    pub fn result_path(&self) -> PathBuf {
        self.root.join(RESULT_FILE)
    }

    /// Writes the problem statement and, for `agent_main` agents, the harness
    /// and agent sources into `input/`.
    pub fn stage_input(
        &self,
        problem_statement: &str,
        agent: &AgentEntry,
    ) -> Result<(), WorkspaceError> {
        let input = self.input_dir();
        fs::write(input.join(PROBLEM_FILE), problem_statement)?;

        if let AgentEntry::AgentMain { file } = agent {
            let agent_dir = input.join(AGENT_DIR);
            fs::create_dir_all(&agent_dir)?;

            if file.is_dir() {
                copy_tree(file, &agent_dir)?;
            } else {
                fs::copy(file, agent_dir.join("agent.py")).map_err(|e| {
                    WorkspaceError::CopyFailed {
                        path: file.clone(),
                        reason: e.to_string(),
                    }
                })?;
            }

            fs::write(input.join(HARNESS_FILE), HARNESS_PY)?;
        }

        Ok(())
    }

    /// Deletes the whole run directory.
    pub fn remove(&self) -> Result<(), WorkspaceError> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes everything in the run directory except `result.json`.
    pub fn discard_sandbox_dirs(&self) -> Result<(), WorkspaceError> {
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_name() == RESULT_FILE {
                continue;
            }
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

/// Materializes isolated copies of a base repository.
#[derive(Debug, Clone, Default)]
pub struct WorkspacePreparer;

impl WorkspacePreparer {
    /// Creates a new preparer.
    pub fn new() -> Self {
        Self
    }

    /// Copies (or unpacks) `source` into `destination/repo` and records the
    /// baseline snapshot.
    ///
    /// Only `destination` is written. On failure after the destination was
    /// claimed, it is removed again.
    pub fn prepare(
        &self,
        source: &Path,
        destination: &Path,
    ) -> Result<Workspace, WorkspaceError> {
        if !source.exists() {
            return Err(WorkspaceError::SourceMissing(source.to_path_buf()));
        }
        claim_destination(destination)?;

        let workspace = Workspace::at(destination);
        match self.populate(source, &workspace) {
            Ok(()) => {
                info!(
                    source = %source.display(),
                    workspace = %destination.display(),
                    "Workspace prepared"
                );
                Ok(workspace)
            }
            Err(e) => {
                if let Err(cleanup) = workspace.remove() {
                    warn!(
                        workspace = %destination.display(),
                        error = %cleanup,
                        "Failed to remove partially prepared workspace"
                    );
                }
                Err(e)
            }
        }
    }

    fn populate(&self, source: &Path, workspace: &Workspace) -> Result<(), WorkspaceError> {
        let repo = workspace.repo_dir();
        fs::create_dir_all(&repo)?;
        fs::create_dir_all(workspace.input_dir())?;
        fs::create_dir_all(workspace.output_dir())?;

        if source.is_dir() {
            copy_tree(source, &repo)?;
        } else if is_tar_gz(source) {
            unpack_archive(source, &repo)?;
        } else {
            return Err(WorkspaceError::CopyFailed {
                path: source.to_path_buf(),
                reason: "expected a directory or a .tar.gz archive".to_string(),
            });
        }

        snapshot_baseline(&workspace.baseline_dir(), &repo)?;
        Ok(())
    }
}

/// Creates `destination`, or accepts it if it already exists and is empty.
fn claim_destination(destination: &Path) -> Result<(), WorkspaceError> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::create_dir(destination) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            if fs::read_dir(destination)?.next().is_some() {
                Err(WorkspaceError::DestinationNotEmpty(destination.to_path_buf()))
            } else {
                Ok(())
            }
        }
        Err(e) => Err(e.into()),
    }
}

fn is_tar_gz(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    name.ends_with(".tar.gz") || name.ends_with(".tgz")
}

/// Recursively copies `src` into `dst`, preserving symlinks and permissions.
fn copy_tree(src: &Path, dst: &Path) -> Result<(), WorkspaceError> {
    for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| WorkspaceError::CopyFailed {
                path: entry.path().to_path_buf(),
                reason: e.to_string(),
            })?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        let copied = if file_type.is_dir() {
            fs::create_dir_all(&target)
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)
        } else {
            fs::copy(entry.path(), &target).map(|_| ())
        };

        copied.map_err(|e| WorkspaceError::CopyFailed {
            path: entry.path().to_path_buf(),
            reason: e.to_string(),
        })?;
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    let target = fs::read_link(src)?;
    std::os::unix::fs::symlink(target, dst)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    fs::copy(src, dst).map(|_| ())
}

/// Unpacks a gzip-compressed tarball, rejecting entries that would land
/// outside `dst`.
fn unpack_archive(archive: &Path, dst: &Path) -> Result<(), WorkspaceError> {
    let file = File::open(archive)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if !is_contained(&path) {
            return Err(WorkspaceError::UnsafeArchiveEntry(path.display().to_string()));
        }
        if let Some(link) = entry.link_name()? {
            let escapes = link.is_absolute()
                || !is_contained(&path.parent().unwrap_or(Path::new("")).join(&link));
            if escapes {
                return Err(WorkspaceError::UnsafeArchiveEntry(format!(
                    "{} -> {}",
                    path.display(),
                    link.display()
                )));
            }
        }
        entry.unpack_in(dst)?;
    }
    Ok(())
}

/// True if a relative path never climbs above its starting point.
fn is_contained(path: &Path) -> bool {
    let mut depth: usize = 0;
    for component in path.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return false;
                }
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}

/// Records the current contents of `worktree` as the single commit of a bare
/// repository at `git_dir`.
fn snapshot_baseline(git_dir: &Path, worktree: &Path) -> Result<(), WorkspaceError> {
    let repo = Repository::init_bare(git_dir)?;
    repo.set_workdir(worktree, false)?;

    let (tree_id, files) = snapshot_tree(&repo, worktree)?;
    let tree = repo.find_tree(tree_id)?;

    let signature = Signature::now("agent-runner", "agent-runner@localhost")?;
    let commit = repo.commit(
        Some("HEAD"),
        &signature,
        &signature,
        "baseline",
        &tree,
        &[],
    )?;

    debug!(commit = %commit, files, "Baseline snapshot recorded");
    Ok(())
}

/// Writes the files under `worktree` into `repo` as a tree and returns its id
/// with the number of entries.
///
/// Nested repositories and gitlinks are recorded as ordinary files: every
/// `.git` entry is skipped and the walk descends into the checkout around
/// it. Paths matched by the worktree's ignore rules are left out.
pub(crate) fn snapshot_tree(
    repo: &Repository,
    worktree: &Path,
) -> Result<(Oid, usize), WorkspaceError> {
    let mut index = Index::new()?;
    let walker = WalkDir::new(worktree)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.file_name() != ".git" && !is_ignored(repo, worktree, entry)
        });

    for entry in walker {
        let entry = entry?;
        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }
        let (id, mode) = if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            (repo.blob(target.to_string_lossy().as_bytes())?, 0o120000)
        } else if file_type.is_file() {
            let mode = if is_executable(&entry.metadata()?) {
                0o100755
            } else {
                0o100644
            };
            (repo.blob(&fs::read(entry.path())?)?, mode)
        } else {
            continue;
        };

        let relative = entry
            .path()
            .strip_prefix(worktree)
            .map_err(|e| WorkspaceError::CopyFailed {
                path: entry.path().to_path_buf(),
                reason: e.to_string(),
            })?;
        index.add(&IndexEntry {
            ctime: IndexTime::new(0, 0),
            mtime: IndexTime::new(0, 0),
            dev: 0,
            ino: 0,
            mode,
            uid: 0,
            gid: 0,
            file_size: 0,
            id,
            flags: 0,
            flags_extended: 0,
            path: index_path(relative),
        })?;
    }

    let tree = index.write_tree_to(repo)?;
    Ok((tree, index.len()))
}

fn is_ignored(repo: &Repository, worktree: &Path, entry: &walkdir::DirEntry) -> bool {
    let Ok(relative) = entry.path().strip_prefix(worktree) else {
        return false;
    };
    let mut path = relative.to_string_lossy().into_owned();
    if entry.file_type().is_dir() {
        path.push('/');
    }
    repo.is_path_ignored(&path).unwrap_or(false)
}

/// Slash-separated form of a relative path, as git stores it.
fn index_path(relative: &Path) -> Vec<u8> {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
        .into_bytes()
}

#[cfg(unix)]
fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &fs::Metadata) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn sample_repo(dir: &Path) {
        fs::create_dir_all(dir.join("pkg")).unwrap();
        fs::write(dir.join("calculator.py"), "def add(a, b):\n    return a - b\n").unwrap();
        fs::write(dir.join("pkg/util.py"), "X = 1\n").unwrap();
    }

    fn tree_listing(dir: &Path) -> Vec<(PathBuf, Vec<u8>)> {
        let mut out: Vec<_> = WalkDir::new(dir)
            .min_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                (
                    e.path().strip_prefix(dir).unwrap().to_path_buf(),
                    fs::read(e.path()).unwrap(),
                )
            })
            .collect();
        out.sort();
        out
    }

    #[test]
    fn test_prepare_copies_repo_and_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("base");
        sample_repo(&source);

        let ws = WorkspacePreparer::new()
            .prepare(&source, &tmp.path().join("runs/t1"))
            .unwrap();

        assert!(ws.repo_dir().join("calculator.py").is_file());
        assert!(ws.repo_dir().join("pkg/util.py").is_file());
        assert!(ws.input_dir().is_dir());
        assert!(ws.output_dir().is_dir());
        assert!(ws.baseline_dir().join("HEAD").is_file());
        // Nothing inside the agent-visible tree points at the baseline.
        assert!(!ws.repo_dir().join(".git").exists());
        assert_eq!(tree_listing(&source), tree_listing(&ws.repo_dir()));
    }

    fn baseline_paths(ws: &Workspace) -> Vec<String> {
        let repo = Repository::open_bare(ws.baseline_dir()).unwrap();
        let tree = repo.head().unwrap().peel_to_tree().unwrap();
        let mut paths = Vec::new();
        tree.walk(git2::TreeWalkMode::PreOrder, |root, entry| {
            if entry.kind() == Some(git2::ObjectType::Blob) {
                paths.push(format!("{root}{}", entry.name().unwrap()));
            }
            git2::TreeWalkResult::Ok
        })
        .unwrap();
        paths
    }

    #[test]
    fn test_prepare_snapshots_nested_repository_as_files() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("base");
        sample_repo(&source);
        Repository::init(&source).unwrap();
        let nested = source.join("vendor/lib");
        fs::create_dir_all(&nested).unwrap();
        Repository::init(&nested).unwrap();
        fs::write(nested.join("lib.py"), "VALUE = 1\n").unwrap();

        let ws = WorkspacePreparer::new()
            .prepare(&source, &tmp.path().join("runs/t1"))
            .unwrap();

        assert!(ws.repo_dir().join("vendor/lib/.git").is_dir());
        assert_eq!(
            baseline_paths(&ws),
            vec!["calculator.py", "pkg/util.py", "vendor/lib/lib.py"]
        );
    }

    #[test]
    fn test_prepare_snapshots_gitlink_checkout() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("base");
        sample_repo(&source);
        fs::create_dir_all(source.join("sub")).unwrap();
        fs::write(source.join("sub/.git"), "gitdir: ../.git/modules/sub\n").unwrap();
        fs::write(source.join("sub/mod.py"), "Y = 2\n").unwrap();

        let ws = WorkspacePreparer::new()
            .prepare(&source, &tmp.path().join("runs/t1"))
            .unwrap();

        assert!(ws.repo_dir().join("sub/.git").is_file());
        assert_eq!(
            baseline_paths(&ws),
            vec!["calculator.py", "pkg/util.py", "sub/mod.py"]
        );
    }

    #[test]
    fn test_baseline_honours_gitignore() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("base");
        sample_repo(&source);
        fs::write(source.join(".gitignore"), "*.log\nbuild/\n").unwrap();
        fs::write(source.join("debug.log"), "noise\n").unwrap();
        fs::create_dir_all(source.join("build")).unwrap();
        fs::write(source.join("build/out.o"), "obj").unwrap();

        let ws = WorkspacePreparer::new()
            .prepare(&source, &tmp.path().join("runs/t1"))
            .unwrap();

        assert!(ws.repo_dir().join("debug.log").is_file());
        assert_eq!(
            baseline_paths(&ws),
            vec![".gitignore", "calculator.py", "pkg/util.py"]
        );
    }

    #[test]
    fn test_prepare_is_idempotent_across_destinations() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("base");
        sample_repo(&source);
        let preparer = WorkspacePreparer::new();

        let a = preparer.prepare(&source, &tmp.path().join("a")).unwrap();
        let b = preparer.prepare(&source, &tmp.path().join("b")).unwrap();
        assert_eq!(tree_listing(&a.repo_dir()), tree_listing(&b.repo_dir()));
    }

    #[test]
    fn test_prepare_missing_source() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("run");
        let err = WorkspacePreparer::new()
            .prepare(&tmp.path().join("nope"), &dest)
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::SourceMissing(_)));
        assert!(!dest.exists());
    }

    #[test]
    fn test_prepare_rejects_non_empty_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("base");
        sample_repo(&source);
        let dest = tmp.path().join("run");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("keep.txt"), "mine").unwrap();

        let err = WorkspacePreparer::new().prepare(&source, &dest).unwrap_err();
        assert!(matches!(err, WorkspaceError::DestinationNotEmpty(_)));
        assert_eq!(fs::read_to_string(dest.join("keep.txt")).unwrap(), "mine");
    }

    #[test]
    fn test_prepare_accepts_empty_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("base");
        sample_repo(&source);
        let dest = tmp.path().join("run");
        fs::create_dir_all(&dest).unwrap();

        assert!(WorkspacePreparer::new().prepare(&source, &dest).is_ok());
    }

    #[test]
    fn test_prepare_unpacks_tar_gz() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("base");
        sample_repo(&source);

        let archive_path = tmp.path().join("base.tar.gz");
        let encoder = GzEncoder::new(File::create(&archive_path).unwrap(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.append_dir_all(".", &source).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let ws = WorkspacePreparer::new()
            .prepare(&archive_path, &tmp.path().join("run"))
            .unwrap();
        assert_eq!(tree_listing(&source), tree_listing(&ws.repo_dir()));
    }

    #[test]
    fn test_is_contained() {
        assert!(is_contained(Path::new("a/b/../c")));
        assert!(is_contained(Path::new("./a")));
        assert!(!is_contained(Path::new("../a")));
        assert!(!is_contained(Path::new("a/../../b")));
        assert!(!is_contained(Path::new("/etc/passwd")));
    }

    #[test]
    fn test_stage_input_for_agent_main() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("base");
        sample_repo(&source);
        let agent_file = tmp.path().join("my_agent.py");
        fs::write(&agent_file, "def agent_main(i, repo_dir):\n    return {}\n").unwrap();

        let ws = WorkspacePreparer::new()
            .prepare(&source, &tmp.path().join("run"))
            .unwrap();
        ws.stage_input("Fix add()", &AgentEntry::agent_main(&agent_file))
            .unwrap();

        let input = ws.input_dir();
        assert_eq!(fs::read_to_string(input.join(PROBLEM_FILE)).unwrap(), "Fix add()");
        assert!(input.join(AGENT_DIR).join("agent.py").is_file());
        assert_eq!(fs::read_to_string(input.join(HARNESS_FILE)).unwrap(), HARNESS_PY);
    }

    #[test]
    fn test_discard_keeps_result_only() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("base");
        sample_repo(&source);
        let ws = WorkspacePreparer::new()
            .prepare(&source, &tmp.path().join("run"))
            .unwrap();
        fs::write(ws.result_path(), "{}").unwrap();

        ws.discard_sandbox_dirs().unwrap();
        let left: Vec<_> = fs::read_dir(ws.root())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(left, vec![std::ffi::OsString::from(RESULT_FILE)]);

        ws.remove().unwrap();
        assert!(!ws.root().exists());
        // Removing twice is fine.
        ws.remove().unwrap();
    }
}
