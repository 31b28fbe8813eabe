use super::*;
use crate::error::ErrorKind;
use crate::subprocess::SubprocessManager;
use std::path::Path;
use tempfile::TempDir;

struct Fixture {
    _temp: TempDir,
    repo: std::path::PathBuf,
    base: std::path::PathBuf,
    prd: std::path::PathBuf,
}

fn fixture() -> Fixture {
    let temp = TempDir::new().unwrap();
    let repo = temp.path().join("repo");
    let base = temp.path().join("worktrees");
    std::fs::create_dir_all(&repo).unwrap();
    let prd = temp.path().join("prd.json");
    std::fs::write(&prd, r#"{"project":"p","branch_name":"auth","tasks":[]}"#).unwrap();
    Fixture {
        _temp: temp,
        repo,
        base,
        prd,
    }
}

fn request(prd: &Path, reserved: &[&str]) -> WorktreeRequest {
    WorktreeRequest {
        desired_branch: "auth".to_string(),
        base_branch: "main".to_string(),
        prd_source: prd.to_path_buf(),
        reserved_branches: reserved.iter().map(|s| s.to_string()).collect(),
    }
}

fn listing(main_repo: &Path, extra: &[(&str, &str)]) -> String {
    let mut out = format!(
        "worktree {}\nHEAD 1111111111111111111111111111111111111111\nbranch refs/heads/main\n\n",
        main_repo.display()
    );
    for (path, branch) in extra {
        out.push_str(&format!(
            "worktree {path}\nHEAD 2222222222222222222222222222222222222222\nbranch refs/heads/{branch}\n\n"
        ));
    }
    out
}

#[tokio::test]
async fn test_create_resolves_branch_and_copies_prd() {
    let fx = fixture();
    let (subprocess, mut mock) = SubprocessManager::mock();

    mock.expect_command("git")
        .with_git_subcommand("list")
        .returns_stdout(&listing(&fx.repo, &[("/elsewhere/auth", "auth")]))
        .finish();
    mock.expect_command("git")
        .with_git_subcommand("rev-parse")
        .returns_exit_code(1)
        .finish();

    let manager = WorktreeManager::new(&fx.repo, &fx.base, subprocess).unwrap();
    let expected_path = manager.worktree_path("unit-a");
    let expected_arg = expected_path.to_string_lossy().to_string();

    // Simulate git creating the directory
    let dir = expected_path.clone();
    mock.expect_command("git")
        .with_args(move |args| {
            let matches = args.first().map(String::as_str) == Some("worktree")
                && args.get(1).map(String::as_str) == Some("add");
            if matches {
                std::fs::create_dir_all(&dir).unwrap();
            }
            matches
        })
        .finish();

    let worktree = manager
        .create("unit-a", &request(&fx.prd, &[]))
        .await
        .unwrap();

    assert_eq!(worktree.branch, "auth-1");
    assert_eq!(worktree.path, expected_path);
    assert!(manager.prd_path(&worktree.path).exists());

    let add = mock
        .calls()
        .into_iter()
        .find(|cmd| cmd.args.get(1).map(String::as_str) == Some("add"))
        .unwrap();
    assert_eq!(
        add.args,
        vec!["worktree", "add", "-b", "auth-1", expected_arg.as_str(), "main"]
    );
}

#[tokio::test]
async fn test_create_honors_reserved_branches() {
    let fx = fixture();
    let (subprocess, mut mock) = SubprocessManager::mock();
    let manager = WorktreeManager::new(&fx.repo, &fx.base, subprocess).unwrap();
    let dir = manager.worktree_path("unit-b");

    mock.expect_command("git")
        .with_git_subcommand("list")
        .returns_stdout(&listing(&fx.repo, &[]))
        .finish();
    mock.expect_command("git")
        .with_git_subcommand("rev-parse")
        .returns_exit_code(1)
        .finish();
    mock.expect_command("git")
        .with_args(move |args| {
            let matches = args.get(1).map(String::as_str) == Some("add");
            if matches {
                std::fs::create_dir_all(&dir).unwrap();
            }
            matches
        })
        .finish();

    let worktree = manager
        .create("unit-b", &request(&fx.prd, &["auth", "auth-1"]))
        .await
        .unwrap();
    assert_eq!(worktree.branch, "auth-2");
}

#[tokio::test]
async fn test_create_reuses_existing_branch() {
    let fx = fixture();
    let (subprocess, mut mock) = SubprocessManager::mock();
    let manager = WorktreeManager::new(&fx.repo, &fx.base, subprocess).unwrap();
    let dir = manager.worktree_path("unit-c");

    mock.expect_command("git")
        .with_git_subcommand("list")
        .returns_stdout(&listing(&fx.repo, &[]))
        .finish();
    mock.expect_command("git")
        .with_git_subcommand("rev-parse")
        .returns_success()
        .finish();
    mock.expect_command("git")
        .with_args(move |args| {
            let matches = args.get(1).map(String::as_str) == Some("add");
            if matches {
                std::fs::create_dir_all(&dir).unwrap();
            }
            matches
        })
        .finish();

    manager
        .create("unit-c", &request(&fx.prd, &[]))
        .await
        .unwrap();

    let add = mock
        .calls()
        .into_iter()
        .find(|cmd| cmd.args.get(1).map(String::as_str) == Some("add"))
        .unwrap();
    assert!(!add.args.contains(&"-b".to_string()));
    assert_eq!(add.args.last().map(String::as_str), Some("auth"));
}

#[tokio::test]
async fn test_git_failure_surfaces_diagnostics() {
    let fx = fixture();
    let (subprocess, mut mock) = SubprocessManager::mock();

    mock.expect_command("git")
        .with_git_subcommand("list")
        .returns_stdout(&listing(&fx.repo, &[]))
        .finish();
    mock.expect_command("git")
        .with_git_subcommand("rev-parse")
        .returns_exit_code(1)
        .finish();
    mock.expect_command("git")
        .with_git_subcommand("add")
        .returns_exit_code(128)
        .returns_stderr("fatal: invalid reference: main")
        .finish();

    let manager = WorktreeManager::new(&fx.repo, &fx.base, subprocess).unwrap();
    let err = manager
        .create("unit-d", &request(&fx.prd, &[]))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::WorktreeError);
    assert!(err.to_string().contains("fatal: invalid reference: main"));
}

#[tokio::test]
async fn test_create_rejects_existing_directory() {
    let fx = fixture();
    let (subprocess, _mock) = SubprocessManager::mock();
    let manager = WorktreeManager::new(&fx.repo, &fx.base, subprocess).unwrap();
    std::fs::create_dir_all(manager.worktree_path("unit-e")).unwrap();

    let err = manager
        .create("unit-e", &request(&fx.prd, &[]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already exists"));
}

#[tokio::test]
async fn test_remove_absent_worktree_is_noop() {
    let fx = fixture();
    let (subprocess, mut mock) = SubprocessManager::mock();
    mock.expect_command("git")
        .with_git_subcommand("list")
        .returns_stdout(&listing(&fx.repo, &[]))
        .finish();

    let manager = WorktreeManager::new(&fx.repo, &fx.base, subprocess).unwrap();
    manager.remove("ghost").await.unwrap();
    assert!(mock.call_count("git") == 1);
}

#[tokio::test]
async fn test_remove_deletes_branch_when_configured() {
    let fx = fixture();
    let (subprocess, mut mock) = SubprocessManager::mock();
    let manager = WorktreeManager::new(&fx.repo, &fx.base, subprocess)
        .unwrap()
        .with_branch_cleanup(true);
    let path = manager.worktree_path("unit-f");
    std::fs::create_dir_all(&path).unwrap();
    let path_str = path.to_string_lossy().to_string();

    mock.expect_command("git")
        .with_git_subcommand("list")
        .returns_stdout(&listing(&fx.repo, &[(&path_str, "auth-1")]))
        .finish();
    mock.expect_command("git")
        .with_git_subcommand("remove")
        .finish();
    mock.expect_command("git")
        .with_git_subcommand("branch")
        .finish();

    manager.remove("unit-f").await.unwrap();

    let history = mock.calls();
    let branch_delete = history.last().unwrap();
    assert_eq!(branch_delete.args, vec!["branch", "-D", "auth-1"]);
}
