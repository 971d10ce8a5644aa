//! Sandbox tests that touch the real host: filesystem confinement and
//! process-group execution with timeouts.

mod common;

use std::path::Path;
use std::time::Duration;

use axum::http::StatusCode;
use serde_json::json;

use common::harness_real;
use hostgate::errors::AppError;
use hostgate::models::operation::WriteMode;
use hostgate::sandbox::confine::Confinement;
use hostgate::sandbox::fs::{EntryKind, FsGateway};

fn gateway(base: &Path) -> FsGateway {
    FsGateway::new(Confinement::new(base, false).unwrap())
}

mod fs_tests {
    use super::*;

    #[tokio::test]
    async fn test_write_append_read_list() {
        let dir = tempfile::tempdir().unwrap();
        let fs = gateway(dir.path());

        fs.write(Path::new("logs/app.log"), "one\n", WriteMode::Write)
            .await
            .unwrap();
        fs.write(Path::new("logs/app.log"), "two\n", WriteMode::Append)
            .await
            .unwrap();

        let content = fs.read(Path::new("logs/app.log")).await.unwrap();
        assert_eq!(content.content.as_deref(), Some("one\ntwo\n"));
        assert!(!content.binary);

        let listing = fs.ls(Path::new("logs")).await.unwrap();
        let entries = listing.entries.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "app.log");
        assert_eq!(entries[0].kind, EntryKind::File);
        assert_eq!(entries[0].size, 8);
    }

    #[tokio::test]
    async fn test_binary_read_omits_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("blob"), [0xff, 0xfe, 0x00]).unwrap();
        let fs = gateway(dir.path());
        let content = fs.read(Path::new("blob")).await.unwrap();
        assert!(content.binary);
        assert!(content.content.is_none());
        assert_eq!(content.size, 3);
    }

    #[tokio::test]
    async fn test_escapes_rejected_before_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base");
        std::fs::create_dir(&base).unwrap();
        let fs = gateway(&base);

        let err = fs
            .write(Path::new("../escaped.txt"), "x", WriteMode::Write)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::PathOutsideBase(_)));
        assert!(!dir.path().join("escaped.txt").exists());

        let err = fs.mkdir(Path::new("/tmp/hostgate-nope"), true, true).await.unwrap_err();
        assert!(matches!(err, AppError::PathOutsideBase(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_escape_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base");
        std::fs::create_dir(&base).unwrap();
        std::fs::write(dir.path().join("secret"), "s").unwrap();
        std::os::unix::fs::symlink(dir.path(), base.join("up")).unwrap();
        let fs = gateway(&base);

        let err = fs.read(Path::new("up/secret")).await.unwrap_err();
        assert!(matches!(err, AppError::PathOutsideBase(_)));
    }

    #[tokio::test]
    async fn test_mkdir_and_rm_rules() {
        let dir = tempfile::tempdir().unwrap();
        let fs = gateway(dir.path());

        assert!(matches!(
            fs.mkdir(Path::new("a/b"), false, false).await,
            Err(AppError::NotFound(_))
        ));
        assert!(fs.mkdir(Path::new("a/b"), true, false).await.unwrap().created);
        assert!(!fs.mkdir(Path::new("a/b"), true, true).await.unwrap().created);
        assert!(matches!(
            fs.mkdir(Path::new("a/b"), true, false).await,
            Err(AppError::Conflict(_))
        ));

        assert!(matches!(
            fs.rm(Path::new("a"), false).await,
            Err(AppError::Conflict(_))
        ));
        fs.rm(Path::new("a"), true).await.unwrap();
        assert!(!dir.path().join("a").exists());

        assert!(fs.rm(dir.path(), true).await.is_err());
        assert!(dir.path().exists());
    }
}

#[cfg(unix)]
mod exec_tests {
    use super::*;
    use axum::http::Method;
    use crate::common::send;

    #[tokio::test]
    async fn test_exec_over_http() {
        let h = harness_real(|_| {});
        let token = h.token("runner", &["exec"]);
        let reply = h
            .post(
                "/exec",
                Some(&token),
                json!({"cmd": ["sh", "-c", "pwd; exit 7"]}),
            )
            .await;
        assert_eq!(reply.status, StatusCode::OK, "{}", reply.body);
        assert_eq!(reply.body["rc"], 7);
        assert_eq!(reply.body["timed_out"], false);
        let cwd = reply.body["stdout"].as_str().unwrap().trim().to_string();
        assert_eq!(Path::new(&cwd), h.base());
    }

    #[tokio::test]
    async fn test_missing_binary_is_400() {
        let h = harness_real(|_| {});
        let token = h.token("runner", &["exec"]);
        let reply = h
            .post(
                "/exec",
                Some(&token),
                json!({"cmd": ["definitely-not-a-binary-hostgate"]}),
            )
            .await;
        assert_eq!(reply.status, StatusCode::BAD_REQUEST);
        assert_eq!(reply.code(), "invalid_request");
    }

    /// `/proc/<pid>` is gone or the process is a zombie.
    #[cfg(target_os = "linux")]
    fn is_dead(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Err(_) => true,
            Ok(stat) => stat
                .rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_kills_whole_process_group() {
        let h = harness_real(|_| {});
        let token = h.token("runner", &["exec"]);
        let reply = h
            .post(
                "/exec",
                Some(&token),
                json!({
                    "cmd": ["sh", "-c", "sleep 30 & echo $!; sleep 30"],
                    "timeout": 1
                }),
            )
            .await;
        assert_eq!(reply.status, StatusCode::OK, "{}", reply.body);
        assert_eq!(reply.body["rc"], -1);
        assert_eq!(reply.body["timed_out"], true);

        let pid: u32 = reply.body["stdout"]
            .as_str()
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let mut dead = false;
        for _ in 0..40 {
            if is_dead(pid) {
                dead = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(dead, "background process {} survived the timeout", pid);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_not_held_up_by_detached_pipe_holder() {
        let h = harness_real(|_| {});
        let token = h.token("runner", &["exec"]);
        let started = std::time::Instant::now();
        let reply = h
            .post(
                "/exec",
                Some(&token),
                json!({
                    "cmd": ["sh", "-c", "setsid sleep 6 & sleep 30"],
                    "timeout": 1
                }),
            )
            .await;
        assert_eq!(reply.status, StatusCode::OK, "{}", reply.body);
        assert_eq!(reply.body["timed_out"], true);
        assert_eq!(reply.body["truncated"], true);
        assert!(
            started.elapsed() < Duration::from_secs(4),
            "exec returned after {:?}",
            started.elapsed()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_long_exec_does_not_block_other_callers() {
        let h = harness_real(|_| {});
        let runner = h.token("runner", &["exec"]);
        let reader = h.token("reader", &["fs:read"]);

        let long = tokio::spawn(send(
            h.state.clone(),
            Method::POST,
            "/exec".into(),
            Some(runner),
            Some(json!({"cmd": ["sleep", "5"], "timeout": 10})),
        ));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!long.is_finished());

        let started = std::time::Instant::now();
        let reply = h.get("/fs/ls?path=.", Some(&reader)).await;
        assert_eq!(reply.status, StatusCode::OK, "{}", reply.body);
        assert!(started.elapsed() < Duration::from_secs(1));

        let started = std::time::Instant::now();
        let reply = h.get("/approval/pending", Some(&h.admin)).await;
        assert_eq!(reply.status, StatusCode::OK, "{}", reply.body);
        assert!(started.elapsed() < Duration::from_secs(1));

        assert!(!long.is_finished());
        let reply = long.await.unwrap();
        assert_eq!(reply.status, StatusCode::OK, "{}", reply.body);
        assert_eq!(reply.body["rc"], 0);
        assert_eq!(reply.body["timed_out"], false);
    }
}
