//! Process-level supervisor behavior, driving the real binary.

#![cfg(target_os = "linux")]

use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

fn write_config(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let path = dir.path().join("backend.conf");
    std::fs::write(&path, "default 1;\nproxy_for 1 127.0.0.1:18443;\n").expect("write config");
    path
}

fn spawn_supervisor(config: &std::path::Path, workers: u32) -> Child {
    Command::new(env!("CARGO_BIN_EXE_mtproto-proxy"))
        .arg("-M")
        .arg(workers.to_string())
        .arg(config)
        .env_remove("MTPROXY_GO_SUPERVISED_WORKER")
        .env_remove("MTPROXY_GO_WORKER_ID")
        .env_remove("MTPROXY_GO_SUPERVISOR_PID")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn supervisor")
}

/// Pids whose parent is `ppid`, from /proc.
fn children_of(ppid: u32) -> Vec<u32> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return out;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            continue;
        };
        // Fields after the parenthesized comm: state ppid ...
        let Some(rest) = stat.rsplit_once(')').map(|(_, r)| r) else {
            continue;
        };
        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() >= 2 && fields[1].parse::<u32>() == Ok(ppid) {
            out.push(pid);
        }
    }
    out
}

fn wait_for_children(ppid: u32, want: usize, deadline: Duration) -> Vec<u32> {
    let start = Instant::now();
    loop {
        let kids = children_of(ppid);
        if kids.len() >= want {
            return kids;
        }
        if start.elapsed() > deadline {
            panic!("expected {want} children of {ppid}, found {kids:?}");
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn wait_for_exit(child: &mut Child, deadline: Duration) -> std::process::ExitStatus {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait().expect("try_wait") {
            return status;
        }
        if start.elapsed() > deadline {
            let _ = child.kill();
            panic!("supervisor did not exit in time");
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn killed_worker_brings_down_the_supervisor() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = write_config(&dir);

    let mut supervisor = spawn_supervisor(&config, 2);
    let workers = wait_for_children(supervisor.id(), 2, Duration::from_secs(10));

    unsafe {
        libc::kill(workers[0] as i32, libc::SIGKILL);
    }

    let status = wait_for_exit(&mut supervisor, Duration::from_secs(10));
    assert_eq!(status.code(), Some(1), "unexpected worker death must be fatal");

    // The surviving worker must be gone too.
    let start = Instant::now();
    loop {
        let survivor_alive = std::path::Path::new(&format!("/proc/{}", workers[1])).exists();
        if !survivor_alive {
            break;
        }
        if start.elapsed() > Duration::from_secs(5) {
            panic!("worker {} still running after supervisor exit", workers[1]);
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn sigterm_shuts_down_supervisor_cleanly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = write_config(&dir);

    let mut supervisor = spawn_supervisor(&config, 2);
    wait_for_children(supervisor.id(), 2, Duration::from_secs(10));

    unsafe {
        libc::kill(supervisor.id() as i32, libc::SIGTERM);
    }

    let status = wait_for_exit(&mut supervisor, Duration::from_secs(10));
    assert!(status.success(), "graceful shutdown must exit 0, got {status:?}");
}

#[test]
fn single_process_sigterm_exits_cleanly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = write_config(&dir);

    let mut proxy = Command::new(env!("CARGO_BIN_EXE_mtproto-proxy"))
        .arg(&config)
        .env_remove("MTPROXY_GO_SUPERVISED_WORKER")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn proxy");

    // Give it a moment to install the signal loop.
    std::thread::sleep(Duration::from_millis(500));
    unsafe {
        libc::kill(proxy.id() as i32, libc::SIGTERM);
    }

    let status = wait_for_exit(&mut proxy, Duration::from_secs(10));
    assert!(status.success(), "got {status:?}");
}

#[test]
fn invalid_options_exit_2() {
    let status = Command::new(env!("CARGO_BIN_EXE_mtproto-proxy"))
        .arg("--definitely-not-an-option")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .expect("run proxy");
    assert_eq!(status.code(), Some(2));
}

#[test]
fn missing_config_file_exits_nonzero() {
    let status = Command::new(env!("CARGO_BIN_EXE_mtproto-proxy"))
        .arg("/nonexistent/backend.conf")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .expect("run proxy");
    assert_eq!(status.code(), Some(1));
}
