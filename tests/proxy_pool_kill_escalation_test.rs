/*!
 * Integration test for the worker subprocess pool's kill-escalation
 * teardown path.
 *
 * A proxy released while not Idle (mid-evaluation) is handed to the
 * pool's background closer instead of being recycled. The closer
 * escalates from a grace wait to SIGTERM to SIGKILL; this drives that
 * path against a real child that ignores SIGTERM and checks the pid is
 * gone once SIGKILL lands.
 */

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use tempfile::TempDir;

use servcore::config::ProxyPoolConfig;
use servcore::core::proxy_pool::ProxyPool;

fn write_stubborn_child(dir: &TempDir, pidfile: &std::path::Path) -> std::path::PathBuf {
    let script = dir.path().join("stubborn.sh");
    fs::write(
        &script,
        format!(
            "#!/bin/sh\ntrap '' TERM\necho $$ > {}\nexec sleep 30\n",
            pidfile.display()
        ),
    )
    .unwrap();
    let mut perms = fs::metadata(&script).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&script, perms).unwrap();
    script
}

fn pid_alive(pid: libc::pid_t) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

#[test]
fn releasing_a_busy_proxy_escalates_to_sigkill() {
    let dir = TempDir::new().unwrap();
    let pidfile = dir.path().join("child.pid");
    let script = write_stubborn_child(&dir, &pidfile);

    let pool = ProxyPool::new(
        "stubborn",
        ProxyPoolConfig {
            exec: script,
            init: None,
            reinit: None,
            min: 0,
            max: 1,
            get_timeout_ms: 2000,
            eval_timeout_ms: 500,
            send_timeout_ms: 500,
            recv_timeout_ms: 500,
            wait_timeout_ms: 300,
        },
    );

    let mut proxies = pool.get(1, Some(Duration::from_secs(2))).unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while !pidfile.exists() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    let pid: libc::pid_t = fs::read_to_string(&pidfile)
        .expect("child should have written its pid")
        .trim()
        .parse()
        .unwrap();
    assert!(pid_alive(pid), "child should be running before release");

    // Leave the proxy Busy (sent but never waited/received) so release
    // hands it to the closer instead of recycling it.
    pool.send(&mut proxies[0], b"never answered", Duration::from_millis(200))
        .unwrap();
    pool.release(proxies);

    // Three escalation windows (grace, SIGTERM, SIGKILL) at 300ms each,
    // plus margin for the child to actually exit after SIGKILL.
    std::thread::sleep(Duration::from_millis(1200));

    assert!(
        !pid_alive(pid),
        "child ignoring SIGTERM should have been killed with SIGKILL"
    );
}
