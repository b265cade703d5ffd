//! Tests for SSH command wrapping on top of a scripted inner runner

use command_executor::{Command, Output, Runner, ScriptedRunner, SshConfig, SshRunner};
use std::time::Duration;

#[smol_potat::test]
async fn test_ssh_runner_delegates_wrapped_command() {
    let inner = ScriptedRunner::new().on("ssh", Output::ok("Linux\n"));
    let config = SshConfig::new("192.168.1.20")
        .with_user("pi")
        .with_known_hosts("/tmp/known_hosts");
    let runner = SshRunner::new(&inner, config);

    let output = runner
        .run(&Command::builder("uname").arg("-s").build())
        .await
        .unwrap();
    assert_eq!(output.stdout_trimmed(), "Linux");

    let calls = inner.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].contains("UserKnownHostsFile=/tmp/known_hosts"));
    assert!(calls[0].ends_with("pi@192.168.1.20 'uname -s'"));
}

#[smol_potat::test]
async fn test_ssh_runner_keeps_command_timeout() {
    let config = SshConfig::new("host-a");
    let remote = Command::builder("sleep")
        .arg("1")
        .timeout(Duration::from_secs(7))
        .build();

    let wrapped = config.wrap(&remote);
    assert_eq!(wrapped.get_timeout(), Some(Duration::from_secs(7)));
}

#[smol_potat::test]
async fn test_remote_failure_surfaces_as_output() {
    let inner = ScriptedRunner::new().on(
        "ssh",
        Output::failed(255, "ssh: connect to host host-b port 22: No route to host"),
    );
    let runner = SshRunner::new(&inner, SshConfig::new("host-b"));

    let output = runner.run(&Command::new("true")).await.unwrap();
    assert_eq!(output.code, Some(255));
    assert!(output.diagnostic().contains("No route to host"));
}
