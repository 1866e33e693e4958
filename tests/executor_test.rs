use pgprovision::ProvisionError;
use pgprovision::executor::{CommandExecutor, CommandSpec, RealCommandExecutor};

#[test]
fn nonexistent_command_is_reported() {
    let executor = RealCommandExecutor;
    let spec = CommandSpec::new("this-command-should-not-exist", Vec::new());

    let result = executor.execute(&spec);

    assert!(result.is_err());
    if let Err(e) = result {
        let msg = e.to_string();
        assert!(
            msg.contains("command not found: this-command-should-not-exist"),
            "Expected 'command not found' in error, got: {}",
            msg
        );
    }
}

#[cfg(unix)]
#[test]
fn successful_command_has_zero_status() {
    let executor = RealCommandExecutor;
    let spec = CommandSpec::new("true", Vec::new());

    let result = executor.execute(&spec).expect("`true` should run");

    assert!(result.success());
    assert_eq!(result.code(), Some(0));
}

#[cfg(unix)]
#[test]
fn failing_command_keeps_its_exit_code() {
    let executor = RealCommandExecutor;
    let spec = CommandSpec::new("sh", vec!["-c".to_string(), "echo oops >&2; exit 3".to_string()]);

    let result = executor.execute(&spec).expect("sh should run");

    assert!(!result.success());
    assert_eq!(result.code(), Some(3));
}

#[cfg(unix)]
#[test]
fn environment_is_passed_to_the_child() {
    let executor = RealCommandExecutor;
    let spec = CommandSpec::new(
        "sh",
        vec!["-c".to_string(), "test \"$PGPROVISION_TEST\" = yes".to_string()],
    )
    .with_env("PGPROVISION_TEST", "yes");

    let result = executor.execute(&spec).expect("sh should run");

    assert!(result.success());
}

#[test]
fn execution_error_names_the_command() {
    let err = ProvisionError::Execution {
        command: "usermod \"-u\" \"153\" \"postgres\"".to_string(),
        status: "exit status: 4".to_string(),
    };
    assert_eq!(
        err.to_string(),
        "command execution failed: usermod \"-u\" \"153\" \"postgres\": exit status: 4"
    );
}
