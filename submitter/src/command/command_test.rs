use super::{run, CommandError};
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(10);

#[test]
pub fn captures_stdout() {
    let output = run("sh", ["-c", "echo out; echo err >&2"], TIMEOUT).unwrap();

    assert_eq!(output.stdout, "out\n");
    assert_eq!(output.stderr, "err\n");
}

#[test]
pub fn non_zero_exit_fails() {
    match run("sh", ["-c", "echo broken >&2; exit 3"], TIMEOUT) {
        Err(CommandError::Failed { status, stderr, .. }) => {
            assert_eq!(status, 3);
            assert_eq!(stderr, "broken");
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
pub fn missing_program_fails_to_spawn() {
    assert!(matches!(
        run("gem-submit-no-such-program", ["--help"], TIMEOUT),
        Err(CommandError::Spawn { .. })
    ));
}

#[test]
pub fn slow_command_is_killed() {
    assert!(matches!(
        run("sleep", ["5"], Duration::from_millis(100)),
        Err(CommandError::Timeout { .. })
    ));
}
