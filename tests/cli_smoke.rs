//! Exit-code contract for the `browserstep` binary (spec §6): 0 ok, 1 step
//! error, 2 validation error, 3 connection/discovery failure. These spawn the
//! compiled binary directly rather than driving it through the library API.

use assert_cmd::Command;

#[test]
fn malformed_step_list_exits_with_validation_error() {
    let mut cmd = Command::cargo_bin("browserstep").unwrap();
    cmd.arg("run")
        .write_stdin("not a json array")
        .assert()
        .code(2);
}

#[test]
fn unreachable_discovery_endpoint_exits_with_connection_error() {
    let mut cmd = Command::cargo_bin("browserstep").unwrap();
    cmd.args(["--host", "127.0.0.1", "--port", "1", "list-targets"])
        .assert()
        .code(3);
}
