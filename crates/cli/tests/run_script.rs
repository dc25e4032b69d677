//! End-to-end tests that exercise the `ember` binary as a subprocess: a
//! script on disk in, exit code and stdout/stderr out. Complements the
//! colocated unit tests in `ember-compiler`/`ember-vm`, which exercise the
//! same behavior at the library level without a process boundary.

use std::io::Write;
use std::process::Command;

fn ember_cmd() -> Command {
    Command::new(env!("CARGO_BIN_EXE_ember"))
}

fn script(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("create temp script");
    file.write_all(contents.as_bytes()).expect("write temp script");
    file
}

#[test]
fn runs_a_script_and_exits_success() {
    let file = script("print 1 + 2;");
    let output = ember_cmd().arg(file.path()).output().expect("run ember");
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "3\n");
}

#[test]
fn compile_error_exits_65_and_prints_to_stderr() {
    let file = script("var = ;");
    let output = ember_cmd().arg(file.path()).output().expect("run ember");
    assert_eq!(output.status.code(), Some(65));
    assert!(output.stdout.is_empty());
    assert!(!output.stderr.is_empty());
}

#[test]
fn runtime_error_exits_70_and_prints_trace() {
    let file = script("print nonexistent;");
    let output = ember_cmd().arg(file.path()).output().expect("run ember");
    assert_eq!(output.status.code(), Some(70));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Undefined variable"));
    assert!(stderr.contains("<script>"));
}

#[test]
fn missing_file_exits_74() {
    let output = ember_cmd()
        .arg("/no/such/path/does-not-exist.ember")
        .output()
        .expect("run ember");
    assert_eq!(output.status.code(), Some(74));
}

#[test]
fn malformed_invocation_exits_64() {
    let output = ember_cmd()
        .arg("one.ember")
        .arg("two.ember")
        .output()
        .expect("run ember");
    assert_eq!(output.status.code(), Some(64));
    assert!(!output.stderr.is_empty());
}

#[test]
fn custom_initializer_name_is_honored() {
    let file = script(
        r#"
        class Counter {
          setup(start) {
            this.count = start;
          }
        }
        var c = Counter(10);
        print c.count;
        "#,
    );
    let output = ember_cmd()
        .arg("--initializer-name")
        .arg("setup")
        .arg(file.path())
        .output()
        .expect("run ember");
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "10\n");
}
