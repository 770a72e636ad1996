use std::io::Write;
use std::process::{Command, Output, Stdio};

use tempfile::NamedTempFile;

fn bytelox() -> Command {
    Command::new(env!("CARGO_BIN_EXE_bytelox"))
}

fn script(source: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("failed to create script");
    file.write_all(source.as_bytes()).expect("failed to write script");
    file
}

fn run_script(source: &str, extra_args: &[&str]) -> Output {
    let file = script(source);
    bytelox()
        .args(extra_args)
        .arg(file.path())
        .output()
        .expect("failed to run bytelox")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

#[test]
fn runs_a_script() {
    let out = run_script("var who = \"world\";\nprint \"hello, \" + who;\n", &[]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!("hello, world\n", stdout(&out));
}

#[test]
fn compile_error_exits_65() {
    let out = run_script("print 1 +;\n", &[]);
    assert_eq!(Some(65), out.status.code());
    assert_eq!("", stdout(&out));
    assert!(
        stderr(&out).contains("[line 1] Error at ';': Expect expression."),
        "stderr: {}",
        stderr(&out)
    );
}

#[test]
fn runtime_error_exits_70() {
    let out = run_script("print \"start\";\nprint undefined;\n", &[]);
    assert_eq!(Some(70), out.status.code());
    assert_eq!("start\n", stdout(&out));
    let err = stderr(&out);
    assert!(err.contains("Undefined variable 'undefined'."), "stderr: {err}");
    assert!(err.contains("[line 2] in script"), "stderr: {err}");
}

#[test]
fn missing_file_exits_74() {
    let out = bytelox()
        .arg("/definitely/not/a/real/script.lox")
        .output()
        .expect("failed to run bytelox");
    assert_eq!(Some(74), out.status.code());
}

#[test]
fn too_many_arguments_exits_64() {
    let out = bytelox()
        .args(["one.lox", "two.lox"])
        .output()
        .expect("failed to run bytelox");
    assert_eq!(Some(64), out.status.code());
}

#[test]
fn help_describes_every_argument() {
    let out = bytelox().arg("--help").output().expect("failed to run bytelox");
    assert!(out.status.success());
    let help = stdout(&out);
    assert!(help.contains("Starts a REPL when omitted"), "{help}");
    assert!(help.contains("Dump bytecode + constant pool instead of executing"), "{help}");
}

#[test]
fn dump_prints_bytecode_without_running() {
    let out = run_script("print 1;\n", &["--dump"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let listing = stdout(&out);
    assert!(listing.contains("OP_CONSTANT         0 '1'"), "{listing}");
    assert!(listing.contains("OP_PRINT"), "{listing}");
    assert!(listing.contains("OP_RETURN"), "{listing}");
    // Nothing was printed by the program itself.
    assert!(!listing.lines().any(|line| line == "1"), "{listing}");
}

#[test]
fn repl_keeps_state_between_lines() {
    let mut child = bytelox()
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to run bytelox");

    child
        .stdin
        .take()
        .expect("stdin is piped")
        .write_all(b"var x = 20;\nprint x +;\nprint x * 2 + 2;\n")
        .expect("failed to write to the REPL");

    let out = child.wait_with_output().expect("REPL did not exit");
    assert!(out.status.success());
    assert!(stdout(&out).contains("42\n"), "stdout: {}", stdout(&out));
    assert!(stderr(&out).contains("Expect expression."), "stderr: {}", stderr(&out));
}
