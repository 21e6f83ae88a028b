//! Driver-loop scenarios: literal command scripts through `run_script`,
//! checking the exact bytes written to the output stream.

use std::io::Cursor;

use perchdb::{cli, BPlusTree};
use tempfile::tempdir;

fn run(script: &str) -> String {
    let dir = tempdir().unwrap();
    let mut tree = BPlusTree::open(dir.path().join("t")).unwrap();
    let mut output = Vec::new();
    cli::run_script(&mut tree, Cursor::new(script), &mut output).unwrap();
    String::from_utf8(output).unwrap()
}

#[test]
fn find_prints_values_ascending_and_null_for_missing() {
    let script = "5\n\
                  insert a 1\n\
                  insert a 2\n\
                  insert b 3\n\
                  find a\n\
                  find c\n";

    assert_eq!(run(script), "1 2\nnull\n");
}

#[test]
fn delete_unbinds_the_pair() {
    let script = "4\n\
                  insert x 10\n\
                  delete x 10\n\
                  find x\n\
                  find x\n";

    assert_eq!(run(script), "null\nnull\n");
}

#[test]
fn two_hundred_duplicates_print_in_one_ascending_line() {
    let mut script = String::from("201\n");
    for value in 0..200 {
        script.push_str(&format!("insert dup {}\n", value));
    }
    script.push_str("find dup\n");

    let expected = (0..200)
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ")
        + "\n";
    assert_eq!(run(&script), expected);
}

#[test]
fn duplicate_insert_and_missing_delete_are_silent() {
    let script = "6\n\
                  insert k 1\n\
                  insert k 1\n\
                  delete k 2\n\
                  find k\n\
                  delete k 1\n\
                  find k\n";

    assert_eq!(run(script), "1\nnull\n");
}

#[test]
fn script_state_survives_reopen_between_scripts() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("t");

    {
        let mut tree = BPlusTree::open(&prefix).unwrap();
        let mut output = Vec::new();
        cli::run_script(
            &mut tree,
            Cursor::new("2\ninsert alpha 7\ninsert beta 9\n"),
            &mut output,
        )
        .unwrap();
        assert!(output.is_empty());
        tree.close().unwrap();
    }

    let mut tree = BPlusTree::open(&prefix).unwrap();
    let mut output = Vec::new();
    cli::run_script(
        &mut tree,
        Cursor::new("2\nfind alpha\nfind gamma\n"),
        &mut output,
    )
    .unwrap();
    assert_eq!(String::from_utf8(output).unwrap(), "7\nnull\n");
}

#[test]
fn bad_command_count_is_an_error() {
    let dir = tempdir().unwrap();
    let mut tree = BPlusTree::open(dir.path().join("t")).unwrap();
    let mut output = Vec::new();

    let result = cli::run_script(&mut tree, Cursor::new("many\nfind a\n"), &mut output);
    assert!(result.is_err());
}

#[test]
fn truncated_script_is_an_error() {
    let dir = tempdir().unwrap();
    let mut tree = BPlusTree::open(dir.path().join("t")).unwrap();
    let mut output = Vec::new();

    let result = cli::run_script(&mut tree, Cursor::new("3\ninsert a 1\n"), &mut output);
    assert!(result.is_err());
    assert!(format!("{:?}", result.unwrap_err()).contains("input ended"));
}

#[test]
fn malformed_command_reports_its_position() {
    let dir = tempdir().unwrap();
    let mut tree = BPlusTree::open(dir.path().join("t")).unwrap();
    let mut output = Vec::new();

    let result = cli::run_script(
        &mut tree,
        Cursor::new("2\ninsert a 1\nupsert b 2\n"),
        &mut output,
    );
    assert!(result.is_err());
    assert!(format!("{:?}", result.unwrap_err()).contains("command 2 of 2"));
}
