//! # Command Parsing and the Driver Loop
//!
//! Parses the line-oriented command protocol and drives a tree with it.
//! The protocol is a batch script, not an interactive session: the first
//! line carries a command count, then that many commands follow, one per
//! line, whitespace-separated.
//!
//! ## Protocol
//!
//! ```text
//! insert <key> <value>     insert the pair if absent
//! delete <key> <value>     erase the pair if present
//! find <key>               print bound values, ascending, space-separated
//! ```
//!
//! `find` prints the literal `null` when the key binds nothing. Keys are
//! raw tokens up to `KEY_BYTES` bytes, zero-padded to full width — which
//! preserves lexicographic order for fixed-width inputs like zero-padded
//! decimals. Values are signed 32-bit integers.
//!
//! Parsing is strict: unknown commands, missing or trailing tokens,
//! overlong keys, and non-numeric values are all reported with the
//! offending token rather than skipped.

use std::io::{BufRead, Write};

use eyre::{bail, eyre, Result, WrapErr};

use crate::btree::{BPlusTree, Key, Value};

/// One parsed command of the driver protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Insert { key: Key, value: Value },
    Delete { key: Key, value: Value },
    Find { key: Key },
}

impl Command {
    pub fn parse(line: &str) -> Result<Command> {
        let mut tokens = line.split_whitespace();
        let op = tokens.next().ok_or_else(|| eyre!("empty command"))?;

        let command = match op {
            "insert" => Command::Insert {
                key: parse_key(&mut tokens)?,
                value: parse_value(&mut tokens)?,
            },
            "delete" => Command::Delete {
                key: parse_key(&mut tokens)?,
                value: parse_value(&mut tokens)?,
            },
            "find" => Command::Find {
                key: parse_key(&mut tokens)?,
            },
            other => bail!("unknown command '{}'", other),
        };

        if let Some(extra) = tokens.next() {
            bail!("trailing token '{}' after {} command", extra, op);
        }
        Ok(command)
    }
}

fn parse_key<'a>(tokens: &mut impl Iterator<Item = &'a str>) -> Result<Key> {
    let token = tokens.next().ok_or_else(|| eyre!("missing key"))?;
    Key::from_bytes(token.as_bytes()).wrap_err_with(|| format!("bad key '{}'", token))
}

fn parse_value<'a>(tokens: &mut impl Iterator<Item = &'a str>) -> Result<Value> {
    let token = tokens.next().ok_or_else(|| eyre!("missing value"))?;
    token
        .parse::<Value>()
        .wrap_err_with(|| format!("bad value '{}'", token))
}

/// Runs a full command script against `tree`: a count line, then that
/// many commands. `find` output goes to `output`, one line per command.
pub fn run_script<R, W>(tree: &mut BPlusTree, input: R, output: &mut W) -> Result<()>
where
    R: BufRead,
    W: Write,
{
    let mut lines = input.lines();

    let count_line = lines
        .next()
        .ok_or_else(|| eyre!("missing command count"))?
        .wrap_err("failed to read command count")?;
    let count: usize = count_line
        .trim()
        .parse()
        .wrap_err_with(|| format!("bad command count '{}'", count_line.trim()))?;

    for n in 0..count {
        let line = lines
            .next()
            .ok_or_else(|| eyre!("input ended after {} of {} commands", n, count))?
            .wrap_err("failed to read command")?;
        let command =
            Command::parse(&line).wrap_err_with(|| format!("command {} of {}", n + 1, count))?;
        execute(tree, command, output)?;
    }
    Ok(())
}

/// Executes one command, writing any `find` result line to `output`.
pub fn execute<W: Write>(tree: &mut BPlusTree, command: Command, output: &mut W) -> Result<()> {
    match command {
        Command::Insert { key, value } => tree.insert(&key, value),
        Command::Delete { key, value } => tree.erase(&key, value),
        Command::Find { key } => {
            let values = tree.find(&key)?;
            if values.is_empty() {
                writeln!(output, "null")?;
            } else {
                let joined = values
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(" ");
                writeln!(output, "{}", joined)?;
            }
            Ok(())
        }
    }
}
