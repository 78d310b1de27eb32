// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Interactive CLI for a range server (spec §6.6).

use clap::{Parser, Subcommand};
use rangestore::config::Context;
use rangestore::range::{RangeSpec, END_ROW_SENTINEL};
use rangestore::scanner::ScanSpec;
use rangestore::schema::{AccessGroupSpec, ColumnFamily, Schema, TableIdentifier};
use rangestore::server::RangeServer;
use std::io::{self, BufRead, Write as IoWrite};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "rangeserver-cli")]
#[command(about = "Interactive range-server tool")]
struct Args {
    /// Data directory for the commit log and meta-log.
    data_dir: PathBuf,

    /// A single command to run non-interactively; omit to enter the REPL.
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Prints status code and message.
    Status,
    /// `load range <table> [<start>..<end>]`
    LoadRange { table: String, range: Option<String> },
    /// Loads `.tsv` test data into a table.
    Update { file: PathBuf, table: String },
    /// `drop range <table>[<s>..<e>]`
    DropRange { table: String, range: Option<String> },
    /// `compact [table[<s>..<e>]] [minor|major|merging|move]`
    Compact { table: Option<String>, kind: Option<String> },
    /// Forces an fsync of the commit log.
    CommitLogSync { table: String },
    /// Dumps a heap profile to a path, or logs it.
    Heapcheck { path: Option<PathBuf> },
    /// Exits the REPL; no-op as a one-shot command.
    Shutdown,
}

fn parse_range(spec: Option<&str>) -> RangeSpec {
    let Some(spec) = spec else {
        return RangeSpec::new(None, END_ROW_SENTINEL.to_vec());
    };
    match spec.split_once("..") {
        Some(("", end)) => RangeSpec::new(None, end.as_bytes().to_vec()),
        Some((start, end)) => RangeSpec::new(Some(start.as_bytes().to_vec()), end.as_bytes().to_vec()),
        None => RangeSpec::new(None, spec.as_bytes().to_vec()),
    }
}

fn default_schema() -> Schema {
    let mut schema = Schema::new();
    schema.add_access_group(AccessGroupSpec {
        name: "default".into(),
        column_family_ids: vec![],
        in_memory: false,
        blocksize: 0,
    });
    schema.add_column_family(ColumnFamily::new(0, "default", "default")).expect("default access group just created");
    schema
}

fn run_command(server: &RangeServer, data_dir: &std::path::Path, command: &Command) -> u8 {
    match command {
        Command::Status => {
            let status = server.status();
            println!("{:?}: {}", status.code, status.message);
            0
        }
        Command::LoadRange { table, range } => {
            let table_id = TableIdentifier::new(table.clone(), 0);
            let spec = parse_range(range.as_deref());
            let schema = default_schema();
            match server.load_range(&table_id, &spec, &schema, data_dir, None, rangestore::range::RangeState::Steady, false) {
                Ok(()) => {
                    let codes = server.acknowledge_load(&[(table_id, spec)]);
                    if codes.iter().all(|c| *c == rangestore::ErrorCode::Ok) {
                        0
                    } else {
                        eprintln!("acknowledge_load failed: {codes:?}");
                        2
                    }
                }
                Err(err) => {
                    eprintln!("load_range failed: {err}");
                    2
                }
            }
        }
        Command::Update { file, table } => {
            let Ok(contents) = std::fs::read_to_string(file) else {
                eprintln!("cannot read {}", file.display());
                return 2;
            };
            let table_id = TableIdentifier::new(table.clone(), 0);
            let mutations = contents
                .lines()
                .filter_map(|line| {
                    let mut cols = line.split('\t');
                    let row = cols.next()?;
                    let qualifier = cols.next()?;
                    let value = cols.next().unwrap_or("");
                    Some(rangestore::pipeline::Mutation {
                        row: row.as_bytes().to_vec(),
                        column_family_id: 0,
                        qualifier: qualifier.as_bytes().to_vec(),
                        timestamp: rangestore::AUTO_ASSIGN,
                        revision: rangestore::AUTO_ASSIGN,
                        flag: rangestore::CellFlag::Insert,
                        value: value.as_bytes().to_vec(),
                    })
                })
                .collect();
            let batch = rangestore::pipeline::UpdateBatch {
                table: table_id,
                cluster_id: 0,
                mutations,
                sync: true,
                ignore_unknown_cfs: false,
            };
            match server.update(batch) {
                Ok(outcome) if outcome.rejected.is_empty() => 0,
                Ok(outcome) => {
                    eprintln!("{} mutation(s) rejected", outcome.rejected.len());
                    2
                }
                Err(err) => {
                    eprintln!("update failed: {err}");
                    2
                }
            }
        }
        Command::DropRange { table, range } => {
            let table_id = TableIdentifier::new(table.clone(), 0);
            let spec = parse_range(range.as_deref());
            match server.drop_range(&table_id, &spec) {
                Ok(()) => 0,
                Err(err) => {
                    eprintln!("drop_range failed: {err}");
                    2
                }
            }
        }
        Command::Compact { table, kind } => {
            let flags = match kind.as_deref() {
                Some("minor") => rangestore::server::compact_flags::MINOR,
                Some("major") => rangestore::server::compact_flags::MAJOR,
                Some("merging") => rangestore::server::compact_flags::MERGING,
                Some("move") => rangestore::server::compact_flags::MOVE,
                _ => rangestore::server::compact_flags::MINOR,
            };
            match server.compact(table.as_deref(), None, flags) {
                Ok(()) => 0,
                Err(err) => {
                    eprintln!("compact failed: {err}");
                    2
                }
            }
        }
        Command::CommitLogSync { table } => {
            let table_id = TableIdentifier::new(table.clone(), 0);
            match server.commit_log_sync(&table_id) {
                Ok(()) => 0,
                Err(err) => {
                    eprintln!("commit_log_sync failed: {err}");
                    2
                }
            }
        }
        Command::Heapcheck { path } => match server.heapcheck(path.as_deref()) {
            Ok(()) => 0,
            Err(err) => {
                eprintln!("heapcheck failed: {err}");
                2
            }
        },
        Command::Shutdown => 0,
    }
}

fn parse_line(line: &str) -> Option<Command> {
    let args = shlex::split(line)?;
    if args.is_empty() {
        return None;
    }
    let mut full = vec!["rangeserver-cli".to_string(), "_".to_string()];
    full.extend(args);
    Command::try_parse_from(full).ok()
}

fn main() -> ExitCode {
    let args = Args::parse();
    std::fs::create_dir_all(&args.data_dir).expect("create data dir");
    let server = RangeServer::start(Arc::new(Context::new()), &args.data_dir).expect("start range server");

    if let Some(command) = &args.command {
        let code = run_command(&server, &args.data_dir, command);
        return if code == 0 { ExitCode::SUCCESS } else { ExitCode::from(code) };
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!("rangeserver> ");
        let _ = stdout.flush();
        let mut line = String::new();
        if stdin.lock().read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "shutdown" || line == "quit" || line == "exit" {
            break;
        }
        match parse_line(line) {
            Some(command) => {
                run_command(&server, &args.data_dir, &command);
            }
            None => eprintln!("unrecognized command: {line}"),
        }
    }
    ExitCode::SUCCESS
}
