//! Thin CLI layer: parse args, styled output, and call into provenant-core.
//! Crash-proof: panic caught and reported; all errors return Result.

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use colored::Colorize;
use provenant_core::blackboard::BlackboardSnapshot;
use provenant_core::hasher::{self, Digest};
use provenant_core::{CapsuleRef, EventType, MerkleTree, Vault};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

// ---- UI helpers (no-op when stdout isn't a TTY) ----

fn use_color() -> bool {
    std::io::stdout().is_terminal()
        && env::var("NO_COLOR").unwrap_or_default().is_empty()
}

fn success(msg: &str) {
    if use_color() {
        println!("{}", msg.green());
    } else {
        println!("{}", msg);
    }
}

fn error(msg: &str) {
    if use_color() {
        eprintln!("{}", msg.red());
    } else {
        eprintln!("{}", msg);
    }
}

fn warning(msg: &str) {
    if use_color() {
        eprintln!("{}", msg.yellow());
    } else {
        eprintln!("{}", msg);
    }
}

fn info(msg: &str) {
    if use_color() {
        println!("{}", msg.cyan());
    } else {
        println!("{}", msg);
    }
}

fn dim(msg: &str) {
    if use_color() {
        println!("{}", msg.dimmed());
    } else {
        println!("{}", msg);
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{}", text);
    Ok(())
}

fn parse_json_arg(raw: Option<&String>, what: &str) -> Result<Value, String> {
    match raw {
        Some(s) => serde_json::from_str(s).map_err(|e| format!("Invalid {} JSON: {}", what, e)),
        None => Ok(json!({})),
    }
}

fn short(digest: &str) -> &str {
    digest.get(..12).unwrap_or(digest)
}

/// Resolve config (rc file, env, --root) and open every store under the root.
fn open_vault(matches: &ArgMatches) -> Result<Vault, String> {
    let cwd = env::current_dir().map_err(|e| e.to_string())?;
    let mut config = provenant_core::load_config(&cwd).map_err(|e| e.to_string())?;
    if let Some(root) = matches.get_one::<String>("root") {
        config.root = PathBuf::from(root);
    }
    if config.quiet {
        env::set_var("PROVENANT_QUIET", "1");
    }
    provenant_core::init_logging(&config.root)
        .map_err(|e| format!("Failed to initialize logging: {}", e))?;
    Vault::open(config).map_err(|e| e.to_string())
}

/// `NAME=PATH`, or a bare path whose file name becomes the name.
fn parse_file_arg(raw: &str) -> Result<(String, PathBuf), String> {
    if let Some((name, path)) = raw.split_once('=') {
        return Ok((name.to_string(), PathBuf::from(path)));
    }
    let path = PathBuf::from(raw);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| format!("Cannot derive a file name from {:?}; use NAME=PATH", raw))?;
    Ok((name, path))
}

fn read_file(path: &Path) -> Result<Vec<u8>, String> {
    fs::read(path).map_err(|e| format!("Cannot read {}: {}", path.display(), e))
}

fn build_cli() -> Command {
    Command::new("provenant")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Bhuvan Prakash <bhuvanstark6@gmail.com>")
        .about("Tamper-evident provenance ledger with a content-addressed capsule store")
        .after_help(
            "Examples:\n  provenant store CAP-1 --primary report.pdf --file notes.txt\n  provenant verify CAP-1\n  provenant validate --record\n  provenant log --limit 20",
        )
        .arg(
            Arg::new("root")
                .long("root")
                .global(true)
                .help("Data directory (default: PROVENANT_HOME or ~/.provenant)"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Machine-readable JSON output"),
        )
        .subcommand(
            Command::new("append")
                .about("Append an event to the ledger")
                .arg(
                    Arg::new("event_type")
                        .required(true)
                        .help("capsule_created, archive_sealed, validation_run, capsule_failed, capsule_verified, blackboard_merged, custom_event"),
                )
                .arg(Arg::new("payload").long("payload").help("Event payload as JSON (default: {})")),
        )
        .subcommand(
            Command::new("store")
                .about("Store a capsule: CAS, archive, ledger entry, blackboard")
                .arg(Arg::new("capsule_id").required(true).help("Capsule identifier"))
                .arg(
                    Arg::new("primary")
                        .long("primary")
                        .required(true)
                        .help("Primary payload file"),
                )
                .arg(
                    Arg::new("file")
                        .long("file")
                        .action(ArgAction::Append)
                        .help("Associated file as NAME=PATH or PATH (repeatable)"),
                )
                .arg(Arg::new("metadata").long("metadata").help("Capsule metadata as JSON")),
        )
        .subcommand(
            Command::new("verify")
                .about("Verify a capsule by id or archive path (exit 1 when invalid)")
                .arg(Arg::new("target").required(true).help("Capsule id or archive path"))
                .arg(
                    Arg::new("record")
                        .long("record")
                        .action(ArgAction::SetTrue)
                        .help("Append a capsule_verified entry with the result"),
                ),
        )
        .subcommand(
            Command::new("proof")
                .about("Print a Merkle membership proof for one archive member")
                .arg(Arg::new("target").required(true).help("Capsule id or archive path"))
                .arg(
                    Arg::new("member")
                        .required(true)
                        .help("Member name, e.g. payload/primary or files/note.txt"),
                ),
        )
        .subcommand(
            Command::new("validate")
                .about("Recompute the ledger hash chain (exit 1 when broken)")
                .arg(
                    Arg::new("from")
                        .long("from")
                        .value_parser(value_parser!(u64))
                        .help("First sequence (default 0)"),
                )
                .arg(
                    Arg::new("to")
                        .long("to")
                        .value_parser(value_parser!(u64))
                        .help("Last sequence, inclusive (default: last entry)"),
                )
                .arg(
                    Arg::new("record")
                        .long("record")
                        .action(ArgAction::SetTrue)
                        .help("Append a validation_run entry with the result"),
                ),
        )
        .subcommand(
            Command::new("log")
                .about("Print ledger entries")
                .arg(
                    Arg::new("limit")
                        .long("limit")
                        .value_parser(value_parser!(usize))
                        .help("Only the last N entries"),
                ),
        )
        .subcommand(
            Command::new("cas")
                .about("Content-addressed store: put | get | verify")
                .subcommand(Command::new("put").about("Store a file").arg(Arg::new("path").required(true)))
                .subcommand(
                    Command::new("get")
                        .about("Read a blob by digest")
                        .arg(Arg::new("digest").required(true))
                        .arg(Arg::new("out").long("out").short('o').help("Write to file (default: stdout)")),
                )
                .subcommand(Command::new("verify").about("Re-hash every stored blob")),
        )
        .subcommand(
            Command::new("blackboard")
                .about("Replicated blackboard: show | merge | clear")
                .subcommand(Command::new("show").about("Print the local snapshot"))
                .subcommand(
                    Command::new("merge")
                        .about("Merge a remote snapshot file")
                        .arg(Arg::new("snapshot").required(true).help("Snapshot JSON file")),
                )
                .subcommand(
                    Command::new("clear")
                        .about("Clear a capsule's reinjection flag")
                        .arg(Arg::new("capsule_id").required(true)),
                ),
        )
        .subcommand(
            Command::new("archives")
                .about("Sealed archives: list | sweep")
                .subcommand(Command::new("list").about("List sealed archives"))
                .subcommand(Command::new("sweep").about("Remove orphaned staging files")),
        )
}

fn run() -> Result<(), String> {
    let matches = build_cli().get_matches();
    let json_out = matches.get_flag("json");

    match matches.subcommand() {
        Some(("append", sub)) => {
            let vault = open_vault(&matches)?;
            let event_type: EventType = sub
                .get_one::<String>("event_type")
                .map(|s| s.as_str())
                .unwrap_or_default()
                .parse()
                .map_err(|e: provenant_core::ProvenanceError| e.to_string())?;
            let payload = parse_json_arg(sub.get_one::<String>("payload"), "payload")?;
            let entry = vault.append_event(event_type, payload).map_err(|e| e.to_string())?;
            if json_out {
                print_json(&entry)?;
            } else {
                success(&format!(
                    "Appended #{} {} {}",
                    entry.sequence,
                    entry.event_type,
                    short(&entry.entry_hash.to_hex())
                ));
            }
        }
        Some(("store", sub)) => {
            let vault = open_vault(&matches)?;
            let capsule_id = sub.get_one::<String>("capsule_id").cloned().unwrap_or_default();
            let primary_path = sub.get_one::<String>("primary").cloned().unwrap_or_default();
            let primary = read_file(Path::new(&primary_path))?;
            let mut files = BTreeMap::new();
            if let Some(raw_files) = sub.get_many::<String>("file") {
                for raw in raw_files {
                    let (name, path) = parse_file_arg(raw)?;
                    if files.insert(name.clone(), read_file(&path)?).is_some() {
                        return Err(format!("File name {:?} given twice", name));
                    }
                }
            }
            let metadata = parse_json_arg(sub.get_one::<String>("metadata"), "metadata")?;
            let receipt = vault
                .store_capsule(&capsule_id, &primary, &files, metadata)
                .map_err(|e| format!("Store failed: {}", e))?;
            if json_out {
                print_json(&receipt)?;
            } else {
                success(&format!("Stored capsule {}", capsule_id));
                info(&format!("  archive:     {}", receipt.archive.archive_path.display()));
                info(&format!("  merkle root: {}", receipt.archive.manifest.merkle_root));
                dim(&format!("  ledger:      #{}", receipt.ledger_entry.sequence));
            }
            for w in &receipt.warnings {
                warning(&format!("Warning: {}", w));
            }
        }
        Some(("verify", sub)) => {
            let vault = open_vault(&matches)?;
            let target = sub.get_one::<String>("target").cloned().unwrap_or_default();
            let report = vault
                .verify_capsule(&CapsuleRef::parse(&target))
                .map_err(|e| format!("Verify failed: {}", e))?;
            if sub.get_flag("record") {
                vault
                    .append_event(
                        EventType::CapsuleVerified,
                        json!({
                            "capsule_id": report.capsule_id,
                            "archive_path": report.archive_path.display().to_string(),
                            "valid": report.valid,
                        }),
                    )
                    .map_err(|e| e.to_string())?;
            }
            if json_out {
                print_json(&report)?;
            } else {
                info(&format!("Capsule {} ({})", report.capsule_id, report.archive_path.display()));
                for f in &report.files {
                    let line = format!("  {} {}", if f.matches { "ok " } else { "BAD" }, f.name);
                    if f.matches {
                        dim(&line);
                    } else {
                        error(&line);
                    }
                }
                dim(&format!(
                    "  merkle root {}: {}",
                    report.merkle_root,
                    if report.merkle_root_matches { "matches" } else { "MISMATCH" }
                ));
                match report.ledger_root_matches {
                    Some(true) => dim("  ledger record: matches"),
                    Some(false) => error("  ledger record: root differs from manifest"),
                    None => warning("  ledger record: none"),
                }
            }
            if !report.valid {
                return Err(format!("Capsule {} failed verification.", report.capsule_id));
            }
            if !json_out {
                success("Capsule verified.");
            }
        }
        Some(("proof", sub)) => {
            let vault = open_vault(&matches)?;
            let target = sub.get_one::<String>("target").cloned().unwrap_or_default();
            let member = sub.get_one::<String>("member").cloned().unwrap_or_default();
            let report = vault
                .verify_capsule(&CapsuleRef::parse(&target))
                .map_err(|e| e.to_string())?;
            let leaves: Vec<(String, Digest)> =
                report.files.iter().map(|f| (f.name.clone(), f.expected)).collect();
            let tree = MerkleTree::build(leaves).map_err(|e| e.to_string())?;
            let index = tree
                .index_of(&member)
                .ok_or_else(|| format!("{} is not a member of {}", member, target))?;
            let proof = tree.proof(index).map_err(|e| e.to_string())?;
            let leaf = &tree.leaves()[index];
            let holds = proof.verify(&leaf.name, &leaf.digest, &report.merkle_root);
            if json_out {
                print_json(&json!({
                    "member": leaf.name,
                    "digest": leaf.digest,
                    "merkle_root": report.merkle_root,
                    "proof": proof,
                    "verified": holds,
                }))?;
            } else {
                info(&format!("{} {}", leaf.name, leaf.digest));
                for step in &proof.steps {
                    dim(&format!("  level {} {:?} {}", step.level, step.side, step.hash));
                }
                dim(&format!("  root {}", report.merkle_root));
            }
            if !holds {
                return Err("Proof does not reproduce the manifest root.".to_string());
            }
        }
        Some(("validate", sub)) => {
            let vault = open_vault(&matches)?;
            let from = sub.get_one::<u64>("from").copied().unwrap_or(0);
            let to = sub.get_one::<u64>("to").copied().unwrap_or(u64::MAX);
            let result = vault.validate_ledger(from..=to).map_err(|e| e.to_string())?;
            if sub.get_flag("record") {
                vault
                    .append_event(
                        EventType::ValidationRun,
                        json!({
                            "from": from,
                            "to": result.checked.last().copied().unwrap_or(from),
                            "valid": result.valid,
                            "checked": result.checked.len(),
                            "first_mismatch": result.first_mismatch,
                        }),
                    )
                    .map_err(|e| e.to_string())?;
            }
            if json_out {
                print_json(&result)?;
            } else if result.valid {
                success(&format!("Ledger chain valid ({} entries checked).", result.checked.len()));
            }
            if let Some(m) = &result.first_mismatch {
                if !json_out {
                    error(&format!("Mismatch at #{} ({:?})", m.index, m.kind));
                    dim(&format!("  expected: {}", m.expected));
                    dim(&format!("  actual:   {}", m.actual));
                }
                return Err(format!("Ledger chain is broken at #{}.", m.index));
            }
        }
        Some(("log", sub)) => {
            let vault = open_vault(&matches)?;
            let entries = vault.ledger().entries().map_err(|e| e.to_string())?;
            let skip = match sub.get_one::<usize>("limit") {
                Some(limit) => entries.len().saturating_sub(*limit),
                None => 0,
            };
            let shown = &entries[skip..];
            if json_out {
                print_json(&shown)?;
            } else if shown.is_empty() {
                dim("Ledger is empty.");
            } else {
                for e in shown {
                    println!(
                        "#{:<5} {} {:<18} {} {}",
                        e.sequence,
                        e.timestamp,
                        e.event_type.as_str(),
                        short(&e.entry_hash.to_hex()),
                        e.payload
                    );
                }
            }
        }
        Some(("cas", sub)) => {
            let vault = open_vault(&matches)?;
            match sub.subcommand() {
                Some(("put", m)) => {
                    let path = PathBuf::from(m.get_one::<String>("path").cloned().unwrap_or_default());
                    let file = fs::File::open(&path).map_err(|e| format!("Cannot read {}: {}", path.display(), e))?;
                    let expected = hasher::digest_reader(file).map_err(|e| e.to_string())?;
                    let existed = vault.cas().contains(&expected);
                    let digest = vault.cas().put(&read_file(&path)?).map_err(|e| e.to_string())?;
                    if json_out {
                        print_json(&json!({"digest": digest, "deduplicated": existed}))?;
                    } else if existed {
                        dim(&format!("{} (already stored)", digest));
                    } else {
                        success(&digest.to_hex());
                    }
                }
                Some(("get", m)) => {
                    let raw = m.get_one::<String>("digest").cloned().unwrap_or_default();
                    let digest: Digest = raw.parse().map_err(|e: provenant_core::ProvenanceError| e.to_string())?;
                    let bytes = vault.cas().get(&digest).map_err(|e| e.to_string())?;
                    match m.get_one::<String>("out") {
                        Some(out) => {
                            fs::write(out, &bytes).map_err(|e| format!("Write failed: {}", e))?;
                            success(&format!("Wrote {} bytes to {}.", bytes.len(), out));
                        }
                        None => {
                            use std::io::Write;
                            std::io::stdout().write_all(&bytes).map_err(|e| e.to_string())?;
                        }
                    }
                }
                Some(("verify", _)) => {
                    let total = vault.cas().list().map_err(|e| e.to_string())?.len();
                    let corrupt = vault.cas().verify_all().map_err(|e| e.to_string())?;
                    if json_out {
                        print_json(&json!({"blobs": total, "corrupt": corrupt}))?;
                    } else {
                        for d in &corrupt {
                            error(&format!("  corrupt: {}", d));
                        }
                    }
                    if !corrupt.is_empty() {
                        return Err(format!("{} of {} blobs failed verification.", corrupt.len(), total));
                    }
                    if !json_out {
                        success(&format!("All {} blobs verified.", total));
                    }
                }
                _ => dim("Usage: provenant cas put|get|verify"),
            }
        }
        Some(("blackboard", sub)) => {
            let vault = open_vault(&matches)?;
            match sub.subcommand() {
                Some(("merge", m)) => {
                    let path = PathBuf::from(m.get_one::<String>("snapshot").cloned().unwrap_or_default());
                    let text = fs::read_to_string(&path)
                        .map_err(|e| format!("Cannot read {}: {}", path.display(), e))?;
                    let remote: BlackboardSnapshot =
                        serde_json::from_str(&text).map_err(|e| format!("Invalid snapshot: {}", e))?;
                    let merged = vault.merge_blackboard(&remote).map_err(|e| e.to_string())?;
                    if json_out {
                        print_json(&merged)?;
                    } else {
                        success(&format!("Merged {} remote keys ({} keys total).", remote.len(), merged.len()));
                    }
                }
                Some(("clear", m)) => {
                    let capsule_id = m.get_one::<String>("capsule_id").cloned().unwrap_or_default();
                    let removed = vault.clear_reinjection(&capsule_id).map_err(|e| e.to_string())?;
                    if json_out {
                        print_json(&json!({"capsule_id": capsule_id, "removed": removed}))?;
                    } else if removed == 0 {
                        dim(&format!("No pending reinjection for {}.", capsule_id));
                    } else {
                        success(&format!("Cleared reinjection flag for {}.", capsule_id));
                    }
                }
                _ => {
                    let snapshot = vault.blackboard_snapshot();
                    if json_out {
                        print_json(&snapshot)?;
                    } else if snapshot.is_empty() {
                        dim("Blackboard is empty.");
                    } else {
                        for (key, entry) in &snapshot.entries {
                            info(key);
                            if let Some(reg) = &entry.register {
                                dim(&format!(
                                    "  value @{}/{}: {}",
                                    reg.stamp.logical_time, reg.stamp.writer, reg.value
                                ));
                            }
                            let present = entry.presence.elements();
                            if !present.is_empty() {
                                dim(&format!(
                                    "  present: {}",
                                    present.into_iter().collect::<Vec<_>>().join(", ")
                                ));
                            }
                        }
                    }
                }
            }
        }
        Some(("archives", sub)) => {
            let vault = open_vault(&matches)?;
            match sub.subcommand() {
                Some(("sweep", _)) => {
                    let removed = vault.archiver().sweep_staging().map_err(|e| e.to_string())?;
                    if json_out {
                        print_json(&json!({"removed": removed}))?;
                    } else {
                        success(&format!("Removed {} orphaned staging files.", removed));
                    }
                }
                _ => {
                    let list = vault.archiver().list_archives().map_err(|e| e.to_string())?;
                    if json_out {
                        print_json(&list)?;
                    } else if list.is_empty() {
                        dim("No sealed archives.");
                    } else {
                        info(&format!("Sealed archives ({})", list.len()));
                        for path in list {
                            println!("  {}", path.display());
                        }
                    }
                }
            }
        }
        _ => {
            if use_color() {
                println!("{}", "provenant".bright_cyan().bold());
                dim("Tamper-evident provenance ledger with a content-addressed capsule store.");
            } else {
                println!("provenant - Tamper-evident provenance ledger with a content-addressed capsule store");
            }
            dim("\nRun `provenant --help` for details.");
        }
    }

    Ok(())
}

fn main() {
    if !use_color() {
        colored::control::set_override(false);
    }

    let code = match std::panic::catch_unwind(run) {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            error(&e);
            1
        }
        Err(_) => {
            error("An unexpected error occurred. Please report this issue.");
            1
        }
    };
    std::process::exit(code);
}
