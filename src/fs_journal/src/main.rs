use log::error;
use std::env;
use std::path::PathBuf;

use fs_journal::{inspect_journal_root, JournalServiceConfig, DEFAULT_JOURNAL_CONFIG_PATH};

fn usage() -> String {
    format!(
        "usage: fs_journal_inspect [<journal_root>] [--config <path>]\n\
         prints every journal under the root as JSON.\n\
         without <journal_root>, the root is read from the config.\n\
         defaults:\n\
         --config {}",
        DEFAULT_JOURNAL_CONFIG_PATH
    )
}

fn parse_args() -> Result<PathBuf, String> {
    let args = env::args().skip(1).collect::<Vec<String>>();
    if args.first().map(|a| a == "-h" || a == "--help") == Some(true) {
        return Err(usage());
    }

    let mut journal_root = None;
    let mut config_path = PathBuf::from(DEFAULT_JOURNAL_CONFIG_PATH);
    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --config".to_string())?;
                config_path = PathBuf::from(value);
            }
            other if !other.starts_with("--") && journal_root.is_none() => {
                journal_root = Some(PathBuf::from(other));
            }
            other => {
                return Err(format!("unknown argument: {}\n{}", other, usage()));
            }
        }
        i += 1;
    }

    match journal_root {
        Some(root) => Ok(root),
        None => JournalServiceConfig::load(&config_path)
            .map(|config| config.journal_root)
            .map_err(|e| format!("{}\n{}", e, usage())),
    }
}

fn main() {
    env_logger::init();
    let journal_root = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            error!("create tokio runtime failed: {}", err);
            std::process::exit(1);
        }
    };

    let report = match rt.block_on(inspect_journal_root(&journal_root)) {
        Ok(report) => report,
        Err(err) => {
            error!("inspect {} failed: {}", journal_root.display(), err);
            std::process::exit(1);
        }
    };
    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{}", json),
        Err(err) => {
            error!("encode report failed: {}", err);
            std::process::exit(1);
        }
    }
}
