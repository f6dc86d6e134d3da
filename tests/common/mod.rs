use std::{
    path::{Path, PathBuf},
    process::{Command, Output},
};

/// A dump event as printed by the helper binary
#[derive(Debug, PartialEq, Eq)]
pub struct Event {
    pub kind: String,
    pub path: PathBuf,
    pub succeeded: bool,
}

/// Runs the helper binary, which attaches a handler to `dir` and performs
/// `action`
pub fn run_child(dir: &Path, action: &str) -> Output {
    let bin: &'static str = std::env!("CARGO_BIN_EXE_test");
    Command::new(bin)
        .arg(dir)
        .arg(action)
        .output()
        .expect("failed to run the helper binary")
}

/// Parses the event lines the helper's callback wrote to stdout
pub fn events(output: &Output) -> Vec<Event> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| {
            let (kind, rest) = line.split_once(' ')?;
            let (path, succeeded) = rest.rsplit_once(' ')?;
            Some(Event {
                kind: kind.to_owned(),
                path: PathBuf::from(path),
                succeeded: succeeded == "true",
            })
        })
        .collect()
}

/// Every file in `dir`, sorted
pub fn files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .expect("failed to read the dump directory")
        .map(|e| e.expect("failed to read a directory entry").path())
        .collect();
    files.sort();
    files
}

/// True if `path` is named `YYYYMMDDHHMMSS`, optionally with a `-N` suffix
pub fn is_artifact_name(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let (stamp, suffix) = name.split_once('-').unwrap_or((name, "1"));
    stamp.len() == 14
        && stamp.bytes().all(|b| b.is_ascii_digit())
        && suffix.parse::<u32>().is_ok()
}
