//! Scripted stand-in for the `mysql` binary.
//!
//! Every invocation appends its arguments, one per line and an empty line after, to
//! `calls.log`. `SHOW SLAVE STATUS` invocations print the queued status readings in
//! order and repeat the last one once the queue is exhausted.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

const SCRIPT: &str = r#"#!/bin/sh
dir="$(dirname "$0")"
for arg in "$@"; do printf '%s\n' "$arg" >> "$dir/calls.log"; done
printf '\n' >> "$dir/calls.log"
case "$*" in
  *"SHOW SLAVE STATUS"*)
    n=$(cat "$dir/polls" 2>/dev/null || echo 0)
    echo $((n + 1)) > "$dir/polls"
    if [ -f "$dir/status.$n" ]; then cat "$dir/status.$n"; else cat "$dir/status.last"; fi
    ;;
esac
"#;

pub(crate) struct FakeMysql {
    dir: PathBuf,
}

impl FakeMysql {
    pub(crate) fn install(dir: &Path, statuses: &[&str]) -> Self {
        for (i, status) in statuses.iter().enumerate() {
            fs::write(dir.join(format!("status.{i}")), status).unwrap();
        }
        fs::write(dir.join("status.last"), statuses.last().copied().unwrap_or("")).unwrap();

        let bin = dir.join("mysql");
        fs::write(&bin, SCRIPT).unwrap();
        fs::set_permissions(&bin, fs::Permissions::from_mode(0o755)).unwrap();
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub(crate) fn bin(&self) -> PathBuf {
        self.dir.join("mysql")
    }

    /// Argument lists of every invocation so far.
    pub(crate) fn calls(&self) -> Vec<Vec<String>> {
        let log = fs::read_to_string(self.dir.join("calls.log")).unwrap_or_default();
        log.split("\n\n")
            .filter(|call| !call.is_empty())
            .map(|call| call.lines().map(str::to_string).collect())
            .collect()
    }
}
