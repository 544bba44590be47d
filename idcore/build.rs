// Refuse lint-suppression attributes ("#[" + "allow" + ...) in idcore sources.
// Runs on every build so a suppression cannot slip in unnoticed.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

fn main() {
    println!("cargo:rerun-if-changed=src");
    println!("cargo:rerun-if-changed=tests");
    println!("cargo:rerun-if-env-changed=CHECK_NO_ALLOW");

    // CHECK_NO_ALLOW=0 disables the check.
    if env::var("CHECK_NO_ALLOW").is_ok_and(|value| value == "0") {
        return;
    }

    let Ok(manifest_dir) = env::var("CARGO_MANIFEST_DIR").map(PathBuf::from) else {
        return;
    };

    let mut violations = Vec::new();
    for relative in ["src", "tests"] {
        let path = manifest_dir.join(relative);
        if path.exists() {
            scan_path(&path, &mut violations);
        }
    }

    if violations.is_empty() {
        return;
    }

    eprintln!("ERROR: lint suppression attributes found in idcore:");
    for (file, line, content) in &violations {
        eprintln!("  {}:{}: {}", file.display(), line, content.trim());
    }
    panic!("lint suppression attributes are forbidden");
}

fn scan_path(path: &Path, violations: &mut Vec<(PathBuf, usize, String)>) {
    if path.is_dir() {
        let Ok(entries) = fs::read_dir(path) else {
            return;
        };
        for entry in entries.flatten() {
            scan_path(&entry.path(), violations);
        }
        return;
    }

    if path.extension().map_or(true, |ext| ext != "rs") {
        return;
    }

    if let Ok(content) = fs::read_to_string(path) {
        for (index, line) in content.lines().enumerate() {
            if line.contains("#[allow") || line.contains("#![allow") {
                violations.push((path.to_path_buf(), index + 1, line.to_string()));
            }
        }
    }
}
