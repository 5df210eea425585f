// Note to developers extending/debugging this file: When this file throws
// errors or warnings, `cargo -vv build` does not show the output of the
// `println!`s of this file. Resolve all warnings first, trigger a re-build
// (e.g. `touch build.rs`), and run `cargo -vv build` again.

use std::process::Command;

fn main() {
    println!("cargo::rerun-if-changed=build.rs");

    let in_git_worktree = Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .output()
        .is_ok_and(|out| out.status.success());

    if !in_git_worktree {
        print_version(concat!(env!("CARGO_PKG_VERSION"), " at ", "no-git"));
        return;
    }

    // Re-run on commits and branch switches.
    println!("cargo::rerun-if-changed=.git/HEAD");

    let mut git_hash = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .map(|out| {
            String::from_utf8_lossy(&out.stdout)
                .trim_end_matches('\n')
                .to_string()
        })
        .unwrap_or_else(|| "unknown".into());

    let is_dirty = !Command::new("git")
        .args(["diff-index", "--quiet", "HEAD"])
        .output()
        .is_ok_and(|out| out.status.success());
    if is_dirty {
        git_hash.push_str("-dirty");
    }

    print_version(&format!("{} at {git_hash}", env!("CARGO_PKG_VERSION")));
}

fn print_version(s: &str) {
    println!("cargo::rustc-env=GREYLAG_BUILD_VERSION={s}");
}
