//! Compile argument rewriting.
//!
//! Two passes touch the pass-through argument list of `arduwrap compile`:
//! the client prepares it ([`prepare_compile_args`]) and the daemon pins the
//! port ([`rewrite_port_args`]) so the tool always flashes the device the
//! monitor owns.

use std::path::Path;

const PORT_FLAGS: [&str; 2] = ["-p", "--port"];
const UPLOAD_FLAGS: [&str; 2] = ["--upload", "-u"];

/// Drop every caller-supplied port selection (`-p X`, `--port X`, `-p=X`,
/// `--port=X`) and prepend `-p <port>`.
pub fn rewrite_port_args(args: &[String], port: &str) -> Vec<String> {
    let mut rewritten = Vec::with_capacity(args.len() + 2);
    rewritten.push("-p".to_string());
    rewritten.push(port.to_string());

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if PORT_FLAGS.contains(&arg.as_str()) {
            // The value belongs to the flag we just dropped.
            iter.next();
            continue;
        }
        if arg.starts_with("-p=") || arg.starts_with("--port=") {
            continue;
        }
        rewritten.push(arg.clone());
    }
    rewritten
}

/// Client-side preparation: force `--upload` and make sketch paths absolute
/// against `cwd`, since the daemon runs in its own working directory.
///
/// A sketch path is any argument ending in `.ino`, or any non-flag argument
/// naming an existing directory.
pub fn prepare_compile_args(args: &[String], cwd: &Path) -> Vec<String> {
    let mut prepared: Vec<String> = args
        .iter()
        .map(|arg| {
            if is_sketch_path(arg, cwd) {
                absolutize(arg, cwd)
            } else {
                arg.clone()
            }
        })
        .collect();

    if !prepared.iter().any(|arg| UPLOAD_FLAGS.contains(&arg.as_str())) {
        prepared.push("--upload".to_string());
    }
    prepared
}

fn is_sketch_path(arg: &str, cwd: &Path) -> bool {
    if arg.ends_with(".ino") {
        return true;
    }
    !arg.starts_with('-') && cwd.join(arg).is_dir()
}

fn absolutize(arg: &str, cwd: &Path) -> String {
    let path = Path::new(arg);
    if path.is_absolute() {
        return arg.to_string();
    }
    cwd.join(path).to_string_lossy().into_owned()
}
